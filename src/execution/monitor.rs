//! Background maintenance scheduler.
//!
//! One named thread drives two periodic jobs: a memory check and routine
//! housekeeping. The thread holds only a weak reference to its target, so it
//! exits on its own once the target is gone.

use crossbeam::channel::{self, Sender};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// What a maintenance job did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceOutcome {
    Completed,
    /// The target was busy processing; the cycle was skipped.
    Skipped,
}

enum Job {
    Monitor,
    Housekeeping,
    Shutdown,
}

/// Something the scheduler maintains.
pub trait MaintenanceTarget: Send + Sync {
    /// Sample memory usage and react to pressure.
    fn check_memory(&self) -> MaintenanceOutcome;

    /// Routine cleanup.
    fn routine_housekeeping(&self) -> MaintenanceOutcome;
}

/// Handle to the maintenance thread. Dropping it stops and joins the thread.
pub struct MaintenanceScheduler {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    runs: Arc<AtomicU64>,
    skips: Arc<AtomicU64>,
}

impl MaintenanceScheduler {
    /// Spawn the maintenance thread.
    pub fn start(
        target: Weak<dyn MaintenanceTarget>,
        monitor_every: Duration,
        housekeeping_every: Duration,
    ) -> io::Result<Self> {
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(1);
        let runs = Arc::new(AtomicU64::new(0));
        let skips = Arc::new(AtomicU64::new(0));
        let (run_count, skip_count) = (Arc::clone(&runs), Arc::clone(&skips));

        let handle = thread::Builder::new()
            .name("scanpipe-maintenance".to_string())
            .spawn(move || {
                log::info!(
                    "maintenance scheduler started (monitor {:?}, housekeeping {:?})",
                    monitor_every,
                    housekeeping_every
                );
                let monitor = channel::tick(monitor_every);
                let housekeeping = channel::tick(housekeeping_every);

                loop {
                    let job = crossbeam::select! {
                        recv(shutdown_rx) -> _ => Job::Shutdown,
                        recv(monitor) -> _ => Job::Monitor,
                        recv(housekeeping) -> _ => Job::Housekeeping,
                    };
                    let Some(target) = target.upgrade() else {
                        break;
                    };
                    let outcome = match job {
                        Job::Shutdown => break,
                        Job::Monitor => target.check_memory(),
                        Job::Housekeeping => target.routine_housekeeping(),
                    };
                    match outcome {
                        MaintenanceOutcome::Completed => run_count.fetch_add(1, Ordering::Relaxed),
                        MaintenanceOutcome::Skipped => {
                            log::trace!("maintenance cycle skipped: processing in progress");
                            skip_count.fetch_add(1, Ordering::Relaxed)
                        }
                    };
                }
                log::info!("maintenance scheduler stopped");
            })?;

        Ok(Self {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
            runs,
            skips,
        })
    }

    /// Maintenance jobs that ran.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Maintenance jobs skipped because the target was busy.
    pub fn skips(&self) -> u64 {
        self.skips.load(Ordering::Relaxed)
    }

    /// Whether the thread is still running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread and wait for it.
    pub fn stop(&mut self) {
        // Disconnecting the channel wakes the select.
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("maintenance thread panicked");
            }
        }
    }
}

impl Drop for MaintenanceScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for MaintenanceScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceScheduler")
            .field("running", &self.is_running())
            .field("runs", &self.runs())
            .field("skips", &self.skips())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Instant;

    #[derive(Default)]
    struct Counter {
        checks: AtomicUsize,
        housekeeping: AtomicUsize,
        busy: AtomicBool,
    }

    impl MaintenanceTarget for Counter {
        fn check_memory(&self) -> MaintenanceOutcome {
            if self.busy.load(Ordering::Relaxed) {
                return MaintenanceOutcome::Skipped;
            }
            self.checks.fetch_add(1, Ordering::Relaxed);
            MaintenanceOutcome::Completed
        }

        fn routine_housekeeping(&self) -> MaintenanceOutcome {
            self.housekeeping.fetch_add(1, Ordering::Relaxed);
            MaintenanceOutcome::Completed
        }
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn start(target: &Arc<Counter>, monitor_ms: u64, housekeeping_ms: u64) -> MaintenanceScheduler {
        let weak: Weak<dyn MaintenanceTarget> = Arc::downgrade(target) as Weak<dyn MaintenanceTarget>;
        MaintenanceScheduler::start(
            weak,
            Duration::from_millis(monitor_ms),
            Duration::from_millis(housekeeping_ms),
        )
        .unwrap()
    }

    #[test]
    fn test_both_jobs_fire() {
        let target = Arc::new(Counter::default());
        let scheduler = start(&target, 5, 10);
        assert!(wait_until(|| target.checks.load(Ordering::Relaxed) >= 2
            && target.housekeeping.load(Ordering::Relaxed) >= 1));
        assert!(scheduler.is_running());
        assert!(scheduler.runs() >= 3);
    }

    #[test]
    fn test_busy_target_skips() {
        let target = Arc::new(Counter::default());
        target.busy.store(true, Ordering::Relaxed);
        let scheduler = start(&target, 5, 60_000);
        assert!(wait_until(|| scheduler.skips() >= 2));
        assert_eq!(target.checks.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_stop_joins_thread() {
        let target = Arc::new(Counter::default());
        let mut scheduler = start(&target, 5, 5);
        scheduler.stop();
        assert!(!scheduler.is_running());
        let checks = target.checks.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(target.checks.load(Ordering::Relaxed), checks);
    }

    #[test]
    fn test_exits_when_target_dropped() {
        let target = Arc::new(Counter::default());
        let scheduler = start(&target, 5, 60_000);
        drop(target);
        assert!(wait_until(|| !scheduler.is_running()));
    }
}
