//! Progress reporting for pipeline runs, tiled runs and batches.

use crate::core::error::NodeId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A progress update event.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    /// A run has started.
    Started {
        total_units: usize,
    },
    /// A pipeline stage has started.
    StageStarted {
        node_id: NodeId,
        node_name: &'static str,
        index: usize,
        total: usize,
    },
    /// A pipeline stage has completed.
    StageCompleted {
        node_id: NodeId,
        duration_ms: u64,
        index: usize,
        total: usize,
    },
    /// A stage was skipped.
    StageSkipped {
        node_id: NodeId,
        reason: SkipReason,
    },
    /// The image was split into tiles.
    TilesPlanned {
        count: usize,
    },
    /// One tile went through the pipeline.
    TileCompleted {
        index: usize,
        completed: usize,
        total: usize,
    },
    /// Overall progress percentage.
    Progress {
        percent: f32,
        elapsed_ms: u64,
        estimated_remaining_ms: Option<u64>,
    },
    /// The run has completed.
    Completed {
        total_duration_ms: u64,
        units_processed: usize,
        units_skipped: usize,
    },
    /// The run failed.
    Error {
        node_id: Option<NodeId>,
        message: String,
    },
}

/// Reason why a stage was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Stage is disabled.
    Disabled,
    /// The whole result came from the cache.
    Cached,
}

/// Callback type for progress updates. Shared so pipeline clones and
/// background tasks can report through the same sink.
pub type ProgressCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Counts completed units (stages or tiles) of one run and forwards events.
pub struct ProgressTracker {
    total_units: usize,
    completed_units: AtomicU64,
    skipped_units: AtomicU64,
    start_time: Instant,
    callback: Option<ProgressCallback>,
    unit_times: parking_lot::Mutex<Vec<u64>>,
}

impl ProgressTracker {
    /// Create a tracker; the clock starts now.
    pub fn new(total_units: usize) -> Self {
        Self {
            total_units,
            completed_units: AtomicU64::new(0),
            skipped_units: AtomicU64::new(0),
            start_time: Instant::now(),
            callback: None,
            unit_times: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Set a callback for progress updates.
    pub fn with_callback(mut self, callback: Option<ProgressCallback>) -> Self {
        self.callback = callback;
        self
    }

    /// Announce the run.
    pub fn start(&self) {
        self.send_update(ProgressUpdate::Started {
            total_units: self.total_units,
        });
    }

    /// Report that a stage has started.
    pub fn stage_started(&self, node_id: NodeId, node_name: &'static str, index: usize) {
        self.send_update(ProgressUpdate::StageStarted {
            node_id,
            node_name,
            index,
            total: self.total_units,
        });
    }

    /// Report that a stage has completed.
    pub fn stage_completed(&self, node_id: NodeId, index: usize, duration_ms: u64) {
        self.completed_units.fetch_add(1, Ordering::Relaxed);
        self.unit_times.lock().push(duration_ms);
        self.send_update(ProgressUpdate::StageCompleted {
            node_id,
            duration_ms,
            index,
            total: self.total_units,
        });
        self.send_progress_update();
    }

    /// Report that a stage was skipped.
    pub fn stage_skipped(&self, node_id: NodeId, reason: SkipReason) {
        self.skipped_units.fetch_add(1, Ordering::Relaxed);
        self.send_update(ProgressUpdate::StageSkipped { node_id, reason });
    }

    /// Report the tile plan of a tiled run.
    pub fn tiles_planned(&self, count: usize) {
        self.send_update(ProgressUpdate::TilesPlanned { count });
    }

    /// Report that a tile has finished. Safe to call from worker threads.
    pub fn tile_completed(&self, index: usize, duration_ms: u64) {
        let completed = self.completed_units.fetch_add(1, Ordering::Relaxed) as usize + 1;
        self.unit_times.lock().push(duration_ms);
        self.send_update(ProgressUpdate::TileCompleted {
            index,
            completed,
            total: self.total_units,
        });
        self.send_progress_update();
    }

    /// Report an error.
    pub fn report_error(&self, node_id: Option<NodeId>, message: String) {
        self.send_update(ProgressUpdate::Error { node_id, message });
    }

    /// Announce completion.
    pub fn complete(&self) {
        self.send_update(ProgressUpdate::Completed {
            total_duration_ms: self.elapsed_ms(),
            units_processed: self.completed_units.load(Ordering::Relaxed) as usize,
            units_skipped: self.skipped_units.load(Ordering::Relaxed) as usize,
        });
    }

    /// Get current progress percentage.
    pub fn progress_percent(&self) -> f32 {
        if self.total_units == 0 {
            return 100.0;
        }
        let completed = self.completed_units.load(Ordering::Relaxed);
        let skipped = self.skipped_units.load(Ordering::Relaxed);
        ((completed + skipped) as f32 / self.total_units as f32) * 100.0
    }

    /// Estimate remaining time in milliseconds from the average unit time.
    pub fn estimated_remaining_ms(&self) -> Option<u64> {
        let times = self.unit_times.lock();
        if times.is_empty() {
            return None;
        }
        let avg_time: u64 = times.iter().sum::<u64>() / times.len() as u64;
        let done = (self.completed_units.load(Ordering::Relaxed)
            + self.skipped_units.load(Ordering::Relaxed)) as usize;
        let remaining = self.total_units.saturating_sub(done);
        Some(avg_time * remaining as u64)
    }

    fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    fn send_update(&self, update: ProgressUpdate) {
        if let Some(ref callback) = self.callback {
            callback(update);
        }
    }

    fn send_progress_update(&self) {
        if self.callback.is_none() {
            return;
        }
        self.send_update(ProgressUpdate::Progress {
            percent: self.progress_percent(),
            elapsed_ms: self.elapsed_ms(),
            estimated_remaining_ms: self.estimated_remaining_ms(),
        });
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(0)
    }
}
