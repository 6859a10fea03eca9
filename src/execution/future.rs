//! Futures for background pipeline runs.
//!
//! Work is handed to rayon and the result comes back over a oneshot channel.
//! Dropping a future does not stop the task: it runs to completion and its
//! result is discarded.

use crate::core::buffer::PixelBuffer;
use crate::core::error::{ProcessingError, ProcessingResult};
use futures::channel::oneshot;
use futures::future::{join_all, JoinAll};
use futures::FutureExt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A value being computed on a worker thread.
///
/// Resolves to [`ProcessingError::Worker`] if the task went away without
/// reporting a result.
pub struct TaskFuture<T> {
    receiver: oneshot::Receiver<ProcessingResult<T>>,
}

/// Future of one processed image.
pub type ProcessingFuture = TaskFuture<PixelBuffer>;

impl<T: Send + 'static> TaskFuture<T> {
    /// Run `task` on the global rayon pool.
    pub fn spawn<F>(task: F) -> Self
    where
        F: FnOnce() -> ProcessingResult<T> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        rayon::spawn(move || {
            // The receiver may already be gone; the result is dropped then.
            let _ = sender.send(task());
        });
        Self { receiver }
    }

    /// Run `task` on a specific rayon pool.
    pub fn spawn_in<F>(pool: &rayon::ThreadPool, task: F) -> Self
    where
        F: FnOnce() -> ProcessingResult<T> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        pool.spawn(move || {
            let _ = sender.send(task());
        });
        Self { receiver }
    }
}

impl<T> TaskFuture<T> {
    /// A future that is already complete.
    pub fn ready(value: ProcessingResult<T>) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(value);
        Self { receiver }
    }

    /// Block the current thread until the result is available.
    pub fn wait(self) -> ProcessingResult<T> {
        pollster::block_on(self)
    }
}

impl<T> Future for TaskFuture<T> {
    type Output = ProcessingResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.receiver.poll_unpin(cx).map(|received| {
            received.unwrap_or_else(|oneshot::Canceled| {
                Err(ProcessingError::Worker("task ended without a result".to_string()))
            })
        })
    }
}

/// A set of independent futures awaited together.
///
/// Items complete independently; the batch resolves to their outputs in
/// submission order once all of them have finished.
pub struct BatchFuture<T = PixelBuffer> {
    len: usize,
    inner: Pin<Box<JoinAll<TaskFuture<T>>>>,
}

impl<T> BatchFuture<T> {
    pub fn new(items: Vec<TaskFuture<T>>) -> Self {
        Self {
            len: items.len(),
            inner: Box::pin(join_all(items)),
        }
    }

    /// Number of items in the batch.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Block until every item has finished.
    pub fn wait(self) -> Vec<ProcessingResult<T>> {
        pollster::block_on(self)
    }
}

impl<T> Future for BatchFuture<T> {
    type Output = Vec<ProcessingResult<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}
