use std::collections::VecDeque;

use tokio::task::JoinHandle;

use crate::link::Frame;

/// Frames waiting for the data channel to accept them again.
///
/// While `buffering` is set every new frame queues behind the backlog, so
/// frames leave in the order `send` was called.
#[derive(Default)]
pub struct SendBuffer {
    queue: VecDeque<Frame>,
    buffering: bool,
    retry: Option<JoinHandle<()>>,
}

impl SendBuffer {
    /// True when a fresh frame must queue instead of going out directly.
    pub fn must_queue(&self) -> bool {
        self.buffering || !self.queue.is_empty()
    }

    pub fn is_buffering(&self) -> bool {
        self.buffering
    }

    pub fn has_retry(&self) -> bool {
        self.retry.is_some()
    }

    pub fn push(&mut self, frame: Frame) {
        self.queue.push_back(frame);
    }

    pub fn front(&self) -> Option<&Frame> {
        self.queue.front()
    }

    pub fn pop_front(&mut self) -> Option<Frame> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Enter buffering mode with `retry` scheduled to drain later.
    pub fn start_retry(&mut self, retry: JoinHandle<()>) {
        self.buffering = true;
        if let Some(previous) = self.retry.replace(retry) {
            previous.abort();
        }
    }

    /// Called by the retry task itself once its delay has elapsed.
    pub fn end_retry(&mut self) {
        self.buffering = false;
        self.retry = None;
    }

    /// Abort any pending retry and discard the backlog.
    pub fn cancel(&mut self) -> usize {
        if let Some(retry) = self.retry.take() {
            retry.abort();
        }
        self.buffering = false;
        let dropped = self.queue.len();
        self.queue.clear();
        dropped
    }
}

impl Drop for SendBuffer {
    fn drop(&mut self) {
        if let Some(retry) = self.retry.take() {
            retry.abort();
        }
    }
}
