//! Job queue: where jobs come from, and how finished or failed deliveries are
//! settled.

use async_trait::async_trait;
use err_derive::Error;
use std::time::Duration;

use super::model::{Delivery, Job, Priority, Requeue};

pub mod memory;
pub mod spool;

pub use memory::MemoryQueue;
pub use spool::SpoolQueue;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(display = "IO error: {}", _0)]
    Io(#[error(source)] std::io::Error),

    #[error(display = "Malformed job file {}: {}", _0, _1)]
    Malformed(String, #[error(source, no_from)] serde_json::Error),

    #[error(display = "JSON error: {}", _0)]
    Json(#[error(source)] serde_json::Error),

    #[error(display = "Delivery {} is not in flight", _0)]
    UnknownDelivery(u64),
}

/// A source of jobs with at-least-once delivery.
///
/// Every delivery must be settled exactly once, with either
/// [`JobQueue::ack`] or [`JobQueue::nack`]. Dropping a pending
/// [`JobQueue::dequeue`] future must never lose a job.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<(), QueueError>;

    /// Wait up to `timeout` for the next job. `Ok(None)` when nothing came.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError>;

    /// The job is done and must not be delivered again.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    async fn nack(&self, delivery: Delivery, requeue: Requeue) -> Result<(), QueueError>;

    /// Jobs of this priority waiting to be delivered, delayed ones included.
    fn depth(&self, priority: Priority) -> usize;

    /// Deliveries handed out and not yet settled.
    fn in_flight(&self) -> usize;
}

/// Chooses which class to serve next.
///
/// Critical jobs win, but after `burst` critical deliveries in a row one
/// waiting default job is let through so the default class never starves.
#[derive(Debug, Clone)]
pub struct PriorityPicker {
    burst: u32,
    streak: u32,
}

impl PriorityPicker {
    pub fn new(burst: u32) -> Self {
        PriorityPicker {
            burst: burst.max(1),
            streak: 0,
        }
    }

    pub fn pick(&mut self, critical_ready: bool, default_ready: bool) -> Option<Priority> {
        match (critical_ready, default_ready) {
            (true, true) if self.streak >= self.burst => {
                self.streak = 0;
                Some(Priority::Default)
            }
            (true, _) => {
                self.streak += 1;
                Some(Priority::Critical)
            }
            (false, true) => {
                self.streak = 0;
                Some(Priority::Default)
            }
            (false, false) => None,
        }
    }
}

/// Attempt number recorded for a delivery going back to the queue; the next
/// delivery adds one to it.
pub(crate) fn settled_attempts(delivery: &Delivery, requeue: Requeue) -> u32 {
    match requeue {
        Requeue::Retry { .. } => delivery.attempt,
        Requeue::Return => delivery.attempt.saturating_sub(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_first_but_default_not_starved() {
        let mut picker = PriorityPicker::new(3);
        let picks: Vec<_> = (0..8).map(|_| picker.pick(true, true).unwrap()).collect();
        use Priority::*;
        assert_eq!(
            picks,
            vec![Critical, Critical, Critical, Default, Critical, Critical, Critical, Default]
        );
        assert_eq!(picker.pick(false, true), Some(Default));
        assert_eq!(picker.pick(true, false), Some(Critical));
        assert_eq!(picker.pick(false, false), None);
    }
}
