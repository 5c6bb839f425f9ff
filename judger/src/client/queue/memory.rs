use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::{sync::Notify, time::Instant};

use super::{settled_attempts, JobQueue, PriorityPicker, QueueError};
use crate::client::model::{Delivery, Job, Priority, Requeue};

#[derive(Debug)]
struct Entry {
    job: Job,
    /// Attempts already made.
    attempts: u32,
}

#[derive(Debug)]
struct State {
    critical: VecDeque<Entry>,
    default: VecDeque<Entry>,
    delayed: Vec<(Instant, Entry)>,
    in_flight: HashMap<u64, Entry>,
    picker: PriorityPicker,
}

impl State {
    fn class(&mut self, priority: Priority) -> &mut VecDeque<Entry> {
        match priority {
            Priority::Critical => &mut self.critical,
            Priority::Default => &mut self.default,
        }
    }

    fn promote_due(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, entry) = self.delayed.swap_remove(i);
                let priority = entry.job.priority;
                self.class(priority).push_back(entry);
            } else {
                i += 1;
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }
}

/// In-process queue, used for one-shot judging and in tests.
#[derive(Debug)]
pub struct MemoryQueue {
    state: Mutex<State>,
    notify: Notify,
    next_tag: AtomicU64,
}

impl MemoryQueue {
    pub fn new(critical_burst: u32) -> Self {
        MemoryQueue {
            state: Mutex::new(State {
                critical: VecDeque::new(),
                default: VecDeque::new(),
                delayed: vec![],
                in_flight: HashMap::new(),
                picker: PriorityPicker::new(critical_burst),
            }),
            notify: Notify::new(),
            next_tag: AtomicU64::new(1),
        }
    }

    fn state(&self) -> MutexGuard<State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Jobs waiting for (re)delivery, delayed ones included.
    pub fn pending(&self) -> usize {
        let state = self.state();
        state.critical.len() + state.default.len() + state.delayed.len()
    }

    fn try_take(&self) -> Result<Option<Delivery>, Option<Instant>> {
        let mut state = self.state();
        state.promote_due(Instant::now());
        let (c, d) = (!state.critical.is_empty(), !state.default.is_empty());
        let entry = match state.picker.pick(c, d) {
            Some(p) => state.class(p).pop_front(),
            None => None,
        };
        let entry = match entry {
            Some(e) => e,
            None => return Err(state.next_due()),
        };
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        let delivery = Delivery {
            job: entry.job.clone(),
            attempt: entry.attempts + 1,
            tag,
        };
        state.in_flight.insert(
            tag,
            Entry {
                job: entry.job,
                attempts: entry.attempts + 1,
            },
        );
        let more = !state.critical.is_empty() || !state.default.is_empty();
        drop(state);
        if more {
            self.notify.notify_one();
        }
        Ok(Some(delivery))
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        let priority = job.priority;
        self.state()
            .class(priority)
            .push_back(Entry { job, attempts: 0 });
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            let next_due = match self.try_take() {
                Ok(delivery) => return Ok(delivery),
                Err(next_due) => next_due,
            };
            if Instant::now() >= deadline {
                return Ok(None);
            }
            let wake = next_due.map_or(deadline, |due| due.min(deadline));
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.state()
            .in_flight
            .remove(&delivery.tag)
            .map(|_| ())
            .ok_or(QueueError::UnknownDelivery(delivery.tag))
    }

    async fn nack(&self, delivery: Delivery, requeue: Requeue) -> Result<(), QueueError> {
        let mut state = self.state();
        let mut entry = state
            .in_flight
            .remove(&delivery.tag)
            .ok_or(QueueError::UnknownDelivery(delivery.tag))?;
        entry.attempts = settled_attempts(&delivery, requeue);
        match requeue {
            Requeue::Retry { delay } if delay > Duration::ZERO => {
                state.delayed.push((Instant::now() + delay, entry));
            }
            _ => {
                let priority = entry.job.priority;
                state.class(priority).push_front(entry);
            }
        }
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    fn depth(&self, priority: Priority) -> usize {
        let mut state = self.state();
        let delayed = state
            .delayed
            .iter()
            .filter(|(_, e)| e.job.priority == priority)
            .count();
        state.class(priority).len() + delayed
    }

    fn in_flight(&self) -> usize {
        self.state().in_flight.len()
    }
}
