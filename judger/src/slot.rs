//! Slot Allocator: exclusive leases over a fixed range of sandbox slots.

use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use err_derive::Error;
use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::runner::{model::SlotId, Sandbox};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SlotError {
    #[error(display = "No sandbox slot became free within {:?}", _0)]
    PoolExhausted(Duration),

    #[error(display = "Slot acquisition was cancelled")]
    Cancelled,
}

#[derive(Debug, Default)]
struct SlotState {
    free: VecDeque<SlotId>,
    held: HashSet<SlotId>,
    /// Slots whose previous holder did not finish cleanly. They must be
    /// force-cleaned before the next job uses them.
    dirty: HashSet<SlotId>,
}

/// Hands out slots `0..size`, never the same one to two live leases.
///
/// Waiting for a slot is a genuine suspension on a semaphore, bounded by a
/// timeout and a cancellation token, which is what throttles the worker pool
/// when every slot is busy.
#[derive(Debug)]
pub struct SlotAllocator {
    size: u32,
    permits: Semaphore,
    state: Mutex<SlotState>,
    saturated: AtomicBool,
}

impl SlotAllocator {
    pub fn new(size: u32) -> Arc<SlotAllocator> {
        let state = SlotState {
            free: (0..size).collect(),
            ..Default::default()
        };
        Arc::new(SlotAllocator {
            size,
            permits: Semaphore::new(size as usize),
            state: Mutex::new(state),
            saturated: AtomicBool::new(false),
        })
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    fn state(&self) -> MutexGuard<SlotState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of slots currently leased.
    pub fn active(&self) -> usize {
        self.state().held.len()
    }

    /// Whether an acquisition ran out of time since a slot was last leased
    /// or returned.
    pub fn is_saturated(&self) -> bool {
        self.saturated.load(Ordering::SeqCst)
    }

    pub(crate) fn set_saturated(&self, saturated: bool) {
        self.saturated.store(saturated, Ordering::SeqCst);
    }

    /// Wait up to `timeout` for a free slot.
    pub async fn acquire(
        self: &Arc<Self>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<SlotLease, SlotError> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SlotError::Cancelled),
            res = tokio::time::timeout(timeout, self.permits.acquire()) => res,
        };
        let permit = match permit {
            Ok(Ok(permit)) => permit,
            // The semaphore is never closed.
            Ok(Err(_)) => return Err(SlotError::Cancelled),
            Err(_) => {
                self.set_saturated(true);
                return Err(SlotError::PoolExhausted(timeout));
            }
        };
        permit.forget();

        let mut state = self.state();
        let id = match state.free.pop_front() {
            Some(id) => id,
            None => {
                // Permits and the free list move together under the lock.
                drop(state);
                self.permits.add_permits(1);
                tracing::error!("slot permit acquired with an empty free list");
                return Err(SlotError::PoolExhausted(timeout));
            }
        };
        let inserted = state.held.insert(id);
        debug_assert!(inserted, "slot {} leased twice", id);
        let needs_reset = state.dirty.remove(&id);
        drop(state);

        self.set_saturated(false);
        tracing::trace!(slot = id, needs_reset, "slot leased");
        Ok(SlotLease {
            id,
            needs_reset,
            dirty: Arc::new(AtomicBool::new(false)),
            pool: Some(self.clone()),
        })
    }

    /// Return a lease to the pool.
    pub fn release(&self, mut lease: SlotLease) {
        lease.pool = None;
        let dirty = lease.dirty.load(Ordering::SeqCst);
        self.give_back(lease.id, dirty);
    }

    fn give_back(&self, id: SlotId, dirty: bool) {
        let mut state = self.state();
        if !state.held.remove(&id) {
            tracing::error!(slot = id, "released a slot that was not leased");
            return;
        }
        if dirty {
            state.dirty.insert(id);
        }
        state.free.push_back(id);
        drop(state);
        self.permits.add_permits(1);
        self.set_saturated(false);
        tracing::trace!(slot = id, dirty, "slot released");
    }

    /// Crash-recovery sweep: force-clean every slot that is not currently
    /// leased. Slots that fail to clean stay marked dirty and are retried
    /// when next leased. Returns the slots that failed.
    pub async fn recover(&self, sandbox: &dyn Sandbox) -> Vec<SlotId> {
        let idle: Vec<SlotId> = {
            let state = self.state();
            state.free.iter().copied().collect()
        };
        tracing::info!(slots = idle.len(), "sweeping sandbox slots");
        let results: Vec<(SlotId, bool)> = futures::stream::iter(idle)
            .map(|id| async move {
                match sandbox.cleanup(id).await {
                    Ok(()) => (id, true),
                    Err(e) => {
                        tracing::warn!(slot = id, error = %e, "force cleanup failed");
                        (id, false)
                    }
                }
            })
            .buffer_unordered(16)
            .collect()
            .await;

        let mut state = self.state();
        let mut failed = vec![];
        for (id, ok) in results {
            if ok {
                state.dirty.remove(&id);
            } else {
                state.dirty.insert(id);
                failed.push(id);
            }
        }
        failed.sort_unstable();
        failed
    }
}

/// Exclusive ownership of one slot.
///
/// A lease dropped without [`SlotAllocator::release`] (a panicking or
/// aborted worker) still returns its slot, but marks it dirty so the next
/// holder force-cleans it first.
#[derive(Debug)]
pub struct SlotLease {
    id: SlotId,
    needs_reset: bool,
    dirty: Arc<AtomicBool>,
    pool: Option<Arc<SlotAllocator>>,
}

impl SlotLease {
    pub fn id(&self) -> SlotId {
        self.id
    }

    /// The previous holder left this slot in an unknown state.
    pub fn needs_reset(&self) -> bool {
        self.needs_reset
    }

    /// Mark the slot as needing a forced reset before its next use.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Shared with whatever cleans the slot up, so a failed cleanup can mark
    /// the lease dirty after the fact.
    pub fn dirty_flag(&self) -> Arc<AtomicBool> {
        self.dirty.clone()
    }

    /// A lease for a slot outside any pool, such as the health probe slot.
    pub fn detached(id: SlotId) -> SlotLease {
        SlotLease {
            id,
            needs_reset: true,
            dirty: Arc::new(AtomicBool::new(false)),
            pool: None,
        }
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            tracing::warn!(slot = self.id, "slot lease dropped without release");
            pool.give_back(self.id, true);
        }
    }
}
