//! Slot uniqueness under contention.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use pretty_assertions::assert_eq;
use rand::Rng;
use test_env_log::test;

use crate::{prelude::CancellationToken, slot::SlotAllocator};

#[test(tokio::test)]
async fn concurrent_leases_never_share_a_slot() {
    let pool = SlotAllocator::new(4);
    let held = Arc::new(Mutex::new(HashSet::new()));
    let cancel = CancellationToken::new();

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let pool = pool.clone();
            let held = held.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                for _ in 0..8 {
                    let lease = pool
                        .acquire(Duration::from_secs(10), &cancel)
                        .await
                        .unwrap();
                    assert!(
                        held.lock().unwrap().insert(lease.id()),
                        "slot {} leased twice",
                        lease.id()
                    );
                    assert!(pool.active() <= pool.size() as usize);
                    let pause = rand::thread_rng().gen_range(0..3);
                    tokio::time::sleep(Duration::from_millis(pause)).await;
                    held.lock().unwrap().remove(&lease.id());
                    pool.release(lease);
                }
            })
        })
        .collect();
    for task in futures::future::join_all(tasks).await {
        task.unwrap();
    }

    assert_eq!(pool.active(), 0);
    assert!(held.lock().unwrap().is_empty());
    assert!(!pool.is_saturated());
}

#[test(tokio::test)]
async fn released_slots_are_reused() {
    let pool = SlotAllocator::new(2);
    let cancel = CancellationToken::new();
    let mut seen = HashSet::new();
    for _ in 0..6 {
        let lease = pool.acquire(Duration::from_secs(1), &cancel).await.unwrap();
        assert!(lease.id() < 2);
        assert!(!lease.needs_reset());
        seen.insert(lease.id());
        pool.release(lease);
    }
    assert_eq!(seen.len(), 2);
}
