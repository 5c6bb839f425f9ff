use std::sync::{Arc, Mutex};

use async_trait::async_trait;

/// A resource that must be released by an explicit asynchronous call.
///
/// Rust has no async drop, so anything holding a sandbox slot or a container
/// implements this trait and is registered in an [`AsyncTeardownCollector`]
/// right after acquisition. Implementors carry a `DropBomb` and must make
/// `teardown` idempotent: the collector may run it after the owner already
/// released the resource on its happy path.
#[async_trait]
pub trait AsyncTeardown: Sync + Send {
    async fn teardown(&self);
}

/// Collects [`AsyncTeardown`] values and releases them in reverse order of
/// registration, no matter how the job that registered them ended.
pub struct AsyncTeardownCollector {
    items: Mutex<Vec<Arc<dyn AsyncTeardown>>>,
}

impl AsyncTeardownCollector {
    pub fn new() -> AsyncTeardownCollector {
        AsyncTeardownCollector {
            items: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, val: Arc<dyn AsyncTeardown>) {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.push(val);
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tear down everything collected so far, newest first.
    pub async fn teardown_all(self) {
        let items = self.items.into_inner().unwrap_or_else(|e| e.into_inner());
        for item in items.into_iter().rev() {
            item.teardown().await;
        }
    }
}

impl Default for AsyncTeardownCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        id: u32,
        log: Arc<Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl AsyncTeardown for Recorder {
        async fn teardown(&self) {
            self.log.lock().unwrap().push(self.id);
        }
    }

    #[tokio::test]
    async fn tears_down_in_reverse_order() {
        let log = Arc::new(Mutex::new(vec![]));
        let collector = AsyncTeardownCollector::new();
        for id in 1..=3 {
            collector.add(Arc::new(Recorder {
                id,
                log: log.clone(),
            }));
        }
        assert_eq!(collector.len(), 3);
        collector.teardown_all().await;
        assert_eq!(*log.lock().unwrap(), vec![3, 2, 1]);
    }
}
