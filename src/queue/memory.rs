use super::{QueueError, QueueStore};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

/// In-process queue store
///
/// Supports injecting pop failures to exercise the reconnect path.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    lists: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    failing_pops: AtomicU32,
    reconnects: AtomicU64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` pops fail
    pub fn fail_next_pops(&self, count: u32) {
        self.failing_pops.store(count, Ordering::SeqCst);
    }

    /// Number of reconnects requested so far
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Items still waiting under `key`
    pub fn len(&self, key: &str) -> usize {
        self.lists
            .lock()
            .map(|lists| lists.get(key).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, key: &str) -> bool {
        self.len(key) == 0
    }

    fn lists(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, VecDeque<Vec<u8>>>>, QueueError> {
        self.lists
            .lock()
            .map_err(|_| QueueError::Unavailable("memory queue lock poisoned".to_string()))
    }
}

#[async_trait]
impl QueueStore for MemoryQueue {
    async fn pop(&self, key: &str) -> Result<Option<Vec<u8>>, QueueError> {
        let failing = self
            .failing_pops
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(QueueError::Unavailable("injected pop failure".to_string()));
        }

        Ok(self.lists()?.get_mut(key).and_then(VecDeque::pop_front))
    }

    async fn push(&self, key: &str, item: &[u8]) -> Result<(), QueueError> {
        self.lists()?
            .entry(key.to_string())
            .or_default()
            .push_back(item.to_vec());
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), QueueError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
