//! Queue store abstraction
//!
//! Each shard is a keyed list in a queue store. Readers pop one raw item at a
//! time; `push` exists for diagnostic injection.
//!
//! - [`RedisQueue`]: Redis lists (`LPOP` / `RPUSH`) over a multiplexed connection
//! - [`MemoryQueue`]: in-process lists, used by tests and dry runs

pub mod memory;
pub mod redis_list;

pub use self::memory::MemoryQueue;
pub use self::redis_list::RedisQueue;

use async_trait::async_trait;

/// Error types for queue store operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Queue store unavailable: {0}")]
    Unavailable(String),
}

/// A keyed list store that shard readers drain
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Pop the next item from `key`; `Ok(None)` means the list is empty
    async fn pop(&self, key: &str) -> Result<Option<Vec<u8>>, QueueError>;

    /// Append an item to the tail of `key`
    async fn push(&self, key: &str, item: &[u8]) -> Result<(), QueueError>;

    /// Drop the current connection and open a fresh one
    async fn reconnect(&self) -> Result<(), QueueError>;

    /// Human-readable location, used in logs
    fn describe(&self) -> String;
}
