use super::{QueueError, QueueStore};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Redis-list backed queue store
///
/// The connection is opened lazily on first use and replaced on
/// [`QueueStore::reconnect`]. Clones of the multiplexed connection are handed
/// out per command so the lock is only held while swapping connections.
pub struct RedisQueue {
    url: String,
    client: Client,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisQueue {
    /// Create a queue handle for `url` (e.g. `redis://127.0.0.1:6379`)
    pub fn open(url: &str) -> Result<Self, QueueError> {
        let client = Client::open(url)?;
        Ok(Self {
            url: url.to_string(),
            client,
            conn: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, QueueError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        debug!(url = %self.url, "Opening Redis connection");
        let conn = self.client.get_multiplexed_async_connection().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl QueueStore for RedisQueue {
    async fn pop(&self, key: &str) -> Result<Option<Vec<u8>>, QueueError> {
        let mut conn = self.connection().await?;
        let item: Option<Vec<u8>> = conn.lpop(key, None).await?;
        Ok(item)
    }

    async fn push(&self, key: &str, item: &[u8]) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let len: i64 = conn.rpush(key, item).await?;
        debug!(key = %key, len = len, "Pushed item");
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), QueueError> {
        let mut guard = self.conn.lock().await;
        *guard = None;

        info!(url = %self.url, "Reconnecting to Redis");
        let conn = self.client.get_multiplexed_async_connection().await?;
        *guard = Some(conn);
        Ok(())
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}
