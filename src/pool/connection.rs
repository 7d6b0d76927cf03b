//! Bounded per-endpoint connection pool
//!
//! Each pool owns up to `max_connections` collector connections. Callers
//! acquire a [`PooledConnection`] with a timeout and must hand it back with
//! either [`ConnectionPool::release`] (reusable) or
//! [`ConnectionPool::release_broken`] (discarded). Both consume the
//! connection, so a broken connection can never re-enter the idle list.

use super::collector::{AppendOutcome, CollectorConnection, Connector};
use crate::event::Event;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Error types for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Failed to connect to collector {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    #[error("Timed out after {0:?} waiting for a connection")]
    AcquireTimeout(Duration),

    #[error("Pool is closed: {0}")]
    Closed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for connection pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections (idle + in use)
    pub max_connections: usize,

    /// Maximum idle time before a connection is discarded instead of reused
    pub max_idle_time: Duration,

    /// Timeout for opening a new connection
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            max_idle_time: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

/// Statistics for a connection pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total connections created
    pub total_created: u64,

    /// Total connections reused from the idle list
    pub total_reused: u64,

    /// Connections discarded as broken
    pub total_broken: u64,

    /// Acquisitions that timed out or failed to connect
    pub failed_acquires: u64,

    /// Connections currently handed out
    pub active_connections: usize,

    /// Connections waiting in the idle list
    pub idle_connections: usize,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    reused: AtomicU64,
    broken: AtomicU64,
    failed: AtomicU64,
}

struct IdleConnection {
    conn: Box<dyn CollectorConnection>,
    id: u64,
    created_at: Instant,
    use_count: u64,
    last_used: Instant,
}

/// A connection checked out of a [`ConnectionPool`]
///
/// Holds one capacity slot of its pool until released.
pub struct PooledConnection {
    conn: Box<dyn CollectorConnection>,
    id: u64,
    created_at: Instant,
    use_count: u64,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Append a batch of events to the collector
    pub async fn append_batch(&mut self, events: &[Event]) -> AppendOutcome {
        self.use_count += 1;
        self.conn.append_batch(events).await
    }

    pub fn host_port(&self) -> &str {
        self.conn.host_port()
    }

    /// Pool-unique connection id
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("host_port", &self.conn.host_port())
            .field("use_count", &self.use_count)
            .finish()
    }
}

/// Connection pool for a single collector endpoint
pub struct ConnectionPool {
    name: String,
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConnection>>,
    counters: Counters,
    next_id: AtomicU64,
}

impl ConnectionPool {
    /// Create a new pool; connections are opened lazily on acquire
    pub fn new(name: impl Into<String>, connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        let max = config.max_connections.max(1);
        Self {
            name: name.into(),
            connector,
            permits: Arc::new(Semaphore::new(max)),
            idle: Mutex::new(Vec::with_capacity(max)),
            config,
            counters: Counters::default(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address of the collector this pool connects to
    pub fn host_port(&self) -> &str {
        self.connector.host_port()
    }

    /// Acquire a connection, waiting at most `timeout` for a free slot and
    /// for a new connection to be opened
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection, PoolError> {
        let result = tokio::time::timeout(timeout, self.acquire_inner()).await;

        match result {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
            Err(_) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                Err(PoolError::AcquireTimeout(timeout))
            }
        }
    }

    async fn acquire_inner(&self) -> Result<PooledConnection, PoolError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed(self.name.clone()))?;

        if let Some(idle) = self.take_idle() {
            self.counters.reused.fetch_add(1, Ordering::Relaxed);
            debug!(
                pool = %self.name,
                conn_id = idle.id,
                use_count = idle.use_count,
                age_secs = idle.created_at.elapsed().as_secs(),
                "Reusing connection"
            );
            return Ok(PooledConnection {
                conn: idle.conn,
                id: idle.id,
                created_at: idle.created_at,
                use_count: idle.use_count,
                _permit: permit,
            });
        }

        let conn = tokio::time::timeout(self.config.connect_timeout, self.connector.connect())
            .await
            .map_err(|_| PoolError::ConnectionFailed {
                endpoint: self.connector.host_port().to_string(),
                reason: "connect timeout".to_string(),
            })??;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let total = self.counters.created.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            pool = %self.name,
            endpoint = %self.connector.host_port(),
            conn_id = id,
            total_created = total,
            "Created new connection"
        );

        Ok(PooledConnection {
            conn,
            id,
            created_at: Instant::now(),
            use_count: 0,
            _permit: permit,
        })
    }

    /// Pop the most recently used idle connection that has not gone stale
    fn take_idle(&self) -> Option<IdleConnection> {
        let mut idle = match self.idle.lock() {
            Ok(idle) => idle,
            Err(poisoned) => poisoned.into_inner(),
        };

        while let Some(conn) = idle.pop() {
            if conn.last_used.elapsed() < self.config.max_idle_time {
                return Some(conn);
            }
            debug!(pool = %self.name, conn_id = conn.id, "Discarding stale connection");
        }
        None
    }

    /// Return a healthy connection for reuse
    pub fn release(&self, conn: PooledConnection) {
        let PooledConnection {
            conn,
            id,
            created_at,
            use_count,
            _permit,
        } = conn;

        let mut idle = match self.idle.lock() {
            Ok(idle) => idle,
            Err(poisoned) => poisoned.into_inner(),
        };
        idle.push(IdleConnection {
            conn,
            id,
            created_at,
            use_count,
            last_used: Instant::now(),
        });
        // permit drops here, freeing the slot after the connection is idle
    }

    /// Discard a connection that may be corrupted
    pub fn release_broken(&self, conn: PooledConnection) {
        self.counters.broken.fetch_add(1, Ordering::Relaxed);
        warn!(
            pool = %self.name,
            endpoint = %conn.host_port(),
            conn_id = conn.id,
            use_count = conn.use_count,
            "Discarding broken connection"
        );
        drop(conn);
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let idle_connections = self.idle.lock().map(|idle| idle.len()).unwrap_or(0);
        let in_use = self
            .config
            .max_connections
            .max(1)
            .saturating_sub(self.permits.available_permits());

        PoolStats {
            total_created: self.counters.created.load(Ordering::Relaxed),
            total_reused: self.counters.reused.load(Ordering::Relaxed),
            total_broken: self.counters.broken.load(Ordering::Relaxed),
            failed_acquires: self.counters.failed.load(Ordering::Relaxed),
            active_connections: in_use,
            idle_connections,
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.name)
            .field("host_port", &self.connector.host_port())
            .field("config", &self.config)
            .finish()
    }
}
