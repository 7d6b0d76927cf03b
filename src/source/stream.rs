use super::monitor::{Monitor, MonitorDelta};
use super::reader::{Batcher, ShardReader};
use super::sender::{run_worker, BatchSender, SendPolicy};
use crate::lb::EndpointRegistry;
use crate::queue::{QueueError, QueueStore};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Error types for business stream lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Business stream already running: {0}")]
    AlreadyRunning(String),

    #[error("Unknown shard {shard} for business stream {business}")]
    UnknownShard { business: String, shard: String },

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Tunables for one business stream
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Maximum events per batch
    pub batch_size: usize,

    /// Dispatch channel depth per shard, in batches
    pub channel_depth: usize,

    /// Send workers per shard
    pub workers_per_shard: usize,

    /// Sleep between pops of an empty or failing queue
    pub empty_backoff: Duration,

    /// How long `stop` waits for in-flight batches
    pub grace_period: Duration,

    pub send: SendPolicy,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            batch_size: 300,
            channel_depth: 10,
            workers_per_shard: 10,
            empty_backoff: Duration::from_millis(100),
            grace_period: Duration::from_secs(5),
            send: SendPolicy::default(),
        }
    }
}

struct Running {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

/// A named log source: its shard queues, send workers and counters
pub struct BusinessStream {
    name: String,
    shards: BTreeMap<String, Vec<Arc<dyn QueueStore>>>,
    registry: Arc<EndpointRegistry>,
    options: StreamOptions,
    monitor: Arc<Monitor>,
    sender: Arc<BatchSender>,
    running: Mutex<Option<Running>>,
}

impl BusinessStream {
    /// Create a stream and register it on every collector link
    pub fn new(
        name: impl Into<String>,
        shards: BTreeMap<String, Vec<Arc<dyn QueueStore>>>,
        registry: Arc<EndpointRegistry>,
        options: StreamOptions,
    ) -> Self {
        let name = name.into();
        let monitor = Arc::new(Monitor::new());
        let sender = Arc::new(BatchSender::new(
            name.clone(),
            options.batch_size,
            Arc::clone(&registry),
            Arc::clone(&monitor),
            options.send.clone(),
        ));

        registry.attach_business(&name);

        Self {
            name,
            shards,
            registry,
            options,
            monitor,
            sender,
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    /// Shard keys in sorted order
    pub fn shard_keys(&self) -> impl Iterator<Item = &str> {
        self.shards.keys().map(String::as_str)
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Spawn one reader and the send workers for every shard queue.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), StreamError> {
        let mut running = self.running();
        if running.is_some() {
            return Err(StreamError::AlreadyRunning(self.name.clone()));
        }

        // A previous stop detached the stream from every link
        self.registry.attach_business(&self.name);

        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        for (shard, queues) in &self.shards {
            info!(business = %self.name, shard = %shard, queues = queues.len(), "Starting shard");

            for queue in queues {
                let (tx, rx) = mpsc::channel(self.options.channel_depth.max(1));
                let rx = Arc::new(tokio::sync::Mutex::new(rx));

                for worker_id in 0..self.options.workers_per_shard.max(1) {
                    tasks.spawn(run_worker(
                        worker_id,
                        shard.clone(),
                        Arc::clone(&self.sender),
                        Arc::clone(&rx),
                    ));
                }

                let reader = ShardReader {
                    business: self.name.clone(),
                    shard: shard.clone(),
                    queue: Arc::clone(queue),
                    batcher: Batcher::new(self.options.batch_size),
                    tx,
                    empty_backoff: self.options.empty_backoff,
                    cancel: cancel.clone(),
                };
                tasks.spawn(reader.run());
            }
        }

        *running = Some(Running { cancel, tasks });
        info!(business = %self.name, shards = self.shards.len(), "Business stream started");
        Ok(())
    }

    /// Signal every loop to stop, give in-flight batches the grace period to
    /// drain, then detach from every collector link.
    ///
    /// Loops still running after the grace period are aborted. Safe to call
    /// on a stream that was never started.
    pub async fn stop(&self) {
        let running = self.running().take();

        if let Some(Running { cancel, mut tasks }) = running {
            cancel.cancel();

            let drained = tokio::time::timeout(self.options.grace_period, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;

            if drained.is_err() {
                warn!(
                    business = %self.name,
                    remaining = tasks.len(),
                    "Grace period elapsed, aborting remaining loops"
                );
                tasks.shutdown().await;
            }
        }

        let detached = self.registry.detach_business(&self.name);
        info!(business = %self.name, links = detached, "Business stream stopped");
    }

    /// Success/failure units since the previous call
    pub fn monitor(&self) -> MonitorDelta {
        self.monitor.snapshot()
    }

    /// Lifetime `(success, failure)` totals
    pub fn totals(&self) -> (u64, u64) {
        self.monitor.totals()
    }

    /// Inject a raw item into a shard's first queue
    pub async fn push(&self, shard: &str, item: &[u8]) -> Result<(), StreamError> {
        let queue = self
            .shards
            .get(shard)
            .and_then(|queues| queues.first())
            .ok_or_else(|| StreamError::UnknownShard {
                business: self.name.clone(),
                shard: shard.to_string(),
            })?;

        queue.push(shard, item).await?;
        Ok(())
    }
}

impl std::fmt::Debug for BusinessStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusinessStream")
            .field("name", &self.name)
            .field("shards", &self.shards.keys().collect::<Vec<_>>())
            .field("options", &self.options)
            .field("running", &self.is_running())
            .finish()
    }
}
