use crate::config::Config;
use crate::lb::{EndpointPoolLink, EndpointRegistry};
use crate::pool::{ConnectionPool, TcpConnector};
use crate::queue::{QueueStore, RedisQueue};
use crate::source::{BusinessStream, MonitorDelta};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Everything a running forwarder owns
///
/// One registry of collector pools is shared by every business stream.
/// Clones share the same registry and streams.
#[derive(Clone)]
pub struct Core {
    pub config: Arc<Config>,
    pub registry: Arc<EndpointRegistry>,
    streams: Vec<Arc<BusinessStream>>,
}

impl Core {
    /// Build collector pools, queue handles and business streams from config.
    ///
    /// Nothing connects yet: pools dial on first acquire and queue handles on
    /// first pop.
    pub fn new(config: Config) -> Result<Self> {
        let links = config
            .collectors
            .iter()
            .map(|collector| {
                let connector = Arc::new(
                    TcpConnector::new(collector.host_port.clone())
                        .with_request_timeout(collector.request_timeout()),
                );
                let pool = ConnectionPool::new(collector.name.clone(), connector, collector.pool_config());
                Arc::new(EndpointPoolLink::new(collector.name.clone(), Arc::new(pool)))
            })
            .collect();
        let registry = Arc::new(EndpointRegistry::new(links));

        let mut streams = Vec::with_capacity(config.streams.len());
        for stream in &config.streams {
            let mut shards: BTreeMap<String, Vec<Arc<dyn QueueStore>>> = BTreeMap::new();
            for (shard, urls) in &stream.queues {
                let mut queues: Vec<Arc<dyn QueueStore>> = Vec::with_capacity(urls.len());
                for url in urls {
                    let queue = RedisQueue::open(url)
                        .with_context(|| format!("Stream '{}': bad queue URL {}", stream.name, url))?;
                    queues.push(Arc::new(queue));
                }
                shards.insert(shard.clone(), queues);
            }

            let options = config.stream_options(stream);
            streams.push(Arc::new(BusinessStream::new(
                stream.name.clone(),
                shards,
                Arc::clone(&registry),
                options,
            )));
        }

        info!(
            collectors = registry.len(),
            streams = streams.len(),
            "Core initialized"
        );

        Ok(Self::from_parts(config, registry, streams))
    }

    /// Assemble a core from prebuilt parts
    pub fn from_parts(
        config: Config,
        registry: Arc<EndpointRegistry>,
        streams: Vec<Arc<BusinessStream>>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            streams,
        }
    }

    pub fn streams(&self) -> &[Arc<BusinessStream>] {
        &self.streams
    }

    pub fn stream(&self, name: &str) -> Option<&Arc<BusinessStream>> {
        self.streams.iter().find(|s| s.name() == name)
    }

    /// Start every business stream. Stops at the first failure.
    pub fn start_all(&self) -> Result<()> {
        for stream in &self.streams {
            stream
                .start()
                .with_context(|| format!("Failed to start stream '{}'", stream.name()))?;
        }
        Ok(())
    }

    /// Stop every business stream concurrently, so the whole shutdown takes
    /// at most one grace period.
    pub async fn stop_all(&self) {
        let mut set = JoinSet::new();
        for stream in &self.streams {
            let stream = Arc::clone(stream);
            set.spawn(async move { stream.stop().await });
        }

        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "Stream stop task failed");
            }
        }
        info!("All business streams stopped");
    }

    /// Counter deltas for every stream since the previous call
    pub fn monitor_all(&self) -> Vec<(String, MonitorDelta)> {
        self.streams
            .iter()
            .map(|s| (s.name().to_string(), s.monitor()))
            .collect()
    }

    /// Log per-stream deltas every `interval` until cancelled
    pub fn spawn_monitor(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let core = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for (name, delta) in core.monitor_all() {
                            info!(
                                business = %name,
                                success = delta.success,
                                failure = delta.failure,
                                "Throughput"
                            );
                        }
                    }
                }
            }
        })
    }

    /// Start every stream, log throughput every `monitor_interval` (zero
    /// disables it) and stop everything once `shutdown` resolves.
    pub async fn run_until<F>(&self, monitor_interval: Duration, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        self.start_all()?;

        let cancel = CancellationToken::new();
        let monitor = (!monitor_interval.is_zero())
            .then(|| self.spawn_monitor(monitor_interval, cancel.clone()));

        shutdown.await;
        info!("Shutdown requested");

        cancel.cancel();
        self.stop_all().await;
        if let Some(handle) = monitor {
            if let Err(e) = handle.await {
                warn!(error = %e, "Monitor task failed");
            }
        }

        for (name, delta) in self.monitor_all() {
            info!(business = %name, success = delta.success, failure = delta.failure, "Final throughput");
        }
        Ok(())
    }

    /// Push a raw item onto a stream's shard queue
    pub async fn push(&self, stream: &str, shard: &str, item: &[u8]) -> Result<()> {
        let target = self
            .stream(stream)
            .ok_or_else(|| anyhow::anyhow!("Unknown stream: {}", stream))?;
        target.push(shard, item).await?;
        Ok(())
    }
}
