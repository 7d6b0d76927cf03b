//! Send workers and the send-with-retry protocol

use super::monitor::Monitor;
use super::Batch;
use crate::event::Event;
use crate::lb::EndpointRegistry;
use crate::pool::AppendOutcome;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Retry policy for delivering one batch
#[derive(Debug, Clone)]
pub struct SendPolicy {
    /// Attempts per batch, acquisition failures included
    pub max_attempts: u32,

    /// How long to wait for a pooled connection
    pub acquire_timeout: Duration,

    /// Log roughly one in this many successful sends; 0 disables
    pub trace_sample_rate: u32,
}

impl Default for SendPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            acquire_timeout: Duration::from_secs(5),
            trace_sample_rate: 10_000,
        }
    }
}

/// What happened to one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    pub attempts: u32,
    pub delivered: bool,
}

/// Delivers batches for one business stream
pub struct BatchSender {
    business: String,
    batch_size: u64,
    registry: Arc<EndpointRegistry>,
    monitor: Arc<Monitor>,
    policy: SendPolicy,
}

impl BatchSender {
    pub fn new(
        business: impl Into<String>,
        batch_size: usize,
        registry: Arc<EndpointRegistry>,
        monitor: Arc<Monitor>,
        policy: SendPolicy,
    ) -> Self {
        Self {
            business: business.into(),
            batch_size: batch_size as u64,
            registry,
            monitor,
            policy,
        }
    }

    /// Send a batch, rotating through collector pools on failure.
    ///
    /// Counters move by the configured batch size: success once on delivery,
    /// failure once per attempt the collector rejected. Attempts that fail to
    /// get a connection, or fault mid-call, leave the counters alone. After
    /// the last attempt the batch is dropped.
    pub async fn send_with_retry(&self, events: &[Event]) -> SendReport {
        for attempt in 0..self.policy.max_attempts {
            let Some(link) = self.registry.select() else {
                error!(business = %self.business, "No collector pools registered");
                continue;
            };
            let pool = &link.pool;

            let mut conn = match pool.acquire(self.policy.acquire_timeout).await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(
                        business = %self.business,
                        pool = %link.name,
                        attempt = attempt,
                        error = %e,
                        "Failed to get collector connection"
                    );
                    continue;
                }
            };

            match conn.append_batch(events).await {
                AppendOutcome::Delivered => {
                    let host_port = conn.host_port().to_string();
                    pool.release(conn);
                    self.monitor.record_success(self.batch_size);
                    if self.should_trace() {
                        info!(
                            business = %self.business,
                            endpoint = %host_port,
                            events = events.len(),
                            "trace: batch delivered"
                        );
                    }
                    return SendReport {
                        attempts: attempt + 1,
                        delivered: true,
                    };
                }
                AppendOutcome::Rejected(reason) => {
                    pool.release(conn);
                    self.monitor.record_failure(self.batch_size);
                    warn!(
                        business = %self.business,
                        pool = %link.name,
                        attempt = attempt,
                        error = %reason,
                        "Collector rejected batch"
                    );
                }
                AppendOutcome::Poisoned(reason) => {
                    pool.release_broken(conn);
                    warn!(
                        business = %self.business,
                        pool = %link.name,
                        attempt = attempt,
                        error = %reason,
                        "Collector call faulted"
                    );
                }
            }
        }

        warn!(
            business = %self.business,
            events = events.len(),
            attempts = self.policy.max_attempts,
            "Dropping batch after exhausting attempts"
        );
        SendReport {
            attempts: self.policy.max_attempts,
            delivered: false,
        }
    }

    fn should_trace(&self) -> bool {
        match self.policy.trace_sample_rate {
            0 => false,
            rate => rand::thread_rng().gen_range(0..rate) == 0,
        }
    }
}

/// Pull batches off a shard's dispatch channel until it closes.
///
/// The channel closes once the shard reader has stopped and flushed, so a
/// worker keeps draining queued batches after cancellation and exits only
/// when nothing more can arrive.
pub(crate) async fn run_worker(
    worker_id: usize,
    shard: String,
    sender: Arc<BatchSender>,
    rx: Arc<Mutex<mpsc::Receiver<Batch>>>,
) {
    debug!(business = %sender.business, shard = %shard, worker_id = worker_id, "Send worker started");

    loop {
        // Lock only while waiting, never while sending
        let next = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };

        let Some(batch) = next else { break };
        sender.send_with_retry(&batch).await;
    }

    debug!(business = %sender.business, shard = %shard, worker_id = worker_id, "Send worker stopped");
}
