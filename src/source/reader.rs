//! Shard reader: pop, decode, accumulate, dispatch

use super::Batch;
use crate::event::Event;
use crate::queue::QueueStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Accumulates events into batches of at most `batch_size`
///
/// The event that fills a batch is part of that batch; the next batch starts
/// empty.
#[derive(Debug)]
pub struct Batcher {
    batch_size: usize,
    pending: Batch,
}

impl Batcher {
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            pending: Vec::with_capacity(batch_size),
        }
    }

    /// Append an event; returns the batch if it is now full
    pub fn push(&mut self, event: Event) -> Option<Batch> {
        self.pending.push(event);
        if self.pending.len() >= self.batch_size {
            Some(std::mem::replace(
                &mut self.pending,
                Vec::with_capacity(self.batch_size),
            ))
        } else {
            None
        }
    }

    /// Take whatever has accumulated so far
    pub fn take_pending(&mut self) -> Option<Batch> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Per-shard reader loop
pub struct ShardReader {
    pub(crate) business: String,
    pub(crate) shard: String,
    pub(crate) queue: Arc<dyn QueueStore>,
    pub(crate) batcher: Batcher,
    pub(crate) tx: mpsc::Sender<Batch>,
    pub(crate) empty_backoff: Duration,
    pub(crate) cancel: CancellationToken,
}

impl ShardReader {
    /// Run until cancelled or every send worker is gone
    pub async fn run(mut self) {
        info!(
            business = %self.business,
            shard = %self.shard,
            queue = %self.queue.describe(),
            "Shard reader started"
        );

        while !self.cancel.is_cancelled() {
            // LPOP is not raced against cancellation: an item popped
            // server-side must not be lost to a dropped future.
            match self.queue.pop(&self.shard).await {
                Err(e) => {
                    warn!(business = %self.business, shard = %self.shard, error = %e, "Queue pop failed");
                    if let Err(e) = self.queue.reconnect().await {
                        warn!(business = %self.business, shard = %self.shard, error = %e, "Queue reconnect failed");
                    }
                    self.backoff().await;
                }
                Ok(None) => self.backoff().await,
                Ok(Some(raw)) => {
                    let event = match Event::decode(&raw) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!(
                                business = %self.business,
                                shard = %self.shard,
                                error = %e,
                                bytes = raw.len(),
                                "Dropping malformed queue item"
                            );
                            continue;
                        }
                    };

                    if let Some(batch) = self.batcher.push(event) {
                        if !self.dispatch(batch).await {
                            break;
                        }
                    }
                }
            }
        }

        self.flush_pending().await;
        info!(business = %self.business, shard = %self.shard, "Shard reader stopped");
    }

    async fn backoff(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(self.empty_backoff) => {}
        }
    }

    /// Hand a full batch to the send workers, blocking while the channel is
    /// full. Returns false when the reader should stop.
    async fn dispatch(&mut self, batch: Batch) -> bool {
        let len = batch.len();
        let permit = tokio::select! {
            permit = self.tx.reserve() => Some(permit),
            _ = self.cancel.cancelled() => None,
        };

        match permit {
            None => {
                // Keep the full batch so the shutdown flush can try it
                self.batcher.pending = batch;
                false
            }
            Some(Ok(permit)) => {
                permit.send(batch);
                debug!(business = %self.business, shard = %self.shard, events = len, "Dispatched batch");
                true
            }
            Some(Err(_)) => {
                warn!(
                    business = %self.business,
                    shard = %self.shard,
                    events = len,
                    "Send workers gone, dropping batch"
                );
                false
            }
        }
    }

    /// Hand the partial batch to the workers on shutdown.
    ///
    /// Workers keep draining until this reader drops its sender, so the send
    /// completes unless the stop grace period runs out first.
    async fn flush_pending(&mut self) {
        while self.batcher.pending_len() > 0 {
            let take = self.batcher.pending_len().min(self.batcher.batch_size);
            let batch: Batch = self.batcher.pending.drain(..take).collect();
            let len = batch.len();
            if let Err(mpsc::error::SendError(lost)) = self.tx.send(batch).await {
                warn!(
                    business = %self.business,
                    shard = %self.shard,
                    events = lost.len() + self.batcher.pending_len(),
                    "Send workers gone, dropping undelivered events"
                );
                self.batcher.pending.clear();
                return;
            }
            debug!(business = %self.business, shard = %self.shard, events = len, "Flushed pending batch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;

    fn event(i: usize) -> Event {
        Event {
            business_name: "b".to_string(),
            action: "a".to_string(),
            payload: i.to_string(),
        }
    }

    fn envelope(id: &str) -> Vec<u8> {
        format!(
            r#"{{"params":{{"momoid":"{}","businessName":"b1","type":"click","body":{{"x":1}}}}}}"#,
            id
        )
        .into_bytes()
    }

    #[test]
    fn test_batcher_keeps_filling_item() {
        let mut batcher = Batcher::new(3);

        assert!(batcher.push(event(0)).is_none());
        assert!(batcher.push(event(1)).is_none());
        let full = batcher.push(event(2)).unwrap();
        assert_eq!(full.iter().map(|e| e.payload.as_str()).collect::<Vec<_>>(), vec!["0", "1", "2"]);

        assert_eq!(batcher.pending_len(), 0);
        assert!(batcher.push(event(3)).is_none());
        assert_eq!(batcher.take_pending().unwrap().len(), 1);
        assert!(batcher.take_pending().is_none());
    }

    #[test]
    fn test_batches_never_exceed_size() {
        let mut batcher = Batcher::new(7);
        let mut total = 0;
        for i in 0..100 {
            if let Some(batch) = batcher.push(event(i)) {
                assert_eq!(batch.len(), 7);
                total += batch.len();
            }
        }
        total += batcher.take_pending().map_or(0, |b| b.len());
        assert_eq!(total, 100);
    }

    #[test]
    fn test_zero_batch_size_clamped() {
        let mut batcher = Batcher::new(0);
        assert_eq!(batcher.push(event(0)).unwrap().len(), 1);
    }

    fn reader(queue: Arc<MemoryQueue>, batch_size: usize, depth: usize) -> (ShardReader, mpsc::Receiver<Batch>, CancellationToken) {
        let (tx, rx) = mpsc::channel(depth);
        let cancel = CancellationToken::new();
        let reader = ShardReader {
            business: "b1".to_string(),
            shard: "q".to_string(),
            queue,
            batcher: Batcher::new(batch_size),
            tx,
            empty_backoff: Duration::from_millis(100),
            cancel: cancel.clone(),
        };
        (reader, rx, cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_items_do_not_stall_reader() {
        let queue = Arc::new(MemoryQueue::new());
        queue.push("q", b"{").await.unwrap();
        queue.push("q", br#"{"params":{"businessName":"b1","type":"t","body":{}}}"#).await.unwrap();
        queue.push("q", &envelope("m1")).await.unwrap();
        queue.push("q", &envelope("m2")).await.unwrap();

        let (reader, mut rx, _cancel) = reader(Arc::clone(&queue), 2, 4);
        tokio::spawn(reader.run());

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].payload, "m1\tclick\t{\"x\":1,\"business_type\":\"b1\"}");
        assert!(batch[1].payload.starts_with("m2\t"));
        assert!(queue.is_empty("q"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_failure_reconnects_and_continues() {
        let queue = Arc::new(MemoryQueue::new());
        queue.fail_next_pops(2);
        queue.push("q", &envelope("m1")).await.unwrap();

        let (reader, mut rx, _cancel) = reader(Arc::clone(&queue), 1, 4);
        tokio::spawn(reader.run());

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(queue.reconnect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_channel_applies_backpressure() {
        let queue = Arc::new(MemoryQueue::new());
        for i in 0..5 {
            queue.push("q", &envelope(&format!("m{}", i))).await.unwrap();
        }

        // One slot: the reader can park one batch and must block on the second
        let (reader, mut rx, cancel) = reader(Arc::clone(&queue), 1, 1);
        let handle = tokio::spawn(reader.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        // First batch in the channel, second held by the blocked reader
        assert_eq!(queue.len("q"), 3);

        assert_eq!(rx.recv().await.unwrap()[0].payload.split('\t').next(), Some("m0"));
        cancel.cancel();
        // No workers: the shutdown flush gives up once the receiver is gone
        drop(rx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_flushes_partial_batch() {
        let queue = Arc::new(MemoryQueue::new());
        queue.push("q", &envelope("m1")).await.unwrap();

        let (reader, mut rx, cancel) = reader(Arc::clone(&queue), 10, 2);
        let handle = tokio::spawn(reader.run());

        tokio::time::sleep(Duration::from_millis(250)).await;
        cancel.cancel();
        handle.await.unwrap();

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(rx.recv().await.is_none());
    }
}
