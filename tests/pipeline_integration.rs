//! Integration tests for the full forwarding pipeline
//!
//! These tests run business streams against in-memory queues and a local
//! TCP collector speaking the line protocol.

use logpool::event::Event;
use logpool::lb::{EndpointPoolLink, EndpointRegistry};
use logpool::pool::{ConnectionPool, PoolConfig, TcpConnector};
use logpool::queue::{MemoryQueue, QueueStore};
use logpool::source::{BatchSender, BusinessStream, Monitor, SendPolicy, StreamOptions};
use logpool::{Config, Core};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// Records every event line it receives and answers each batch with `reply`
struct MockCollector {
    addr: String,
    received: Arc<Mutex<Vec<Value>>>,
}

impl MockCollector {
    async fn start(reply: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let received = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&received);
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else { break };
                let sink = Arc::clone(&sink);
                tokio::spawn(async move {
                    let mut stream = BufReader::new(socket);
                    let mut line = String::new();
                    loop {
                        line.clear();
                        match stream.read_line(&mut line).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {}
                        }
                        if line.trim().is_empty() {
                            let answer = format!("{}\n", reply);
                            if stream.get_mut().write_all(answer.as_bytes()).await.is_err() {
                                break;
                            }
                        } else {
                            sink.lock().unwrap().push(serde_json::from_str(&line).unwrap());
                        }
                    }
                });
            }
        });

        Self { addr, received }
    }

    fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    async fn wait_for(&self, count: usize) -> Vec<Value> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let got = self.received();
                if got.len() >= count {
                    return got;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("collector did not receive enough events")
    }
}

fn registry(addrs: &[&str]) -> Arc<EndpointRegistry> {
    let links = addrs
        .iter()
        .map(|addr| {
            let pool = ConnectionPool::new(*addr, Arc::new(TcpConnector::new(*addr)), PoolConfig::default());
            Arc::new(EndpointPoolLink::new(*addr, Arc::new(pool)))
        })
        .collect();
    Arc::new(EndpointRegistry::new(links))
}

fn options(batch_size: usize) -> StreamOptions {
    StreamOptions {
        batch_size,
        channel_depth: 2,
        workers_per_shard: 2,
        empty_backoff: Duration::from_millis(10),
        grace_period: Duration::from_secs(2),
        send: SendPolicy {
            acquire_timeout: Duration::from_millis(500),
            ..SendPolicy::default()
        },
    }
}

fn envelope(id: &str, business: &str) -> Vec<u8> {
    format!(
        r#"{{"type":"log","params":{{"momoid":"{}","businessName":"{}","type":"click","body":{{"x":1}}}}}}"#,
        id, business
    )
    .into_bytes()
}

fn single_shard(queue: Arc<MemoryQueue>) -> BTreeMap<String, Vec<Arc<dyn QueueStore>>> {
    let mut shards: BTreeMap<String, Vec<Arc<dyn QueueStore>>> = BTreeMap::new();
    shards.insert("log:orders".to_string(), vec![queue as Arc<dyn QueueStore>]);
    shards
}

#[tokio::test]
async fn test_events_reach_collector_with_payload() {
    let collector = MockCollector::start("OK").await;
    let registry = registry(&[&collector.addr]);
    let queue = Arc::new(MemoryQueue::new());
    let stream = BusinessStream::new("orders", single_shard(Arc::clone(&queue)), Arc::clone(&registry), options(2));

    queue.push("log:orders", &envelope("m1", "orders")).await.unwrap();
    queue.push("log:orders", b"not json").await.unwrap();
    queue.push("log:orders", &envelope("m2", "orders")).await.unwrap();

    stream.start().unwrap();
    let got = collector.wait_for(2).await;
    stream.stop().await;

    assert_eq!(got[0]["headers"]["businessName"], "orders");
    assert_eq!(got[0]["headers"]["type"], "click");
    assert_eq!(got[0]["body"], "m1\tclick\t{\"x\":1,\"business_type\":\"orders\"}");
    assert!(got[1]["body"].as_str().unwrap().starts_with("m2\t"));

    // One full batch, counted by batch size
    assert_eq!(stream.totals(), (2, 0));
    let delta = stream.monitor();
    assert_eq!((delta.success, delta.failure), (2, 0));
    assert_eq!(stream.monitor().success, 0);

    for link in registry.links() {
        assert!(!link.is_attached("orders"));
    }
}

#[tokio::test]
async fn test_stop_flushes_partial_batch() {
    let collector = MockCollector::start("OK").await;
    let registry = registry(&[&collector.addr]);
    let queue = Arc::new(MemoryQueue::new());
    let stream = BusinessStream::new("orders", single_shard(Arc::clone(&queue)), registry, options(100));

    for i in 0..3 {
        queue.push("log:orders", &envelope(&format!("m{}", i), "orders")).await.unwrap();
    }

    stream.start().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(collector.received().is_empty());

    stream.stop().await;

    assert_eq!(collector.received().len(), 3);
    assert!(queue.is_empty("log:orders"));
}

#[tokio::test]
async fn test_rejections_counted_and_batch_dropped() {
    let collector = MockCollector::start("ERR channel full").await;
    let registry = registry(&[&collector.addr]);
    let queue = Arc::new(MemoryQueue::new());
    let stream = BusinessStream::new("orders", single_shard(Arc::clone(&queue)), registry, options(1));

    queue.push("log:orders", &envelope("m1", "orders")).await.unwrap();

    stream.start().unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while stream.totals().1 < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    stream.stop().await;

    // Three attempts, each rejected, each counted by batch size
    assert_eq!(stream.totals(), (0, 3));
}

#[tokio::test]
async fn test_batches_spread_across_collectors() {
    let first = MockCollector::start("OK").await;
    let second = MockCollector::start("OK").await;
    let registry = registry(&[&first.addr, &second.addr]);
    let queue = Arc::new(MemoryQueue::new());
    let stream = BusinessStream::new("orders", single_shard(Arc::clone(&queue)), registry, options(1));

    for i in 0..10 {
        queue.push("log:orders", &envelope(&format!("m{}", i), "orders")).await.unwrap();
    }

    stream.start().unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while first.received().len() + second.received().len() < 10 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    stream.stop().await;

    // Strict rotation with no failures splits evenly
    assert_eq!(first.received().len(), 5);
    assert_eq!(second.received().len(), 5);
}

#[tokio::test]
async fn test_core_runs_several_streams() {
    let collector = MockCollector::start("OK").await;
    let registry = registry(&[&collector.addr]);

    let orders_queue = Arc::new(MemoryQueue::new());
    let chat_queue = Arc::new(MemoryQueue::new());
    let orders = Arc::new(BusinessStream::new(
        "orders",
        single_shard(Arc::clone(&orders_queue)),
        Arc::clone(&registry),
        options(1),
    ));
    let chat = Arc::new(BusinessStream::new(
        "chat",
        single_shard(Arc::clone(&chat_queue)),
        Arc::clone(&registry),
        options(1),
    ));

    let core = Core::from_parts(Config::default(), Arc::clone(&registry), vec![orders, chat]);
    core.push("orders", "log:orders", &envelope("o1", "orders")).await.unwrap();
    core.push("chat", "log:orders", &envelope("c1", "chat")).await.unwrap();

    core.start_all().unwrap();
    collector.wait_for(2).await;
    core.stop_all().await;

    let deltas: BTreeMap<_, _> = core.monitor_all().into_iter().collect();
    assert_eq!(deltas["orders"].success, 1);
    assert_eq!(deltas["chat"].success, 1);

    for link in registry.links() {
        assert!(link.businesses_snapshot().is_empty());
    }
}

#[tokio::test]
async fn test_silent_collector_does_not_pin_sender() {
    // Accepts every connection and never answers
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let connector = TcpConnector::new(addr.clone()).with_request_timeout(Duration::from_millis(100));
    let pool = ConnectionPool::new(addr.clone(), Arc::new(connector), PoolConfig::default());
    let link = Arc::new(EndpointPoolLink::new(addr, Arc::new(pool)));
    let registry = Arc::new(EndpointRegistry::new(vec![Arc::clone(&link)]));

    let monitor = Arc::new(Monitor::new());
    let sender = BatchSender::new("orders", 1, registry, Arc::clone(&monitor), SendPolicy::default());
    let events = vec![Event {
        business_name: "orders".to_string(),
        action: "click".to_string(),
        payload: "m1\tclick\t{}".to_string(),
    }];

    let report = tokio::time::timeout(Duration::from_secs(5), sender.send_with_retry(&events))
        .await
        .expect("send_with_retry hung on a silent collector");

    assert!(!report.delivered);
    assert_eq!(report.attempts, 3);
    // Timeouts poison the connection: discarded, never counted
    assert_eq!(monitor.totals(), (0, 0));
    assert_eq!(link.pool.stats().total_broken, 3);
}
