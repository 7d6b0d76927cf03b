//! Collector client contract and the TCP line-protocol implementation
//!
//! A collector connection appends whole batches. The outcome of an append is
//! one of three explicit branches so callers never have to guess whether the
//! connection survived:
//!
//! - [`AppendOutcome::Delivered`]: the collector accepted the batch
//! - [`AppendOutcome::Rejected`]: the collector refused it, connection is fine
//! - [`AppendOutcome::Poisoned`]: the call faulted, connection must be discarded
//!
//! # TCP protocol
//!
//! For each batch the client writes one JSON object per event, one per line:
//!
//! ```text
//! {"headers":{"businessName":"orders","type":"click"},"body":"m1\tclick\t{...}"}
//! ```
//!
//! followed by an empty line. The collector answers a single line, `OK` when
//! the batch was accepted and anything else (an error message) otherwise.

use super::connection::PoolError;
use crate::event::Event;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

/// Result of appending a batch to a collector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Batch accepted
    Delivered,

    /// Collector returned an error; the connection can be reused
    Rejected(String),

    /// The call faulted mid-flight; the connection may be corrupted
    Poisoned(String),
}

/// A live connection to a log collector
#[async_trait]
pub trait CollectorConnection: Send {
    /// Append a batch of events
    async fn append_batch(&mut self, events: &[Event]) -> AppendOutcome;

    /// Address of the remote collector
    fn host_port(&self) -> &str;
}

/// Opens new collector connections for a pool
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn CollectorConnection>, PoolError>;

    fn host_port(&self) -> &str;
}

#[derive(Serialize)]
struct WireHeaders<'a> {
    #[serde(rename = "businessName")]
    business_name: &'a str,

    #[serde(rename = "type")]
    action: &'a str,
}

#[derive(Serialize)]
struct WireEvent<'a> {
    headers: WireHeaders<'a>,
    body: &'a str,
}

/// Encode a batch in the line protocol, including the terminating empty line
pub fn encode_batch(events: &[Event]) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::with_capacity(events.iter().map(|e| e.payload.len() + 64).sum::<usize>() + 1);
    for event in events {
        let wire = WireEvent {
            headers: WireHeaders {
                business_name: &event.business_name,
                action: &event.action,
            },
            body: &event.payload,
        };
        serde_json::to_writer(&mut buf, &wire)?;
        buf.push(b'\n');
    }
    buf.push(b'\n');
    Ok(buf)
}

/// Default deadline for one batch exchange (write plus reply)
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Connector for TCP line-protocol collectors
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host_port: String,
    request_timeout: Duration,
}

impl TcpConnector {
    pub fn new(host_port: impl Into<String>) -> Self {
        Self {
            host_port: host_port.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Bound each batch exchange on connections this connector opens
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn CollectorConnection>, PoolError> {
        let stream = TcpStream::connect(&self.host_port)
            .await
            .map_err(|e| PoolError::ConnectionFailed {
                endpoint: self.host_port.clone(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;

        debug!(endpoint = %self.host_port, "Connected to collector");

        Ok(Box::new(TcpCollector {
            stream: BufReader::new(stream),
            host_port: self.host_port.clone(),
            reply: String::new(),
            request_timeout: self.request_timeout,
        }))
    }

    fn host_port(&self) -> &str {
        &self.host_port
    }
}

/// A TCP line-protocol collector connection
pub struct TcpCollector {
    stream: BufReader<TcpStream>,
    host_port: String,
    reply: String,
    request_timeout: Duration,
}

impl TcpCollector {
    async fn exchange(&mut self, frame: &[u8]) -> AppendOutcome {
        if let Err(e) = self.stream.get_mut().write_all(frame).await {
            return AppendOutcome::Poisoned(format!("write failed: {}", e));
        }
        if let Err(e) = self.stream.get_mut().flush().await {
            return AppendOutcome::Poisoned(format!("flush failed: {}", e));
        }

        self.reply.clear();
        match self.stream.read_line(&mut self.reply).await {
            Ok(0) => AppendOutcome::Poisoned("collector closed the connection".to_string()),
            Ok(_) => {
                let reply = self.reply.trim_end();
                if reply == "OK" {
                    AppendOutcome::Delivered
                } else {
                    AppendOutcome::Rejected(reply.to_string())
                }
            }
            Err(e) => AppendOutcome::Poisoned(format!("read failed: {}", e)),
        }
    }
}

#[async_trait]
impl CollectorConnection for TcpCollector {
    async fn append_batch(&mut self, events: &[Event]) -> AppendOutcome {
        let frame = match encode_batch(events) {
            Ok(frame) => frame,
            // Nothing was written, the stream is still in sync
            Err(e) => return AppendOutcome::Rejected(format!("encode failed: {}", e)),
        };

        // A late reply would desync the stream, so a timeout poisons it
        match tokio::time::timeout(self.request_timeout, self.exchange(&frame)).await {
            Ok(outcome) => outcome,
            Err(_) => AppendOutcome::Poisoned(format!(
                "no reply within {:?}",
                self.request_timeout
            )),
        }
    }

    fn host_port(&self) -> &str {
        &self.host_port
    }
}
