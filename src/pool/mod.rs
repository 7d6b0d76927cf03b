//! Collector connection pooling
//!
//! This module provides:
//! - The collector client contract ([`CollectorConnection`], [`Connector`])
//! - A TCP line-protocol collector ([`TcpConnector`])
//! - Bounded per-endpoint pools with acquire-with-timeout and broken-connection discard

pub mod collector;
pub mod connection;

pub use collector::{AppendOutcome, CollectorConnection, Connector, TcpCollector, TcpConnector};
pub use connection::{ConnectionPool, PoolConfig, PoolError, PoolStats, PooledConnection};
