//! Endpoint pool registry
//!
//! # Components
//!
//! - [`EndpointPoolLink`]: a named collector connection pool plus the set of
//!   business streams currently using it
//! - [`EndpointRegistry`]: the shared, mutex-guarded rotation of links
//!
//! # Selection
//!
//! Round-robin by rotation: take the link at the tail, move it to the head,
//! return it. The registry is shared by every business stream and every send
//! worker in the process.
//!
//! ```rust,no_run
//! use logpool::lb::{EndpointPoolLink, EndpointRegistry};
//! use logpool::pool::{ConnectionPool, PoolConfig, TcpConnector};
//! use std::sync::Arc;
//!
//! let links = ["10.0.0.1:61111", "10.0.0.2:61111"]
//!     .iter()
//!     .map(|addr| {
//!         let pool = ConnectionPool::new(*addr, Arc::new(TcpConnector::new(*addr)), PoolConfig::default());
//!         Arc::new(EndpointPoolLink::new(*addr, Arc::new(pool)))
//!     })
//!     .collect();
//!
//! let registry = EndpointRegistry::new(links);
//! registry.attach_business("orders");
//!
//! let link = registry.select().unwrap();
//! println!("sending via {}", link.pool.host_port());
//! ```

pub mod link;
pub mod registry;

pub use link::EndpointPoolLink;
pub use registry::EndpointRegistry;
