//! Business stream pipeline
//!
//! For every shard of a business stream:
//!
//! ```text
//! queue --pop--> ShardReader --decode/batch--> [bounded channel] --> N send workers --> collector pools
//! ```
//!
//! The bounded channel is the only backpressure path: when every worker is
//! busy and the channel is full, the reader blocks and the queue stops
//! draining.

pub mod monitor;
pub mod reader;
pub mod sender;
pub mod stream;

pub use monitor::{Monitor, MonitorDelta};
pub use reader::{Batcher, ShardReader};
pub use sender::{BatchSender, SendPolicy, SendReport};
pub use stream::{BusinessStream, StreamError, StreamOptions};

/// An ordered run of events, at most one batch size long
pub type Batch = Vec<crate::event::Event>;
