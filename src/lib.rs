//! logpool - Forwards sharded queue logs to a pool of collectors

pub mod config;
pub mod core;
pub mod event;
pub mod lb;
pub mod pool;
pub mod queue;
pub mod source;

pub use core::Core;
pub use config::Config;
