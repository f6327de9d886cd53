//! disq: a distributed task queue on top of Disque.
//!
//! Register handlers under task names, submit invocations as broker jobs and
//! run workers that fetch, execute and acknowledge them.

// Core modules
pub mod app;
pub mod broker;
pub mod cli;
pub mod config;
pub mod envelope;
pub mod error;
pub mod manager;
pub mod registry;
pub mod scheduler;

// Re-export commonly used types
pub use config::{ClientSettings, TaskOptions};
pub use envelope::TaskCall;
pub use error::{BrokerError, CodecError, ConfigError, Error, TaskError};
pub use manager::{Invocation, TaskManager};
pub use registry::{async_handler_fn, handler_fn, TaskHandler};
