//! Broker access: connection management and typed job operations.
//!
//! Disque nodes speak the Redis protocol, so commands are sent with the
//! `redis` crate over a multiplexed connection to one active node.
//!
//! # Architecture
//!
//! ```text
//!   JobGateway ──► BrokerConnection ──► active Node ──► Disque
//!   (ADDJOB,        (retry, failover,    (HELLO id,
//!    GETJOB, ...)    single reconnect)    channel)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use disq::broker::{AddJobOptions, BrokerConnection, GetJobOptions, JobGateway};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let connection = BrokerConnection::open(
//!     &["localhost:7712", "localhost:7711"],
//!     Duration::from_secs(5),
//!     2,
//! )
//! .await?;
//! let gateway = JobGateway::new(Arc::new(connection));
//!
//! let id = gateway.add_job("test", b"hello", &AddJobOptions::default()).await?;
//! let options = GetJobOptions::default().with_timeout(Duration::from_secs(5));
//! for job in gateway.get_jobs(&["test".to_string()], &options).await? {
//!     gateway.ack_job(&[job.id]).await?;
//! }
//! ```

pub mod command;
pub mod connection;
pub mod gateway;
pub mod memory;

pub use command::Command;
pub use connection::{
    BrokerConnection, CommandChannel, Connector, Node, NodeAddress, RedisConnector,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_RETRIES,
};
pub use gateway::{
    AddJobOptions, GetJobOptions, Job, JobGateway, JobState, DEFAULT_ADD_TIMEOUT_MS,
    DEFAULT_RETRY_SECS, DEFAULT_SCAN_PAGE, DEFAULT_TTL_SECS,
};
pub use memory::MemoryBroker;
