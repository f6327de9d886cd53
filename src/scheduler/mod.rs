//! Worker scheduling: polling loops and the strategies that run them.
//!
//! - **Worker**: one loop of admission, fetch, dispatch, execute, acknowledge
//! - **QueueAdmission**: per-queue `max_workers` limits
//! - **WorkerPool**: starts and stops workers with an `ExecutionModel`
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │    Disque    │
//!                      │    queues    │
//!                      └──────┬───────┘
//!                             │ GETJOB / ACKJOB
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └─────────┘         └─────────┘         └─────────┘
//!     thread / coroutine / child process (+ nested workers)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use disq::scheduler::{ExecutionModel, WorkerPool, WorkerPoolConfig};
//! use std::sync::Arc;
//!
//! let config = WorkerPoolConfig::new(ExecutionModel::Coroutine, 4);
//! let mut pool = WorkerPool::new(config, Arc::new(manager))?;
//! pool.start().await?;
//!
//! tokio::signal::ctrl_c().await?;
//! pool.shutdown().await?;
//! ```
//!
//! # Delivery
//!
//! Jobs are acknowledged only after their handler returns. A failed,
//! panicking or undecodable job stays unacknowledged and the broker delivers
//! it again once its retry period expires.

pub mod admission;
pub mod stats;
pub mod strategy;
pub mod worker;
pub mod worker_pool;

pub use admission::{Admitted, QueueAdmission};
pub use stats::{BusyGuard, Disposition, PoolStats, SharedPoolStats};
pub use strategy::{ExecutionModel, NestedModel, ProcessCommand, WorkerHandle};
pub use worker::{JobOutcome, LoopSettings, Worker, WorkerState};
pub use worker_pool::{PoolError, WorkerPool, WorkerPoolConfig};
