//! Worker pool running the workers of one task manager.
//!
//! The pool starts `concurrency` workers with the configured execution
//! strategy and stops them with a broadcast shutdown signal.
//!
//! # Features
//!
//! - Thread, coroutine and process execution strategies
//! - Nested strategy inside each child of a process pool
//! - Per-queue admission shared by all in-process workers
//! - Graceful shutdown with a timeout
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;

use super::admission::QueueAdmission;
use super::stats::{PoolStats, SharedPoolStats};
use super::strategy::{
    spawn_coroutines, spawn_processes, spawn_threads, ExecutionModel, NestedModel,
    ProcessCommand, SpawnContext, WorkerHandle,
};
use super::worker::LoopSettings;
use crate::error::ConfigError;
use crate::manager::TaskManager;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Worker initialization failed.
    #[error("Worker initialization failed: {0}")]
    WorkerInitFailed(String),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Strategy running the workers.
    pub model: ExecutionModel,
    /// Number of workers (or child processes for the process model).
    pub concurrency: usize,
    /// Strategy inside each child process.
    pub nested: Option<NestedModel>,
    /// Number of workers inside each child process.
    pub nested_concurrency: usize,
    /// Blocking timeout of each fetch.
    pub fetch_timeout: Duration,
    /// Jobs requested per fetch.
    pub fetch_count: u32,
    /// Wait between iterations when nothing is admissible.
    pub poll_interval: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        let settings = LoopSettings::default();
        Self {
            model: ExecutionModel::Thread,
            concurrency: 1,
            nested: None,
            nested_concurrency: 1,
            fetch_timeout: settings.fetch_timeout,
            fetch_count: settings.fetch_count,
            poll_interval: settings.poll_interval,
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a configuration with `concurrency` workers of `model`.
    pub fn new(model: ExecutionModel, concurrency: usize) -> Self {
        Self {
            model,
            concurrency,
            ..Default::default()
        }
    }

    /// Sets the strategy and worker count inside each child process.
    pub fn with_nested(mut self, nested: NestedModel, concurrency: usize) -> Self {
        self.nested = Some(nested);
        self.nested_concurrency = concurrency;
        self
    }

    /// Sets the fetch timeout.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Sets the number of jobs requested per fetch.
    pub fn with_fetch_count(mut self, count: u32) -> Self {
        self.fetch_count = count;
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::NestedRequiresProcess` if a nested strategy is
    /// set for a model other than `process`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nested.is_some() && self.model != ExecutionModel::Process {
            return Err(ConfigError::NestedRequiresProcess(self.model.to_string()));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "concurrency must be greater than 0".to_string(),
            ));
        }
        if self.nested_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "subconcurrency must be greater than 0".to_string(),
            ));
        }
        if self.fetch_count == 0 {
            return Err(ConfigError::ValidationFailed(
                "fetch_count must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            fetch_timeout: self.fetch_timeout,
            fetch_count: self.fetch_count,
            poll_interval: self.poll_interval,
        }
    }
}

/// Worker pool that runs workers for a task manager.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    manager: Arc<TaskManager>,
    admission: Arc<QueueAdmission>,
    process_command: Option<ProcessCommand>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<WorkerHandle>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a worker pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Config` if the configuration is invalid.
    pub fn new(config: WorkerPoolConfig, manager: Arc<TaskManager>) -> Result<Self, PoolError> {
        config.validate()?;

        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            admission: Arc::new(QueueAdmission::for_manager(&manager)),
            config,
            manager,
            process_command: None,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        })
    }

    /// Sets the command starting each child of a process pool.
    pub fn with_process_command(mut self, command: ProcessCommand) -> Self {
        self.process_command = Some(command);
        self
    }

    /// Starts all workers in the pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running and
    /// `PoolError::WorkerInitFailed` if a worker cannot be started.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        let ctx = SpawnContext {
            manager: &self.manager,
            admission: &self.admission,
            shutdown_tx: &self.shutdown_tx,
            stats: &self.stats,
            settings: self.config.loop_settings(),
        };

        let handles = match self.config.model {
            ExecutionModel::Coroutine => spawn_coroutines(&ctx, self.config.concurrency),
            ExecutionModel::Thread => spawn_threads(&ctx, self.config.concurrency)?,
            ExecutionModel::Process => {
                let command = self.process_command.as_ref().ok_or_else(|| {
                    PoolError::WorkerInitFailed(
                        "process workers need a child command".to_string(),
                    )
                })?;
                spawn_processes(command, self.config.concurrency)?
            }
        };
        self.worker_handles = handles;

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            model = %self.config.model,
            concurrency = self.config.concurrency,
            queues = ?self.manager.queues(),
            "Worker pool started"
        );

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Every worker finishes its current job. Child processes are asked to
    /// stop and are killed only if they outlive the shutdown timeout; their
    /// unacknowledged jobs are then redelivered by the broker.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let grace = self.config.shutdown_timeout;
        let stopped = join_all(self.worker_handles.drain(..).map(|h| h.stop(grace))).await;
        self.is_running.store(false, Ordering::SeqCst);

        if stopped.iter().all(|s| *s) {
            info!("Worker pool shutdown complete");
            Ok(())
        } else {
            Err(PoolError::ShutdownTimeout(grace))
        }
    }

    /// Returns current pool statistics.
    ///
    /// Jobs handled inside child processes are not counted here.
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot(self.num_workers())
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of in-process workers.
    pub fn num_workers(&self) -> usize {
        match self.config.model {
            ExecutionModel::Process => 0,
            _ => self.config.concurrency,
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<TaskManager> {
        &self.manager
    }
}
