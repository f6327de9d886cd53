//! Execution strategies: how a pool runs its workers.
//!
//! - `Thread`: one OS thread per worker, each driving its worker on its own
//!   current-thread runtime. All threads share the process's task manager
//!   and therefore its broker connection.
//! - `Coroutine`: one task per worker on the calling runtime.
//! - `Process`: one child process per worker, each running its own pool
//!   (optionally with a nested thread or coroutine strategy) and its own
//!   broker connection. A child stops when its stdin is closed.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::admission::QueueAdmission;
use super::stats::SharedPoolStats;
use super::worker::{LoopSettings, Worker};
use super::worker_pool::PoolError;
use crate::manager::TaskManager;

/// Strategy running the workers of a pool.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionModel {
    #[default]
    Thread,
    Process,
    Coroutine,
}

impl ExecutionModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thread => "thread",
            Self::Process => "process",
            Self::Coroutine => "coroutine",
        }
    }
}

impl fmt::Display for ExecutionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "thread" => Ok(Self::Thread),
            "process" => Ok(Self::Process),
            "coroutine" => Ok(Self::Coroutine),
            other => Err(format!("unknown worker model '{}'", other)),
        }
    }
}

/// Strategy running inside each child of a process pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NestedModel {
    Thread,
    Coroutine,
}

impl NestedModel {
    pub fn model(self) -> ExecutionModel {
        match self {
            Self::Thread => ExecutionModel::Thread,
            Self::Coroutine => ExecutionModel::Coroutine,
        }
    }
}

impl fmt::Display for NestedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.model().as_str())
    }
}

/// Program and arguments that start one child worker process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Runs the current executable with `args`.
    pub fn current_exe(args: Vec<String>) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, args))
    }
}

/// A running worker of any strategy.
#[derive(Debug)]
pub enum WorkerHandle {
    Task(JoinHandle<()>),
    Thread(std::thread::JoinHandle<()>),
    Process(tokio::process::Child),
}

impl WorkerHandle {
    /// Waits up to `grace` for the worker to stop and reports whether it did.
    ///
    /// In-process workers are expected to have been signalled already. A
    /// child process is asked to stop by closing its stdin and is killed
    /// only when it outlives `grace`.
    pub async fn stop(self, grace: Duration) -> bool {
        match self {
            Self::Task(handle) => match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    error!(error = %e, "Worker task panicked during shutdown");
                    true
                }
                Err(_) => false,
            },
            Self::Thread(handle) => {
                let joined = tokio::task::spawn_blocking(move || handle.join());
                match tokio::time::timeout(grace, joined).await {
                    Ok(Ok(Ok(()))) => true,
                    Ok(Ok(Err(_))) => {
                        error!("Worker thread panicked during shutdown");
                        true
                    }
                    Ok(Err(e)) => {
                        error!(error = %e, "Failed to join worker thread");
                        true
                    }
                    Err(_) => false,
                }
            }
            Self::Process(mut child) => {
                let pid = child.id();
                drop(child.stdin.take());

                if let Ok(waited) = tokio::time::timeout(grace, child.wait()).await {
                    match waited {
                        Ok(status) => info!(pid = ?pid, status = %status, "Worker process exited"),
                        Err(e) => error!(pid = ?pid, error = %e, "Failed to wait for worker process"),
                    }
                    return true;
                }

                warn!(pid = ?pid, grace_secs = grace.as_secs_f64(), "Worker process did not stop, killing it");
                if let Err(e) = child.start_kill() {
                    warn!(pid = ?pid, error = %e, "Failed to kill worker process");
                }
                if let Err(e) = child.wait().await {
                    error!(pid = ?pid, error = %e, "Failed to wait for worker process");
                }
                false
            }
        }
    }
}

/// Everything an in-process worker needs.
pub(crate) struct SpawnContext<'a> {
    pub manager: &'a Arc<TaskManager>,
    pub admission: &'a Arc<QueueAdmission>,
    pub shutdown_tx: &'a broadcast::Sender<()>,
    pub stats: &'a Arc<SharedPoolStats>,
    pub settings: LoopSettings,
}

impl SpawnContext<'_> {
    fn worker(&self, id: String) -> Worker {
        Worker::new(
            id,
            Arc::clone(self.manager),
            Arc::clone(self.admission),
            self.shutdown_tx.subscribe(),
            self.settings,
            Arc::clone(self.stats),
        )
    }
}

pub(crate) fn spawn_coroutines(ctx: &SpawnContext<'_>, count: usize) -> Vec<WorkerHandle> {
    (0..count)
        .map(|i| {
            let worker = ctx.worker(format!("coroutine-{}", i));
            WorkerHandle::Task(tokio::spawn(worker.run()))
        })
        .collect()
}

pub(crate) fn spawn_threads(
    ctx: &SpawnContext<'_>,
    count: usize,
) -> Result<Vec<WorkerHandle>, PoolError> {
    let mut handles = Vec::with_capacity(count);
    for i in 0..count {
        let id = format!("thread-{}", i);
        let worker = ctx.worker(id.clone());
        let handle = std::thread::Builder::new()
            .name(id.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(worker_id = %id, error = %e, "Failed to build worker runtime");
                        return;
                    }
                };
                runtime.block_on(worker.run());
            })
            .map_err(|e| PoolError::WorkerInitFailed(e.to_string()))?;
        handles.push(WorkerHandle::Thread(handle));
    }
    Ok(handles)
}

pub(crate) fn spawn_processes(
    command: &ProcessCommand,
    count: usize,
) -> Result<Vec<WorkerHandle>, PoolError> {
    let mut handles = Vec::with_capacity(count);
    for i in 0..count {
        let child = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .env("DISQ_WORKER_INDEX", i.to_string())
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PoolError::WorkerInitFailed(format!(
                    "failed to start {}: {}",
                    command.program.display(),
                    e
                ))
            })?;
        info!(index = i, pid = ?child.id(), "Worker process started");
        handles.push(WorkerHandle::Process(child));
    }
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_names() {
        assert_eq!("thread".parse::<ExecutionModel>(), Ok(ExecutionModel::Thread));
        assert_eq!("Process".parse::<ExecutionModel>(), Ok(ExecutionModel::Process));
        assert_eq!(
            "coroutine".parse::<ExecutionModel>(),
            Ok(ExecutionModel::Coroutine)
        );
        assert!("fiber".parse::<ExecutionModel>().is_err());
        assert_eq!(ExecutionModel::default(), ExecutionModel::Thread);
        assert_eq!(NestedModel::Coroutine.to_string(), "coroutine");
    }

    fn shell(script: &str) -> ProcessCommand {
        ProcessCommand::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_stopping_on_closed_stdin_is_not_killed() {
        let mut handles = spawn_processes(&shell("cat > /dev/null"), 2).expect("spawn");
        assert_eq!(handles.len(), 2);
        for handle in handles.drain(..) {
            assert!(handle.stop(Duration::from_secs(10)).await);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_outliving_grace_is_killed() {
        let mut handles = spawn_processes(&shell("exec sleep 30"), 1).expect("spawn");
        let started = std::time::Instant::now();
        let handle = handles.pop().expect("one child");
        assert!(!handle.stop(Duration::from_millis(100)).await);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_task_stop_reports_timeout() {
        let finished = WorkerHandle::Task(tokio::spawn(async {}));
        assert!(finished.stop(Duration::from_secs(1)).await);

        let stuck = WorkerHandle::Task(tokio::spawn(std::future::pending::<()>()));
        assert!(!stuck.stop(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let command = ProcessCommand::new("/nonexistent/disq-worker", Vec::new());
        let err = spawn_processes(&command, 1).expect_err("no such program");
        assert!(matches!(err, PoolError::WorkerInitFailed(_)));
    }
}
