//! A single worker: poll, dispatch, execute, acknowledge.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{broadcast, OwnedSemaphorePermit};
use tracing::{debug, error, info, trace};

use super::admission::QueueAdmission;
use super::stats::{Disposition, SharedPoolStats};
use crate::broker::{GetJobOptions, Job};
use crate::error::TaskError;
use crate::manager::TaskManager;

/// Where a worker is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Nothing admissible; waiting one poll interval.
    Idle,
    /// Waiting on `GETJOB`.
    Polling,
    /// Decoding a job and looking up its handler.
    Dispatching,
    /// Running a handler.
    Executing,
    /// Acknowledging a completed job.
    Acknowledging,
    /// Shut down.
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Polling => "polling",
            Self::Dispatching => "dispatching",
            Self::Executing => "executing",
            Self::Acknowledging => "acknowledging",
            Self::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Timing parameters of the worker loop.
#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    /// Blocking timeout of each `GETJOB`.
    pub fetch_timeout: Duration,
    /// Jobs requested per `GETJOB` when no admitted queue is limited.
    pub fetch_count: u32,
    /// Wait before the next iteration when nothing is admissible or the broker failed.
    pub poll_interval: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(1),
            fetch_count: 1,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// How a single job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The handler returned and the job was acknowledged.
    Completed(Value),
    /// The handler failed; the job stays unacknowledged for redelivery.
    Failed(String),
    /// The payload is undecodable or names no registered task.
    Rejected(String),
}

/// A single worker pulling jobs for one task manager.
pub struct Worker {
    id: String,
    manager: Arc<TaskManager>,
    admission: Arc<QueueAdmission>,
    shutdown_rx: broadcast::Receiver<()>,
    settings: LoopSettings,
    stats: Arc<SharedPoolStats>,
    state: WorkerState,
    /// Set when the shutdown signal was consumed while idling.
    stop_requested: bool,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        manager: Arc<TaskManager>,
        admission: Arc<QueueAdmission>,
        shutdown_rx: broadcast::Receiver<()>,
        settings: LoopSettings,
        stats: Arc<SharedPoolStats>,
    ) -> Self {
        Self {
            id: id.into(),
            manager,
            admission,
            shutdown_rx,
            settings,
            stats,
            state: WorkerState::Idle,
            stop_requested: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Main worker loop.
    ///
    /// Runs until a shutdown signal is received. The signal is observed
    /// between iterations, so a job being executed always runs to the end.
    pub async fn run(mut self) {
        info!(worker_id = %self.id, queues = ?self.manager.queues(), "Worker started");

        loop {
            if self.stop_requested {
                info!(worker_id = %self.id, "Worker received shutdown signal");
                break;
            }
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.poll_once().await {
                Ok(0) | Err(_) => {}
                Ok(processed) => {
                    trace!(worker_id = %self.id, processed = processed, "Iteration done");
                }
            }
        }

        self.transition(WorkerState::Stopped);
        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Runs one iteration: admission, fetch, then every fetched job.
    ///
    /// Returns the number of jobs processed. Waits one poll interval when
    /// nothing is admissible or the broker fails.
    pub async fn poll_once(&mut self) -> Result<usize, crate::error::BrokerError> {
        let mut admitted = match self.admission.admit(&self.manager).await {
            Ok(admitted) => admitted,
            Err(e) => {
                error!(worker_id = %self.id, error = %e, "Failed to check queue capacity");
                self.idle().await;
                return Err(e);
            }
        };

        if admitted.is_empty() {
            debug!(worker_id = %self.id, "No admissible queue");
            self.idle().await;
            return Ok(0);
        }

        self.transition(WorkerState::Polling);
        let count = if admitted.has_limited() {
            1
        } else {
            self.settings.fetch_count
        };
        let options = GetJobOptions::default()
            .with_timeout(self.settings.fetch_timeout)
            .with_count(count);

        let jobs = match self.manager.gateway().get_jobs(admitted.queues(), &options).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(worker_id = %self.id, error = %e, "Failed to fetch jobs");
                drop(admitted);
                self.idle().await;
                return Err(e);
            }
        };

        let processed = jobs.len();
        let mut fetched = Vec::with_capacity(processed);
        for job in jobs {
            let permit = admitted.take_permit(&job.queue);
            fetched.push((job, permit));
        }
        // release slots of limited queues that yielded nothing
        drop(admitted);

        for (job, permit) in fetched {
            self.process_job(job, permit).await;
        }
        Ok(processed)
    }

    /// Decodes, executes and acknowledges one job.
    ///
    /// Failures are logged and the job is left unacknowledged.
    pub async fn process_job(&mut self, job: Job, permit: Option<OwnedSemaphorePermit>) -> JobOutcome {
        self.transition(WorkerState::Dispatching);
        let busy = self.stats.begin_job();
        let started = Instant::now();

        let outcome = self.execute(&job).await;

        let disposition = match &outcome {
            JobOutcome::Completed(_) => {
                self.transition(WorkerState::Acknowledging);
                match self.manager.gateway().ack_job(&[job.id.clone()]).await {
                    Ok(_) => Disposition::Acked,
                    Err(e) => {
                        error!(
                            worker_id = %self.id,
                            job_id = %job.id,
                            error = %e,
                            "Failed to acknowledge job"
                        );
                        Disposition::AckFailed
                    }
                }
            }
            JobOutcome::Failed(_) => Disposition::Failed,
            JobOutcome::Rejected(_) => Disposition::Rejected,
        };
        self.stats.record(disposition, started.elapsed());

        drop(busy);
        drop(permit);
        outcome
    }

    async fn execute(&mut self, job: &Job) -> JobOutcome {
        let invocation = match self.manager.decode(&job.payload) {
            Ok(invocation) => invocation,
            Err(e) => {
                error!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    queue = %job.queue,
                    error = %e,
                    "Dropping undecodable job"
                );
                return JobOutcome::Rejected(e.to_string());
            }
        };

        self.transition(WorkerState::Executing);
        let task = invocation.task.clone();
        let args = Value::Array(invocation.args.clone());
        let kwargs = Value::Object(invocation.kwargs.clone());

        let started = Instant::now();
        let call = self
            .manager
            .run(&invocation.task, invocation.args, invocation.kwargs);
        let result = AssertUnwindSafe(call).catch_unwind().await;
        let seconds = started.elapsed().as_secs_f64();

        let failure = match result {
            Ok(Ok(value)) => {
                info!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    task = %task,
                    "job {}(*{}, **{}) executed in {:.6} seconds, returns {}",
                    task,
                    args,
                    kwargs,
                    seconds,
                    value
                );
                return JobOutcome::Completed(value);
            }
            Ok(Err(TaskError::UnknownTask(name))) => {
                error!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    task = %name,
                    "Dropping job for unregistered task"
                );
                return JobOutcome::Rejected(format!("task '{}' is not registered", name));
            }
            Ok(Err(e)) => format!("{:#}", anyhow::Error::from(e)),
            Err(panic) => panic_message(panic.as_ref()),
        };

        error!(
            worker_id = %self.id,
            job_id = %job.id,
            task = %task,
            error = %failure,
            "executing {}(*{}, **{}) failed",
            task,
            args,
            kwargs
        );
        JobOutcome::Failed(failure)
    }

    async fn idle(&mut self) {
        self.transition(WorkerState::Idle);
        let poll_interval = self.settings.poll_interval;
        let signalled = tokio::select! {
            _ = tokio::time::sleep(poll_interval) => false,
            _ = self.shutdown_rx.recv() => true,
        };
        if signalled {
            self.stop_requested = true;
        }
    }

    fn transition(&mut self, state: WorkerState) {
        if self.state != state {
            trace!(worker_id = %self.id, from = %self.state, to = %state, "Worker state");
            self.state = state;
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{AddJobOptions, BrokerConnection, JobGateway, MemoryBroker, NodeAddress};
    use crate::config::TaskOptions;
    use crate::envelope::TaskCall;
    use crate::registry::handler_fn;
    use serde_json::json;

    struct Fixture {
        broker: MemoryBroker,
        manager: Arc<TaskManager>,
        stats: Arc<SharedPoolStats>,
        shutdown_tx: broadcast::Sender<()>,
    }

    impl Fixture {
        fn new() -> Self {
            let broker = MemoryBroker::new();
            let connection = BrokerConnection::new(
                vec![NodeAddress::new("mem", 7711)],
                Arc::new(broker.clone()),
            );
            let mut manager = TaskManager::new(Arc::new(JobGateway::new(Arc::new(connection))));
            manager
                .register(
                    "add",
                    handler_fn(|args, _| {
                        Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
                    }),
                    TaskOptions::new(),
                )
                .expect("register");
            manager
                .register(
                    "fail",
                    handler_fn(|_, _| anyhow::bail!("always fails")),
                    TaskOptions::new(),
                )
                .expect("register");
            manager
                .register(
                    "explode",
                    handler_fn(|_, _| panic!("handler panicked")),
                    TaskOptions::new(),
                )
                .expect("register");

            let (shutdown_tx, _) = broadcast::channel(1);
            Self {
                broker,
                manager: Arc::new(manager),
                stats: Arc::new(SharedPoolStats::new()),
                shutdown_tx,
            }
        }

        fn worker(&self) -> Worker {
            Worker::new(
                "worker-0",
                Arc::clone(&self.manager),
                Arc::new(QueueAdmission::for_manager(&self.manager)),
                self.shutdown_tx.subscribe(),
                LoopSettings {
                    fetch_timeout: Duration::from_millis(20),
                    fetch_count: 1,
                    poll_interval: Duration::from_millis(20),
                },
                Arc::clone(&self.stats),
            )
        }

        async fn submit(&self, task: &str) -> String {
            let call = TaskCall::new()
                .arg(1)
                .and_then(|c| c.arg(2))
                .expect("serializable");
            self.manager
                .delay(task, call)
                .await
                .expect("submit")
                .job_id()
                .expect("submitted")
                .to_string()
        }
    }

    #[tokio::test]
    async fn test_successful_job_is_acknowledged() {
        let fixture = Fixture::new();
        let job_id = fixture.submit("add").await;
        let mut worker = fixture.worker();

        assert_eq!(worker.poll_once().await.expect("poll"), 1);
        assert_eq!(fixture.broker.ack_count(&job_id), 1);
        assert_eq!(fixture.manager.gateway().qlen("add").await.expect("qlen"), 0);
        assert_eq!(worker.state(), WorkerState::Acknowledging);

        assert_eq!(worker.poll_once().await.expect("poll"), 0);
        let stats = fixture.stats.snapshot(1);
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.busy_workers, 0);
    }

    #[tokio::test]
    async fn test_failed_job_is_not_acknowledged() {
        let fixture = Fixture::new();
        let job_id = fixture.submit("fail").await;
        let mut worker = fixture.worker();

        assert_eq!(worker.poll_once().await.expect("poll"), 1);
        assert_eq!(fixture.broker.ack_count(&job_id), 0);
        assert_eq!(fixture.broker.active_count("fail"), 1);
        let stats = fixture.stats.snapshot(1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.unacknowledged(), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let fixture = Fixture::new();
        let job_id = fixture.submit("explode").await;
        let mut worker = fixture.worker();

        let jobs = fixture
            .manager
            .gateway()
            .get_jobs(
                &["explode".to_string()],
                &GetJobOptions::default().with_timeout(Duration::from_millis(10)),
            )
            .await
            .expect("fetch");
        let outcome = worker
            .process_job(jobs.into_iter().next().expect("one job"), None)
            .await;

        assert!(matches!(outcome, JobOutcome::Failed(ref m) if m.contains("handler panicked")));
        assert_eq!(fixture.broker.ack_count(&job_id), 0);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_not_acknowledged() {
        let fixture = Fixture::new();
        let job_id = fixture
            .manager
            .gateway()
            .add_job("add", b"not an envelope", &AddJobOptions::default())
            .await
            .expect("add");
        let mut worker = fixture.worker();

        assert_eq!(worker.poll_once().await.expect("poll"), 1);
        assert_eq!(fixture.broker.ack_count(&job_id), 0);
        let stats = fixture.stats.snapshot(1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_acknowledged() {
        let fixture = Fixture::new();
        let payload = br#"["missing", [], {}]"#;
        let job_id = fixture
            .manager
            .gateway()
            .add_job("add", payload, &AddJobOptions::default())
            .await
            .expect("add");
        let mut worker = fixture.worker();

        assert_eq!(worker.poll_once().await.expect("poll"), 1);
        assert_eq!(fixture.broker.ack_count(&job_id), 0);
        assert_eq!(fixture.stats.snapshot(1).rejected, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let fixture = Fixture::new();
        let worker = fixture.worker();
        let handle = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        fixture.shutdown_tx.send(()).expect("worker subscribed");

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker stops in time")
            .expect("worker task does not panic");
    }
}
