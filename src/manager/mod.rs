//! Task manager: the user-facing entry point.
//!
//! A `TaskManager` ties the registry, the option overlay, the envelope codec
//! and the job gateway together. Callers register handlers under a name and
//! invoke them by name; an invocation either runs in-process (debug mode) or
//! is submitted to the broker for a worker to pick up.
//!
//! # Example
//!
//! ```rust,ignore
//! use disq::config::{ClientSettings, TaskOptions};
//! use disq::envelope::TaskCall;
//! use disq::manager::TaskManager;
//! use disq::registry::handler_fn;
//!
//! let mut manager = TaskManager::connect(&ClientSettings::from_env()?).await?;
//! manager.register("add", handler_fn(|args, _| Ok((args[0].as_i64().unwrap_or(0) + 1).into())), TaskOptions::new())?;
//!
//! let invocation = manager
//!     .invoke("add", TaskCall::new().arg(41)?, &TaskOptions::new().with_delay(5))
//!     .await?;
//! println!("submitted {:?}", invocation.job_id());
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::broker::{BrokerConnection, JobGateway, JobState, DEFAULT_SCAN_PAGE};
use crate::config::{ClientSettings, TaskConfig, TaskOptions};
use crate::envelope::{EnvelopeCodec, JobInvocation, JsonCodec, TaskCall};
use crate::error::{BrokerError, CodecError, ConfigError, Error, TaskError};
use crate::registry::{TaskHandler, TaskRegistry};

/// Outcome of invoking a task.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    /// The job was accepted by the broker under this id.
    Submitted(String),
    /// The task ran in-process and returned this value.
    Completed(Value),
}

impl Invocation {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::Submitted(id) => Some(id),
            Self::Completed(_) => None,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Submitted(_) => None,
            Self::Completed(value) => Some(value),
        }
    }
}

/// Registers tasks and invokes them through the broker.
pub struct TaskManager {
    gateway: Arc<JobGateway>,
    registry: TaskRegistry,
    codec: Arc<dyn EnvelopeCodec>,
}

impl TaskManager {
    /// Creates a manager with no manager-level overrides.
    pub fn new(gateway: Arc<JobGateway>) -> Self {
        Self::with_options(gateway, TaskOptions::default())
    }

    /// Creates a manager whose tasks resolve over `options`.
    ///
    /// Setting `options.queue` makes every task share that queue.
    pub fn with_options(gateway: Arc<JobGateway>, options: TaskOptions) -> Self {
        Self {
            gateway,
            registry: TaskRegistry::with_manager_options(options),
            codec: Arc::new(JsonCodec),
        }
    }

    /// Connects to the configured nodes over the Redis protocol.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for invalid settings and `Error::Broker` if no
    /// node is reachable.
    pub async fn connect(settings: &ClientSettings) -> Result<Self, Error> {
        settings.validate()?;
        let connection = BrokerConnection::open(
            &settings.nodes,
            settings.connect_timeout(),
            settings.max_retries,
        )
        .await?;
        let gateway = JobGateway::new(Arc::new(connection));
        Ok(Self::with_options(
            Arc::new(gateway),
            settings.manager_options(),
        ))
    }

    /// Replaces the envelope codec.
    pub fn with_codec(mut self, codec: Arc<dyn EnvelopeCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn gateway(&self) -> &Arc<JobGateway> {
        &self.gateway
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Registers `handler` under `name` with registration-time overrides.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
        options: TaskOptions,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        if self.registry.register(name.clone(), handler, options)?.is_some() {
            debug!(task = %name, "Replaced task registration");
        }
        Ok(())
    }

    /// Returns a handle for invoking one task.
    pub fn task<'a>(&'a self, name: &'a str) -> TaskRef<'a> {
        TaskRef {
            manager: self,
            name,
        }
    }

    /// Effective configuration of `name` for a call with `overrides`.
    pub fn resolve(&self, name: &str, overrides: &TaskOptions) -> Result<TaskConfig, TaskError> {
        let task = self.registry.lookup(name)?;
        Ok(self.registry.resolve(task, overrides))
    }

    /// Invokes a task.
    ///
    /// In debug mode the handler runs in-process and nothing is sent to the
    /// broker. Otherwise the call is encoded and submitted with the resolved
    /// delay, retry, ttl and replication parameters. `overrides` apply to
    /// this call only.
    pub async fn invoke(
        &self,
        name: &str,
        call: TaskCall,
        overrides: &TaskOptions,
    ) -> Result<Invocation, Error> {
        overrides.validate()?;
        let config = self.resolve(name, overrides)?;

        if config.debug {
            debug!(task = %name, "Running task in-process");
            let value = self.run(name, call.args, call.kwargs).await?;
            return Ok(Invocation::Completed(value));
        }

        let delay = config.delay_at(Utc::now())?;
        let payload = self.codec.encode(&JobInvocation::new(name, call))?;
        let job_id = self
            .gateway
            .add_job(&config.queue, &payload, &config.add_job_options(delay))
            .await?;

        info!(task = %name, job_id = %job_id, queue = %config.queue, delay = delay, "Task submitted");
        Ok(Invocation::Submitted(job_id))
    }

    /// Invokes a task with its registered options.
    pub async fn delay(&self, name: &str, call: TaskCall) -> Result<Invocation, Error> {
        self.invoke(name, call, &TaskOptions::default()).await
    }

    /// Runs a task's handler in-process.
    pub async fn run(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, TaskError> {
        let handler = Arc::clone(self.registry.lookup(name)?.handler());
        handler
            .call(args, kwargs)
            .await
            .map_err(|source| TaskError::Execution {
                task: name.to_string(),
                source,
            })
    }

    /// Decodes a job payload with this manager's codec.
    pub fn decode(&self, payload: &[u8]) -> Result<JobInvocation, CodecError> {
        self.codec.decode(payload)
    }

    /// Queues workers of this manager fetch from.
    pub fn queues(&self) -> Vec<String> {
        self.registry.queues()
    }

    /// Concurrency limit per known queue.
    pub fn queue_limits(&self) -> BTreeMap<String, Option<usize>> {
        self.registry.queue_limits()
    }

    /// Number of jobs of `queue` currently being processed by some worker.
    ///
    /// Assembled from a cursor scan, so the count is approximate.
    pub async fn num_processing(&self, queue: &str) -> Result<usize, BrokerError> {
        let ids = self
            .gateway
            .scan_jobs(queue, JobState::Active, DEFAULT_SCAN_PAGE)
            .await?;
        Ok(ids.len())
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("gateway", &self.gateway)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// A registered task bound to its manager.
#[derive(Debug, Clone, Copy)]
pub struct TaskRef<'a> {
    manager: &'a TaskManager,
    name: &'a str,
}

impl TaskRef<'_> {
    pub fn name(&self) -> &str {
        self.name
    }

    /// Submits (or in debug mode runs) the task with its registered options.
    pub async fn delay(&self, call: TaskCall) -> Result<Invocation, Error> {
        self.manager.delay(self.name, call).await
    }

    /// Submits the task with call-time overrides.
    pub async fn apply(&self, call: TaskCall, overrides: &TaskOptions) -> Result<Invocation, Error> {
        self.manager.invoke(self.name, call, overrides).await
    }

    /// Runs the task in-process.
    pub async fn run(&self, call: TaskCall) -> Result<Value, TaskError> {
        self.manager.run(self.name, call.args, call.kwargs).await
    }
}
