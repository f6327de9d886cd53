//! Task registry: task name to handler and registration options.
//!
//! The registry also owns the manager layer of task options, so it can
//! resolve the effective configuration of any registered task and derive
//! the set of queues workers should fetch from.

pub mod handler;

pub use handler::{async_handler_fn, handler_fn, AsyncFnHandler, FnHandler, TaskHandler};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::config::{TaskConfig, TaskOptions};
use crate::error::{ConfigError, TaskError};

/// A registered task.
pub struct RegisteredTask {
    name: String,
    handler: Arc<dyn TaskHandler>,
    options: TaskOptions,
}

impl RegisteredTask {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> &Arc<dyn TaskHandler> {
        &self.handler
    }

    /// Registration-time option overrides.
    pub fn options(&self) -> &TaskOptions {
        &self.options
    }
}

impl fmt::Debug for RegisteredTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredTask")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Registered tasks plus the manager-level option layer.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    entries: HashMap<String, Arc<RegisteredTask>>,
    manager_options: TaskOptions,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry whose tasks resolve over `manager_options`.
    ///
    /// A queue set in `manager_options` is fixed: every task is submitted to
    /// it, whatever its registration or call options say.
    pub fn with_manager_options(manager_options: TaskOptions) -> Self {
        Self {
            entries: HashMap::new(),
            manager_options,
        }
    }

    pub fn manager_options(&self) -> &TaskOptions {
        &self.manager_options
    }

    /// Queue shared by every task, if the manager fixes one.
    pub fn fixed_queue(&self) -> Option<&str> {
        self.manager_options.queue.as_deref()
    }

    /// Registers a task, replacing any task of the same name.
    ///
    /// Returns the replaced task.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the registration options are invalid.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
        options: TaskOptions,
    ) -> Result<Option<Arc<RegisteredTask>>, ConfigError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "task name cannot be empty".to_string(),
            ));
        }
        options.validate()?;

        let task = Arc::new(RegisteredTask {
            name: name.clone(),
            handler,
            options,
        });
        Ok(self.entries.insert(name, task))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<RegisteredTask>> {
        self.entries.get(name)
    }

    /// Looks a task up, failing with `TaskError::UnknownTask`.
    pub fn lookup(&self, name: &str) -> Result<&Arc<RegisteredTask>, TaskError> {
        self.get(name)
            .ok_or_else(|| TaskError::UnknownTask(name.to_string()))
    }

    /// Registered task names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Effective configuration of `task` for one call.
    ///
    /// Layers are merged rightmost-wins: built-in defaults, manager options,
    /// registration options, `overrides`. Nothing stored is modified.
    pub fn resolve(&self, task: &RegisteredTask, overrides: &TaskOptions) -> TaskConfig {
        let merged = self
            .manager_options
            .merge(&task.options)
            .merge(overrides);
        let mut config = merged.resolve(&task.name);
        if let Some(queue) = self.fixed_queue() {
            config.queue = queue.to_string();
        }
        config
    }

    /// Queues workers should fetch from, sorted.
    pub fn queues(&self) -> Vec<String> {
        if let Some(queue) = self.fixed_queue() {
            return vec![queue.to_string()];
        }
        self.entries
            .values()
            .map(|task| self.resolve(task, &TaskOptions::default()).queue)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Concurrency limit of every known queue.
    ///
    /// A queue shared by several tasks takes the smallest limit among them;
    /// `None` means unlimited.
    pub fn queue_limits(&self) -> BTreeMap<String, Option<usize>> {
        let mut limits: BTreeMap<String, Option<usize>> = self
            .queues()
            .into_iter()
            .map(|queue| (queue, None))
            .collect();

        for task in self.entries.values() {
            let config = self.resolve(task, &TaskOptions::default());
            let Some(limit) = config.max_workers else {
                continue;
            };
            let entry = limits.entry(config.queue).or_insert(None);
            *entry = Some(entry.map_or(limit, |current| current.min(limit)));
        }
        limits
    }
}
