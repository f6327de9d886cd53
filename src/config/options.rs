//! Layered task options.
//!
//! A task's effective configuration is the rightmost-wins merge of:
//!
//! 1. built-in defaults (`TaskOptions::defaults`)
//! 2. task manager overrides
//! 3. registration overrides
//! 4. call overrides
//!
//! Every layer is an immutable `TaskOptions`; merging allocates a new value,
//! so a call override can never leak into another call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::schedule;
use crate::broker::{AddJobOptions, DEFAULT_ADD_TIMEOUT_MS, DEFAULT_RETRY_SECS, DEFAULT_TTL_SECS};
use crate::error::ConfigError;

/// One configuration layer. Unset fields fall through to lower layers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskOptions {
    /// Queue to submit to. Defaults to the task name.
    pub queue: Option<String>,
    /// Seconds before the job becomes available.
    pub delay: Option<u64>,
    /// Absolute time the job becomes available.
    pub at: Option<DateTime<Utc>>,
    /// Cron expression; the job becomes available at its next occurrence.
    pub cron: Option<String>,
    /// Run the task in-process instead of submitting it.
    pub debug: Option<bool>,
    /// Maximum job lifetime in seconds.
    pub ttl: Option<u64>,
    /// Seconds without acknowledgement before redelivery.
    pub retry: Option<u64>,
    /// Number of nodes the job is replicated to.
    pub replicate: Option<u32>,
    /// Refuse the job when the queue already holds this many jobs.
    pub maxlen: Option<u64>,
    /// Let the broker reply before replication completes.
    #[serde(rename = "async")]
    pub async_submit: Option<bool>,
    /// `ADDJOB` command timeout in milliseconds.
    pub timeout: Option<u64>,
    /// Maximum jobs of this task's queue processed at once across workers.
    pub max_workers: Option<usize>,
}

impl TaskOptions {
    /// Creates an empty layer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in defaults, the bottom layer of every resolution.
    pub fn defaults() -> Self {
        Self {
            debug: Some(false),
            ttl: Some(DEFAULT_TTL_SECS),
            retry: Some(DEFAULT_RETRY_SECS),
            timeout: Some(DEFAULT_ADD_TIMEOUT_MS),
            async_submit: Some(false),
            ..Self::default()
        }
    }

    /// Returns a new layer where every field set in `overrides` wins.
    pub fn merge(&self, overrides: &TaskOptions) -> TaskOptions {
        TaskOptions {
            queue: overrides.queue.clone().or_else(|| self.queue.clone()),
            delay: overrides.delay.or(self.delay),
            at: overrides.at.or(self.at),
            cron: overrides.cron.clone().or_else(|| self.cron.clone()),
            debug: overrides.debug.or(self.debug),
            ttl: overrides.ttl.or(self.ttl),
            retry: overrides.retry.or(self.retry),
            replicate: overrides.replicate.or(self.replicate),
            maxlen: overrides.maxlen.or(self.maxlen),
            async_submit: overrides.async_submit.or(self.async_submit),
            timeout: overrides.timeout.or(self.timeout),
            max_workers: overrides.max_workers.or(self.max_workers),
        }
    }

    /// Returns true when no field is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Checks values that can be validated without a broker.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(expression) = &self.cron {
            schedule::parse_cron(expression)?;
        }
        if self.queue.as_deref().is_some_and(str::is_empty) {
            return Err(ConfigError::ValidationFailed("queue cannot be empty".to_string()));
        }
        if self.max_workers == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "max_workers must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Fills unset fields from the built-in defaults and names the queue.
    pub fn resolve(&self, task_name: &str) -> TaskConfig {
        let merged = Self::defaults().merge(self);
        TaskConfig {
            queue: merged.queue.unwrap_or_else(|| task_name.to_string()),
            debug: merged.debug.unwrap_or(false),
            ttl: merged.ttl.unwrap_or(DEFAULT_TTL_SECS),
            retry: merged.retry.unwrap_or(DEFAULT_RETRY_SECS),
            delay: merged.delay.unwrap_or(0),
            at: merged.at,
            cron: merged.cron,
            replicate: merged.replicate,
            maxlen: merged.maxlen,
            async_submit: merged.async_submit.unwrap_or(false),
            timeout_ms: merged.timeout.unwrap_or(DEFAULT_ADD_TIMEOUT_MS),
            max_workers: merged.max_workers,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_delay(mut self, seconds: u64) -> Self {
        self.delay = Some(seconds);
        self
    }

    pub fn with_at(mut self, at: DateTime<Utc>) -> Self {
        self.at = Some(at);
        self
    }

    pub fn with_cron(mut self, expression: impl Into<String>) -> Self {
        self.cron = Some(expression.into());
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = Some(debug);
        self
    }

    pub fn with_ttl(mut self, seconds: u64) -> Self {
        self.ttl = Some(seconds);
        self
    }

    pub fn with_retry(mut self, seconds: u64) -> Self {
        self.retry = Some(seconds);
        self
    }

    pub fn with_replicate(mut self, nodes: u32) -> Self {
        self.replicate = Some(nodes);
        self
    }

    pub fn with_maxlen(mut self, maxlen: u64) -> Self {
        self.maxlen = Some(maxlen);
        self
    }

    pub fn with_async(mut self, async_submit: bool) -> Self {
        self.async_submit = Some(async_submit);
        self
    }

    pub fn with_timeout(mut self, millis: u64) -> Self {
        self.timeout = Some(millis);
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = Some(max_workers);
        self
    }
}

/// Fully resolved configuration of one task invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskConfig {
    pub queue: String,
    pub debug: bool,
    pub ttl: u64,
    pub retry: u64,
    pub delay: u64,
    pub at: Option<DateTime<Utc>>,
    pub cron: Option<String>,
    pub replicate: Option<u32>,
    pub maxlen: Option<u64>,
    pub async_submit: bool,
    pub timeout_ms: u64,
    pub max_workers: Option<usize>,
}

impl TaskConfig {
    /// Seconds to delay a job submitted at `now`.
    ///
    /// `at` takes precedence over `cron`; either one is added to the plain
    /// `delay`.
    pub fn delay_at(&self, now: DateTime<Utc>) -> Result<u64, ConfigError> {
        let scheduled = if let Some(at) = self.at {
            schedule::seconds_until(at, now)
        } else if let Some(expression) = &self.cron {
            schedule::seconds_until_next(expression, now)?
        } else {
            0
        };
        Ok(self.delay.saturating_add(scheduled))
    }

    /// `ADDJOB` parameters for a job delayed by `delay` seconds.
    pub fn add_job_options(&self, delay: u64) -> AddJobOptions {
        AddJobOptions {
            timeout_ms: self.timeout_ms,
            replicate: self.replicate,
            delay,
            retry: self.retry,
            ttl: self.ttl,
            maxlen: self.maxlen,
            async_submit: self.async_submit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_rightmost_layer_wins() {
        let defaults = TaskOptions::defaults();
        let registration = TaskOptions::new().with_ttl(100).with_delay(3);
        let call = TaskOptions::new().with_ttl(5);

        let merged = defaults.merge(&registration).merge(&call);
        assert_eq!(merged.ttl, Some(5));
        assert_eq!(merged.delay, Some(3));
        assert_eq!(merged.retry, Some(DEFAULT_RETRY_SECS));

        // the registration layer itself is untouched
        assert_eq!(defaults.merge(&registration).ttl, Some(100));
    }

    #[test]
    fn test_resolve_defaults() {
        let config = TaskOptions::new().resolve("add");
        assert_eq!(config.queue, "add");
        assert!(!config.debug);
        assert_eq!(config.ttl, 86400);
        assert_eq!(config.retry, 8640);
        assert_eq!(config.timeout_ms, 200);
        assert_eq!(config.delay, 0);
        assert_eq!(config.max_workers, None);
    }

    #[test]
    fn test_resolve_queue_override() {
        let config = TaskOptions::new().with_queue("shared").resolve("add");
        assert_eq!(config.queue, "shared");
    }

    #[test]
    fn test_deserialize_option_names() {
        let yaml = "queue: emails\nasync: true\nmax_workers: 2\nttl: 60\n";
        let options: TaskOptions = serde_yaml::from_str(yaml).expect("valid options");
        assert_eq!(options.queue.as_deref(), Some("emails"));
        assert_eq!(options.async_submit, Some(true));
        assert_eq!(options.max_workers, Some(2));
        assert_eq!(options.ttl, Some(60));

        assert!(serde_yaml::from_str::<TaskOptions>("priority: 1\n").is_err());
    }

    #[test]
    fn test_validate() {
        assert!(TaskOptions::new().validate().is_ok());
        assert!(TaskOptions::new().with_cron("*/5 * * * *").validate().is_ok());
        assert!(TaskOptions::new().with_cron("not cron").validate().is_err());
        assert!(TaskOptions::new().with_queue("").validate().is_err());
        assert!(TaskOptions::new().with_max_workers(0).validate().is_err());
    }

    #[test]
    fn test_delay_with_absolute_time() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let config = TaskOptions::new()
            .with_at(now + chrono::Duration::seconds(90))
            .with_delay(10)
            .resolve("t");
        assert_eq!(config.delay_at(now).expect("delay"), 100);

        let past = TaskOptions::new()
            .with_at(now - chrono::Duration::seconds(90))
            .resolve("t");
        assert_eq!(past.delay_at(now).expect("delay"), 0);
    }

    #[test]
    fn test_delay_with_cron() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 30).unwrap();
        let config = TaskOptions::new()
            .with_cron("* * * * *")
            .with_delay(5)
            .resolve("t");
        assert_eq!(config.delay_at(now).expect("delay"), 35);
    }

    #[test]
    fn test_add_job_options_from_config() {
        let config = TaskOptions::new()
            .with_replicate(2)
            .with_maxlen(10)
            .with_async(true)
            .with_timeout(500)
            .resolve("t");
        let options = config.add_job_options(7);
        assert_eq!(options.timeout_ms, 500);
        assert_eq!(options.replicate, Some(2));
        assert_eq!(options.delay, 7);
        assert_eq!(options.maxlen, Some(10));
        assert!(options.async_submit);
        assert_eq!(options.ttl, 86400);
    }
}
