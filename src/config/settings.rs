//! Client settings: where the broker is and how tasks default.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::options::TaskOptions;
use crate::broker::{NodeAddress, DEFAULT_MAX_RETRIES};
use crate::error::ConfigError;

/// Node used when nothing else is configured.
pub const DEFAULT_NODE: &str = "localhost:7711";

/// Settings for connecting a task manager to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientSettings {
    /// Candidate node addresses (`host:port`), probed in order.
    pub nodes: Vec<String>,
    /// Queue shared by every task. `None` gives each task its own queue.
    pub queue: Option<String>,
    /// Retries after the first attempt of a broker command.
    pub max_retries: u32,
    /// Seconds allowed for opening a connection to a node.
    pub connect_timeout_secs: u64,
    /// Manager-level task option overrides.
    pub defaults: TaskOptions,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            nodes: vec![DEFAULT_NODE.to_string()],
            queue: None,
            max_retries: DEFAULT_MAX_RETRIES,
            connect_timeout_secs: 5,
            defaults: TaskOptions::default(),
        }
    }
}

impl ClientSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates settings from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DISQ_NODES`: Comma-separated node addresses (default: localhost:7711)
    /// - `DISQ_QUEUE`: Queue shared by all tasks
    /// - `DISQ_MAX_RETRIES`: Command retries (default: 2)
    /// - `DISQ_CONNECT_TIMEOUT_SECS`: Connect timeout (default: 5)
    /// - `DISQ_TTL`: Default job TTL in seconds
    /// - `DISQ_RETRY`: Default job retry period in seconds
    /// - `DISQ_DEBUG`: Run every task in-process
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env()
    }

    /// Reads settings from a YAML file, then applies environment overrides.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let settings: Self = serde_yaml::from_str(&content)?;
        settings.apply_env()
    }

    /// Overrides fields with any `DISQ_*` variables that are set.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(val) = std::env::var("DISQ_NODES") {
            self.nodes = split_list(&val);
        }

        if let Ok(val) = std::env::var("DISQ_QUEUE") {
            self.queue = Some(val);
        }

        if let Ok(val) = std::env::var("DISQ_MAX_RETRIES") {
            self.max_retries = parse_env_value(&val, "DISQ_MAX_RETRIES")?;
        }

        if let Ok(val) = std::env::var("DISQ_CONNECT_TIMEOUT_SECS") {
            self.connect_timeout_secs = parse_env_value(&val, "DISQ_CONNECT_TIMEOUT_SECS")?;
        }

        if let Ok(val) = std::env::var("DISQ_TTL") {
            self.defaults.ttl = Some(parse_env_value(&val, "DISQ_TTL")?);
        }

        if let Ok(val) = std::env::var("DISQ_RETRY") {
            self.defaults.retry = Some(parse_env_value(&val, "DISQ_RETRY")?);
        }

        if let Ok(val) = std::env::var("DISQ_DEBUG") {
            self.defaults.debug = Some(parse_env_bool(&val, "DISQ_DEBUG")?);
        }

        self.validate()?;
        Ok(self)
    }

    /// Sets the node list.
    pub fn with_nodes<S: Into<String>>(mut self, nodes: impl IntoIterator<Item = S>) -> Self {
        self.nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the queue shared by every task.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Manager-level overrides, including the shared queue if one is set.
    pub fn manager_options(&self) -> TaskOptions {
        let mut options = self.defaults.clone();
        if self.queue.is_some() {
            options.queue = self.queue.clone();
        }
        options
    }

    /// Parsed node addresses.
    pub fn addresses(&self) -> Result<Vec<NodeAddress>, ConfigError> {
        self.nodes
            .iter()
            .map(|n| {
                n.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "nodes".to_string(),
                    message: format!("'{}' is not host:port", n),
                })
            })
            .collect()
    }

    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if no node is configured or an address is malformed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one node is required".to_string(),
            ));
        }
        self.addresses()?;

        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "connect_timeout_secs must be greater than 0".to_string(),
            ));
        }

        self.manager_options().validate()
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_env_value<T: std::str::FromStr>(val: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    val.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn parse_env_bool(val: &str, key: &str) -> Result<bool, ConfigError> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean, got '{}'", val),
        }),
    }
}
