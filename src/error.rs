//! Error types for disq operations.
//!
//! Defines error types for each subsystem:
//! - Broker connection and command execution
//! - Job envelope encoding and decoding
//! - Task lookup and execution
//! - Configuration and worker startup

use thiserror::Error;

/// Errors that can occur while talking to the broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The active node stopped answering. A reconnect has been attempted.
    #[error("Connection to node {node} failed: {source}")]
    ConnectionFailure {
        node: String,
        #[source]
        source: redis::RedisError,
    },

    /// None of the configured nodes answered the handshake.
    #[error("Couldn't connect to any node (tried: {})", .0.join(", "))]
    NoReachableNode(Vec<String>),

    /// The broker refused the command.
    #[error("Command {command} failed: {source}")]
    Command {
        command: String,
        #[source]
        source: redis::RedisError,
    },

    /// The broker answered with a reply we could not interpret.
    #[error("Unexpected reply to {command}: {reason}")]
    UnexpectedReply { command: String, reason: String },

    /// A node address is not of the form `host:port`.
    #[error("Invalid node address '{0}', expected host:port")]
    InvalidAddress(String),

    /// A fetch was requested without any queue to fetch from.
    #[error("At least one queue is required to fetch jobs")]
    NoQueues,
}

impl BrokerError {
    /// Returns true when the failure came from the transport rather than the broker.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::ConnectionFailure { .. })
    }
}

/// Errors that can occur while encoding or decoding job envelopes.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Argument is not serializable: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("Malformed job payload: {0}")]
    Deserialization(#[source] serde_json::Error),
}

/// Errors that can occur while resolving or executing a task.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task '{0}' is not registered")]
    UnknownTask(String),

    #[error("Task '{task}' failed: {source}")]
    Execution {
        task: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Errors that can occur while building configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// A nested worker strategy was requested without a process outer strategy.
    #[error("Using a sub worker requires the worker model to be 'process', got '{0}'")]
    NestedRequiresProcess(String),

    #[error("Invalid cron expression '{expression}': {message}")]
    InvalidCron { expression: String, message: String },

    #[error("Unknown app '{0}'")]
    UnknownApp(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Umbrella error returned by task manager operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
