//! Typed job operations on top of a broker connection.
//!
//! Each method maps its parameters onto one broker command and decodes the
//! reply. Every command goes through `execute_with_retry`, so transport
//! failures are retried per command; `scan_jobs` issues several commands and
//! is therefore not retried as a whole.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use redis::FromRedisValue;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::command::Command;
use super::connection::BrokerConnection;
use crate::error::BrokerError;

/// Default `ADDJOB` command timeout in milliseconds.
pub const DEFAULT_ADD_TIMEOUT_MS: u64 = 200;

/// Default period in seconds after which an unacknowledged job is redelivered.
pub const DEFAULT_RETRY_SECS: u64 = 8640;

/// Default maximum job lifetime in seconds.
pub const DEFAULT_TTL_SECS: u64 = 86400;

/// Default page size for `JSCAN`.
pub const DEFAULT_SCAN_PAGE: u64 = 100;

/// A job as handed out by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Broker-assigned job id.
    pub id: String,
    /// Queue the job was fetched from.
    pub queue: String,
    /// Raw job body.
    pub payload: Vec<u8>,
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Job id:{} queue:{}>", self.id, self.queue)
    }
}

/// Job states understood by `JSCAN STATE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    WaitRepl,
    Active,
    Queued,
    Acked,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WaitRepl => "wait-repl",
            Self::Active => "active",
            Self::Queued => "queued",
            Self::Acked => "acked",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of `ADDJOB`.
///
/// Zero and `None` values are left out of the command so the broker applies
/// its own defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddJobOptions {
    /// Command timeout in milliseconds.
    pub timeout_ms: u64,
    /// Number of nodes the job is replicated to.
    pub replicate: Option<u32>,
    /// Seconds before the job is queued.
    pub delay: u64,
    /// Seconds without acknowledgement before the job is queued again.
    pub retry: u64,
    /// Maximum job lifetime in seconds.
    pub ttl: u64,
    /// Refuse the job when the queue already holds this many jobs.
    pub maxlen: Option<u64>,
    /// Let the broker reply before replication completes.
    pub async_submit: bool,
}

impl Default for AddJobOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_ADD_TIMEOUT_MS,
            replicate: None,
            delay: 0,
            retry: DEFAULT_RETRY_SECS,
            ttl: DEFAULT_TTL_SECS,
            maxlen: None,
            async_submit: false,
        }
    }
}

impl AddJobOptions {
    /// Builds the `ADDJOB` command for `queue` and `payload`.
    pub fn to_command(&self, queue: &str, payload: &[u8]) -> Command {
        let mut command = Command::new("ADDJOB")
            .arg(queue)
            .arg(payload)
            .arg(self.timeout_ms);

        if let Some(replicate) = self.replicate.filter(|r| *r > 0) {
            command.push_arg("REPLICATE");
            command.push_arg(replicate);
        }
        if self.delay > 0 {
            command.push_arg("DELAY");
            command.push_arg(self.delay);
        }
        if self.retry > 0 {
            command.push_arg("RETRY");
            command.push_arg(self.retry);
        }
        if self.ttl > 0 {
            command.push_arg("TTL");
            command.push_arg(self.ttl);
        }
        if let Some(maxlen) = self.maxlen.filter(|m| *m > 0) {
            command.push_arg("MAXLEN");
            command.push_arg(maxlen);
        }
        if self.async_submit {
            command.push_arg("ASYNC");
        }
        command
    }
}

/// Parameters of `GETJOB`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetJobOptions {
    /// How long to block waiting for jobs. `None` blocks until one arrives.
    pub timeout: Option<Duration>,
    /// Maximum number of jobs returned.
    pub count: Option<u32>,
}

impl GetJobOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    /// Builds the `GETJOB` command for `queues`.
    pub fn to_command(&self, queues: &[String]) -> Command {
        let mut command = Command::new("GETJOB");
        if let Some(timeout) = self.timeout.filter(|t| !t.is_zero()) {
            command.push_arg("TIMEOUT");
            command.push_arg(timeout.as_millis() as u64);
        }
        if let Some(count) = self.count.filter(|c| *c > 0) {
            command.push_arg("COUNT");
            command.push_arg(count);
        }
        command.push_arg("FROM");
        command.push_arg(queues);
        command
    }
}

/// Typed job operations routed through a shared broker connection.
#[derive(Debug, Clone)]
pub struct JobGateway {
    connection: Arc<BrokerConnection>,
}

impl JobGateway {
    pub fn new(connection: Arc<BrokerConnection>) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Arc<BrokerConnection> {
        &self.connection
    }

    /// Submits a job and returns its id.
    pub async fn add_job(
        &self,
        queue: &str,
        payload: &[u8],
        options: &AddJobOptions,
    ) -> Result<String, BrokerError> {
        let command = options.to_command(queue, payload);
        debug!(command = %command, "Sending job");
        let job_id: String = self.query(&command).await?;
        debug!(job_id = %job_id, queue = %queue, "Sent job");
        Ok(job_id)
    }

    /// Fetches jobs from `queues`.
    ///
    /// Returns an empty list when the timeout expires with nothing available.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::NoQueues` if `queues` is empty.
    pub async fn get_jobs(
        &self,
        queues: &[String],
        options: &GetJobOptions,
    ) -> Result<Vec<Job>, BrokerError> {
        if queues.is_empty() {
            return Err(BrokerError::NoQueues);
        }
        let command = options.to_command(queues);
        let entries: Option<Vec<redis::Value>> = self.query(&command).await?;
        into_jobs(&command, entries)
    }

    /// Acknowledges the execution of jobs, removing them cluster-wide.
    pub async fn ack_job(&self, job_ids: &[String]) -> Result<u64, BrokerError> {
        self.by_ids("ACKJOB", job_ids).await
    }

    /// Best-effort cluster-wide deletion (`FASTACK`).
    ///
    /// Faster than `ack_job`, but nodes that miss the message may redeliver.
    pub async fn fast_ack(&self, job_ids: &[String]) -> Result<u64, BrokerError> {
        self.by_ids("FASTACK", job_ids).await
    }

    /// Deletes jobs from the connected node only (`DELJOB`).
    ///
    /// No cluster message is sent: copies held by other nodes survive.
    pub async fn del_job(&self, job_ids: &[String]) -> Result<u64, BrokerError> {
        self.by_ids("DELJOB", job_ids).await
    }

    /// Queues jobs that are not currently queued.
    pub async fn enqueue(&self, job_ids: &[String]) -> Result<u64, BrokerError> {
        self.by_ids("ENQUEUE", job_ids).await
    }

    /// Removes jobs from their queue without deleting them.
    pub async fn dequeue(&self, job_ids: &[String]) -> Result<u64, BrokerError> {
        self.by_ids("DEQUEUE", job_ids).await
    }

    /// Number of jobs waiting in `queue`.
    pub async fn qlen(&self, queue: &str) -> Result<u64, BrokerError> {
        self.query(&Command::new("QLEN").arg(queue)).await
    }

    /// Returns up to `count` queued jobs without consuming them.
    ///
    /// Positive counts list oldest first, negative counts newest first.
    pub async fn qpeek(&self, queue: &str, count: i64) -> Result<Vec<Job>, BrokerError> {
        let command = Command::new("QPEEK").arg(queue).arg(count);
        let entries: Option<Vec<redis::Value>> = self.query(&command).await?;
        into_jobs(&command, entries)
    }

    /// Describes a job, or `None` if the node does not know it.
    pub async fn show(
        &self,
        job_id: &str,
    ) -> Result<Option<HashMap<String, redis::Value>>, BrokerError> {
        self.query(&Command::new("SHOW").arg(job_id)).await
    }

    /// Collects the ids of every job of `queue` in `state`.
    ///
    /// Pages through `JSCAN` until the broker returns cursor `0`. The result
    /// is a snapshot assembled over several commands and may be stale by the
    /// time it is returned.
    pub async fn scan_jobs(
        &self,
        queue: &str,
        state: JobState,
        page_size: u64,
    ) -> Result<Vec<String>, BrokerError> {
        let mut ids = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut command = Command::new("JSCAN");
            if let Some(cursor) = &cursor {
                command.push_arg(cursor.as_str());
            }
            let command = command
                .arg("COUNT")
                .arg(page_size)
                .arg("QUEUE")
                .arg(queue)
                .arg("STATE")
                .arg(state.as_str());

            let (next, page): (String, Vec<String>) = self.query(&command).await?;
            ids.extend(page);
            if next == "0" {
                return Ok(ids);
            }
            cursor = Some(next);
        }
    }

    /// Removes every job from the connected node (`DEBUG FLUSHALL`).
    ///
    /// Meant for test setups only.
    pub async fn flush_all(&self) -> Result<(), BrokerError> {
        self.connection
            .execute_with_retry(&Command::new("DEBUG").arg("FLUSHALL"))
            .await
            .map(|_| ())
    }

    async fn by_ids(&self, name: &str, job_ids: &[String]) -> Result<u64, BrokerError> {
        if job_ids.is_empty() {
            return Ok(0);
        }
        self.query(&Command::new(name).arg(job_ids)).await
    }

    async fn query<T: FromRedisValue>(&self, command: &Command) -> Result<T, BrokerError> {
        let reply = self.connection.execute_with_retry(command).await?;
        T::from_redis_value(&reply).map_err(|e| BrokerError::UnexpectedReply {
            command: command.name().to_string(),
            reason: e.to_string(),
        })
    }
}

/// Decodes a list of `[queue, id, body]` entries.
fn into_jobs(command: &Command, entries: Option<Vec<redis::Value>>) -> Result<Vec<Job>, BrokerError> {
    entries
        .unwrap_or_default()
        .iter()
        .map(|entry| {
            let (queue, id, payload) = <(String, String, Vec<u8>)>::from_redis_value(entry)
                .map_err(|e| BrokerError::UnexpectedReply {
                    command: command.name().to_string(),
                    reason: e.to_string(),
                })?;
            Ok(Job { id, queue, payload })
        })
        .collect()
}
