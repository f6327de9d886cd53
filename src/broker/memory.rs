//! In-process broker for tests and local development.
//!
//! `MemoryBroker` answers the Disque command subset used by this crate
//! (`HELLO`, `ADDJOB`, `GETJOB`, `ACKJOB`, `FASTACK`, `DELJOB`, `QLEN`,
//! `QPEEK`, `ENQUEUE`, `DEQUEUE`, `SHOW`, `JSCAN`, `DEBUG FLUSHALL`) from a
//! single shared job table. It also acts as a `Connector`, so several node
//! addresses can point at the same table while individual addresses are
//! marked unreachable or made to fail.
//!
//! Time is measured with `tokio::time`, so tests can run it on a paused clock.
//! Delivered jobs that are not acknowledged within their `RETRY` period are
//! queued again, which is how at-least-once redelivery shows up here.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use redis::{ErrorKind, RedisError, RedisResult, Value};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::command::Command;
use super::connection::{CommandChannel, Connector, NodeAddress};

/// Retry period used when `ADDJOB` carries no `RETRY`.
const DEFAULT_RETRY_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoredState {
    Queued,
    Active,
}

impl StoredState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
        }
    }
}

#[derive(Debug, Clone)]
struct StoredJob {
    id: String,
    queue: String,
    payload: Vec<u8>,
    state: StoredState,
    /// Earliest time a queued job can be delivered.
    ready_at: Instant,
    /// When an active job goes back to its queue, if ever.
    requeue_at: Option<Instant>,
    retry: u64,
    ttl: u64,
    replicate: u64,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    jobs: HashMap<String, StoredJob>,
    queues: HashMap<String, VecDeque<String>>,
    acks: HashMap<String, u32>,
    log: Vec<(String, String)>,
    unreachable: HashSet<String>,
    pending_failures: HashMap<String, u32>,
}

impl State {
    /// Moves active jobs whose retry period elapsed back to their queue.
    fn requeue_expired(&mut self, now: Instant) {
        let mut expired: Vec<(Instant, String)> = self
            .jobs
            .values()
            .filter(|j| j.state == StoredState::Active)
            .filter_map(|j| j.requeue_at.filter(|at| *at <= now).map(|at| (at, j.id.clone())))
            .collect();
        expired.sort();

        for (_, id) in expired {
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = StoredState::Queued;
                job.ready_at = now;
                job.requeue_at = None;
                self.queues
                    .entry(job.queue.clone())
                    .or_default()
                    .push_back(id);
            }
        }
    }

    fn take_ready(&mut self, queues: &[String], count: usize, now: Instant) -> Vec<StoredJob> {
        let mut taken = Vec::new();
        for queue in queues {
            let Some(ids) = self.queues.get_mut(queue) else {
                continue;
            };
            let mut index = 0;
            while index < ids.len() && taken.len() < count {
                let ready = self
                    .jobs
                    .get(&ids[index])
                    .is_some_and(|j| j.ready_at <= now);
                if !ready {
                    index += 1;
                    continue;
                }
                let Some(id) = ids.remove(index) else { break };
                if let Some(job) = self.jobs.get_mut(&id) {
                    job.state = StoredState::Active;
                    job.deliveries += 1;
                    job.requeue_at = (job.retry > 0).then(|| now + Duration::from_secs(job.retry));
                    taken.push(job.clone());
                }
            }
            if taken.len() >= count {
                break;
            }
        }
        taken
    }

    /// Next instant at which a blocked fetch could make progress.
    fn next_event(&self) -> Option<Instant> {
        self.jobs
            .values()
            .filter_map(|j| match j.state {
                StoredState::Queued => Some(j.ready_at),
                StoredState::Active => j.requeue_at,
            })
            .min()
    }

    fn remove(&mut self, id: &str) -> bool {
        match self.jobs.remove(id) {
            Some(job) => {
                if let Some(ids) = self.queues.get_mut(&job.queue) {
                    ids.retain(|queued| queued != id);
                }
                true
            }
            None => false,
        }
    }

    fn queued_len(&self, queue: &str, now: Instant) -> usize {
        self.queues.get(queue).map_or(0, |ids| {
            ids.iter()
                .filter(|id| self.jobs.get(*id).is_some_and(|j| j.ready_at <= now))
                .count()
        })
    }
}

struct Inner {
    state: Mutex<State>,
    job_added: Notify,
}

/// Shared in-memory job table reachable through any number of node addresses.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                job_added: Notify::new(),
            }),
        }
    }

    /// Marks an address as (un)reachable. Open channels to an unreachable
    /// address fail with a connection reset.
    pub fn set_reachable(&self, address: &str, reachable: bool) {
        let mut state = self.lock();
        if reachable {
            state.unreachable.remove(address);
        } else {
            state.unreachable.insert(address.to_string());
        }
    }

    /// Makes the next `count` commands sent to `address` fail at the transport level.
    pub fn fail_next(&self, address: &str, count: u32) {
        self.lock()
            .pending_failures
            .insert(address.to_string(), count);
    }

    /// Number of times `command` was received through `address`.
    pub fn command_count(&self, address: &str, command: &str) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|(a, c)| a == address && c.eq_ignore_ascii_case(command))
            .count()
    }

    /// Total number of `command` received through any address.
    pub fn total_command_count(&self, command: &str) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|(_, c)| c.eq_ignore_ascii_case(command))
            .count()
    }

    /// Number of times a job was acknowledged.
    pub fn ack_count(&self, job_id: &str) -> u32 {
        self.lock().acks.get(job_id).copied().unwrap_or(0)
    }

    /// Number of times a job was handed out by `GETJOB`.
    pub fn delivery_count(&self, job_id: &str) -> u32 {
        self.lock().jobs.get(job_id).map_or(0, |j| j.deliveries)
    }

    /// Number of jobs of `queue` delivered but not yet acknowledged.
    pub fn active_count(&self, queue: &str) -> usize {
        self.lock()
            .jobs
            .values()
            .filter(|j| j.queue == queue && j.state == StoredState::Active)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn handle(&self, command: &Command) -> RedisResult<Value> {
        let args: Vec<String> = command
            .args()
            .iter()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect();

        if command.name().eq_ignore_ascii_case("GETJOB") {
            return self.get_job(&args).await;
        }
        self.handle_immediate(command, &args)
    }

    /// Commands that answer without waiting.
    fn handle_immediate(&self, command: &Command, args: &[String]) -> RedisResult<Value> {
        match command.name().to_ascii_uppercase().as_str() {
            "ADDJOB" => self.add_job(command, args),
            "ACKJOB" | "FASTACK" => Ok(self.remove_jobs(args, true)),
            "DELJOB" => Ok(self.remove_jobs(args, false)),
            "QLEN" => {
                let queue = args.first().ok_or_else(|| syntax_error("QLEN"))?;
                let len = self.lock().queued_len(queue, Instant::now());
                Ok(Value::Int(len as i64))
            }
            "QPEEK" => self.qpeek(args),
            "ENQUEUE" => Ok(self.enqueue(args)),
            "DEQUEUE" => Ok(self.dequeue(args)),
            "SHOW" => self.show(args),
            "JSCAN" => self.jscan(args),
            "DEBUG" if args.first().is_some_and(|a| a.eq_ignore_ascii_case("FLUSHALL")) => {
                let mut state = self.lock();
                state.jobs.clear();
                state.queues.clear();
                state.acks.clear();
                Ok(Value::Okay)
            }
            _ => Err(RedisError::from((
                ErrorKind::ResponseError,
                "unknown command",
                command.name().to_string(),
            ))),
        }
    }

    fn add_job(&self, command: &Command, args: &[String]) -> RedisResult<Value> {
        if args.len() < 3 {
            return Err(syntax_error("ADDJOB"));
        }
        let queue = args[0].clone();
        let payload = command.args()[1].clone();

        let mut delay = 0;
        let mut retry = DEFAULT_RETRY_SECS;
        let mut ttl = 0;
        let mut replicate = 1;
        let mut maxlen = None;
        let mut rest = args[3..].iter();
        while let Some(option) = rest.next() {
            match option.to_ascii_uppercase().as_str() {
                "ASYNC" => {}
                "REPLICATE" => replicate = parse_next(&mut rest)?,
                "DELAY" => delay = parse_next(&mut rest)?,
                "RETRY" => retry = parse_next(&mut rest)?,
                "TTL" => ttl = parse_next(&mut rest)?,
                "MAXLEN" => maxlen = Some(parse_next(&mut rest)?),
                _ => return Err(syntax_error("ADDJOB")),
            }
        }

        let now = Instant::now();
        let id = {
            let mut state = self.lock();
            if let Some(maxlen) = maxlen {
                if state.queued_len(&queue, now) as u64 >= maxlen {
                    return Err(RedisError::from((
                        ErrorKind::ResponseError,
                        "MAXLEN Queue is already longer than the specified MAXLEN count",
                    )));
                }
            }
            state.next_id += 1;
            let id = format!("D-mem-{:08}", state.next_id);
            state.jobs.insert(
                id.clone(),
                StoredJob {
                    id: id.clone(),
                    queue: queue.clone(),
                    payload,
                    state: StoredState::Queued,
                    ready_at: now + Duration::from_secs(delay),
                    requeue_at: None,
                    retry,
                    ttl,
                    replicate,
                    deliveries: 0,
                },
            );
            state.queues.entry(queue).or_default().push_back(id.clone());
            id
        };
        self.inner.job_added.notify_waiters();
        Ok(Value::Data(id.into_bytes()))
    }

    async fn get_job(&self, args: &[String]) -> RedisResult<Value> {
        let mut timeout = None;
        let mut count = 1usize;
        let mut queues = Vec::new();
        let mut iter = args.iter();
        while let Some(option) = iter.next() {
            match option.to_ascii_uppercase().as_str() {
                "TIMEOUT" => {
                    let ms: u64 = parse_next(&mut iter)?;
                    timeout = (ms > 0).then(|| Duration::from_millis(ms));
                }
                "COUNT" => count = parse_next(&mut iter)?,
                "FROM" => {
                    queues = iter.by_ref().cloned().collect();
                }
                _ => return Err(syntax_error("GETJOB")),
            }
        }
        if queues.is_empty() {
            return Err(syntax_error("GETJOB"));
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            // Registered before checking so a concurrent ADDJOB cannot be missed.
            let notified = self.inner.job_added.notified();
            let next_event = {
                let mut state = self.lock();
                let now = Instant::now();
                state.requeue_expired(now);
                let jobs = state.take_ready(&queues, count.max(1), now);
                if !jobs.is_empty() {
                    return Ok(Value::Bulk(jobs.into_iter().map(job_entry).collect()));
                }
                state.next_event()
            };

            let now = Instant::now();
            if deadline.is_some_and(|d| d <= now) {
                return Ok(Value::Nil);
            }
            let wake = match (deadline, next_event.filter(|e| *e > now)) {
                (Some(d), Some(e)) => Some(d.min(e)),
                (Some(d), None) => Some(d),
                (None, e) => e,
            };
            match wake {
                Some(wake) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(wake) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    fn remove_jobs(&self, ids: &[String], acknowledge: bool) -> Value {
        let mut state = self.lock();
        let mut removed = 0;
        for id in ids {
            if state.remove(id) {
                removed += 1;
                if acknowledge {
                    *state.acks.entry(id.clone()).or_insert(0) += 1;
                }
            }
        }
        Value::Int(removed)
    }

    fn qpeek(&self, args: &[String]) -> RedisResult<Value> {
        let queue = args.first().ok_or_else(|| syntax_error("QPEEK"))?;
        let count: i64 = args
            .get(1)
            .and_then(|c| c.parse().ok())
            .ok_or_else(|| syntax_error("QPEEK"))?;

        let state = self.lock();
        let now = Instant::now();
        let ids: Vec<&String> = state.queues.get(queue).map_or_else(Vec::new, |ids| {
            ids.iter()
                .filter(|id| state.jobs.get(*id).is_some_and(|j| j.ready_at <= now))
                .collect()
        });
        let limit = count.unsigned_abs() as usize;
        let selected: Vec<&String> = if count >= 0 {
            ids.into_iter().take(limit).collect()
        } else {
            ids.into_iter().rev().take(limit).collect()
        };
        Ok(Value::Bulk(
            selected
                .into_iter()
                .filter_map(|id| state.jobs.get(id))
                .map(|j| job_entry(j.clone()))
                .collect(),
        ))
    }

    fn enqueue(&self, ids: &[String]) -> Value {
        let mut changed = 0;
        {
            let mut state = self.lock();
            let now = Instant::now();
            for id in ids {
                let queue = match state.jobs.get_mut(id) {
                    Some(job) if job.state == StoredState::Active => {
                        job.state = StoredState::Queued;
                        job.ready_at = now;
                        job.requeue_at = None;
                        job.queue.clone()
                    }
                    _ => continue,
                };
                state.queues.entry(queue).or_default().push_back(id.clone());
                changed += 1;
            }
        }
        self.inner.job_added.notify_waiters();
        Value::Int(changed)
    }

    fn dequeue(&self, ids: &[String]) -> Value {
        let mut state = self.lock();
        let now = Instant::now();
        let mut changed = 0;
        for id in ids {
            let queue = match state.jobs.get_mut(id) {
                Some(job) if job.state == StoredState::Queued => {
                    job.state = StoredState::Active;
                    job.requeue_at = (job.retry > 0).then(|| now + Duration::from_secs(job.retry));
                    job.queue.clone()
                }
                _ => continue,
            };
            if let Some(queued) = state.queues.get_mut(&queue) {
                queued.retain(|q| q != id);
            }
            changed += 1;
        }
        Value::Int(changed)
    }

    fn show(&self, args: &[String]) -> RedisResult<Value> {
        let id = args.first().ok_or_else(|| syntax_error("SHOW"))?;
        let state = self.lock();
        let Some(job) = state.jobs.get(id) else {
            return Ok(Value::Nil);
        };
        let field = |name: &str| Value::Data(name.as_bytes().to_vec());
        Ok(Value::Bulk(vec![
            field("id"),
            Value::Data(job.id.clone().into_bytes()),
            field("queue"),
            Value::Data(job.queue.clone().into_bytes()),
            field("state"),
            Value::Data(job.state.as_str().as_bytes().to_vec()),
            field("repl"),
            Value::Int(job.replicate as i64),
            field("ttl"),
            Value::Int(job.ttl as i64),
            field("retry"),
            Value::Int(job.retry as i64),
            field("deliveries"),
            Value::Int(job.deliveries as i64),
            field("body"),
            Value::Data(job.payload.clone()),
        ]))
    }

    /// `JSCAN [cursor] COUNT n QUEUE q STATE s` with the cursor being an
    /// offset into the id-sorted matches.
    fn jscan(&self, args: &[String]) -> RedisResult<Value> {
        let mut cursor = 0usize;
        let mut page = 10usize;
        let mut queue = None;
        let mut wanted = None;
        let mut iter = args.iter().peekable();
        if let Some(first) = iter.peek() {
            if let Ok(c) = first.parse::<usize>() {
                cursor = c;
                iter.next();
            }
        }
        while let Some(option) = iter.next() {
            match option.to_ascii_uppercase().as_str() {
                "COUNT" => page = parse_next(&mut iter)?,
                "QUEUE" => queue = iter.next().cloned(),
                "STATE" => wanted = iter.next().cloned(),
                _ => return Err(syntax_error("JSCAN")),
            }
        }

        let mut state = self.lock();
        state.requeue_expired(Instant::now());
        let mut ids: Vec<&String> = state
            .jobs
            .values()
            .filter(|j| queue.as_ref().map_or(true, |q| &j.queue == q))
            .filter(|j| {
                wanted
                    .as_ref()
                    .map_or(true, |s| j.state.as_str().eq_ignore_ascii_case(s))
            })
            .map(|j| &j.id)
            .collect();
        ids.sort();

        let end = (cursor + page.max(1)).min(ids.len());
        let next = if end >= ids.len() { 0 } else { end };
        let batch = ids
            .get(cursor..end)
            .unwrap_or_default()
            .iter()
            .map(|id| Value::Data(id.as_bytes().to_vec()))
            .collect();
        Ok(Value::Bulk(vec![
            Value::Data(next.to_string().into_bytes()),
            Value::Bulk(batch),
        ]))
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn open(&self, address: &NodeAddress) -> RedisResult<Box<dyn CommandChannel>> {
        let address = address.to_string();
        if self.lock().unreachable.contains(&address) {
            return Err(RedisError::from(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("connection to {} refused", address),
            )));
        }
        Ok(Box::new(MemoryChannel {
            broker: self.clone(),
            address,
        }))
    }
}

/// One node's view of a `MemoryBroker`.
struct MemoryChannel {
    broker: MemoryBroker,
    address: String,
}

#[async_trait]
impl CommandChannel for MemoryChannel {
    async fn send(&self, command: &Command) -> RedisResult<Value> {
        {
            let mut state = self.broker.lock();
            state
                .log
                .push((self.address.clone(), command.name().to_string()));

            let injected = match state.pending_failures.get_mut(&self.address) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            };
            if injected || state.unreachable.contains(&self.address) {
                return Err(RedisError::from(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    format!("connection to {} reset", self.address),
                )));
            }
        }

        if command.name().eq_ignore_ascii_case("HELLO") {
            return Ok(Value::Bulk(vec![
                Value::Int(1),
                Value::Data(format!("mem-{}", self.address).into_bytes()),
                Value::Bulk(Vec::new()),
            ]));
        }
        self.broker.handle(command).await
    }
}

fn job_entry(job: StoredJob) -> Value {
    Value::Bulk(vec![
        Value::Data(job.queue.into_bytes()),
        Value::Data(job.id.into_bytes()),
        Value::Data(job.payload),
    ])
}

fn syntax_error(command: &str) -> RedisError {
    RedisError::from((
        ErrorKind::ResponseError,
        "syntax error",
        command.to_string(),
    ))
}

fn parse_next<'a, T, I>(iter: &mut I) -> RedisResult<T>
where
    T: std::str::FromStr,
    I: Iterator<Item = &'a String>,
{
    iter.next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| RedisError::from((ErrorKind::ResponseError, "invalid option value")))
}
