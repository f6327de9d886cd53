//! Broker connection with multi-node failover and command retry.
//!
//! A `BrokerConnection` is configured with an ordered list of node addresses.
//! `connect()` walks that list, sends `HELLO` to each node and keeps the first
//! one that answers. Every command is routed through that single active node.
//!
//! When a command fails at the transport level the connection re-resolves an
//! active node and hands the original failure back; `execute_with_retry` then
//! replays the command a bounded number of times. Retry happens per command,
//! so a multi-command operation is never replayed as a whole.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::{FromRedisValue, RedisError, RedisResult};
use tokio::runtime::Handle;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, error, info, warn};

use super::command::Command;
use crate::error::BrokerError;

/// Default number of retries after the first attempt of a command.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default time allowed for opening a connection to a node.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Address of a broker node (`host:port`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for NodeAddress {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| BrokerError::InvalidAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(BrokerError::InvalidAddress(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| BrokerError::InvalidAddress(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A live channel to one node that can carry commands.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Sends a command and waits for the raw reply.
    async fn send(&self, command: &Command) -> RedisResult<redis::Value>;
}

/// Opens command channels to node addresses.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, address: &NodeAddress) -> RedisResult<Box<dyn CommandChannel>>;
}

/// Connector for real nodes speaking the Redis protocol.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    connect_timeout: Duration,
}

impl RedisConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for RedisConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn open(&self, address: &NodeAddress) -> RedisResult<Box<dyn CommandChannel>> {
        let client = redis::Client::open(format!("redis://{}:{}/", address.host, address.port))?;
        let connection =
            tokio::time::timeout(self.connect_timeout, client.get_multiplexed_tokio_connection())
                .await
                .map_err(|_| {
                    RedisError::from(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("connecting to {} timed out", address),
                    ))
                })??;
        Ok(Box::new(RedisChannel { connection }))
    }
}

/// Command channel backed by a multiplexed Redis-protocol connection.
struct RedisChannel {
    connection: redis::aio::MultiplexedConnection,
}

#[async_trait]
impl CommandChannel for RedisChannel {
    async fn send(&self, command: &Command) -> RedisResult<redis::Value> {
        // Multiplexed connections are cheap handles onto one socket.
        let mut connection = self.connection.clone();
        command.to_cmd().query_async(&mut connection).await
    }
}

/// One broker endpoint with its identity and open channel.
pub struct Node {
    id: String,
    address: NodeAddress,
    channel: Box<dyn CommandChannel>,
}

impl Node {
    /// Node identity as reported by `HELLO`.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn host(&self) -> &str {
        &self.address.host
    }

    pub fn port(&self) -> u16 {
        self.address.port
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Node {}>", self.address)
    }
}

/// Returns true for failures of the transport rather than of the command.
pub(crate) fn is_connection_error(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout()
}

/// Connection to a broker cluster through a single active node.
pub struct BrokerConnection {
    /// Configured addresses in probe order with the last node seen at each.
    nodes: Mutex<Vec<(NodeAddress, Option<Arc<Node>>)>>,
    /// Node every command is routed through.
    active: RwLock<Option<Arc<Node>>>,
    /// Held while a reconnect is in flight.
    reconnect_lock: AsyncMutex<()>,
    connector: Arc<dyn Connector>,
    /// Runtime that opens node channels, so their I/O drivers outlive the
    /// caller's runtime.
    runtime: Option<Handle>,
    max_retries: u32,
}

impl BrokerConnection {
    /// Creates an unconnected broker connection.
    ///
    /// No node is contacted until `connect()` or the first command. Channels
    /// are opened on the runtime this is called from, if any.
    pub fn new(addresses: Vec<NodeAddress>, connector: Arc<dyn Connector>) -> Self {
        Self {
            nodes: Mutex::new(addresses.into_iter().map(|a| (a, None)).collect()),
            active: RwLock::new(None),
            reconnect_lock: AsyncMutex::new(()),
            connector,
            runtime: Handle::try_current().ok(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Opens node channels on `runtime`.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Parses `host:port` strings and connects to the first reachable node
    /// over the Redis protocol.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::InvalidAddress` for malformed addresses and
    /// `BrokerError::NoReachableNode` if no node answers.
    pub async fn open<S: AsRef<str>>(
        addresses: &[S],
        connect_timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, BrokerError> {
        let addresses = addresses
            .iter()
            .map(|a| a.as_ref().parse())
            .collect::<Result<Vec<NodeAddress>, _>>()?;
        let connection = Self::new(addresses, Arc::new(RedisConnector::new(connect_timeout)))
            .with_max_retries(max_retries);
        connection.connect().await?;
        Ok(connection)
    }

    /// Sets how many times a failed command is replayed.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the node commands are currently routed through.
    pub async fn active_node(&self) -> Option<Arc<Node>> {
        self.active.read().await.clone()
    }

    /// Returns every configured address with the id of the last node seen there.
    pub fn nodes(&self) -> Vec<(NodeAddress, Option<String>)> {
        self.lock_nodes()
            .iter()
            .map(|(address, node)| (address.clone(), node.as_ref().map(|n| n.id.clone())))
            .collect()
    }

    /// Connects to the first configured node that answers `HELLO`.
    ///
    /// Addresses are tried in configuration order and probing stops at the
    /// first success.
    pub async fn connect(&self) -> Result<Arc<Node>, BrokerError> {
        let _guard = self.reconnect_lock.lock().await;
        self.connect_locked().await
    }

    /// Sends a command to the active node once.
    ///
    /// On a transport failure the active node is re-resolved before the
    /// original failure is returned, so the caller can replay the command.
    pub async fn execute(&self, command: &Command) -> Result<redis::Value, BrokerError> {
        let node = match self.active_node().await {
            Some(node) => node,
            None => self.reconnect_from(None).await?,
        };

        match node.channel.send(command).await {
            Ok(value) => Ok(value),
            Err(err) if is_connection_error(&err) => {
                warn!(node = %node.address, error = %err, "Trying to reconnect");
                match self.reconnect_from(Some(&node)).await {
                    Ok(new_node) => warn!(node = %new_node.address, "Reconnected"),
                    Err(reconnect_err) => {
                        warn!(error = %reconnect_err, "Reconnect failed")
                    }
                }
                Err(BrokerError::ConnectionFailure {
                    node: node.address.to_string(),
                    source: err,
                })
            }
            Err(err) => Err(BrokerError::Command {
                command: command.name().to_string(),
                source: err,
            }),
        }
    }

    /// Sends a command, replaying it up to `max_retries` times on failure.
    pub async fn execute_with_retry(&self, command: &Command) -> Result<redis::Value, BrokerError> {
        let mut attempt = 0;
        loop {
            match self.execute(command).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    error!(
                        attempt = attempt,
                        command = %command.name(),
                        error = %err,
                        "Broker command failed"
                    );
                    if attempt >= self.max_retries {
                        return Err(err);
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Reconnects unless another caller already replaced `failed`.
    ///
    /// Callers that saw the same failing node queue on the reconnect lock;
    /// only the first one probes the cluster, the rest pick up its result.
    async fn reconnect_from(&self, failed: Option<&Arc<Node>>) -> Result<Arc<Node>, BrokerError> {
        let _guard = self.reconnect_lock.lock().await;

        if let Some(current) = self.active.read().await.clone() {
            let is_stale = failed.is_some_and(|f| Arc::ptr_eq(f, &current));
            if !is_stale {
                return Ok(current);
            }
        }

        self.connect_locked().await
    }

    /// Probes nodes in order. Must be called with `reconnect_lock` held.
    async fn connect_locked(&self) -> Result<Arc<Node>, BrokerError> {
        *self.active.write().await = None;

        let addresses: Vec<NodeAddress> =
            self.lock_nodes().iter().map(|(a, _)| a.clone()).collect();

        for (index, address) in addresses.iter().enumerate() {
            match self.probe(address).await {
                Ok(node) => {
                    let node = Arc::new(node);
                    if let Some(slot) = self.lock_nodes().get_mut(index) {
                        slot.1 = Some(Arc::clone(&node));
                    }
                    *self.active.write().await = Some(Arc::clone(&node));
                    info!(node = %address, node_id = %node.id, "Connected to node");
                    return Ok(node);
                }
                Err(err) => {
                    debug!(node = %address, error = %err, "Node unreachable");
                }
            }
        }

        Err(BrokerError::NoReachableNode(
            addresses.iter().map(ToString::to_string).collect(),
        ))
    }

    /// Opens a channel to `address` and performs the `HELLO` handshake.
    async fn probe(&self, address: &NodeAddress) -> Result<Node, BrokerError> {
        let failure = |source| BrokerError::ConnectionFailure {
            node: address.to_string(),
            source,
        };

        let channel = self.open_channel(address).await.map_err(failure)?;
        let reply = channel
            .send(&Command::new("HELLO"))
            .await
            .map_err(failure)?;

        // HELLO replies [version, node-id, node-entries...]
        let fields: Vec<redis::Value> =
            FromRedisValue::from_redis_value(&reply).map_err(|e| BrokerError::UnexpectedReply {
                command: "HELLO".to_string(),
                reason: e.to_string(),
            })?;
        let id = fields
            .get(1)
            .map(String::from_redis_value)
            .transpose()
            .map_err(|e| BrokerError::UnexpectedReply {
                command: "HELLO".to_string(),
                reason: e.to_string(),
            })?
            .ok_or_else(|| BrokerError::UnexpectedReply {
                command: "HELLO".to_string(),
                reason: "missing node id".to_string(),
            })?;

        Ok(Node {
            id,
            address: address.clone(),
            channel,
        })
    }

    /// Opens a channel on the owning runtime.
    ///
    /// Worker threads drive their own runtimes; a channel opened there would
    /// stop making progress once that runtime blocks or is dropped.
    async fn open_channel(&self, address: &NodeAddress) -> RedisResult<Box<dyn CommandChannel>> {
        let Some(runtime) = &self.runtime else {
            return self.connector.open(address).await;
        };
        let connector = Arc::clone(&self.connector);
        let target = address.clone();
        runtime
            .spawn(async move { connector.open(&target).await })
            .await
            .map_err(|e| {
                RedisError::from(std::io::Error::other(format!(
                    "opening {} failed: {}",
                    address, e
                )))
            })?
    }

    fn lock_nodes(&self) -> std::sync::MutexGuard<'_, Vec<(NodeAddress, Option<Arc<Node>>)>> {
        self.nodes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("nodes", &self.nodes())
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Barrier;

    fn addr(s: &str) -> NodeAddress {
        s.parse().expect("valid address")
    }

    fn connection(broker: &MemoryBroker, addresses: &[&str]) -> BrokerConnection {
        BrokerConnection::new(
            addresses.iter().map(|a| addr(a)).collect(),
            Arc::new(broker.clone()),
        )
    }

    #[test]
    fn test_node_address_parsing() {
        let a = addr("localhost:7711");
        assert_eq!(a.host, "localhost");
        assert_eq!(a.port, 7711);
        assert_eq!(a.to_string(), "localhost:7711");

        assert!("localhost".parse::<NodeAddress>().is_err());
        assert!(":7711".parse::<NodeAddress>().is_err());
        assert!("host:notaport".parse::<NodeAddress>().is_err());
    }

    #[tokio::test]
    async fn test_connect_skips_unreachable_node() {
        let broker = MemoryBroker::new();
        broker.set_reachable("bad:1", false);
        let conn = connection(&broker, &["bad:1", "good:2"]);

        let node = conn.connect().await.expect("second node reachable");
        assert_eq!(node.address().to_string(), "good:2");

        conn.execute(&Command::new("QLEN").arg("q"))
            .await
            .expect("routed to good node");
        assert_eq!(broker.command_count("good:2", "QLEN"), 1);
        assert_eq!(broker.command_count("bad:1", "QLEN"), 0);
    }

    #[tokio::test]
    async fn test_connect_stops_at_first_reachable_node() {
        let broker = MemoryBroker::new();
        let conn = connection(&broker, &["a:1", "b:2"]);

        conn.connect().await.expect("connect");
        assert_eq!(broker.command_count("a:1", "HELLO"), 1);
        assert_eq!(broker.command_count("b:2", "HELLO"), 0);

        let nodes = conn.nodes();
        assert!(nodes[0].1.is_some());
        assert!(nodes[1].1.is_none());
    }

    #[tokio::test]
    async fn test_connect_fails_when_no_node_reachable() {
        let broker = MemoryBroker::new();
        broker.set_reachable("a:1", false);
        broker.set_reachable("b:2", false);
        let conn = connection(&broker, &["a:1", "b:2"]);

        let err = conn.connect().await.expect_err("nothing reachable");
        assert!(matches!(err, BrokerError::NoReachableNode(ref tried) if tried.len() == 2));
        assert!(conn.active_node().await.is_none());
    }

    #[tokio::test]
    async fn test_execute_reconnects_and_returns_original_failure() {
        let broker = MemoryBroker::new();
        let conn = connection(&broker, &["a:1", "b:2"]);
        conn.connect().await.expect("connect");

        broker.set_reachable("a:1", false);
        let err = conn
            .execute(&Command::new("QLEN").arg("q"))
            .await
            .expect_err("active node died");
        assert!(err.is_connection_failure());

        let active = conn.active_node().await.expect("failed over");
        assert_eq!(active.address().to_string(), "b:2");
    }

    #[tokio::test]
    async fn test_retry_recovers_from_node_failure() {
        let broker = MemoryBroker::new();
        let conn = connection(&broker, &["a:1", "b:2"]);
        conn.connect().await.expect("connect");

        broker.set_reachable("a:1", false);
        let reply = conn
            .execute_with_retry(&Command::new("QLEN").arg("q"))
            .await
            .expect("retried on the second node");
        assert_eq!(reply, redis::Value::Int(0));
        assert_eq!(broker.command_count("b:2", "QLEN"), 1);
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let broker = MemoryBroker::new();
        let conn = connection(&broker, &["a:1"]).with_max_retries(2);
        conn.connect().await.expect("connect");

        let err = conn
            .execute_with_retry(&Command::new("NOSUCHCOMMAND"))
            .await
            .expect_err("command always fails");
        assert!(matches!(err, BrokerError::Command { .. }));
        assert_eq!(broker.command_count("a:1", "NOSUCHCOMMAND"), 3);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let broker = MemoryBroker::new();
        let conn = connection(&broker, &["a:1"]);
        conn.connect().await.expect("connect");

        broker.fail_next("a:1", 1);
        let reply = conn
            .execute_with_retry(&Command::new("QLEN").arg("q"))
            .await
            .expect("second attempt succeeds");
        assert_eq!(reply, redis::Value::Int(0));
    }

    #[tokio::test]
    async fn test_reconnect_is_single_flight() {
        let broker = MemoryBroker::new();
        let conn = connection(&broker, &["a:1"]);
        let first = conn.connect().await.expect("connect");
        assert_eq!(broker.command_count("a:1", "HELLO"), 1);

        let second = conn
            .reconnect_from(Some(&first))
            .await
            .expect("reconnect");
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(broker.command_count("a:1", "HELLO"), 2);

        // A caller still holding the old node must not trigger another probe.
        let third = conn
            .reconnect_from(Some(&first))
            .await
            .expect("picks up existing node");
        assert!(Arc::ptr_eq(&second, &third));
        assert_eq!(broker.command_count("a:1", "HELLO"), 2);
    }

    /// Hands out one channel whose commands (other than `HELLO`) wait until
    /// every caller has sent, then all fail together.
    struct GatedConnector {
        broker: MemoryBroker,
        opens: AtomicUsize,
        gate: Arc<Barrier>,
    }

    struct GatedChannel {
        inner: Box<dyn CommandChannel>,
        gate: Arc<Barrier>,
    }

    #[async_trait]
    impl Connector for GatedConnector {
        async fn open(&self, address: &NodeAddress) -> RedisResult<Box<dyn CommandChannel>> {
            let inner = self.broker.open(address).await?;
            if self.opens.fetch_add(1, Ordering::SeqCst) > 0 {
                return Ok(inner);
            }
            Ok(Box::new(GatedChannel {
                inner,
                gate: Arc::clone(&self.gate),
            }))
        }
    }

    #[async_trait]
    impl CommandChannel for GatedChannel {
        async fn send(&self, command: &Command) -> RedisResult<redis::Value> {
            if command.name() == "HELLO" {
                return self.inner.send(command).await;
            }
            self.gate.wait().await;
            Err(RedisError::from(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset",
            )))
        }
    }

    #[tokio::test]
    async fn test_concurrent_failures_reconnect_once() {
        const CALLERS: usize = 4;
        let broker = MemoryBroker::new();
        let connector = Arc::new(GatedConnector {
            broker: broker.clone(),
            opens: AtomicUsize::new(0),
            gate: Arc::new(Barrier::new(CALLERS)),
        });
        let conn = Arc::new(BrokerConnection::new(
            vec![addr("a:1"), addr("b:2")],
            connector.clone(),
        ));
        let first = conn.connect().await.expect("connect");

        let calls: Vec<_> = (0..CALLERS)
            .map(|_| {
                let conn = Arc::clone(&conn);
                tokio::spawn(async move { conn.execute(&Command::new("QLEN").arg("q")).await })
            })
            .collect();
        for call in calls {
            let err = call.await.expect("task").expect_err("same dead channel");
            assert!(err.is_connection_failure());
        }

        assert_eq!(connector.opens.load(Ordering::SeqCst), 2);
        assert_eq!(broker.command_count("a:1", "HELLO"), 2);
        assert_eq!(broker.command_count("b:2", "HELLO"), 0);
        let active = conn.active_node().await.expect("reconnected");
        assert!(!Arc::ptr_eq(&first, &active));
    }

    /// Records the name of the thread each channel is opened on.
    struct ThreadRecorder {
        broker: MemoryBroker,
        threads: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl Connector for ThreadRecorder {
        async fn open(&self, address: &NodeAddress) -> RedisResult<Box<dyn CommandChannel>> {
            self.threads
                .lock()
                .expect("lock")
                .push(std::thread::current().name().map(str::to_string));
            self.broker.open(address).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_reconnect_from_worker_thread_opens_on_owning_runtime() {
        let broker = MemoryBroker::new();
        let recorder = Arc::new(ThreadRecorder {
            broker: broker.clone(),
            threads: Mutex::new(Vec::new()),
        });
        let conn = Arc::new(BrokerConnection::new(vec![addr("a:1")], recorder.clone()));
        let first = conn.connect().await.expect("connect");

        let worker_conn = Arc::clone(&conn);
        let worker = std::thread::Builder::new()
            .name("worker-0".to_string())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("runtime");
                runtime
                    .block_on(worker_conn.reconnect_from(Some(&first)))
                    .expect("reconnect");
            })
            .expect("spawn");
        tokio::task::spawn_blocking(move || worker.join())
            .await
            .expect("join")
            .expect("worker thread");

        let threads = recorder.threads.lock().expect("lock").clone();
        assert_eq!(threads.len(), 2);
        assert_ne!(threads[1].as_deref(), Some("worker-0"));

        // the worker runtime is gone; the reconnected channel still serves
        conn.execute(&Command::new("QLEN").arg("q"))
            .await
            .expect("channel outlives worker runtime");
    }

    #[tokio::test]
    async fn test_first_command_connects_lazily() {
        let broker = MemoryBroker::new();
        let conn = connection(&broker, &["a:1"]);

        conn.execute(&Command::new("QLEN").arg("q"))
            .await
            .expect("lazy connect");
        assert_eq!(broker.command_count("a:1", "HELLO"), 1);
    }
}
