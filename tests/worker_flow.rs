//! End-to-end flows through the task manager, worker and in-memory broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use disq::broker::{BrokerConnection, JobGateway, MemoryBroker, NodeAddress};
use disq::scheduler::{
    ExecutionModel, LoopSettings, QueueAdmission, SharedPoolStats, Worker, WorkerPool,
    WorkerPoolConfig,
};
use disq::{async_handler_fn, handler_fn, TaskCall, TaskManager, TaskOptions};
use serde_json::{json, Value};
use tokio::sync::broadcast;

fn connection(broker: &MemoryBroker, nodes: &[&str]) -> Arc<BrokerConnection> {
    let addresses = nodes
        .iter()
        .map(|n| n.parse::<NodeAddress>().expect("valid address"))
        .collect();
    Arc::new(BrokerConnection::new(addresses, Arc::new(broker.clone())))
}

fn manager(broker: &MemoryBroker, nodes: &[&str]) -> TaskManager {
    TaskManager::new(Arc::new(JobGateway::new(connection(broker, nodes))))
}

fn add_handler() -> Arc<dyn disq::TaskHandler> {
    handler_fn(|args, _| Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>())))
}

fn pair(a: i64, b: i64) -> TaskCall {
    TaskCall::new()
        .arg(a)
        .and_then(|c| c.arg(b))
        .expect("serializable")
}

fn worker(manager: &Arc<TaskManager>, shutdown: &broadcast::Sender<()>, fetch_timeout: Duration) -> Worker {
    Worker::new(
        "worker-0",
        Arc::clone(manager),
        Arc::new(QueueAdmission::for_manager(manager)),
        shutdown.subscribe(),
        LoopSettings {
            fetch_timeout,
            fetch_count: 1,
            poll_interval: Duration::from_millis(10),
        },
        Arc::new(SharedPoolStats::new()),
    )
}

#[tokio::test]
async fn test_submitted_job_is_executed_and_acknowledged() {
    let broker = MemoryBroker::new();
    let mut manager = manager(&broker, &["localhost:7711"]);
    manager
        .register("add", add_handler(), TaskOptions::new())
        .expect("register");
    let manager = Arc::new(manager);

    let job_id = manager
        .delay("add", pair(1, 2))
        .await
        .expect("submit")
        .job_id()
        .expect("submitted")
        .to_string();

    let (shutdown, _) = broadcast::channel(1);
    let mut worker = worker(&manager, &shutdown, Duration::from_millis(50));
    assert_eq!(worker.poll_once().await.expect("poll"), 1);

    assert_eq!(broker.ack_count(&job_id), 1);
    assert_eq!(manager.gateway().qlen("add").await.expect("qlen"), 0);
    assert_eq!(worker.poll_once().await.expect("poll"), 0);
}

#[tokio::test]
async fn test_unreachable_first_node_is_skipped() {
    let broker = MemoryBroker::new();
    broker.set_reachable("bad:1", false);

    let mut manager = manager(&broker, &["bad:1", "good:2"]);
    manager
        .register("add", add_handler(), TaskOptions::new())
        .expect("register");

    manager.delay("add", pair(1, 2)).await.expect("submit");

    let active = manager
        .gateway()
        .connection()
        .active_node()
        .await
        .expect("connected");
    assert_eq!(active.address().to_string(), "good:2");
    assert_eq!(broker.command_count("good:2", "ADDJOB"), 1);
    assert_eq!(broker.command_count("bad:1", "ADDJOB"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failing_job_is_redelivered_until_it_succeeds() {
    let broker = MemoryBroker::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let mut manager = manager(&broker, &["localhost:7711"]);
    manager
        .register(
            "flaky",
            handler_fn(move |_, _| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt <= 2 {
                    anyhow::bail!("attempt {} failed", attempt);
                }
                Ok(json!(attempt))
            }),
            TaskOptions::new().with_retry(1),
        )
        .expect("register");
    let manager = Arc::new(manager);

    let job_id = manager
        .delay("flaky", TaskCall::new())
        .await
        .expect("submit")
        .job_id()
        .expect("submitted")
        .to_string();

    let (shutdown, _) = broadcast::channel(1);
    let mut worker = worker(&manager, &shutdown, Duration::from_secs(5));
    for _ in 0..3 {
        assert_eq!(worker.poll_once().await.expect("poll"), 1);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(broker.ack_count(&job_id), 1);
    assert_eq!(worker.poll_once().await.expect("poll"), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_max_workers_limits_concurrent_jobs() {
    let broker = MemoryBroker::new();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    let mut manager = manager(&broker, &["localhost:7711"]);
    {
        let (running, peak, done) = (Arc::clone(&running), Arc::clone(&peak), Arc::clone(&done));
        manager
            .register(
                "slow",
                async_handler_fn(move |_, _| {
                    let (running, peak, done) =
                        (Arc::clone(&running), Arc::clone(&peak), Arc::clone(&done));
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        done.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, anyhow::Error>(json!(null))
                    }
                }),
                TaskOptions::new().with_max_workers(1),
            )
            .expect("register");
    }
    let manager = Arc::new(manager);
    for _ in 0..4 {
        manager.delay("slow", TaskCall::new()).await.expect("submit");
    }

    let config = WorkerPoolConfig::new(ExecutionModel::Coroutine, 3)
        .with_fetch_timeout(Duration::from_millis(20))
        .with_poll_interval(Duration::from_millis(5))
        .with_shutdown_timeout(Duration::from_secs(5));
    let mut pool = WorkerPool::new(config, Arc::clone(&manager)).expect("valid config");
    pool.start().await.expect("start");

    for _ in 0..500 {
        if done.load(Ordering::SeqCst) == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    pool.shutdown().await.expect("shutdown");

    assert_eq!(done.load(Ordering::SeqCst), 4);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(broker.total_command_count("ACKJOB"), 4);
}

#[tokio::test]
async fn test_debug_task_never_reaches_the_broker() {
    let broker = MemoryBroker::new();
    let mut manager = manager(&broker, &["localhost:7711"]);
    manager
        .register("addn", add_handler(), TaskOptions::new().with_debug(true))
        .expect("register");

    let invocation = manager.delay("addn", pair(1, 3)).await.expect("invoke");
    assert_eq!(invocation.value(), Some(&json!(4)));
    assert_eq!(broker.total_command_count("ADDJOB"), 0);
}
