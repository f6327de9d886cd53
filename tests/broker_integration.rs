//! Integration tests against a live Disque node.
//!
//! Run with a node on localhost:7711:
//! cargo test --test broker_integration -- --ignored

use std::sync::Arc;
use std::time::Duration;

use disq::broker::{AddJobOptions, BrokerConnection, GetJobOptions, JobGateway};
use disq::{handler_fn, ClientSettings, TaskCall, TaskManager, TaskOptions};
use serde_json::json;

const NODE: &str = "localhost:7711";

async fn gateway() -> JobGateway {
    let connection = BrokerConnection::open(&[NODE], Duration::from_secs(5), 2)
        .await
        .expect("Disque node must be running on localhost:7711");
    let gateway = JobGateway::new(Arc::new(connection));
    gateway.flush_all().await.expect("flush");
    gateway
}

#[tokio::test]
#[ignore] // Run with: cargo test --test broker_integration -- --ignored
async fn test_add_get_ack() {
    let gateway = gateway().await;

    let id = gateway
        .add_job("disq-test", b"hello", &AddJobOptions::default())
        .await
        .expect("add");
    assert_eq!(gateway.qlen("disq-test").await.expect("qlen"), 1);

    let jobs = gateway
        .get_jobs(
            &["disq-test".to_string()],
            &GetJobOptions::default().with_timeout(Duration::from_secs(1)),
        )
        .await
        .expect("fetch");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, id);
    assert_eq!(jobs[0].payload, b"hello");

    assert_eq!(gateway.ack_job(&[id]).await.expect("ack"), 1);
    assert_eq!(gateway.qlen("disq-test").await.expect("qlen"), 0);
}

#[tokio::test]
#[ignore]
async fn test_get_job_times_out_empty() {
    let gateway = gateway().await;
    let jobs = gateway
        .get_jobs(
            &["disq-empty".to_string()],
            &GetJobOptions::default().with_timeout(Duration::from_millis(100)),
        )
        .await
        .expect("fetch");
    assert!(jobs.is_empty());
}

#[tokio::test]
#[ignore]
async fn test_show_reports_submission_parameters() {
    let gateway = gateway().await;
    let options = AddJobOptions {
        ttl: 100,
        retry: 10,
        ..Default::default()
    };
    let id = gateway
        .add_job("disq-show", b"x", &options)
        .await
        .expect("add");

    let show = gateway.show(&id).await.expect("show").expect("job exists");
    let ttl: i64 = redis::from_redis_value(&show["ttl"]).expect("ttl");
    assert_eq!(ttl, 100);
    gateway.del_job(&[id]).await.expect("delete");
}

#[tokio::test]
#[ignore]
async fn test_manager_submits_to_task_queue() {
    gateway().await;
    let settings = ClientSettings::default().with_nodes([NODE]);
    let mut manager = TaskManager::connect(&settings).await.expect("connect");
    manager
        .register("disq-add", handler_fn(|_, _| Ok(json!(3))), TaskOptions::new())
        .expect("register");

    let invocation = manager
        .delay("disq-add", TaskCall::new().arg(1).expect("serializable"))
        .await
        .expect("submit");
    assert!(invocation.job_id().is_some());
    assert_eq!(manager.gateway().qlen("disq-add").await.expect("qlen"), 1);
}
