//! Task handlers: the callables behind registered task names.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

/// A unit of work that can be invoked by name.
///
/// Handlers receive the decoded positional and keyword arguments of a job
/// and return a JSON result. Any error marks the job as failed, leaving it
/// unacknowledged so the broker redelivers it.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn call(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> anyhow::Result<Value>;
}

/// Handler backed by a synchronous closure.
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F> TaskHandler for FnHandler<F>
where
    F: Fn(&[Value], &Map<String, Value>) -> anyhow::Result<Value> + Send + Sync,
{
    async fn call(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> anyhow::Result<Value> {
        (self.f)(&args, &kwargs)
    }
}

/// Handler backed by a closure returning a future.
pub struct AsyncFnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> TaskHandler for AsyncFnHandler<F>
where
    F: Fn(Vec<Value>, Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn call(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> anyhow::Result<Value> {
        (self.f)(args, kwargs).await
    }
}

/// Wraps a synchronous closure as a shareable handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(&[Value], &Map<String, Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    Arc::new(FnHandler { f })
}

/// Wraps an async closure as a shareable handler.
pub fn async_handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(Vec<Value>, Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(AsyncFnHandler { f })
}
