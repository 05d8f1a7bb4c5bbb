//! Named worker targets.
//!
//! A worker process cannot receive code over the wire, so the parent and
//! child binaries share a registry of named entry points. The spawner
//! passes the target name through the environment; the child looks it up
//! here and runs it against a freshly connected state handle.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use stateroom_core::{Result, StateHandle};
use tracing::warn;

/// A worker entry point: runs with a handle to the shared state and the
/// opaque props supplied when the process record was created.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    async fn run(&self, state: StateHandle, props: Value) -> Result<()>;
}

type BoxedWorkerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type BoxedWorkerFn = Box<dyn Fn(StateHandle, Value) -> BoxedWorkerFuture + Send + Sync>;

struct FnWorker {
    f: BoxedWorkerFn,
}

#[async_trait]
impl Worker for FnWorker {
    async fn run(&self, state: StateHandle, props: Value) -> Result<()> {
        (self.f)(state, props).await
    }
}

/// The set of worker targets known to this binary.
#[derive(Default)]
pub struct WorkerSet {
    targets: HashMap<String, Arc<dyn Worker>>,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker under a target name.
    pub fn register(mut self, name: impl Into<String>, worker: impl Worker) -> Self {
        let name = name.into();
        if self
            .targets
            .insert(name.clone(), Arc::new(worker))
            .is_some()
        {
            warn!(worker = %name, "worker target re-registered, replacing");
        }
        self
    }

    /// Register a plain async function as a worker.
    pub fn register_fn<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StateHandle, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(
            name,
            FnWorker {
                f: Box::new(move |state, props| Box::pin(f(state, props))),
            },
        )
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Worker>> {
        self.targets.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.targets.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.targets.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stateroom_core::StateServer;

    #[test]
    fn test_register_and_lookup() {
        let workers = WorkerSet::new()
            .register_fn("a", |_state, _props| async { Ok(()) })
            .register_fn("b", |_state, _props| async { Ok(()) });

        assert_eq!(workers.len(), 2);
        assert!(workers.contains("a"));
        assert!(!workers.contains("c"));
        assert_eq!(workers.names(), vec!["a", "b"]);
        assert!(workers.get("a").is_some());
        assert!(workers.get("c").is_none());
    }

    #[tokio::test]
    async fn test_fn_worker_runs_against_state() {
        let workers = WorkerSet::new().register_fn("writer", |state: StateHandle, props| async move {
            state.set("props", props).await?;
            state.set("done", json!(true)).await
        });

        let mut server = StateServer::bind("127.0.0.1:0").await.unwrap();
        let handle = StateHandle::connect(server.addr()).await.unwrap();

        let worker = workers.get("writer").unwrap();
        worker.run(handle, json!({"n": 7})).await.unwrap();

        let check = StateHandle::connect(server.addr()).await.unwrap();
        assert_eq!(check.get("props").await.unwrap(), json!({"n": 7}));
        assert_eq!(check.get("done").await.unwrap(), json!(true));

        server.shutdown();
    }
}
