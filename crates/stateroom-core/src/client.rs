//! Client handle for the coordination server.
//!
//! [`StateHandle`] presents the shared state as a dict-like façade. Every
//! method sends exactly one request and awaits its response; the watch
//! methods additionally follow the returned private-channel address and
//! pull the single delivered result, so a two-round-trip protocol reads as
//! one blocking call.
//!
//! There is no read timeout by design: a watch that can never be satisfied
//! blocks until the waiting process is torn down.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::ServiceConfig;
use crate::error::{Result, StateroomError};
use crate::predicate::Predicate;
use crate::protocol::{read_frame, write_frame, Action, OptArg, Request, Response};
use crate::store::StateMap;

/// Handle to a state server, shared by everything in one worker process.
#[derive(Debug)]
pub struct StateHandle {
    stream: Mutex<TcpStream>,
    addr: SocketAddr,
    next_id: AtomicU64,
}

impl StateHandle {
    /// Connect to a server.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = tokio::time::timeout(ServiceConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| StateroomError::Unreachable {
                addr: addr.to_string(),
                message: "connect timed out".into(),
            })?
            .map_err(|e| StateroomError::Unreachable {
                addr: addr.to_string(),
                message: e.to_string(),
            })?;

        debug!("state handle connected to {}", addr);

        Ok(Self {
            stream: Mutex::new(stream),
            addr,
            next_id: AtomicU64::new(1),
        })
    }

    /// Connect to a server by address string (`host:port`).
    pub async fn connect_str(addr: &str) -> Result<Self> {
        let addr: SocketAddr = addr.parse().map_err(|_| StateroomError::Unreachable {
            addr: addr.to_string(),
            message: "invalid endpoint address".into(),
        })?;
        Self::connect(addr).await
    }

    /// The server address this handle is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// One request, one response.
    async fn call(&self, action: Action) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request { id, action };
        let request_bytes = serde_json::to_vec(&request)?;

        let mut stream = self.stream.lock().await;
        let (mut reader, mut writer) = stream.split();

        write_frame(&mut writer, &request_bytes).await?;

        let response_bytes =
            read_frame(&mut reader)
                .await?
                .ok_or_else(|| StateroomError::Unreachable {
                    addr: self.addr.to_string(),
                    message: "server closed the connection".into(),
                })?;

        let response: Response = serde_json::from_slice(&response_bytes)?;

        if let Some(err) = response.error {
            return Err(err.into());
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Register a watch, then pull the single result from the private
    /// channel the server allocated for it. The control stream is free
    /// for other callers while this waits.
    async fn call_and_pull(&self, action: Action) -> Result<Value> {
        let channel = self.call(action).await?;
        let channel = channel.as_str().ok_or_else(|| StateroomError::Protocol {
            message: "watch registration did not return a channel address".into(),
        })?;
        let channel: SocketAddr = channel.parse().map_err(|_| StateroomError::Protocol {
            message: format!("bad watch channel address: {channel}"),
        })?;

        let mut stream =
            tokio::time::timeout(ServiceConfig::CONNECT_TIMEOUT, TcpStream::connect(channel))
                .await
                .map_err(|_| StateroomError::Unreachable {
                    addr: channel.to_string(),
                    message: "watch channel connect timed out".into(),
                })?
                .map_err(|e| StateroomError::Unreachable {
                    addr: channel.to_string(),
                    message: e.to_string(),
                })?;

        let (mut reader, _) = stream.split();
        let payload = read_frame(&mut reader)
            .await?
            .ok_or(StateroomError::WatchLost)?;
        Ok(serde_json::from_slice(&payload)?)
    }

    // ---- dict façade ----

    /// Read a key; `null` when absent.
    pub async fn get(&self, key: &str) -> Result<Value> {
        self.get_or(key, Value::Null).await
    }

    /// Read a key, falling back to `default` when absent.
    pub async fn get_or(&self, key: &str, default: Value) -> Result<Value> {
        self.call(Action::Get {
            key: key.into(),
            default,
        })
        .await
    }

    /// Read a key; absent keys are a [`StateroomError::KeyNotFound`].
    pub async fn get_item(&self, key: &str) -> Result<Value> {
        self.call(Action::GetItem { key: key.into() }).await
    }

    /// Write a key.
    pub async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.call(Action::Set {
            key: key.into(),
            value,
        })
        .await?;
        Ok(())
    }

    /// Remove a key; absent keys are a [`StateroomError::KeyNotFound`].
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.call(Action::DelItem { key: key.into() }).await?;
        Ok(())
    }

    pub async fn contains(&self, key: &str) -> Result<bool> {
        let value = self.call(Action::Contains { key: key.into() }).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Remove and return a key's value; absent keys are a
    /// [`StateroomError::KeyNotFound`].
    pub async fn pop(&self, key: &str) -> Result<Value> {
        self.call(Action::Pop {
            key: key.into(),
            default: OptArg::Absent,
        })
        .await
    }

    /// Remove and return a key's value, or `default` when absent.
    pub async fn pop_or(&self, key: &str, default: Value) -> Result<Value> {
        self.call(Action::Pop {
            key: key.into(),
            default: OptArg::Given(default),
        })
        .await
    }

    /// Remove and return some `(key, value)` pair; an empty state is a
    /// [`StateroomError::KeyNotFound`].
    pub async fn pop_item(&self) -> Result<(String, Value)> {
        let value = self.call(Action::PopItem).await?;
        match value {
            Value::Array(mut pair) if pair.len() == 2 => {
                let value = pair.pop().unwrap_or(Value::Null);
                let key = match pair.pop() {
                    Some(Value::String(key)) => key,
                    _ => String::new(),
                };
                Ok((key, value))
            }
            other => Err(StateroomError::Protocol {
                message: format!("pop_item returned a non-pair: {other}"),
            }),
        }
    }

    /// Remove every key.
    pub async fn clear(&self) -> Result<()> {
        self.call(Action::Clear).await?;
        Ok(())
    }

    /// Merge entries into the state, last writer wins per key.
    pub async fn update<I>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        self.call(Action::Update {
            entries: entries.into_iter().collect(),
        })
        .await?;
        Ok(())
    }

    /// Return the existing value for `key`, or insert and return `default`.
    pub async fn set_default(&self, key: &str, default: Value) -> Result<Value> {
        self.call(Action::SetDefault {
            key: key.into(),
            default,
        })
        .await
    }

    /// Whole-state equality against a local mapping.
    pub async fn eq_state(&self, other: StateMap) -> Result<bool> {
        let value = self.call(Action::Eq { other }).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Whole-state inequality against a local mapping.
    pub async fn ne_state(&self, other: StateMap) -> Result<bool> {
        let value = self.call(Action::Ne { other }).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// The full state as a local mapping.
    pub async fn snapshot(&self) -> Result<StateMap> {
        let value = self.call(Action::GetState).await?;
        match value {
            Value::Object(map) => Ok(map),
            other => Err(StateroomError::Protocol {
                message: format!("snapshot returned a non-object: {other}"),
            }),
        }
    }

    pub async fn items(&self) -> Result<Vec<(String, Value)>> {
        Ok(self.snapshot().await?.into_iter().collect())
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.snapshot().await?.keys().cloned().collect())
    }

    pub async fn values(&self) -> Result<Vec<Value>> {
        Ok(self.snapshot().await?.values().cloned().collect())
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.snapshot().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.snapshot().await?.is_empty())
    }

    // ---- blocking synchronization primitives ----

    /// Wait until `state.get(key) == value`. Returns immediately when the
    /// condition already holds at registration.
    pub async fn get_when_equal(&self, key: &str, value: Value) -> Result<()> {
        self.call_and_pull(Action::WatchEqual {
            key: key.into(),
            value,
        })
        .await?;
        Ok(())
    }

    /// Wait until a mutation touches one of `keys` (any mutation at all
    /// when `keys` is empty); returns the state snapshot taken after that
    /// mutation.
    pub async fn get_when_change(&self, keys: &[&str]) -> Result<StateMap> {
        let payload = self
            .call_and_pull(Action::WatchChange {
                keys: keys.iter().map(|k| k.to_string()).collect(),
            })
            .await?;
        match payload {
            Value::Object(map) => Ok(map),
            other => Err(StateroomError::Protocol {
                message: format!("change watch returned a non-object: {other}"),
            }),
        }
    }

    /// Wait until `key`'s value differs from the one observed at
    /// registration time; returns the new value.
    pub async fn get_value_when_change(&self, key: &str) -> Result<Value> {
        self.call_and_pull(Action::WatchValueChange {
            key: key.into(),
            baseline: OptArg::Absent,
        })
        .await
    }

    /// Wait until `key`'s value differs from an explicit `baseline`;
    /// returns the new value. Returns immediately when it already differs.
    pub async fn get_value_when_change_from(&self, key: &str, baseline: Value) -> Result<Value> {
        self.call_and_pull(Action::WatchValueChange {
            key: key.into(),
            baseline: OptArg::Given(baseline),
        })
        .await
    }

    /// Wait until `predicate` holds; returns the state snapshot it held
    /// against. Returns immediately when it already holds.
    pub async fn get_when(&self, predicate: Predicate) -> Result<StateMap> {
        let payload = self
            .call_and_pull(Action::WatchPredicate { predicate })
            .await?;
        match payload {
            Value::Object(map) => Ok(map),
            other => Err(StateroomError::Protocol {
                message: format!("predicate watch returned a non-object: {other}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::CmpOp;
    use crate::server::StateServer;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    async fn setup() -> (crate::server::StateServerHandle, StateHandle) {
        let server = StateServer::bind("127.0.0.1:0").await.unwrap();
        let handle = StateHandle::connect(server.addr()).await.unwrap();
        (server, handle)
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let (mut server, handle) = setup().await;

        handle.set("x", json!(1)).await.unwrap();
        assert_eq!(handle.get("x").await.unwrap(), json!(1));
        assert_eq!(handle.get("missing").await.unwrap(), Value::Null);
        assert_eq!(
            handle.get_or("missing", json!("d")).await.unwrap(),
            json!("d")
        );

        server.shutdown();
    }

    #[tokio::test]
    async fn test_missing_key_maps_to_typed_error() {
        let (mut server, handle) = setup().await;

        match handle.get_item("absent").await {
            Err(StateroomError::KeyNotFound { key }) => assert_eq!(key, "absent"),
            other => panic!("expected KeyNotFound, got {other:?}"),
        }
        assert!(matches!(
            handle.remove("absent").await,
            Err(StateroomError::KeyNotFound { .. })
        ));
        assert!(matches!(
            handle.pop("absent").await,
            Err(StateroomError::KeyNotFound { .. })
        ));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_pop_and_contains() {
        let (mut server, handle) = setup().await;

        handle.set("job", json!("started")).await.unwrap();
        assert!(handle.contains("job").await.unwrap());
        assert_eq!(handle.pop("job").await.unwrap(), json!("started"));
        assert!(!handle.contains("job").await.unwrap());
        assert_eq!(
            handle.pop_or("job", json!("gone")).await.unwrap(),
            json!("gone")
        );

        server.shutdown();
    }

    #[tokio::test]
    async fn test_update_and_items() {
        let (mut server, handle) = setup().await;

        handle.set("a", json!(0)).await.unwrap();
        handle
            .update(vec![("a".to_string(), json!(1)), ("b".to_string(), json!(2))])
            .await
            .unwrap();

        let mut items = handle.items().await.unwrap();
        items.sort_by(|(a, _), (b, _)| a.cmp(b));
        assert_eq!(
            items,
            vec![("a".to_string(), json!(1)), ("b".to_string(), json!(2))]
        );
        assert_eq!(handle.len().await.unwrap(), 2);
        assert!(!handle.is_empty().await.unwrap());

        server.shutdown();
    }

    #[tokio::test]
    async fn test_set_default_and_eq() {
        let (mut server, handle) = setup().await;

        assert_eq!(
            handle.set_default("k", json!("v")).await.unwrap(),
            json!("v")
        );
        assert_eq!(
            handle.set_default("k", json!("other")).await.unwrap(),
            json!("v")
        );

        let mut expected = StateMap::new();
        expected.insert("k".into(), json!("v"));
        assert!(handle.eq_state(expected.clone()).await.unwrap());
        assert!(!handle.ne_state(expected).await.unwrap());

        server.shutdown();
    }

    #[tokio::test]
    async fn test_pop_item_drains_state() {
        let (mut server, handle) = setup().await;

        handle.set("only", json!(1)).await.unwrap();
        let (key, value) = handle.pop_item().await.unwrap();
        assert_eq!(key, "only");
        assert_eq!(value, json!(1));
        assert!(handle.is_empty().await.unwrap());
        assert!(matches!(
            handle.pop_item().await,
            Err(StateroomError::KeyNotFound { .. })
        ));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_get_when_equal_already_true_returns_immediately() {
        let (mut server, handle) = setup().await;

        handle.set("phase", json!("ready")).await.unwrap();
        // No concurrent writer: this only completes via the
        // registration-time check.
        tokio::time::timeout(
            Duration::from_secs(1),
            handle.get_when_equal("phase", json!("ready")),
        )
        .await
        .expect("should not block")
        .unwrap();

        server.shutdown();
    }

    #[tokio::test]
    async fn test_get_when_equal_wakes_on_write() {
        let (mut server, handle) = setup().await;
        let addr = server.addr();

        let waiter = tokio::spawn(async move {
            let handle = StateHandle::connect(addr).await.unwrap();
            handle.get_when_equal("flag", json!(true)).await
        });

        // Give the waiter time to register, then write the awaited value.
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.set("flag", json!(false)).await.unwrap();
        handle.set("flag", json!(true)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        server.shutdown();
    }

    #[tokio::test]
    async fn test_get_value_when_change_returns_new_value() {
        let (mut server, handle) = setup().await;
        let addr = server.addr();

        handle.set("x", json!(0)).await.unwrap();

        let waiter = tokio::spawn(async move {
            let handle = StateHandle::connect(addr).await.unwrap();
            handle.get_value_when_change("x").await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        // Re-writing the baseline value must not wake the watcher.
        handle.set("x", json!(0)).await.unwrap();
        handle.set("x", json!(1)).await.unwrap();

        let value = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(value, json!(1));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_get_value_when_change_with_explicit_baseline() {
        let (mut server, handle) = setup().await;

        handle.set("x", json!(5)).await.unwrap();
        // Baseline 0 already differs from the stored 5: immediate return.
        let value = tokio::time::timeout(
            Duration::from_secs(1),
            handle.get_value_when_change_from("x", json!(0)),
        )
        .await
        .expect("should not block")
        .unwrap();
        assert_eq!(value, json!(5));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_get_when_change_delivers_snapshot() {
        let (mut server, handle) = setup().await;
        let addr = server.addr();

        let waiter = tokio::spawn(async move {
            let handle = StateHandle::connect(addr).await.unwrap();
            handle.get_when_change(&["watched"]).await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        // A mutation on an unrelated key must not wake the watcher.
        handle.set("unrelated", json!(1)).await.unwrap();
        handle.set("watched", json!("now")).await.unwrap();

        let snapshot = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.get("watched"), Some(&json!("now")));
        assert_eq!(snapshot.get("unrelated"), Some(&json!(1)));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_get_when_predicate() {
        let (mut server, handle) = setup().await;
        let addr = server.addr();

        handle.set("count", json!(0)).await.unwrap();

        let waiter = tokio::spawn(async move {
            let handle = StateHandle::connect(addr).await.unwrap();
            handle
                .get_when(Predicate::compare("count", CmpOp::Ge, 3))
                .await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        for n in 1..=3 {
            handle.set("count", json!(n)).await.unwrap();
        }

        let snapshot = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.get("count"), Some(&json!(3)));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_two_watchers_on_same_key_both_wake() {
        let (mut server, handle) = setup().await;
        let addr = server.addr();

        let spawn_waiter = |addr: SocketAddr| {
            tokio::spawn(async move {
                let handle = StateHandle::connect(addr).await.unwrap();
                handle.get_when_equal("shared", json!("go")).await
            })
        };
        let first = spawn_waiter(addr);
        let second = spawn_waiter(addr);

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.set("shared", json!("go")).await.unwrap();

        let (first, second) = tokio::join!(
            tokio::time::timeout(Duration::from_secs(5), first),
            tokio::time::timeout(Duration::from_secs(5), second),
        );
        first.unwrap().unwrap().unwrap();
        second.unwrap().unwrap().unwrap();

        server.shutdown();
    }

    #[tokio::test]
    async fn test_handle_shared_across_tasks() {
        let (mut server, handle) = setup().await;
        let handle = Arc::new(handle);

        let mut tasks = Vec::new();
        for n in 0..8 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle.set(&format!("key{n}"), json!(n)).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(handle.len().await.unwrap(), 8);

        server.shutdown();
    }
}
