//! Pending watchers and their evaluation.
//!
//! A watcher is strictly one-shot: it is checked once at registration
//! (except the changed-keys kind, which by definition waits for a
//! mutation), then re-checked in registration order after every mutation
//! until it fires, at which point its result is pushed through its private
//! channel and the watcher is gone. A client that wants to keep watching
//! re-registers after each wakeup.

use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::predicate::Predicate;
use crate::store::StateMap;

/// The condition one watcher is waiting on.
#[derive(Debug, Clone)]
pub enum Condition {
    /// `state.get(key) == value`; delivers `null`.
    Equal { key: String, value: Value },

    /// A mutation touched one of `keys` (any key when empty); delivers the
    /// full state snapshot.
    KeysChanged { keys: Vec<String> },

    /// `state.get(key)` differs from `baseline`; delivers the new value.
    /// The baseline is resolved before registration.
    ValueChanged { key: String, baseline: Value },

    /// `predicate` holds; delivers the full state snapshot.
    Holds { predicate: Predicate },
}

impl Condition {
    /// Check against the current state without any mutation having
    /// happened. `KeysChanged` never fires here: it waits for an event,
    /// not a state shape.
    pub fn check_now(&self, state: &StateMap) -> Option<Value> {
        match self {
            Condition::KeysChanged { .. } => None,
            _ => self.check(state, &[]),
        }
    }

    /// Check after a mutation that touched `touched`.
    fn check(&self, state: &StateMap, touched: &[String]) -> Option<Value> {
        match self {
            Condition::Equal { key, value } => {
                (lookup(state, key) == value).then_some(Value::Null)
            }
            Condition::KeysChanged { keys } => {
                let hit = !touched.is_empty()
                    && (keys.is_empty() || touched.iter().any(|t| keys.contains(t)));
                hit.then(|| snapshot(state))
            }
            Condition::ValueChanged { key, baseline } => {
                let current = lookup(state, key);
                (current != baseline).then(|| current.clone())
            }
            Condition::Holds { predicate } => predicate.eval(state).then(|| snapshot(state)),
        }
    }
}

fn lookup<'a>(state: &'a StateMap, key: &str) -> &'a Value {
    state.get(key).unwrap_or(&Value::Null)
}

fn snapshot(state: &StateMap) -> Value {
    Value::Object(state.clone())
}

struct Watcher {
    id: Uuid,
    condition: Condition,
    tx: oneshot::Sender<Value>,
}

/// The set of registered-but-unsatisfied watchers, in registration order.
#[derive(Default)]
pub struct WatchManager {
    pending: Vec<Watcher>,
}

impl WatchManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Queue a watcher whose condition did not hold at registration time.
    pub fn register(&mut self, condition: Condition, tx: oneshot::Sender<Value>) -> Uuid {
        let id = Uuid::new_v4();
        tracing::debug!(watcher = %id, "watcher registered");
        self.pending.push(Watcher { id, condition, tx });
        id
    }

    /// Re-evaluate every pending watcher after a mutation that touched
    /// `touched`, firing and removing the satisfied ones in registration
    /// order.
    pub fn sweep(&mut self, state: &StateMap, touched: &[String]) {
        if self.pending.is_empty() {
            return;
        }

        let pending = std::mem::take(&mut self.pending);
        for watcher in pending {
            if watcher.tx.is_closed() {
                // The registrant went away before its condition held.
                tracing::debug!(watcher = %watcher.id, "watcher abandoned, dropping");
                continue;
            }
            match watcher.condition.check(state, touched) {
                Some(payload) => {
                    tracing::debug!(watcher = %watcher.id, "watcher satisfied");
                    let _ = watcher.tx.send(payload);
                }
                None => self.pending.push(watcher),
            }
        }
    }
}
