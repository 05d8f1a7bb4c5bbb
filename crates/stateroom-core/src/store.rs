//! The authoritative state mapping and its operation semantics.
//!
//! One [`StateStore`] lives behind the server's lock; every action is
//! applied here in full before any watcher looks at the result. Operations
//! follow plain dict semantics: reads never fail, removals of absent keys
//! are missing-key errors unless a default was supplied.

use serde_json::Value;

use crate::error::{Result, StateroomError};
use crate::protocol::{Action, OptArg};

/// The shared mapping type: string keys to arbitrary JSON values.
pub type StateMap = serde_json::Map<String, Value>;

/// Outcome of applying one action: the wire result plus the set of keys
/// the action actually mutated (drives watcher evaluation).
#[derive(Debug)]
pub struct Applied {
    pub result: Result<Value>,
    pub touched: Vec<String>,
}

impl Applied {
    fn ok(result: Value) -> Self {
        Self {
            result: Ok(result),
            touched: Vec::new(),
        }
    }

    fn ok_touching(result: Value, touched: Vec<String>) -> Self {
        Self {
            result: Ok(result),
            touched,
        }
    }

    fn err(err: StateroomError) -> Self {
        Self {
            result: Err(err),
            touched: Vec::new(),
        }
    }
}

/// The server-side state store.
#[derive(Debug, Default)]
pub struct StateStore {
    entries: StateMap,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live mapping, for watcher evaluation and snapshots.
    pub fn entries(&self) -> &StateMap {
        &self.entries
    }

    /// Apply one data action.
    ///
    /// Watch registrations are routed to the watch manager before this
    /// point; one arriving here is a dispatch bug reported as a protocol
    /// error rather than a panic.
    pub fn apply(&mut self, action: &Action) -> Applied {
        match action {
            Action::Get { key, default } => Applied::ok(
                self.entries
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| default.clone()),
            ),

            Action::GetItem { key } => match self.entries.get(key) {
                Some(value) => Applied::ok(value.clone()),
                None => Applied::err(StateroomError::KeyNotFound { key: key.clone() }),
            },

            Action::Set { key, value } => {
                self.entries.insert(key.clone(), value.clone());
                Applied::ok_touching(Value::Null, vec![key.clone()])
            }

            Action::DelItem { key } => match self.entries.remove(key) {
                Some(_) => Applied::ok_touching(Value::Null, vec![key.clone()]),
                None => Applied::err(StateroomError::KeyNotFound { key: key.clone() }),
            },

            Action::Contains { key } => Applied::ok(Value::Bool(self.entries.contains_key(key))),

            Action::Eq { other } => Applied::ok(Value::Bool(self.entries == *other)),

            Action::Ne { other } => Applied::ok(Value::Bool(self.entries != *other)),

            Action::Pop { key, default } => match self.entries.remove(key) {
                Some(value) => Applied::ok_touching(value, vec![key.clone()]),
                None => match default {
                    OptArg::Given(default) => Applied::ok(default.clone()),
                    OptArg::Absent => {
                        Applied::err(StateroomError::KeyNotFound { key: key.clone() })
                    }
                },
            },

            Action::PopItem => {
                let key = match self.entries.keys().next() {
                    Some(key) => key.clone(),
                    None => {
                        return Applied::err(StateroomError::KeyNotFound {
                            key: "<empty state>".into(),
                        })
                    }
                };
                let value = self.entries.remove(&key).unwrap_or(Value::Null);
                Applied::ok_touching(
                    Value::Array(vec![Value::String(key.clone()), value]),
                    vec![key],
                )
            }

            Action::Clear => {
                let touched: Vec<String> = self.entries.keys().cloned().collect();
                self.entries.clear();
                Applied::ok_touching(Value::Null, touched)
            }

            Action::Update { entries } => {
                let touched: Vec<String> = entries.keys().cloned().collect();
                for (key, value) in entries {
                    self.entries.insert(key.clone(), value.clone());
                }
                Applied::ok_touching(Value::Null, touched)
            }

            Action::SetDefault { key, default } => match self.entries.get(key) {
                Some(value) => Applied::ok(value.clone()),
                None => {
                    self.entries.insert(key.clone(), default.clone());
                    Applied::ok_touching(default.clone(), vec![key.clone()])
                }
            },

            Action::GetState => Applied::ok(Value::Object(self.entries.clone())),

            Action::WatchEqual { .. }
            | Action::WatchChange { .. }
            | Action::WatchValueChange { .. }
            | Action::WatchPredicate { .. } => Applied::err(StateroomError::Protocol {
                message: "watch registration routed to the data store".into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn set(store: &mut StateStore, key: &str, value: Value) -> Vec<String> {
        store
            .apply(&Action::Set {
                key: key.into(),
                value,
            })
            .touched
    }

    #[test]
    fn test_set_then_get() {
        let mut store = StateStore::new();
        let touched = set(&mut store, "x", json!(42));
        assert_eq!(touched, vec!["x".to_string()]);

        let applied = store.apply(&Action::Get {
            key: "x".into(),
            default: Value::Null,
        });
        assert_eq!(applied.result.unwrap(), json!(42));
        assert!(applied.touched.is_empty());
    }

    #[test]
    fn test_get_returns_default_for_absent_key() {
        let mut store = StateStore::new();
        let applied = store.apply(&Action::Get {
            key: "missing".into(),
            default: json!("fallback"),
        });
        assert_eq!(applied.result.unwrap(), json!("fallback"));
    }

    #[test]
    fn test_get_item_errors_on_absent_key() {
        let mut store = StateStore::new();
        let applied = store.apply(&Action::GetItem { key: "nope".into() });
        assert!(matches!(
            applied.result,
            Err(StateroomError::KeyNotFound { .. })
        ));
    }

    #[test]
    fn test_pop_present_removes_and_returns() {
        let mut store = StateStore::new();
        set(&mut store, "x", json!(7));

        let applied = store.apply(&Action::Pop {
            key: "x".into(),
            default: OptArg::Absent,
        });
        assert_eq!(applied.result.unwrap(), json!(7));
        assert_eq!(applied.touched, vec!["x".to_string()]);

        let contains = store.apply(&Action::Contains { key: "x".into() });
        assert_eq!(contains.result.unwrap(), json!(false));
    }

    #[test]
    fn test_pop_absent_with_default_does_not_mutate() {
        let mut store = StateStore::new();
        let applied = store.apply(&Action::Pop {
            key: "x".into(),
            default: OptArg::Given(json!("dflt")),
        });
        assert_eq!(applied.result.unwrap(), json!("dflt"));
        assert!(applied.touched.is_empty());

        // Explicit null default still counts as a default.
        let applied = store.apply(&Action::Pop {
            key: "x".into(),
            default: OptArg::Given(Value::Null),
        });
        assert_eq!(applied.result.unwrap(), Value::Null);
    }

    #[test]
    fn test_pop_absent_without_default_errors() {
        let mut store = StateStore::new();
        let applied = store.apply(&Action::Pop {
            key: "x".into(),
            default: OptArg::Absent,
        });
        assert!(matches!(
            applied.result,
            Err(StateroomError::KeyNotFound { .. })
        ));
    }

    #[test]
    fn test_pop_item_empty_errors_and_nonempty_removes() {
        let mut store = StateStore::new();
        let applied = store.apply(&Action::PopItem);
        assert!(applied.result.is_err());

        set(&mut store, "a", json!(1));
        let applied = store.apply(&Action::PopItem);
        assert_eq!(applied.result.unwrap(), json!(["a", 1]));
        assert_eq!(applied.touched, vec!["a".to_string()]);
        assert!(store.entries().is_empty());
    }

    #[test]
    fn test_update_merges_last_writer_wins() {
        let mut store = StateStore::new();
        set(&mut store, "a", json!(1));

        let mut entries = StateMap::new();
        entries.insert("a".into(), json!(2));
        entries.insert("b".into(), json!(3));
        let applied = store.apply(&Action::Update { entries });
        assert_eq!(applied.touched.len(), 2);

        let snapshot = store.apply(&Action::GetState).result.unwrap();
        assert_eq!(snapshot, json!({"a": 2, "b": 3}));
    }

    #[test]
    fn test_set_default_inserts_once() {
        let mut store = StateStore::new();

        let applied = store.apply(&Action::SetDefault {
            key: "k".into(),
            default: json!("first"),
        });
        assert_eq!(applied.result.unwrap(), json!("first"));
        assert_eq!(applied.touched, vec!["k".to_string()]);

        let applied = store.apply(&Action::SetDefault {
            key: "k".into(),
            default: json!("second"),
        });
        assert_eq!(applied.result.unwrap(), json!("first"));
        assert!(applied.touched.is_empty());
    }

    #[test]
    fn test_clear_reports_removed_keys_and_is_idempotent() {
        let mut store = StateStore::new();
        set(&mut store, "a", json!(1));
        set(&mut store, "b", json!(2));

        let applied = store.apply(&Action::Clear);
        let mut touched = applied.touched;
        touched.sort();
        assert_eq!(touched, vec!["a".to_string(), "b".to_string()]);

        // Clearing an empty state touches nothing.
        let applied = store.apply(&Action::Clear);
        assert!(applied.result.is_ok());
        assert!(applied.touched.is_empty());
    }

    #[test]
    fn test_eq_and_ne_compare_full_state() {
        let mut store = StateStore::new();
        set(&mut store, "a", json!(1));

        let mut same = StateMap::new();
        same.insert("a".into(), json!(1));
        assert_eq!(
            store.apply(&Action::Eq { other: same.clone() }).result.unwrap(),
            json!(true)
        );
        assert_eq!(
            store.apply(&Action::Ne { other: same }).result.unwrap(),
            json!(false)
        );

        let mut different = StateMap::new();
        different.insert("a".into(), json!(2));
        assert_eq!(
            store.apply(&Action::Eq { other: different }).result.unwrap(),
            json!(false)
        );
    }
}
