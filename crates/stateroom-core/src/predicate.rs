//! Serializable watch predicates.
//!
//! A client cannot ship arbitrary code to the server, so `get_when`-style
//! conditions are expressed as a closed expression tree that both sides
//! understand. The tree is plain data (serde), evaluated server-side
//! against a snapshot of the state, and never mutates anything.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StateroomError};
use crate::store::StateMap;

/// Ordering operator for [`Predicate::Compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
}

/// A condition over the shared state.
///
/// Absent keys read as JSON `null`, mirroring the store's `get` semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    /// The key is present in the state.
    Exists { key: String },

    /// `state.get(key) == value`.
    Equals { key: String, value: Value },

    /// `state.get(key) != value`.
    NotEquals { key: String, value: Value },

    /// Ordered comparison of `state.get(key)` against a number or string.
    Compare {
        key: String,
        cmp: CmpOp,
        value: Value,
    },

    /// Negation.
    Not { inner: Box<Predicate> },

    /// Conjunction. Empty is true.
    All { preds: Vec<Predicate> },

    /// Disjunction. Empty is false.
    Any { preds: Vec<Predicate> },
}

impl Predicate {
    pub fn exists(key: impl Into<String>) -> Self {
        Predicate::Exists { key: key.into() }
    }

    pub fn equals(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Equals {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn not_equals(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::NotEquals {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn compare(key: impl Into<String>, cmp: CmpOp, value: impl Into<Value>) -> Self {
        Predicate::Compare {
            key: key.into(),
            cmp,
            value: value.into(),
        }
    }

    pub fn negate(self) -> Self {
        Predicate::Not {
            inner: Box::new(self),
        }
    }

    pub fn all(preds: Vec<Predicate>) -> Self {
        Predicate::All { preds }
    }

    pub fn any(preds: Vec<Predicate>) -> Self {
        Predicate::Any { preds }
    }

    /// Structural validation, run once at registration time.
    ///
    /// `Compare` only orders numbers and strings; rejecting other operand
    /// types here surfaces the mistake to the registering caller instead
    /// of leaving a watcher that can never fire.
    pub fn validate(&self) -> Result<()> {
        match self {
            Predicate::Compare { key, value, .. } => {
                if value.is_number() || value.is_string() {
                    Ok(())
                } else {
                    Err(StateroomError::InvalidPredicate {
                        message: format!(
                            "compare on {key:?} requires a number or string operand, got {value}"
                        ),
                    })
                }
            }
            Predicate::Not { inner } => inner.validate(),
            Predicate::All { preds } | Predicate::Any { preds } => {
                preds.iter().try_for_each(Predicate::validate)
            }
            _ => Ok(()),
        }
    }

    /// Evaluate against a state snapshot.
    pub fn eval(&self, state: &StateMap) -> bool {
        match self {
            Predicate::Exists { key } => state.contains_key(key),
            Predicate::Equals { key, value } => lookup(state, key) == value,
            Predicate::NotEquals { key, value } => lookup(state, key) != value,
            Predicate::Compare { key, cmp, value } => compare(lookup(state, key), *cmp, value),
            Predicate::Not { inner } => !inner.eval(state),
            Predicate::All { preds } => preds.iter().all(|p| p.eval(state)),
            Predicate::Any { preds } => preds.iter().any(|p| p.eval(state)),
        }
    }
}

fn lookup<'a>(state: &'a StateMap, key: &str) -> &'a Value {
    state.get(key).unwrap_or(&Value::Null)
}

fn compare(left: &Value, cmp: CmpOp, right: &Value) -> bool {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            }
        }
        (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    };

    match ordering {
        Some(ordering) => match cmp {
            CmpOp::Lt => ordering.is_lt(),
            CmpOp::Le => ordering.is_le(),
            CmpOp::Gt => ordering.is_gt(),
            CmpOp::Ge => ordering.is_ge(),
        },
        None => false,
    }
}
