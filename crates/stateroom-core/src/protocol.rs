//! Wire protocol: framing and request/response envelopes.
//!
//! Frame format is a 4-byte big-endian length prefix followed by a UTF-8
//! JSON payload:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! Every request carries exactly one [`Action`], an adjacently tagged enum,
//! so an unknown or malformed action fails decoding instead of reaching the
//! state store:
//!
//! ```text
//! {"id": 7, "action": "set", "params": {"key": "phase", "value": "done"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::ServiceConfig;
use crate::error::{Result, StateroomError};
use crate::predicate::Predicate;
use crate::store::StateMap;

/// An optional action argument that distinguishes "not supplied" from an
/// explicit JSON `null`. `pop` with a `null` default returns `null` for an
/// absent key; `pop` with no default is a missing-key error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptArg {
    Given(Value),
    #[default]
    Absent,
}

impl OptArg {
    pub fn is_absent(&self) -> bool {
        matches!(self, OptArg::Absent)
    }

    pub fn into_option(self) -> Option<Value> {
        match self {
            OptArg::Given(value) => Some(value),
            OptArg::Absent => None,
        }
    }
}

impl From<Option<Value>> for OptArg {
    fn from(value: Option<Value>) -> Self {
        match value {
            Some(value) => OptArg::Given(value),
            None => OptArg::Absent,
        }
    }
}

/// One operation against the shared state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "params", rename_all = "snake_case")]
pub enum Action {
    /// Read a key; absent keys yield `default` (`null` when omitted).
    Get {
        key: String,
        #[serde(default)]
        default: Value,
    },

    /// Read a key; absent keys are a missing-key error.
    GetItem { key: String },

    /// Write a key, overwriting any previous value.
    Set { key: String, value: Value },

    /// Remove a key; absent keys are a missing-key error.
    DelItem { key: String },

    /// Key presence test.
    Contains { key: String },

    /// Whole-state equality against a caller-supplied mapping.
    Eq { other: StateMap },

    /// Whole-state inequality against a caller-supplied mapping.
    Ne { other: StateMap },

    /// Remove and return a key's value, falling back to `default` when
    /// given; without a default an absent key is a missing-key error.
    Pop {
        key: String,
        #[serde(default, skip_serializing_if = "OptArg::is_absent")]
        default: OptArg,
    },

    /// Remove and return some `(key, value)` pair; empty state is a
    /// missing-key error.
    PopItem,

    /// Remove every key.
    Clear,

    /// Merge a mapping into the state, last writer wins per key.
    Update { entries: StateMap },

    /// Return the existing value, or insert and return `default`.
    SetDefault {
        key: String,
        #[serde(default)]
        default: Value,
    },

    /// Full state snapshot (backs `items`/`keys`/`values`/`copy`).
    GetState,

    /// Register a watcher that fires once `state.get(key) == value`.
    WatchEqual { key: String, value: Value },

    /// Register a watcher that fires on the next mutation touching one of
    /// `keys` (any mutation at all when `keys` is empty).
    WatchChange {
        #[serde(default)]
        keys: Vec<String>,
    },

    /// Register a watcher that fires once `state.get(key)` differs from a
    /// baseline; the baseline defaults to the value observed at
    /// registration time.
    WatchValueChange {
        key: String,
        #[serde(default, skip_serializing_if = "OptArg::is_absent")]
        baseline: OptArg,
    },

    /// Register a watcher that fires once `predicate` holds.
    WatchPredicate { predicate: Predicate },
}

/// A request envelope: one id, one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    #[serde(flatten)]
    pub action: Action,
}

/// Wire error object attached to a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl From<&StateroomError> for ErrorObject {
    fn from(err: &StateroomError) -> Self {
        let data = match err {
            StateroomError::KeyNotFound { key } => Some(Value::String(key.clone())),
            _ => None,
        };
        Self {
            code: err.rpc_code(),
            message: err.to_string(),
            data,
        }
    }
}

impl From<ErrorObject> for StateroomError {
    fn from(err: ErrorObject) -> Self {
        match err.code {
            -32001 => StateroomError::KeyNotFound {
                key: err
                    .data
                    .as_ref()
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            -32002 => StateroomError::InvalidPredicate {
                message: err.message,
            },
            -32600 | -32700 => StateroomError::Protocol {
                message: err.message,
            },
            _ => StateroomError::Other(err.message),
        }
    }
}

/// A response envelope. Exactly one of `result`/`error` is present; `id`
/// is absent when the request was too malformed to recover one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    /// Create a success response.
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response from a service error.
    pub fn failure(id: Option<u64>, err: &StateroomError) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorObject::from(err)),
        }
    }

    /// Create an error response with an explicit code.
    pub fn error(id: Option<u64>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorObject::new(code, message)),
        }
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed the connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > ServiceConfig::MAX_FRAME_SIZE {
        return Err(StateroomError::Protocol {
            message: format!(
                "frame size {} exceeds maximum {}",
                len,
                ServiceConfig::MAX_FRAME_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
