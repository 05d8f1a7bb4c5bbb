//! Stateroom core - shared-state coordination over loopback sockets.
//!
//! One server process owns a mutable string-keyed mapping; any number of
//! worker processes read and mutate it exclusively through message passing
//! over loopback TCP. Besides plain dict operations, the server provides
//! blocking synchronization primitives (wait-until-equal,
//! wait-until-changed, wait-until-value-changed, wait-until-predicate)
//! that stand in for locks and condition variables without shared memory.
//!
//! # Example
//!
//! ```rust,ignore
//! use stateroom_core::{StateHandle, StateServer};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> stateroom_core::Result<()> {
//!     let server = StateServer::bind("127.0.0.1:0").await?;
//!
//!     let handle = StateHandle::connect(server.addr()).await?;
//!     handle.set("phase", json!("ready")).await?;
//!
//!     // Blocks until some process writes the awaited value.
//!     handle.get_when_equal("phase", json!("ready")).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! Process lifecycle (spawning workers bound to a server, foreground/
//! background cleanup) lives in the `stateroom-procs` crate.

pub mod client;
pub mod config;
pub mod error;
pub mod predicate;
pub mod protocol;
pub mod server;
pub mod store;
pub mod watch;

// Re-export commonly used types
pub use client::StateHandle;
pub use config::ServiceConfig;
pub use error::{Result, StateroomError};
pub use predicate::{CmpOp, Predicate};
pub use protocol::{Action, ErrorObject, OptArg, Request, Response};
pub use server::{StateServer, StateServerHandle};
pub use store::{StateMap, StateStore};

/// Current crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
