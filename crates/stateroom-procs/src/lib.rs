//! Process lifecycle management for stateroom.
//!
//! Workers are separate OS processes coordinating through a shared state
//! server; this crate owns how they come to exist and how they go away:
//!
//! - [`WorkerSet`]: named entry points compiled into the binary, looked up
//!   by spawned children instead of shipping code over the wire.
//! - [`init`]: role interception at the top of `main`; a re-executed
//!   child becomes the state server or a worker and never returns.
//! - [`Context`]: launches (or attaches to) the server, creates tracked
//!   [`WorkerProcess`] records, and tears everything down on `close()`.
//!
//! Foreground workers die with their parent; background workers are
//! detached into their own session and deliberately survive it.
//!
//! # Example
//!
//! ```rust,ignore
//! use serde_json::{json, Value};
//! use stateroom_procs::{Context, WorkerSet};
//!
//! fn main() -> stateroom_core::Result<()> {
//!     let workers = WorkerSet::new().register_fn("greeter", |state, _props| async move {
//!         state.set("greeting", json!("hello")).await
//!     });
//!     stateroom_procs::init(workers);
//!
//!     let runtime = tokio::runtime::Runtime::new()?;
//!     runtime.block_on(async {
//!         let mut ctx = Context::launch().await?;
//!         let worker = ctx.process("greeter", Value::Null)?;
//!         worker.start()?;
//!
//!         let handle = ctx.handle();
//!         handle.get_when_equal("greeting", json!("hello")).await?;
//!
//!         ctx.close()
//!     })
//! }
//! ```

pub mod context;
pub mod platform;
pub mod registry;
pub mod runtime;
pub mod worker;

// Re-export commonly used types
pub use context::Context;
pub use registry::{Worker, WorkerSet};
pub use runtime::{current_role, init, Role};
pub use worker::WorkerProcess;

pub use stateroom_core::{Result, StateHandle, StateroomError};
