//! Role interception for re-executed children.
//!
//! The process manager spawns workers and the state server by re-executing
//! the current binary with a role set in the environment. [`init`] must
//! therefore run at the top of `main`, before any async runtime exists:
//! in a child it takes over the process (runs the server or the named
//! worker, then exits); in the parent it returns immediately.
//!
//! ```rust,ignore
//! fn main() {
//!     let workers = WorkerSet::new().register_fn("counter", counter);
//!     stateroom_procs::init(workers);
//!
//!     // parent-only code from here on
//! }
//! ```

use std::io::Write;

use serde_json::Value;
use stateroom_core::{Result, StateHandle, StateServer, StateroomError};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::registry::WorkerSet;

/// Environment variable selecting the role of a re-executed child.
pub const ROLE_ENV: &str = "STATEROOM_ROLE";
/// Server endpoint handed to worker children.
pub const ENDPOINT_ENV: &str = "STATEROOM_ENDPOINT";
/// Worker target name.
pub const TARGET_ENV: &str = "STATEROOM_TARGET";
/// JSON-encoded props for the worker target.
pub const PROPS_ENV: &str = "STATEROOM_PROPS";

pub(crate) const ROLE_SERVER: &str = "server";
pub(crate) const ROLE_WORKER: &str = "worker";

/// Line prefix a launching parent scans for on the server child's stdout.
pub(crate) const HANDSHAKE_PREFIX: &str = "STATE_ADDR=";

/// The role this process was spawned with, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Worker,
}

/// Inspect the environment for a spawner-assigned role.
pub fn current_role() -> Option<Role> {
    match std::env::var(ROLE_ENV) {
        Ok(role) if role == ROLE_SERVER => Some(Role::Server),
        Ok(role) if role == ROLE_WORKER => Some(Role::Worker),
        Ok(other) => {
            warn!(role = %other, "unknown stateroom role, continuing as parent");
            None
        }
        Err(_) => None,
    }
}

/// Run role interception. Never returns in a server or worker child.
///
/// Call this first thing in `main`, before constructing any async
/// runtime; the role paths build their own.
pub fn init(workers: WorkerSet) {
    match current_role() {
        Some(Role::Server) => {
            let code = match run_server_role() {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("stateroom server failed: {e}");
                    1
                }
            };
            std::process::exit(code);
        }
        Some(Role::Worker) => {
            std::process::exit(run_worker_role(&workers));
        }
        None => {}
    }
}

fn run_server_role() -> Result<()> {
    init_child_logging();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let mut handle = StateServer::bind("127.0.0.1:0").await?;

        // The launching parent scans stdout for this line.
        println!("{}{}", HANDSHAKE_PREFIX, handle.addr());
        std::io::stdout().flush()?;

        wait_for_shutdown().await;
        info!("shutdown signal received");
        handle.shutdown();
        Ok(())
    })
}

fn run_worker_role(workers: &WorkerSet) -> i32 {
    init_child_logging();
    match run_worker_inner(workers) {
        Ok(()) => 0,
        Err(e) => {
            error!("worker failed: {e}");
            1
        }
    }
}

fn run_worker_inner(workers: &WorkerSet) -> Result<()> {
    let endpoint = required_env(ENDPOINT_ENV)?;
    let target = required_env(TARGET_ENV)?;
    let props: Value = match std::env::var(PROPS_ENV) {
        Ok(raw) => serde_json::from_str(&raw)?,
        Err(_) => Value::Null,
    };

    let worker = workers
        .get(&target)
        .ok_or_else(|| StateroomError::UnknownTarget {
            target: target.clone(),
        })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let state = StateHandle::connect_str(&endpoint).await?;
        info!(worker = %target, "worker started");
        worker.run(state, props).await
    })
}

/// Block until SIGTERM (the process manager's stop path) or Ctrl+C.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn required_env(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| StateroomError::Other(format!("{name} is not set")))
}

/// Children log to stderr: stdout belongs to the handshake protocol.
fn init_child_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_role_in_test_harness() {
        // The test harness is never spawned with a role.
        assert_eq!(current_role(), None);
    }
}
