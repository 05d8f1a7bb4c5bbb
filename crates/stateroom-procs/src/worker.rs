//! Tracked worker processes.
//!
//! A [`WorkerProcess`] is a record first and a process second: created
//! unstarted by the context, it spawns the current binary with the worker
//! role on `start()`. Liveness and exit codes are read from the OS handle
//! on demand, not cached; a record is only removed from tracking by an
//! explicit stop or context close, never by natural exit.

use std::net::SocketAddr;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use stateroom_core::{Result, ServiceConfig, StateroomError};
use tracing::{debug, info};

use crate::platform::{self, SpawnMode};
use crate::runtime;

struct WorkerInner {
    target: String,
    props: Value,
    endpoint: SocketAddr,
    background: bool,
    child: Option<Child>,
}

/// Handle to one tracked worker process. Clones share the record.
#[derive(Clone)]
pub struct WorkerProcess {
    inner: Arc<Mutex<WorkerInner>>,
}

impl WorkerProcess {
    pub(crate) fn new(
        target: impl Into<String>,
        props: Value,
        endpoint: SocketAddr,
        background: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(WorkerInner {
                target: target.into(),
                props,
                endpoint,
                background,
                child: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WorkerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the worker's OS process. Fails if it was already started.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.child.is_some() {
            return Err(StateroomError::LaunchFailed {
                target: inner.target.clone(),
                message: "worker already started".into(),
            });
        }

        let exe = std::env::current_exe().map_err(|e| StateroomError::LaunchFailed {
            target: inner.target.clone(),
            message: format!("cannot resolve current executable: {e}"),
        })?;

        let props = serde_json::to_string(&inner.props)?;

        let mut cmd = Command::new(exe);
        cmd.env(runtime::ROLE_ENV, runtime::ROLE_WORKER)
            .env(runtime::ENDPOINT_ENV, inner.endpoint.to_string())
            .env(runtime::TARGET_ENV, &inner.target)
            .env(runtime::PROPS_ENV, props)
            .stdin(Stdio::null())
            .stdout(Stdio::null());

        if inner.background {
            cmd.stderr(Stdio::null());
            platform::prepare_spawn(&mut cmd, SpawnMode::Detached);
        } else {
            cmd.stderr(Stdio::inherit());
            platform::prepare_spawn(&mut cmd, SpawnMode::Foreground);
        }

        let child = cmd.spawn().map_err(|e| StateroomError::LaunchFailed {
            target: inner.target.clone(),
            message: e.to_string(),
        })?;

        info!(
            pid = child.id(),
            worker = %inner.target,
            background = inner.background,
            "worker spawned"
        );
        inner.child = Some(child);
        Ok(())
    }

    /// Terminate the worker's OS process if it is alive. Idempotent: an
    /// unstarted or already-dead worker is not an error.
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.lock();
        let Some(child) = inner.child.as_mut() else {
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!(worker = %inner.target, %status, "worker already exited");
            return Ok(());
        }

        platform::terminate_process(child.id(), ServiceConfig::STOP_GRACE_MS)?;
        let _ = child.wait();
        Ok(())
    }

    /// Whether the OS process is currently running. Queried on demand.
    pub fn is_alive(&self) -> bool {
        let mut inner = self.lock();
        match inner.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// The OS process id, once started.
    pub fn pid(&self) -> Option<u32> {
        self.lock().child.as_ref().map(Child::id)
    }

    /// The exit code, once the process has exited.
    pub fn exit_code(&self) -> Option<i32> {
        let mut inner = self.lock();
        inner
            .child
            .as_mut()
            .and_then(|child| child.try_wait().ok().flatten())
            .and_then(|status| status.code())
    }

    pub fn is_background(&self) -> bool {
        self.lock().background
    }

    pub fn target(&self) -> String {
        self.lock().target.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(background: bool) -> WorkerProcess {
        WorkerProcess::new(
            "noop",
            Value::Null,
            "127.0.0.1:1".parse().unwrap(),
            background,
        )
    }

    #[test]
    fn test_unstarted_record_state() {
        let worker = record(false);
        assert!(!worker.is_alive());
        assert_eq!(worker.pid(), None);
        assert_eq!(worker.exit_code(), None);
        assert!(!worker.is_background());
        assert_eq!(worker.target(), "noop");
    }

    #[test]
    fn test_stop_before_start_is_silent() {
        let worker = record(true);
        worker.stop().unwrap();
        worker.stop().unwrap();
        assert!(worker.is_background());
    }

    #[test]
    fn test_clones_share_the_record() {
        let worker = record(false);
        let alias = worker.clone();
        assert_eq!(worker.target(), alias.target());
        assert!(Arc::ptr_eq(&worker.inner, &alias.inner));
    }
}
