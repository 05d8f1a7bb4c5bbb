//! The coordination context: owns the state server process and the
//! workers bound to it.
//!
//! `launch()` starts the server as a detached child of the current binary
//! and connects the shared handle; `attach()` joins a server somebody else
//! owns. Worker records are created unstarted and tracked by the context;
//! `close()` stops them and then a launched server. Dropping an unclosed
//! context runs the same cleanup as a backstop.

use std::io::{BufRead, BufReader};
use std::net::SocketAddr;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;

use serde_json::Value;
use stateroom_core::{Result, ServiceConfig, StateHandle, StateroomError};
use tracing::{info, warn};

use crate::platform::{self, SpawnMode};
use crate::runtime::{self, Role};
use crate::worker::WorkerProcess;

/// Owner of one state service and its workers.
pub struct Context {
    endpoint: SocketAddr,
    handle: Arc<StateHandle>,
    server: Option<Child>,
    workers: Vec<WorkerProcess>,
    closed: bool,
}

impl Context {
    /// Start a state server as a detached child process and connect to it.
    ///
    /// The server runs in its own session so that background workers can
    /// keep using it after this process exits; `close()` terminates it
    /// explicitly.
    pub async fn launch() -> Result<Self> {
        let exe = std::env::current_exe().map_err(|e| StateroomError::LaunchFailed {
            target: "state-server".into(),
            message: format!("cannot resolve current executable: {e}"),
        })?;

        let mut cmd = Command::new(exe);
        cmd.env(runtime::ROLE_ENV, runtime::ROLE_SERVER)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        platform::prepare_spawn(&mut cmd, SpawnMode::Detached);

        let mut child = cmd.spawn().map_err(|e| StateroomError::LaunchFailed {
            target: "state-server".into(),
            message: e.to_string(),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| StateroomError::Other(
            "server child stdout was not captured".into(),
        ))?;

        // The child prints one `STATE_ADDR=host:port` line once bound.
        let read_line = tokio::task::spawn_blocking(move || -> std::io::Result<Option<String>> {
            for line in BufReader::new(stdout).lines() {
                let line = line?;
                if let Some(addr) = line.strip_prefix(runtime::HANDSHAKE_PREFIX) {
                    return Ok(Some(addr.trim().to_string()));
                }
            }
            Ok(None)
        });

        let addr = match tokio::time::timeout(ServiceConfig::HANDSHAKE_TIMEOUT, read_line).await {
            Ok(Ok(Ok(Some(addr)))) => addr,
            Err(_) => {
                return Self::handshake_failed(child, "timed out waiting for the server address")
            }
            Ok(Ok(Ok(None))) => {
                return Self::handshake_failed(child, "server exited before reporting its address")
            }
            Ok(Ok(Err(e))) => {
                return Self::handshake_failed(
                    child,
                    &format!("failed reading server handshake: {e}"),
                )
            }
            Ok(Err(e)) => {
                return Self::handshake_failed(child, &format!("handshake reader failed: {e}"))
            }
        };

        let endpoint: SocketAddr = addr.parse().map_err(|_| StateroomError::LaunchFailed {
            target: "state-server".into(),
            message: format!("server reported a bad address: {addr}"),
        })?;

        let handle = StateHandle::connect(endpoint).await?;
        info!(%endpoint, pid = child.id(), "state server launched");

        Ok(Self {
            endpoint,
            handle: Arc::new(handle),
            server: Some(child),
            workers: Vec::new(),
            closed: false,
        })
    }

    fn handshake_failed(mut child: Child, message: &str) -> Result<Self> {
        let _ = child.kill();
        let _ = child.wait();
        Err(StateroomError::LaunchFailed {
            target: "state-server".into(),
            message: message.to_string(),
        })
    }

    /// Connect to a server this context does not own. `close()` stops the
    /// tracked workers but leaves the server running.
    pub async fn attach(endpoint: SocketAddr) -> Result<Self> {
        let handle = StateHandle::connect(endpoint).await?;
        info!(%endpoint, "attached to state server");

        Ok(Self {
            endpoint,
            handle: Arc::new(handle),
            server: None,
            workers: Vec::new(),
            closed: false,
        })
    }

    /// The shared state handle.
    pub fn handle(&self) -> Arc<StateHandle> {
        self.handle.clone()
    }

    /// The server endpoint workers are bound to.
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// The launched server's pid, if this context owns one.
    pub fn server_pid(&self) -> Option<u32> {
        self.server.as_ref().map(Child::id)
    }

    /// Create an unstarted foreground worker record bound to this
    /// context's endpoint. Foreground workers are terminated when the
    /// parent exits.
    pub fn process(&mut self, target: &str, props: Value) -> Result<WorkerProcess> {
        self.make_process(target, props, false)
    }

    /// Create an unstarted background worker record. Background workers
    /// run in their own session and survive the parent's exit.
    pub fn background_process(&mut self, target: &str, props: Value) -> Result<WorkerProcess> {
        self.make_process(target, props, true)
    }

    /// Create `count` foreground records per target.
    pub fn process_factory(
        &mut self,
        targets: &[&str],
        props: Value,
        count: usize,
    ) -> Result<Vec<WorkerProcess>> {
        let mut records = Vec::with_capacity(targets.len() * count);
        for target in targets {
            for _ in 0..count {
                records.push(self.make_process(target, props.clone(), false)?);
            }
        }
        Ok(records)
    }

    fn make_process(
        &mut self,
        target: &str,
        props: Value,
        background: bool,
    ) -> Result<WorkerProcess> {
        if self.closed {
            return Err(StateroomError::ContextClosed);
        }

        if runtime::current_role() == Some(Role::Worker) {
            warn!(
                worker = %target,
                "spawning a worker from inside a worker process; \
                 prefer process_factory on the parent context"
            );
        }

        let worker = WorkerProcess::new(target, props, self.endpoint, background);
        self.workers.push(worker.clone());
        Ok(worker)
    }

    /// The records created through this context, started or not.
    pub fn workers(&self) -> &[WorkerProcess] {
        &self.workers
    }

    /// Stop every tracked worker, then the launched server. Idempotent;
    /// the context cannot create workers afterwards.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        for worker in &self.workers {
            if let Err(e) = worker.stop() {
                warn!(worker = %worker.target(), "failed to stop worker: {e}");
            }
        }

        if let Some(mut child) = self.server.take() {
            if !matches!(child.try_wait(), Ok(Some(_))) {
                if let Err(e) =
                    platform::terminate_process(child.id(), ServiceConfig::STOP_GRACE_MS)
                {
                    warn!("failed to stop state server: {e}");
                }
            }
            let _ = child.wait();
            info!("state server stopped");
        }

        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
    }
}
