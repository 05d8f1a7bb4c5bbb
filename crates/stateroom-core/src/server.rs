//! The coordination server.
//!
//! Listens on a loopback TCP address, accepts connections from worker
//! processes, and executes one action at a time against the shared state.
//! Each connection is handled in its own spawned task; the state map and
//! the pending-watcher list live behind a single async mutex, so a
//! mutation and the watcher sweep that observes it are one atomic step.
//!
//! Watch registrations allocate a private one-shot channel: a fresh
//! loopback listener whose address is returned to the registrant, plus a
//! spawned delivery task that accepts exactly one connection, pushes one
//! payload frame when the condition fires, and goes away.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::ServiceConfig;
use crate::error::{Result, StateroomError};
use crate::protocol::{read_frame, write_frame, Action, OptArg, Request, Response};
use crate::store::StateStore;
use crate::watch::{Condition, WatchManager};

/// Handle to a running state server. Dropping shuts the server down.
pub struct StateServerHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl StateServerHandle {
    /// The address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shut down gracefully: stop accepting, then signal every connection
    /// handler and pending watch delivery to close.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for StateServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Everything guarded by the server's single lock: the authoritative map
/// and the watchers evaluated against it.
struct Shared {
    store: StateStore,
    watches: WatchManager,
}

/// The state server.
pub struct StateServer;

impl StateServer {
    /// Bind and start serving. Use `127.0.0.1:0` for an OS-assigned,
    /// collision-free port.
    pub async fn bind(listen: &str) -> Result<StateServerHandle> {
        let listener = TcpListener::bind(listen).await?;
        let addr = listener.local_addr()?;

        info!("state server listening on {}", addr);

        let shared = Arc::new(Mutex::new(Shared {
            store: StateStore::new(),
            watches: WatchManager::new(),
        }));

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            shared,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections,
        ));

        Ok(StateServerHandle {
            addr,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        shared: Arc<Mutex<Shared>>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("state server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= ServiceConfig::MAX_CONNECTIONS {
                                warn!(
                                    "rejecting connection from {}: at max capacity ({})",
                                    peer_addr,
                                    ServiceConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let shared = shared.clone();
                            let conns = active_connections.clone();
                            let conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("connection from {}", peer_addr);
                                if let Err(e) =
                                    Self::handle_connection(stream, shared, conn_shutdown).await
                                {
                                    debug!("connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        mut stream: TcpStream,
        shared: Arc<Mutex<Shared>>,
        mut conn_shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.split();

        loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result? {
                        Some(f) => f,
                        None => return Ok(()), // Clean disconnect
                    }
                }
                _ = conn_shutdown.changed() => {
                    return Ok(()); // Server shutting down
                }
            };

            let response = Self::process_frame(&frame, &shared, &conn_shutdown).await;

            let response_bytes = serde_json::to_vec(&response)?;
            write_frame(&mut writer, &response_bytes).await?;
        }
    }

    /// Decode one request and execute it. Every fault becomes a coded
    /// error response; nothing here can take the server down.
    async fn process_frame(
        frame: &[u8],
        shared: &Arc<Mutex<Shared>>,
        conn_shutdown: &watch::Receiver<bool>,
    ) -> Response {
        let raw: Value = match serde_json::from_slice(frame) {
            Ok(value) => value,
            Err(e) => {
                return Response::error(None, -32700, format!("Parse error: {}", e));
            }
        };

        // Recover the id before full decoding so malformed envelopes can
        // still be answered in-order.
        let raw_id = raw.get("id").and_then(Value::as_u64);

        let request: Request = match serde_json::from_value(raw) {
            Ok(request) => request,
            Err(e) => {
                return Response::error(raw_id, -32600, format!("Invalid request: {}", e));
            }
        };

        let id = request.id;
        match request.action {
            action @ (Action::WatchEqual { .. }
            | Action::WatchChange { .. }
            | Action::WatchValueChange { .. }
            | Action::WatchPredicate { .. }) => {
                match Self::register_watch(shared, conn_shutdown.clone(), action).await {
                    Ok(addr) => Response::success(id, addr),
                    Err(e) => {
                        debug!("watch registration failed: {}", e);
                        Response::failure(Some(id), &e)
                    }
                }
            }
            action => {
                let mut guard = shared.lock().await;
                let shared_mut = &mut *guard;
                let applied = shared_mut.store.apply(&action);
                if !applied.touched.is_empty() {
                    shared_mut
                        .watches
                        .sweep(shared_mut.store.entries(), &applied.touched);
                }
                match applied.result {
                    Ok(value) => Response::success(id, value),
                    Err(e) => {
                        debug!("action failed: {}", e);
                        Response::failure(Some(id), &e)
                    }
                }
            }
        }
    }

    /// Allocate the private channel, run the registration-time check, and
    /// hand the delivery end to its own task. Returns the channel address
    /// for the registrant to pull from.
    async fn register_watch(
        shared: &Arc<Mutex<Shared>>,
        conn_shutdown: watch::Receiver<bool>,
        action: Action,
    ) -> Result<Value> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (tx, rx) = oneshot::channel::<Value>();

        {
            let mut guard = shared.lock().await;
            let shared_mut = &mut *guard;
            let state = shared_mut.store.entries();

            let condition = match action {
                Action::WatchEqual { key, value } => Condition::Equal { key, value },
                Action::WatchChange { keys } => Condition::KeysChanged { keys },
                Action::WatchValueChange { key, baseline } => {
                    let baseline = match baseline {
                        OptArg::Given(value) => value,
                        OptArg::Absent => state.get(&key).cloned().unwrap_or(Value::Null),
                    };
                    Condition::ValueChanged { key, baseline }
                }
                Action::WatchPredicate { predicate } => {
                    predicate.validate()?;
                    Condition::Holds { predicate }
                }
                _ => {
                    return Err(StateroomError::Protocol {
                        message: "not a watch registration".into(),
                    })
                }
            };

            match condition.check_now(state) {
                Some(payload) => {
                    // Already satisfied: resolve the channel immediately so
                    // the registrant's pull returns without waiting for a
                    // further mutation.
                    let _ = tx.send(payload);
                }
                None => {
                    shared_mut.watches.register(condition, tx);
                }
            }
        }

        tokio::spawn(Self::deliver(listener, rx, conn_shutdown));

        Ok(Value::String(addr.to_string()))
    }

    /// One-shot delivery: accept the registrant, wait for the result,
    /// push one frame, done. The channel is never reused.
    async fn deliver(
        listener: TcpListener,
        rx: oneshot::Receiver<Value>,
        mut conn_shutdown: watch::Receiver<bool>,
    ) {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = conn_shutdown.changed() => return,
        };

        let (mut stream, _) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("watch channel accept failed: {}", e);
                return;
            }
        };
        drop(listener);

        let payload = tokio::select! {
            result = rx => match result {
                Ok(value) => value,
                // Server dropped the pending watcher without firing it.
                Err(_) => return,
            },
            _ = conn_shutdown.changed() => return,
        };

        let bytes = match serde_json::to_vec(&payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("watch payload serialization failed: {}", e);
                return;
            }
        };
        if let Err(e) = write_frame(&mut stream, &bytes).await {
            debug!("watch delivery failed, registrant gone: {}", e);
        }
    }
}
