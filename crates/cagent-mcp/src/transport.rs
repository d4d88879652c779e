// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! MCP transports.
//!
//! [`StdioTransport`] spawns the server as a child process and speaks framed
//! JSON-RPC over its stdio.  A single reader task routes responses to their
//! waiting request by id; everything else (notifications, server-initiated
//! requests such as elicitation) flows out through an [`Incoming`] channel
//! consumed by the owning toolset.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, warn};

use crate::codec::{read_frame, write_frame};
use crate::protocol::{classify, Incoming, JsonRpcError, JsonRpcNotification, JsonRpcRequest};

/// How long a request may wait for its response.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MCP server process has exited")]
    ProcessExited,

    #[error("timeout waiting for response")]
    Timeout,

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Rpc(#[from] JsonRpcError),

    #[error("toolset is not started")]
    NotStarted,
}

/// One MCP server connection, stdio or remote.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a request and wait for the matching response's result.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError>;

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError>;

    /// Answer a server-initiated request.
    async fn respond(&self, id: u64, result: Value) -> Result<(), McpError>;

    fn is_alive(&self) -> bool;

    /// Resolves when the connection closes, expectedly or not.
    async fn wait_closed(&self);

    /// Graceful teardown.
    async fn shutdown(&self);
}

pub struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    child_pid: u32,
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<crate::protocol::JsonRpcResponse>>>>,
    alive: Arc<AtomicBool>,
    closed_rx: watch::Receiver<bool>,
}

impl StdioTransport {
    /// Spawn the server process.  Returns the transport plus the channel of
    /// non-response traffic (notifications and server requests).
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<Incoming>), McpError> {
        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (k, v) in env {
            cmd.env(k, v);
        }
        // Own process group so shutdown can terminate the whole tree.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut child = cmd.spawn()?;
        let child_pid = child.id().unwrap_or(0);
        let stdin = child.stdin.take().ok_or_else(|| {
            McpError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdin",
            ))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            McpError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdout",
            ))
        })?;

        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<crate::protocol::JsonRpcResponse>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let (closed_tx, closed_rx) = watch::channel(false);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        // Reader task: decode frames until EOF, route responses by id,
        // forward the rest.  EOF (or a decode failure) marks the transport
        // closed, which wakes the connection watcher.
        {
            let pending = Arc::clone(&pending);
            let alive = Arc::clone(&alive);
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout);
                loop {
                    match read_frame(&mut reader).await {
                        Ok(Some(msg)) => match classify(msg) {
                            Some(Incoming::Response(resp)) => {
                                if let Some(tx) = pending.lock().await.remove(&resp.id) {
                                    let _ = tx.send(resp);
                                } else {
                                    debug!(id = resp.id, "response for unknown request id");
                                }
                            }
                            Some(other) => {
                                let _ = incoming_tx.send(other);
                            }
                            None => debug!("unclassifiable frame from server"),
                        },
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "MCP stdio read failed");
                            break;
                        }
                    }
                }
                alive.store(false, Ordering::SeqCst);
                // Abandoned waiters see a closed channel and map it to
                // ProcessExited.
                pending.lock().await.clear();
                let _ = closed_tx.send(true);
            });
        }

        Ok((
            Arc::new(Self {
                stdin: Mutex::new(stdin),
                child: Mutex::new(child),
                child_pid,
                next_id: AtomicU64::new(1),
                pending,
                alive,
                closed_rx,
            }),
            incoming_rx,
        ))
    }

    async fn write(&self, msg: &Value) -> Result<(), McpError> {
        if !self.is_alive() {
            return Err(McpError::ProcessExited);
        }
        let mut stdin = self.stdin.lock().await;
        write_frame(&mut *stdin, msg)
            .await
            .map_err(|e| McpError::Protocol(e.to_string()))
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let req = JsonRpcRequest::new(id, method, params);
        debug!(id, method, "sending MCP request");
        if let Err(e) = self.write(&serde_json::to_value(&req)?).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(resp)) => resp.into_result().map_err(McpError::from),
            Ok(Err(_)) => Err(McpError::ProcessExited),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(McpError::Timeout)
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let n = JsonRpcNotification::new(method, params);
        debug!(method, "sending MCP notification");
        self.write(&serde_json::to_value(&n)?).await
    }

    async fn respond(&self, id: u64, result: Value) -> Result<(), McpError> {
        self.write(&serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result }))
            .await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn wait_closed(&self) {
        let mut rx = self.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        // Best-effort protocol goodbye before tearing the process down.
        let _ = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            let shutdown = JsonRpcRequest::new(
                self.next_id.fetch_add(1, Ordering::Relaxed),
                "shutdown",
                None,
            );
            if let Ok(v) = serde_json::to_value(&shutdown) {
                let mut stdin = self.stdin.lock().await;
                let _ = write_frame(&mut *stdin, &v).await;
                let _ = write_frame(
                    &mut *stdin,
                    &serde_json::json!({ "jsonrpc": "2.0", "method": "exit" }),
                )
                .await;
            }
        })
        .await;

        let mut child = self.child.lock().await;
        let waited = tokio::time::timeout(std::time::Duration::from_secs(2), child.wait()).await;
        match waited {
            Ok(Ok(status)) => debug!(?status, "MCP server exited"),
            _ => {
                warn!("MCP server did not exit in time; killing process group");
                #[cfg(unix)]
                if self.child_pid != 0 {
                    unsafe {
                        libc::killpg(self.child_pid as i32, libc::SIGKILL);
                    }
                }
                let _ = child.kill().await;
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
