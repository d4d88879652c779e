// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Language-server client: one child process speaking framed JSON-RPC
//! (`Content-Length: N\r\n\r\n<body>`) over stdio.
//!
//! A single reader task routes responses to their waiting request by id and
//! folds `textDocument/publishDiagnostics` notifications into the per-URI
//! diagnostics map.  Files are opened on demand and tracked with a version
//! counter so edits can be pushed via `didChange`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

/// How long a single request may wait for its response.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

struct OpenFile {
    version: i64,
    content: String,
}

pub struct LspClient {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
    /// Latest diagnostics per file URI, replaced wholesale on every publish.
    diagnostics: Arc<Mutex<HashMap<String, Value>>>,
    open_files: Mutex<HashMap<String, OpenFile>>,
    /// Server capabilities from the initialize result.
    pub capabilities: Mutex<Value>,
}

impl LspClient {
    /// Spawn the server and run the initialize handshake.
    pub async fn start(command: &[String], root_dir: &str) -> anyhow::Result<Arc<Self>> {
        let (program, args) = command
            .split_first()
            .context("empty language server command")?;
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning language server {program}"))?;

        let stdin = child.stdin.take().context("no stdin on language server")?;
        let stdout = child.stdout.take().context("no stdout on language server")?;

        let client = Arc::new(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            diagnostics: Arc::new(Mutex::new(HashMap::new())),
            open_files: Mutex::new(HashMap::new()),
            capabilities: Mutex::new(Value::Null),
        });

        // Reader task: frames in, responses routed by id, notifications
        // dispatched.  Ends when the server closes stdout.
        {
            let pending = Arc::clone(&client.pending);
            let diagnostics = Arc::clone(&client.diagnostics);
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout);
                loop {
                    match read_frame(&mut reader).await {
                        Ok(Some(msg)) => {
                            if let Some(id) = msg["id"].as_u64() {
                                if msg.get("method").is_none() {
                                    if let Some(tx) = pending.lock().await.remove(&id) {
                                        let _ = tx.send(msg);
                                    }
                                    continue;
                                }
                                // Server-initiated request (e.g. configuration);
                                // nothing to answer with, drop it.
                                continue;
                            }
                            if msg["method"].as_str()
                                == Some("textDocument/publishDiagnostics")
                            {
                                let params = &msg["params"];
                                if let Some(uri) = params["uri"].as_str() {
                                    diagnostics
                                        .lock()
                                        .await
                                        .insert(uri.to_string(), params["diagnostics"].clone());
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "language server read failed");
                            break;
                        }
                    }
                }
                debug!("language server stream closed");
            });
        }

        let root_uri = path_to_uri(root_dir);
        let result = client
            .request(
                "initialize",
                json!({
                    "processId": std::process::id(),
                    "rootUri": root_uri,
                    "capabilities": {
                        "textDocument": {
                            "hover": {}, "definition": {}, "references": {},
                            "documentSymbol": {}, "rename": {}, "codeAction": {},
                            "formatting": {}, "implementation": {},
                            "signatureHelp": {}, "inlayHint": {},
                            "callHierarchy": {}, "typeHierarchy": {},
                            "publishDiagnostics": {}
                        },
                        "workspace": { "symbol": {} }
                    }
                }),
            )
            .await?;
        *client.capabilities.lock().await = result["capabilities"].clone();
        client.notify("initialized", json!({})).await?;
        Ok(client)
    }

    pub async fn request(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let msg = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        self.write_frame(&msg).await?;

        let resp = match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(v)) => v,
            Ok(Err(_)) => bail!("language server closed while waiting for {method}"),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                bail!("timeout waiting for {method}");
            }
        };
        if let Some(err) = resp.get("error") {
            bail!("{method} failed: {err}");
        }
        Ok(resp["result"].clone())
    }

    pub async fn notify(&self, method: &str, params: Value) -> anyhow::Result<()> {
        self.write_frame(&json!({ "jsonrpc": "2.0", "method": method, "params": params }))
            .await
    }

    async fn write_frame(&self, msg: &Value) -> anyhow::Result<()> {
        let body = serde_json::to_string(msg)?;
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(format!("Content-Length: {}\r\n\r\n{body}", body.len()).as_bytes())
            .await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Open `path` on the server if not already open; returns its URI.
    pub async fn ensure_open(&self, path: &str) -> anyhow::Result<String> {
        let uri = path_to_uri(path);
        let mut open = self.open_files.lock().await;
        if open.contains_key(&uri) {
            return Ok(uri);
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {path}"))?;
        self.notify(
            "textDocument/didOpen",
            json!({ "textDocument": {
                "uri": uri,
                "languageId": language_id(path),
                "version": 1,
                "text": content,
            }}),
        )
        .await?;
        open.insert(uri.clone(), OpenFile { version: 1, content });
        Ok(uri)
    }

    /// Push new content for an already-open file and remember it.
    pub async fn did_change(&self, path: &str, new_content: &str) -> anyhow::Result<()> {
        let uri = path_to_uri(path);
        let mut open = self.open_files.lock().await;
        let file = open
            .get_mut(&uri)
            .with_context(|| format!("{path} is not open"))?;
        file.version += 1;
        file.content = new_content.to_string();
        let version = file.version;
        drop(open);
        self.notify(
            "textDocument/didChange",
            json!({
                "textDocument": { "uri": uri, "version": version },
                "contentChanges": [{ "text": new_content }],
            }),
        )
        .await
    }

    /// The tracked content of an open file.
    pub async fn open_content(&self, path: &str) -> Option<String> {
        let uri = path_to_uri(path);
        self.open_files
            .lock()
            .await
            .get(&uri)
            .map(|f| f.content.clone())
    }

    pub async fn diagnostics_for(&self, uri: &str) -> Option<Value> {
        self.diagnostics.lock().await.get(uri).cloned()
    }

    pub async fn all_diagnostics(&self) -> HashMap<String, Value> {
        self.diagnostics.lock().await.clone()
    }

    /// Best-effort shutdown/exit handshake, then kill.
    pub async fn stop(&self) {
        let _ = self.request("shutdown", Value::Null).await;
        let _ = self.notify("exit", Value::Null).await;
        let mut child = self.child.lock().await;
        let _ = child.kill().await;
    }
}

/// Read one framed message; `None` on clean EOF.
async fn read_frame<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
) -> anyhow::Result<Option<Value>> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some(v) = line.strip_prefix("Content-Length:") {
            content_length = Some(v.trim().parse().context("bad Content-Length")?);
        }
    }
    let len = content_length.context("frame without Content-Length")?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

pub fn path_to_uri(path: &str) -> String {
    let abs = std::path::Path::new(path)
        .canonicalize()
        .unwrap_or_else(|_| std::path::PathBuf::from(path));
    format!("file://{}", abs.display())
}

pub fn uri_to_path(uri: &str) -> String {
    uri.strip_prefix("file://").unwrap_or(uri).to_string()
}

fn language_id(path: &str) -> &'static str {
    match path.rsplit('.').next().unwrap_or("") {
        "rs" => "rust",
        "go" => "go",
        "py" => "python",
        "ts" => "typescript",
        "tsx" => "typescriptreact",
        "js" => "javascript",
        "c" => "c",
        "h" | "hpp" | "cc" | "cpp" => "cpp",
        _ => "plaintext",
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
