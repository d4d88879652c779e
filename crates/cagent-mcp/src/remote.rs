// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Remote MCP transport: streamable HTTP (default) or classic HTTP+SSE.
//!
//! Streamable HTTP posts every JSON-RPC message to the server URL; the
//! response is either a plain JSON body or a short-lived SSE stream carrying
//! the response (standalone GET streams are disabled).  The SSE flavor opens
//! one long-lived GET stream for all server→client traffic and posts
//! requests to the endpoint the server announces in its `endpoint` event.
//!
//! An OAuth round-tripper wraps every send: a stored bearer token is
//! attached (refreshed near expiry), and a 401 either triggers the managed
//! PKCE flow (then one retry) or surfaces the server challenge unchanged.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::debug;

use cagent_config::RemoteTransport as TransportKind;
use cagent_tools::ElicitationHandler;

use crate::oauth::{self, OAuthMode};
use crate::protocol::{classify, Incoming, JsonRpcNotification, JsonRpcRequest};
use crate::transport::{McpError, McpTransport};

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Replace `${headers.NAME}` placeholders from the per-session override map.
/// Names are normalized the way the env mirror spells them (uppercase,
/// dashes and colons as underscores); unknown names resolve to the empty
/// string.
pub fn interpolate_header(template: &str, overrides: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${headers.") {
        out.push_str(&rest[..start]);
        let after = &rest[start + "${headers.".len()..];
        match after.find('}') {
            Some(end) => {
                let name: String = after[..end]
                    .chars()
                    .map(|c| match c {
                        '-' | ':' => '_',
                        c => c.to_ascii_uppercase(),
                    })
                    .collect();
                if let Some(v) = overrides.get(&name) {
                    out.push_str(v);
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

pub struct RemoteTransportImpl {
    client: reqwest::Client,
    url: String,
    kind: TransportKind,
    /// Header templates from config; values may contain placeholders.
    headers: HashMap<String, String>,
    /// Per-session header override map used for interpolation.
    overrides: HashMap<String, String>,
    oauth_mode: OAuthMode,
    elicit: Mutex<Option<ElicitationHandler>>,
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<crate::protocol::JsonRpcResponse>>>>,
    incoming_tx: mpsc::UnboundedSender<Incoming>,
    /// POST endpoint announced by an SSE server; the base URL until then.
    post_url: Mutex<String>,
    alive: AtomicBool,
    closed_rx: watch::Receiver<bool>,
    closed_tx: watch::Sender<bool>,
}

impl RemoteTransportImpl {
    pub fn new(
        url: String,
        kind: TransportKind,
        headers: HashMap<String, String>,
        overrides: HashMap<String, String>,
        oauth_mode: OAuthMode,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Incoming>) {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let t = Arc::new(Self {
            client: reqwest::Client::new(),
            post_url: Mutex::new(url.clone()),
            url,
            kind,
            headers,
            overrides,
            oauth_mode,
            elicit: Mutex::new(None),
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            incoming_tx,
            alive: AtomicBool::new(true),
            closed_rx,
            closed_tx,
        });
        (t, incoming_rx)
    }

    pub async fn set_elicitation_handler(&self, handler: ElicitationHandler) {
        *self.elicit.lock().await = Some(handler);
    }

    /// Open the long-lived SSE stream (sse flavor only).  Resolves once the
    /// server announced its POST endpoint.
    pub async fn connect_sse(self: &Arc<Self>) -> Result<(), McpError> {
        if self.kind != TransportKind::Sse {
            return Ok(());
        }
        let resp = self
            .send_with_auth(self.client.get(&self.url).header("Accept", "text/event-stream"))
            .await?;
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut endpoint_tx = Some(endpoint_tx);
            let mut stream = resp.bytes_stream();
            let mut buf = String::new();
            let mut event_name = String::new();
            while let Some(chunk) = stream.next().await {
                let Ok(bytes) = chunk else { break };
                buf.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    if let Some(name) = line.strip_prefix("event: ") {
                        event_name = name.trim().to_string();
                    } else if let Some(data) = line.strip_prefix("data: ") {
                        if event_name == "endpoint" {
                            let endpoint = resolve_endpoint(&this.url, data.trim());
                            *this.post_url.lock().await = endpoint.clone();
                            if let Some(tx) = endpoint_tx.take() {
                                let _ = tx.send(endpoint);
                            }
                        } else if let Ok(v) = serde_json::from_str::<Value>(data.trim()) {
                            this.dispatch(v).await;
                        }
                        event_name.clear();
                    }
                }
            }
            this.alive.store(false, Ordering::SeqCst);
            let _ = this.closed_tx.send(true);
        });

        tokio::time::timeout(REQUEST_TIMEOUT, endpoint_rx)
            .await
            .map_err(|_| McpError::Timeout)?
            .map_err(|_| McpError::Protocol("SSE stream closed before endpoint event".into()))?;
        Ok(())
    }

    async fn dispatch(&self, msg: Value) {
        match classify(msg) {
            Some(Incoming::Response(resp)) => {
                if let Some(tx) = self.pending.lock().await.remove(&resp.id) {
                    let _ = tx.send(resp);
                }
            }
            Some(other) => {
                let _ = self.incoming_tx.send(other);
            }
            None => debug!("unclassifiable message from remote server"),
        }
    }

    fn apply_headers(&self, mut rb: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (name, template) in &self.headers {
            let value = interpolate_header(template, &self.overrides);
            rb = rb.header(name, value);
        }
        rb
    }

    /// The OAuth round-tripper: attach a bearer when one is stored, send,
    /// and handle 401 per mode — managed runs the PKCE flow and retries
    /// once; unmanaged surfaces the challenge.
    async fn send_with_auth(
        &self,
        rb: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, McpError> {
        let rb = self.apply_headers(rb);
        let mut authed = rb
            .try_clone()
            .ok_or_else(|| McpError::Protocol("unclonable request".into()))?;
        if let Some(token) = oauth::current_token(&self.client, &self.url)
            .await
            .map_err(|e| McpError::Protocol(e.to_string()))?
        {
            authed = authed.bearer_auth(token);
        }
        let resp = authed
            .send()
            .await
            .map_err(|e| McpError::Protocol(format!("request failed: {e}")))?;
        if resp.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let challenge_header = resp
            .headers()
            .get("www-authenticate")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.text().await.unwrap_or_default();

        match self.oauth_mode {
            OAuthMode::Unmanaged => Err(McpError::Protocol(format!(
                "authorization required: {}",
                oauth::challenge_from_response(challenge_header.as_deref(), &body)
            ))),
            OAuthMode::Managed => {
                let elicit = self.elicit.lock().await.clone().ok_or_else(|| {
                    McpError::Protocol("authorization required but no elicitation surface".into())
                })?;
                let token = oauth::managed_flow(&self.client, &self.url, &elicit)
                    .await
                    .map_err(|e| McpError::Protocol(format!("authorization failed: {e}")))?;
                rb.bearer_auth(token)
                    .send()
                    .await
                    .map_err(|e| McpError::Protocol(format!("request failed after auth: {e}")))
            }
        }
    }

    /// POST a JSON-RPC message.  For streamable HTTP the response body may
    /// itself be an SSE stream carrying the reply plus interleaved
    /// notifications.
    async fn post(&self, msg: &Value) -> Result<(), McpError> {
        let url = self.post_url.lock().await.clone();
        let resp = self
            .send_with_auth(
                self.client
                    .post(&url)
                    .header("Accept", "application/json, text/event-stream")
                    .json(msg),
            )
            .await?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::ACCEPTED {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(McpError::Protocol(format!("server error {status}: {text}")));
        }

        let is_sse = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        if is_sse {
            let mut stream = resp.bytes_stream();
            let mut buf = String::new();
            while let Some(chunk) = stream.next().await {
                let bytes = chunk
                    .map_err(|e| McpError::Protocol(format!("stream error: {e}")))?;
                buf.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    if let Some(data) = line.strip_prefix("data: ") {
                        if let Ok(v) = serde_json::from_str::<Value>(data.trim()) {
                            self.dispatch(v).await;
                        }
                    }
                }
            }
        } else if self.kind == TransportKind::StreamableHttp {
            let text = resp
                .text()
                .await
                .map_err(|e| McpError::Protocol(e.to_string()))?;
            if !text.trim().is_empty() {
                if let Ok(v) = serde_json::from_str::<Value>(&text) {
                    self.dispatch(v).await;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl McpTransport for RemoteTransportImpl {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let req = JsonRpcRequest::new(id, method, params);
        debug!(id, method, url = %self.url, "sending remote MCP request");
        if let Err(e) = self.post(&serde_json::to_value(&req)?).await {
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
        self.post(&serde_json::to_value(&n)?).await
    }

    async fn respond(&self, id: u64, result: Value) -> Result<(), McpError> {
        self.post(&serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result }))
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
        let _ = self.closed_tx.send(true);
    }
}

/// Resolve the endpoint announced by an SSE server against the base URL.
fn resolve_endpoint(base: &str, endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.to_string();
    }
    // scheme://host[:port] of the base, plus the absolute path.
    let origin = match base.find("://").map(|i| i + 3) {
        Some(after_scheme) => {
            let host_end = base[after_scheme..]
                .find('/')
                .map(|i| after_scheme + i)
                .unwrap_or(base.len());
            &base[..host_end]
        }
        None => base,
    };
    if endpoint.starts_with('/') {
        format!("{origin}{endpoint}")
    } else {
        format!("{origin}/{endpoint}")
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolation_substitutes_known_names() {
        let mut overrides = HashMap::new();
        overrides.insert("AUTH".to_string(), "token-123".to_string());
        assert_eq!(
            interpolate_header("Bearer ${headers.AUTH}", &overrides),
            "Bearer token-123"
        );
    }

    #[test]
    fn interpolation_normalizes_placeholder_names() {
        let mut overrides = HashMap::new();
        overrides.insert("X_API_KEY".to_string(), "k".to_string());
        assert_eq!(interpolate_header("${headers.x-api-key}", &overrides), "k");
    }

    #[test]
    fn interpolation_unknown_name_is_empty() {
        let overrides = HashMap::new();
        assert_eq!(interpolate_header("x${headers.MISSING}y", &overrides), "xy");
    }

    #[test]
    fn interpolation_multiple_placeholders() {
        let mut overrides = HashMap::new();
        overrides.insert("A".to_string(), "1".to_string());
        overrides.insert("B".to_string(), "2".to_string());
        assert_eq!(
            interpolate_header("${headers.A}-${headers.B}", &overrides),
            "1-2"
        );
    }

    #[test]
    fn interpolation_plain_string_unchanged() {
        let overrides = HashMap::new();
        assert_eq!(interpolate_header("application/json", &overrides), "application/json");
    }

    #[test]
    fn interpolation_unterminated_placeholder_kept_verbatim() {
        let overrides = HashMap::new();
        assert_eq!(
            interpolate_header("x${headers.OPEN", &overrides),
            "x${headers.OPEN"
        );
    }

    #[test]
    fn endpoint_resolution() {
        assert_eq!(
            resolve_endpoint("https://mcp.example.com/sse", "/messages?sid=1"),
            "https://mcp.example.com/messages?sid=1"
        );
        assert_eq!(
            resolve_endpoint("https://mcp.example.com/sse", "https://other/m"),
            "https://other/m"
        );
        assert_eq!(
            resolve_endpoint("http://localhost:3000/sse", "messages"),
            "http://localhost:3000/messages"
        );
    }
}
