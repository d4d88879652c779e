// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The MCP toolset: one server connection presented through the uniform
//! [`ToolSet`] interface.
//!
//! Lifecycle: `start` connects (child process or HTTP session), runs the
//! initialize handshake — retrying up to 3 times with 200·(n+1) ms backoff,
//! but only when sending the `initialized` notification raced the server —
//! and spawns exactly one connection watcher.  The watcher reconnects with
//! exponential backoff (1 s … 16 s, 5 attempts) on unexpected close and
//! never spawns further watchers.  Tool and prompt lists are cached under
//! generation counters so a slow in-flight refresh can never overwrite a
//! newer invalidation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use cagent_config::{RemoteTransport as RemoteKind, ToolsetConfig};
use cagent_tools::{
    ElicitationHandler, Tool, ToolAnnotations, ToolCall, ToolCallResult, ToolSet,
    ToolsChangedHandler,
};

use crate::protocol::{
    initialize_params, strip_null_args, Incoming, InitializeResult, McpPromptDef, McpToolDef,
    PromptsListResult, ToolsListResult,
};
use crate::remote::RemoteTransportImpl;
use crate::transport::{McpError, McpTransport, StdioTransport};

/// Handshake retries on the initialized-notification race.
const INIT_ATTEMPTS: u32 = 3;

/// Reconnect backoff schedule, in seconds.
const RESTART_BACKOFF_SECS: [u64; 5] = [1, 2, 4, 8, 16];

/// How the toolset reaches its server.
#[derive(Debug, Clone)]
enum ConnectionSpec {
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
    Remote {
        url: String,
        kind: RemoteKind,
        headers: HashMap<String, String>,
    },
}

struct CacheSlot<T> {
    generation: u64,
    value: Option<Vec<T>>,
}

impl<T> Default for CacheSlot<T> {
    fn default() -> Self {
        Self { generation: 0, value: None }
    }
}

struct Inner {
    name: String,
    spec: ConnectionSpec,
    /// Per-session header override map for `${headers.NAME}` interpolation.
    overrides: HashMap<String, String>,
    transport: Mutex<Option<Arc<dyn McpTransport>>>,
    stopping: AtomicBool,
    watcher_spawned: AtomicBool,
    tools_cache: Mutex<CacheSlot<McpToolDef>>,
    prompts_cache: Mutex<CacheSlot<McpPromptDef>>,
    instructions: std::sync::Mutex<Option<String>>,
    tools_changed: std::sync::Mutex<Option<ToolsChangedHandler>>,
    elicitation: std::sync::Mutex<Option<ElicitationHandler>>,
}

pub struct McpToolset {
    inner: Arc<Inner>,
}

impl McpToolset {
    /// Build from a toolset config entry.  `overrides` is the session's
    /// header override map (empty outside API-created sessions).
    pub fn from_config(
        cfg: &ToolsetConfig,
        overrides: HashMap<String, String>,
    ) -> anyhow::Result<Self> {
        let spec = match cfg {
            ToolsetConfig::Stdio { command, args, env, .. } => ConnectionSpec::Stdio {
                command: command.clone(),
                args: args.clone(),
                env: env.clone(),
            },
            ToolsetConfig::Remote { url, transport, headers, .. } => ConnectionSpec::Remote {
                url: url.clone(),
                kind: *transport,
                headers: headers.clone(),
            },
            ToolsetConfig::Builtin { .. } => {
                anyhow::bail!("builtin toolsets are not MCP servers")
            }
        };
        Ok(Self {
            inner: Arc::new(Inner {
                name: cfg.name().to_string(),
                spec,
                overrides,
                transport: Mutex::new(None),
                stopping: AtomicBool::new(false),
                watcher_spawned: AtomicBool::new(false),
                tools_cache: Mutex::new(CacheSlot::default()),
                prompts_cache: Mutex::new(CacheSlot::default()),
                instructions: std::sync::Mutex::new(None),
                tools_changed: std::sync::Mutex::new(None),
                elicitation: std::sync::Mutex::new(None),
            }),
        })
    }

    /// Cached prompt list, fetching on miss.
    pub async fn list_prompts(&self) -> Result<Vec<McpPromptDef>, McpError> {
        Inner::cached_prompts(&self.inner).await
    }
}

impl Inner {
    async fn transport(&self) -> Result<Arc<dyn McpTransport>, McpError> {
        self.transport
            .lock()
            .await
            .clone()
            .ok_or(McpError::NotStarted)
    }

    async fn connect(
        self: &Arc<Self>,
    ) -> Result<(Arc<dyn McpTransport>, mpsc::UnboundedReceiver<Incoming>), McpError> {
        match &self.spec {
            ConnectionSpec::Stdio { command, args, env } => {
                let (t, rx) = StdioTransport::spawn(command, args, env)?;
                Ok((t, rx))
            }
            ConnectionSpec::Remote { url, kind, headers } => {
                let (t, rx) = RemoteTransportImpl::new(
                    url.clone(),
                    *kind,
                    headers.clone(),
                    self.overrides.clone(),
                    crate::oauth::OAuthMode::Managed,
                );
                let handler = self.elicitation.lock().unwrap().clone();
                if let Some(h) = handler {
                    t.set_elicitation_handler(h).await;
                }
                t.connect_sse().await?;
                Ok((t, rx))
            }
        }
    }

    /// Initialize handshake.  A failure to deliver the `initialized`
    /// notification is the retryable class; anything else is terminal.
    async fn handshake(&self, transport: &Arc<dyn McpTransport>) -> Result<bool, McpError> {
        let result = transport
            .request("initialize", Some(initialize_params()))
            .await?;
        let init: InitializeResult = serde_json::from_value(result).unwrap_or_default();
        *self.instructions.lock().unwrap() = init.instructions;

        match transport
            .notify("notifications/initialized", None)
            .await
        {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(toolset = %self.name, error = %e, "failed to send initialized notification");
                Ok(false)
            }
        }
    }

    /// Connect + handshake with the init retry rule, then wire up dispatch.
    async fn establish(self: &Arc<Self>) -> Result<(), McpError> {
        let mut last_err: Option<McpError> = None;
        for attempt in 0..INIT_ATTEMPTS {
            if attempt > 0 {
                // Backoff 200·(n+1) ms after the n-th failed attempt.
                tokio::time::sleep(std::time::Duration::from_millis(200 * attempt as u64))
                    .await;
            }
            // Connect failures are terminal; only the initialized-
            // notification race below is retryable.
            let (transport, incoming) = self.connect().await?;
            match self.handshake(&transport).await {
                Ok(true) => {
                    *self.transport.lock().await = Some(Arc::clone(&transport));
                    self.spawn_dispatch(incoming);
                    return Ok(());
                }
                Ok(false) => {
                    // The initialized-notification race: tear down and retry.
                    transport.shutdown().await;
                    last_err = Some(McpError::Protocol(
                        "failed to send initialized notification".into(),
                    ));
                }
                Err(e) => {
                    transport.shutdown().await;
                    return Err(e);
                }
            }
        }
        Err(last_err.unwrap_or(McpError::NotStarted))
    }

    /// Consume notifications and server-initiated requests from one
    /// connection.  Ends when the connection's channel closes.
    fn spawn_dispatch(self: &Arc<Self>, mut incoming: mpsc::UnboundedReceiver<Incoming>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = incoming.recv().await {
                match msg {
                    Incoming::Notification(n) => match n.method.as_str() {
                        "notifications/tools/list_changed" => {
                            debug!(toolset = %inner.name, "tools/list_changed");
                            inner.invalidate_tools().await;
                        }
                        "notifications/prompts/list_changed" => {
                            debug!(toolset = %inner.name, "prompts/list_changed");
                            inner.invalidate_prompts().await;
                        }
                        other => debug!(toolset = %inner.name, method = other, "notification ignored"),
                    },
                    Incoming::Request { id, method, params } => {
                        inner.handle_server_request(id, &method, params).await;
                    }
                    Incoming::Response(_) => unreachable!("responses are routed by transport"),
                }
            }
        });
    }

    async fn handle_server_request(self: &Arc<Self>, id: u64, method: &str, params: Value) {
        let Ok(transport) = self.transport().await else { return };
        if method != "elicitation/create" {
            debug!(toolset = %self.name, method, "unsupported server request");
            let _ = transport.respond(id, Value::Null).await;
            return;
        }
        let handler = self.elicitation.lock().unwrap().clone();
        let message = params["message"].as_str().unwrap_or("").to_string();
        let result = match handler {
            Some(h) => match h(message).await {
                Ok(answer) => json!({ "action": "accept", "content": { "response": answer } }),
                Err(_) => json!({ "action": "decline" }),
            },
            None => json!({ "action": "decline" }),
        };
        let _ = transport.respond(id, result).await;
    }

    /// Watch the connection and restart it on unexpected close.  Spawned at
    /// most once per toolset; reconnections are handled inside the loop so
    /// no additional watchers ever exist.
    fn spawn_watcher(self: &Arc<Self>) {
        if self.watcher_spawned.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let Some(transport) = inner.transport.lock().await.clone() else {
                    break;
                };
                transport.wait_closed().await;
                if inner.stopping.load(Ordering::SeqCst) {
                    break;
                }
                warn!(toolset = %inner.name, "MCP connection closed unexpectedly; restarting");
                *inner.transport.lock().await = None;

                let mut restarted = false;
                for (attempt, secs) in RESTART_BACKOFF_SECS.iter().enumerate() {
                    tokio::time::sleep(std::time::Duration::from_secs(*secs)).await;
                    if inner.stopping.load(Ordering::SeqCst) {
                        return;
                    }
                    match inner.establish().await {
                        Ok(()) => {
                            info!(
                                toolset = %inner.name,
                                attempt = attempt + 1,
                                "MCP connection restored"
                            );
                            inner.invalidate_tools().await;
                            inner.invalidate_prompts().await;
                            restarted = true;
                            break;
                        }
                        Err(e) => warn!(
                            toolset = %inner.name,
                            attempt = attempt + 1,
                            error = %e,
                            "MCP restart attempt failed"
                        ),
                    }
                }
                if !restarted {
                    warn!(toolset = %inner.name, "giving up on MCP server after 5 restart attempts");
                    break;
                }
            }
        });
    }

    /// Bump the generation and clear the slot, then refetch eagerly.  The
    /// refetch only lands if no newer invalidation happened meanwhile, and
    /// completion is announced through the tools-changed handler.
    async fn invalidate_tools(self: &Arc<Self>) {
        let generation = {
            let mut slot = self.tools_cache.lock().await;
            slot.generation += 1;
            slot.value = None;
            slot.generation
        };
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            match inner.fetch_tools().await {
                Ok(defs) => {
                    let mut slot = inner.tools_cache.lock().await;
                    if slot.generation == generation {
                        slot.value = Some(defs);
                        drop(slot);
                        if let Some(h) = inner.tools_changed.lock().unwrap().clone() {
                            h();
                        }
                    } else {
                        debug!(toolset = %inner.name, "discarding stale tools refetch");
                    }
                }
                Err(e) => warn!(toolset = %inner.name, error = %e, "tools refetch failed"),
            }
        });
    }

    async fn invalidate_prompts(self: &Arc<Self>) {
        let generation = {
            let mut slot = self.prompts_cache.lock().await;
            slot.generation += 1;
            slot.value = None;
            slot.generation
        };
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            match inner.fetch_prompts().await {
                Ok(defs) => {
                    let mut slot = inner.prompts_cache.lock().await;
                    if slot.generation == generation {
                        slot.value = Some(defs);
                    }
                }
                Err(e) => debug!(toolset = %inner.name, error = %e, "prompts refetch failed"),
            }
        });
    }

    async fn fetch_tools(&self) -> Result<Vec<McpToolDef>, McpError> {
        let transport = self.transport().await?;
        let result = transport.request("tools/list", None).await?;
        let parsed: ToolsListResult = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("bad tools/list result: {e}")))?;
        Ok(parsed.tools)
    }

    async fn fetch_prompts(&self) -> Result<Vec<McpPromptDef>, McpError> {
        let transport = self.transport().await?;
        let result = transport.request("prompts/list", None).await?;
        let parsed: PromptsListResult = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("bad prompts/list result: {e}")))?;
        Ok(parsed.prompts)
    }

    /// Cached tool defs.  A fetch that observes a generation bump while it
    /// was in flight returns its (current) result but never caches it.
    async fn cached_tools(self: &Arc<Self>) -> Result<Vec<McpToolDef>, McpError> {
        let generation = {
            let slot = self.tools_cache.lock().await;
            if let Some(v) = &slot.value {
                return Ok(v.clone());
            }
            slot.generation
        };
        let defs = self.fetch_tools().await?;
        let mut slot = self.tools_cache.lock().await;
        if slot.generation == generation {
            slot.value = Some(defs.clone());
        }
        Ok(defs)
    }

    async fn cached_prompts(self: &Arc<Self>) -> Result<Vec<McpPromptDef>, McpError> {
        let generation = {
            let slot = self.prompts_cache.lock().await;
            if let Some(v) = &slot.value {
                return Ok(v.clone());
            }
            slot.generation
        };
        let defs = self.fetch_prompts().await?;
        let mut slot = self.prompts_cache.lock().await;
        if slot.generation == generation {
            slot.value = Some(defs.clone());
        }
        Ok(defs)
    }
}

#[async_trait]
impl ToolSet for McpToolset {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.inner.transport.lock().await.is_some() {
            return Ok(());
        }
        self.inner.stopping.store(false, Ordering::SeqCst);
        self.inner.establish().await?;
        self.inner.spawn_watcher();
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.inner.stopping.store(true, Ordering::SeqCst);
        {
            let mut slot = self.inner.tools_cache.lock().await;
            slot.generation += 1;
            slot.value = None;
        }
        {
            let mut slot = self.inner.prompts_cache.lock().await;
            slot.generation += 1;
            slot.value = None;
        }
        if let Some(t) = self.inner.transport.lock().await.take() {
            t.shutdown().await;
        }
        Ok(())
    }

    async fn tools(&self) -> anyhow::Result<Vec<Arc<dyn Tool>>> {
        let defs = Inner::cached_tools(&self.inner).await?;
        Ok(defs
            .into_iter()
            .map(|def| {
                Arc::new(McpTool {
                    prefixed_name: format!("{}_{}", self.inner.name, def.name),
                    inner: Arc::clone(&self.inner),
                    def,
                }) as Arc<dyn Tool>
            })
            .collect())
    }

    fn instructions(&self) -> Option<String> {
        self.inner.instructions.lock().unwrap().clone()
    }

    fn set_tools_changed_handler(&self, handler: ToolsChangedHandler) {
        *self.inner.tools_changed.lock().unwrap() = Some(handler);
    }

    fn set_elicitation_handler(&self, handler: ElicitationHandler) {
        *self.inner.elicitation.lock().unwrap() = Some(handler);
    }
}

/// One server tool, addressed by its toolset-prefixed name.
struct McpTool {
    prefixed_name: String,
    def: McpToolDef,
    inner: Arc<Inner>,
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.prefixed_name
    }

    fn description(&self) -> &str {
        &self.def.description
    }

    fn parameters_schema(&self) -> Value {
        self.def.input_schema.clone()
    }

    fn annotations(&self) -> ToolAnnotations {
        let a = self.def.annotations.clone().unwrap_or_default();
        ToolAnnotations {
            title: a.title.unwrap_or_else(|| self.def.name.clone()),
            read_only: a.read_only_hint,
            destructive: a.destructive_hint,
        }
    }

    async fn execute(&self, call: &ToolCall) -> ToolCallResult {
        let transport = match self.inner.transport().await {
            Ok(t) => t,
            Err(e) => return ToolCallResult::err(&call.id, e.to_string()),
        };
        let params = json!({
            "name": self.def.name,
            "arguments": strip_null_args(call.args.clone()),
        });
        match transport.request("tools/call", Some(params)).await {
            Ok(result) => {
                match serde_json::from_value::<crate::protocol::ToolCallResult>(result) {
                    Ok(r) if r.is_error => ToolCallResult::err(&call.id, r.text()),
                    Ok(r) => ToolCallResult::ok(&call.id, r.text()),
                    Err(e) => {
                        ToolCallResult::err(&call.id, format!("bad tools/call result: {e}"))
                    }
                }
            }
            Err(e) => ToolCallResult::err(&call.id, e.to_string()),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
