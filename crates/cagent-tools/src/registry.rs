// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::warn;

use crate::tool::{Tool, ToolCall, ToolCallResult};

/// Callback fired by a toolset when its tool list changed (e.g. an MCP
/// `tools/list_changed` notification).  The registry refreshes its snapshot
/// on the next iteration.
pub type ToolsChangedHandler = Arc<dyn Fn() + Send + Sync>;

/// Callback used by toolsets that need to ask the user something mid-call:
/// MCP elicitation requests, OAuth consent, the user-prompt builtin.  The
/// prompt goes in; the user's answer comes back.
pub type ElicitationHandler =
    Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync>;

/// A logical group of tools with a shared lifecycle (one MCP server, the
/// shell builtin with its job table, the LSP bridge, ...).
#[async_trait]
pub trait ToolSet: Send + Sync {
    fn name(&self) -> &str;
    /// Bring the toolset up (spawn processes, handshake).  Idempotent.
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }
    /// Tear the toolset down, terminating anything it spawned.
    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
    /// The tools currently offered.  May change between calls for dynamic
    /// toolsets; the registry snapshots per loop iteration.
    async fn tools(&self) -> anyhow::Result<Vec<Arc<dyn Tool>>>;
    /// Server-supplied usage instructions appended to the system prompt.
    fn instructions(&self) -> Option<String> {
        None
    }
    fn set_tools_changed_handler(&self, _handler: ToolsChangedHandler) {}
    fn set_elicitation_handler(&self, _handler: ElicitationHandler) {}
}

/// A tool schema as presented to the provider.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Aggregates toolsets and presents the agent loop with a flat, snapshot-able
/// tool list.  A changed notification from any toolset invalidates the
/// snapshot; the next `snapshot()` call re-collects.
pub struct ToolRegistry {
    toolsets: Vec<Arc<dyn ToolSet>>,
    dirty: Arc<AtomicBool>,
    snapshot: tokio::sync::Mutex<Option<Vec<Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new(toolsets: Vec<Arc<dyn ToolSet>>) -> Self {
        let dirty = Arc::new(AtomicBool::new(true));
        for ts in &toolsets {
            let flag = Arc::clone(&dirty);
            ts.set_tools_changed_handler(Arc::new(move || {
                flag.store(true, Ordering::SeqCst);
            }));
        }
        Self {
            toolsets,
            dirty,
            snapshot: tokio::sync::Mutex::new(None),
        }
    }

    /// Start every toolset.  A toolset that fails to start is logged and
    /// skipped; its tools are simply absent.
    pub async fn start_all(&self) {
        for ts in &self.toolsets {
            if let Err(e) = ts.start().await {
                warn!(toolset = ts.name(), error = %e, "toolset failed to start");
            }
        }
    }

    /// Stop every toolset in reverse start order.
    pub async fn stop_all(&self) {
        for ts in self.toolsets.iter().rev() {
            if let Err(e) = ts.stop().await {
                warn!(toolset = ts.name(), error = %e, "toolset failed to stop");
            }
        }
    }

    /// The current flat tool list, re-collected when any toolset reported a
    /// change since the last snapshot.
    pub async fn snapshot(&self) -> Vec<Arc<dyn Tool>> {
        let mut cached = self.snapshot.lock().await;
        if cached.is_none() || self.dirty.swap(false, Ordering::SeqCst) {
            let mut all: Vec<Arc<dyn Tool>> = Vec::new();
            for ts in &self.toolsets {
                match ts.tools().await {
                    Ok(tools) => all.extend(tools),
                    Err(e) => warn!(toolset = ts.name(), error = %e, "toolset tools() failed"),
                }
            }
            *cached = Some(all);
        }
        cached.clone().unwrap_or_default()
    }

    /// Schemas for the current snapshot, sorted by name for stable prompts.
    pub async fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .snapshot()
            .await
            .iter()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Instructions from all toolsets that provide them.
    pub fn instructions(&self) -> Vec<String> {
        self.toolsets
            .iter()
            .filter_map(|ts| ts.instructions())
            .collect()
    }

    pub fn set_elicitation_handler(&self, handler: ElicitationHandler) {
        for ts in &self.toolsets {
            ts.set_elicitation_handler(Arc::clone(&handler));
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.snapshot().await.into_iter().find(|t| t.name() == name)
    }

    pub async fn execute(&self, call: &ToolCall) -> ToolCallResult {
        match self.get(&call.name).await {
            Some(tool) => tool.execute(call).await,
            None => ToolCallResult::err(&call.id, format!("unknown tool: {}", call.name)),
        }
    }
}

/// A toolset over a fixed list of tools; the builtin toolsets that need no
/// lifecycle are built from this.
pub struct StaticToolSet {
    name: String,
    tools: Vec<Arc<dyn Tool>>,
    instructions: Option<String>,
}

impl StaticToolSet {
    pub fn new(name: impl Into<String>, tools: Vec<Arc<dyn Tool>>) -> Self {
        Self { name: name.into(), tools, instructions: None }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }
}

#[async_trait]
impl ToolSet for StaticToolSet {
    fn name(&self) -> &str {
        &self.name
    }

    async fn tools(&self) -> anyhow::Result<Vec<Arc<dyn Tool>>> {
        Ok(self.tools.clone())
    }

    fn instructions(&self) -> Option<String> {
        self.instructions.clone()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::tool::ToolAnnotations;

    struct EchoTool {
        name: &'static str,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn annotations(&self) -> ToolAnnotations {
            ToolAnnotations::read_only("echo")
        }
        async fn execute(&self, call: &ToolCall) -> ToolCallResult {
            ToolCallResult::ok(&call.id, format!("echo:{}", call.args))
        }
    }

    fn registry_with(names: &[&'static str]) -> ToolRegistry {
        let tools: Vec<Arc<dyn Tool>> = names
            .iter()
            .map(|n| Arc::new(EchoTool { name: n }) as Arc<dyn Tool>)
            .collect();
        ToolRegistry::new(vec![Arc::new(StaticToolSet::new("test", tools))])
    }

    #[tokio::test]
    async fn snapshot_contains_registered_tools() {
        let reg = registry_with(&["a", "b"]);
        let snap = reg.snapshot().await;
        assert_eq!(snap.len(), 2);
    }

    #[tokio::test]
    async fn schemas_are_sorted_by_name() {
        let reg = registry_with(&["zeta", "alpha"]);
        let schemas = reg.schemas().await;
        assert_eq!(schemas[0].name, "alpha");
        assert_eq!(schemas[1].name, "zeta");
    }

    #[tokio::test]
    async fn execute_known_tool_succeeds() {
        let reg = registry_with(&["echo"]);
        let call = ToolCall { id: "1".into(), name: "echo".into(), args: json!({"x":1}) };
        let out = reg.execute(&call).await;
        assert!(!out.is_error);
        assert!(out.output.starts_with("echo:"));
    }

    #[tokio::test]
    async fn execute_unknown_tool_returns_error() {
        let reg = registry_with(&[]);
        let call = ToolCall { id: "x".into(), name: "missing".into(), args: json!({}) };
        let out = reg.execute(&call).await;
        assert!(out.is_error);
        assert!(out.output.contains("unknown tool"));
    }

    /// A toolset whose list changes after a notification.
    struct FlippingToolSet {
        flipped: std::sync::atomic::AtomicBool,
        handler: std::sync::Mutex<Option<ToolsChangedHandler>>,
    }

    #[async_trait]
    impl ToolSet for FlippingToolSet {
        fn name(&self) -> &str {
            "flipping"
        }
        async fn tools(&self) -> anyhow::Result<Vec<Arc<dyn Tool>>> {
            let name = if self.flipped.load(Ordering::SeqCst) { "after" } else { "before" };
            Ok(vec![Arc::new(EchoTool { name })])
        }
        fn set_tools_changed_handler(&self, handler: ToolsChangedHandler) {
            *self.handler.lock().unwrap() = Some(handler);
        }
    }

    #[tokio::test]
    async fn changed_notification_refreshes_snapshot() {
        let ts = Arc::new(FlippingToolSet {
            flipped: std::sync::atomic::AtomicBool::new(false),
            handler: std::sync::Mutex::new(None),
        });
        let reg = ToolRegistry::new(vec![ts.clone() as Arc<dyn ToolSet>]);

        let snap = reg.snapshot().await;
        assert_eq!(snap[0].name(), "before");

        // Server-side change + notification.
        ts.flipped.store(true, Ordering::SeqCst);
        (ts.handler.lock().unwrap().as_ref().unwrap())();

        let snap = reg.snapshot().await;
        assert_eq!(snap[0].name(), "after");
    }

    #[tokio::test]
    async fn snapshot_is_cached_without_notifications() {
        let ts = Arc::new(FlippingToolSet {
            flipped: std::sync::atomic::AtomicBool::new(false),
            handler: std::sync::Mutex::new(None),
        });
        let reg = ToolRegistry::new(vec![ts.clone() as Arc<dyn ToolSet>]);
        let _ = reg.snapshot().await;

        // The list changed server-side but no notification arrived; the
        // cached snapshot must win.
        ts.flipped.store(true, Ordering::SeqCst);
        let snap = reg.snapshot().await;
        assert_eq!(snap[0].name(), "before");
    }
}
