// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::tool::{Tool, ToolAnnotations, ToolCall, ToolCallResult};

/// Switch the agent's active model for subsequent iterations.
///
/// `current_model` must be the **same** `Arc` the agent loop reads at the
/// top of each iteration, so the change applies starting with the next
/// provider call.  A request outside the allow-list is a no-op.
pub struct SwitchModelTool {
    current_model: Arc<Mutex<String>>,
    allowed: Vec<String>,
}

impl SwitchModelTool {
    pub fn new(current_model: Arc<Mutex<String>>, allowed: Vec<String>) -> Self {
        Self { current_model, allowed }
    }
}

#[async_trait]
impl Tool for SwitchModelTool {
    fn name(&self) -> &str {
        "switch_model"
    }

    fn description(&self) -> &str {
        "Switch to a different model for the rest of the run. The change takes\n\
         effect on the next model call. Only models from the configured\n\
         allow-list are accepted; anything else is a no-op."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "model": {
                    "type": "string",
                    "description": "Name of the model to switch to (must be in the allow-list)"
                }
            },
            "required": ["model"],
            "additionalProperties": false
        })
    }

    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations::mutating("Switch model")
    }

    async fn execute(&self, call: &ToolCall) -> ToolCallResult {
        let model = match call.args.get("model").and_then(|v| v.as_str()) {
            Some(m) => m.to_string(),
            None => return ToolCallResult::err(&call.id, "missing 'model'"),
        };

        if !self.allowed.iter().any(|m| m == &model) {
            // Not an error: the loop must keep going and the active model is
            // unchanged.
            return ToolCallResult::ok(
                &call.id,
                format!("model {model:?} is not in the allow-list; keeping current model"),
            );
        }

        let mut current = self.current_model.lock().await;
        if *current == model {
            return ToolCallResult::ok(&call.id, format!("already using {model}"));
        }
        debug!(from = %current, to = %model, "switch_model tool");
        *current = model.clone();
        ToolCallResult::ok(&call.id, format!("switched to {model}; applies from the next call"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tool::ToolCall;

    fn make_tool(current: &str, allowed: &[&str]) -> (SwitchModelTool, Arc<Mutex<String>>) {
        let model = Arc::new(Mutex::new(current.to_string()));
        let tool = SwitchModelTool::new(
            Arc::clone(&model),
            allowed.iter().map(|s| s.to_string()).collect(),
        );
        (tool, model)
    }

    fn call(model: &str) -> ToolCall {
        ToolCall { id: "s1".into(), name: "switch_model".into(), args: json!({"model": model}) }
    }

    #[tokio::test]
    async fn allowed_model_switches() {
        let (tool, model) = make_tool("small", &["small", "large"]);
        let out = tool.execute(&call("large")).await;
        assert!(!out.is_error, "{}", out.output);
        assert_eq!(*model.lock().await, "large");
    }

    #[tokio::test]
    async fn disallowed_model_is_noop() {
        let (tool, model) = make_tool("small", &["small", "large"]);
        let out = tool.execute(&call("huge")).await;
        assert!(!out.is_error, "no-op must not fail the loop");
        assert!(out.output.contains("not in the allow-list"));
        assert_eq!(*model.lock().await, "small");
    }

    #[tokio::test]
    async fn same_model_reports_noop() {
        let (tool, model) = make_tool("small", &["small"]);
        let out = tool.execute(&call("small")).await;
        assert!(out.output.contains("already using"));
        assert_eq!(*model.lock().await, "small");
    }

    #[tokio::test]
    async fn missing_model_is_error() {
        let (tool, _) = make_tool("small", &["small"]);
        let c = ToolCall { id: "1".into(), name: "switch_model".into(), args: json!({}) };
        let out = tool.execute(&c).await;
        assert!(out.is_error);
    }
}
