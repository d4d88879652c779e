// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Mutex;
use tracing::debug;

use crate::registry::ElicitationHandler;
use crate::tool::{Tool, ToolAnnotations, ToolCall, ToolCallResult};

/// Ask the user a question mid-run and feed the answer back to the model.
///
/// The actual surface (terminal prompt, API callback, UI dialog) is supplied
/// by the embedder through the elicitation handler; without one the tool
/// reports that the session is non-interactive.
#[derive(Default)]
pub struct AskUserTool {
    handler: Mutex<Option<ElicitationHandler>>,
}

impl AskUserTool {
    pub fn set_handler(&self, handler: ElicitationHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }
}

#[async_trait]
impl Tool for AskUserTool {
    fn name(&self) -> &str {
        "ask_user"
    }

    fn description(&self) -> &str {
        "Ask the user a question and wait for their reply. Use only when the\n\
         task cannot proceed without a decision from the user; otherwise keep\n\
         working. Unavailable in headless runs — returns an error there."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": {
                    "type": "string",
                    "description": "The question to put to the user"
                }
            },
            "required": ["question"],
            "additionalProperties": false
        })
    }

    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations::read_only("Ask the user")
    }

    async fn execute(&self, call: &ToolCall) -> ToolCallResult {
        let question = match call.args.get("question").and_then(|v| v.as_str()) {
            Some(q) => q.to_string(),
            None => return ToolCallResult::err(&call.id, "missing 'question'"),
        };
        let handler = self.handler.lock().unwrap().clone();
        let Some(handler) = handler else {
            return ToolCallResult::err(
                &call.id,
                "no interactive surface available in this session",
            );
        };
        debug!(question = %question, "ask_user tool");
        match handler(question).await {
            Ok(answer) => ToolCallResult::ok(&call.id, answer),
            Err(e) => ToolCallResult::err(&call.id, format!("user declined: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::tool::ToolCall;

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall { id: "q1".into(), name: "ask_user".into(), args }
    }

    #[tokio::test]
    async fn without_handler_is_error() {
        let t = AskUserTool::default();
        let out = t.execute(&call(json!({"question": "ok?"}))).await;
        assert!(out.is_error);
        assert!(out.output.contains("no interactive surface"));
    }

    #[tokio::test]
    async fn handler_answer_is_returned() {
        let t = AskUserTool::default();
        t.set_handler(Arc::new(|q| {
            Box::pin(async move { Ok(format!("answer to: {q}")) })
        }));
        let out = t.execute(&call(json!({"question": "proceed?"}))).await;
        assert!(!out.is_error);
        assert_eq!(out.output, "answer to: proceed?");
    }

    #[tokio::test]
    async fn handler_error_maps_to_tool_error() {
        let t = AskUserTool::default();
        t.set_handler(Arc::new(|_| Box::pin(async { Err(anyhow::anyhow!("dismissed")) })));
        let out = t.execute(&call(json!({"question": "x"}))).await;
        assert!(out.is_error);
        assert!(out.output.contains("dismissed"));
    }

    #[tokio::test]
    async fn missing_question_is_error() {
        let t = AskUserTool::default();
        let out = t.execute(&call(json!({}))).await;
        assert!(out.is_error);
    }
}
