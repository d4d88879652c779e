// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

/// Hard character ceiling for tool output returned to the model.
const OUTPUT_LIMIT_CHARS: usize = 30_000;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolCallResult {
    pub call_id: String,
    pub output: String,
    /// If true, the tool execution failed non-fatally (the loop continues).
    pub is_error: bool,
    /// Opaque per-tool metadata forwarded to consumers, never to the model.
    pub meta: Option<Value>,
}

impl ToolCallResult {
    /// Successful result.  Output is capped at the model-facing limit.
    pub fn ok(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            output: truncate_output(output.into()),
            is_error: false,
            meta: None,
        }
    }

    /// Error result containing a plain-text error message.
    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            output: truncate_output(msg.into()),
            is_error: true,
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Cap `s` at the output limit, appending a visible truncation marker.
/// The cut lands on a char boundary so the result stays valid UTF-8.
pub fn truncate_output(s: String) -> String {
    if s.len() <= OUTPUT_LIMIT_CHARS {
        return s;
    }
    let mut cut = OUTPUT_LIMIT_CHARS;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    let omitted = s.len() - cut;
    format!("{}\n...[output truncated, {omitted} bytes omitted]", &s[..cut])
}

/// Behavioral hints attached to a tool definition.
///
/// `read_only` gates parallel execution: the loop runs a batch of tool calls
/// concurrently only when every call's tool is read-only.
#[derive(Debug, Clone, Default)]
pub struct ToolAnnotations {
    pub title: String,
    pub read_only: bool,
    pub destructive: bool,
}

impl ToolAnnotations {
    pub fn read_only(title: impl Into<String>) -> Self {
        Self { title: title.into(), read_only: true, destructive: false }
    }

    pub fn mutating(title: impl Into<String>) -> Self {
        Self { title: title.into(), read_only: false, destructive: false }
    }

    pub fn destructive(title: impl Into<String>) -> Self {
        Self { title: title.into(), read_only: false, destructive: true }
    }
}

/// Trait that every tool must implement, builtin or bridged.
///
/// Cancellation is drop-based: the loop races `execute` against its cancel
/// signal and drops the future when the run is aborted.  Tools that spawn
/// processes must arrange for teardown on drop (`kill_on_drop`, process
/// groups).
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters
    fn parameters_schema(&self) -> Value;
    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations::default()
    }
    /// Execute the tool.  Errors should be wrapped in [`ToolCallResult::err`].
    async fn execute(&self, call: &ToolCall) -> ToolCallResult;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_result_is_not_error() {
        let r = ToolCallResult::ok("1", "fine");
        assert!(!r.is_error);
        assert_eq!(r.output, "fine");
    }

    #[test]
    fn err_result_is_error() {
        let r = ToolCallResult::err("1", "bad");
        assert!(r.is_error);
    }

    #[test]
    fn short_output_passes_through_unchanged() {
        let s = "hello\nworld".to_string();
        assert_eq!(truncate_output(s.clone()), s);
    }

    #[test]
    fn oversized_output_is_truncated_with_marker() {
        let s = "x".repeat(40_000);
        let t = truncate_output(s);
        assert!(t.len() < 40_000);
        assert!(t.contains("output truncated"));
        assert!(t.contains("10000 bytes omitted"));
    }

    #[test]
    fn truncation_lands_on_char_boundary() {
        // Multi-byte characters straddling the limit must not split.
        let s = "é".repeat(20_000); // 2 bytes each → 40 000 bytes
        let t = truncate_output(s);
        assert!(t.contains("output truncated"));
        // Would panic on invalid UTF-8 slicing inside truncate_output already;
        // re-validate to be explicit.
        assert!(std::str::from_utf8(t.as_bytes()).is_ok());
    }

    #[test]
    fn annotations_constructors() {
        assert!(ToolAnnotations::read_only("t").read_only);
        assert!(!ToolAnnotations::mutating("t").read_only);
        assert!(ToolAnnotations::destructive("t").destructive);
    }
}
