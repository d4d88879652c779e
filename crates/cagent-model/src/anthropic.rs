// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use anyhow::{bail, Context};
use async_trait::async_trait;
use base64::Engine;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

use crate::{
    files,
    provider::{ProviderError, ResponseStream},
    sanitize::normalize_schema,
    CompletionRequest, ContentPart, Message, MessageContent, ResponseEvent, Role, StopReason,
    Usage,
};

/// Reserve subtracted from the context window when recomputing `max_tokens`
/// after a context-overflow error.
const OVERFLOW_HEADROOM: u64 = 1024;

/// Output headroom granted on top of the thinking budget when the user did
/// not configure `max_tokens` explicitly.
const THINKING_OUTPUT_HEADROOM: u32 = 8192;

/// Minimum thinking budget the API accepts; smaller values are ignored.
const MIN_THINKING_BUDGET: u32 = 1024;

pub struct AnthropicProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    /// Explicitly configured output cap, when the user set one.
    configured_max_tokens: Option<u32>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    thinking_budget: u32,
    /// Allow thinking blocks to interleave with tool use (beta header).
    interleaved_thinking: bool,
    /// Upload local image files through the Files API instead of inlining
    /// base64, enabling the 2-hour file-reference cache.
    use_files_api: bool,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(cfg: &cagent_config::ModelConfig, api_key: Option<String>) -> Self {
        Self {
            model: cfg.name.clone(),
            api_key,
            base_url: cfg
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.anthropic.com".into()),
            configured_max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
            top_p: cfg.top_p,
            thinking_budget: cfg.thinking_budget,
            interleaved_thinking: cfg.provider_opts.interleaved_thinking,
            use_files_api: cfg.provider_opts.use_files_api,
            client: reqwest::Client::new(),
        }
    }

    /// Resolve the effective (max_tokens, thinking_budget) pair.
    ///
    /// Budgets below the API minimum are dropped with a warning.  A budget
    /// that does not leave room for output is dropped when it merely equals
    /// the configured cap, and is a hard `ConfigError` when it exceeds it —
    /// the user asked for something the API cannot serve.  When no cap is
    /// configured, the cap is auto-raised to budget + headroom.
    fn resolve_limits(&self) -> anyhow::Result<(u32, u32)> {
        let default_max = self
            .max_output_tokens_catalog()
            .unwrap_or(4096)
            .min(u32::MAX as u64) as u32;

        let mut budget = self.thinking_budget;
        if budget > 0 && budget < MIN_THINKING_BUDGET {
            warn!(budget, "thinking budget below {MIN_THINKING_BUDGET}; thinking disabled");
            budget = 0;
        }

        if budget == 0 {
            return Ok((self.configured_max_tokens.unwrap_or(default_max), 0));
        }

        match self.configured_max_tokens {
            Some(max) if budget > max => Err(ProviderError::Config(format!(
                "thinking_budget ({budget}) exceeds max_tokens ({max})"
            ))
            .into()),
            Some(max) if budget == max => {
                warn!(budget, max, "thinking budget leaves no output room; thinking disabled");
                Ok((max, 0))
            }
            Some(max) => Ok((max, budget)),
            None => Ok((budget + THINKING_OUTPUT_HEADROOM, budget)),
        }
    }

    fn max_output_tokens_catalog(&self) -> Option<u64> {
        crate::catalog::lookup("anthropic", &self.model).map(|e| e.max_output_tokens)
    }

    /// Build the full request body with the given output cap.
    async fn build_body(&self, req: &CompletionRequest, max_tokens: u32) -> anyhow::Result<Value> {
        let (_, thinking_budget) = self.resolve_limits()?;
        let (system_blocks, messages) = self.build_wire_messages(&req.messages).await?;

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": normalize_schema(Some(t.parameters.clone())),
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": max_tokens,
            "stream": true,
        });

        if thinking_budget > 0 {
            body["thinking"] = json!({ "type": "enabled", "budget_tokens": thinking_budget });
            // The API rejects sampling parameters while thinking is on.
            if self.temperature.is_some() || self.top_p.is_some() {
                warn!("temperature/top_p are not supported with extended thinking; ignoring");
            }
        } else {
            if let Some(t) = self.temperature {
                body["temperature"] = json!(t);
            }
            if let Some(p) = self.top_p {
                body["top_p"] = json!(p);
            }
        }

        if !system_blocks.is_empty() {
            body["system"] = Value::Array(system_blocks);
        }
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }
        Ok(body)
    }

    /// Convert the session history into the wire shape.
    ///
    /// Returns `(system_blocks, messages)`.  System-role text is lifted into
    /// top-level system blocks; consecutive tool-role messages merge into a
    /// single user message; ephemeral cache markers land on the last content
    /// block of the last two messages and on the last two system blocks.
    async fn build_wire_messages(
        &self,
        messages: &[Message],
    ) -> anyhow::Result<(Vec<Value>, Vec<Value>)> {
        validate_tool_sequence(messages)?;

        let mut system_blocks: Vec<Value> = Vec::new();
        let mut out: Vec<Value> = Vec::new();
        // Accumulates tool_result blocks until a non-tool message flushes them.
        let mut pending_results: Vec<Value> = Vec::new();

        for m in messages {
            if m.role == Role::Tool {
                if let MessageContent::ToolResult { tool_call_id, content, is_error } = &m.content {
                    let mut block = json!({
                        "type": "tool_result",
                        "tool_use_id": tool_call_id,
                        "content": content,
                    });
                    if *is_error {
                        block["is_error"] = json!(true);
                    }
                    pending_results.push(block);
                }
                continue;
            }
            if !pending_results.is_empty() {
                out.push(json!({ "role": "user", "content": std::mem::take(&mut pending_results) }));
            }

            match m.role {
                Role::System => {
                    if let Some(t) = m.as_text() {
                        system_blocks.push(json!({ "type": "text", "text": t }));
                    }
                }
                Role::User => {
                    out.push(json!({
                        "role": "user",
                        "content": self.user_content(&m.content).await?,
                    }));
                }
                Role::Assistant => {
                    if let Some(msg) = assistant_wire_message(m) {
                        out.push(msg);
                    }
                }
                Role::Tool => unreachable!(),
            }
        }
        if !pending_results.is_empty() {
            out.push(json!({ "role": "user", "content": pending_results }));
        }

        apply_cache_markers(&mut system_blocks, &mut out);
        Ok((system_blocks, out))
    }

    /// Serialize user content, resolving image sources.
    async fn user_content(&self, content: &MessageContent) -> anyhow::Result<Value> {
        match content {
            MessageContent::Text(t) => Ok(json!(t)),
            MessageContent::Parts(parts) if parts.is_empty() => Ok(json!("")),
            MessageContent::Parts(parts) => {
                let mut blocks = Vec::with_capacity(parts.len());
                for p in parts {
                    blocks.push(match p {
                        ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                        ContentPart::Image { image_url } => self.image_block(image_url).await?,
                        ContentPart::File { path } => self.file_block(path).await?,
                    });
                }
                Ok(Value::Array(blocks))
            }
            MessageContent::ToolResult { .. } => Ok(json!("")),
        }
    }

    /// Map an image source to its wire block: data URL → inline base64,
    /// HTTP(S) URL → URL source, local path → Files-API reference (when
    /// enabled) or inline base64 read from disk.
    async fn image_block(&self, source: &str) -> anyhow::Result<Value> {
        if let Ok((mime, data)) = crate::types::parse_data_url_parts(source) {
            return Ok(json!({
                "type": "image",
                "source": { "type": "base64", "media_type": mime, "data": data }
            }));
        }
        if source.starts_with("http://") || source.starts_with("https://") {
            return Ok(json!({
                "type": "image",
                "source": { "type": "url", "url": source }
            }));
        }
        // Local file path.
        if self.use_files_api {
            if let Some(key) = self.api_key.as_deref() {
                let file_id =
                    files::reference_or_upload(&self.client, &self.base_url, key, source).await?;
                return Ok(json!({
                    "type": "image",
                    "source": { "type": "file", "file_id": file_id }
                }));
            }
        }
        let bytes = tokio::fs::read(source)
            .await
            .with_context(|| format!("reading image {source}"))?;
        Ok(json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": crate::types::mime_from_path(source),
                "data": base64::engine::general_purpose::STANDARD.encode(bytes),
            }
        }))
    }

    async fn file_block(&self, path: &str) -> anyhow::Result<Value> {
        if self.use_files_api {
            if let Some(key) = self.api_key.as_deref() {
                let file_id =
                    files::reference_or_upload(&self.client, &self.base_url, key, path).await?;
                return Ok(json!({
                    "type": "document",
                    "source": { "type": "file", "file_id": file_id }
                }));
            }
        }
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading file {path}"))?;
        Ok(json!({
            "type": "document",
            "source": {
                "type": "base64",
                "media_type": "application/pdf",
                "data": base64::engine::general_purpose::STANDARD.encode(bytes),
            }
        }))
    }

    fn beta_headers(&self) -> Option<String> {
        let mut betas: Vec<&str> = Vec::new();
        if self.interleaved_thinking && self.thinking_budget >= MIN_THINKING_BUDGET {
            betas.push("interleaved-thinking-2025-05-14");
        }
        if self.use_files_api {
            betas.push("files-api-2025-04-14");
        }
        if betas.is_empty() {
            None
        } else {
            Some(betas.join(","))
        }
    }

    async fn send_stream(&self, key: &str, body: &Value) -> anyhow::Result<reqwest::Response> {
        let mut rb = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01");
        if let Some(betas) = self.beta_headers() {
            rb = rb.header("anthropic-beta", betas);
        }
        rb.json(body).send().await.map_err(|e| {
            anyhow::Error::from(ProviderError::Transient(format!("request failed: {e}")))
        })
    }
}

#[async_trait]
impl crate::ModelProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let key = self
            .api_key
            .clone()
            .context("ANTHROPIC_API_KEY not set")?;
        let (max_tokens, _) = self.resolve_limits()?;
        let body = self.build_body(&req, max_tokens).await?;

        debug!(model = %self.model, max_tokens, "sending anthropic request");
        let resp = self.send_stream(&key, &body).await?;

        let resp = if resp.status().is_success() {
            resp
        } else {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            if !is_context_overflow(&text) {
                bail!(ProviderError::Transient(format!(
                    "anthropic error {status}: {text}"
                )));
            }
            // Context overflow: measure the payload with count_tokens, clamp
            // the output budget into the remaining window, and retry exactly
            // once — and only when the clamp actually shrinks the request.
            let used = self
                .count_tokens(&req)
                .await?
                .context("count_tokens unavailable during overflow recovery")?;
            let limit = self.context_window().unwrap_or(200_000);
            let clamped = clamped_max_tokens(limit, used, max_tokens);
            if clamped >= max_tokens {
                bail!(ProviderError::ContextOverflow(format!(
                    "context overflow and no room to clamp (used {used} of {limit}): {text}"
                )));
            }
            warn!(used, limit, max_tokens, clamped, "context overflow; retrying with clamped max_tokens");
            let body = self.build_body(&req, clamped).await?;
            let retry = self.send_stream(&key, &body).await?;
            if !retry.status().is_success() {
                let status = retry.status();
                let text = retry.text().await.unwrap_or_default();
                bail!(ProviderError::Transient(format!(
                    "anthropic error after overflow retry {status}: {text}"
                )));
            }
            retry
        };

        // SSE lines can be split across TCP chunks, so the parser carries a
        // remainder buffer forward and only complete lines are decoded.
        let byte_stream = resp.bytes_stream();
        let event_stream = byte_stream
            .scan(SseParser::new(), |parser, chunk| {
                let events = match chunk {
                    Ok(b) => parser.push_chunk(&b),
                    Err(e) => vec![Err(anyhow::Error::from(ProviderError::Transient(
                        e.to_string(),
                    )))],
                };
                futures::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }

    async fn count_tokens(&self, req: &CompletionRequest) -> anyhow::Result<Option<u64>> {
        let key = self
            .api_key
            .clone()
            .context("ANTHROPIC_API_KEY not set")?;
        let (system_blocks, messages) = self.build_wire_messages(&req.messages).await?;
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": normalize_schema(Some(t.parameters.clone())),
                })
            })
            .collect();
        let mut body = json!({ "model": self.model, "messages": messages });
        if !system_blocks.is_empty() {
            body["system"] = Value::Array(system_blocks);
        }
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }

        let resp = self
            .client
            .post(format!("{}/v1/messages/count_tokens", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("count_tokens failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!(ProviderError::Transient(format!(
                "count_tokens error {status}: {text}"
            )));
        }
        let v: Value = resp.json().await.context("decoding count_tokens response")?;
        Ok(v["input_tokens"].as_u64())
    }
}

/// Output budget for the single overflow retry: whatever fits between the
/// measured payload and the context limit, minus headroom, floored at 1 and
/// never above the configured cap.
fn clamped_max_tokens(limit: u64, used: u64, configured: u32) -> u32 {
    limit
        .saturating_sub(used)
        .saturating_sub(OVERFLOW_HEADROOM)
        .clamp(1, configured as u64) as u32
}

/// True when the provider error body reports a context-window overflow.
fn is_context_overflow(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("prompt is too long")
        || lower.contains("context_length_exceeded")
        || lower.contains("context length exceeded")
}

/// Enforce the tool-call/result pairing invariant before anything is sent.
///
/// After an assistant message carrying tool_calls, the tool-role messages
/// that follow (before the next non-tool message) must answer exactly that
/// id set — none missing, none extra, no duplicates.
fn validate_tool_sequence(messages: &[Message]) -> anyhow::Result<()> {
    let mut i = 0;
    while i < messages.len() {
        let m = &messages[i];
        if m.role == Role::Assistant && !m.tool_calls.is_empty() {
            let expected: HashSet<&str> =
                m.tool_calls.iter().map(|tc| tc.id.as_str()).collect();
            let mut seen: HashSet<&str> = HashSet::new();
            let mut j = i + 1;
            while j < messages.len() && messages[j].role == Role::Tool {
                let id = messages[j].tool_call_id().unwrap_or("");
                if !expected.contains(id) {
                    bail!(ProviderError::BadToolSequence(format!(
                        "unexpected tool result for id {id:?}"
                    )));
                }
                if !seen.insert(id) {
                    bail!(ProviderError::BadToolSequence(format!(
                        "duplicate tool result for id {id:?}"
                    )));
                }
                j += 1;
            }
            if seen.len() != expected.len() {
                let missing: Vec<&str> =
                    expected.difference(&seen).copied().collect();
                bail!(ProviderError::BadToolSequence(format!(
                    "missing tool results for ids {missing:?}"
                )));
            }
            i = j;
            continue;
        }
        if m.role == Role::Tool {
            bail!(ProviderError::BadToolSequence(format!(
                "tool result {:?} without a preceding assistant tool call",
                m.tool_call_id().unwrap_or("")
            )));
        }
        i += 1;
    }
    Ok(())
}

/// Serialize an assistant message: thinking block (replayed verbatim with
/// its signature), then text, then tool_use blocks.  Returns `None` when the
/// message would serialize to empty content, which the API rejects.
fn assistant_wire_message(m: &Message) -> Option<Value> {
    let mut blocks: Vec<Value> = Vec::new();
    if let (Some(reasoning), Some(sig)) = (&m.reasoning, &m.thinking_signature) {
        blocks.push(json!({
            "type": "thinking",
            "thinking": reasoning,
            "signature": sig,
        }));
    }
    if let Some(t) = m.as_text() {
        if !t.is_empty() {
            blocks.push(json!({ "type": "text", "text": t }));
        }
    }
    for tc in &m.tool_calls {
        blocks.push(json!({
            "type": "tool_use",
            "id": tc.id,
            "name": tc.name,
            "input": serde_json::from_str::<Value>(&tc.arguments).unwrap_or(json!({})),
        }));
    }
    if blocks.is_empty() {
        return None;
    }
    Some(json!({ "role": "assistant", "content": blocks }))
}

/// Attach ephemeral cache markers to the last content block of the last two
/// messages, mirrored on the last two system blocks.  String content is
/// promoted to a block array so the marker has somewhere to live.
fn apply_cache_markers(system_blocks: &mut [Value], messages: &mut [Value]) {
    let cache = json!({ "type": "ephemeral" });

    let n = system_blocks.len();
    for block in system_blocks.iter_mut().skip(n.saturating_sub(2)) {
        block["cache_control"] = cache.clone();
    }

    let n = messages.len();
    for msg in messages.iter_mut().skip(n.saturating_sub(2)) {
        let content = &mut msg["content"];
        if let Value::String(s) = content {
            *content = json!([{ "type": "text", "text": std::mem::take(s) }]);
        }
        if let Some(arr) = content.as_array_mut() {
            if let Some(last) = arr.last_mut() {
                last["cache_control"] = cache.clone();
            }
        }
    }
}

// ─── SSE normalization ────────────────────────────────────────────────────────

struct PendingToolCall {
    id: String,
    name: String,
    args: String,
}

/// Incremental decoder from Anthropic SSE chunks to [`ResponseEvent`]s.
///
/// Carries the partial-line remainder between chunks and the per-index
/// tool-call accumulation state needed to emit a snapshot per fragment and
/// exactly one completed call per content block.
struct SseParser {
    buf: String,
    pending: BTreeMap<u32, PendingToolCall>,
    stop_reason: Option<StopReason>,
}

impl SseParser {
    fn new() -> Self {
        Self {
            buf: String::new(),
            pending: BTreeMap::new(),
            stop_reason: None,
        }
    }

    fn push_chunk(&mut self, chunk: &[u8]) -> Vec<anyhow::Result<ResponseEvent>> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();
        // Process every complete line (i.e. everything before the last '\n').
        while let Some(pos) = self.buf.find('\n') {
            let line = self.buf[..pos].trim_end_matches('\r').to_string();
            self.buf.drain(..=pos);
            if let Some(data) = line.strip_prefix("data: ") {
                let data = data.trim();
                if let Ok(v) = serde_json::from_str::<Value>(data) {
                    self.decode(&v, &mut events);
                }
            }
        }
        events
    }

    fn decode(&mut self, v: &Value, events: &mut Vec<anyhow::Result<ResponseEvent>>) {
        match v["type"].as_str().unwrap_or("") {
            "message_start" => {
                if let Some(usage) = v["message"].get("usage") {
                    events.push(Ok(ResponseEvent::Usage(parse_usage(usage))));
                }
            }
            "content_block_start" => {
                let index = v["index"].as_u64().unwrap_or(0) as u32;
                let block = &v["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    let id = block["id"].as_str().unwrap_or("").to_string();
                    let name = block["name"].as_str().unwrap_or("").to_string();
                    events.push(Ok(ResponseEvent::PartialToolCall {
                        index,
                        id: id.clone(),
                        name: name.clone(),
                        arguments_so_far: String::new(),
                    }));
                    self.pending.insert(index, PendingToolCall { id, name, args: String::new() });
                }
            }
            "content_block_delta" => {
                let index = v["index"].as_u64().unwrap_or(0) as u32;
                let delta = &v["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        let text = delta["text"].as_str().unwrap_or("");
                        if !text.is_empty() {
                            events.push(Ok(ResponseEvent::TextDelta(text.to_string())));
                        }
                    }
                    "thinking_delta" => {
                        let thinking = delta["thinking"].as_str().unwrap_or("");
                        if !thinking.is_empty() {
                            events.push(Ok(ResponseEvent::ReasoningDelta {
                                text: thinking.to_string(),
                                signature: None,
                            }));
                        }
                    }
                    // The signature blob closes every thinking block; it must
                    // be replayed on later requests but never shown as text.
                    "signature_delta" => {
                        if let Some(sig) = delta["signature"].as_str() {
                            events.push(Ok(ResponseEvent::ReasoningDelta {
                                text: String::new(),
                                signature: Some(sig.to_string()),
                            }));
                        }
                    }
                    "input_json_delta" => {
                        let fragment = delta["partial_json"].as_str().unwrap_or("");
                        if let Some(ptc) = self.pending.get_mut(&index) {
                            ptc.args.push_str(fragment);
                            events.push(Ok(ResponseEvent::PartialToolCall {
                                index,
                                id: ptc.id.clone(),
                                name: ptc.name.clone(),
                                arguments_so_far: ptc.args.clone(),
                            }));
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                let index = v["index"].as_u64().unwrap_or(0) as u32;
                if let Some(ptc) = self.pending.remove(&index) {
                    events.push(Ok(ResponseEvent::ToolCall {
                        index,
                        id: ptc.id,
                        name: ptc.name,
                        arguments: if ptc.args.is_empty() { "{}".into() } else { ptc.args },
                    }));
                }
            }
            "message_delta" => {
                if let Some(reason) = v["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(StopReason::parse(reason));
                }
                if let Some(usage) = v.get("usage") {
                    events.push(Ok(ResponseEvent::Usage(parse_usage(usage))));
                }
            }
            "message_stop" => {
                // A block the provider never closed (stream cut short) would
                // otherwise be lost; flush the accumulated calls first.
                for (index, ptc) in std::mem::take(&mut self.pending) {
                    events.push(Ok(ResponseEvent::ToolCall {
                        index,
                        id: ptc.id,
                        name: ptc.name,
                        arguments: if ptc.args.is_empty() { "{}".into() } else { ptc.args },
                    }));
                }
                events.push(Ok(ResponseEvent::Stop {
                    reason: self.stop_reason.take().unwrap_or(StopReason::EndTurn),
                }));
            }
            "error" => {
                let msg = v["error"]["message"].as_str().unwrap_or("unknown stream error");
                events.push(Err(ProviderError::Transient(msg.to_string()).into()));
            }
            _ => {}
        }
    }
}

fn parse_usage(usage: &Value) -> Usage {
    Usage {
        input_tokens: usage["input_tokens"].as_u64().unwrap_or(0),
        output_tokens: usage["output_tokens"].as_u64().unwrap_or(0),
        cache_read_tokens: usage["cache_read_input_tokens"].as_u64().unwrap_or(0),
        cache_write_tokens: usage["cache_creation_input_tokens"].as_u64().unwrap_or(0),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCallRequest;

    fn provider() -> AnthropicProvider {
        let cfg = cagent_config::ModelConfig {
            provider: "anthropic".into(),
            name: "claude-sonnet-4-5".into(),
            ..Default::default()
        };
        AnthropicProvider::new(&cfg, Some("test-key".into()))
    }

    fn provider_with(f: impl FnOnce(&mut cagent_config::ModelConfig)) -> AnthropicProvider {
        let mut cfg = cagent_config::ModelConfig {
            provider: "anthropic".into(),
            name: "claude-sonnet-4-5".into(),
            ..Default::default()
        };
        f(&mut cfg);
        AnthropicProvider::new(&cfg, Some("test-key".into()))
    }

    // ── Thinking limits ───────────────────────────────────────────────────────

    #[test]
    fn thinking_budget_below_minimum_is_ignored() {
        let p = provider_with(|c| c.thinking_budget = 1023);
        let (_, budget) = p.resolve_limits().unwrap();
        assert_eq!(budget, 0);
    }

    #[test]
    fn thinking_budget_equal_to_max_tokens_is_ignored() {
        let p = provider_with(|c| {
            c.thinking_budget = 4096;
            c.max_tokens = Some(4096);
        });
        let (max, budget) = p.resolve_limits().unwrap();
        assert_eq!(budget, 0);
        assert_eq!(max, 4096);
    }

    #[test]
    fn thinking_budget_one_below_max_tokens_is_accepted() {
        let p = provider_with(|c| {
            c.thinking_budget = 4095;
            c.max_tokens = Some(4096);
        });
        let (max, budget) = p.resolve_limits().unwrap();
        assert_eq!(budget, 4095);
        assert_eq!(max, 4096);
    }

    #[test]
    fn thinking_budget_above_max_tokens_is_config_error() {
        let p = provider_with(|c| {
            c.thinking_budget = 8192;
            c.max_tokens = Some(4096);
        });
        let err = p.resolve_limits().unwrap_err();
        assert!(err.downcast_ref::<ProviderError>().is_some_and(|e| matches!(
            e,
            ProviderError::Config(_)
        )));
    }

    #[test]
    fn thinking_budget_without_max_tokens_auto_adjusts() {
        let p = provider_with(|c| c.thinking_budget = 2048);
        let (max, budget) = p.resolve_limits().unwrap();
        assert_eq!(budget, 2048);
        assert_eq!(max, 2048 + THINKING_OUTPUT_HEADROOM);
    }

    // ── Tool sequencing ───────────────────────────────────────────────────────

    fn tc(id: &str) -> ToolCallRequest {
        ToolCallRequest { id: id.into(), name: "t".into(), arguments: "{}".into() }
    }

    #[test]
    fn valid_tool_sequence_passes() {
        let msgs = vec![
            Message::user("go"),
            Message::assistant_with_tool_calls("", vec![tc("a"), tc("b")]),
            Message::tool_result("b", "out-b"),
            Message::tool_result("a", "out-a"),
            Message::assistant("done"),
        ];
        assert!(validate_tool_sequence(&msgs).is_ok());
    }

    #[test]
    fn missing_tool_result_is_rejected() {
        let msgs = vec![
            Message::assistant_with_tool_calls("", vec![tc("a"), tc("b")]),
            Message::tool_result("a", "out"),
            Message::assistant("done"),
        ];
        let err = validate_tool_sequence(&msgs).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProviderError>(),
            Some(ProviderError::BadToolSequence(_))
        ));
    }

    #[test]
    fn extra_tool_result_is_rejected() {
        let msgs = vec![
            Message::assistant_with_tool_calls("", vec![tc("a")]),
            Message::tool_result("a", "out"),
            Message::tool_result("ghost", "out"),
        ];
        assert!(validate_tool_sequence(&msgs).is_err());
    }

    #[test]
    fn duplicate_tool_result_is_rejected() {
        let msgs = vec![
            Message::assistant_with_tool_calls("", vec![tc("a")]),
            Message::tool_result("a", "out"),
            Message::tool_result("a", "again"),
        ];
        assert!(validate_tool_sequence(&msgs).is_err());
    }

    #[test]
    fn orphan_tool_result_is_rejected() {
        let msgs = vec![Message::user("hi"), Message::tool_result("x", "out")];
        assert!(validate_tool_sequence(&msgs).is_err());
    }

    // ── Wire building ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn system_text_lifted_to_system_blocks() {
        let p = provider();
        let (sys, msgs) = p
            .build_wire_messages(&[Message::system("be helpful"), Message::user("hi")])
            .await
            .unwrap();
        assert_eq!(sys[0]["text"], "be helpful");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["role"], "user");
    }

    #[tokio::test]
    async fn consecutive_tool_results_merge_into_one_user_message() {
        let p = provider();
        let (_, msgs) = p
            .build_wire_messages(&[
                Message::user("go"),
                Message::assistant_with_tool_calls("", vec![tc("a"), tc("b")]),
                Message::tool_result("a", "ra"),
                Message::tool_result("b", "rb"),
            ])
            .await
            .unwrap();
        // user, assistant(tool_use), merged user(tool_result × 2)
        assert_eq!(msgs.len(), 3);
        let merged = msgs[2]["content"].as_array().unwrap();
        assert_eq!(merged.len(), 2);
        assert!(merged.iter().all(|b| b["type"] == "tool_result"));
    }

    #[tokio::test]
    async fn tool_result_error_flag_maps_through() {
        let p = provider();
        let (_, msgs) = p
            .build_wire_messages(&[
                Message::assistant_with_tool_calls("", vec![tc("a")]),
                Message::tool_error("a", "boom"),
            ])
            .await
            .unwrap();
        let block = &msgs[1]["content"][0];
        assert_eq!(block["is_error"], true);
    }

    #[tokio::test]
    async fn cache_markers_on_last_two_messages_and_system_blocks() {
        let p = provider();
        let (sys, msgs) = p
            .build_wire_messages(&[
                Message::system("s1"),
                Message::system("s2"),
                Message::system("s3"),
                Message::user("u1"),
                Message::assistant("a1"),
                Message::user("u2"),
            ])
            .await
            .unwrap();
        // Last two of three system blocks are marked.
        assert!(sys[0].get("cache_control").is_none());
        assert!(sys[1].get("cache_control").is_some());
        assert!(sys[2].get("cache_control").is_some());
        // Last two of three conversation messages are marked on their last block.
        assert!(msgs[0]["content"].as_str().is_some(), "untouched message stays a string");
        let a1 = msgs[1]["content"].as_array().unwrap();
        assert!(a1.last().unwrap().get("cache_control").is_some());
        let u2 = msgs[2]["content"].as_array().unwrap();
        assert!(u2.last().unwrap().get("cache_control").is_some());
    }

    #[tokio::test]
    async fn assistant_thinking_replayed_with_signature() {
        let p = provider();
        let mut m = Message::assistant("answer");
        m.reasoning = Some("chain of thought".into());
        m.thinking_signature = Some("sig123".into());
        let (_, msgs) = p.build_wire_messages(&[m]).await.unwrap();
        let blocks = msgs[0]["content"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "thinking");
        assert_eq!(blocks[0]["signature"], "sig123");
        assert_eq!(blocks[1]["type"], "text");
    }

    #[tokio::test]
    async fn data_url_image_becomes_base64_block() {
        let p = provider();
        let m = Message::user_with_parts(vec![
            ContentPart::text("look"),
            ContentPart::image("data:image/png;base64,iVBORw0KGgo="),
        ]);
        let (_, msgs) = p.build_wire_messages(&[m]).await.unwrap();
        let img = &msgs[0]["content"][1];
        assert_eq!(img["source"]["type"], "base64");
        assert_eq!(img["source"]["media_type"], "image/png");
    }

    #[tokio::test]
    async fn https_image_becomes_url_block() {
        let p = provider();
        let m = Message::user_with_parts(vec![ContentPart::image("https://example.com/i.jpg")]);
        let (_, msgs) = p.build_wire_messages(&[m]).await.unwrap();
        let img = &msgs[0]["content"][0];
        assert_eq!(img["source"]["type"], "url");
    }

    #[tokio::test]
    async fn empty_assistant_message_is_skipped() {
        let p = provider();
        let (_, msgs) = p
            .build_wire_messages(&[Message::user("hi"), Message::assistant("")])
            .await
            .unwrap();
        assert_eq!(msgs.len(), 1);
    }

    // ── Overflow detection ────────────────────────────────────────────────────

    #[test]
    fn clamp_uses_remaining_window_minus_headroom() {
        // 200k window, 150k used → 200000 − 150000 − 1024 under a 64k cap.
        assert_eq!(clamped_max_tokens(200_000, 150_000, 64_000), 48_976);
    }

    #[test]
    fn clamp_floors_at_one_when_window_is_full() {
        assert_eq!(clamped_max_tokens(200_000, 199_500, 64_000), 1);
        assert_eq!(clamped_max_tokens(200_000, 250_000, 64_000), 1);
    }

    #[test]
    fn clamp_never_exceeds_configured_cap() {
        assert_eq!(clamped_max_tokens(200_000, 1_000, 4_096), 4_096);
    }

    #[test]
    fn overflow_detector_matches_known_shapes() {
        assert!(is_context_overflow(
            r#"{"error":{"type":"invalid_request_error","message":"prompt is too long: 210000 tokens > 200000 maximum"}}"#
        ));
        assert!(is_context_overflow("Context length exceeded"));
        assert!(!is_context_overflow("rate limited"));
    }

    // ── SSE parser ────────────────────────────────────────────────────────────

    fn feed(parser: &mut SseParser, event: &Value) -> Vec<ResponseEvent> {
        parser
            .push_chunk(format!("data: {event}\n").as_bytes())
            .into_iter()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn text_delta_decodes() {
        let mut p = SseParser::new();
        let evs = feed(
            &mut p,
            &json!({ "type": "content_block_delta", "index": 0,
                     "delta": { "type": "text_delta", "text": "hi" } }),
        );
        assert!(matches!(&evs[0], ResponseEvent::TextDelta(t) if t == "hi"));
    }

    #[test]
    fn tool_call_accumulates_and_completes() {
        let mut p = SseParser::new();
        let start = feed(
            &mut p,
            &json!({ "type": "content_block_start", "index": 1,
                     "content_block": { "type": "tool_use", "id": "toolu_1", "name": "shell" } }),
        );
        assert!(matches!(&start[0], ResponseEvent::PartialToolCall { id, .. } if id == "toolu_1"));

        let frag1 = feed(
            &mut p,
            &json!({ "type": "content_block_delta", "index": 1,
                     "delta": { "type": "input_json_delta", "partial_json": "{\"cmd\":" } }),
        );
        assert!(matches!(
            &frag1[0],
            ResponseEvent::PartialToolCall { arguments_so_far, .. } if arguments_so_far == "{\"cmd\":"
        ));

        feed(
            &mut p,
            &json!({ "type": "content_block_delta", "index": 1,
                     "delta": { "type": "input_json_delta", "partial_json": "\"ls\"}" } }),
        );
        let done = feed(&mut p, &json!({ "type": "content_block_stop", "index": 1 }));
        match &done[0] {
            ResponseEvent::ToolCall { id, name, arguments, .. } => {
                assert_eq!(id, "toolu_1");
                assert_eq!(name, "shell");
                assert_eq!(arguments, "{\"cmd\":\"ls\"}");
            }
            other => panic!("expected completed ToolCall, got {other:?}"),
        }
    }

    #[test]
    fn tool_call_completes_exactly_once() {
        let mut p = SseParser::new();
        feed(
            &mut p,
            &json!({ "type": "content_block_start", "index": 0,
                     "content_block": { "type": "tool_use", "id": "t1", "name": "x" } }),
        );
        let first = feed(&mut p, &json!({ "type": "content_block_stop", "index": 0 }));
        assert_eq!(first.len(), 1);
        let second = feed(&mut p, &json!({ "type": "content_block_stop", "index": 0 }));
        assert!(second.is_empty(), "second stop must not re-emit the call");
    }

    #[test]
    fn empty_tool_arguments_default_to_object() {
        let mut p = SseParser::new();
        feed(
            &mut p,
            &json!({ "type": "content_block_start", "index": 0,
                     "content_block": { "type": "tool_use", "id": "t1", "name": "x" } }),
        );
        let done = feed(&mut p, &json!({ "type": "content_block_stop", "index": 0 }));
        assert!(matches!(&done[0], ResponseEvent::ToolCall { arguments, .. } if arguments == "{}"));
    }

    #[test]
    fn thinking_and_signature_deltas_decode() {
        let mut p = SseParser::new();
        let evs = feed(
            &mut p,
            &json!({ "type": "content_block_delta", "index": 0,
                     "delta": { "type": "thinking_delta", "thinking": "hmm" } }),
        );
        assert!(matches!(&evs[0], ResponseEvent::ReasoningDelta { text, signature }
            if text == "hmm" && signature.is_none()));
        let evs = feed(
            &mut p,
            &json!({ "type": "content_block_delta", "index": 0,
                     "delta": { "type": "signature_delta", "signature": "EqRk" } }),
        );
        assert!(matches!(&evs[0], ResponseEvent::ReasoningDelta { signature: Some(s), .. }
            if s == "EqRk"));
    }

    #[test]
    fn stop_reason_carried_from_message_delta_to_stop() {
        let mut p = SseParser::new();
        feed(
            &mut p,
            &json!({ "type": "message_delta",
                     "delta": { "stop_reason": "tool_use" },
                     "usage": { "output_tokens": 12 } }),
        );
        let evs = feed(&mut p, &json!({ "type": "message_stop" }));
        assert!(matches!(&evs[0], ResponseEvent::Stop { reason: StopReason::ToolUse }));
    }

    #[test]
    fn usage_from_message_start_includes_cache_counts() {
        let mut p = SseParser::new();
        let evs = feed(
            &mut p,
            &json!({ "type": "message_start", "message": { "usage": {
                "input_tokens": 100,
                "cache_read_input_tokens": 80,
                "cache_creation_input_tokens": 20
            } } }),
        );
        assert!(matches!(&evs[0], ResponseEvent::Usage(u)
            if u.input_tokens == 100 && u.cache_read_tokens == 80 && u.cache_write_tokens == 20));
    }

    #[test]
    fn split_sse_lines_reassemble_across_chunks() {
        let mut p = SseParser::new();
        let full = r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"world"}}"#;
        let (a, b) = full.split_at(40);
        assert!(p.push_chunk(a.as_bytes()).is_empty());
        let evs: Vec<_> = p
            .push_chunk(format!("{b}\n").as_bytes())
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert!(matches!(&evs[0], ResponseEvent::TextDelta(t) if t == "world"));
    }

    #[test]
    fn unclosed_tool_block_flushes_at_message_stop() {
        let mut p = SseParser::new();
        feed(
            &mut p,
            &json!({ "type": "content_block_start", "index": 0,
                     "content_block": { "type": "tool_use", "id": "t1", "name": "x" } }),
        );
        let evs = feed(&mut p, &json!({ "type": "message_stop" }));
        assert!(matches!(&evs[0], ResponseEvent::ToolCall { id, .. } if id == "t1"));
        assert!(matches!(&evs[1], ResponseEvent::Stop { .. }));
    }
}
