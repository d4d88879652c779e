// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Content part types ───────────────────────────────────────────────────────

/// A single content part in a multi-part message.
///
/// Images carry their source as a string: a data URL
/// (`data:<mime>;base64,<b64>`), an HTTP(S) URL, or a local file path.
/// The provider driver decides how each form is transmitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { image_url: String },
    /// A non-image file attachment referenced by local path.
    File { path: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(image_url: impl Into<String>) -> Self {
        Self::Image { image_url: image_url.into() }
    }
}

// ─── Data URL helpers ─────────────────────────────────────────────────────────

/// Parse a data URL of the form `data:<mime>;base64,<b64>` and return
/// `Ok((mime_type, base64_string))`.  Returns `Err` for non-data-URLs so
/// callers can fall back to treating the string as a URL or a file path.
pub fn parse_data_url_parts(url: &str) -> Result<(String, String), &'static str> {
    let rest = url.strip_prefix("data:").ok_or("not a data URL")?;
    let (meta, b64) = rest.split_once(',').ok_or("malformed data URL")?;
    let mime = meta.strip_suffix(";base64").unwrap_or(meta).to_string();
    Ok((mime, b64.to_string()))
}

/// Guess a mime type from a file extension.  Unknown extensions map to
/// `image/jpeg`, the provider default for untyped image bytes.
pub fn mime_from_path(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or("");
    match ext.to_ascii_lowercase().as_str() {
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "image/jpeg",
    }
}

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One tool invocation requested by the assistant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    /// Opaque identifier assigned by the model; every tool-role reply must
    /// reference it.
    pub id: String,
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

/// The content of a message.
///
/// - `Text` – simple string (most messages)
/// - `Parts` – mixed text + image/file parts for multimodal turns
/// - `ToolResult` – the reply to one tool call (role = Tool only)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
    ToolResult {
        tool_call_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

/// A single message in the conversation history.
///
/// An assistant message may carry `tool_calls`; a tool-role message answers
/// exactly one of them via its `ToolResult` content.  The provider adapter
/// enforces the pairing before anything is sent (§ tool sequencing).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    /// Tool invocations requested in this assistant turn, in model order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// Extended-thinking text produced alongside this assistant turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Opaque integrity signature for the thinking block.  Must be replayed
    /// verbatim on subsequent requests or the provider rejects the history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_signature: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn new(role: Role, content: MessageContent) -> Self {
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            reasoning: None,
            thinking_signature: None,
            created_at: Utc::now(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, MessageContent::Text(text.into()))
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, MessageContent::Text(text.into()))
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, MessageContent::Text(text.into()))
    }

    /// Assistant turn carrying text (possibly empty) plus tool calls.
    pub fn assistant_with_tool_calls(
        text: impl Into<String>,
        tool_calls: Vec<ToolCallRequest>,
    ) -> Self {
        let mut m = Self::assistant(text);
        m.tool_calls = tool_calls;
        m
    }

    pub fn tool_result(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(
            Role::Tool,
            MessageContent::ToolResult {
                tool_call_id: id.into(),
                content: content.into(),
                is_error: false,
            },
        )
    }

    pub fn tool_error(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(
            Role::Tool,
            MessageContent::ToolResult {
                tool_call_id: id.into(),
                content: content.into(),
                is_error: true,
            },
        )
    }

    /// Construct a user message from a list of content parts.
    ///
    /// A single text part collapses to `MessageContent::Text` for cleaner
    /// serialization; an empty list falls back to empty text.
    pub fn user_with_parts(parts: Vec<ContentPart>) -> Self {
        let content = if parts.is_empty() {
            MessageContent::Text(String::new())
        } else if parts.len() == 1 {
            if let ContentPart::Text { text } = &parts[0] {
                MessageContent::Text(text.clone())
            } else {
                MessageContent::Parts(parts)
            }
        } else {
            MessageContent::Parts(parts)
        };
        Self::new(Role::User, content)
    }

    /// Return the plain text of this message, if it has exactly one text part.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            MessageContent::Parts(parts) if parts.len() == 1 => match &parts[0] {
                ContentPart::Text { text } => Some(text),
                _ => None,
            },
            _ => None,
        }
    }

    /// The id answered by this tool-role message, if any.
    pub fn tool_call_id(&self) -> Option<&str> {
        match &self.content {
            MessageContent::ToolResult { tool_call_id, .. } => Some(tool_call_id),
            _ => None,
        }
    }

    /// Approximate token count used for context accounting (4 chars/token,
    /// 765 tokens per image — the typical estimate for a 512×512 region).
    pub fn approx_tokens(&self) -> usize {
        let mut chars = match &self.content {
            MessageContent::Text(t) => t.len(),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.len(),
                    ContentPart::Image { .. } => 765 * 4,
                    ContentPart::File { path } => path.len(),
                })
                .sum(),
            MessageContent::ToolResult { content, .. } => content.len(),
        };
        chars += self
            .tool_calls
            .iter()
            .map(|tc| tc.name.len() + tc.arguments.len())
            .sum::<usize>();
        chars += self.reasoning.as_deref().map_or(0, str::len);
        (chars / 4).max(1)
    }
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
}

/// Why the provider stopped producing output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Natural end of the assistant turn.
    EndTurn,
    /// The model is waiting for tool results.
    ToolUse,
    /// Output-token budget exhausted; trailing content may be truncated.
    MaxTokens,
    /// A configured stop sequence matched.
    StopSequence,
    Other(String),
}

impl StopReason {
    pub fn parse(s: &str) -> Self {
        match s {
            "end_turn" | "stop" => Self::EndTurn,
            "tool_use" => Self::ToolUse,
            "max_tokens" => Self::MaxTokens,
            "stop_sequence" => Self::StopSequence,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, Self::ToolUse)
    }
}

/// A single normalized event from the model stream.
///
/// Tool-call argument fragments are accumulated inside the driver; consumers
/// see a `PartialToolCall` snapshot per fragment and exactly one completed
/// `ToolCall` when the provider closes the content block.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    TextDelta(String),
    /// A chunk of extended-thinking output.  The signature arrives with the
    /// final chunk of a thinking block.
    ReasoningDelta {
        text: String,
        signature: Option<String>,
    },
    /// Accumulated snapshot of an in-flight tool call.
    PartialToolCall {
        index: u32,
        id: String,
        name: String,
        arguments_so_far: String,
    },
    /// A fully accumulated tool call (content block closed).
    ToolCall {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    /// Running token counts for the current turn.
    Usage(Usage),
    /// Terminal event: the stream is complete.
    Stop { reason: StopReason },
}

/// Token usage from one turn (or a running update within it).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Tokens served from the provider's prompt cache (read hit).
    pub cache_read_tokens: u64,
    /// Tokens written into the provider's prompt cache (write/creation).
    pub cache_write_tokens: u64,
}

impl Usage {
    /// Fold another usage report into this one, field-wise.  Counters only
    /// grow; providers report input once and output incrementally.
    pub fn absorb(&mut self, other: &Usage) {
        self.input_tokens = self.input_tokens.max(other.input_tokens);
        self.output_tokens = self.output_tokens.max(other.output_tokens);
        self.cache_read_tokens = self.cache_read_tokens.max(other.cache_read_tokens);
        self.cache_write_tokens = self.cache_write_tokens.max(other.cache_write_tokens);
    }

    /// Add a completed turn's counters into a per-session aggregate.
    pub fn accumulate(&mut self, turn: &Usage) {
        self.input_tokens += turn.input_tokens;
        self.output_tokens += turn.output_tokens;
        self.cache_read_tokens += turn.cache_read_tokens;
        self.cache_write_tokens += turn.cache_write_tokens;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Message construction ──────────────────────────────────────────────────

    #[test]
    fn message_user_sets_role_and_text() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.as_text(), Some("hello"));
    }

    #[test]
    fn message_tool_result_sets_id_and_content() {
        let m = Message::tool_result("id-1", "output");
        assert_eq!(m.role, Role::Tool);
        assert_eq!(m.tool_call_id(), Some("id-1"));
        assert!(m.as_text().is_none(), "tool_result has no text accessor");
    }

    #[test]
    fn tool_error_sets_is_error() {
        let m = Message::tool_error("id-2", "boom");
        match &m.content {
            MessageContent::ToolResult { is_error, .. } => assert!(is_error),
            other => panic!("wrong content variant: {other:?}"),
        }
    }

    #[test]
    fn assistant_with_tool_calls_preserves_order() {
        let m = Message::assistant_with_tool_calls(
            "",
            vec![
                ToolCallRequest { id: "a".into(), name: "x".into(), arguments: "{}".into() },
                ToolCallRequest { id: "b".into(), name: "y".into(), arguments: "{}".into() },
            ],
        );
        let ids: Vec<&str> = m.tool_calls.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn user_with_single_text_part_collapses() {
        let m = Message::user_with_parts(vec![ContentPart::text("only")]);
        assert!(matches!(m.content, MessageContent::Text(_)));
    }

    #[test]
    fn user_with_image_part_stays_parts() {
        let m = Message::user_with_parts(vec![
            ContentPart::text("look"),
            ContentPart::image("https://example.com/x.png"),
        ]);
        assert!(matches!(m.content, MessageContent::Parts(ref p) if p.len() == 2));
    }

    // ── Token approximation ───────────────────────────────────────────────────

    #[test]
    fn approx_tokens_text_divides_by_four() {
        let m = Message::user("12345678");
        assert_eq!(m.approx_tokens(), 2);
    }

    #[test]
    fn approx_tokens_minimum_is_one() {
        let m = Message::user("");
        assert_eq!(m.approx_tokens(), 1);
    }

    #[test]
    fn approx_tokens_counts_tool_calls() {
        let m = Message::assistant_with_tool_calls(
            "",
            vec![ToolCallRequest {
                id: "id".into(),
                name: "aaaa".into(),          // 4 chars
                arguments: "bbbbbbbb".into(), // 8 chars
            }],
        );
        // 12 chars / 4 = 3 tokens
        assert_eq!(m.approx_tokens(), 3);
    }

    // ── Data URLs and mime ────────────────────────────────────────────────────

    #[test]
    fn parse_data_url_extracts_mime_and_payload() {
        let (mime, b64) = parse_data_url_parts("data:image/png;base64,iVBOR").unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(b64, "iVBOR");
    }

    #[test]
    fn parse_data_url_rejects_plain_url() {
        assert!(parse_data_url_parts("https://example.com/a.png").is_err());
    }

    #[test]
    fn mime_from_path_default_is_jpeg() {
        assert_eq!(mime_from_path("/tmp/shot"), "image/jpeg");
        assert_eq!(mime_from_path("/tmp/shot.bin"), "image/jpeg");
        assert_eq!(mime_from_path("/tmp/shot.png"), "image/png");
    }

    // ── Stop reasons ──────────────────────────────────────────────────────────

    #[test]
    fn stop_reason_parse_known_values() {
        assert_eq!(StopReason::parse("end_turn"), StopReason::EndTurn);
        assert_eq!(StopReason::parse("stop"), StopReason::EndTurn);
        assert_eq!(StopReason::parse("tool_use"), StopReason::ToolUse);
        assert_eq!(StopReason::parse("max_tokens"), StopReason::MaxTokens);
    }

    #[test]
    fn stop_reason_parse_unknown_is_other() {
        assert!(matches!(StopReason::parse("weird"), StopReason::Other(s) if s == "weird"));
    }

    // ── Usage arithmetic ──────────────────────────────────────────────────────

    #[test]
    fn usage_absorb_takes_maxima() {
        let mut u = Usage { input_tokens: 10, output_tokens: 1, ..Usage::default() };
        u.absorb(&Usage { input_tokens: 10, output_tokens: 7, ..Usage::default() });
        assert_eq!(u.output_tokens, 7);
        assert_eq!(u.input_tokens, 10);
    }

    #[test]
    fn usage_accumulate_sums_turns() {
        let mut total = Usage::default();
        total.accumulate(&Usage { input_tokens: 100, output_tokens: 20, ..Usage::default() });
        total.accumulate(&Usage { input_tokens: 150, output_tokens: 30, ..Usage::default() });
        assert_eq!(total.input_tokens, 250);
        assert_eq!(total.output_tokens, 50);
    }

    // ── Serialisation round-trip ──────────────────────────────────────────────

    #[test]
    fn message_serialises_and_deserialises() {
        let original = Message::user("test payload");
        let json = serde_json::to_string(&original).unwrap();
        let decoded: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.role, Role::User);
        assert_eq!(decoded.as_text(), Some("test payload"));
    }

    #[test]
    fn tool_calls_omitted_from_json_when_empty() {
        let json = serde_json::to_string(&Message::user("x")).unwrap();
        assert!(!json.contains("tool_calls"));
    }
}
