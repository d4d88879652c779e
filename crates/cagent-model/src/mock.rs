// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{
    provider::ResponseStream, CompletionRequest, ResponseEvent, Role, StopReason,
};

/// Deterministic mock provider for tests.  Echoes the last user message
/// back as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl crate::ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();

        let events: Vec<anyhow::Result<ResponseEvent>> = vec![
            Ok(ResponseEvent::TextDelta(format!("MOCK: {reply}"))),
            Ok(ResponseEvent::Usage(crate::Usage {
                input_tokens: 10,
                output_tokens: 10,
                ..Default::default()
            })),
            Ok(ResponseEvent::Stop { reason: StopReason::EndTurn }),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// One scripted `complete()` call: either a sequence of events or an error.
pub enum Script {
    Events(Vec<ResponseEvent>),
    Error(anyhow::Error),
}

/// A pre-scripted mock provider.  Each call to `complete` pops the next
/// script from the front of the queue.  This lets tests specify exact event
/// sequences — including tool calls and provider failures — without network
/// access.
pub struct ScriptedMockProvider {
    scripts: Arc<Mutex<Vec<Script>>>,
    /// Token count returned by `count_tokens`, for overflow-retry tests.
    pub token_count: Arc<Mutex<Option<u64>>>,
    /// Every `CompletionRequest` seen by this provider, in call order.
    pub requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedMockProvider {
    /// Build a provider from a list of response scripts.  The outer `Vec` is
    /// the ordered list of calls; each inner `Vec` is the event sequence for
    /// that call.
    pub fn new(scripts: Vec<Vec<ResponseEvent>>) -> Self {
        Self::from_scripts(scripts.into_iter().map(Script::Events).collect())
    }

    pub fn from_scripts(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            token_count: Arc::new(Mutex::new(None)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![text_turn(reply)])
    }

    /// Convenience: provider that returns a tool call, then a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            tool_turn(tool_id, tool_name, args_json),
            text_turn(final_text),
        ])
    }

    /// Number of `complete()` calls made so far.
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

/// Event script for a plain text turn ending in `end_turn`.
pub fn text_turn(text: impl Into<String>) -> Vec<ResponseEvent> {
    vec![
        ResponseEvent::TextDelta(text.into()),
        ResponseEvent::Usage(crate::Usage {
            input_tokens: 5,
            output_tokens: 5,
            ..Default::default()
        }),
        ResponseEvent::Stop { reason: StopReason::EndTurn },
    ]
}

/// Event script for a turn requesting one tool call.
pub fn tool_turn(
    id: impl Into<String>,
    name: impl Into<String>,
    args_json: impl Into<String>,
) -> Vec<ResponseEvent> {
    let (id, name, args) = (id.into(), name.into(), args_json.into());
    vec![
        ResponseEvent::PartialToolCall {
            index: 0,
            id: id.clone(),
            name: name.clone(),
            arguments_so_far: args.clone(),
        },
        ResponseEvent::ToolCall { index: 0, id, name, arguments: args },
        ResponseEvent::Usage(crate::Usage {
            input_tokens: 5,
            output_tokens: 5,
            ..Default::default()
        }),
        ResponseEvent::Stop { reason: StopReason::ToolUse },
    ]
}

#[async_trait]
impl crate::ModelProvider for ScriptedMockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        self.requests.lock().unwrap().push(req);
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                Script::Events(text_turn("[no more scripts]"))
            } else {
                scripts.remove(0)
            }
        };
        match script {
            Script::Error(e) => Err(e),
            Script::Events(events) => {
                let wrapped: Vec<anyhow::Result<ResponseEvent>> =
                    events.into_iter().map(Ok).collect();
                Ok(Box::pin(stream::iter(wrapped)))
            }
        }
    }

    async fn count_tokens(&self, _req: &CompletionRequest) -> anyhow::Result<Option<u64>> {
        Ok(*self.token_count.lock().unwrap())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::{Message, ModelProvider};

    fn empty_req() -> CompletionRequest {
        CompletionRequest {
            messages: vec![Message::user("hi")],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn mock_echoes_last_user_message() {
        let p = MockProvider;
        let mut stream = p.complete(empty_req()).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        match first {
            ResponseEvent::TextDelta(t) => assert!(t.contains("MOCK: hi")),
            other => panic!("unexpected first event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn scripted_tool_then_text_two_rounds() {
        let p = ScriptedMockProvider::tool_then_text("call-1", "shell", r#"{"cmd":"ls"}"#, "done");

        let mut events = Vec::new();
        let mut stream = p.complete(empty_req()).await.unwrap();
        while let Some(ev) = stream.next().await {
            events.push(ev.unwrap());
        }
        assert!(events
            .iter()
            .any(|e| matches!(e, ResponseEvent::ToolCall { name, .. } if name == "shell")));
        assert!(events
            .iter()
            .any(|e| matches!(e, ResponseEvent::Stop { reason: StopReason::ToolUse })));

        let mut events2 = Vec::new();
        let mut stream2 = p.complete(empty_req()).await.unwrap();
        while let Some(ev) = stream2.next().await {
            events2.push(ev.unwrap());
        }
        assert!(events2
            .iter()
            .any(|e| matches!(e, ResponseEvent::TextDelta(t) if t == "done")));
        assert_eq!(p.calls(), 2);
    }

    #[tokio::test]
    async fn scripted_error_script_fails_the_call() {
        let p = ScriptedMockProvider::from_scripts(vec![Script::Error(anyhow::anyhow!("boom"))]);
        assert!(p.complete(empty_req()).await.is_err());
    }

    #[tokio::test]
    async fn scripted_fallback_when_scripts_exhausted() {
        let p = ScriptedMockProvider::new(vec![]);
        let mut stream = p.complete(empty_req()).await.unwrap();
        let ev = stream.next().await.unwrap().unwrap();
        assert!(matches!(ev, ResponseEvent::TextDelta(t) if t.contains("no more scripts")));
    }

    #[tokio::test]
    async fn count_tokens_returns_configured_value() {
        let p = ScriptedMockProvider::new(vec![]);
        *p.token_count.lock().unwrap() = Some(198_000);
        assert_eq!(p.count_tokens(&empty_req()).await.unwrap(), Some(198_000));
    }
}
