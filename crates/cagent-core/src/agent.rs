// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use cagent_model::{
    CompletionRequest, Message, ModelProvider, ResponseEvent, StopReason, ToolCallRequest,
    ToolSchema, Usage,
};
use cagent_tools::{ToolCall, ToolRegistry};

use crate::events::{AgentEvent, StopCause};
use crate::session::Session;

/// Fixed system prompt for the summarization turn.
const SUMMARIZE_PROMPT: &str = "Compress the conversation so far into a summary that lets \
     work continue seamlessly. Keep: the user's goals, decisions made, file paths and \
     code identifiers touched, tool results that still matter, and open questions. \
     Drop pleasantries and dead ends. Reply with the summary only.";

/// Models available to an agent, keyed by config model name.  The empty key
/// holds the default model.
pub type ProviderMap = HashMap<String, Arc<dyn ModelProvider>>;

/// The core agent.  Owns a session and drives the model ↔ tool loop.
pub struct Agent {
    name: String,
    session: Session,
    tools: Arc<ToolRegistry>,
    providers: Arc<ProviderMap>,
    /// Shared model selector — the same `Arc` given to any `switch_model`
    /// tool, so a switch applies from the next provider call.
    current_model: Arc<Mutex<String>>,
    max_iterations: u32,
}

/// Everything one provider turn produced.
struct TurnOutput {
    text: String,
    reasoning: Option<String>,
    thinking_signature: Option<String>,
    tool_calls: Vec<ToolCallRequest>,
    usage: Usage,
    stop_reason: StopReason,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        session: Session,
        tools: Arc<ToolRegistry>,
        providers: Arc<ProviderMap>,
        current_model: Arc<Mutex<String>>,
    ) -> Self {
        let max_iterations = session.max_iterations;
        Self {
            name: name.into(),
            session,
            tools,
            providers,
            current_model,
            max_iterations,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// The model selector handle; give the same `Arc` to `switch_model`.
    pub fn model_handle(&self) -> Arc<Mutex<String>> {
        Arc::clone(&self.current_model)
    }

    async fn provider(&self) -> anyhow::Result<Arc<dyn ModelProvider>> {
        let key = self.current_model.lock().await.clone();
        self.providers
            .get(&key)
            .or_else(|| self.providers.get(""))
            .cloned()
            .with_context(|| format!("no provider for model {key:?}"))
    }

    /// Append an optional user message, then drive the loop until the model
    /// stops requesting tools, the iteration budget runs out, or `cancel`
    /// fires.  Returns the final assistant text.
    pub async fn run(
        &mut self,
        user_message: Option<&str>,
        tx: mpsc::Sender<AgentEvent>,
        cancel: &mut tokio::sync::oneshot::Receiver<()>,
    ) -> anyhow::Result<String> {
        if let Some(text) = user_message {
            self.session.append(Message::user(text));
        }

        let mut iterations = 0u32;
        loop {
            // Both an explicit cancel and a dropped sender abort the run.
            match cancel.try_recv() {
                Err(tokio::sync::oneshot::error::TryRecvError::Empty) => {}
                _ => {
                    let _ = tx
                        .send(AgentEvent::StreamStopped {
                            agent: self.name.clone(),
                            reason: StopCause::Cancelled,
                        })
                        .await;
                    return Ok(String::new());
                }
            }

            if iterations >= self.max_iterations {
                let _ = tx
                    .send(AgentEvent::StreamStopped {
                        agent: self.name.clone(),
                        reason: StopCause::MaxIterations,
                    })
                    .await;
                return Ok(String::new());
            }
            iterations += 1;

            // Snapshot the tool set each iteration; change notifications
            // between iterations refresh it.
            let schemas = self.tools.schemas().await;
            let provider = self.provider().await?;

            let turn = tokio::select! {
                biased;
                _ = &mut *cancel => None,
                result = self.stream_one_turn(provider, &schemas, &tx) => Some(result),
            };
            let turn = match turn {
                None => {
                    let _ = tx
                        .send(AgentEvent::StreamStopped {
                            agent: self.name.clone(),
                            reason: StopCause::Cancelled,
                        })
                        .await;
                    return Ok(String::new());
                }
                Some(Err(e)) => {
                    let _ = tx
                        .send(AgentEvent::Error {
                            agent: self.name.clone(),
                            message: format!("{e:#}"),
                        })
                        .await;
                    let _ = tx
                        .send(AgentEvent::StreamStopped {
                            agent: self.name.clone(),
                            reason: StopCause::Error,
                        })
                        .await;
                    return Err(e);
                }
                Some(Ok(t)) => t,
            };

            // Commit the turn: assistant message (text + reasoning + tool
            // calls) and the adapter's usage deltas.
            self.session.commit_usage(&turn.usage);
            if !turn.text.is_empty() || !turn.tool_calls.is_empty() {
                let mut msg =
                    Message::assistant_with_tool_calls(&turn.text, turn.tool_calls.clone());
                msg.reasoning = turn.reasoning.clone();
                msg.thinking_signature = turn.thinking_signature.clone();
                self.session.append(msg);
            }

            if turn.stop_reason.is_tool_use() && !turn.tool_calls.is_empty() {
                self.execute_tool_batch(&turn.tool_calls, &tx).await;
                continue;
            }

            let _ = tx
                .send(AgentEvent::StreamStopped {
                    agent: self.name.clone(),
                    reason: StopCause::Finished,
                })
                .await;
            return Ok(turn.text);
        }
    }

    /// Call the model once, forwarding normalized events, and collect the
    /// completed turn.
    async fn stream_one_turn(
        &self,
        provider: Arc<dyn ModelProvider>,
        schemas: &[cagent_tools::ToolSchema],
        tx: &mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<TurnOutput> {
        let req = CompletionRequest {
            messages: self.session.messages().to_vec(),
            tools: schemas
                .iter()
                .map(|s| ToolSchema {
                    name: s.name.clone(),
                    description: s.description.clone(),
                    parameters: s.parameters.clone(),
                })
                .collect(),
        };

        let mut stream = provider
            .complete(req)
            .await
            .context("model completion failed")?;

        let mut out = TurnOutput {
            text: String::new(),
            reasoning: None,
            thinking_signature: None,
            tool_calls: Vec::new(),
            usage: Usage::default(),
            stop_reason: StopReason::EndTurn,
        };

        while let Some(event) = stream.next().await {
            match event? {
                ResponseEvent::TextDelta(delta) if !delta.is_empty() => {
                    out.text.push_str(&delta);
                    let _ = tx
                        .send(AgentEvent::AgentChoice {
                            agent: self.name.clone(),
                            delta,
                        })
                        .await;
                }
                ResponseEvent::TextDelta(_) => {}
                ResponseEvent::ReasoningDelta { text, signature } => {
                    if let Some(sig) = signature {
                        out.thinking_signature = Some(sig);
                    }
                    if !text.is_empty() {
                        out.reasoning.get_or_insert_with(String::new).push_str(&text);
                        let _ = tx
                            .send(AgentEvent::AgentChoiceReasoning {
                                agent: self.name.clone(),
                                delta: text,
                            })
                            .await;
                    }
                }
                ResponseEvent::PartialToolCall { id, name, arguments_so_far, .. } => {
                    let _ = tx
                        .send(AgentEvent::PartialToolCall {
                            agent: self.name.clone(),
                            id,
                            name,
                            arguments: arguments_so_far,
                        })
                        .await;
                }
                ResponseEvent::ToolCall { id, name, arguments, .. } => {
                    if name.is_empty() {
                        warn!(tool_call_id = %id, "dropping tool call with empty name");
                        continue;
                    }
                    out.tool_calls.push(ToolCallRequest { id, name, arguments });
                }
                ResponseEvent::Usage(u) => out.usage.absorb(&u),
                ResponseEvent::Stop { reason } => {
                    out.stop_reason = reason;
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Execute one batch of tool calls in the order the model produced them.
    /// Concurrency is allowed only when every call's tool is read-only;
    /// results are appended in model order either way, keeping the
    /// call/result pairing intact for the next provider call.
    async fn execute_tool_batch(
        &mut self,
        tool_calls: &[ToolCallRequest],
        tx: &mpsc::Sender<AgentEvent>,
    ) {
        for tc in tool_calls {
            let _ = tx
                .send(AgentEvent::ToolCall {
                    agent: self.name.clone(),
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    arguments: tc.arguments.clone(),
                })
                .await;
        }

        let mut all_read_only = true;
        for tc in tool_calls {
            match self.tools.get(&tc.name).await {
                Some(tool) if tool.annotations().read_only => {}
                _ => {
                    all_read_only = false;
                    break;
                }
            }
        }

        let results = if all_read_only && tool_calls.len() > 1 {
            let futures: Vec<_> = tool_calls
                .iter()
                .map(|tc| self.invoke_one(tc))
                .collect();
            futures::future::join_all(futures).await
        } else {
            let mut results = Vec::with_capacity(tool_calls.len());
            for tc in tool_calls {
                results.push(self.invoke_one(tc).await);
            }
            results
        };

        for (tc, result) in tool_calls.iter().zip(results) {
            let _ = tx
                .send(AgentEvent::ToolCallResponse {
                    agent: self.name.clone(),
                    id: tc.id.clone(),
                    output: result.output.clone(),
                    is_error: result.is_error,
                })
                .await;
            let msg = if result.is_error {
                Message::tool_error(&tc.id, &result.output)
            } else {
                Message::tool_result(&tc.id, &result.output)
            };
            self.session.append(msg);
        }
    }

    /// Invoke a single tool call.  Unparsable arguments fail the call
    /// without reaching the handler; the loop always continues.
    async fn invoke_one(&self, tc: &ToolCallRequest) -> cagent_tools::ToolCallResult {
        let args: serde_json::Value = match serde_json::from_str(&tc.arguments) {
            Ok(v) => v,
            Err(e) => {
                return cagent_tools::ToolCallResult::err(
                    &tc.id,
                    format!("invalid tool arguments: {e}"),
                );
            }
        };
        debug!(tool = %tc.name, id = %tc.id, "invoking tool");
        self.tools
            .execute(&ToolCall {
                id: tc.id.clone(),
                name: tc.name.clone(),
                args,
            })
            .await
    }

    /// Replace the message log with `[system, assistant(summary)]`, where
    /// the summary comes from one tool-free model turn.  A failed or empty
    /// summary leaves the log untouched.
    pub async fn summarize(&mut self, tx: mpsc::Sender<AgentEvent>) -> anyhow::Result<()> {
        let system = self
            .session
            .messages()
            .iter()
            .find(|m| m.role == cagent_model::Role::System)
            .cloned();

        let mut messages = self.session.messages().to_vec();
        messages.push(Message::user(SUMMARIZE_PROMPT));

        let provider = self.provider().await?;
        let req = CompletionRequest { messages, tools: vec![] };
        let mut stream = provider
            .complete(req)
            .await
            .context("summarization call failed")?;

        let mut summary = String::new();
        let mut usage = Usage::default();
        while let Some(event) = stream.next().await {
            match event? {
                ResponseEvent::TextDelta(delta) => {
                    summary.push_str(&delta);
                    let _ = tx
                        .send(AgentEvent::AgentChoice {
                            agent: self.name.clone(),
                            delta,
                        })
                        .await;
                }
                ResponseEvent::Usage(u) => usage.absorb(&u),
                ResponseEvent::Stop { .. } => break,
                _ => {}
            }
        }
        self.session.commit_usage(&usage);

        if summary.trim().is_empty() {
            warn!("summarization produced no text; keeping full history");
            anyhow::bail!("empty summary");
        }

        let mut replacement = Vec::with_capacity(2);
        if let Some(sys) = system {
            replacement.push(sys);
        }
        replacement.push(Message::assistant(summary));
        self.session.replace(replacement);
        Ok(())
    }
}
