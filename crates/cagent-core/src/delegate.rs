// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Multi-agent delegation: the `transfer_task` tool.
//!
//! The tool runs a nested agent loop on a child session derived from the
//! parent (same working dir, fresh message buffer seeded with the task).
//! Child events flow into the parent's event stream tagged with the child's
//! name; the child's terminal assistant text becomes the tool result.
//! Nesting is bounded by a shared depth counter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use cagent_config::Config;
use cagent_tools::{
    Tool, ToolAnnotations, ToolCall, ToolCallResult, ToolRegistry,
};

use crate::agent::{Agent, ProviderMap};
use crate::events::AgentEvent;
use crate::session::Session;

/// Maximum delegation nesting.
const MAX_DEPTH: usize = 5;

pub struct TransferTaskTool {
    config: Arc<Config>,
    providers: Arc<ProviderMap>,
    /// Shared with the child agents so nested delegation counts too.
    tools: Arc<ToolRegistry>,
    depth: Arc<AtomicUsize>,
    /// Parent event stream; wired by [`set_event_sink`] before each run.
    forward: std::sync::Mutex<Option<mpsc::Sender<AgentEvent>>>,
    description: String,
}

impl TransferTaskTool {
    pub fn new(
        config: Arc<Config>,
        providers: Arc<ProviderMap>,
        tools: Arc<ToolRegistry>,
        depth: Arc<AtomicUsize>,
    ) -> Self {
        let mut lines: Vec<String> = config
            .agents
            .iter()
            .filter(|(name, _)| name.as_str() != "root")
            .map(|(name, a)| format!("- {name}: {}", a.description))
            .collect();
        lines.sort();
        let description = format!(
            "Delegate a task to another agent and get its result back.\n\
             The sub-agent works in the same directory with its own\n\
             conversation, seeded with your task description.\n\
             Available agents:\n{}",
            lines.join("\n")
        );
        Self {
            config,
            providers,
            tools,
            depth,
            forward: std::sync::Mutex::new(None),
            description,
        }
    }

    /// Point child event streams at the current run's consumer.
    pub fn set_event_sink(&self, tx: mpsc::Sender<AgentEvent>) {
        *self.forward.lock().unwrap() = Some(tx);
    }

    /// Drop the stored sender.  Required after a run so consumers waiting
    /// for the event channel to close actually observe the close.
    pub fn clear_event_sink(&self) {
        *self.forward.lock().unwrap() = None;
    }
}

#[async_trait]
impl Tool for TransferTaskTool {
    fn name(&self) -> &str {
        "transfer_task"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "agent": {
                    "type": "string",
                    "description": "Name of the agent to delegate to"
                },
                "task": {
                    "type": "string",
                    "description": "The task for the sub-agent"
                },
                "expected_output": {
                    "type": "string",
                    "description": "What the result should look like (optional)"
                }
            },
            "required": ["agent", "task"],
            "additionalProperties": false
        })
    }

    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations::mutating("Delegate task")
    }

    async fn execute(&self, call: &ToolCall) -> ToolCallResult {
        let agent_name = match call.args.get("agent").and_then(|v| v.as_str()) {
            Some(a) => a.to_string(),
            None => return ToolCallResult::err(&call.id, "missing 'agent'"),
        };
        let task = match call.args.get("task").and_then(|v| v.as_str()) {
            Some(t) => t.to_string(),
            None => return ToolCallResult::err(&call.id, "missing 'task'"),
        };
        let expected = call
            .args
            .get("expected_output")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let Some(agent_cfg) = self.config.agents.get(&agent_name).cloned() else {
            return ToolCallResult::err(&call.id, format!("unknown agent: {agent_name}"));
        };

        let depth = self.depth.load(Ordering::Relaxed);
        if depth >= MAX_DEPTH {
            return ToolCallResult::err(
                &call.id,
                format!("delegation depth exceeded (max {MAX_DEPTH})"),
            );
        }
        self.depth.fetch_add(1, Ordering::Relaxed);
        debug!(agent = %agent_name, depth = depth + 1, "transfer_task: spawning sub-agent");

        let result = self
            .run_child(&agent_name, &agent_cfg, &task, expected.as_deref())
            .await;
        self.depth.fetch_sub(1, Ordering::Relaxed);

        match result {
            Ok(text) if text.is_empty() => {
                ToolCallResult::ok(&call.id, "(sub-agent produced no text output)")
            }
            Ok(text) => ToolCallResult::ok(&call.id, text),
            Err(e) => ToolCallResult::err(&call.id, format!("sub-agent error: {e:#}")),
        }
    }
}

impl TransferTaskTool {
    async fn run_child(
        &self,
        name: &str,
        cfg: &cagent_config::AgentConfig,
        task: &str,
        expected_output: Option<&str>,
    ) -> anyhow::Result<String> {
        let mut session = Session::new(std::env::current_dir().unwrap_or_default());
        session.max_iterations = cfg.max_iterations;
        if !cfg.instruction.is_empty() {
            session.append(cagent_model::Message::system(&cfg.instruction));
        }
        let seed = match expected_output {
            Some(exp) => format!("{task}\n\nExpected output: {exp}"),
            None => task.to_string(),
        };

        let current_model = Arc::new(Mutex::new(cfg.model.clone()));
        let mut child = Agent::new(
            name,
            session,
            Arc::clone(&self.tools),
            Arc::clone(&self.providers),
            current_model,
        );

        // Forward the child's events to the parent's consumer; when no run
        // is active (tests driving the tool directly), sink them.
        let tx = self.forward.lock().unwrap().clone();
        let (tx, _sink_rx) = match tx {
            Some(tx) => (tx, None),
            None => {
                let (tx, rx) = mpsc::channel(64);
                (tx, Some(rx))
            }
        };

        // The sender stays alive for the whole child run so the child never
        // observes a dropped-cancel; parent cancellation reaches the child
        // by dropping this future.
        let (cancel_tx, mut cancel_rx) = tokio::sync::oneshot::channel::<()>();
        let result = child.run(Some(&seed), tx, &mut cancel_rx).await;
        drop(cancel_tx);
        result
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
