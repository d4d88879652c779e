// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Why a run's event stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// The model finished its turn without requesting more tools.
    Finished,
    /// The iteration budget was exhausted.
    MaxIterations,
    /// The run was cancelled cooperatively.
    Cancelled,
    /// A non-recoverable error ended the run.
    Error,
}

/// Events emitted by the agent loop during a single run.
///
/// Every event carries the emitting agent's name so delegated child runs can
/// share the parent's stream.  Consumers may merge consecutive text/
/// reasoning deltas from the same agent and keep only the latest
/// `PartialToolCall` per call id; the terminal events (`ToolCall`,
/// `ToolCallResponse`, `Error`, `StreamStopped`) must never be merged or
/// dropped.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A text chunk streamed from the model.
    AgentChoice { agent: String, delta: String },
    /// A reasoning chunk streamed from the model.
    AgentChoiceReasoning { agent: String, delta: String },
    /// Accumulated snapshot of an in-flight tool call.
    PartialToolCall {
        agent: String,
        id: String,
        name: String,
        arguments: String,
    },
    /// The model committed to a tool call.
    ToolCall {
        agent: String,
        id: String,
        name: String,
        arguments: String,
    },
    /// A tool call finished.
    ToolCallResponse {
        agent: String,
        id: String,
        output: String,
        is_error: bool,
    },
    /// A non-recoverable error; a `StreamStopped` follows.
    Error { agent: String, message: String },
    /// Terminal event of a run.
    StreamStopped { agent: String, reason: StopCause },
}

impl AgentEvent {
    pub fn agent(&self) -> &str {
        match self {
            Self::AgentChoice { agent, .. }
            | Self::AgentChoiceReasoning { agent, .. }
            | Self::PartialToolCall { agent, .. }
            | Self::ToolCall { agent, .. }
            | Self::ToolCallResponse { agent, .. }
            | Self::Error { agent, .. }
            | Self::StreamStopped { agent, .. } => agent,
        }
    }
}
