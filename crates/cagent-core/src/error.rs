// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Run-level error kinds.
//!
//! The split of failure handling: tool failures become tool-result messages
//! with `is_error` and the loop continues; provider configuration and
//! sequencing problems (see `cagent_model::ProviderError`) end the run
//! before or at the network boundary; the kinds below are terminal loop
//! outcomes.

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("iteration budget exhausted after {0} provider calls")]
    MaxIterations(u32),
}
