// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::{CompletionRequest, ResponseEvent};

pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<ResponseEvent>> + Send>>;

/// Typed provider failures the agent loop dispatches on.  Everything else is
/// carried as plain `anyhow` context.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Invalid model / thinking / max_tokens combination.  Fails the run.
    #[error("invalid model configuration: {0}")]
    Config(String),
    /// The session log violates the tool-call/result pairing invariant.
    /// Detected before anything is sent.
    #[error("bad tool sequence: {0}")]
    BadToolSequence(String),
    /// The provider reported a context-window overflow that the single
    /// clamped retry did not resolve.
    #[error("context window exceeded: {0}")]
    ContextOverflow(String),
    /// Network / 5xx / transient protocol failure.
    #[error("provider transport error: {0}")]
    Transient(String),
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Human-readable provider name for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Send a completion request and return a streaming response.
    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream>;

    /// Count the input tokens the given request would consume, using the
    /// provider's counting endpoint.  Drivers without one return `None`.
    async fn count_tokens(&self, _req: &CompletionRequest) -> anyhow::Result<Option<u64>> {
        Ok(None)
    }

    /// Context window size for this provider/model combination.
    ///
    /// Reads from the static catalog; returns `None` if the model is unknown.
    fn context_window(&self) -> Option<u64> {
        crate::catalog::lookup(self.name(), self.model_name()).map(|e| e.context_window)
    }

    /// Maximum output tokens for this provider/model combination.
    fn max_output_tokens(&self) -> Option<u64> {
        crate::catalog::lookup(self.name(), self.model_name()).map(|e| e.max_output_tokens)
    }
}
