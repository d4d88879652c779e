// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Static model catalog: context windows and output caps for the models the
//! runtime knows about.  Used for context-overflow clamping and usage
//! display; unknown models simply resolve to `None` and the caller falls
//! back to conservative behavior.

#[derive(Debug, Clone)]
pub struct ModelCatalogEntry {
    pub provider: &'static str,
    pub id: &'static str,
    pub context_window: u64,
    pub max_output_tokens: u64,
}

const CATALOG: &[ModelCatalogEntry] = &[
    ModelCatalogEntry {
        provider: "anthropic",
        id: "claude-opus-4-5",
        context_window: 200_000,
        max_output_tokens: 32_000,
    },
    ModelCatalogEntry {
        provider: "anthropic",
        id: "claude-sonnet-4-5",
        context_window: 200_000,
        max_output_tokens: 64_000,
    },
    ModelCatalogEntry {
        provider: "anthropic",
        id: "claude-haiku-4-5",
        context_window: 200_000,
        max_output_tokens: 64_000,
    },
    ModelCatalogEntry {
        provider: "anthropic",
        id: "claude-3-5-sonnet-20241022",
        context_window: 200_000,
        max_output_tokens: 8_192,
    },
    ModelCatalogEntry {
        provider: "mock",
        id: "mock-model",
        context_window: 200_000,
        max_output_tokens: 8_192,
    },
];

pub fn lookup(provider: &str, model: &str) -> Option<&'static ModelCatalogEntry> {
    CATALOG
        .iter()
        .find(|e| e.provider == provider && e.id == model)
}
