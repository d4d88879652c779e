// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod catalog;
pub mod files;
pub mod sanitize;
mod anthropic;
mod mock;
mod provider;
mod types;

pub use anthropic::AnthropicProvider;
pub use mock::{text_turn, tool_turn, MockProvider, Script, ScriptedMockProvider};
pub use provider::{ModelProvider, ProviderError, ResponseStream};
pub use types::*;

use anyhow::bail;
use cagent_config::ModelConfig;

/// Construct a boxed [`ModelProvider`] from configuration.
///
/// Selects the driver implementation based on `cfg.provider`.  The API key
/// is read from `cfg.api_key`, then `cfg.api_key_env`, then the canonical
/// `<PROVIDER>_API_KEY` environment variable.
pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Box<dyn ModelProvider>> {
    match cfg.provider.as_str() {
        "anthropic" => Ok(Box::new(AnthropicProvider::new(cfg, resolve_api_key(cfg)))),
        "mock" => Ok(Box::new(MockProvider)),
        other => bail!("unknown model provider: {other:?} (known: anthropic, mock)"),
    }
}

fn resolve_api_key(cfg: &ModelConfig) -> Option<String> {
    if let Some(k) = &cfg.api_key {
        return Some(k.clone());
    }
    if let Some(env) = &cfg.api_key_env {
        return std::env::var(env).ok();
    }
    let canonical = format!("{}_API_KEY", cfg.provider.to_uppercase());
    std::env::var(canonical).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config(provider: &str, model: &str) -> ModelConfig {
        ModelConfig {
            provider: provider.into(),
            name: model.into(),
            ..ModelConfig::default()
        }
    }

    #[test]
    fn from_config_anthropic_succeeds() {
        let cfg = minimal_config("anthropic", "claude-sonnet-4-5");
        assert!(from_config(&cfg).is_ok());
    }

    #[test]
    fn from_config_mock_succeeds() {
        let cfg = minimal_config("mock", "mock-model");
        assert!(from_config(&cfg).is_ok());
    }

    #[test]
    fn from_config_unknown_provider_returns_error() {
        let cfg = minimal_config("totally_unknown_provider_xyz", "some-model");
        let result = from_config(&cfg);
        assert!(result.is_err());
        let msg = result.err().unwrap().to_string();
        assert!(msg.contains("unknown model provider"));
    }

    #[test]
    fn resolve_api_key_prefers_explicit_key() {
        let cfg = ModelConfig {
            api_key: Some("explicit-key".into()),
            api_key_env: Some("NONEXISTENT_ENV_VAR_XYZ".into()),
            ..ModelConfig::default()
        };
        let key = resolve_api_key(&cfg);
        assert_eq!(key.as_deref(), Some("explicit-key"));
    }
}
