// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_max_iterations() -> u32 {
    40
}

fn default_shell_timeout() -> u64 {
    30
}

fn default_sandbox_image() -> String {
    "alpine:latest".into()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Named agents.  The agent under the key `"root"` (or the only agent,
    /// when a single one is configured) is the entry point; the others are
    /// reachable through `transfer_task`.
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,
    /// Default model used by agents that do not name one.
    #[serde(default)]
    pub model: ModelConfig,
    /// Named model configurations.  Referenced by `AgentConfig::model` and
    /// by the `switch_model` allow-list.
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
    /// Toolsets available to agents (builtin, stdio MCP, remote MCP).
    #[serde(default)]
    pub toolsets: Vec<ToolsetConfig>,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// System prompt for this agent.
    #[serde(default)]
    pub instruction: String,
    /// One-line description shown to sibling agents when they pick a
    /// delegation target.
    #[serde(default)]
    pub description: String,
    /// Key into `Config::models`; empty means `Config::model`.
    #[serde(default)]
    pub model: String,
    /// Names of toolsets from `Config::toolsets` this agent may use.
    /// Empty means all configured toolsets.
    #[serde(default)]
    pub toolsets: Vec<String>,
    /// Hard cap on provider calls per `run`.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Model keys the agent may switch itself to via `switch_model`.
    /// Empty disables the tool.
    #[serde(default)]
    pub models_allowed: Vec<String>,
    /// Agent names this agent may delegate to via `transfer_task`.
    #[serde(default)]
    pub sub_agents: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            instruction: String::new(),
            description: String::new(),
            model: String::new(),
            toolsets: Vec::new(),
            max_iterations: default_max_iterations(),
            models_allowed: Vec::new(),
            sub_agents: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier.  Currently "anthropic" or "mock".
    pub provider: String,
    /// Model name forwarded to the provider API.
    pub name: String,
    /// Environment variable holding the API key.  When unset the canonical
    /// `<PROVIDER>_API_KEY` variable is consulted.
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files.
    pub api_key: Option<String>,
    /// Base URL override for proxies and compatible gateways.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion.
    pub max_tokens: Option<u32>,
    /// Sampling temperature.  Ignored (with a warning) while extended
    /// thinking is enabled.
    pub temperature: Option<f32>,
    /// Nucleus sampling parameter.  Same thinking caveat as temperature.
    pub top_p: Option<f32>,
    /// Extended-thinking token budget.  0 disables thinking; values below
    /// 1024 are ignored with a warning.
    #[serde(default)]
    pub thinking_budget: u32,
    #[serde(default)]
    pub provider_opts: ProviderOpts,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".into(),
            name: "claude-sonnet-4-5".into(),
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
            thinking_budget: 0,
            provider_opts: ProviderOpts::default(),
        }
    }
}

/// Free-form provider extras plus the options the core understands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderOpts {
    /// Allow thinking blocks to interleave with tool use (beta header).
    #[serde(default)]
    pub interleaved_thinking: bool,
    /// Upload local image files through the provider Files API instead of
    /// inlining base64 (enables the 2-hour file-reference cache).
    #[serde(default)]
    pub use_files_api: bool,
    /// Anything else, forwarded as-is to the driver.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One toolset the agent can draw tools from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolsetConfig {
    /// Builtin in-process toolset by name: "shell", "tasks", "memory",
    /// "user_prompt", "lsp".
    Builtin {
        name: String,
        #[serde(default = "default_shell_timeout")]
        timeout_secs: u64,
        /// Path of the memory file for the "memory" builtin.
        #[serde(default)]
        memory_file: Option<String>,
        /// Language-server command line for the "lsp" builtin.
        #[serde(default)]
        lsp_command: Option<Vec<String>>,
    },
    /// MCP server spawned as a child process speaking framed JSON-RPC on
    /// stdio.
    Stdio {
        name: String,
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Remote MCP server over SSE or streamable HTTP.
    Remote {
        name: String,
        url: String,
        #[serde(default)]
        transport: RemoteTransport,
        /// Outgoing headers; values may contain `${headers.NAME}`
        /// placeholders resolved from the per-session override map.
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl ToolsetConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::Builtin { name, .. } | Self::Stdio { name, .. } | Self::Remote { name, .. } => {
                name
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteTransport {
    Sse,
    #[default]
    StreamableHttp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Route shell execution through the container runner.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sandbox_image")]
    pub image: String,
    /// Volume mounts as `host:container[:ro|rw]`; mode defaults to rw.
    #[serde(default)]
    pub mounts: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: default_sandbox_image(),
            mounts: Vec::new(),
        }
    }
}

impl Config {
    /// Resolve the model configuration for an agent, falling back to the
    /// workspace default when the agent names none or names an unknown key.
    pub fn model_for_agent(&self, agent: &AgentConfig) -> &ModelConfig {
        if agent.model.is_empty() {
            return &self.model;
        }
        self.models.get(&agent.model).unwrap_or(&self.model)
    }

    /// The entry-point agent: the one keyed `"root"`, or the only agent.
    pub fn root_agent(&self) -> Option<(&String, &AgentConfig)> {
        if let Some(a) = self.agents.get_key_value("root") {
            return Some(a);
        }
        if self.agents.len() == 1 {
            return self.agents.iter().next();
        }
        None
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_parses_from_empty_yaml() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.model.provider, "anthropic");
        assert!(!cfg.sandbox.enabled);
    }

    #[test]
    fn toolset_stdio_parses() {
        let yaml = r#"
type: stdio
name: fs
command: mcp-fs
args: ["--root", "."]
"#;
        let ts: ToolsetConfig = serde_yaml::from_str(yaml).unwrap();
        match ts {
            ToolsetConfig::Stdio { name, command, args, .. } => {
                assert_eq!(name, "fs");
                assert_eq!(command, "mcp-fs");
                assert_eq!(args, vec!["--root", "."]);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn toolset_remote_default_transport_is_streamable_http() {
        let yaml = "type: remote\nname: web\nurl: https://mcp.example.com/";
        let ts: ToolsetConfig = serde_yaml::from_str(yaml).unwrap();
        match ts {
            ToolsetConfig::Remote { transport, .. } => {
                assert_eq!(transport, RemoteTransport::StreamableHttp);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn agent_defaults_apply() {
        let a: AgentConfig = serde_yaml::from_str("instruction: hi").unwrap();
        assert_eq!(a.max_iterations, 40);
        assert!(a.models_allowed.is_empty());
    }

    #[test]
    fn root_agent_prefers_root_key() {
        let mut cfg = Config::default();
        cfg.agents.insert("helper".into(), AgentConfig::default());
        cfg.agents.insert("root".into(), AgentConfig::default());
        assert_eq!(cfg.root_agent().unwrap().0, "root");
    }

    #[test]
    fn root_agent_falls_back_to_only_agent() {
        let mut cfg = Config::default();
        cfg.agents.insert("solo".into(), AgentConfig::default());
        assert_eq!(cfg.root_agent().unwrap().0, "solo");
    }

    #[test]
    fn model_for_agent_unknown_key_falls_back() {
        let cfg = Config::default();
        let agent = AgentConfig {
            model: "nope".into(),
            ..AgentConfig::default()
        };
        assert_eq!(cfg.model_for_agent(&agent).provider, "anthropic");
    }

    #[test]
    fn provider_opts_interleaved_thinking_parses() {
        let m: ModelConfig = serde_yaml::from_str(
            "provider: anthropic\nname: claude-sonnet-4-5\nprovider_opts:\n  interleaved_thinking: true",
        )
        .unwrap();
        assert!(m.provider_opts.interleaved_thinking);
    }
}
