// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod codec;
pub mod oauth;
pub mod protocol;
pub mod remote;
pub mod toolset;
pub mod transport;

pub use oauth::{set_token_store, InMemoryTokenStore, OAuthMode, TokenStore, Tokens};
pub use protocol::{McpPromptDef, McpToolDef};
pub use toolset::McpToolset;
pub use transport::{McpError, McpTransport, StdioTransport};
