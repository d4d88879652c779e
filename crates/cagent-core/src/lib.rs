// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod agent;
mod delegate;
mod error;
mod events;
mod manager;
mod session;

pub use agent::{Agent, ProviderMap};
pub use delegate::TransferTaskTool;
pub use error::AgentError;
pub use events::{AgentEvent, StopCause};
pub use manager::{
    toolset_env_key, InMemorySessionStore, SessionEnv, SessionStore, StoreError,
    TOOLSET_ENV_PREFIX,
};
pub use session::{title_from_first_user_message, Session, SessionSink, SessionSnapshot};
