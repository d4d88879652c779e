// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session manager: the per-session derived runtime environment and the
//! session store contract.
//!
//! Per-session MCP header overrides travel as environment variables of the
//! form `CAGENT_TOOLSET_<TOOLSET>_<HEADER>` (dashes and colons become
//! underscores, letters uppercase).  The base environment is never mutated;
//! augmentation always clones.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::session::SessionSnapshot;

pub const TOOLSET_ENV_PREFIX: &str = "CAGENT_TOOLSET_";

/// Store lookups that miss return this.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("session not found")]
    NotFound,
}

/// The persistence contract the core needs; the backend is opaque.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn add_session(&self, snapshot: SessionSnapshot) -> anyhow::Result<()>;
    async fn get_session(&self, id: &str) -> Result<SessionSnapshot, StoreError>;
    async fn get_sessions(&self) -> Vec<SessionSnapshot>;
    async fn update_session(&self, snapshot: SessionSnapshot) -> Result<(), StoreError>;
    async fn delete_session(&self, id: &str) -> Result<(), StoreError>;
}

/// In-memory store; the default backend and the test double.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: tokio::sync::Mutex<HashMap<String, SessionSnapshot>>,
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn add_session(&self, snapshot: SessionSnapshot) -> anyhow::Result<()> {
        self.sessions
            .lock()
            .await
            .insert(snapshot.id.clone(), snapshot);
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<SessionSnapshot, StoreError> {
        self.sessions
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn get_sessions(&self) -> Vec<SessionSnapshot> {
        self.sessions.lock().await.values().cloned().collect()
    }

    async fn update_session(&self, snapshot: SessionSnapshot) -> Result<(), StoreError> {
        let mut map = self.sessions.lock().await;
        if !map.contains_key(&snapshot.id) {
            return Err(StoreError::NotFound);
        }
        map.insert(snapshot.id.clone(), snapshot);
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> Result<(), StoreError> {
        self.sessions
            .lock()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }
}

/// Canonical env-var name for one toolset header override.
pub fn toolset_env_key(toolset: &str, header: &str) -> String {
    fn norm(s: &str) -> String {
        s.chars()
            .map(|c| match c {
                '-' | ':' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect()
    }
    format!("{TOOLSET_ENV_PREFIX}{}_{}", norm(toolset), norm(header))
}

/// Owns the base environment and produces per-session augmented clones.
#[derive(Debug, Clone, Default)]
pub struct SessionEnv {
    base: HashMap<String, String>,
}

impl SessionEnv {
    pub fn new(base: HashMap<String, String>) -> Self {
        Self { base }
    }

    pub fn from_process_env() -> Self {
        Self { base: std::env::vars().collect() }
    }

    /// A clone of the base with the session's header overrides (already in
    /// `CAGENT_TOOLSET_*` env-var form, see [`toolset_env_key`]) mirrored
    /// in.  The base is untouched.
    pub fn augmented(&self, header_overrides: &HashMap<String, String>) -> HashMap<String, String> {
        let mut env = self.base.clone();
        for (key, value) in header_overrides {
            env.insert(key.clone(), value.clone());
        }
        env
    }

    /// The override map for one toolset, extracted from an environment:
    /// normalized header name → value.
    pub fn overrides_for_toolset(
        env: &HashMap<String, String>,
        toolset: &str,
    ) -> HashMap<String, String> {
        let prefix = format!("{TOOLSET_ENV_PREFIX}{}_", toolset.to_ascii_uppercase());
        env.iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(&prefix)
                    .map(|header| (header.to_string(), v.clone()))
            })
            .collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;

    fn snapshot(id: &str) -> SessionSnapshot {
        let mut s = Session::new("/tmp").snapshot();
        s.id = id.to_string();
        s
    }

    #[tokio::test]
    async fn add_get_round_trips() {
        let store = InMemorySessionStore::default();
        store.add_session(snapshot("s1")).await.unwrap();
        assert_eq!(store.get_session("s1").await.unwrap().id, "s1");
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = InMemorySessionStore::default();
        assert_eq!(store.get_session("ghost").await.unwrap_err(), StoreError::NotFound);
    }

    #[tokio::test]
    async fn update_missing_is_not_found() {
        let store = InMemorySessionStore::default();
        assert_eq!(
            store.update_session(snapshot("ghost")).await.unwrap_err(),
            StoreError::NotFound
        );
    }

    #[tokio::test]
    async fn delete_removes_session() {
        let store = InMemorySessionStore::default();
        store.add_session(snapshot("s1")).await.unwrap();
        store.delete_session("s1").await.unwrap();
        assert_eq!(store.get_session("s1").await.unwrap_err(), StoreError::NotFound);
        assert_eq!(store.delete_session("s1").await.unwrap_err(), StoreError::NotFound);
    }

    #[test]
    fn env_key_normalizes_dashes_colons_and_case() {
        assert_eq!(
            toolset_env_key("github-mcp", "X-Api:Key"),
            "CAGENT_TOOLSET_GITHUB_MCP_X_API_KEY"
        );
    }

    #[test]
    fn augmented_clones_base_without_mutating_it() {
        let env = SessionEnv::new(HashMap::from([("PATH".to_string(), "/bin".to_string())]));
        let mut overrides = HashMap::new();
        overrides.insert(
            toolset_env_key("github", "Authorization"),
            "Bearer t".to_string(),
        );
        let augmented = env.augmented(&overrides);
        assert_eq!(
            augmented.get("CAGENT_TOOLSET_GITHUB_AUTHORIZATION").map(String::as_str),
            Some("Bearer t")
        );
        assert_eq!(augmented.get("PATH").map(String::as_str), Some("/bin"));
        // Base untouched.
        assert!(!env.base.contains_key("CAGENT_TOOLSET_GITHUB_AUTHORIZATION"));
    }

    #[test]
    fn overrides_extracted_per_toolset() {
        let env = HashMap::from([
            ("CAGENT_TOOLSET_GITHUB_AUTHORIZATION".to_string(), "abc".to_string()),
            ("CAGENT_TOOLSET_JIRA_AUTHORIZATION".to_string(), "def".to_string()),
            ("PATH".to_string(), "/bin".to_string()),
        ]);
        let overrides = SessionEnv::overrides_for_toolset(&env, "github");
        assert_eq!(overrides.len(), 1);
        assert_eq!(overrides.get("AUTHORIZATION").map(String::as_str), Some("abc"));
    }
}
