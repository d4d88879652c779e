// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use cagent_model::{Message, Usage};

/// Debounce window for the persistence hook.
const PERSIST_DEBOUNCE: std::time::Duration = std::time::Duration::from_secs(2);

/// Title length cap derived from the first user message.
const TITLE_MAX_CHARS: usize = 50;

/// A full, serializable view of a session, as handed to the persistence
/// hook and the session store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub title: Option<String>,
    pub messages: Vec<Message>,
    pub working_dir: PathBuf,
    pub tools_approved: bool,
    pub max_iterations: u32,
    /// Per-session MCP header overrides in their env-var form
    /// (`CAGENT_TOOLSET_<TOOLSET>_<HEADER>` → value).
    #[serde(default)]
    pub tool_header_overrides: std::collections::HashMap<String, String>,
    pub usage: Usage,
}

/// Receives debounced session snapshots.  Failures are logged, never fatal.
pub trait SessionSink: Send + Sync {
    fn save(&self, snapshot: SessionSnapshot) -> BoxFuture<'static, anyhow::Result<()>>;
}

/// In-memory conversation session: the sole authority over message order.
///
/// Mutation goes through `&mut self`, so appends are serialized by
/// construction; concurrent readers work from [`snapshot`]s.
pub struct Session {
    pub id: String,
    pub title: Option<String>,
    messages: Vec<Message>,
    pub working_dir: PathBuf,
    pub tools_approved: bool,
    pub max_iterations: u32,
    /// Header overrides in env-var form, mirrored into the session's
    /// derived environment by the session manager.
    pub tool_header_overrides: std::collections::HashMap<String, String>,
    usage: Usage,
    sink: Option<Arc<dyn SessionSink>>,
    /// Bumped on every mutation; a scheduled save only fires if it is still
    /// the newest when the debounce window elapses.
    persist_epoch: Arc<AtomicU64>,
}

impl Session {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: None,
            messages: Vec::new(),
            working_dir: working_dir.into(),
            tools_approved: false,
            max_iterations: 40,
            tool_header_overrides: std::collections::HashMap::new(),
            usage: Usage::default(),
            sink: None,
            persist_epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn SessionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn append(&mut self, msg: Message) {
        if self.title.is_none() {
            if let (cagent_model::Role::User, Some(text)) = (msg.role, msg.as_text()) {
                let title = title_from_first_user_message(text);
                if !title.is_empty() {
                    self.title = Some(title);
                }
            }
        }
        self.messages.push(msg);
        self.schedule_persist();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            title: self.title.clone(),
            messages: self.messages.clone(),
            working_dir: self.working_dir.clone(),
            tools_approved: self.tools_approved,
            max_iterations: self.max_iterations,
            tool_header_overrides: self.tool_header_overrides.clone(),
            usage: self.usage,
        }
    }

    /// Replace the whole log (summarization, edit-and-resubmit).
    pub fn replace(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.schedule_persist();
    }

    /// Fold a completed turn's usage into the session aggregate.  Called by
    /// the loop on stream termination; in-flight deltas stay in the adapter.
    pub fn commit_usage(&mut self, turn: &Usage) {
        self.usage.accumulate(turn);
        self.schedule_persist();
    }

    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    /// Schedule the debounced persistence hook.  The newest mutation wins:
    /// older scheduled saves notice the epoch moved on and do nothing.
    fn schedule_persist(&self) {
        let Some(sink) = self.sink.clone() else { return };
        let epoch = self.persist_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let epoch_ref = Arc::clone(&self.persist_epoch);
        let snapshot = self.snapshot();
        tokio::spawn(async move {
            tokio::time::sleep(PERSIST_DEBOUNCE).await;
            if epoch_ref.load(Ordering::SeqCst) != epoch {
                return;
            }
            if let Err(e) = sink.save(snapshot).await {
                warn!(error = %e, "session persistence hook failed");
            }
        });
    }
}

/// Derive a session title: first line of the first user message, cut at 50
/// characters on a char boundary.
pub fn title_from_first_user_message(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or("");
    if first_line.chars().count() <= TITLE_MAX_CHARS {
        return first_line.to_string();
    }
    first_line.chars().take(TITLE_MAX_CHARS).collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use cagent_model::Message;

    #[test]
    fn new_session_has_unique_id() {
        let a = Session::new("/tmp");
        let b = Session::new("/tmp");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn append_preserves_order() {
        let mut s = Session::new("/tmp");
        s.append(Message::user("one"));
        s.append(Message::assistant("two"));
        let texts: Vec<&str> = s.messages().iter().filter_map(|m| m.as_text()).collect();
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[test]
    fn first_user_message_sets_title() {
        let mut s = Session::new("/tmp");
        s.append(Message::user("fix the login bug"));
        assert_eq!(s.title.as_deref(), Some("fix the login bug"));
        s.append(Message::user("second message is not the title"));
        assert_eq!(s.title.as_deref(), Some("fix the login bug"));
    }

    #[test]
    fn title_truncates_at_newline() {
        assert_eq!(
            title_from_first_user_message("short title\nwith more detail below"),
            "short title"
        );
    }

    #[test]
    fn title_truncates_at_50_chars() {
        let long = "x".repeat(80);
        assert_eq!(title_from_first_user_message(&long).chars().count(), 50);
    }

    #[test]
    fn title_truncation_respects_char_boundaries() {
        let long = "é".repeat(80);
        let t = title_from_first_user_message(&long);
        assert_eq!(t.chars().count(), 50);
    }

    #[test]
    fn replace_swaps_the_log() {
        let mut s = Session::new("/tmp");
        s.append(Message::user("a"));
        s.append(Message::assistant("b"));
        s.replace(vec![Message::system("sys"), Message::assistant("summary")]);
        assert_eq!(s.messages().len(), 2);
        assert_eq!(s.messages()[1].as_text(), Some("summary"));
    }

    #[test]
    fn usage_accumulates_monotonically() {
        let mut s = Session::new("/tmp");
        s.commit_usage(&Usage { input_tokens: 100, output_tokens: 10, ..Default::default() });
        s.commit_usage(&Usage { input_tokens: 120, output_tokens: 15, ..Default::default() });
        assert_eq!(s.usage().input_tokens, 220);
        assert_eq!(s.usage().output_tokens, 25);
    }

    struct CountingSink {
        saves: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl SessionSink for CountingSink {
        fn save(&self, _snapshot: SessionSnapshot) -> BoxFuture<'static, anyhow::Result<()>> {
            let saves = Arc::clone(&self.saves);
            Box::pin(async move {
                saves.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_mutations_coalesce_into_one_save() {
        let saves = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut s = Session::new("/tmp").with_sink(Arc::new(CountingSink {
            saves: Arc::clone(&saves),
        }));
        for i in 0..5 {
            s.append(Message::user(format!("m{i}")));
        }
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        // Let the spawned tasks run.
        tokio::task::yield_now().await;
        assert_eq!(saves.load(Ordering::SeqCst), 1, "debounce must coalesce");
    }

    #[tokio::test(start_paused = true)]
    async fn sink_failure_does_not_block_progress() {
        struct FailingSink;
        impl SessionSink for FailingSink {
            fn save(&self, _s: SessionSnapshot) -> BoxFuture<'static, anyhow::Result<()>> {
                Box::pin(async { anyhow::bail!("disk full") })
            }
        }
        let mut s = Session::new("/tmp").with_sink(Arc::new(FailingSink));
        s.append(Message::user("still works"));
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert_eq!(s.messages().len(), 1);
    }
}
