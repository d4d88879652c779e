// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

/// On-disk schema version.
const FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in-progress")]
    InProgress,
    #[serde(rename = "completed")]
    Completed,
}

impl TaskStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in-progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    /// Ids this task waits on.  Authoritative edge direction.
    #[serde(default)]
    pub blocked_by: Vec<String>,
    /// Reverse edges, kept in sync with `blocked_by` under the write lock.
    #[serde(default)]
    pub blocks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TaskFile {
    version: u32,
    tasks: Vec<Task>,
}

/// What an update produced, including the unblock scan results.
#[derive(Debug, Default)]
pub struct UpdateOutcome {
    pub updated: Vec<String>,
    /// Pending tasks whose last blocker just completed.
    pub unblocked: Vec<String>,
    /// True when every task completed and the list was cleared.
    pub cleared: bool,
}

struct State {
    loaded: bool,
    tasks: Vec<Task>,
    next_id: u64,
}

/// A persistent task list.  One handler at a time: every operation takes the
/// single mutex across validation, mutation, and persist, so handlers never
/// observe half-applied graphs.
pub struct TaskStore {
    path: PathBuf,
    state: Mutex<State>,
}

impl TaskStore {
    pub fn at_path(path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(State { loaded: false, tasks: Vec::new(), next_id: 1 }),
        }
    }

    /// Load from disk on first touch.  The flag lives under the same mutex
    /// as the data, so concurrent handlers all observe the one load outcome.
    fn ensure_loaded(&self, state: &mut State) {
        if state.loaded {
            return;
        }
        state.loaded = true;
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(_) => return,
        };
        match serde_json::from_str::<TaskFile>(&text) {
            Ok(file) => {
                state.next_id = file
                    .tasks
                    .iter()
                    .filter_map(|t| t.id.strip_prefix("task_")?.parse::<u64>().ok())
                    .max()
                    .map_or(1, |n| n + 1);
                state.tasks = file.tasks;
            }
            Err(e) => warn!(path = %self.path.display(), error = %e, "corrupt task file ignored"),
        }
    }

    /// Atomic write: temp file in the target directory, then rename.  File
    /// mode 0o600, directory 0o700.
    fn persist(&self, state: &State) -> anyhow::Result<()> {
        let file = TaskFile { version: FILE_VERSION, tasks: state.tasks.clone() };
        let json = serde_json::to_string_pretty(&file)?;

        let dir = self
            .path
            .parent()
            .context("task file has no parent directory")?;
        std::fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700));
        }

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub async fn list(&self) -> Vec<Task> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state);
        state.tasks.clone()
    }

    pub async fn get(&self, id: &str) -> Option<Task> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state);
        state.tasks.iter().find(|t| t.id == id).cloned()
    }

    /// Create one task.  Blockers must exist; the new node cannot introduce a
    /// cycle because nothing points at it yet.
    pub async fn create(
        &self,
        description: &str,
        blocked_by: &[String],
        owner: Option<String>,
    ) -> anyhow::Result<Task> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state);
        let task = Self::create_locked(&mut state, description, blocked_by, owner)?;
        self.persist(&state)?;
        Ok(task)
    }

    /// Create several tasks in one atomic batch; later entries may depend on
    /// earlier ones.
    pub async fn create_many(
        &self,
        specs: &[(String, Vec<String>)],
    ) -> anyhow::Result<Vec<Task>> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state);
        let snapshot = state.tasks.clone();
        let mut created = Vec::with_capacity(specs.len());
        for (description, blocked_by) in specs {
            match Self::create_locked(&mut state, description, blocked_by, None) {
                Ok(t) => created.push(t),
                Err(e) => {
                    state.tasks = snapshot;
                    return Err(e);
                }
            }
        }
        self.persist(&state)?;
        Ok(created)
    }

    fn create_locked(
        state: &mut State,
        description: &str,
        blocked_by: &[String],
        owner: Option<String>,
    ) -> anyhow::Result<Task> {
        if description.trim().is_empty() {
            bail!("task description must not be empty");
        }
        for b in blocked_by {
            if !state.tasks.iter().any(|t| &t.id == b) {
                bail!("unknown blocker task: {b}");
            }
        }
        let id = format!("task_{}", state.next_id);
        state.next_id += 1;
        let task = Task {
            id: id.clone(),
            description: description.to_string(),
            status: TaskStatus::Pending,
            blocked_by: blocked_by.to_vec(),
            blocks: Vec::new(),
            owner,
        };
        state.tasks.push(task.clone());
        Self::rebuild_reverse_edges(state);
        Ok(state.tasks.iter().find(|t| t.id == id).cloned().unwrap_or(task))
    }

    /// Apply status/description/owner updates to a batch of tasks.  A
    /// pending→in-progress transition is refused while any blocker is not
    /// completed.  Completions run the unblock scan; when everything is
    /// completed the list is cleared.
    pub async fn update(
        &self,
        updates: &[TaskUpdate],
    ) -> anyhow::Result<UpdateOutcome> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state);
        let snapshot = state.tasks.clone();
        let mut outcome = UpdateOutcome::default();
        let mut completed_now: Vec<String> = Vec::new();

        for up in updates {
            let Some(pos) = state.tasks.iter().position(|t| t.id == up.id) else {
                state.tasks = snapshot;
                bail!("unknown task: {}", up.id);
            };
            if let Some(status) = up.status {
                let current = state.tasks[pos].status;
                if status == TaskStatus::InProgress && current == TaskStatus::Pending {
                    let open: Vec<String> = state.tasks[pos]
                        .blocked_by
                        .iter()
                        .filter(|b| {
                            state
                                .tasks
                                .iter()
                                .any(|t| &&t.id == b && t.status != TaskStatus::Completed)
                        })
                        .cloned()
                        .collect();
                    if !open.is_empty() {
                        state.tasks = snapshot;
                        bail!("task {} is blocked by {}", up.id, open.join(", "));
                    }
                }
                if status == TaskStatus::Completed && current != TaskStatus::Completed {
                    completed_now.push(up.id.clone());
                }
                state.tasks[pos].status = status;
            }
            if let Some(desc) = &up.description {
                state.tasks[pos].description = desc.clone();
            }
            if let Some(owner) = &up.owner {
                state.tasks[pos].owner = Some(owner.clone());
            }
            outcome.updated.push(up.id.clone());
        }

        // Unblock scan: pending tasks whose blockers all completed, where at
        // least one blocker completed in this batch.
        for t in &state.tasks {
            if t.status != TaskStatus::Pending || t.blocked_by.is_empty() {
                continue;
            }
            let touches_batch = t.blocked_by.iter().any(|b| completed_now.contains(b));
            let all_done = t.blocked_by.iter().all(|b| {
                state
                    .tasks
                    .iter()
                    .any(|x| &x.id == b && x.status == TaskStatus::Completed)
            });
            if touches_batch && all_done {
                outcome.unblocked.push(t.id.clone());
            }
        }

        if !state.tasks.is_empty()
            && state.tasks.iter().all(|t| t.status == TaskStatus::Completed)
        {
            state.tasks.clear();
            outcome.cleared = true;
        }

        self.persist(&state)?;
        Ok(outcome)
    }

    /// Add `blocker` to `task.blocked_by`.  Refused when the edge would
    /// close a cycle: anything reachable from `task` through `blocks` must
    /// not include `blocker`... which is exactly when `blocker` already
    /// waits (transitively) on `task`.
    pub async fn add_dependency(&self, task_id: &str, blocker_id: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state);
        if task_id == blocker_id {
            bail!("a task cannot block itself");
        }
        for id in [task_id, blocker_id] {
            if !state.tasks.iter().any(|t| t.id == id) {
                bail!("unknown task: {id}");
            }
        }
        if Self::reaches(&state.tasks, task_id, blocker_id) {
            bail!("dependency would create a cycle: {blocker_id} already waits on {task_id}");
        }
        let task = state.tasks.iter_mut().find(|t| t.id == task_id).unwrap();
        if !task.blocked_by.iter().any(|b| b == blocker_id) {
            task.blocked_by.push(blocker_id.to_string());
        }
        Self::rebuild_reverse_edges(&mut state);
        self.persist(&state)?;
        Ok(())
    }

    pub async fn remove_dependency(&self, task_id: &str, blocker_id: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state);
        let Some(task) = state.tasks.iter_mut().find(|t| t.id == task_id) else {
            bail!("unknown task: {task_id}");
        };
        let before = task.blocked_by.len();
        task.blocked_by.retain(|b| b != blocker_id);
        if task.blocked_by.len() == before {
            bail!("{task_id} is not blocked by {blocker_id}");
        }
        Self::rebuild_reverse_edges(&mut state);
        self.persist(&state)?;
        Ok(())
    }

    /// Tasks with at least one incomplete blocker.
    pub async fn blocked_tasks(&self) -> Vec<Task> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state);
        state
            .tasks
            .iter()
            .filter(|t| {
                t.blocked_by.iter().any(|b| {
                    state
                        .tasks
                        .iter()
                        .any(|x| &x.id == b && x.status != TaskStatus::Completed)
                })
            })
            .cloned()
            .collect()
    }

    /// Forward reachability from `from` through `blocks` edges.
    fn reaches(tasks: &[Task], from: &str, target: &str) -> bool {
        let by_id: HashMap<&str, &Task> =
            tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let mut stack = vec![from];
        let mut seen: HashSet<&str> = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(t) = by_id.get(id) {
                stack.extend(t.blocks.iter().map(String::as_str));
            }
        }
        false
    }

    /// Recompute every `blocks` list from the authoritative `blocked_by`
    /// edges, preserving insertion order of the forward edges.
    fn rebuild_reverse_edges(state: &mut State) {
        let forward: Vec<(String, Vec<String>)> = state
            .tasks
            .iter()
            .map(|t| (t.id.clone(), t.blocked_by.clone()))
            .collect();
        for t in &mut state.tasks {
            t.blocks.clear();
        }
        for (id, blockers) in forward {
            for b in blockers {
                if let Some(t) = state.tasks.iter_mut().find(|t| t.id == b) {
                    if !t.blocks.contains(&id) {
                        t.blocks.push(id.clone());
                    }
                }
            }
        }
    }
}

/// One entry in an `update` batch.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub id: String,
    pub status: Option<TaskStatus>,
    pub description: Option<String>,
    pub owner: Option<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> TaskStore {
        TaskStore::at_path(dir.path().join("list.json"))
    }

    fn upd(id: &str, status: TaskStatus) -> TaskUpdate {
        TaskUpdate { id: id.into(), status: Some(status), ..Default::default() }
    }

    #[tokio::test]
    async fn create_assigns_sequential_ids() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let a = s.create("A", &[], None).await.unwrap();
        let b = s.create("B", &[], None).await.unwrap();
        assert_eq!(a.id, "task_1");
        assert_eq!(b.id, "task_2");
    }

    #[tokio::test]
    async fn create_with_unknown_blocker_fails() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        assert!(s.create("A", &["task_99".into()], None).await.is_err());
    }

    #[tokio::test]
    async fn blocks_is_reverse_of_blocked_by() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.create("A", &[], None).await.unwrap();
        s.create("B", &["task_1".into()], None).await.unwrap();
        let a = s.get("task_1").await.unwrap();
        assert_eq!(a.blocks, vec!["task_2"]);
        let b = s.get("task_2").await.unwrap();
        assert_eq!(b.blocked_by, vec!["task_1"]);
    }

    #[tokio::test]
    async fn blocked_task_cannot_start() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.create("A", &[], None).await.unwrap();
        s.create("B", &["task_1".into()], None).await.unwrap();
        let err = s.update(&[upd("task_2", TaskStatus::InProgress)]).await.unwrap_err();
        assert!(err.to_string().contains("blocked by task_1"), "{err}");
    }

    #[tokio::test]
    async fn completing_blocker_unblocks_dependent() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.create("A", &[], None).await.unwrap();
        s.create("B", &["task_1".into()], None).await.unwrap();
        let outcome = s.update(&[upd("task_1", TaskStatus::Completed)]).await.unwrap();
        assert_eq!(outcome.unblocked, vec!["task_2"]);
        // Now the transition is allowed.
        assert!(s.update(&[upd("task_2", TaskStatus::InProgress)]).await.is_ok());
    }

    #[tokio::test]
    async fn all_completed_clears_the_list() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.create("A", &[], None).await.unwrap();
        s.create("B", &[], None).await.unwrap();
        let outcome = s
            .update(&[
                upd("task_1", TaskStatus::Completed),
                upd("task_2", TaskStatus::Completed),
            ])
            .await
            .unwrap();
        assert!(outcome.cleared);
        assert!(s.list().await.is_empty());
    }

    #[tokio::test]
    async fn cycle_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.create("A", &[], None).await.unwrap();
        s.create("B", &["task_1".into()], None).await.unwrap();
        // task_1 blocked by task_2 would close the loop.
        let err = s.add_dependency("task_1", "task_2").await.unwrap_err();
        assert!(err.to_string().contains("cycle"), "{err}");
    }

    #[tokio::test]
    async fn self_dependency_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.create("A", &[], None).await.unwrap();
        assert!(s.add_dependency("task_1", "task_1").await.is_err());
    }

    #[tokio::test]
    async fn transitive_cycle_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.create("A", &[], None).await.unwrap();
        s.create("B", &["task_1".into()], None).await.unwrap();
        s.create("C", &["task_2".into()], None).await.unwrap();
        // A ← B ← C; making A wait on C closes a 3-cycle.
        assert!(s.add_dependency("task_1", "task_3").await.is_err());
    }

    #[tokio::test]
    async fn remove_dependency_updates_both_edges() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.create("A", &[], None).await.unwrap();
        s.create("B", &["task_1".into()], None).await.unwrap();
        s.remove_dependency("task_2", "task_1").await.unwrap();
        assert!(s.get("task_2").await.unwrap().blocked_by.is_empty());
        assert!(s.get("task_1").await.unwrap().blocks.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.json");
        {
            let s = TaskStore::at_path(path.clone());
            s.create("A", &[], None).await.unwrap();
            s.create("B", &["task_1".into()], None).await.unwrap();
        }
        let s = TaskStore::at_path(path);
        let tasks = s.list().await;
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, "task_1");
        assert_eq!(tasks[1].blocked_by, vec!["task_1"]);
        assert_eq!(tasks[0].blocks, vec!["task_2"]);
        // Ids continue after the loaded maximum.
        let c = s.create("C", &[], None).await.unwrap();
        assert_eq!(c.id, "task_3");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn task_file_has_0600_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.create("A", &[], None).await.unwrap();
        let meta = std::fs::metadata(dir.path().join("list.json")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[tokio::test]
    async fn concurrent_creates_produce_unique_ids() {
        let dir = tempfile::tempdir().unwrap();
        let s = std::sync::Arc::new(store(&dir));
        let mut handles = Vec::new();
        for i in 0..16 {
            let s = std::sync::Arc::clone(&s);
            handles.push(tokio::spawn(async move {
                s.create(&format!("t{i}"), &[], None).await.unwrap().id
            }));
        }
        let mut ids = HashSet::new();
        for h in handles {
            assert!(ids.insert(h.await.unwrap()), "duplicate id");
        }
        assert_eq!(s.list().await.len(), 16);
    }

    #[tokio::test]
    async fn failed_batch_create_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let specs = vec![
            ("ok".to_string(), vec![]),
            ("bad".to_string(), vec!["task_99".to_string()]),
        ];
        assert!(s.create_many(&specs).await.is_err());
        assert!(s.list().await.is_empty(), "partial batch must not persist");
    }
}
