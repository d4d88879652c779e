// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Persistent, dependency-tracked task lists shared across concurrent agents
//! and git worktrees.
//!
//! A list is identified by `<repo-dir-name>-<first-8-hex-of-sha256(path)>`
//! derived from the git common directory, so every worktree of a repository
//! lands on the same file.  Outside a repository the current working
//! directory stands in.  Stores are process-wide singletons keyed by list id
//! and constructed after CLI parsing (`--task-list` overrides the id).

mod store;

pub use store::{Task, TaskStatus, TaskStore, TaskUpdate, UpdateOutcome};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use sha2::{Digest, Sha256};

/// Derive the default task-list id for `start_dir`.
///
/// Uses the git common dir when `start_dir` is inside a repository (shared
/// across worktrees); otherwise the directory itself.
pub fn default_list_id(start_dir: &Path) -> String {
    let root = git_repo_root(start_dir).unwrap_or_else(|| start_dir.to_path_buf());
    list_id_for_root(&root)
}

fn list_id_for_root(root: &Path) -> String {
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "repo".into());
    let digest = Sha256::digest(root.to_string_lossy().as_bytes());
    format!("{name}-{}", &hex::encode(digest)[..8])
}

/// Walk up from `start` looking for a `.git` entry and resolve the common
/// directory's parent (the primary checkout root).  A `.git` *file* marks a
/// linked worktree: it points at a private gitdir whose `commondir` file
/// leads back to the shared one.
fn git_repo_root(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let dot_git = dir.join(".git");
        if dot_git.is_dir() {
            return Some(dir);
        }
        if dot_git.is_file() {
            let gitdir = read_gitdir_pointer(&dot_git)?;
            let common = read_commondir(&gitdir).unwrap_or(gitdir);
            return common.parent().map(Path::to_path_buf);
        }
        if !dir.pop() {
            return None;
        }
    }
}

fn read_gitdir_pointer(dot_git_file: &Path) -> Option<PathBuf> {
    let text = std::fs::read_to_string(dot_git_file).ok()?;
    let rel = text.strip_prefix("gitdir:")?.trim();
    let p = PathBuf::from(rel);
    if p.is_absolute() {
        Some(p)
    } else {
        dot_git_file.parent().map(|d| d.join(p))
    }
}

fn read_commondir(gitdir: &Path) -> Option<PathBuf> {
    let text = std::fs::read_to_string(gitdir.join("commondir")).ok()?;
    let rel = PathBuf::from(text.trim());
    let resolved = if rel.is_absolute() { rel } else { gitdir.join(rel) };
    resolved.canonicalize().ok()
}

/// Directory where task files live: `<state-dir>/tasks/`.
fn tasks_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cagent")
        .join("tasks")
}

fn singletons() -> &'static Mutex<HashMap<String, std::sync::Arc<TaskStore>>> {
    static STORES: OnceLock<Mutex<HashMap<String, std::sync::Arc<TaskStore>>>> = OnceLock::new();
    STORES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The process-wide store for `list_id`, created on first use.
pub fn store_for_list(list_id: &str) -> std::sync::Arc<TaskStore> {
    let mut map = singletons().lock().unwrap();
    map.entry(list_id.to_string())
        .or_insert_with(|| {
            std::sync::Arc::new(TaskStore::at_path(
                tasks_dir().join(format!("{list_id}.json")),
            ))
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_id_combines_name_and_hash_prefix() {
        let id = list_id_for_root(Path::new("/home/dev/myrepo"));
        assert!(id.starts_with("myrepo-"));
        let suffix = id.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn list_id_is_stable() {
        let a = list_id_for_root(Path::new("/home/dev/myrepo"));
        let b = list_id_for_root(Path::new("/home/dev/myrepo"));
        assert_eq!(a, b);
    }

    #[test]
    fn different_paths_differ_in_hash() {
        let a = list_id_for_root(Path::new("/home/dev/myrepo"));
        let b = list_id_for_root(Path::new("/srv/other/myrepo"));
        assert_ne!(a, b);
        assert!(a.starts_with("myrepo-") && b.starts_with("myrepo-"));
    }

    #[test]
    fn default_list_id_without_git_uses_dir_itself() {
        let dir = tempfile::tempdir().unwrap();
        let id = default_list_id(dir.path());
        let name = dir.path().file_name().unwrap().to_string_lossy();
        assert!(id.starts_with(&*name));
    }

    #[test]
    fn default_list_id_finds_enclosing_git_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        assert_eq!(default_list_id(&nested), default_list_id(dir.path()));
    }

    #[test]
    fn worktree_gitdir_pointer_resolves_to_common_root() {
        // Layout: main/.git/worktrees/wt with commondir -> ../..
        // worktree dir has a .git *file* pointing at the private gitdir.
        let root = tempfile::tempdir().unwrap();
        let main = root.path().join("main");
        let private = main.join(".git").join("worktrees").join("wt");
        std::fs::create_dir_all(&private).unwrap();
        std::fs::write(private.join("commondir"), "../..\n").unwrap();

        let wt = root.path().join("wt");
        std::fs::create_dir_all(&wt).unwrap();
        std::fs::write(
            wt.join(".git"),
            format!("gitdir: {}\n", private.display()),
        )
        .unwrap();

        let resolved = git_repo_root(&wt).unwrap();
        assert_eq!(
            resolved.canonicalize().unwrap(),
            main.canonicalize().unwrap(),
            "worktree must resolve to the primary checkout"
        );
    }

    #[test]
    fn store_for_list_returns_same_instance() {
        let a = store_for_list("unit-test-list");
        let b = store_for_list("unit-test-list");
        assert!(std::sync::Arc::ptr_eq(&a, &b));
    }
}
