// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool facade over the persistent task store.
//!
//! All handlers route through [`cagent_tasks::TaskStore`], which holds the
//! single write lock across validation, mutation, and persist.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use cagent_tasks::{TaskStatus, TaskStore, UpdateOutcome};

use crate::tool::{Tool, ToolAnnotations, ToolCall, ToolCallResult};

fn format_task(t: &cagent_tasks::Task) -> String {
    let mut line = format!("{} [{}] {}", t.id, t.status.label(), t.description);
    if !t.blocked_by.is_empty() {
        line.push_str(&format!(" (blocked by {})", t.blocked_by.join(", ")));
    }
    if let Some(owner) = &t.owner {
        line.push_str(&format!(" (owner: {owner})"));
    }
    line
}

fn format_outcome(outcome: &UpdateOutcome) -> String {
    let mut msg = format!("updated {}", outcome.updated.join(", "));
    if !outcome.unblocked.is_empty() {
        msg.push_str(&format!("; now unblocked: {}", outcome.unblocked.join(", ")));
    }
    if outcome.cleared {
        msg.push_str("; all tasks completed, list cleared");
    }
    msg
}

pub struct CreateTaskTool {
    pub store: Arc<TaskStore>,
}

#[async_trait]
impl Tool for CreateTaskTool {
    fn name(&self) -> &str {
        "create_task"
    }
    fn description(&self) -> &str {
        "Create a single task. Optional blocked_by lists ids of tasks that\n\
         must complete before this one can start."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "description": { "type": "string", "description": "What needs to be done" },
                "blocked_by": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Ids of tasks this one waits on"
                },
                "owner": { "type": "string", "description": "Agent that owns the task" }
            },
            "required": ["description"],
            "additionalProperties": false
        })
    }
    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations::mutating("Create task")
    }

    async fn execute(&self, call: &ToolCall) -> ToolCallResult {
        let description = match call.args.get("description").and_then(|v| v.as_str()) {
            Some(d) => d,
            None => return ToolCallResult::err(&call.id, "missing 'description'"),
        };
        let blocked_by: Vec<String> = call
            .args
            .get("blocked_by")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let owner = call
            .args
            .get("owner")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        match self.store.create(description, &blocked_by, owner).await {
            Ok(task) => ToolCallResult::ok(&call.id, format!("created {}", format_task(&task))),
            Err(e) => ToolCallResult::err(&call.id, e.to_string()),
        }
    }
}

pub struct CreateTasksTool {
    pub store: Arc<TaskStore>,
}

#[async_trait]
impl Tool for CreateTasksTool {
    fn name(&self) -> &str {
        "create_tasks"
    }
    fn description(&self) -> &str {
        "Create several tasks at once. Later entries may list earlier entries'\n\
         ids in blocked_by. The batch is atomic: one invalid entry rejects all."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "tasks": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "description": { "type": "string" },
                            "blocked_by": {
                                "type": "array",
                                "items": { "type": "string" }
                            }
                        },
                        "required": ["description"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["tasks"],
            "additionalProperties": false
        })
    }
    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations::mutating("Create tasks")
    }

    async fn execute(&self, call: &ToolCall) -> ToolCallResult {
        let Some(entries) = call.args.get("tasks").and_then(|v| v.as_array()) else {
            return ToolCallResult::err(&call.id, "missing 'tasks' array");
        };
        let mut specs = Vec::with_capacity(entries.len());
        for e in entries {
            let Some(description) = e.get("description").and_then(|v| v.as_str()) else {
                return ToolCallResult::err(&call.id, "task entry missing 'description'");
            };
            let blocked_by: Vec<String> = e
                .get("blocked_by")
                .and_then(|v| v.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            specs.push((description.to_string(), blocked_by));
        }
        match self.store.create_many(&specs).await {
            Ok(tasks) => {
                let lines: Vec<String> = tasks.iter().map(format_task).collect();
                ToolCallResult::ok(&call.id, format!("created:\n{}", lines.join("\n")))
            }
            Err(e) => ToolCallResult::err(&call.id, e.to_string()),
        }
    }
}

pub struct UpdateTasksTool {
    pub store: Arc<TaskStore>,
}

#[async_trait]
impl Tool for UpdateTasksTool {
    fn name(&self) -> &str {
        "update_tasks"
    }
    fn description(&self) -> &str {
        "Update status/description/owner of one or more tasks. Statuses:\n\
         pending, in-progress, completed. A task cannot move to in-progress\n\
         while a blocker is incomplete. Completions report newly unblocked\n\
         tasks; when every task is completed the list is cleared."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "updates": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "string" },
                            "status": {
                                "type": "string",
                                "enum": ["pending", "in-progress", "completed"]
                            },
                            "description": { "type": "string" },
                            "owner": { "type": "string" }
                        },
                        "required": ["id"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["updates"],
            "additionalProperties": false
        })
    }
    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations::mutating("Update tasks")
    }

    async fn execute(&self, call: &ToolCall) -> ToolCallResult {
        let Some(entries) = call.args.get("updates").and_then(|v| v.as_array()) else {
            return ToolCallResult::err(&call.id, "missing 'updates' array");
        };
        let mut updates = Vec::with_capacity(entries.len());
        for e in entries {
            let Some(id) = e.get("id").and_then(|v| v.as_str()) else {
                return ToolCallResult::err(&call.id, "update entry missing 'id'");
            };
            let status = match e.get("status").and_then(|v| v.as_str()) {
                Some(s) => match TaskStatus::parse(s) {
                    Some(st) => Some(st),
                    None => {
                        return ToolCallResult::err(&call.id, format!("invalid status: {s}"))
                    }
                },
                None => None,
            };
            updates.push(cagent_tasks::TaskUpdate {
                id: id.to_string(),
                status,
                description: e.get("description").and_then(|v| v.as_str()).map(str::to_string),
                owner: e.get("owner").and_then(|v| v.as_str()).map(str::to_string),
            });
        }
        match self.store.update(&updates).await {
            Ok(outcome) => ToolCallResult::ok(&call.id, format_outcome(&outcome)),
            Err(e) => ToolCallResult::err(&call.id, e.to_string()),
        }
    }
}

pub struct ListTasksTool {
    pub store: Arc<TaskStore>,
}

#[async_trait]
impl Tool for ListTasksTool {
    fn name(&self) -> &str {
        "list_tasks"
    }
    fn description(&self) -> &str {
        "List all tasks with status, blockers, and owner."
    }
    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {}, "additionalProperties": false })
    }
    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations::read_only("List tasks")
    }

    async fn execute(&self, call: &ToolCall) -> ToolCallResult {
        let tasks = self.store.list().await;
        if tasks.is_empty() {
            return ToolCallResult::ok(&call.id, "no tasks");
        }
        let lines: Vec<String> = tasks.iter().map(format_task).collect();
        ToolCallResult::ok(&call.id, lines.join("\n"))
    }
}

pub struct AddTaskDependencyTool {
    pub store: Arc<TaskStore>,
}

#[async_trait]
impl Tool for AddTaskDependencyTool {
    fn name(&self) -> &str {
        "add_task_dependency"
    }
    fn description(&self) -> &str {
        "Make one task wait on another. Rejected when the edge would create\n\
         a cycle."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": { "type": "string", "description": "Id of the waiting task" },
                "blocker": { "type": "string", "description": "Id of the task it waits on" }
            },
            "required": ["task", "blocker"],
            "additionalProperties": false
        })
    }
    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations::mutating("Add task dependency")
    }

    async fn execute(&self, call: &ToolCall) -> ToolCallResult {
        let (Some(task), Some(blocker)) = (
            call.args.get("task").and_then(|v| v.as_str()),
            call.args.get("blocker").and_then(|v| v.as_str()),
        ) else {
            return ToolCallResult::err(&call.id, "missing 'task' or 'blocker'");
        };
        match self.store.add_dependency(task, blocker).await {
            Ok(()) => ToolCallResult::ok(&call.id, format!("{task} now blocked by {blocker}")),
            Err(e) => ToolCallResult::err(&call.id, e.to_string()),
        }
    }
}

pub struct RemoveTaskDependencyTool {
    pub store: Arc<TaskStore>,
}

#[async_trait]
impl Tool for RemoveTaskDependencyTool {
    fn name(&self) -> &str {
        "remove_task_dependency"
    }
    fn description(&self) -> &str {
        "Remove a blocking edge between two tasks."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": { "type": "string" },
                "blocker": { "type": "string" }
            },
            "required": ["task", "blocker"],
            "additionalProperties": false
        })
    }
    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations::mutating("Remove task dependency")
    }

    async fn execute(&self, call: &ToolCall) -> ToolCallResult {
        let (Some(task), Some(blocker)) = (
            call.args.get("task").and_then(|v| v.as_str()),
            call.args.get("blocker").and_then(|v| v.as_str()),
        ) else {
            return ToolCallResult::err(&call.id, "missing 'task' or 'blocker'");
        };
        match self.store.remove_dependency(task, blocker).await {
            Ok(()) => {
                ToolCallResult::ok(&call.id, format!("{task} no longer blocked by {blocker}"))
            }
            Err(e) => ToolCallResult::err(&call.id, e.to_string()),
        }
    }
}

pub struct GetBlockedTasksTool {
    pub store: Arc<TaskStore>,
}

#[async_trait]
impl Tool for GetBlockedTasksTool {
    fn name(&self) -> &str {
        "get_blocked_tasks"
    }
    fn description(&self) -> &str {
        "List tasks that cannot start because a blocker is incomplete."
    }
    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {}, "additionalProperties": false })
    }
    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations::read_only("Blocked tasks")
    }

    async fn execute(&self, call: &ToolCall) -> ToolCallResult {
        let tasks = self.store.blocked_tasks().await;
        if tasks.is_empty() {
            return ToolCallResult::ok(&call.id, "no blocked tasks");
        }
        let lines: Vec<String> = tasks.iter().map(format_task).collect();
        ToolCallResult::ok(&call.id, lines.join("\n"))
    }
}

/// All task tools over one store.
pub fn task_tools(store: Arc<TaskStore>) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(CreateTaskTool { store: Arc::clone(&store) }),
        Arc::new(CreateTasksTool { store: Arc::clone(&store) }),
        Arc::new(UpdateTasksTool { store: Arc::clone(&store) }),
        Arc::new(ListTasksTool { store: Arc::clone(&store) }),
        Arc::new(AddTaskDependencyTool { store: Arc::clone(&store) }),
        Arc::new(RemoveTaskDependencyTool { store: Arc::clone(&store) }),
        Arc::new(GetBlockedTasksTool { store }),
    ]
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tool::ToolCall;

    fn store(dir: &tempfile::TempDir) -> Arc<TaskStore> {
        Arc::new(TaskStore::at_path(dir.path().join("list.json")))
    }

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall { id: "t1".into(), name: "tasks".into(), args }
    }

    #[tokio::test]
    async fn create_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let create = CreateTaskTool { store: Arc::clone(&s) };
        let out = create.execute(&call(json!({"description": "A"}))).await;
        assert!(!out.is_error, "{}", out.output);
        assert!(out.output.contains("task_1"));

        let list = ListTasksTool { store: s };
        let out = list.execute(&call(json!({}))).await;
        assert!(out.output.contains("task_1 [pending] A"));
    }

    #[tokio::test]
    async fn dependency_flow_matches_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let create = CreateTaskTool { store: Arc::clone(&s) };
        create.execute(&call(json!({"description": "A"}))).await;
        let out = create
            .execute(&call(json!({"description": "B", "blocked_by": ["task_1"]})))
            .await;
        assert!(out.output.contains("task_2"));

        let update = UpdateTasksTool { store: Arc::clone(&s) };
        let out = update
            .execute(&call(json!({"updates": [{"id": "task_2", "status": "in-progress"}]})))
            .await;
        assert!(out.is_error);
        assert!(out.output.contains("blocked by task_1"));

        let out = update
            .execute(&call(json!({"updates": [{"id": "task_1", "status": "completed"}]})))
            .await;
        assert!(!out.is_error);
        assert!(out.output.contains("task_2"), "unblock message must name task_2: {}", out.output);
    }

    #[tokio::test]
    async fn add_dependency_cycle_is_tool_error() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let create = CreateTaskTool { store: Arc::clone(&s) };
        create.execute(&call(json!({"description": "A"}))).await;
        create
            .execute(&call(json!({"description": "B", "blocked_by": ["task_1"]})))
            .await;
        let add = AddTaskDependencyTool { store: s };
        let out = add
            .execute(&call(json!({"task": "task_1", "blocker": "task_2"})))
            .await;
        assert!(out.is_error);
        assert!(out.output.contains("cycle"));
    }

    #[tokio::test]
    async fn blocked_tasks_lists_only_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let create = CreateTaskTool { store: Arc::clone(&s) };
        create.execute(&call(json!({"description": "A"}))).await;
        create
            .execute(&call(json!({"description": "B", "blocked_by": ["task_1"]})))
            .await;
        let blocked = GetBlockedTasksTool { store: s };
        let out = blocked.execute(&call(json!({}))).await;
        assert!(out.output.contains("task_2"));
        assert!(!out.output.contains("task_1 ["));
    }

    #[tokio::test]
    async fn batch_create_atomicity_reported_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let create = CreateTasksTool { store: Arc::clone(&s) };
        let out = create
            .execute(&call(json!({"tasks": [
                {"description": "ok"},
                {"description": "bad", "blocked_by": ["task_99"]}
            ]})))
            .await;
        assert!(out.is_error);
        let list = ListTasksTool { store: s };
        let out = list.execute(&call(json!({}))).await;
        assert_eq!(out.output, "no tasks");
    }
}
