// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolAnnotations, ToolCall, ToolCallResult};

#[derive(Default)]
pub struct MemoryTool {
    /// Path override for the memory file (falls back to ~/.config/cagent/memory.json)
    pub memory_file: Option<String>,
}

#[async_trait]
impl Tool for MemoryTool {
    fn name(&self) -> &str {
        "memory"
    }

    fn description(&self) -> &str {
        "Persist key-value pairs across sessions. Operations: set (upsert), get (retrieve), \
         delete (remove), list (all keys). Memory is stored in ~/.config/cagent/memory.json."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "operation": {
                    "type": "string",
                    "enum": ["set", "get", "delete", "list"],
                    "description": "Memory operation to perform"
                },
                "key": {
                    "type": "string",
                    "description": "Memory key (required for set/get/delete)"
                },
                "value": {
                    "type": "string",
                    "description": "Value to store (required for set)"
                }
            },
            "required": ["operation"]
        })
    }

    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations::mutating("Agent memory")
    }

    async fn execute(&self, call: &ToolCall) -> ToolCallResult {
        let op = match call.args.get("operation").and_then(|v| v.as_str()) {
            Some(o) => o.to_string(),
            None => return ToolCallResult::err(&call.id, "missing 'operation'"),
        };

        debug!(op = %op, "memory tool");

        let path = self.memory_path();

        match op.as_str() {
            "set" => {
                let key = match call.args.get("key").and_then(|v| v.as_str()) {
                    Some(k) => k.to_string(),
                    None => return ToolCallResult::err(&call.id, "missing 'key' for set"),
                };
                let value = match call.args.get("value").and_then(|v| v.as_str()) {
                    Some(v) => v.to_string(),
                    None => return ToolCallResult::err(&call.id, "missing 'value' for set"),
                };
                let mut store = load_store(&path).await;
                store.insert(key.clone(), value);
                match save_store(&path, &store).await {
                    Ok(_) => ToolCallResult::ok(&call.id, format!("set {key}")),
                    Err(e) => ToolCallResult::err(&call.id, format!("save error: {e}")),
                }
            }
            "get" => {
                let key = match call.args.get("key").and_then(|v| v.as_str()) {
                    Some(k) => k.to_string(),
                    None => return ToolCallResult::err(&call.id, "missing 'key' for get"),
                };
                let store = load_store(&path).await;
                match store.get(&key) {
                    Some(v) => ToolCallResult::ok(&call.id, v.clone()),
                    None => ToolCallResult::err(&call.id, format!("key not found: {key}")),
                }
            }
            "delete" => {
                let key = match call.args.get("key").and_then(|v| v.as_str()) {
                    Some(k) => k.to_string(),
                    None => return ToolCallResult::err(&call.id, "missing 'key' for delete"),
                };
                let mut store = load_store(&path).await;
                if store.remove(&key).is_none() {
                    return ToolCallResult::err(&call.id, format!("key not found: {key}"));
                }
                match save_store(&path, &store).await {
                    Ok(_) => ToolCallResult::ok(&call.id, format!("deleted {key}")),
                    Err(e) => ToolCallResult::err(&call.id, format!("save error: {e}")),
                }
            }
            "list" => {
                let store = load_store(&path).await;
                if store.is_empty() {
                    ToolCallResult::ok(&call.id, "(no keys stored)")
                } else {
                    let mut keys: Vec<&str> = store.keys().map(String::as_str).collect();
                    keys.sort();
                    ToolCallResult::ok(&call.id, keys.join("\n"))
                }
            }
            other => ToolCallResult::err(&call.id, format!("unknown operation: {other}")),
        }
    }
}

impl MemoryTool {
    fn memory_path(&self) -> PathBuf {
        if let Some(p) = &self.memory_file {
            return PathBuf::from(p);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cagent")
            .join("memory.json")
    }
}

async fn load_store(path: &PathBuf) -> HashMap<String, String> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
        Err(_) => HashMap::new(),
    }
}

async fn save_store(path: &PathBuf, store: &HashMap<String, String>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(store)?;
    tokio::fs::write(path, json).await?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
