// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use super::client::{path_to_uri, uri_to_path, LspClient};
use super::edits::{apply_text_edits, to_lsp_position, write_file_atomic, TextEdit};
use crate::registry::ToolSet;
use crate::tool::{Tool, ToolAnnotations, ToolCall, ToolCallResult};

/// Shared bridge state: the lazily started client plus its configuration.
pub struct LspBridge {
    command: Vec<String>,
    root_dir: String,
    client: Mutex<Option<Arc<LspClient>>>,
}

impl LspBridge {
    pub fn new(command: Vec<String>, root_dir: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            command,
            root_dir: root_dir.into(),
            client: Mutex::new(None),
        })
    }

    /// The running client, spawning the server on first use.
    async fn client(&self) -> anyhow::Result<Arc<LspClient>> {
        let mut slot = self.client.lock().await;
        if let Some(c) = slot.as_ref() {
            return Ok(Arc::clone(c));
        }
        debug!(command = ?self.command, "starting language server");
        let client = LspClient::start(&self.command, &self.root_dir).await?;
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    async fn stop(&self) {
        if let Some(c) = self.client.lock().await.take() {
            c.stop().await;
        }
    }

    /// Apply a WorkspaceEdit: `documentChanges` first, then `changes`, both
    /// when present.  Files are rewritten atomically and the server is told
    /// about each new content via didChange.
    async fn apply_workspace_edit(&self, edit: &Value) -> anyhow::Result<Vec<String>> {
        let client = self.client().await?;
        let mut changed = Vec::new();

        if let Some(doc_changes) = edit["documentChanges"].as_array() {
            for change in doc_changes {
                // Only textual edits; create/rename/delete file operations are
                // not produced by the exposed tools.
                let Some(uri) = change["textDocument"]["uri"].as_str() else { continue };
                let edits: Vec<TextEdit> =
                    serde_json::from_value(change["edits"].clone()).unwrap_or_default();
                self.apply_edits_to_uri(&client, uri, &edits).await?;
                changed.push(uri_to_path(uri));
            }
        }
        if let Some(changes) = edit["changes"].as_object() {
            for (uri, edits) in changes {
                let edits: Vec<TextEdit> =
                    serde_json::from_value(edits.clone()).unwrap_or_default();
                self.apply_edits_to_uri(&client, uri, &edits).await?;
                changed.push(uri_to_path(uri));
            }
        }
        Ok(changed)
    }

    async fn apply_edits_to_uri(
        &self,
        client: &LspClient,
        uri: &str,
        edits: &[TextEdit],
    ) -> anyhow::Result<()> {
        let path = uri_to_path(uri);
        client.ensure_open(&path).await?;
        let content = match client.open_content(&path).await {
            Some(c) => c,
            None => tokio::fs::read_to_string(&path).await?,
        };
        let new_content = apply_text_edits(&content, edits);
        write_file_atomic(&path, &new_content).await?;
        client.did_change(&path, &new_content).await?;
        Ok(())
    }
}

/// The code-intelligence operations the bridge exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LspOp {
    Hover,
    Definition,
    References,
    DocumentSymbols,
    WorkspaceSymbols,
    Diagnostics,
    Rename,
    CodeActions,
    Format,
    CallHierarchy,
    TypeHierarchy,
    Implementations,
    SignatureHelp,
    InlayHints,
    Workspace,
}

impl LspOp {
    const ALL: [LspOp; 15] = [
        LspOp::Hover,
        LspOp::Definition,
        LspOp::References,
        LspOp::DocumentSymbols,
        LspOp::WorkspaceSymbols,
        LspOp::Diagnostics,
        LspOp::Rename,
        LspOp::CodeActions,
        LspOp::Format,
        LspOp::CallHierarchy,
        LspOp::TypeHierarchy,
        LspOp::Implementations,
        LspOp::SignatureHelp,
        LspOp::InlayHints,
        LspOp::Workspace,
    ];

    fn name(&self) -> &'static str {
        match self {
            Self::Hover => "lsp_hover",
            Self::Definition => "lsp_definition",
            Self::References => "lsp_references",
            Self::DocumentSymbols => "lsp_document_symbols",
            Self::WorkspaceSymbols => "lsp_workspace_symbols",
            Self::Diagnostics => "lsp_diagnostics",
            Self::Rename => "lsp_rename",
            Self::CodeActions => "lsp_code_actions",
            Self::Format => "lsp_format",
            Self::CallHierarchy => "lsp_call_hierarchy",
            Self::TypeHierarchy => "lsp_type_hierarchy",
            Self::Implementations => "lsp_implementations",
            Self::SignatureHelp => "lsp_signature_help",
            Self::InlayHints => "lsp_inlay_hints",
            Self::Workspace => "lsp_workspace",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            Self::Hover => "Show type/documentation for the symbol at file:line:column (1-based).",
            Self::Definition => "Jump to the definition of the symbol at file:line:column.",
            Self::References => "List all references to the symbol at file:line:column.",
            Self::DocumentSymbols => "List the symbols declared in a file.",
            Self::WorkspaceSymbols => "Search symbols across the workspace by name.",
            Self::Diagnostics => {
                "Show current diagnostics for a file, or for every open file when\n\
                 no file is given."
            }
            Self::Rename => {
                "Rename the symbol at file:line:column across the workspace.\n\
                 Edits are applied to disk."
            }
            Self::CodeActions => "List available code actions at file:line:column.",
            Self::Format => "Format a file with the language server and write it back.",
            Self::CallHierarchy => "Show incoming calls of the function at file:line:column.",
            Self::TypeHierarchy => "Show supertypes of the type at file:line:column.",
            Self::Implementations => "List implementations of the symbol at file:line:column.",
            Self::SignatureHelp => "Show the signature of the call at file:line:column.",
            Self::InlayHints => "Show inlay hints (inferred types, parameter names) for a file.",
            Self::Workspace => "Show language server capabilities and tracked diagnostics.",
        }
    }

    /// True for ops addressed by a cursor position.
    fn takes_position(&self) -> bool {
        matches!(
            self,
            Self::Hover
                | Self::Definition
                | Self::References
                | Self::Rename
                | Self::CodeActions
                | Self::CallHierarchy
                | Self::TypeHierarchy
                | Self::Implementations
                | Self::SignatureHelp
        )
    }

    fn schema(&self) -> Value {
        let mut props = serde_json::Map::new();
        let mut required: Vec<&str> = Vec::new();
        let file_prop = json!({ "type": "string", "description": "Path to the file" });
        if self.takes_position() {
            props.insert("file".into(), file_prop.clone());
            props.insert(
                "line".into(),
                json!({ "type": "integer", "description": "1-based line" }),
            );
            props.insert(
                "column".into(),
                json!({ "type": "integer", "description": "1-based column" }),
            );
            required.extend(["file", "line", "column"]);
        }
        match self {
            Self::DocumentSymbols | Self::Format | Self::InlayHints => {
                props.insert("file".into(), file_prop);
                required.push("file");
            }
            Self::Diagnostics => {
                props.insert("file".into(), file_prop);
            }
            Self::WorkspaceSymbols => {
                props.insert(
                    "query".into(),
                    json!({ "type": "string", "description": "Symbol name or prefix" }),
                );
                required.push("query");
            }
            Self::Rename => {
                props.insert(
                    "new_name".into(),
                    json!({ "type": "string", "description": "The new symbol name" }),
                );
                required.push("new_name");
            }
            _ => {}
        }
        json!({
            "type": "object",
            "properties": props,
            "required": required,
            "additionalProperties": false
        })
    }
}

pub struct LspTool {
    bridge: Arc<LspBridge>,
    op: LspOp,
}

#[async_trait]
impl Tool for LspTool {
    fn name(&self) -> &str {
        self.op.name()
    }
    fn description(&self) -> &str {
        self.op.description()
    }
    fn parameters_schema(&self) -> Value {
        self.op.schema()
    }
    fn annotations(&self) -> ToolAnnotations {
        match self.op {
            LspOp::Rename | LspOp::Format => ToolAnnotations::mutating("Code edit"),
            _ => ToolAnnotations::read_only("Code intelligence"),
        }
    }

    async fn execute(&self, call: &ToolCall) -> ToolCallResult {
        match self.run(call).await {
            Ok(output) => ToolCallResult::ok(&call.id, output),
            Err(e) => ToolCallResult::err(&call.id, e.to_string()),
        }
    }
}

impl LspTool {
    async fn run(&self, call: &ToolCall) -> anyhow::Result<String> {
        let client = self.bridge.client().await?;

        // Position-addressed ops share argument handling.
        if self.op.takes_position() {
            let (file, line, column) = position_args(call)?;
            let uri = client.ensure_open(&file).await?;
            let pos = to_lsp_position(line, column);
            let doc_pos = json!({
                "textDocument": { "uri": uri.clone() },
                "position": pos,
            });
            return match self.op {
                LspOp::Hover => {
                    let r = client.request("textDocument/hover", doc_pos).await?;
                    Ok(format_hover(&r))
                }
                LspOp::Definition => {
                    let r = client.request("textDocument/definition", doc_pos).await?;
                    Ok(format_locations(&r))
                }
                LspOp::References => {
                    let mut params = doc_pos;
                    params["context"] = json!({ "includeDeclaration": true });
                    let r = client.request("textDocument/references", params).await?;
                    Ok(format_locations(&r))
                }
                LspOp::Implementations => {
                    let r = client.request("textDocument/implementation", doc_pos).await?;
                    Ok(format_locations(&r))
                }
                LspOp::SignatureHelp => {
                    let r = client.request("textDocument/signatureHelp", doc_pos).await?;
                    Ok(format_signature_help(&r))
                }
                LspOp::Rename => {
                    let new_name = call
                        .args
                        .get("new_name")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| anyhow::anyhow!("missing 'new_name'"))?;
                    let mut params = doc_pos;
                    params["newName"] = json!(new_name);
                    let edit = client.request("textDocument/rename", params).await?;
                    let changed = self.bridge.apply_workspace_edit(&edit).await?;
                    if changed.is_empty() {
                        Ok("nothing to rename".into())
                    } else {
                        Ok(format!("renamed in:\n{}", changed.join("\n")))
                    }
                }
                LspOp::CodeActions => {
                    let diags = client
                        .diagnostics_for(&uri)
                        .await
                        .unwrap_or_else(|| json!([]));
                    let params = json!({
                        "textDocument": { "uri": uri },
                        "range": { "start": pos, "end": pos },
                        "context": { "diagnostics": diags },
                    });
                    let r = client.request("textDocument/codeAction", params).await?;
                    Ok(format_code_actions(&r))
                }
                LspOp::CallHierarchy => {
                    let items = client
                        .request("textDocument/prepareCallHierarchy", doc_pos)
                        .await?;
                    let Some(item) = items.as_array().and_then(|a| a.first()) else {
                        return Ok("no callable at this position".into());
                    };
                    let calls = client
                        .request("callHierarchy/incomingCalls", json!({ "item": item }))
                        .await?;
                    Ok(format_hierarchy_calls(&calls, "from"))
                }
                LspOp::TypeHierarchy => {
                    let items = client
                        .request("textDocument/prepareTypeHierarchy", doc_pos)
                        .await?;
                    let Some(item) = items.as_array().and_then(|a| a.first()) else {
                        return Ok("no type at this position".into());
                    };
                    let supers = client
                        .request("typeHierarchy/supertypes", json!({ "item": item }))
                        .await?;
                    Ok(format_hierarchy_items(&supers))
                }
                _ => unreachable!(),
            };
        }

        match self.op {
            LspOp::DocumentSymbols => {
                let file = file_arg(call)?;
                let uri = client.ensure_open(&file).await?;
                let r = client
                    .request(
                        "textDocument/documentSymbol",
                        json!({ "textDocument": { "uri": uri } }),
                    )
                    .await?;
                Ok(format_symbols(&r))
            }
            LspOp::WorkspaceSymbols => {
                let query = call
                    .args
                    .get("query")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow::anyhow!("missing 'query'"))?;
                let r = client
                    .request("workspace/symbol", json!({ "query": query }))
                    .await?;
                Ok(format_symbols(&r))
            }
            LspOp::Diagnostics => {
                match call.args.get("file").and_then(|v| v.as_str()) {
                    Some(file) => {
                        let uri = client.ensure_open(file).await?;
                        let diags = client
                            .diagnostics_for(&uri)
                            .await
                            .unwrap_or_else(|| json!([]));
                        Ok(format_diagnostics(file, &diags))
                    }
                    None => {
                        let all = client.all_diagnostics().await;
                        if all.is_empty() {
                            return Ok("no diagnostics".into());
                        }
                        let mut out = Vec::new();
                        for (uri, diags) in all {
                            out.push(format_diagnostics(&uri_to_path(&uri), &diags));
                        }
                        out.sort();
                        Ok(out.join("\n"))
                    }
                }
            }
            LspOp::Format => {
                let file = file_arg(call)?;
                let uri = client.ensure_open(&file).await?;
                let r = client
                    .request(
                        "textDocument/formatting",
                        json!({
                            "textDocument": { "uri": uri },
                            "options": { "tabSize": 4, "insertSpaces": true },
                        }),
                    )
                    .await?;
                let edits: Vec<TextEdit> = serde_json::from_value(r).unwrap_or_default();
                if edits.is_empty() {
                    return Ok("already formatted".into());
                }
                let content = match client.open_content(&file).await {
                    Some(c) => c,
                    None => tokio::fs::read_to_string(&file).await?,
                };
                let new_content = apply_text_edits(&content, &edits);
                write_file_atomic(&file, &new_content).await?;
                client.did_change(&file, &new_content).await?;
                Ok(format!("formatted {file} ({} edits)", edits.len()))
            }
            LspOp::InlayHints => {
                let file = file_arg(call)?;
                let uri = client.ensure_open(&file).await?;
                let content = client.open_content(&file).await.unwrap_or_default();
                let end_line = content.lines().count() as u32;
                let r = client
                    .request(
                        "textDocument/inlayHint",
                        json!({
                            "textDocument": { "uri": uri },
                            "range": {
                                "start": { "line": 0, "character": 0 },
                                "end": { "line": end_line, "character": 0 },
                            },
                        }),
                    )
                    .await?;
                Ok(format_inlay_hints(&r))
            }
            LspOp::Workspace => {
                let caps = client.capabilities.lock().await.clone();
                let diag_count = client.all_diagnostics().await.len();
                Ok(format!(
                    "server capabilities:\n{}\nfiles with diagnostics: {diag_count}",
                    serde_json::to_string_pretty(&caps).unwrap_or_default()
                ))
            }
            _ => unreachable!(),
        }
    }
}

fn position_args(call: &ToolCall) -> anyhow::Result<(String, u32, u32)> {
    let file = file_arg(call)?;
    let line = call
        .args
        .get("line")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| anyhow::anyhow!("missing 'line'"))? as u32;
    let column = call
        .args
        .get("column")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| anyhow::anyhow!("missing 'column'"))? as u32;
    Ok((file, line, column))
}

fn file_arg(call: &ToolCall) -> anyhow::Result<String> {
    call.args
        .get("file")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("missing 'file'"))
}

fn format_hover(r: &Value) -> String {
    if r.is_null() {
        return "no hover information".into();
    }
    let contents = &r["contents"];
    if let Some(s) = contents.as_str() {
        return s.to_string();
    }
    if let Some(v) = contents["value"].as_str() {
        return v.to_string();
    }
    if let Some(arr) = contents.as_array() {
        let parts: Vec<&str> = arr
            .iter()
            .filter_map(|c| c.as_str().or_else(|| c["value"].as_str()))
            .collect();
        return parts.join("\n");
    }
    serde_json::to_string_pretty(contents).unwrap_or_default()
}

/// `Location | Location[] | LocationLink[]` → `path:line:col` rows (1-based).
fn format_locations(r: &Value) -> String {
    let locs: Vec<&Value> = match r {
        Value::Array(a) => a.iter().collect(),
        Value::Null => vec![],
        v => vec![v],
    };
    if locs.is_empty() {
        return "no results".into();
    }
    let mut lines = Vec::with_capacity(locs.len());
    for l in locs {
        let uri = l["uri"].as_str().or_else(|| l["targetUri"].as_str()).unwrap_or("");
        let range = if l.get("range").is_some() { &l["range"] } else { &l["targetRange"] };
        let line = range["start"]["line"].as_u64().unwrap_or(0) + 1;
        let col = range["start"]["character"].as_u64().unwrap_or(0) + 1;
        lines.push(format!("{}:{line}:{col}", uri_to_path(uri)));
    }
    lines.join("\n")
}

fn format_symbols(r: &Value) -> String {
    let Some(arr) = r.as_array() else {
        return "no symbols".into();
    };
    if arr.is_empty() {
        return "no symbols".into();
    }
    let mut out = Vec::new();
    collect_symbols(arr, 0, &mut out);
    out.join("\n")
}

fn collect_symbols(symbols: &[Value], depth: usize, out: &mut Vec<String>) {
    for s in symbols {
        let name = s["name"].as_str().unwrap_or("?");
        let line = s["range"]["start"]["line"]
            .as_u64()
            .or_else(|| s["location"]["range"]["start"]["line"].as_u64())
            .unwrap_or(0)
            + 1;
        out.push(format!("{}{name} (line {line})", "  ".repeat(depth)));
        if let Some(children) = s["children"].as_array() {
            collect_symbols(children, depth + 1, out);
        }
    }
}

fn format_diagnostics(path: &str, diags: &Value) -> String {
    let Some(arr) = diags.as_array() else {
        return format!("{path}: no diagnostics");
    };
    if arr.is_empty() {
        return format!("{path}: no diagnostics");
    }
    let lines: Vec<String> = arr
        .iter()
        .map(|d| {
            let line = d["range"]["start"]["line"].as_u64().unwrap_or(0) + 1;
            let col = d["range"]["start"]["character"].as_u64().unwrap_or(0) + 1;
            let msg = d["message"].as_str().unwrap_or("");
            format!("{path}:{line}:{col}: {msg}")
        })
        .collect();
    lines.join("\n")
}

fn format_code_actions(r: &Value) -> String {
    let Some(arr) = r.as_array() else {
        return "no code actions".into();
    };
    if arr.is_empty() {
        return "no code actions".into();
    }
    arr.iter()
        .filter_map(|a| a["title"].as_str())
        .map(str::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_signature_help(r: &Value) -> String {
    match r["signatures"]
        .as_array()
        .and_then(|sigs| sigs.first())
        .and_then(|s| s["label"].as_str())
    {
        Some(label) => label.to_string(),
        None => "no signature information".into(),
    }
}

fn format_hierarchy_calls(r: &Value, direction: &str) -> String {
    let Some(arr) = r.as_array() else {
        return "no calls".into();
    };
    if arr.is_empty() {
        return "no calls".into();
    }
    arr.iter()
        .filter_map(|c| c[direction]["name"].as_str())
        .map(str::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_hierarchy_items(r: &Value) -> String {
    let Some(arr) = r.as_array() else {
        return "no items".into();
    };
    if arr.is_empty() {
        return "no items".into();
    }
    arr.iter()
        .filter_map(|c| c["name"].as_str())
        .map(str::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_inlay_hints(r: &Value) -> String {
    let Some(arr) = r.as_array() else {
        return "no inlay hints".into();
    };
    if arr.is_empty() {
        return "no inlay hints".into();
    }
    arr.iter()
        .map(|h| {
            let line = h["position"]["line"].as_u64().unwrap_or(0) + 1;
            let col = h["position"]["character"].as_u64().unwrap_or(0) + 1;
            let label = match &h["label"] {
                Value::String(s) => s.clone(),
                Value::Array(parts) => parts
                    .iter()
                    .filter_map(|p| p["value"].as_str())
                    .collect::<Vec<_>>()
                    .join(""),
                _ => String::new(),
            };
            format!("{line}:{col} {label}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// The LSP bridge toolset: fixed tool list, lazily spawned server.
pub struct LspToolSet {
    bridge: Arc<LspBridge>,
}

impl LspToolSet {
    pub fn new(command: Vec<String>, root_dir: impl Into<String>) -> Self {
        Self { bridge: LspBridge::new(command, root_dir) }
    }
}

#[async_trait]
impl ToolSet for LspToolSet {
    fn name(&self) -> &str {
        "lsp"
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.bridge.stop().await;
        Ok(())
    }

    async fn tools(&self) -> anyhow::Result<Vec<Arc<dyn Tool>>> {
        Ok(LspOp::ALL
            .iter()
            .map(|op| {
                Arc::new(LspTool { bridge: Arc::clone(&self.bridge), op: *op }) as Arc<dyn Tool>
            })
            .collect())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_op_has_a_distinct_name() {
        let mut names: Vec<&str> = LspOp::ALL.iter().map(|o| o.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), LspOp::ALL.len());
    }

    #[test]
    fn position_ops_require_file_line_column() {
        let schema = LspOp::Hover.schema();
        let required = schema["required"].as_array().unwrap();
        for field in ["file", "line", "column"] {
            assert!(required.iter().any(|v| v.as_str() == Some(field)), "missing {field}");
        }
    }

    #[test]
    fn rename_requires_new_name() {
        let schema = LspOp::Rename.schema();
        let required = schema["required"].as_array().unwrap();
        assert!(required.iter().any(|v| v.as_str() == Some("new_name")));
    }

    #[test]
    fn diagnostics_file_is_optional() {
        let schema = LspOp::Diagnostics.schema();
        assert!(schema["required"].as_array().unwrap().is_empty());
        assert!(schema["properties"]["file"].is_object());
    }

    #[test]
    fn format_locations_converts_to_one_based() {
        let r = json!([{
            "uri": "file:///src/main.rs",
            "range": { "start": { "line": 9, "character": 3 }, "end": { "line": 9, "character": 8 } }
        }]);
        assert_eq!(format_locations(&r), "/src/main.rs:10:4");
    }

    #[test]
    fn format_locations_handles_location_links() {
        let r = json!([{
            "targetUri": "file:///src/lib.rs",
            "targetRange": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 1 } }
        }]);
        assert_eq!(format_locations(&r), "/src/lib.rs:1:1");
    }

    #[test]
    fn format_hover_extracts_markup_value() {
        let r = json!({ "contents": { "kind": "markdown", "value": "fn main()" } });
        assert_eq!(format_hover(&r), "fn main()");
    }

    #[test]
    fn format_diagnostics_one_based_positions() {
        let diags = json!([{
            "range": { "start": { "line": 4, "character": 7 }, "end": { "line": 4, "character": 9 } },
            "message": "unused variable"
        }]);
        assert_eq!(
            format_diagnostics("/src/a.rs", &diags),
            "/src/a.rs:5:8: unused variable"
        );
    }

    #[test]
    fn format_symbols_nests_children() {
        let r = json!([{
            "name": "Outer",
            "range": { "start": { "line": 0, "character": 0 } },
            "children": [{
                "name": "inner",
                "range": { "start": { "line": 2, "character": 4 } }
            }]
        }]);
        assert_eq!(format_symbols(&r), "Outer (line 1)\n  inner (line 3)");
    }

    #[test]
    fn mutating_ops_are_annotated() {
        let bridge = LspBridge::new(vec!["true".into()], "/tmp");
        let rename = LspTool { bridge: Arc::clone(&bridge), op: LspOp::Rename };
        assert!(!rename.annotations().read_only);
        let hover = LspTool { bridge, op: LspOp::Hover };
        assert!(hover.annotations().read_only);
    }
}
