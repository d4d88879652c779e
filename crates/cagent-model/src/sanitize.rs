// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! JSON-Schema normalization applied to every tool schema before it is sent
//! to a provider.
//!
//! Providers reject tool definitions whose parameter schema is missing a
//! `type`.  MCP servers and hand-written tools are sloppy about this, so the
//! rules are: a nil schema becomes `{"type":"object","properties":{}}`; a
//! schema without `type` gets `type: "object"` and an empty `properties`
//! map; the defaulting recurses through `properties` values and `items`.

use serde_json::{json, Map, Value};

/// Normalize a tool parameter schema in place and return it.
pub fn normalize_schema(schema: Option<Value>) -> Value {
    let mut v = match schema {
        None | Some(Value::Null) => return json!({ "type": "object", "properties": {} }),
        Some(v) => v,
    };
    normalize_node(&mut v, true);
    v
}

fn normalize_node(v: &mut Value, is_root: bool) {
    let obj = match v {
        Value::Object(m) => m,
        // A non-object where a schema is expected: replace outright.
        other => {
            *other = json!({ "type": "object", "properties": {} });
            return;
        }
    };

    if !obj.contains_key("type") {
        // Root schemas and property values default to object; ensure the
        // properties map exists so providers see a complete definition.
        obj.insert("type".into(), Value::String("object".into()));
        if !obj.contains_key("properties") {
            obj.insert("properties".into(), Value::Object(Map::new()));
        }
    } else if is_root && obj.get("type") == Some(&Value::String("object".into()))
        && !obj.contains_key("properties")
    {
        obj.insert("properties".into(), Value::Object(Map::new()));
    }

    if let Some(Value::Object(props)) = obj.get_mut("properties") {
        for (_, prop) in props.iter_mut() {
            normalize_node(prop, false);
        }
    }
    if let Some(items) = obj.get_mut("items") {
        normalize_node(items, false);
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
