// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Provider file-upload cache.
//!
//! When the Files API is enabled, local file parts are uploaded once and
//! referenced by id afterwards.  The cache is one of the three sanctioned
//! process-wide singletons: a map from absolute path to `{file_id,
//! uploaded_at}` with a 2-hour TTL and time-based eviction only.  An upload
//! that completes after its run was cancelled still populates the cache so
//! the next run gets the hit.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use anyhow::Context;
use serde_json::Value;

/// Server-side file references expire after this long.
const FILE_TTL: Duration = Duration::from_secs(2 * 60 * 60);

struct CachedFile {
    file_id: String,
    uploaded_at: Instant,
}

fn cache() -> &'static Mutex<HashMap<String, CachedFile>> {
    static CACHE: OnceLock<Mutex<HashMap<String, CachedFile>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Look up a fresh cached file id for `path`, or upload and cache it.
pub async fn reference_or_upload(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    path: &str,
) -> anyhow::Result<String> {
    let abs = std::path::Path::new(path)
        .canonicalize()
        .with_context(|| format!("resolving {path}"))?
        .to_string_lossy()
        .into_owned();

    if let Some(id) = lookup(&abs) {
        return Ok(id);
    }

    let bytes = tokio::fs::read(&abs)
        .await
        .with_context(|| format!("reading {abs}"))?;
    let file_name = std::path::Path::new(&abs)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".into());
    let mime = crate::types::mime_from_path(&abs).to_string();

    let part = reqwest::multipart::Part::bytes(bytes)
        .file_name(file_name)
        .mime_str(&mime)
        .context("building multipart body")?;
    let form = reqwest::multipart::Form::new().part("file", part);

    let resp = client
        .post(format!("{base_url}/v1/files"))
        .header("x-api-key", api_key)
        .header("anthropic-version", "2023-06-01")
        .header("anthropic-beta", "files-api-2025-04-14")
        .multipart(form)
        .send()
        .await
        .context("file upload failed")?;
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        anyhow::bail!("file upload error {status}: {text}");
    }
    let v: Value = resp.json().await.context("decoding file upload response")?;
    let file_id = v["id"]
        .as_str()
        .context("file upload response missing id")?
        .to_string();

    insert(&abs, &file_id);
    Ok(file_id)
}

fn lookup(abs: &str) -> Option<String> {
    let map = cache().lock().unwrap();
    map.get(abs)
        .filter(|c| c.uploaded_at.elapsed() < FILE_TTL)
        .map(|c| c.file_id.clone())
}

fn insert(abs: &str, file_id: &str) {
    let mut map = cache().lock().unwrap();
    // Opportunistic sweep of expired entries; eviction is time-based only.
    map.retain(|_, c| c.uploaded_at.elapsed() < FILE_TTL);
    map.insert(
        abs.to_string(),
        CachedFile { file_id: file_id.to_string(), uploaded_at: Instant::now() },
    );
}
