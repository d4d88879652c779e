// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Stdio framing: `Content-Length: N\r\n\r\n<N-byte JSON body>`.
//!
//! Header names are matched case-insensitively and unknown headers are
//! skipped, matching what language servers and MCP servers emit in the wild.

use anyhow::Context;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame; anything larger indicates a corrupt
/// stream rather than a legitimate message.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Read one framed JSON message.  Returns `None` on clean EOF at a frame
/// boundary.
pub async fn read_frame<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
) -> anyhow::Result<Option<Value>> {
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            if saw_header {
                anyhow::bail!("connection closed mid-frame");
            }
            return Ok(None);
        }
        saw_header = true;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = Some(value.trim().parse().context("bad Content-Length")?);
            }
        }
    }
    let len = content_length.context("frame without Content-Length header")?;
    anyhow::ensure!(len <= MAX_FRAME_BYTES, "frame of {len} bytes exceeds limit");
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body).context("frame body is not JSON")?))
}

/// Write one framed JSON message and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Value,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(msg)?;
    writer
        .write_all(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes())
        .await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::BufReader;

    async fn round_trip(msgs: &[Value]) -> Vec<Value> {
        let mut buf = Vec::new();
        for m in msgs {
            write_frame(&mut buf, m).await.unwrap();
        }
        let mut reader = BufReader::new(&buf[..]);
        let mut out = Vec::new();
        while let Some(m) = read_frame(&mut reader).await.unwrap() {
            out.push(m);
        }
        out
    }

    #[tokio::test]
    async fn single_message_round_trips() {
        let msg = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});
        let out = round_trip(&[msg.clone()]).await;
        assert_eq!(out, vec![msg]);
    }

    #[tokio::test]
    async fn multiple_messages_round_trip_in_order() {
        let msgs = vec![
            json!({"id": 1}),
            json!({"id": 2, "result": {"tools": []}}),
            json!({"method": "notifications/initialized"}),
        ];
        assert_eq!(round_trip(&msgs).await, msgs);
    }

    #[tokio::test]
    async fn unicode_body_length_is_byte_accurate() {
        let msg = json!({"text": "héllo — ünïcode 𝕏"});
        assert_eq!(round_trip(&[msg.clone()]).await, vec![msg]);
    }

    #[tokio::test]
    async fn extra_headers_are_skipped() {
        let body = r#"{"id":5}"#;
        let framed = format!(
            "Content-Length: {}\r\nContent-Type: application/vscode-jsonrpc; charset=utf-8\r\n\r\n{body}",
            body.len()
        );
        let mut reader = BufReader::new(framed.as_bytes());
        let msg = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(msg["id"], 5);
    }

    #[tokio::test]
    async fn header_name_is_case_insensitive() {
        let body = r#"{"id":6}"#;
        let framed = format!("content-length: {}\r\n\r\n{body}", body.len());
        let mut reader = BufReader::new(framed.as_bytes());
        let msg = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(msg["id"], 6);
    }

    #[tokio::test]
    async fn eof_at_boundary_is_none() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_frame_is_error() {
        let framed = "Content-Length: 100\r\n\r\n{\"id\":1}";
        let mut reader = BufReader::new(framed.as_bytes());
        assert!(read_frame(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn missing_content_length_is_error() {
        let framed = "X-Whatever: 1\r\n\r\n{}";
        let mut reader = BufReader::new(framed.as_bytes());
        assert!(read_frame(&mut reader).await.is_err());
    }
}
