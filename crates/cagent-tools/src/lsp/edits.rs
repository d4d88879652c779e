// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Text-edit application for LSP results.
//!
//! Tool arguments use 1-based line/column; the wire uses 0-based positions
//! counted in UTF-16 code units.  Edits are applied back-to-front (end line
//! desc, end char desc) so earlier offsets stay valid while later spans are
//! replaced.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextEdit {
    pub range: Range,
    #[serde(rename = "newText")]
    pub new_text: String,
}

/// 1-based tool coordinates → 0-based wire position.
pub fn to_lsp_position(line: u32, column: u32) -> Position {
    Position {
        line: line.saturating_sub(1),
        character: column.saturating_sub(1),
    }
}

/// 0-based wire position → 1-based tool coordinates.
pub fn from_lsp_position(pos: Position) -> (u32, u32) {
    (pos.line + 1, pos.character + 1)
}

/// Byte offset of `pos` in `text`, interpreting `character` as UTF-16 code
/// units per the protocol.  Positions past the end of a line clamp to the
/// line end; lines past the end clamp to the end of the text.
fn byte_offset(text: &str, pos: Position) -> usize {
    let mut line = 0u32;
    let mut offset = 0usize;
    for l in text.split_inclusive('\n') {
        if line == pos.line {
            let body = l.strip_suffix('\n').unwrap_or(l);
            let mut units = 0u32;
            for (i, c) in body.char_indices() {
                if units >= pos.character {
                    return offset + i;
                }
                units += c.len_utf16() as u32;
            }
            return offset + body.len();
        }
        offset += l.len();
        line += 1;
    }
    text.len()
}

/// Apply `edits` to `content`, back to front.  An empty edit list returns
/// the content unchanged, so application is idempotent over `[]`.
pub fn apply_text_edits(content: &str, edits: &[TextEdit]) -> String {
    let mut sorted: Vec<&TextEdit> = edits.iter().collect();
    sorted.sort_by(|a, b| {
        (b.range.end.line, b.range.end.character).cmp(&(a.range.end.line, a.range.end.character))
    });

    let mut result = content.to_string();
    for edit in sorted {
        let start = byte_offset(&result, edit.range.start);
        let end = byte_offset(&result, edit.range.end).max(start);
        result.replace_range(start..end, &edit.new_text);
    }
    result
}

/// Atomically replace `path` with `content` (temp file + rename).
pub async fn write_file_atomic(path: &str, content: &str) -> anyhow::Result<()> {
    let tmp = format!("{path}.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn edit(sl: u32, sc: u32, el: u32, ec: u32, text: &str) -> TextEdit {
        TextEdit {
            range: Range {
                start: Position { line: sl, character: sc },
                end: Position { line: el, character: ec },
            },
            new_text: text.to_string(),
        }
    }

    #[test]
    fn coordinate_translation_round_trips() {
        let p = to_lsp_position(10, 4);
        assert_eq!(p, Position { line: 9, character: 3 });
        assert_eq!(from_lsp_position(p), (10, 4));
    }

    #[test]
    fn single_edit_replaces_span() {
        let out = apply_text_edits("hello world\n", &[edit(0, 6, 0, 11, "there")]);
        assert_eq!(out, "hello there\n");
    }

    #[test]
    fn insertion_at_empty_range() {
        let out = apply_text_edits("ab\n", &[edit(0, 1, 0, 1, "X")]);
        assert_eq!(out, "aXb\n");
    }

    #[test]
    fn multiple_edits_apply_back_to_front() {
        // Both edits are valid against the ORIGINAL text; back-to-front
        // application keeps the first edit's offsets stable.
        let src = "aaa bbb ccc\n";
        let out = apply_text_edits(src, &[edit(0, 0, 0, 3, "XX"), edit(0, 8, 0, 11, "YY")]);
        assert_eq!(out, "XX bbb YY\n");
    }

    #[test]
    fn multiline_edit() {
        let src = "line one\nline two\nline three\n";
        let out = apply_text_edits(src, &[edit(0, 5, 2, 5, "…")]);
        assert_eq!(out, "line …three\n");
    }

    #[test]
    fn utf16_characters_count_as_units() {
        // '𝕏' is one char but two UTF-16 code units; character 3 lands after it.
        let src = "a𝕏b\n";
        let out = apply_text_edits(src, &[edit(0, 3, 0, 4, "Z")]);
        assert_eq!(out, "a𝕏Z\n");
    }

    #[test]
    fn position_past_line_end_clamps() {
        let out = apply_text_edits("ab\ncd\n", &[edit(0, 99, 0, 120, "X")]);
        assert_eq!(out, "abX\ncd\n");
    }

    #[test]
    fn empty_edit_list_is_identity() {
        let src = "unchanged\n";
        let once = apply_text_edits(src, &[edit(0, 0, 0, 9, "changed!!")]);
        let twice = apply_text_edits(&once, &[]);
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        let p = path.to_string_lossy().into_owned();
        tokio::fs::write(&path, "old").await.unwrap();
        write_file_atomic(&p, "new").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
        assert!(!dir.path().join("f.txt.tmp").exists());
    }
}
