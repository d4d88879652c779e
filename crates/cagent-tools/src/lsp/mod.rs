// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod client;
mod edits;
mod tools;

pub use client::LspClient;
pub use edits::{apply_text_edits, from_lsp_position, to_lsp_position, Position, Range, TextEdit};
pub use tools::LspToolSet;
