// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod builtin;
pub mod lsp;
pub mod registry;
pub mod sandbox;
pub mod tool;

pub use builtin::{
    AskUserTool, JobTable, MemoryTool, ShellTool, ShellToolSet, SwitchModelTool,
    UserPromptToolSet,
};
pub use registry::{
    ElicitationHandler, StaticToolSet, ToolRegistry, ToolSchema, ToolSet, ToolsChangedHandler,
};
pub use tool::{truncate_output, Tool, ToolAnnotations, ToolCall, ToolCallResult};
