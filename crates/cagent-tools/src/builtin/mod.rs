// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod ask_user;
pub mod jobs;
pub mod memory;
pub mod shell;
pub mod switch_model;
pub mod tasks;

use std::sync::Arc;

use async_trait::async_trait;

use crate::registry::{ElicitationHandler, ToolSet};
use crate::sandbox::Runner;
use crate::tool::Tool;

pub use ask_user::AskUserTool;
pub use jobs::JobTable;
pub use memory::MemoryTool;
pub use shell::ShellTool;
pub use switch_model::SwitchModelTool;
pub use tasks::task_tools;

/// The shell toolset: the foreground shell tool plus the background-job
/// lifecycle tools over a shared job table.  Stopping the toolset tears
/// down every job.
pub struct ShellToolSet {
    timeout_secs: u64,
    runner: Option<Arc<dyn Runner>>,
    jobs: Arc<JobTable>,
}

impl ShellToolSet {
    pub fn new(timeout_secs: u64, runner: Option<Arc<dyn Runner>>) -> Self {
        Self { timeout_secs, runner, jobs: JobTable::new() }
    }
}

#[async_trait]
impl ToolSet for ShellToolSet {
    fn name(&self) -> &str {
        "shell"
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.jobs.stop_all().await;
        if let Some(runner) = &self.runner {
            runner.shutdown().await?;
        }
        Ok(())
    }

    async fn tools(&self) -> anyhow::Result<Vec<Arc<dyn Tool>>> {
        Ok(vec![
            Arc::new(ShellTool {
                timeout_secs: self.timeout_secs,
                runner: self.runner.clone(),
            }),
            Arc::new(jobs::RunBackgroundJobTool { table: Arc::clone(&self.jobs) }),
            Arc::new(jobs::ListBackgroundJobsTool { table: Arc::clone(&self.jobs) }),
            Arc::new(jobs::ViewBackgroundJobTool { table: Arc::clone(&self.jobs) }),
            Arc::new(jobs::StopBackgroundJobTool { table: Arc::clone(&self.jobs) }),
        ])
    }
}

/// The user-prompt toolset; the elicitation handler is wired by the embedder
/// through the registry.
pub struct UserPromptToolSet {
    tool: Arc<AskUserTool>,
}

impl Default for UserPromptToolSet {
    fn default() -> Self {
        Self { tool: Arc::new(AskUserTool::default()) }
    }
}

#[async_trait]
impl ToolSet for UserPromptToolSet {
    fn name(&self) -> &str {
        "user_prompt"
    }

    async fn tools(&self) -> anyhow::Result<Vec<Arc<dyn Tool>>> {
        Ok(vec![Arc::clone(&self.tool) as Arc<dyn Tool>])
    }

    fn set_elicitation_handler(&self, handler: ElicitationHandler) {
        self.tool.set_handler(handler);
    }
}
