// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
#[cfg(unix)]
use libc;
use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

use crate::sandbox::Runner;
use crate::tool::{Tool, ToolAnnotations, ToolCall, ToolCallResult};

/// Built-in tool that runs a command through the user's shell.
pub struct ShellTool {
    pub timeout_secs: u64,
    /// When set, commands execute inside the sandbox container instead of
    /// on the host.
    pub runner: Option<Arc<dyn Runner>>,
}

impl Default for ShellTool {
    fn default() -> Self {
        Self { timeout_secs: 30, runner: None }
    }
}

/// The shell used for `-c` execution: `$SHELL` when set, `/bin/sh` otherwise.
pub(crate) fn user_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".into())
}

/// Build a `Command` for `cmd` in its own process group, detached from the
/// controlling terminal.  The group makes timeout/stop kill the whole tree,
/// not just the immediate child.
pub(crate) fn shell_command(cmd: &str, cwd: Option<&str>) -> Command {
    #[cfg(unix)]
    let mut c = {
        let mut c = Command::new(user_shell());
        c.arg("-c").arg(cmd);
        // setsid() gives the child a fresh session and process group with no
        // controlling terminal; open("/dev/tty") fails with ENXIO.
        unsafe {
            c.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
        c
    };
    #[cfg(windows)]
    let mut c = {
        let mut c = Command::new("cmd.exe");
        c.arg("/C").arg(cmd);
        c
    };
    c.stdin(Stdio::null());
    c.kill_on_drop(true);
    if let Some(wd) = cwd {
        c.current_dir(wd);
    }
    c
}

/// Terminate the process group of `pid`: SIGTERM first, escalating to
/// SIGKILL after a short grace period.
#[cfg(unix)]
pub(crate) async fn kill_process_group(pid: u32) {
    unsafe {
        libc::killpg(pid as i32, libc::SIGTERM);
    }
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    unsafe {
        libc::killpg(pid as i32, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
pub(crate) async fn kill_process_group(_pid: u32) {}

/// Combine captured stdout and stderr into a single model-facing string.
pub(crate) fn combine_output(stdout: &[u8], stderr: &[u8], exit_code: i32) -> String {
    let mut content = String::new();
    let out = String::from_utf8_lossy(stdout);
    let err = String::from_utf8_lossy(stderr);
    if !out.is_empty() {
        content.push_str(&out);
    }
    if !err.is_empty() {
        if !content.is_empty() {
            content.push('\n');
        }
        content.push_str("[stderr]\n");
        content.push_str(&err);
    }
    if content.is_empty() {
        content = format!("[exit {exit_code}]");
    }
    content
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return stdout + stderr.\n\
         'cmd' is required; 'cwd' sets the working directory; 'timeout' is in\n\
         seconds (default 30). The command runs in its own process group and\n\
         the whole group is terminated on timeout.\n\
         Prefer non-interactive commands. Avoid commands that require a TTY.\n\
         For long-running work use run_background_job instead."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "cmd": {
                    "type": "string",
                    "description": "The shell command to execute."
                },
                "cwd": {
                    "type": "string",
                    "description": "Working directory (optional, defaults to the session working dir)"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Execution timeout in seconds (optional, default 30)"
                }
            },
            "required": ["cmd"],
            "additionalProperties": false
        })
    }

    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations::destructive("Run shell command")
    }

    async fn execute(&self, call: &ToolCall) -> ToolCallResult {
        let cmd = match call.args.get("cmd").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => return ToolCallResult::err(&call.id, "missing required parameter: cmd"),
        };
        let cwd = call.args.get("cwd").and_then(|v| v.as_str()).map(str::to_string);
        let timeout = call
            .args
            .get("timeout")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.timeout_secs);

        debug!(cmd = %cmd, timeout, "executing shell tool");

        if let Some(runner) = &self.runner {
            return match runner.run(&cmd, cwd.as_deref(), timeout).await {
                Ok(out) => {
                    if out.exit_code == 0 {
                        ToolCallResult::ok(&call.id, out.output)
                    } else {
                        ToolCallResult::err(
                            &call.id,
                            format!("[exit {}]\n{}", out.exit_code, out.output),
                        )
                    }
                }
                Err(e) => ToolCallResult::err(&call.id, format!("sandbox error: {e}")),
            };
        }

        let mut command = shell_command(&cmd, cwd.as_deref());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(c) => c,
            Err(e) => return ToolCallResult::err(&call.id, format!("spawn error: {e}")),
        };
        let pid = child.id().unwrap_or(0);

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(timeout),
            child.wait_with_output(),
        )
        .await;

        match result {
            Ok(Ok(output)) => {
                let code = output.status.code().unwrap_or(-1);
                let content = combine_output(&output.stdout, &output.stderr, code);
                if code == 0 {
                    ToolCallResult::ok(&call.id, content)
                } else if code == 1 {
                    // Exit code 1 is the Unix convention for "no matches"
                    // (grep/rg) and "condition false" (test); not a hard
                    // failure.  Include the code for transparency.
                    ToolCallResult::ok(&call.id, format!("[exit 1]\n{content}"))
                } else {
                    ToolCallResult::err(&call.id, format!("[exit {code}]\n{content}"))
                }
            }
            Ok(Err(e)) => ToolCallResult::err(&call.id, format!("wait error: {e}")),
            Err(_) => {
                if pid != 0 {
                    kill_process_group(pid).await;
                }
                ToolCallResult::err(&call.id, format!("timeout after {timeout}s"))
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tool::{Tool, ToolCall};

    fn call(id: &str, args: serde_json::Value) -> ToolCall {
        ToolCall { id: id.into(), name: "shell".into(), args }
    }

    #[tokio::test]
    async fn executes_echo_and_returns_stdout() {
        let t = ShellTool::default();
        let out = t.execute(&call("1", json!({"cmd": "echo hello"}))).await;
        assert!(!out.is_error, "{}", out.output);
        assert!(out.output.contains("hello"));
    }

    #[tokio::test]
    async fn stdout_and_stderr_both_captured() {
        let t = ShellTool::default();
        let out = t
            .execute(&call("1", json!({"cmd": "echo out && echo err >&2"})))
            .await;
        assert!(out.output.contains("out"));
        assert!(out.output.contains("err"));
        assert!(out.output.contains("[stderr]"));
    }

    #[tokio::test]
    async fn cwd_changes_working_directory() {
        let t = ShellTool::default();
        let out = t
            .execute(&call("1", json!({"cmd": "pwd", "cwd": "/tmp"})))
            .await;
        assert!(!out.is_error);
        assert!(out.output.contains("/tmp") || out.output.trim().ends_with("tmp"));
    }

    #[tokio::test]
    async fn exit_1_is_not_error_but_includes_code() {
        let t = ShellTool::default();
        let out = t.execute(&call("1", json!({"cmd": "exit 1"}))).await;
        assert!(!out.is_error, "exit 1 should not set is_error");
        assert!(out.output.contains("[exit 1]"));
    }

    #[tokio::test]
    async fn exit_2_is_error() {
        let t = ShellTool::default();
        let out = t.execute(&call("1", json!({"cmd": "exit 2"}))).await;
        assert!(out.is_error);
        assert!(out.output.contains("[exit 2]"));
    }

    #[tokio::test]
    async fn missing_cmd_argument_is_error() {
        let t = ShellTool::default();
        let out = t.execute(&call("1", json!({}))).await;
        assert!(out.is_error);
        assert!(out.output.contains("cmd"));
    }

    #[tokio::test]
    async fn timeout_returns_error_and_kills_group() {
        let t = ShellTool { timeout_secs: 1, runner: None };
        let out = t
            .execute(&call("1", json!({"cmd": "sleep 60", "timeout": 1})))
            .await;
        assert!(out.is_error);
        assert!(out.output.contains("timeout"));
    }

    #[test]
    fn combine_output_empty_shows_exit_code() {
        assert_eq!(combine_output(b"", b"", 3), "[exit 3]");
    }

    #[test]
    fn schema_requires_cmd() {
        let t = ShellTool::default();
        let schema = t.parameters_schema();
        let required = schema["required"].as_array().unwrap();
        assert!(required.iter().any(|v| v.as_str() == Some("cmd")));
    }
}
