// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Background shell jobs.
//!
//! `run_background_job` starts a command in its own process group and pumps
//! combined stdout/stderr into a per-job ring buffer capped at 10 MB, so a
//! chatty server cannot grow memory without bound.  Jobs outlive individual
//! tool calls and are torn down when the shell toolset stops.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::shell::{kill_process_group, shell_command};
use crate::tool::{Tool, ToolAnnotations, ToolCall, ToolCallResult};

/// Per-job output cap.
const RING_CAPACITY: usize = 10 * 1024 * 1024;

/// Fixed-capacity byte ring: once full, the oldest bytes fall off the front.
pub(crate) struct RingBuffer {
    data: VecDeque<u8>,
    capacity: usize,
    /// Total bytes ever written, including evicted ones.
    total: u64,
}

impl RingBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self { data: VecDeque::new(), capacity, total: 0 }
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.total += bytes.len() as u64;
        if bytes.len() >= self.capacity {
            self.data.clear();
            self.data.extend(&bytes[bytes.len() - self.capacity..]);
            return;
        }
        let overflow = (self.data.len() + bytes.len()).saturating_sub(self.capacity);
        self.data.drain(..overflow);
        self.data.extend(bytes);
    }

    pub(crate) fn snapshot(&self) -> String {
        String::from_utf8_lossy(&self.data.iter().copied().collect::<Vec<u8>>()).into_owned()
    }

    pub(crate) fn total_written(&self) -> u64 {
        self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobStatus {
    Running,
    Exited(i32),
    Stopped,
}

impl JobStatus {
    fn label(&self) -> String {
        match self {
            Self::Running => "running".into(),
            Self::Exited(code) => format!("exited ({code})"),
            Self::Stopped => "stopped".into(),
        }
    }
}

struct Job {
    id: u64,
    command: String,
    pid: u32,
    buffer: Arc<Mutex<RingBuffer>>,
    status: Arc<Mutex<JobStatus>>,
}

/// Shared registry of background jobs owned by the shell toolset.
#[derive(Default)]
pub struct JobTable {
    jobs: Mutex<HashMap<u64, Job>>,
    next_id: AtomicU64,
}

impl JobTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { jobs: Mutex::new(HashMap::new()), next_id: AtomicU64::new(1) })
    }

    async fn spawn(&self, cmd: &str, cwd: Option<&str>) -> anyhow::Result<u64> {
        let mut command = shell_command(cmd, cwd);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        let mut child = command.spawn()?;
        let pid = child.id().unwrap_or(0);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let buffer = Arc::new(Mutex::new(RingBuffer::new(RING_CAPACITY)));
        let status = Arc::new(Mutex::new(JobStatus::Running));

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        // One pump task per job: drain both pipes into the ring, then reap.
        {
            let buffer = Arc::clone(&buffer);
            let status = Arc::clone(&status);
            tokio::spawn(async move {
                let mut out_buf = [0u8; 8192];
                let mut err_buf = [0u8; 8192];
                let mut out_open = stdout.is_some();
                let mut err_open = stderr.is_some();
                while out_open || err_open {
                    tokio::select! {
                        r = async {
                            match stdout.as_mut() {
                                Some(s) => s.read(&mut out_buf).await,
                                None => Ok(0),
                            }
                        }, if out_open => match r {
                            Ok(0) | Err(_) => out_open = false,
                            Ok(n) => buffer.lock().await.push(&out_buf[..n]),
                        },
                        r = async {
                            match stderr.as_mut() {
                                Some(s) => s.read(&mut err_buf).await,
                                None => Ok(0),
                            }
                        }, if err_open => match r {
                            Ok(0) | Err(_) => err_open = false,
                            Ok(n) => buffer.lock().await.push(&err_buf[..n]),
                        },
                    }
                }
                let code = child
                    .wait()
                    .await
                    .ok()
                    .and_then(|s| s.code())
                    .unwrap_or(-1);
                let mut st = status.lock().await;
                if *st == JobStatus::Running {
                    *st = JobStatus::Exited(code);
                }
            });
        }

        debug!(id, pid, cmd = %cmd, "background job started");
        self.jobs.lock().await.insert(
            id,
            Job { id, command: cmd.to_string(), pid, buffer, status },
        );
        Ok(id)
    }

    async fn stop_job(&self, id: u64) -> Option<()> {
        let jobs = self.jobs.lock().await;
        let job = jobs.get(&id)?;
        *job.status.lock().await = JobStatus::Stopped;
        if job.pid != 0 {
            kill_process_group(job.pid).await;
        }
        Some(())
    }

    /// Terminate every job; called on toolset shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<u64> = self.jobs.lock().await.keys().copied().collect();
        for id in ids {
            let _ = self.stop_job(id).await;
        }
    }
}

pub struct RunBackgroundJobTool {
    pub table: Arc<JobTable>,
}

#[async_trait]
impl Tool for RunBackgroundJobTool {
    fn name(&self) -> &str {
        "run_background_job"
    }
    fn description(&self) -> &str {
        "Start a long-running shell command in the background and return a job id.\n\
         Use view_background_job to read its output and stop_background_job to\n\
         terminate it. Output is kept in a 10 MB ring buffer per job."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "cmd": { "type": "string", "description": "The shell command to run" },
                "cwd": { "type": "string", "description": "Working directory (optional)" }
            },
            "required": ["cmd"],
            "additionalProperties": false
        })
    }
    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations::destructive("Start background job")
    }

    async fn execute(&self, call: &ToolCall) -> ToolCallResult {
        let cmd = match call.args.get("cmd").and_then(|v| v.as_str()) {
            Some(c) => c,
            None => return ToolCallResult::err(&call.id, "missing required parameter: cmd"),
        };
        let cwd = call.args.get("cwd").and_then(|v| v.as_str());
        match self.table.spawn(cmd, cwd).await {
            Ok(id) => ToolCallResult::ok(&call.id, format!("started background job {id}")),
            Err(e) => ToolCallResult::err(&call.id, format!("spawn error: {e}")),
        }
    }
}

pub struct ListBackgroundJobsTool {
    pub table: Arc<JobTable>,
}

#[async_trait]
impl Tool for ListBackgroundJobsTool {
    fn name(&self) -> &str {
        "list_background_jobs"
    }
    fn description(&self) -> &str {
        "List all background jobs with their id, status, and command."
    }
    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {}, "additionalProperties": false })
    }
    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations::read_only("List background jobs")
    }

    async fn execute(&self, call: &ToolCall) -> ToolCallResult {
        let jobs = self.table.jobs.lock().await;
        if jobs.is_empty() {
            return ToolCallResult::ok(&call.id, "no background jobs");
        }
        let mut rows: Vec<(u64, String)> = Vec::with_capacity(jobs.len());
        for job in jobs.values() {
            let status = job.status.lock().await.label();
            rows.push((job.id, format!("[{}] {} — {}", job.id, status, job.command)));
        }
        rows.sort_by_key(|(id, _)| *id);
        let lines: Vec<String> = rows.into_iter().map(|(_, l)| l).collect();
        ToolCallResult::ok(&call.id, lines.join("\n"))
    }
}

pub struct ViewBackgroundJobTool {
    pub table: Arc<JobTable>,
}

#[async_trait]
impl Tool for ViewBackgroundJobTool {
    fn name(&self) -> &str {
        "view_background_job"
    }
    fn description(&self) -> &str {
        "Show the captured output of a background job. Output older than the\n\
         10 MB ring buffer has been discarded."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "integer", "description": "The job id" }
            },
            "required": ["id"],
            "additionalProperties": false
        })
    }
    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations::read_only("View background job")
    }

    async fn execute(&self, call: &ToolCall) -> ToolCallResult {
        let id = match call.args.get("id").and_then(|v| v.as_u64()) {
            Some(i) => i,
            None => return ToolCallResult::err(&call.id, "missing required parameter: id"),
        };
        let jobs = self.table.jobs.lock().await;
        let Some(job) = jobs.get(&id) else {
            return ToolCallResult::err(&call.id, format!("no such job: {id}"));
        };
        let status = job.status.lock().await.label();
        let buf = job.buffer.lock().await;
        let output = buf.snapshot();
        let header = format!("job {id} ({status}), {} bytes captured\n", buf.total_written());
        if output.is_empty() {
            ToolCallResult::ok(&call.id, format!("{header}(no output yet)"))
        } else {
            ToolCallResult::ok(&call.id, format!("{header}{output}"))
        }
    }
}

pub struct StopBackgroundJobTool {
    pub table: Arc<JobTable>,
}

#[async_trait]
impl Tool for StopBackgroundJobTool {
    fn name(&self) -> &str {
        "stop_background_job"
    }
    fn description(&self) -> &str {
        "Terminate a background job and its whole process group."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "integer", "description": "The job id" }
            },
            "required": ["id"],
            "additionalProperties": false
        })
    }
    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations::destructive("Stop background job")
    }

    async fn execute(&self, call: &ToolCall) -> ToolCallResult {
        let id = match call.args.get("id").and_then(|v| v.as_u64()) {
            Some(i) => i,
            None => return ToolCallResult::err(&call.id, "missing required parameter: id"),
        };
        match self.table.stop_job(id).await {
            Some(()) => ToolCallResult::ok(&call.id, format!("stopped job {id}")),
            None => ToolCallResult::err(&call.id, format!("no such job: {id}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
