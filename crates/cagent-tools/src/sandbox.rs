// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Container-backed command execution.
//!
//! The [`Runner`] trait is the pluggable seam; [`DockerRunner`] drives the
//! `docker` CLI: one long-lived idle container per runner instance, labeled
//! with the owning pid so a later process can reap containers whose owner
//! died.  Commands `exec` into the container with the working directory set
//! and only POSIX-identifier-named environment variables forwarded.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Label key identifying the process that owns a sandbox container.
const OWNER_LABEL: &str = "cagent.owner";

/// Output of one sandboxed command, mirroring the shell tool contract.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub output: String,
    pub exit_code: i32,
}

/// Executes commands inside an isolated environment.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(
        &self,
        cmd: &str,
        cwd: Option<&str>,
        timeout_secs: u64,
    ) -> anyhow::Result<RunOutput>;

    /// Tear down whatever the runner started.
    async fn shutdown(&self) -> anyhow::Result<()>;
}

/// A volume mount `host:container[:ro|rw]`; mode defaults to rw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: String,
    pub container: String,
    pub read_only: bool,
}

impl Mount {
    pub fn parse(spec: &str) -> anyhow::Result<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        match parts.as_slice() {
            [host, container] => Ok(Self {
                host: host.to_string(),
                container: container.to_string(),
                read_only: false,
            }),
            [host, container, mode] => {
                let read_only = match *mode {
                    "ro" => true,
                    "rw" => false,
                    other => bail!("invalid mount mode {other:?} in {spec:?}"),
                };
                Ok(Self {
                    host: host.to_string(),
                    container: container.to_string(),
                    read_only,
                })
            }
            _ => bail!("invalid mount spec {spec:?}, expected host:container[:ro|rw]"),
        }
    }

    fn docker_arg(&self) -> String {
        let mode = if self.read_only { "ro" } else { "rw" };
        format!("{}:{}:{}", self.host, self.container, mode)
    }
}

/// True for names matching `[A-Za-z_][A-Za-z0-9_]*`.  Anything else (shell
/// functions exported by bash, names with `%` or `.`) stays on the host.
pub fn is_posix_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub struct DockerRunner {
    image: String,
    mounts: Vec<Mount>,
    /// Container id once started; guarded so the first `run` wins the race.
    container: Mutex<Option<String>>,
}

impl DockerRunner {
    pub fn new(image: impl Into<String>, mounts: Vec<Mount>) -> Arc<Self> {
        Arc::new(Self {
            image: image.into(),
            mounts,
            container: Mutex::new(None),
        })
    }

    /// Remove containers labeled with an owner pid that is neither this
    /// process nor any running process.  Called once at host startup.
    pub async fn reap_stale_containers() -> anyhow::Result<()> {
        let out = Command::new("docker")
            .args([
                "ps",
                "-a",
                "--filter",
                &format!("label={OWNER_LABEL}"),
                "--format",
                "{{.ID}}\t{{.Label \"cagent.owner\"}}",
            ])
            .stdin(Stdio::null())
            .output()
            .await
            .context("docker ps failed")?;
        let text = String::from_utf8_lossy(&out.stdout);
        for line in text.lines() {
            let Some((id, pid_str)) = line.split_once('\t') else { continue };
            let Ok(pid) = pid_str.trim().parse::<u32>() else { continue };
            if pid == std::process::id() || process_is_running(pid) {
                continue;
            }
            debug!(container = id, owner_pid = pid, "reaping stale sandbox container");
            let _ = Command::new("docker")
                .args(["rm", "-f", id])
                .stdin(Stdio::null())
                .output()
                .await;
        }
        Ok(())
    }

    /// Start the idle container on first use and return its id.
    async fn ensure_container(&self) -> anyhow::Result<String> {
        let mut slot = self.container.lock().await;
        if let Some(id) = slot.as_ref() {
            return Ok(id.clone());
        }
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--label".into(),
            format!("{OWNER_LABEL}={}", std::process::id()),
        ];
        for m in &self.mounts {
            args.push("-v".into());
            args.push(m.docker_arg());
        }
        args.push(self.image.clone());
        // Idle process keeping the container alive between execs.
        args.extend(["tail".into(), "-f".into(), "/dev/null".into()]);

        debug!(image = %self.image, "starting sandbox container");
        let out = Command::new("docker")
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .context("docker run failed")?;
        if !out.status.success() {
            bail!(
                "docker run failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        let id = String::from_utf8_lossy(&out.stdout).trim().to_string();
        *slot = Some(id.clone());
        Ok(id)
    }
}

fn process_is_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // kill(pid, 0) probes existence without signaling.
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

#[async_trait]
impl Runner for DockerRunner {
    async fn run(
        &self,
        cmd: &str,
        cwd: Option<&str>,
        timeout_secs: u64,
    ) -> anyhow::Result<RunOutput> {
        let container = self.ensure_container().await?;
        let mut args: Vec<String> = vec!["exec".into()];
        if let Some(wd) = cwd {
            args.push("-w".into());
            args.push(wd.to_string());
        }
        for (name, value) in std::env::vars() {
            if is_posix_env_name(&name) {
                args.push("-e".into());
                args.push(format!("{name}={value}"));
            }
        }
        args.push(container);
        args.extend(["sh".into(), "-c".into(), cmd.to_string()]);

        let fut = Command::new("docker")
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let out = match tokio::time::timeout(
            std::time::Duration::from_secs(timeout_secs),
            fut,
        )
        .await
        {
            Ok(r) => r.context("docker exec failed")?,
            Err(_) => bail!("timeout after {timeout_secs}s"),
        };

        let exit_code = out.status.code().unwrap_or(-1);
        let output =
            crate::builtin::shell::combine_output(&out.stdout, &out.stderr, exit_code);
        Ok(RunOutput { output, exit_code })
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        let mut slot = self.container.lock().await;
        if let Some(id) = slot.take() {
            debug!(container = %id, "removing sandbox container");
            let out = Command::new("docker")
                .args(["rm", "-f", &id])
                .stdin(Stdio::null())
                .output()
                .await;
            if let Err(e) = out {
                warn!(error = %e, "failed to remove sandbox container");
            }
        }
        Ok(())
    }
}

/// Parse a list of mount specs, failing on the first invalid one.
pub fn parse_mounts(specs: &[String]) -> anyhow::Result<Vec<Mount>> {
    specs.iter().map(|s| Mount::parse(s)).collect()
}

/// Environment filtering used by `docker exec`, exposed for tests.
pub fn filter_env<'a>(
    vars: impl Iterator<Item = (&'a str, &'a str)>,
) -> HashMap<String, String> {
    vars.filter(|(k, _)| is_posix_env_name(k))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
