//! Docker/Podman implementation of [`ContainerRuntimeAdapter`].
//!
//! Shells out to the `docker`/`podman` CLI rather than talking to the
//! daemon socket directly, following the teacher's `docker_backend.rs` and
//! `backend/docker.rs`. Every call runs through `tokio::process::Command`
//! instead of the teacher's synchronous `std::process::Command`, because
//! every container-runtime RPC is a suspension point here (spec.md §5).

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    ContainerCreateSpec, ContainerRuntimeAdapter, ContainerRuntimeKind, ContainerStats,
    ContainerSummary, ExecOutcome, RuntimeEvent, RuntimeState, RuntimeStatus,
};
use crate::error::{Error, Result};

/// Check whether a given CLI (`docker` or `podman`) is present and can reach
/// its daemon.
pub fn cli_available(kind: ContainerRuntimeKind) -> bool {
    std::process::Command::new(kind.cmd())
        .arg("version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Docker/Podman-backed adapter. Stateless beyond which CLI to invoke;
/// all sandbox state lives in the orchestrator's registry, keyed by the
/// `runtime_id` this adapter hands back from `create`.
pub struct DockerRuntimeAdapter {
    runtime: ContainerRuntimeKind,
}

impl DockerRuntimeAdapter {
    pub fn new(runtime: ContainerRuntimeKind) -> Self {
        Self { runtime }
    }

    /// Construct an adapter using whichever runtime is detected, defaulting
    /// to Docker if neither responds (the first real call will then surface
    /// a `Runtime` error).
    pub fn detect() -> Self {
        Self::new(super::detect_container_runtime().unwrap_or(ContainerRuntimeKind::Docker))
    }

    fn cmd(&self) -> Command {
        Command::new(self.runtime.cmd())
    }

    async fn run(&self, args: &[String]) -> Result<std::process::Output> {
        debug!(cmd = %self.runtime, args = ?args, "running container CLI command");
        self.cmd()
            .args(args)
            .output()
            .await
            .map_err(|e| Error::runtime(format!("failed to run {}: {e}", self.runtime.cmd())))
    }

    fn check(output: &std::process::Output, what: &str) -> Result<()> {
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such container") {
            return Err(Error::not_found(stderr.trim().to_string()));
        }
        if stderr.contains("already in use") || stderr.contains("is already") {
            return Err(Error::conflict(stderr.trim().to_string()));
        }
        Err(Error::runtime(format!("{what}: {}", stderr.trim())))
    }
}

#[async_trait]
impl ContainerRuntimeAdapter for DockerRuntimeAdapter {
    async fn create(&self, spec: &ContainerCreateSpec) -> Result<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--hostname".to_string(),
            "agentpod".to_string(),
            format!("--cpus={}", spec.cpus),
            format!("--memory={}m", spec.memory_mb),
            "--network".to_string(),
            spec.network.clone(),
        ];

        for v in &spec.volumes {
            let mode = if v.read_only { "ro" } else { "rw" };
            args.push("-v".to_string());
            args.push(format!("{}:{}:{}", v.host_path, v.container_path, mode));
        }

        for (k, v) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{k}={v}"));
        }

        let mut labels: Vec<_> = spec.labels.iter().collect();
        labels.sort_by_key(|(k, _)| k.clone());
        for (k, v) in labels {
            args.push("--label".to_string());
            args.push(format!("{k}={v}"));
        }

        if let Some(ref wd) = spec.working_dir {
            args.push("-w".to_string());
            args.push(wd.clone());
        }

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());

        let output = self.run(&args).await?;
        Self::check(&output, "create failed")?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn start(&self, runtime_id: &str) -> Result<()> {
        let output = self.run(&["start".to_string(), runtime_id.to_string()]).await?;
        Self::check(&output, "start failed")
    }

    async fn stop(&self, runtime_id: &str, grace: Duration) -> Result<()> {
        let output = self
            .run(&[
                "stop".to_string(),
                "-t".to_string(),
                grace.as_secs().to_string(),
                runtime_id.to_string(),
            ])
            .await?;
        Self::check(&output, "stop failed")
    }

    async fn remove(&self, runtime_id: &str, remove_volumes: bool) -> Result<()> {
        let mut args = vec!["rm".to_string(), "-f".to_string()];
        if remove_volumes {
            args.push("-v".to_string());
        }
        args.push(runtime_id.to_string());
        let output = self.run(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such container") {
                // Delete is idempotent on NotFound per spec.md §4.7.
                return Ok(());
            }
            return Err(Error::runtime(format!("remove failed: {}", stderr.trim())));
        }
        Ok(())
    }

    async fn pause(&self, runtime_id: &str) -> Result<()> {
        let output = self.run(&["pause".to_string(), runtime_id.to_string()]).await?;
        Self::check(&output, "pause failed")
    }

    async fn unpause(&self, runtime_id: &str) -> Result<()> {
        let output = self.run(&["unpause".to_string(), runtime_id.to_string()]).await?;
        Self::check(&output, "unpause failed")
    }

    async fn inspect(&self, runtime_id: &str) -> Result<RuntimeState> {
        let output = self
            .run(&[
                "inspect".to_string(),
                "--format".to_string(),
                "{{json .State}}".to_string(),
                runtime_id.to_string(),
            ])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such") {
                return Err(Error::not_found(runtime_id));
            }
            return Err(Error::runtime(format!("inspect failed: {}", stderr.trim())));
        }

        #[derive(Deserialize)]
        struct DockerState {
            #[serde(default)]
            #[allow(dead_code)]
            status: String,
            running: bool,
            paused: bool,
            #[serde(rename = "ExitCode", default)]
            exit_code: i32,
            #[serde(rename = "StartedAt", default)]
            started_at: String,
        }

        let raw = String::from_utf8_lossy(&output.stdout);
        let state: DockerState = serde_json::from_str(raw.trim())
            .map_err(|e| Error::runtime(format!("failed to parse inspect output: {e}")))?;

        let status = if state.paused {
            RuntimeStatus::Paused
        } else if state.running {
            RuntimeStatus::Running
        } else if !state.started_at.is_empty() {
            RuntimeStatus::Exited
        } else {
            RuntimeStatus::Created
        };

        let started_at = chrono::DateTime::parse_from_rfc3339(&state.started_at)
            .ok()
            .map(|dt| dt.with_timezone(&Utc));

        Ok(RuntimeState {
            status,
            exit_code: if status == RuntimeStatus::Exited {
                Some(state.exit_code)
            } else {
                None
            },
            started_at,
        })
    }

    async fn exec(
        &self,
        runtime_id: &str,
        argv: &[String],
        env: &HashMap<String, String>,
        work_dir: Option<&str>,
    ) -> Result<ExecOutcome> {
        let mut args = vec!["exec".to_string()];
        for (k, v) in env {
            args.push("-e".to_string());
            args.push(format!("{k}={v}"));
        }
        if let Some(wd) = work_dir {
            args.push("-w".to_string());
            args.push(wd.to_string());
        }
        args.push(runtime_id.to_string());
        args.extend(argv.iter().cloned());

        let output = self.run(&args).await?;
        Ok(ExecOutcome {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn exec_attached(
        &self,
        runtime_id: &str,
        argv: &[String],
        env: &HashMap<String, String>,
        pty_slave: std::fs::File,
    ) -> Result<tokio::process::Child> {
        let mut args = vec!["exec".to_string(), "-it".to_string()];
        for (k, v) in env {
            args.push("-e".to_string());
            args.push(format!("{k}={v}"));
        }
        args.push(runtime_id.to_string());
        args.extend(argv.iter().cloned());

        let stdout_fd = pty_slave
            .try_clone()
            .map_err(|e| Error::runtime(format!("failed to duplicate pty fd: {e}")))?;
        let stderr_fd = pty_slave
            .try_clone()
            .map_err(|e| Error::runtime(format!("failed to duplicate pty fd: {e}")))?;

        self.cmd()
            .args(&args)
            .stdin(Stdio::from(pty_slave))
            .stdout(Stdio::from(stdout_fd))
            .stderr(Stdio::from(stderr_fd))
            .spawn()
            .map_err(|e| Error::runtime(format!("failed to spawn attached exec: {e}")))
    }

    async fn logs(&self, runtime_id: &str, tail_lines: usize) -> Result<Vec<u8>> {
        let output = self
            .run(&[
                "logs".to_string(),
                "--tail".to_string(),
                tail_lines.to_string(),
                runtime_id.to_string(),
            ])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such container") {
                return Err(Error::not_found(runtime_id));
            }
            return Err(Error::runtime(format!("logs failed: {}", stderr.trim())));
        }
        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        Ok(combined)
    }

    async fn stats(&self, runtime_id: &str) -> Result<ContainerStats> {
        let output = self
            .run(&[
                "stats".to_string(),
                "--no-stream".to_string(),
                "--format".to_string(),
                "{{json .}}".to_string(),
                runtime_id.to_string(),
            ])
            .await?;
        Self::check(&output, "stats failed")?;

        #[derive(Deserialize)]
        struct DockerStats {
            #[serde(rename = "CPUPerc")]
            cpu_perc: String,
            #[serde(rename = "MemUsage")]
            mem_usage: String,
            #[serde(rename = "NetIO")]
            net_io: String,
            #[serde(rename = "BlockIO")]
            block_io: String,
        }

        let raw = String::from_utf8_lossy(&output.stdout);
        let stats: DockerStats = serde_json::from_str(raw.trim())
            .map_err(|e| Error::runtime(format!("failed to parse stats output: {e}")))?;

        let cpu_percent = stats
            .cpu_perc
            .trim_end_matches('%')
            .parse::<f64>()
            .unwrap_or(0.0);
        let (mem_usage_bytes, mem_limit_bytes) = parse_usage_pair(&stats.mem_usage);
        let (net_rx_bytes, net_tx_bytes) = parse_usage_pair(&stats.net_io);
        let (block_io_bytes, _) = parse_usage_pair(&stats.block_io);

        Ok(ContainerStats {
            cpu_percent,
            mem_usage_bytes,
            mem_limit_bytes,
            net_rx_bytes,
            net_tx_bytes,
            block_io_bytes,
        })
    }

    async fn events(&self, runtime_id: Option<&str>) -> Result<mpsc::Receiver<RuntimeEvent>> {
        let mut args = vec![
            "events".to_string(),
            "--format".to_string(),
            "{{json .}}".to_string(),
        ];
        if let Some(id) = runtime_id {
            args.push("--filter".to_string());
            args.push(format!("container={id}"));
        }

        let mut child = self
            .cmd()
            .args(&args)
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| Error::runtime(format!("failed to spawn events stream: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::runtime("events stream has no stdout"))?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(event) = parse_docker_event(&line) {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "container events stream read error");
                        break;
                    }
                }
            }
            let _ = child.kill().await;
        });

        Ok(rx)
    }

    async fn list(&self, label_filter: Option<(&str, &str)>) -> Result<Vec<ContainerSummary>> {
        let mut args = vec![
            "ps".to_string(),
            "-a".to_string(),
            "--format".to_string(),
            "{{json .}}".to_string(),
        ];
        if let Some((key, value)) = label_filter {
            args.push("--filter".to_string());
            args.push(format!("label={key}={value}"));
        }

        let output = self.run(&args).await?;
        Self::check(&output, "list failed")?;

        #[derive(Deserialize)]
        struct PsLine {
            #[serde(rename = "ID")]
            id: String,
            #[serde(rename = "Names")]
            names: String,
            #[serde(rename = "State")]
            state: String,
            #[serde(rename = "Labels")]
            labels: String,
        }

        let raw = String::from_utf8_lossy(&output.stdout);
        let mut summaries = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            let parsed: PsLine = serde_json::from_str(line)
                .map_err(|e| Error::runtime(format!("failed to parse ps output: {e}")))?;
            let status = match parsed.state.as_str() {
                "running" => RuntimeStatus::Running,
                "paused" => RuntimeStatus::Paused,
                "created" => RuntimeStatus::Created,
                "exited" | "dead" => RuntimeStatus::Exited,
                _ => RuntimeStatus::Unknown,
            };
            let mut labels = HashMap::new();
            for pair in parsed.labels.split(',').filter(|p| !p.is_empty()) {
                if let Some((k, v)) = pair.split_once('=') {
                    labels.insert(k.to_string(), v.to_string());
                }
            }
            summaries.push(ContainerSummary {
                runtime_id: parsed.id,
                name: parsed.names,
                status,
                labels,
            });
        }
        Ok(summaries)
    }
}

fn parse_usage_pair(s: &str) -> (u64, u64) {
    let mut parts = s.split('/').map(str::trim);
    let used = parts.next().map(parse_byte_size).unwrap_or(0);
    let limit = parts.next().map(parse_byte_size).unwrap_or(0);
    (used, limit)
}

fn parse_byte_size(s: &str) -> u64 {
    let s = s.trim();
    let idx = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(idx);
    let value: f64 = num.parse().unwrap_or(0.0);
    let mult: f64 = match unit.trim().to_ascii_lowercase().as_str() {
        "b" => 1.0,
        "kb" | "kib" => 1024.0,
        "mb" | "mib" => 1024.0 * 1024.0,
        "gb" | "gib" => 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };
    (value * mult) as u64
}

#[derive(Deserialize)]
struct DockerEventLine {
    #[serde(rename = "Actor")]
    actor: DockerEventActor,
    #[serde(rename = "Action")]
    action: String,
    #[serde(default)]
    time: i64,
}

#[derive(Deserialize)]
struct DockerEventActor {
    #[serde(rename = "ID")]
    id: String,
}

fn parse_docker_event(line: &str) -> Option<RuntimeEvent> {
    let parsed: DockerEventLine = serde_json::from_str(line.trim()).ok()?;
    let at = chrono::DateTime::from_timestamp(parsed.time, 0).unwrap_or_else(Utc::now);
    Some(RuntimeEvent {
        runtime_id: parsed.actor.id,
        action: parsed.action,
        exit_code: None,
        at,
    })
}
