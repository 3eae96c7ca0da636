//! Container Runtime Adapter (C1).
//!
//! A thin adapter over the local container daemon: create/start/stop/remove/
//! inspect/exec/logs/stats/events. This is the *only* module allowed to hold
//! daemon handles or shell out to `docker`/`podman`; every other component
//! reaches the runtime only through the [`ContainerRuntimeAdapter`] trait.

pub mod docker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::Result;

pub use docker::DockerRuntimeAdapter;

/// Which CLI this adapter drives. Podman is preferred when both are present
/// (rootless, daemonless), matching the teacher's `detect_container_runtime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerRuntimeKind {
    Docker,
    Podman,
}

impl ContainerRuntimeKind {
    pub fn cmd(&self) -> &'static str {
        match self {
            ContainerRuntimeKind::Docker => "docker",
            ContainerRuntimeKind::Podman => "podman",
        }
    }
}

impl fmt::Display for ContainerRuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cmd())
    }
}

/// A bind mount from the host into the container.
#[derive(Debug, Clone)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

/// Everything C6 (Container Spec Builder) needs to hand the adapter a
/// runtime-ready container.
#[derive(Debug, Clone)]
pub struct ContainerCreateSpec {
    /// Stable name used for the container (derived from the sandbox slug).
    pub name: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub volumes: Vec<VolumeMount>,
    pub labels: HashMap<String, String>,
    pub network: String,
    pub cpus: f64,
    pub memory_mb: u64,
    /// `["/bin/sh", "-c", init]` or a keep-alive command.
    pub command: Vec<String>,
    pub working_dir: Option<String>,
}

/// Observed state of a container, as reported by `inspect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeStatus {
    Created,
    Running,
    Paused,
    Exited,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct RuntimeState {
    pub status: RuntimeStatus,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Instantaneous resource usage, as reported by `stats`.
#[derive(Debug, Clone, Default)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub mem_usage_bytes: u64,
    pub mem_limit_bytes: u64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub block_io_bytes: u64,
}

/// Result of a one-shot `exec`.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// A lifecycle event observed on the daemon's event stream.
#[derive(Debug, Clone)]
pub struct RuntimeEvent {
    pub runtime_id: String,
    pub action: String,
    pub exit_code: Option<i32>,
    pub at: DateTime<Utc>,
}

/// One row of `docker ps`, used to rebuild the sandbox list from whatever
/// the daemon already has running (the CLI has no persistent store of its
/// own between invocations; the daemon is the source of truth).
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub runtime_id: String,
    pub name: String,
    pub status: RuntimeStatus,
    pub labels: HashMap<String, String>,
}

/// The set of errors the adapter promises to distinguish, per spec.md §4.1:
/// `NotFound`, `Conflict` (e.g. already running), `Runtime` (daemon
/// unreachable), `Timeout`. These map directly onto [`crate::error::Error`]
/// variants; the trait itself just returns `crate::error::Result`.
#[async_trait]
pub trait ContainerRuntimeAdapter: Send + Sync {
    async fn create(&self, spec: &ContainerCreateSpec) -> Result<String>;
    async fn start(&self, runtime_id: &str) -> Result<()>;
    async fn stop(&self, runtime_id: &str, grace: Duration) -> Result<()>;
    async fn remove(&self, runtime_id: &str, remove_volumes: bool) -> Result<()>;
    async fn pause(&self, runtime_id: &str) -> Result<()>;
    async fn unpause(&self, runtime_id: &str) -> Result<()>;
    async fn inspect(&self, runtime_id: &str) -> Result<RuntimeState>;

    /// One-shot command execution; returns exit code + captured stdout/stderr.
    async fn exec(
        &self,
        runtime_id: &str,
        argv: &[String],
        env: &HashMap<String, String>,
        work_dir: Option<&str>,
    ) -> Result<ExecOutcome>;

    /// Spawn a PTY-attached exec session (used by the Terminal Multiplexer).
    /// `pty_slave` is the opened slave end of a PTY pair; it is duplicated
    /// onto the child's stdin/stdout/stderr.
    async fn exec_attached(
        &self,
        runtime_id: &str,
        argv: &[String],
        env: &HashMap<String, String>,
        pty_slave: std::fs::File,
    ) -> Result<tokio::process::Child>;

    async fn logs(&self, runtime_id: &str, tail_lines: usize) -> Result<Vec<u8>>;
    async fn stats(&self, runtime_id: &str) -> Result<ContainerStats>;

    /// Subscribe to the daemon's lifecycle event stream, optionally filtered
    /// to a single runtime id. The returned channel closes when the
    /// subscription's background task exits (daemon unreachable or process
    /// teardown).
    async fn events(&self, runtime_id: Option<&str>) -> Result<mpsc::Receiver<RuntimeEvent>>;

    /// List containers, optionally filtered to one label value. Used by the
    /// CLI to rebuild its view of existing sandboxes without its own store.
    async fn list(&self, label_filter: Option<(&str, &str)>) -> Result<Vec<ContainerSummary>>;
}

/// Detect the best available container runtime, preferring Podman.
pub fn detect_container_runtime() -> Option<ContainerRuntimeKind> {
    if docker::cli_available(ContainerRuntimeKind::Podman) {
        Some(ContainerRuntimeKind::Podman)
    } else if docker::cli_available(ContainerRuntimeKind::Docker) {
        Some(ContainerRuntimeKind::Docker)
    } else {
        None
    }
}
