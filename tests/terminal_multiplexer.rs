//! Integration coverage for the Terminal Multiplexer: the per-sandbox
//! terminal cap, and that input/output actually flow over a real PTY
//! attached to a spawned child process, the same way the Docker adapter's
//! `exec_attached` wires a container exec session to the slave end.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use agentpod::container::{
    ContainerCreateSpec, ContainerRuntimeAdapter, ContainerStats, ContainerSummary, ExecOutcome,
    RuntimeEvent, RuntimeState, RuntimeStatus,
};
use agentpod::error::{Error, Result};
use agentpod::terminal::{TerminalMultiplexer, MAX_TERMINALS_PER_SANDBOX};

/// Spawns a real child process attached to the given PTY slave, the same
/// shape as the Docker adapter's `docker exec -it` wiring.
struct ShellRuntime;

#[async_trait]
impl ContainerRuntimeAdapter for ShellRuntime {
    async fn create(&self, _spec: &ContainerCreateSpec) -> Result<String> {
        Ok("rt_shell".to_string())
    }
    async fn start(&self, _runtime_id: &str) -> Result<()> {
        Ok(())
    }
    async fn stop(&self, _runtime_id: &str, _grace: Duration) -> Result<()> {
        Ok(())
    }
    async fn remove(&self, _runtime_id: &str, _remove_volumes: bool) -> Result<()> {
        Ok(())
    }
    async fn pause(&self, _runtime_id: &str) -> Result<()> {
        Ok(())
    }
    async fn unpause(&self, _runtime_id: &str) -> Result<()> {
        Ok(())
    }
    async fn inspect(&self, _runtime_id: &str) -> Result<RuntimeState> {
        Ok(RuntimeState {
            status: RuntimeStatus::Running,
            exit_code: None,
            started_at: None,
        })
    }
    async fn exec(
        &self,
        _runtime_id: &str,
        _argv: &[String],
        _env: &HashMap<String, String>,
        _work_dir: Option<&str>,
    ) -> Result<ExecOutcome> {
        Ok(ExecOutcome {
            exit_code: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }
    async fn exec_attached(
        &self,
        _runtime_id: &str,
        argv: &[String],
        _env: &HashMap<String, String>,
        pty_slave: std::fs::File,
    ) -> Result<tokio::process::Child> {
        let stdout_fd = pty_slave.try_clone().map_err(Error::from)?;
        let stderr_fd = pty_slave.try_clone().map_err(Error::from)?;
        let child = tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::from(pty_slave))
            .stdout(Stdio::from(stdout_fd))
            .stderr(Stdio::from(stderr_fd))
            .spawn()
            .map_err(Error::from)?;
        Ok(child)
    }
    async fn logs(&self, _runtime_id: &str, _tail_lines: usize) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
    async fn stats(&self, _runtime_id: &str) -> Result<ContainerStats> {
        Ok(ContainerStats::default())
    }
    async fn events(&self, _runtime_id: Option<&str>) -> Result<mpsc::Receiver<RuntimeEvent>> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }
    async fn list(&self, _label_filter: Option<(&str, &str)>) -> Result<Vec<ContainerSummary>> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn terminal_output_round_trips_through_the_pty() {
    let multiplexer = TerminalMultiplexer::new(Arc::new(ShellRuntime));
    let terminal_id = multiplexer
        .connect("sbx_term", "rt_shell", "/bin/cat")
        .await
        .expect("connect succeeds");

    let (_id, mut output) = multiplexer.subscribe(&terminal_id).await.unwrap();
    multiplexer.send_input(&terminal_id, b"ping\n".to_vec()).await.unwrap();

    let chunk = tokio::time::timeout(Duration::from_secs(2), output.recv())
        .await
        .expect("no timeout")
        .expect("channel open");
    assert!(String::from_utf8_lossy(&chunk).contains("ping"));

    multiplexer.disconnect(&terminal_id).await.unwrap();
}

#[tokio::test]
async fn connect_rejects_past_the_per_sandbox_cap() {
    let multiplexer = TerminalMultiplexer::new(Arc::new(ShellRuntime));

    for _ in 0..MAX_TERMINALS_PER_SANDBOX {
        multiplexer.connect("sbx_capped", "rt_shell", "/bin/cat").await.expect("under cap succeeds");
    }

    let err = multiplexer
        .connect("sbx_capped", "rt_shell", "/bin/cat")
        .await
        .expect_err("over cap must be rejected");
    assert!(matches!(err, Error::LimitReached(_)));

    // A different sandbox is unaffected by another sandbox's cap.
    multiplexer.connect("sbx_other", "rt_shell", "/bin/cat").await.expect("different sandbox has its own cap");

    multiplexer.disconnect_all("sbx_capped").await.unwrap();
    multiplexer.disconnect_all("sbx_other").await.unwrap();
}
