//! Integration coverage for the Sandbox Orchestrator's public contract:
//! a full create -> start -> pause -> unpause -> stop -> delete happy
//! path, plus the Start/Stop linearizability property (two concurrent
//! start attempts on the same sandbox, only one of which may proceed).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use agentpod::container::{
    ContainerCreateSpec, ContainerRuntimeAdapter, ContainerStats, ContainerSummary, ExecOutcome,
    RuntimeEvent, RuntimeState, RuntimeStatus, VolumeMount,
};
use agentpod::error::{Error, Result};
use agentpod::events::EventFanout;
use agentpod::orchestrator::{LifecycleState, NewSandbox, SandboxOrchestrator, DEFAULT_STOP_GRACE};
use agentpod::terminal::TerminalMultiplexer;

struct SlowFakeRuntime {
    start_calls: AtomicU32,
}

#[async_trait]
impl ContainerRuntimeAdapter for SlowFakeRuntime {
    async fn create(&self, _spec: &ContainerCreateSpec) -> Result<String> {
        Ok("rt_integration".to_string())
    }
    async fn start(&self, _runtime_id: &str) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
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
        _argv: &[String],
        _env: &HashMap<String, String>,
        _pty_slave: std::fs::File,
    ) -> Result<tokio::process::Child> {
        Err(Error::runtime("not implemented in fake"))
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

fn test_spec() -> ContainerCreateSpec {
    ContainerCreateSpec {
        name: "agentpod-it".to_string(),
        image: "agentpod-bare:latest".to_string(),
        env: HashMap::new(),
        volumes: vec![VolumeMount {
            host_path: "/data/it".to_string(),
            container_path: "/home/workspace".to_string(),
            read_only: false,
        }],
        labels: HashMap::new(),
        network: "agentpod_net".to_string(),
        cpus: 1.0,
        memory_mb: 1024,
        command: vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()],
        working_dir: Some("/home/workspace".to_string()),
    }
}

fn build_orchestrator(runtime: Arc<SlowFakeRuntime>) -> SandboxOrchestrator {
    let terminals = Arc::new(TerminalMultiplexer::new(runtime.clone()));
    let events = Arc::new(EventFanout::new());
    SandboxOrchestrator::new(runtime, terminals, events)
}

#[tokio::test]
async fn full_happy_path_reaches_every_state_in_order() {
    let runtime = Arc::new(SlowFakeRuntime { start_calls: AtomicU32::new(0) });
    let orchestrator = build_orchestrator(runtime);

    let sandbox = orchestrator
        .create(
            &test_spec(),
            NewSandbox {
                slug: "it-demo",
                display_name: "Integration Demo",
                user_id: "u1",
                ports: vec![],
            },
        )
        .await
        .expect("create succeeds");
    assert_eq!(sandbox.state, LifecycleState::Created);

    orchestrator.start(&sandbox.id).await.expect("start succeeds");
    assert_eq!(orchestrator.get(&sandbox.id).await.unwrap().state, LifecycleState::Running);

    orchestrator.pause(&sandbox.id).await.expect("pause succeeds");
    assert_eq!(orchestrator.get(&sandbox.id).await.unwrap().state, LifecycleState::Paused);

    orchestrator.unpause(&sandbox.id).await.expect("unpause succeeds");
    assert_eq!(orchestrator.get(&sandbox.id).await.unwrap().state, LifecycleState::Running);

    orchestrator.stop(&sandbox.id, DEFAULT_STOP_GRACE).await.expect("stop succeeds");
    assert_eq!(orchestrator.get(&sandbox.id).await.unwrap().state, LifecycleState::Stopped);

    orchestrator.delete(&sandbox.id).await.expect("delete succeeds");
    assert!(orchestrator.get(&sandbox.id).await.is_err());
}

/// Two concurrent `start()` calls on the same freshly created sandbox:
/// the per-sandbox lock must serialize them, and the second must observe
/// the state machine reject `Starting -> Starting`, not silently succeed
/// twice or race the adapter's `start` call.
#[tokio::test]
async fn concurrent_starts_on_one_sandbox_are_linearized() {
    let runtime = Arc::new(SlowFakeRuntime { start_calls: AtomicU32::new(0) });
    let orchestrator = Arc::new(build_orchestrator(runtime.clone()));

    let sandbox = orchestrator
        .create(
            &test_spec(),
            NewSandbox {
                slug: "it-race",
                display_name: "Race Demo",
                user_id: "u1",
                ports: vec![],
            },
        )
        .await
        .expect("create succeeds");

    let id_a = sandbox.id.clone();
    let id_b = sandbox.id.clone();
    let orch_a = orchestrator.clone();
    let orch_b = orchestrator.clone();

    let (result_a, result_b) = tokio::join!(
        tokio::spawn(async move { orch_a.start(&id_a).await }),
        tokio::spawn(async move { orch_b.start(&id_b).await }),
    );

    let result_a = result_a.unwrap();
    let result_b = result_b.unwrap();

    // Exactly one call transitions Created -> Starting -> Running; the
    // other observes the sandbox already past `Created` and is rejected.
    let successes = [&result_a, &result_b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one concurrent start should succeed");
    assert_eq!(orchestrator.get(&sandbox.id).await.unwrap().state, LifecycleState::Running);
    assert_eq!(runtime.start_calls.load(Ordering::SeqCst), 1, "adapter start should run exactly once");
}

#[tokio::test]
async fn delete_is_idempotent_and_disconnects_terminals() {
    let runtime = Arc::new(SlowFakeRuntime { start_calls: AtomicU32::new(0) });
    let orchestrator = build_orchestrator(runtime);

    orchestrator.delete("never-existed").await.expect("delete on missing sandbox is a no-op");

    let sandbox = orchestrator
        .create(
            &test_spec(),
            NewSandbox {
                slug: "it-delete",
                display_name: "Delete Demo",
                user_id: "u1",
                ports: vec![],
            },
        )
        .await
        .unwrap();
    orchestrator.start(&sandbox.id).await.unwrap();
    orchestrator.delete(&sandbox.id).await.expect("delete after running succeeds");
    orchestrator.delete(&sandbox.id).await.expect("second delete is idempotent");
}
