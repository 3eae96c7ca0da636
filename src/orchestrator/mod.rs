//! Sandbox Orchestrator (C7) — the core of this crate.
//!
//! Owns every sandbox's lifecycle: the authoritative state machine in
//! [`state`], a per-sandbox mutex serializing transitions, retry/backoff
//! for recoverable adapter errors, and the reconciliation task that keeps
//! in-memory state aligned with what the container daemon actually
//! reports. Coordinates teardown with the Terminal Multiplexer (C8) and
//! Event Fan-Out (C9) so a deleted sandbox leaves nothing subscribed
//! behind it.

pub mod state;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::container::{ContainerCreateSpec, ContainerRuntimeAdapter, ContainerStats, ExecOutcome, RuntimeStatus};
use crate::error::{Error, Result};
use crate::events::EventFanout;
use crate::terminal::TerminalMultiplexer;

pub use state::{LifecycleState, PortBinding, Sandbox};

const MAX_RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);
/// Default grace period before SIGKILL on stop, absent an explicit override.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Everything needed to create a new sandbox record alongside its
/// container, beyond the runtime-ready [`ContainerCreateSpec`] itself.
pub struct NewSandbox<'a> {
    pub slug: &'a str,
    pub display_name: &'a str,
    pub user_id: &'a str,
    pub ports: Vec<PortBinding>,
}

/// Retry `f` with exponential backoff while it keeps returning a
/// recoverable error (`Timeout`, `Network`, `Conflict`), up to
/// [`MAX_RETRY_ATTEMPTS`]. Only used for calls that are safe to repeat —
/// idempotent creates, or any operation the caller has confirmed didn't
/// partially apply.
async fn with_retry<F, Fut, T>(mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_recoverable() && attempt + 1 < MAX_RETRY_ATTEMPTS => {
                attempt += 1;
                tokio::time::sleep(RETRY_BASE_DELAY * 2u32.pow(attempt)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

pub struct SandboxOrchestrator {
    runtime: Arc<dyn ContainerRuntimeAdapter>,
    terminals: Arc<TerminalMultiplexer>,
    events: Arc<EventFanout>,
    sandboxes: Mutex<HashMap<String, Sandbox>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SandboxOrchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntimeAdapter>, terminals: Arc<TerminalMultiplexer>, events: Arc<EventFanout>) -> Self {
        Self {
            runtime,
            terminals,
            events,
            sandboxes: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    pub async fn list(&self) -> Vec<Sandbox> {
        self.sandboxes.lock().await.values().cloned().collect()
    }

    pub async fn get(&self, id: &str) -> Result<Sandbox> {
        self.sandboxes
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("sandbox '{id}'")))
    }

    /// Create a new sandbox's container. Atomic: if the adapter call fails,
    /// no in-memory record is left behind — there is nothing to roll back
    /// in the daemon either, since `create` never ran to completion.
    pub async fn create(&self, spec: &ContainerCreateSpec, meta: NewSandbox<'_>) -> Result<Sandbox> {
        let runtime_id = with_retry(|| self.runtime.create(spec)).await?;

        let now = Utc::now();
        let sandbox = Sandbox {
            id: uuid::Uuid::new_v4().to_string(),
            slug: meta.slug.to_string(),
            display_name: meta.display_name.to_string(),
            user_id: meta.user_id.to_string(),
            state: LifecycleState::Created,
            runtime_id: Some(runtime_id),
            image: spec.image.clone(),
            cpus: spec.cpus,
            memory_mb: spec.memory_mb,
            ports: meta.ports,
            volumes: spec.volumes.clone(),
            labels: spec.labels.clone(),
            network: spec.network.clone(),
            command: spec.command.clone(),
            created_at: now,
            updated_at: now,
            last_error: None,
        };

        let mut sandboxes = self.sandboxes.lock().await;
        sandboxes.insert(sandbox.id.clone(), sandbox.clone());
        Ok(sandbox)
    }

    pub async fn start(&self, id: &str) -> Result<()> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let runtime_id = {
            let mut sandboxes = self.sandboxes.lock().await;
            let sandbox = sandboxes.get_mut(id).ok_or_else(|| Error::not_found(format!("sandbox '{id}'")))?;
            sandbox.transition(LifecycleState::Starting)?;
            sandbox.runtime_id.clone().ok_or_else(|| Error::internal("sandbox has no runtime id"))?
        };

        match with_retry(|| self.runtime.start(&runtime_id)).await {
            Ok(()) => {
                let mut sandboxes = self.sandboxes.lock().await;
                if let Some(sandbox) = sandboxes.get_mut(id) {
                    sandbox.transition(LifecycleState::Running)?;
                }
                drop(sandboxes);
                self.events.open_producer(id).await;
                Ok(())
            }
            Err(err) => {
                let mut sandboxes = self.sandboxes.lock().await;
                if let Some(sandbox) = sandboxes.get_mut(id) {
                    sandbox.mark_error(err.to_string());
                }
                Err(err)
            }
        }
    }

    pub async fn stop(&self, id: &str, grace: Duration) -> Result<()> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let runtime_id = {
            let mut sandboxes = self.sandboxes.lock().await;
            let sandbox = sandboxes.get_mut(id).ok_or_else(|| Error::not_found(format!("sandbox '{id}'")))?;
            sandbox.transition(LifecycleState::Stopping)?;
            sandbox.runtime_id.clone().ok_or_else(|| Error::internal("sandbox has no runtime id"))?
        };

        match with_retry(|| self.runtime.stop(&runtime_id, grace)).await {
            Ok(()) => {
                let mut sandboxes = self.sandboxes.lock().await;
                if let Some(sandbox) = sandboxes.get_mut(id) {
                    sandbox.transition(LifecycleState::Stopped)?;
                }
                drop(sandboxes);
                let _ = self.terminals.disconnect_all(id).await;
                Ok(())
            }
            Err(err) => {
                let mut sandboxes = self.sandboxes.lock().await;
                if let Some(sandbox) = sandboxes.get_mut(id) {
                    sandbox.mark_error(err.to_string());
                }
                Err(err)
            }
        }
    }

    pub async fn restart(&self, id: &str, grace: Duration) -> Result<()> {
        // `Stopping` only accepts `Running` or `Paused` as a predecessor, so
        // a paused sandbox must still go through `stop` rather than jumping
        // straight to `start` (which only accepts `Stopped`/`Created`/`Error`).
        let state = self.get(id).await?.state;
        if matches!(state, LifecycleState::Running | LifecycleState::Paused) {
            self.stop(id, grace).await?;
        }
        self.start(id).await
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let runtime_id = {
            let mut sandboxes = self.sandboxes.lock().await;
            let sandbox = sandboxes.get_mut(id).ok_or_else(|| Error::not_found(format!("sandbox '{id}'")))?;
            sandbox.transition(LifecycleState::Paused)?;
            sandbox.runtime_id.clone().ok_or_else(|| Error::internal("sandbox has no runtime id"))?
        };
        self.runtime.pause(&runtime_id).await
    }

    pub async fn unpause(&self, id: &str) -> Result<()> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let runtime_id = {
            let mut sandboxes = self.sandboxes.lock().await;
            let sandbox = sandboxes.get_mut(id).ok_or_else(|| Error::not_found(format!("sandbox '{id}'")))?;
            sandbox.transition(LifecycleState::Running)?;
            sandbox.runtime_id.clone().ok_or_else(|| Error::internal("sandbox has no runtime id"))?
        };
        self.runtime.unpause(&runtime_id).await
    }

    /// Idempotent: deleting an already-absent sandbox succeeds silently.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let runtime_id = {
            let mut sandboxes = self.sandboxes.lock().await;
            match sandboxes.get_mut(id) {
                Some(sandbox) => {
                    if sandbox.state != LifecycleState::Removed {
                        sandbox.mark_error("deleted");
                    }
                    sandbox.runtime_id.clone()
                }
                None => return Ok(()),
            }
        };

        let _ = self.terminals.disconnect_all(id).await;

        if let Some(runtime_id) = runtime_id {
            match self.runtime.remove(&runtime_id, true).await {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }

        self.sandboxes.lock().await.remove(id);
        self.locks.lock().await.remove(id);
        Ok(())
    }

    pub async fn logs(&self, id: &str, tail_lines: usize) -> Result<Vec<u8>> {
        let runtime_id = self.runtime_id_for(id).await?;
        self.runtime.logs(&runtime_id, tail_lines).await
    }

    pub async fn stats(&self, id: &str) -> Result<ContainerStats> {
        let runtime_id = self.runtime_id_for(id).await?;
        self.runtime.stats(&runtime_id).await
    }

    pub async fn exec(
        &self,
        id: &str,
        argv: &[String],
        env: &HashMap<String, String>,
        work_dir: Option<&str>,
    ) -> Result<ExecOutcome> {
        let runtime_id = self.runtime_id_for(id).await?;
        self.runtime.exec(&runtime_id, argv, env, work_dir).await
    }

    async fn runtime_id_for(&self, id: &str) -> Result<String> {
        self.get(id)
            .await?
            .runtime_id
            .ok_or_else(|| Error::conflict(format!("sandbox '{id}' has no container yet")))
    }

    /// Subscribe to the daemon's event stream and fold observed container
    /// state back into our records. Runs until the adapter's channel
    /// closes (daemon unreachable or process teardown); callers re-spawn
    /// it as part of their own supervision if that happens.
    pub async fn run_reconciler(self: Arc<Self>) -> Result<()> {
        let mut events = self.runtime.events(None).await?;
        while let Some(event) = events.recv().await {
            let mut sandboxes = self.sandboxes.lock().await;
            let Some(sandbox) = sandboxes.values_mut().find(|s| s.runtime_id.as_deref() == Some(event.runtime_id.as_str())) else {
                continue;
            };
            match event.action.as_str() {
                "die" | "stop" | "kill" => {
                    if sandbox.state == LifecycleState::Running || sandbox.state == LifecycleState::Stopping {
                        let _ = sandbox.transition(LifecycleState::Stopped);
                    }
                }
                "start" if sandbox.state == LifecycleState::Starting => {
                    let _ = sandbox.transition(LifecycleState::Running);
                    let id = sandbox.id.clone();
                    drop(sandboxes);
                    self.events.open_producer(&id).await;
                    continue;
                }
                "pause" => {
                    let _ = sandbox.transition(LifecycleState::Paused);
                }
                "unpause" => {
                    let _ = sandbox.transition(LifecycleState::Running);
                }
                "oom" | "die_unexpected" => {
                    sandbox.mark_error(format!("container exited unexpectedly (exit_code={:?})", event.exit_code));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Runtime status reported by the adapter right now, bypassing our own
    /// cached state — used by callers that want ground truth rather than
    /// the last reconciled snapshot.
    pub async fn observed_status(&self, id: &str) -> Result<RuntimeStatus> {
        let runtime_id = self.runtime_id_for(id).await?;
        Ok(self.runtime.inspect(&runtime_id).await?.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{RuntimeEvent, RuntimeState, VolumeMount};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct FakeRuntime {
        create_failures: AtomicUsize,
    }

    #[async_trait]
    impl ContainerRuntimeAdapter for FakeRuntime {
        async fn create(&self, _spec: &ContainerCreateSpec) -> Result<String> {
            Ok("rt_1".to_string())
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
        async fn list(&self, _label_filter: Option<(&str, &str)>) -> Result<Vec<crate::container::ContainerSummary>> {
            Ok(Vec::new())
        }
    }

    fn test_spec() -> ContainerCreateSpec {
        ContainerCreateSpec {
            name: "agentpod-demo".to_string(),
            image: "agentpod-fullstack:latest".to_string(),
            env: HashMap::new(),
            volumes: vec![VolumeMount {
                host_path: "/data/demo".to_string(),
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

    fn test_orchestrator() -> SandboxOrchestrator {
        let runtime = Arc::new(FakeRuntime { create_failures: AtomicUsize::new(0) });
        let terminals = Arc::new(TerminalMultiplexer::new(runtime.clone()));
        let events = Arc::new(EventFanout::new());
        SandboxOrchestrator::new(runtime, terminals, events)
    }

    #[tokio::test]
    async fn create_then_start_transitions_to_running() {
        let orchestrator = test_orchestrator();
        let sandbox = orchestrator
            .create(
                &test_spec(),
                NewSandbox {
                    slug: "demo",
                    display_name: "Demo",
                    user_id: "u1",
                    ports: vec![],
                },
            )
            .await
            .unwrap();
        assert_eq!(sandbox.state, LifecycleState::Created);

        orchestrator.start(&sandbox.id).await.unwrap();
        let reloaded = orchestrator.get(&sandbox.id).await.unwrap();
        assert_eq!(reloaded.state, LifecycleState::Running);
    }

    #[tokio::test]
    async fn stop_before_running_is_rejected() {
        let orchestrator = test_orchestrator();
        let sandbox = orchestrator
            .create(
                &test_spec(),
                NewSandbox {
                    slug: "demo",
                    display_name: "Demo",
                    user_id: "u1",
                    ports: vec![],
                },
            )
            .await
            .unwrap();
        let err = orchestrator.stop(&sandbox.id, DEFAULT_STOP_GRACE).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn delete_is_idempotent_on_missing_sandbox() {
        let orchestrator = test_orchestrator();
        orchestrator.delete("does-not-exist").await.unwrap();
    }

    #[tokio::test]
    async fn full_lifecycle_then_delete() {
        let orchestrator = test_orchestrator();
        let sandbox = orchestrator
            .create(
                &test_spec(),
                NewSandbox {
                    slug: "demo",
                    display_name: "Demo",
                    user_id: "u1",
                    ports: vec![],
                },
            )
            .await
            .unwrap();
        orchestrator.start(&sandbox.id).await.unwrap();
        orchestrator.pause(&sandbox.id).await.unwrap();
        orchestrator.unpause(&sandbox.id).await.unwrap();
        orchestrator.stop(&sandbox.id, DEFAULT_STOP_GRACE).await.unwrap();
        orchestrator.delete(&sandbox.id).await.unwrap();
        assert!(orchestrator.get(&sandbox.id).await.is_err());
    }

    #[tokio::test]
    async fn restart_from_paused_goes_through_stop_first() {
        let orchestrator = test_orchestrator();
        let sandbox = orchestrator
            .create(
                &test_spec(),
                NewSandbox {
                    slug: "demo",
                    display_name: "Demo",
                    user_id: "u1",
                    ports: vec![],
                },
            )
            .await
            .unwrap();
        orchestrator.start(&sandbox.id).await.unwrap();
        orchestrator.pause(&sandbox.id).await.unwrap();

        orchestrator.restart(&sandbox.id, DEFAULT_STOP_GRACE).await.unwrap();

        assert_eq!(orchestrator.get(&sandbox.id).await.unwrap().state, LifecycleState::Running);
    }
}
