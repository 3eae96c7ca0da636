//! Sandbox data model and lifecycle state machine, per the authoritative
//! diagram: `created -> starting -> running -> stopping -> stopped`,
//! `running <-> paused`, and `any -> error`. `stopped -> starting` restarts
//! in place; `stopped -> removed` and `error -> removed` delete it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Created,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
    Removed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Created => "created",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Paused => "paused",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Error => "error",
            LifecycleState::Removed => "removed",
        }
    }

    /// Whether `self -> next` is a legal transition in the state machine.
    /// `Error` is reachable from any non-terminal state; `Removed` only
    /// from `Stopped` or `Error`.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        if *self == Removed {
            return false;
        }
        if next == Error {
            return *self != Removed;
        }
        matches!(
            (self, next),
            (Created, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Stopping)
                | (Running, Paused)
                | (Paused, Running)
                | (Paused, Stopping)
                | (Stopping, Stopped)
                | (Stopped, Starting)
                | (Stopped, Removed)
                | (Error, Removed)
                | (Error, Starting)
        )
    }
}

/// A declared port binding, carried from the container spec for display.
#[derive(Debug, Clone)]
pub struct PortBinding {
    pub container_port: u16,
    pub label: String,
    pub public: bool,
}

/// The orchestrator's record of one sandbox, per the data model: id, slug,
/// display name, owning user id, lifecycle state, container runtime id
/// (nullable until created), image reference, resource limits, port map,
/// volume mounts, label map, network name, startup command, timestamps,
/// last error.
#[derive(Debug, Clone)]
pub struct Sandbox {
    pub id: String,
    pub slug: String,
    pub display_name: String,
    pub user_id: String,
    pub state: LifecycleState,
    pub runtime_id: Option<String>,
    pub image: String,
    pub cpus: f64,
    pub memory_mb: u64,
    pub ports: Vec<PortBinding>,
    pub volumes: Vec<crate::container::VolumeMount>,
    pub labels: HashMap<String, String>,
    pub network: String,
    pub command: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl Sandbox {
    /// Attempt `self.state -> next`, rejecting illegal transitions with a
    /// `Conflict` (safe to retry once the concurrent transition settles).
    pub fn transition(&mut self, next: LifecycleState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::conflict(format!(
                "sandbox '{}' cannot transition from {} to {}",
                self.id,
                self.state.as_str(),
                next.as_str()
            )));
        }
        self.state = next;
        self.updated_at = Utc::now();
        if next != LifecycleState::Error {
            self.last_error = None;
        }
        Ok(())
    }

    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.state = LifecycleState::Error;
        self.last_error = Some(message.into());
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_transitions_to_stopping_or_paused_but_not_starting() {
        assert!(LifecycleState::Running.can_transition_to(LifecycleState::Stopping));
        assert!(LifecycleState::Running.can_transition_to(LifecycleState::Paused));
        assert!(!LifecycleState::Running.can_transition_to(LifecycleState::Starting));
    }

    #[test]
    fn error_reachable_from_any_non_removed_state() {
        assert!(LifecycleState::Created.can_transition_to(LifecycleState::Error));
        assert!(LifecycleState::Running.can_transition_to(LifecycleState::Error));
        assert!(LifecycleState::Paused.can_transition_to(LifecycleState::Error));
        assert!(!LifecycleState::Removed.can_transition_to(LifecycleState::Error));
    }

    #[test]
    fn removed_only_from_stopped_or_error() {
        assert!(LifecycleState::Stopped.can_transition_to(LifecycleState::Removed));
        assert!(LifecycleState::Error.can_transition_to(LifecycleState::Removed));
        assert!(!LifecycleState::Running.can_transition_to(LifecycleState::Removed));
    }

    #[test]
    fn stopped_can_restart() {
        assert!(LifecycleState::Stopped.can_transition_to(LifecycleState::Starting));
    }
}
