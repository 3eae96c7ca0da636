//! Permission profiles for sandbox security.
//!
//! Defines security profiles that control what sandboxed code can access.

use serde::{Deserialize, Serialize};

/// Security profile levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityProfile {
    /// Full access - network, all mounts, env passthrough
    Permissive,
    /// Balanced - network allowed, limited mounts, filtered env
    #[default]
    Moderate,
    /// Maximum isolation - no network, no mounts, clean env
    Restrictive,
    /// Custom profile defined by explicit permissions
    Custom,
}

impl SecurityProfile {
    /// Parse from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "permissive" => Some(SecurityProfile::Permissive),
            "moderate" => Some(SecurityProfile::Moderate),
            "restrictive" => Some(SecurityProfile::Restrictive),
            "custom" => Some(SecurityProfile::Custom),
            _ => None,
        }
    }

    /// Default `agent.auto_approve` triple for a declarative config created
    /// under this profile. Permissive auto-approves everything; Restrictive
    /// auto-approves nothing; Moderate auto-approves reads/writes but still
    /// prompts before executing commands.
    pub fn auto_approve_defaults(&self) -> crate::config::AutoApprove {
        match self {
            SecurityProfile::Permissive => crate::config::AutoApprove {
                read: true,
                write: true,
                execute: true,
            },
            SecurityProfile::Moderate => crate::config::AutoApprove {
                read: true,
                write: true,
                execute: false,
            },
            SecurityProfile::Restrictive | SecurityProfile::Custom => crate::config::AutoApprove {
                read: false,
                write: false,
                execute: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_str_parses_known_profiles_case_insensitively() {
        assert_eq!(SecurityProfile::from_str("Permissive"), Some(SecurityProfile::Permissive));
        assert_eq!(SecurityProfile::from_str("restrictive"), Some(SecurityProfile::Restrictive));
        assert_eq!(SecurityProfile::from_str("unknown"), None);
    }

    #[test]
    fn auto_approve_defaults_escalate_with_profile() {
        assert_eq!(
            SecurityProfile::Permissive.auto_approve_defaults(),
            crate::config::AutoApprove { read: true, write: true, execute: true }
        );
        assert_eq!(
            SecurityProfile::Moderate.auto_approve_defaults(),
            crate::config::AutoApprove { read: true, write: true, execute: false }
        );
        assert_eq!(
            SecurityProfile::Restrictive.auto_approve_defaults(),
            crate::config::AutoApprove { read: false, write: false, execute: false }
        );
        assert_eq!(
            SecurityProfile::Custom.auto_approve_defaults(),
            SecurityProfile::Restrictive.auto_approve_defaults()
        );
    }
}
