//! Sandbox Config Schema & Parser (C4).
//!
//! Declarative TOML spec: project, environment (flavor + languages +
//! packages), services, ports, resources (tier + overrides), addons,
//! lifecycle commands, git, agent settings. Parses, validates against the
//! schema, and fills defaults, generalizing the teacher's `Config::from_str`
//! / `from_file` pattern to the richer schema this orchestrator needs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::permissions::SecurityProfile;

/// File names recognized, in priority order.
pub const CONFIG_FILE_NAMES: &[&str] = &["agentpod.toml", ".agentpod.toml", "agentpod.config.toml"];

/// Maximum size of a declarative config file.
pub const MAX_CONFIG_BYTES: usize = 500 * 1024;

/// Closed flavor set.
pub const FLAVORS: &[&str] = &["bare", "js", "python", "go", "rust", "fullstack", "polyglot"];
/// Closed resource tier set.
pub const TIERS: &[&str] = &["micro", "starter", "builder", "creator", "power"];

/// A pre-built container image family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Bare,
    Js,
    Python,
    Go,
    Rust,
    Fullstack,
    Polyglot,
}

impl Flavor {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bare" => Some(Self::Bare),
            "js" => Some(Self::Js),
            "python" => Some(Self::Python),
            "go" => Some(Self::Go),
            "rust" => Some(Self::Rust),
            "fullstack" => Some(Self::Fullstack),
            "polyglot" => Some(Self::Polyglot),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bare => "bare",
            Self::Js => "js",
            Self::Python => "python",
            Self::Go => "go",
            Self::Rust => "rust",
            Self::Fullstack => "fullstack",
            Self::Polyglot => "polyglot",
        }
    }
}

/// A named `{cpus, memory, storage}` preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Micro,
    Starter,
    Builder,
    Creator,
    Power,
}

/// Resolved `{cpus, memory_gb, storage_gb}` for a tier.
#[derive(Debug, Clone, Copy)]
pub struct TierSpec {
    pub cpus: f64,
    pub memory_gb: f64,
    pub storage_gb: u32,
}

impl Tier {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "micro" => Some(Self::Micro),
            "starter" => Some(Self::Starter),
            "builder" => Some(Self::Builder),
            "creator" => Some(Self::Creator),
            "power" => Some(Self::Power),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Micro => "micro",
            Self::Starter => "starter",
            Self::Builder => "builder",
            Self::Creator => "creator",
            Self::Power => "power",
        }
    }

    pub fn spec(&self) -> TierSpec {
        match self {
            Self::Micro => TierSpec {
                cpus: 0.5,
                memory_gb: 0.5,
                storage_gb: 5,
            },
            Self::Starter => TierSpec {
                cpus: 1.0,
                memory_gb: 2.0,
                storage_gb: 10,
            },
            Self::Builder => TierSpec {
                cpus: 2.0,
                memory_gb: 4.0,
                storage_gb: 20,
            },
            Self::Creator => TierSpec {
                cpus: 4.0,
                memory_gb: 8.0,
                storage_gb: 40,
            },
            Self::Power => TierSpec {
                cpus: 8.0,
                memory_gb: 16.0,
                storage_gb: 80,
            },
        }
    }
}

/// An optional capability enabled per sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addon {
    CodeServer,
    Gui,
    Gpu,
    Databases,
    Cloud,
}

impl Addon {
    pub fn id(&self) -> &'static str {
        match self {
            Self::CodeServer => "code-server",
            Self::Gui => "gui",
            Self::Gpu => "gpu",
            Self::Databases => "databases",
            Self::Cloud => "cloud",
        }
    }

    /// Default container port this addon exposes, if any.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::CodeServer => Some(8080),
            Self::Gui => Some(6080),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl Default for Project {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default = "default_flavor")]
    pub base: String,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

fn default_flavor() -> String {
    "js".to_string()
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            base: default_flavor(),
            languages: Vec::new(),
            packages: Vec::new(),
            variables: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Services {
    #[serde(default)]
    pub postgres: bool,
    #[serde(default)]
    pub mysql: bool,
    #[serde(default)]
    pub redis: bool,
    #[serde(default)]
    pub mongodb: bool,
    #[serde(default)]
    pub sqlite: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    Http,
    Tcp,
}

impl Default for PortProtocol {
    fn default() -> Self {
        Self::Http
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortSpec {
    pub label: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub protocol: PortProtocol,
}

/// `ports{ port -> {label, public, protocol} }`. Keyed by decimal string
/// because TOML table keys must be strings; [`Self::entries`] parses and
/// validates the port numbers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ports(#[serde(flatten)] pub HashMap<String, PortSpec>);

impl Ports {
    /// Parsed `(port, spec)` pairs, sorted. Errors if any key isn't a valid
    /// port number in `1..=65535`.
    pub fn entries(&self) -> Result<Vec<(u16, &PortSpec)>> {
        let mut out = Vec::with_capacity(self.0.len());
        for (k, v) in &self.0 {
            let port: u16 = k.parse().map_err(|_| {
                Error::invalid("ports", "invalid_port", format!("'{k}' is not a valid port number"))
            })?;
            if port == 0 {
                return Err(Error::invalid(
                    "ports",
                    "invalid_port",
                    format!("port {k} is out of range 1-65535"),
                ));
            }
            out.push((port, v));
        }
        out.sort_by_key(|(p, _)| *p);
        Ok(out)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default = "default_tier")]
    pub tier: String,
    #[serde(default)]
    pub cpu_cores: Option<f64>,
    #[serde(default)]
    pub memory_gb: Option<f64>,
    #[serde(default)]
    pub storage_gb: Option<u32>,
}

fn default_tier() -> String {
    "builder".to_string()
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            tier: default_tier(),
            cpu_cores: None,
            memory_gb: None,
            storage_gb: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Addons {
    #[serde(rename = "code-server", default)]
    pub code_server: bool,
    #[serde(default)]
    pub gui: bool,
    #[serde(default)]
    pub gpu: bool,
    #[serde(default)]
    pub databases: bool,
    #[serde(default)]
    pub cloud: bool,
}

impl Addons {
    pub fn enabled(&self) -> Vec<Addon> {
        let mut out = Vec::new();
        if self.code_server {
            out.push(Addon::CodeServer);
        }
        if self.gui {
            out.push(Addon::Gui);
        }
        if self.gpu {
            out.push(Addon::Gpu);
        }
        if self.databases {
            out.push(Addon::Databases);
        }
        if self.cloud {
            out.push(Addon::Cloud);
        }
        out
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Lifecycle {
    #[serde(default)]
    pub init: Option<String>,
    #[serde(default)]
    pub setup: Option<String>,
    #[serde(default)]
    pub dev: Option<String>,
    #[serde(default)]
    pub build: Option<String>,
    #[serde(default)]
    pub test: Option<String>,
    #[serde(default)]
    pub lint: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Git {
    #[serde(default = "default_branch")]
    pub default_branch: String,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub auto_commit: bool,
}

fn default_branch() -> String {
    "main".to_string()
}

impl Default for Git {
    fn default() -> Self {
        Self {
            default_branch: default_branch(),
            user_name: None,
            user_email: None,
            auto_commit: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AutoApprove {
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub write: bool,
    #[serde(default)]
    pub execute: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Agent {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub auto_approve: AutoApprove,
    #[serde(default)]
    pub agents_md: Option<String>,
}

/// The root declarative sandbox spec, consumed by the Container Spec
/// Builder (C6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub project: Project,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub services: Services,
    #[serde(default)]
    pub ports: Ports,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub addons: Addons,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default)]
    pub git: Git,
    #[serde(default)]
    pub agent: Agent,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            project: Project::default(),
            environment: Environment::default(),
            services: Services::default(),
            ports: Ports::default(),
            resources: Resources::default(),
            addons: Addons::default(),
            lifecycle: Lifecycle::default(),
            git: Git::default(),
            agent: Agent::default(),
        }
    }
}

/// A single validation failure: schema path + stable code + human message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub path: String,
    pub code: String,
    pub message: String,
}

/// Result of parsing/validating a declarative config.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub valid: bool,
    pub config: Option<SandboxConfig>,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
}

/// Parse a TOML document into a validated, defaulted `SandboxConfig`.
pub fn parse(content: &str) -> Result<ValidationResult> {
    if content.len() > MAX_CONFIG_BYTES {
        return Ok(ValidationResult {
            valid: false,
            config: None,
            errors: vec![ValidationError {
                path: "".to_string(),
                code: "too_large".to_string(),
                message: format!("config exceeds {MAX_CONFIG_BYTES} bytes"),
            }],
            warnings: vec![],
        });
    }

    let config: SandboxConfig = match toml::from_str(content) {
        Ok(c) => c,
        Err(e) => {
            return Ok(ValidationResult {
                valid: false,
                config: None,
                errors: vec![ValidationError {
                    path: "".to_string(),
                    code: "parse_error".to_string(),
                    message: e.to_string(),
                }],
                warnings: vec![],
            });
        }
    };

    Ok(validate(config))
}

/// Load and parse a config from the first recognized file name in `dir`.
pub fn load_from_dir(dir: &Path) -> Result<Option<ValidationResult>> {
    for name in CONFIG_FILE_NAMES {
        let path = dir.join(name);
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            return Ok(Some(parse(&content)?));
        }
    }
    Ok(None)
}

/// Validate an already-parsed config (defaults already filled by serde),
/// producing the closed-set checks and warnings the schema requires.
pub fn validate(config: SandboxConfig) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if config.project.name.trim().is_empty() {
        errors.push(ValidationError {
            path: "project.name".to_string(),
            code: "required".to_string(),
            message: "project.name must not be empty".to_string(),
        });
    }
    if config.project.description.is_none() {
        warnings.push("project.description is missing".to_string());
    }

    if Flavor::parse(&config.environment.base).is_none() {
        errors.push(ValidationError {
            path: "environment.base".to_string(),
            code: "invalid_enum".to_string(),
            message: format!(
                "'{}' is not a valid flavor (expected one of {:?})",
                config.environment.base, FLAVORS
            ),
        });
    }

    if Tier::parse(&config.resources.tier).is_none() {
        errors.push(ValidationError {
            path: "resources.tier".to_string(),
            code: "invalid_enum".to_string(),
            message: format!(
                "'{}' is not a valid tier (expected one of {:?})",
                config.resources.tier, TIERS
            ),
        });
    } else if config.resources.tier == "power" {
        warnings.push("resources.tier 'power' is a high-cost tier".to_string());
    }

    if config.addons.gpu && matches!(config.resources.tier.as_str(), "starter" | "builder") {
        warnings.push(format!(
            "addons.gpu is enabled on the '{}' tier; GPU workloads typically need 'creator' or 'power'",
            config.resources.tier
        ));
    }

    if let Err(e) = config.ports.entries() {
        errors.push(ValidationError {
            path: "ports".to_string(),
            code: e.code().to_string(),
            message: e.to_string(),
        });
    }

    if config.lifecycle.dev.is_none() {
        warnings.push("lifecycle.dev is not set".to_string());
    }

    if config.agent.auto_approve.execute {
        warnings.push("agent.auto_approve.execute is true; commands run without confirmation".to_string());
    }

    let valid = errors.is_empty();
    ValidationResult {
        valid,
        config: Some(config),
        errors,
        warnings,
    }
}

/// Round-trip serialization back to TOML text.
pub fn serialize(config: &SandboxConfig) -> Result<String> {
    toml::to_string_pretty(config)
        .map_err(|e| Error::internal(format!("failed to serialize config: {e}")))
}

/// Validate a partial overlay document: parsed as a full config with
/// defaults filling the rest, then run through the same checks. Used for
/// staged edits before a full config is assembled.
pub fn validate_partial(content: &str) -> Result<ValidationResult> {
    parse(content)
}

/// Apply a security profile's defaults onto `agent.auto_approve` in place.
/// A supplemental ergonomic layer, not part of the closed schema validated
/// above.
pub fn apply_security_profile(config: &mut SandboxConfig, profile: SecurityProfile) {
    config.agent.auto_approve = profile.auto_approve_defaults();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let toml = r#"
            [project]
            name = "demo"
        "#;
        let result = parse(toml).unwrap();
        assert!(result.valid);
        let config = result.config.unwrap();
        assert_eq!(config.environment.base, "js");
        assert_eq!(config.resources.tier, "builder");
        assert_eq!(config.git.default_branch, "main");
        assert!(!config.git.auto_commit);
    }

    #[test]
    fn rejects_empty_project_name() {
        let toml = r#"
            [project]
            name = ""
        "#;
        let result = parse(toml).unwrap();
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.path == "project.name"));
    }

    #[test]
    fn warns_on_power_tier() {
        let toml = r#"
            [project]
            name = "demo"
            [resources]
            tier = "power"
        "#;
        let result = parse(toml).unwrap();
        assert!(result.valid);
        assert!(result.warnings.iter().any(|w| w.contains("power")));
    }

    #[test]
    fn gpu_on_starter_warns_mismatch() {
        let toml = r#"
            [project]
            name = "demo"
            [resources]
            tier = "starter"
            [addons]
            gpu = true
        "#;
        let result = parse(toml).unwrap();
        assert!(result.warnings.iter().any(|w| w.contains("GPU")));
    }

    #[test]
    fn round_trip_parse_serialize_parse() {
        let toml = r#"
            [project]
            name = "demo"
            description = "a demo project"

            [environment]
            base = "python"

            [ports."5173"]
            label = "Vite"
            public = true
        "#;
        let first = parse(toml).unwrap().config.unwrap();
        let text = serialize(&first).unwrap();
        let second = parse(&text).unwrap().config.unwrap();
        assert_eq!(first.project.name, second.project.name);
        assert_eq!(first.environment.base, second.environment.base);
        assert_eq!(
            first.ports.entries().unwrap().len(),
            second.ports.entries().unwrap().len()
        );
    }

    #[test]
    fn rejects_out_of_range_port() {
        let toml = r#"
            [project]
            name = "demo"
            [ports.0]
            label = "bad"
            public = true
        "#;
        let result = parse(toml).unwrap();
        assert!(!result.valid);
    }

    #[test]
    fn security_profile_overrides_auto_approve() {
        let mut config = SandboxConfig::default();
        apply_security_profile(&mut config, SecurityProfile::Restrictive);
        assert!(!config.agent.auto_approve.read);
        assert!(!config.agent.auto_approve.execute);

        apply_security_profile(&mut config, SecurityProfile::Permissive);
        assert!(config.agent.auto_approve.execute);
    }
}
