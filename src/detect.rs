//! Project Auto-Detector (C5).
//!
//! Scans a repo root for marker files (lockfiles, manifests, framework
//! configs, compose files) and produces a partial [`SandboxConfig`] plus a
//! confidence score and human-readable messages. Table-driven, following
//! the teacher's `languages.rs` `RUNTIMES` table style, generalized from
//! "pick one Docker image" to "infer flavor/framework/package
//! manager/databases/ports".

use std::collections::HashMap;
use std::path::Path;

use crate::config::{Lifecycle, PortProtocol, PortSpec, Ports, Project, SandboxConfig, Services};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Language,
    Framework,
    PackageManager,
    Database,
    Tool,
}

struct Marker {
    files: &'static [&'static str],
    indicator: &'static str,
    kind: MarkerKind,
}

const MARKERS: &[Marker] = &[
    Marker {
        files: &["package.json", "package-lock.json", "yarn.lock", "pnpm-lock.yaml", "bun.lockb"],
        indicator: "javascript",
        kind: MarkerKind::Language,
    },
    Marker {
        files: &["pyproject.toml", "requirements.txt", "setup.py", "Pipfile", "poetry.lock", "uv.lock"],
        indicator: "python",
        kind: MarkerKind::Language,
    },
    Marker {
        files: &["go.mod", "go.sum"],
        indicator: "go",
        kind: MarkerKind::Language,
    },
    Marker {
        files: &["Cargo.toml", "Cargo.lock"],
        indicator: "rust",
        kind: MarkerKind::Language,
    },
    Marker {
        files: &["turbo.json", "lerna.json", "nx.json"],
        indicator: "monorepo",
        kind: MarkerKind::Tool,
    },
    Marker {
        files: &["next.config.js", "next.config.ts", "next.config.mjs"],
        indicator: "next",
        kind: MarkerKind::Framework,
    },
    Marker {
        files: &["nuxt.config.js", "nuxt.config.ts"],
        indicator: "nuxt",
        kind: MarkerKind::Framework,
    },
    Marker {
        files: &["remix.config.js"],
        indicator: "remix",
        kind: MarkerKind::Framework,
    },
    Marker {
        files: &["svelte.config.js"],
        indicator: "svelte",
        kind: MarkerKind::Framework,
    },
    Marker {
        files: &["astro.config.mjs", "astro.config.ts"],
        indicator: "astro",
        kind: MarkerKind::Framework,
    },
    Marker {
        files: &["vite.config.ts", "vite.config.js"],
        indicator: "vite",
        kind: MarkerKind::Framework,
    },
    Marker {
        files: &["yarn.lock"],
        indicator: "yarn",
        kind: MarkerKind::PackageManager,
    },
    Marker {
        files: &["pnpm-lock.yaml"],
        indicator: "pnpm",
        kind: MarkerKind::PackageManager,
    },
    Marker {
        files: &["poetry.lock"],
        indicator: "poetry",
        kind: MarkerKind::PackageManager,
    },
    Marker {
        files: &["uv.lock"],
        indicator: "uv",
        kind: MarkerKind::PackageManager,
    },
    Marker {
        files: &["docker-compose.yml", "docker-compose.yaml", "compose.yml", "compose.yaml"],
        indicator: "compose",
        kind: MarkerKind::Tool,
    },
];

/// Default dev-server port per detected framework, per spec (framework →
/// conventional port, labeled and marked public so the proxy routes it).
fn framework_default_port(framework: &str) -> Option<(u16, &'static str)> {
    match framework {
        "next" => Some((3000, "Next.js")),
        "nuxt" => Some((3000, "Nuxt")),
        "remix" => Some((3000, "Remix")),
        "svelte" => Some((5173, "SvelteKit")),
        "astro" => Some((4321, "Astro")),
        "vite" => Some((5173, "Vite Dev Server")),
        _ => None,
    }
}

/// A single human-readable finding surfaced alongside the inferred config.
#[derive(Debug, Clone)]
pub struct DetectionMessage {
    pub kind: MarkerKind,
    pub indicator: String,
}

/// Result of scanning a repo root.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub config: SandboxConfig,
    pub confidence: f64,
    pub messages: Vec<DetectionMessage>,
}

fn file_exists(dir: &Path, pattern: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('*') {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .flatten()
                    .any(|e| e.file_name().to_string_lossy().ends_with(suffix))
            })
            .unwrap_or(false)
    } else {
        dir.join(pattern).exists()
    }
}

fn found_indicators(dir: &Path, kind: MarkerKind) -> Vec<&'static str> {
    MARKERS
        .iter()
        .filter(|m| m.kind == kind)
        .filter(|m| m.files.iter().any(|f| file_exists(dir, f)))
        .map(|m| m.indicator)
        .collect()
}

/// Read a `name`/`description` pair out of `package.json`, `pyproject.toml`
/// or `Cargo.toml`, whichever is present, for the `project.*` fields.
fn detect_project_manifest(dir: &Path) -> (Option<String>, Option<String>) {
    if let Ok(content) = std::fs::read_to_string(dir.join("package.json"))
        && let Ok(value) = serde_json::from_str::<serde_json::Value>(&content)
    {
        let name = value.get("name").and_then(|v| v.as_str()).map(String::from);
        let desc = value.get("description").and_then(|v| v.as_str()).map(String::from);
        if name.is_some() || desc.is_some() {
            return (name, desc);
        }
    }
    if let Ok(content) = std::fs::read_to_string(dir.join("pyproject.toml"))
        && let Ok(value) = content.parse::<toml::Value>()
    {
        let project = value.get("project");
        let name = project
            .and_then(|p| p.get("name"))
            .and_then(|v| v.as_str())
            .map(String::from);
        let desc = project
            .and_then(|p| p.get("description"))
            .and_then(|v| v.as_str())
            .map(String::from);
        if name.is_some() || desc.is_some() {
            return (name, desc);
        }
    }
    if let Ok(content) = std::fs::read_to_string(dir.join("Cargo.toml"))
        && let Ok(value) = content.parse::<toml::Value>()
    {
        let package = value.get("package");
        let name = package.and_then(|p| p.get("name")).and_then(|v| v.as_str()).map(String::from);
        let desc = package
            .and_then(|p| p.get("description"))
            .and_then(|v| v.as_str())
            .map(String::from);
        if name.is_some() || desc.is_some() {
            return (name, desc);
        }
    }
    (None, None)
}

/// Map common `package.json` script names to lifecycle commands.
fn detect_lifecycle_from_package_json(dir: &Path) -> Lifecycle {
    let mut lifecycle = Lifecycle::default();
    let Ok(content) = std::fs::read_to_string(dir.join("package.json")) else {
        return lifecycle;
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(&content) else {
        return lifecycle;
    };
    let Some(scripts) = value.get("scripts").and_then(|v| v.as_object()) else {
        return lifecycle;
    };
    let pick = |names: &[&str]| {
        names
            .iter()
            .find(|n| scripts.contains_key(**n))
            .map(|n| format!("npm run {n}"))
    };
    lifecycle.dev = pick(&["dev", "start"]);
    lifecycle.build = pick(&["build"]);
    lifecycle.test = pick(&["test"]);
    lifecycle.lint = pick(&["lint"]);
    lifecycle.format = pick(&["format", "fmt"]);
    lifecycle
}

fn detect_services(dir: &Path) -> Services {
    let mut services = Services::default();
    let compose_names = ["docker-compose.yml", "docker-compose.yaml", "compose.yml", "compose.yaml"];
    let content = compose_names
        .iter()
        .find_map(|n| std::fs::read_to_string(dir.join(n)).ok())
        .unwrap_or_default();
    let lower = content.to_lowercase();
    services.postgres = lower.contains("postgres");
    services.mysql = lower.contains("mysql") || lower.contains("mariadb");
    services.redis = lower.contains("redis");
    services.mongodb = lower.contains("mongo");
    services.sqlite = lower.contains("sqlite");
    services
}

/// Scan `dir` and produce a partial config with a confidence score.
pub fn detect(dir: &Path) -> DetectionResult {
    let languages = found_indicators(dir, MarkerKind::Language);
    let frameworks = found_indicators(dir, MarkerKind::Framework);
    let package_managers = found_indicators(dir, MarkerKind::PackageManager);
    let tools = found_indicators(dir, MarkerKind::Tool);

    let is_monorepo = tools.contains(&"monorepo");

    let base = if is_monorepo || languages.len() >= 2 {
        "polyglot"
    } else if frameworks
        .iter()
        .any(|f| matches!(*f, "next" | "nuxt" | "remix" | "svelte" | "astro" | "vite"))
    {
        "fullstack"
    } else if languages.contains(&"javascript") {
        "js"
    } else if languages.contains(&"python") {
        "python"
    } else if languages.contains(&"go") {
        "go"
    } else if languages.contains(&"rust") {
        "rust"
    } else {
        "fullstack"
    };

    let mut config = SandboxConfig::default();
    config.environment.base = base.to_string();
    for lang in &languages {
        config.environment.languages.push((*lang).to_string());
    }

    let (name, description) = detect_project_manifest(dir);
    config.project = Project {
        name: name.unwrap_or_default(),
        description,
    };

    if languages.contains(&"javascript") {
        config.lifecycle = detect_lifecycle_from_package_json(dir);
    }

    config.services = detect_services(dir);

    let mut ports = HashMap::new();
    for framework in &frameworks {
        if let Some((port, label)) = framework_default_port(framework) {
            ports.insert(
                port.to_string(),
                PortSpec {
                    label: label.to_string(),
                    public: true,
                    protocol: PortProtocol::Http,
                },
            );
        }
    }
    config.ports = Ports(ports);

    let mut confidence: f64 = 0.5;
    if !languages.is_empty() {
        confidence += 0.2;
    }
    if !frameworks.is_empty() {
        confidence += 0.15;
    }
    if !package_managers.is_empty() {
        confidence += 0.1;
    }
    confidence = confidence.min(1.0);

    let mut messages = Vec::new();
    for i in languages {
        messages.push(DetectionMessage {
            kind: MarkerKind::Language,
            indicator: i.to_string(),
        });
    }
    for f in frameworks {
        messages.push(DetectionMessage {
            kind: MarkerKind::Framework,
            indicator: f.to_string(),
        });
    }
    for p in package_managers {
        messages.push(DetectionMessage {
            kind: MarkerKind::PackageManager,
            indicator: p.to_string(),
        });
    }

    DetectionResult {
        config,
        confidence,
        messages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn detects_vite_project_as_fullstack() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"name":"demo","scripts":{"dev":"vite","build":"vite build"}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("vite.config.ts"), "export default {}").unwrap();

        let result = detect(dir.path());
        assert_eq!(result.config.environment.base, "fullstack");
        assert_eq!(result.config.project.name, "demo");
        assert_eq!(result.config.lifecycle.dev, Some("npm run dev".to_string()));
        assert!(result.config.ports.0.contains_key("5173"));
        assert!(result.confidence >= 0.75);
    }

    #[test]
    fn plain_javascript_without_framework_is_js() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), r#"{"name":"demo"}"#).unwrap();

        let result = detect(dir.path());
        assert_eq!(result.config.environment.base, "js");
    }

    #[test]
    fn monorepo_marker_forces_polyglot() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("turbo.json"), "{}").unwrap();
        std::fs::write(dir.path().join("package.json"), r#"{"name":"mono"}"#).unwrap();

        let result = detect(dir.path());
        assert_eq!(result.config.environment.base, "polyglot");
    }

    #[test]
    fn two_languages_forces_polyglot() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), r#"{"name":"mixed"}"#).unwrap();
        std::fs::write(dir.path().join("go.mod"), "module mixed\n").unwrap();

        let result = detect(dir.path());
        assert_eq!(result.config.environment.base, "polyglot");
    }

    #[test]
    fn empty_directory_defaults_to_fullstack_low_confidence() {
        let dir = tempdir().unwrap();
        let result = detect(dir.path());
        assert_eq!(result.config.environment.base, "fullstack");
        assert!((result.confidence - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn detects_postgres_service_from_compose() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("docker-compose.yml"),
            "services:\n  db:\n    image: postgres:16\n",
        )
        .unwrap();
        let result = detect(dir.path());
        assert!(result.config.services.postgres);
        assert!(!result.config.services.redis);
    }
}
