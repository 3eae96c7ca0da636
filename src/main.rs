use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use agentpod::agents;
use agentpod::config::{self, SandboxConfig};
use agentpod::container::{ContainerRuntimeAdapter, DockerRuntimeAdapter, RuntimeStatus};
use agentpod::detect;
use agentpod::orchestrator::DEFAULT_STOP_GRACE;
use agentpod::spec_builder::{self, BuildInputs, RegistrySettings};
use agentpod::validation;

const MANAGED_LABEL: &str = "agentpod.managed";
const SLUG_LABEL: &str = "agentpod.slug";

#[derive(Parser)]
#[command(name = "agentpod")]
#[command(about = "Per-tenant container sandboxes for AI coding agents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter agentpod.toml in the current directory
    Init {
        /// Project name (defaults to the directory name)
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Detect the project's flavor/framework/ports without creating a config
    Detect {
        /// Directory to scan (defaults to the current directory)
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
    /// Create a sandbox from an agentpod.toml in the given directory
    Create {
        /// Sandbox slug
        slug: String,
        /// Directory holding the project and its agentpod.toml (defaults to cwd)
        #[arg(short, long)]
        dir: Option<PathBuf>,
        /// Base domain the edge proxy routes under
        #[arg(long, default_value = "agentpod.localhost")]
        base_domain: String,
        /// Docker network sandboxes attach to
        #[arg(long, default_value = "agentpod_net")]
        network: String,
    },
    /// Start a sandbox's container
    Start { slug: String },
    /// Stop a sandbox's container
    Stop {
        slug: String,
        /// Seconds to wait before SIGKILL
        #[arg(short, long, default_value_t = DEFAULT_STOP_GRACE.as_secs())]
        grace: u64,
    },
    /// Stop then start a sandbox
    Restart {
        slug: String,
        #[arg(short, long, default_value_t = DEFAULT_STOP_GRACE.as_secs())]
        grace: u64,
    },
    /// Pause a running sandbox without stopping it
    Pause { slug: String },
    /// Resume a paused sandbox
    Unpause { slug: String },
    /// Remove a sandbox's container
    Delete { slug: String },
    /// List sandboxes this adapter's daemon knows about
    List,
    /// Print a sandbox's container logs
    Logs {
        slug: String,
        #[arg(short, long, default_value_t = 200)]
        tail: usize,
    },
    /// Print a sandbox's instantaneous resource usage
    Stats { slug: String },
    /// Run a one-shot command inside a sandbox
    Exec {
        slug: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// List supported AI agents and their availability
    Agents,
}

fn runtime_adapter() -> DockerRuntimeAdapter {
    DockerRuntimeAdapter::detect()
}

/// Docker/Podman accept a container's `--name` anywhere a runtime id is
/// expected, so the CLI can address sandboxes by slug directly without
/// keeping its own persistent id map between invocations.
fn container_name(slug: &str) -> String {
    format!("agentpod-{slug}")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { name } => {
            let current_dir = std::env::current_dir()?;
            let project_name = name.unwrap_or_else(|| {
                current_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "my-project".to_string())
            });

            let config_path = current_dir.join("agentpod.toml");
            if config_path.exists() {
                bail!("agentpod.toml already exists in this directory");
            }

            let detection = detect::detect(&current_dir);
            let mut cfg = detection.config;
            cfg.project.name = project_name.clone();

            let content = config::serialize(&cfg)?;
            std::fs::write(&config_path, content)?;

            println!("Created agentpod.toml for project '{project_name}'");
            println!("  detected flavor: {}", cfg.environment.base);
            for message in &detection.messages {
                println!("  - {:?}: {}", message.kind, message.indicator);
            }
            println!("\nNext steps:");
            println!("  agentpod create {project_name} --dir .");
            println!("  agentpod start {project_name}");
        }
        Commands::Detect { dir } => {
            let detection = detect::detect(&dir);
            println!("flavor: {}", detection.config.environment.base);
            println!("confidence: {:.2}", detection.confidence);
            for message in &detection.messages {
                println!("  - {:?}: {}", message.kind, message.indicator);
            }
        }
        Commands::Create { slug, dir, base_domain, network } => {
            validation::validate_sandbox_name(&slug)?;

            let project_dir = dir.unwrap_or(std::env::current_dir()?);
            let cfg = match config::load_from_dir(&project_dir)? {
                Some(result) if result.valid => result.config.unwrap(),
                Some(result) => {
                    bail!("agentpod.toml is invalid: {:?}", result.errors);
                }
                None => SandboxConfig::default(),
            };

            let runtime = runtime_adapter();
            let sandbox_id = Uuid::new_v4().to_string();
            let repo_path = project_dir.to_string_lossy().into_owned();
            let inputs = BuildInputs {
                sandbox_id: &sandbox_id,
                slug: &slug,
                user_id: "local",
                repo_path: &repo_path,
                base_domain: &base_domain,
                registry: RegistrySettings {
                    url: None,
                    owner: "agentpod".to_string(),
                    version: "latest".to_string(),
                },
                network: &network,
                tls: false,
                cert_resolver: None,
                management_api_url: "http://localhost:8080",
            };

            let mut spec = spec_builder::build(&cfg, &inputs)?;
            spec.name = container_name(&slug);
            spec.labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
            spec.labels.insert(SLUG_LABEL.to_string(), slug.clone());

            println!("Creating sandbox '{slug}' with image '{}'...", spec.image);
            runtime.create(&spec).await?;
            println!("Sandbox '{slug}' created.\n\nNext: agentpod start {slug}");
        }
        Commands::Start { slug } => {
            validation::validate_sandbox_name(&slug)?;
            let runtime = runtime_adapter();
            runtime.start(&container_name(&slug)).await?;
            println!("Sandbox '{slug}' started.");
        }
        Commands::Stop { slug, grace } => {
            validation::validate_sandbox_name(&slug)?;
            let runtime = runtime_adapter();
            runtime.stop(&container_name(&slug), Duration::from_secs(grace)).await?;
            println!("Sandbox '{slug}' stopped.");
        }
        Commands::Restart { slug, grace } => {
            validation::validate_sandbox_name(&slug)?;
            let runtime = runtime_adapter();
            let name = container_name(&slug);
            let grace = Duration::from_secs(grace);
            match runtime.inspect(&name).await {
                Ok(state) if state.status == RuntimeStatus::Running || state.status == RuntimeStatus::Paused => {
                    runtime.stop(&name, grace).await?;
                }
                _ => {}
            }
            runtime.start(&name).await?;
            println!("Sandbox '{slug}' restarted.");
        }
        Commands::Pause { slug } => {
            validation::validate_sandbox_name(&slug)?;
            let runtime = runtime_adapter();
            runtime.pause(&container_name(&slug)).await?;
            println!("Sandbox '{slug}' paused.");
        }
        Commands::Unpause { slug } => {
            validation::validate_sandbox_name(&slug)?;
            let runtime = runtime_adapter();
            runtime.unpause(&container_name(&slug)).await?;
            println!("Sandbox '{slug}' unpaused.");
        }
        Commands::Delete { slug } => {
            validation::validate_sandbox_name(&slug)?;
            let runtime = runtime_adapter();
            runtime.remove(&container_name(&slug), true).await?;
            println!("Sandbox '{slug}' removed.");
        }
        Commands::List => {
            let runtime = runtime_adapter();
            let containers = runtime.list(Some((MANAGED_LABEL, "true"))).await?;
            if containers.is_empty() {
                println!("No sandboxes found.\n\nCreate one with: agentpod create <slug>");
            } else {
                println!("{:<24} {:<10}", "SLUG", "STATUS");
                for summary in containers {
                    let slug = summary.labels.get(SLUG_LABEL).cloned().unwrap_or(summary.name);
                    println!("{:<24} {:<10?}", slug, summary.status);
                }
            }
        }
        Commands::Logs { slug, tail } => {
            validation::validate_sandbox_name(&slug)?;
            let runtime = runtime_adapter();
            let bytes = runtime.logs(&container_name(&slug), tail).await?;
            print!("{}", String::from_utf8_lossy(&bytes));
        }
        Commands::Stats { slug } => {
            validation::validate_sandbox_name(&slug)?;
            let runtime = runtime_adapter();
            let stats = runtime.stats(&container_name(&slug)).await?;
            println!("cpu:     {:.1}%", stats.cpu_percent);
            println!("memory:  {} / {} bytes", stats.mem_usage_bytes, stats.mem_limit_bytes);
            println!("net rx:  {} bytes", stats.net_rx_bytes);
            println!("net tx:  {} bytes", stats.net_tx_bytes);
            println!("blockio: {} bytes", stats.block_io_bytes);
        }
        Commands::Exec { slug, command } => {
            validation::validate_sandbox_name(&slug)?;
            if command.is_empty() {
                bail!("no command specified. Usage: agentpod exec <slug> <command...>");
            }
            let runtime = runtime_adapter();
            let outcome = runtime.exec(&container_name(&slug), &command, &HashMap::new(), None).await?;
            print!("{}", String::from_utf8_lossy(&outcome.stdout));
            eprint!("{}", String::from_utf8_lossy(&outcome.stderr));
            if outcome.exit_code != 0 {
                std::process::exit(outcome.exit_code);
            }
        }
        Commands::Agents => {
            println!("{:<15} {:<15} API KEY", "AGENT", "STATUS");
            println!("{:-<45}", "");
            for status in agents::list_agents() {
                let install_status = if status.installed { "installed" } else { "not installed" };
                let key_status = if status.api_key_set { "set" } else { "missing" };
                println!("{:<15} {:<15} {key_status}", status.agent_type.name(), install_status);
                if !status.installed {
                    println!("  -> {}", status.install_instructions);
                }
            }
        }
    }

    Ok(())
}
