//! Edge-Proxy Label Generator (C2).
//!
//! Produces the routing + metadata label map a sidecar reverse proxy reads
//! off the container at create time. Purely data-driven — given the same
//! inputs this always returns the same labels (spec.md §4.2: "Labels are
//! idempotent and deterministic given inputs"), mirroring the table-driven
//! style of the teacher's `languages.rs`.

use std::collections::BTreeMap;

use crate::config::Addon;

/// Default container port the in-container agent listens on.
pub const AGENT_PORT: u16 = 4096;
/// Default container port for the optional homepage.
pub const HOMEPAGE_PORT: u16 = 4000;

/// One declared or addon-derived port the proxy should route.
#[derive(Debug, Clone)]
pub struct RoutedPort {
    pub container_port: u16,
    pub label: String,
    pub public: bool,
}

/// Inputs to label generation, per spec.md §4.2.
#[derive(Debug, Clone)]
pub struct LabelInputs<'a> {
    pub sandbox_id: &'a str,
    pub slug: &'a str,
    pub base_domain: &'a str,
    pub user_id: &'a str,
    pub flavor: &'a str,
    pub tier: &'a str,
    pub ports: Vec<RoutedPort>,
    pub addons: Vec<Addon>,
    pub tls: bool,
    pub cert_resolver: Option<&'a str>,
    pub network: &'a str,
}

/// Generate the deterministic label map for a sandbox's container.
///
/// Emits one routing rule per public port — the default agent port, the
/// homepage port, one per enabled addon with a default port, and one per
/// user-declared public port — plus metadata labels. Non-public ports never
/// produce a routing rule (spec.md §8 invariant).
pub fn generate_labels(inputs: &LabelInputs<'_>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();

    let mut rule = |labels: &mut BTreeMap<String, String>, host: String, port: u16| {
        let rule_name = host.split('.').next().unwrap_or(&host).replace('-', "_");
        labels.insert(
            format!("traefik.http.routers.{rule_name}.rule"),
            format!("Host(`{host}`)"),
        );
        labels.insert(
            format!("traefik.http.routers.{rule_name}.service"),
            rule_name.clone(),
        );
        labels.insert(
            format!("traefik.http.services.{rule_name}.loadbalancer.server.port"),
            port.to_string(),
        );
        if inputs.tls {
            labels.insert(
                format!("traefik.http.routers.{rule_name}.tls"),
                "true".to_string(),
            );
            if let Some(resolver) = inputs.cert_resolver {
                labels.insert(
                    format!("traefik.http.routers.{rule_name}.tls.certresolver"),
                    resolver.to_string(),
                );
            }
        }
    };

    rule(
        &mut labels,
        format!("opencode-{}.{}", inputs.slug, inputs.base_domain),
        AGENT_PORT,
    );
    rule(
        &mut labels,
        format!("homepage-{}.{}", inputs.slug, inputs.base_domain),
        HOMEPAGE_PORT,
    );

    for addon in &inputs.addons {
        if let Some(port) = addon.default_port() {
            rule(
                &mut labels,
                format!("{}-{}.{}", addon.id(), inputs.slug, inputs.base_domain),
                port,
            );
        }
    }

    for port in &inputs.ports {
        if port.public {
            rule(
                &mut labels,
                format!("{}-{}.{}", inputs.slug, port.container_port, inputs.base_domain),
                port.container_port,
            );
        }
    }

    labels.insert("agentpod.sandbox.id".to_string(), inputs.sandbox_id.to_string());
    labels.insert("agentpod.sandbox.slug".to_string(), inputs.slug.to_string());
    labels.insert("agentpod.sandbox.user".to_string(), inputs.user_id.to_string());
    labels.insert("agentpod.flavor".to_string(), inputs.flavor.to_string());
    labels.insert("agentpod.tier".to_string(), inputs.tier.to_string());
    labels.insert("agentpod.network".to_string(), inputs.network.to_string());
    for addon in &inputs.addons {
        labels.insert(format!("agentpod.addon.{}", addon.id()), "true".to_string());
    }

    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_inputs() -> LabelInputs<'static> {
        LabelInputs {
            sandbox_id: "sbx_1",
            slug: "demo",
            base_domain: "agentpod.dev",
            user_id: "u1",
            flavor: "fullstack",
            tier: "builder",
            ports: vec![
                RoutedPort {
                    container_port: 3000,
                    label: "API".into(),
                    public: true,
                },
                RoutedPort {
                    container_port: 9000,
                    label: "Debug".into(),
                    public: false,
                },
            ],
            addons: vec![Addon::CodeServer],
            tls: true,
            cert_resolver: Some("letsencrypt"),
            network: "agentpod_net",
        }
    }

    #[test]
    fn routing_rules_cover_default_and_declared_ports() {
        let labels = generate_labels(&base_inputs());
        assert!(labels.values().any(|v| v.contains("opencode-demo.agentpod.dev")));
        assert!(labels.values().any(|v| v.contains("homepage-demo.agentpod.dev")));
        assert!(labels.values().any(|v| v.contains("code-server-demo.agentpod.dev")));
        assert!(labels.values().any(|v| v.contains("demo-3000.agentpod.dev")));
        assert!(!labels.values().any(|v| v.contains("demo-9000")));
    }

    #[test]
    fn metadata_labels_present() {
        let labels = generate_labels(&base_inputs());
        assert_eq!(labels.get("agentpod.sandbox.slug"), Some(&"demo".to_string()));
        assert_eq!(labels.get("agentpod.addon.code-server"), Some(&"true".to_string()));
    }

    #[test]
    fn deterministic_given_same_inputs() {
        let a = generate_labels(&base_inputs());
        let b = generate_labels(&base_inputs());
        assert_eq!(a, b);
    }
}
