//! AgentPod library.
//!
//! Per-tenant container sandboxes for AI coding agents: the Container
//! Runtime Adapter (C1) drives the daemon, the Sandbox Orchestrator (C7)
//! owns lifecycle, and the Terminal Multiplexer (C8) / Event Fan-Out (C9)
//! give callers a live view into a running sandbox.

pub mod agents;
pub mod config;
pub mod container;
pub mod detect;
pub mod error;
pub mod events;
pub mod git;
pub mod oauth;
pub mod orchestrator;
pub mod permissions;
pub mod proxy_labels;
pub mod spec_builder;
pub mod terminal;
pub mod validation;
