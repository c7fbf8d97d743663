//! Shared building blocks for the Pylon gateway and agent
//!
//! This crate carries the data model used by every other Pylon crate
//! (clusters, tokens, roles), the configuration types for both binaries,
//! identity providers, and the run-scope used to join background tasks on
//! shutdown.

pub mod config;
pub mod core;
pub mod ident;
pub mod scope;
pub mod telemetry;

/// Keyring namespace used by the gateway for cluster keyrings
pub const KEYRING_NAMESPACE_GATEWAY: &str = "gateway-internal";

/// Keyring namespace used by an agent for its own keyring copy
pub const KEYRING_NAMESPACE_AGENT: &str = "agent";
