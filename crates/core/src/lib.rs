//! Core library for the protoman service manager
//!
//! This crate contains the logic for running a containerized learning
//! management service on a developer machine: container runtime discovery and
//! control, image pull progress tracking, credential extraction from logs,
//! persisted state, readiness orchestration, configuration, logging, and error
//! handling.

pub mod config;
pub mod credentials;
pub mod docker;
pub mod errors;
pub mod logging;
pub mod orchestrator;
pub mod probe;
pub mod pull_progress;
pub mod redaction;
pub mod resolver;
pub mod store;

pub use credentials::Credentials;
pub use errors::{ProtomanError, Result};
pub use orchestrator::{ActivationState, Orchestrator, ReadinessPath};

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let version = version();
        assert!(!version.is_empty());
        assert!(version.contains('.'));
    }
}
