//! Command implementations
//!
//! This module contains implementations for all CLI subcommands and the
//! context they share.

pub mod credentials;
pub mod down;
pub mod logs;
pub mod status;
pub mod up;

use protoman_core::config::{Config, ReadinessPolicy};
use protoman_core::docker::CliEngine;
use protoman_core::orchestrator::Orchestrator;
use protoman_core::probe::HttpProbe;
use protoman_core::resolver::RuntimeResolver;
use protoman_core::store::FileStore;
use std::path::PathBuf;
use std::sync::Arc;

/// Resolved configuration plus the collaborators built from it
#[derive(Debug)]
pub struct ServiceContext {
    pub config: Config,
    pub policy: ReadinessPolicy,
    resolver: Arc<RuntimeResolver>,
}

impl ServiceContext {
    pub fn new(config: Config, runtime_path: Option<PathBuf>) -> Self {
        let mut resolver = RuntimeResolver::new(config.settings.container_runtime.clone());
        if let Some(path) = runtime_path {
            resolver = resolver.with_path(path);
        }
        Self {
            config,
            policy: ReadinessPolicy::default(),
            resolver: Arc::new(resolver),
        }
    }

    pub fn resolver(&self) -> &RuntimeResolver {
        &self.resolver
    }

    pub fn engine(&self) -> Arc<CliEngine> {
        Arc::new(CliEngine::new(Arc::clone(&self.resolver)))
    }

    pub fn store(&self) -> Arc<FileStore> {
        Arc::new(FileStore::new(&self.config.data_dir))
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.engine(),
            self.store(),
            Arc::new(HttpProbe::with_timeout(self.policy.probe_request_timeout)),
            self.config.settings.clone(),
        )
        .with_policy(self.policy)
    }
}
