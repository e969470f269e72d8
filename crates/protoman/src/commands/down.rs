//! Down command implementation
//!
//! Stops the persisted service container. A graceful stop that fails is
//! followed by a kill; the container and its handle are kept so the next
//! `up` restarts the same instance.

use anyhow::{Context, Result};
use protoman_core::orchestrator::Deactivation;
use tracing::{debug, instrument};

use super::ServiceContext;
use crate::ui::spinner::PlainSpinner;

#[instrument(skip(ctx))]
pub async fn execute_down(ctx: &ServiceContext) -> Result<()> {
    debug!("Starting down command execution");
    let orchestrator = ctx.orchestrator();

    let spinner = PlainSpinner::start("Stopping service...");
    match orchestrator.deactivate().await {
        Ok(outcome) => {
            spinner.finish_with_message(describe(outcome));
            Ok(())
        }
        Err(e) => {
            spinner.fail_with_message("Failed to stop service");
            Err(e).context("Failed to stop the service container")
        }
    }
}

fn describe(outcome: Deactivation) -> &'static str {
    match outcome {
        Deactivation::AlreadyStopped => "Service is already stopped",
        Deactivation::Stopped => "Service stopped",
        Deactivation::ForceStopped => "Service stopped (forced)",
    }
}
