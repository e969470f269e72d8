//! Up command implementation
//!
//! Activates the service: restarts the persisted container or pulls the image
//! and creates a new one, then waits for readiness and prints the admin
//! credentials. Unless detached, the command stays attached until Ctrl-C and
//! stops the container on the way out.

use anyhow::{anyhow, bail, Context, Result};
use protoman_core::orchestrator::{ActivationState, Orchestrator, ReadinessPath};
use tracing::{debug, info, instrument};

use super::credentials::render_credentials;
use super::ServiceContext;
use crate::ui::pull_bar::PullBar;
use crate::ui::spinner::PlainSpinner;

#[derive(Debug, Clone)]
pub struct UpArgs {
    /// Leave the service running and exit once it is ready
    pub detach: bool,
    pub show_secret: bool,
}

#[instrument(skip(ctx))]
pub async fn execute_up(ctx: &ServiceContext, args: UpArgs) -> Result<()> {
    let orchestrator = ctx.orchestrator();
    let image = ctx.config.settings.image.to_string();

    let bar = PullBar::new(&image);
    let sink = bar.clone();
    let subscription = orchestrator.subscribe_progress(move |percentage, status| {
        sink.update(percentage, status);
    });

    let activation = match orchestrator.activate().await {
        Ok(activation) => activation,
        Err(e) => {
            bar.abandon();
            if e.is_already_running() {
                return Err(e)
                    .context("The service is already running; use `protoman down` to stop it");
            }
            return Err(e).context("Failed to start the service");
        }
    };
    drop(subscription);
    bar.finish();
    debug!("Activation: {:?}", activation);

    let waiting = match activation.path {
        ReadinessPath::FirstRun => "Waiting for first-time setup (this can take several minutes)...",
        ReadinessPath::Subsequent => "Waiting for the service to respond...",
    };
    let spinner = PlainSpinner::start(waiting);

    let settled = tokio::select! {
        state = orchestrator.wait_until_settled() => state,
        _ = tokio::signal::ctrl_c() => {
            spinner.fail_with_message("Interrupted");
            stop_attached(&orchestrator, args.detach).await;
            return Ok(());
        }
    };

    let credentials = match settled {
        ActivationState::Ready(credentials) => {
            spinner.finish_with_message("Service is ready");
            credentials
        }
        ActivationState::Failed(message) => {
            spinner.fail_with_message("Service did not become ready");
            bail!(message);
        }
        other => {
            spinner.fail_with_message("Service did not become ready");
            return Err(anyhow!("Readiness wait ended unexpectedly in state {:?}", other));
        }
    };

    println!("{}", render_credentials(&credentials, args.show_secret));

    if args.detach {
        info!("Leaving container {} running", activation.handle);
        return Ok(());
    }

    eprintln!("Press Ctrl-C to stop the service");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    stop_attached(&orchestrator, false).await;
    Ok(())
}

/// Shutdown-time deactivation; errors are only logged
async fn stop_attached(orchestrator: &Orchestrator, detach: bool) {
    if detach {
        return;
    }
    let spinner = PlainSpinner::start("Stopping service...");
    orchestrator.shutdown().await;
    spinner.finish_with_message("Service stopped");
}
