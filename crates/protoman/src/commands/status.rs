//! Status command implementation
//!
//! Reports whether the container runtime answers, which container is
//! persisted, whether it runs, and whether the service is ready. Runtime
//! failures are part of the report rather than errors.

use anyhow::Result;
use protoman_core::docker::ContainerEngine;
use protoman_core::store::StateStore;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use super::ServiceContext;

#[derive(Debug, Clone)]
pub struct StatusArgs {
    pub json: bool,
}

/// Stdout JSON shape of `status --json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub runtime_installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_error: Option<String>,
    pub image: String,
    pub data_dir: String,
    pub handle: Option<String>,
    /// Unknown when there is no handle or the runtime could not be asked
    pub running: Option<bool>,
    pub ready: bool,
}

impl StatusReport {
    fn render(&self) -> String {
        let runtime = match (&self.runtime_version, &self.runtime_error) {
            (Some(version), _) => version.clone(),
            (None, Some(error)) => format!("unavailable ({})", error),
            (None, None) => "unavailable".to_string(),
        };
        let running = match self.running {
            Some(true) => "yes",
            Some(false) => "no",
            None => "unknown",
        };
        format!(
            "Runtime:   {}\nImage:     {}\nData dir:  {}\nContainer: {}\nRunning:   {}\nReady:     {}",
            runtime,
            self.image,
            self.data_dir,
            self.handle.as_deref().unwrap_or("none"),
            running,
            if self.ready { "yes" } else { "no" },
        )
    }
}

#[instrument(skip(ctx))]
pub async fn execute_status(ctx: &ServiceContext, args: StatusArgs) -> Result<()> {
    let (runtime_version, runtime_error) = match ctx.resolver().check_installed().await {
        Ok(version) => (Some(version), None),
        Err(e) => {
            debug!("Runtime check failed: {}", e);
            (None, Some(e.to_string()))
        }
    };

    let handle = match ctx.store().load_handle() {
        Ok(handle) => handle,
        Err(e) => {
            warn!("Ignoring unreadable container handle: {}", e);
            None
        }
    };

    let running = match (&handle, &runtime_version) {
        (Some(handle), Some(_)) => match ctx.engine().is_running(handle).await {
            Ok(running) => Some(running),
            Err(e) => {
                debug!("Running check failed: {}", e);
                None
            }
        },
        _ => None,
    };

    let ready = ctx.orchestrator().is_ready().await;

    let report = StatusReport {
        runtime_installed: runtime_version.is_some(),
        runtime_version,
        runtime_error,
        image: ctx.config.settings.image.to_string(),
        data_dir: ctx.config.data_dir.display().to_string(),
        handle,
        running,
        ready,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.render());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> StatusReport {
        StatusReport {
            runtime_installed: false,
            runtime_version: None,
            runtime_error: Some("docker executable not found".to_string()),
            image: "moodle:test".to_string(),
            data_dir: "/tmp/protoman".to_string(),
            handle: None,
            running: None,
            ready: false,
        }
    }

    #[test]
    fn test_json_field_names() {
        let value = serde_json::to_value(report()).unwrap();
        assert_eq!(value["runtimeInstalled"], false);
        assert_eq!(value["handle"], serde_json::Value::Null);
        assert!(value.get("runtimeVersion").is_none());
    }

    #[test]
    fn test_text_rendering() {
        let text = report().render();
        assert!(text.contains("unavailable (docker executable not found)"));
        assert!(text.contains("Container: none"));
        assert!(text.contains("Running:   unknown"));
    }
}
