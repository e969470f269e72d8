//! Logs command implementation

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use protoman_core::docker::ContainerEngine;
use protoman_core::redaction::redact;
use protoman_core::store::StateStore;

use super::ServiceContext;

#[derive(Debug, Clone)]
pub struct LogsArgs {
    pub since: Option<String>,
    pub show_secret: bool,
}

/// Parse an RFC 3339 timestamp given on the command line
pub fn parse_since(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Invalid --since timestamp '{}' (expected RFC 3339)", value))
}

pub async fn execute_logs(ctx: &ServiceContext, args: LogsArgs) -> Result<()> {
    let since = args.since.as_deref().map(parse_since).transpose()?;

    let store = ctx.store();
    let handle = store
        .load_handle()
        .context("Failed to read the container handle")?
        .ok_or_else(|| anyhow!("No container handle found. Run `protoman up` first."))?;

    let logs = ctx
        .engine()
        .fetch_logs(&handle, since)
        .await
        .with_context(|| format!("Failed to fetch logs of container {}", handle))?;

    if args.show_secret {
        print!("{}", logs);
    } else {
        let secret = store.load_credentials().map(|c| c.secret).unwrap_or_default();
        print!("{}", redact(&logs, &[&secret]));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_since() {
        assert_eq!(
            parse_since("2024-05-01T14:30:00+02:00").unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
        );
        let err = parse_since("yesterday").unwrap_err();
        assert!(err.to_string().contains("Invalid --since"));
    }
}
