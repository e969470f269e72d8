//! Credentials command implementation
//!
//! Prints the admin credentials captured during the last first-run
//! activation. The password is masked unless explicitly requested.

use anyhow::{Context, Result};
use protoman_core::credentials::{Credentials, DEFAULT_USERNAME};
use protoman_core::redaction::mask_secret;
use protoman_core::store::StateStore;
use serde::Serialize;
use tracing::debug;

use super::ServiceContext;

#[derive(Debug, Clone)]
pub struct CredentialsArgs {
    pub json: bool,
    pub show_secret: bool,
}

/// Stdout JSON shape of `credentials --json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialsReport {
    pub username: String,
    pub password: String,
    pub url: String,
    /// Whether credentials were found on disk
    pub stored: bool,
}

impl CredentialsReport {
    pub fn new(credentials: &Credentials, stored: bool, show_secret: bool) -> Self {
        let password = if !credentials.has_secret() {
            String::new()
        } else if show_secret {
            credentials.secret.clone()
        } else {
            mask_secret(&credentials.secret)
        };
        Self {
            username: DEFAULT_USERNAME.to_string(),
            password,
            url: credentials.endpoint.clone(),
            stored,
        }
    }
}

/// Human-readable credential block
pub fn render_credentials(credentials: &Credentials, show_secret: bool) -> String {
    let report = CredentialsReport::new(credentials, true, show_secret);
    format!(
        "Username: {}\nPassword: {}\nURL:      {}",
        report.username, report.password, report.url
    )
}

pub fn execute_credentials(ctx: &ServiceContext, args: CredentialsArgs) -> Result<()> {
    let store = ctx.store();
    let stored = store.credentials_exist();
    let credentials = store
        .load_credentials()
        .context("Failed to read stored credentials")?;
    debug!("Credentials stored: {}", stored);

    if args.json {
        let report = CredentialsReport::new(&credentials, stored, args.show_secret);
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if !stored {
        println!("No credentials stored yet. Run `protoman up` to start the service.");
        return Ok(());
    }
    println!("{}", render_credentials(&credentials, args.show_secret));
    Ok(())
}
