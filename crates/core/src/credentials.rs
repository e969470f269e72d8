//! Credential extraction from service log output
//!
//! On first start the service prints a generated admin password and the URL it
//! is reachable at. [`extract`] pulls both out of accumulated log text; it is
//! pure and can be re-run on the growing log on every poll.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Endpoint assumed when none has been observed yet
pub const DEFAULT_ENDPOINT: &str = "http://localhost:8080";

/// Username of the generated admin account
pub const DEFAULT_USERNAME: &str = "admin";

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:Generated admin password:|Password:)[ \t]*(\S.*)")
        .expect("valid secret pattern")
});

static ENDPOINT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Moodle is available at:[ \t]*(\S.*)").expect("valid endpoint pattern")
});

/// Secret and endpoint of one activation cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub secret: String,
    pub endpoint: String,
}

impl Credentials {
    pub fn new(secret: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            endpoint: endpoint.into(),
        }
    }

    /// Both the secret and the endpoint are known
    pub fn is_complete(&self) -> bool {
        !self.secret.is_empty() && !self.endpoint.is_empty()
    }

    pub fn has_secret(&self) -> bool {
        !self.secret.is_empty()
    }

    pub fn has_endpoint(&self) -> bool {
        !self.endpoint.is_empty()
    }
}

/// Search `text` for the secret and endpoint markers.
///
/// The first occurrence of each marker wins, so running this on a superset of
/// earlier text never loses a value that was already found.
pub fn extract(text: &str) -> Credentials {
    Credentials {
        secret: first_capture(&SECRET_PATTERN, text),
        endpoint: first_capture(&ENDPOINT_PATTERN, text),
    }
}

fn first_capture(pattern: &Regex, text: &str) -> String {
    pattern
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}
