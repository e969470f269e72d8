//! HTTP reachability probe
//!
//! The service counts as reachable as soon as it answers an HTTP GET with any
//! status code; only transport failures (refused, reset, timed out) count as
//! unreachable.

use crate::errors::ReadinessError;
use std::time::Duration;
use tracing::{debug, warn};

/// Checks whether a URL answers at all
#[async_trait::async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Status code of the response, or a transient error if nothing answered
    async fn probe(&self, url: &str) -> std::result::Result<u16, ReadinessError>;
}

/// reqwest backed probe
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    /// Probe whose individual requests give up after `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build HTTP client with timeout: {}. Using default client.", e);
                reqwest::Client::new()
            });
        Self { client }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::with_timeout(Duration::from_secs(5))
    }
}

#[async_trait::async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn probe(&self, url: &str) -> std::result::Result<u16, ReadinessError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            let message = if e.is_timeout() {
                format!("request to {} timed out", url)
            } else if e.is_connect() {
                format!("connection to {} failed", url)
            } else {
                format!("request to {} failed: {}", url, e)
            };
            ReadinessError::Transient { message }
        })?;
        let status = response.status().as_u16();
        debug!("{} answered with HTTP {}", url, status);
        Ok(status)
    }
}

pub mod mock {
    //! Probe with scripted answers

    use super::ReachabilityProbe;
    use crate::errors::ReadinessError;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Answers from a queue, then from a fixed reachability flag
    #[derive(Debug, Default)]
    pub struct MockProbe {
        queued: Mutex<VecDeque<bool>>,
        reachable: AtomicBool,
        calls: AtomicUsize,
    }

    impl MockProbe {
        pub fn reachable() -> Self {
            let probe = Self::default();
            probe.set_reachable(true);
            probe
        }

        pub fn unreachable() -> Self {
            Self::default()
        }

        /// Answer once the queue is empty
        pub fn set_reachable(&self, reachable: bool) {
            self.reachable.store(reachable, Ordering::SeqCst);
        }

        /// Answer for the next unanswered probe
        pub fn push(&self, reachable: bool) {
            self.queued
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push_back(reachable);
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl ReachabilityProbe for MockProbe {
        async fn probe(&self, url: &str) -> std::result::Result<u16, ReadinessError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let queued = self
                .queued
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .pop_front();
            if queued.unwrap_or_else(|| self.reachable.load(Ordering::SeqCst)) {
                Ok(200)
            } else {
                Err(ReadinessError::Transient {
                    message: format!("connection to {} failed", url),
                })
            }
        }
    }
}
