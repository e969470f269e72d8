//! Container engine abstraction and the docker CLI implementation
//!
//! Every operation spawns exactly one runtime process and waits for it to
//! exit. Handles are validated before anything is spawned. A non-zero exit
//! becomes [`DockerError::CommandFailed`] with the combined output attached.

use crate::errors::{validate_handle, validate_image_name, DockerError, Result, ValidationError};
use crate::pull_progress::{ProgressObservers, PullProgress};
use crate::resolver::{combined_output, RuntimeResolver};
use chrono::{DateTime, SecondsFormat, Utc};
use std::process::{Output, Stdio};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Container lifecycle operations used by the orchestrator
#[async_trait::async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Whether `image` is present locally (absence is `Ok(false)`)
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Pull `image`, feeding both output streams into a progress tracker
    /// that reports to `observers`
    async fn pull_image(&self, image: &str, observers: &ProgressObservers) -> Result<()>;

    /// Create a detached container from `image` and return its id
    async fn create_and_start(&self, image: &str, port_mapping: &str) -> Result<String>;

    /// Start an existing container
    async fn start(&self, container_id: &str) -> Result<()>;

    /// Gracefully stop a container
    async fn stop(&self, container_id: &str) -> Result<()>;

    /// Kill a container
    async fn force_stop(&self, container_id: &str) -> Result<()>;

    /// Whether the container is currently running
    async fn is_running(&self, container_id: &str) -> Result<bool>;

    /// Fetch container logs, optionally only those after `since`
    async fn fetch_logs(&self, container_id: &str, since: Option<DateTime<Utc>>)
        -> Result<String>;

    /// Fail unless the container is known to the runtime
    async fn validate_exists(&self, container_id: &str) -> Result<()>;
}

/// Docker CLI backed engine
#[derive(Debug, Clone)]
pub struct CliEngine {
    resolver: Arc<RuntimeResolver>,
}

impl CliEngine {
    pub fn new(resolver: Arc<RuntimeResolver>) -> Self {
        Self { resolver }
    }

    /// Engine for `docker` resolved from the environment
    pub fn docker() -> Self {
        Self::new(Arc::new(RuntimeResolver::docker()))
    }

    pub fn resolver(&self) -> &RuntimeResolver {
        &self.resolver
    }

    /// Run the runtime with `args` and fail on non-zero exit
    async fn execute(&self, operation: &str, args: &[&str]) -> std::result::Result<Output, DockerError> {
        debug!("Running {} {}", self.resolver.binary(), args.join(" "));

        let output = self
            .resolver
            .command()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| spawn_error(operation, e))?;

        if !output.status.success() {
            return Err(DockerError::CommandFailed {
                operation: operation.to_string(),
                code: output.status.code().unwrap_or(-1),
                output: combined_output(&output.stdout, &output.stderr),
            });
        }

        Ok(output)
    }
}

impl Default for CliEngine {
    fn default() -> Self {
        Self::docker()
    }
}

fn spawn_error(operation: &str, e: std::io::Error) -> DockerError {
    if e.kind() == std::io::ErrorKind::NotFound {
        DockerError::NotInstalled {
            message: format!("{} (while running docker {})", e, operation),
        }
    } else {
        DockerError::Spawn {
            operation: operation.to_string(),
            source: e,
        }
    }
}

fn stdout_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Check that `stdout` of a create call is a plausible container id
pub fn parse_container_id(stdout: &str) -> std::result::Result<String, ValidationError> {
    // `docker run -d` may print pull chatter first; the id is the last line
    let id = stdout.lines().map(str::trim).filter(|l| !l.is_empty()).last().unwrap_or("");
    validate_handle(id)?;
    if !id.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ValidationError::new(
            "containerID",
            "contains non-hexadecimal characters",
            id,
        ));
    }
    Ok(id.to_string())
}

/// `--since` argument in RFC 3339
pub fn format_since(since: DateTime<Utc>) -> String {
    since.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[async_trait::async_trait]
impl ContainerEngine for CliEngine {
    #[instrument(skip(self))]
    async fn image_exists(&self, image: &str) -> Result<bool> {
        validate_image_name(image)?;
        let output = self
            .execute("images", &["images", "--format", "{{.Repository}}:{{.Tag}}"])
            .await?;
        let listing = String::from_utf8_lossy(&output.stdout);
        let found = listing.lines().any(|line| line.contains(image));
        debug!("Image {} present locally: {}", image, found);
        Ok(found)
    }

    #[instrument(skip(self, observers))]
    async fn pull_image(&self, image: &str, observers: &ProgressObservers) -> Result<()> {
        validate_image_name(image)?;
        info!("Pulling image {}", image);

        let mut child = self
            .resolver
            .command()
            .args(["pull", image])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error("pull", e))?;

        let stdout = child.stdout.take().ok_or_else(|| DockerError::Stream {
            message: "failed to capture pull stdout".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| DockerError::Stream {
            message: "failed to capture pull stderr".to_string(),
        })?;

        let progress = Arc::new(PullProgress::new(observers.clone()));

        let stdout_progress = Arc::clone(&progress);
        let stdout_handle =
            tokio::spawn(async move { stdout_progress.process_stream(stdout).await });
        let stderr_progress = Arc::clone(&progress);
        let stderr_handle =
            tokio::spawn(async move { stderr_progress.process_stream(stderr).await });

        let (stdout_tail, stderr_tail) = tokio::try_join!(stdout_handle, stderr_handle)
            .map_err(|e| DockerError::Stream {
                message: format!("pull output worker failed: {}", e),
            })?;

        let status = child.wait().await.map_err(|e| spawn_error("pull", e))?;

        let stdout_tail = stdout_tail?;
        let stderr_tail = stderr_tail?;

        if !status.success() {
            return Err(DockerError::CommandFailed {
                operation: "pull".to_string(),
                code: status.code().unwrap_or(-1),
                output: combined_output(stdout_tail.as_bytes(), stderr_tail.as_bytes()),
            }
            .into());
        }

        let snapshot = progress.snapshot();
        info!("Pulled {} ({:.0}%, {})", image, snapshot.percentage, snapshot.status);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn create_and_start(&self, image: &str, port_mapping: &str) -> Result<String> {
        validate_image_name(image)?;
        let output = self
            .execute("run", &["run", "-d", "-p", port_mapping, image])
            .await?;
        let id = parse_container_id(&stdout_text(&output))?;
        info!("Created container {}", &id[..12]);
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn start(&self, container_id: &str) -> Result<()> {
        validate_handle(container_id)?;
        self.execute("start", &["start", container_id]).await?;
        debug!("Container {} started", container_id);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self, container_id: &str) -> Result<()> {
        validate_handle(container_id)?;
        self.execute("stop", &["stop", container_id]).await?;
        debug!("Container {} stopped", container_id);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn force_stop(&self, container_id: &str) -> Result<()> {
        validate_handle(container_id)?;
        self.execute("kill", &["kill", container_id]).await?;
        debug!("Container {} killed", container_id);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn is_running(&self, container_id: &str) -> Result<bool> {
        validate_handle(container_id)?;
        let output = self
            .execute(
                "inspect",
                &["inspect", "--format={{.State.Running}}", container_id],
            )
            .await?;
        Ok(stdout_text(&output) == "true")
    }

    #[instrument(skip(self))]
    async fn fetch_logs(
        &self,
        container_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<String> {
        validate_handle(container_id)?;
        let since = since.map(format_since);
        let mut args = vec!["logs"];
        if let Some(since) = &since {
            args.push("--since");
            args.push(since);
        }
        args.push(container_id);

        let output = self.execute("logs", &args).await?;
        // Containers write to both streams; the log is their union
        Ok(combined_output(&output.stdout, &output.stderr))
    }

    #[instrument(skip(self))]
    async fn validate_exists(&self, container_id: &str) -> Result<()> {
        validate_handle(container_id)?;
        self.execute("inspect", &["inspect", container_id]).await?;
        Ok(())
    }
}

pub mod mock {
    //! Scriptable in-memory engine
    //!
    //! Records every call that passes handle/image validation and answers from
    //! a mutable configuration, so orchestration flows can be exercised
    //! without a container runtime.

    use super::ContainerEngine;
    use crate::errors::{validate_handle, validate_image_name, DockerError, Result};
    use crate::pull_progress::{ProgressObservers, PullProgress};
    use chrono::{DateTime, Utc};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex, MutexGuard};
    use std::time::Duration;
    use tokio::time::Instant;
    use tracing::debug;

    /// Container id handed out by [`MockEngine::create_and_start`] by default
    pub const MOCK_CONTAINER_ID: &str =
        "3f4e5d6c7b8a9f0e1d2c3b4a5f6e7d8c9b0a1f2e3d4c5b6a7f8e9d0c1b2a3f4e";

    /// One recorded engine call
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum MockCall {
        ImageExists(String),
        PullImage(String),
        CreateAndStart { image: String, port_mapping: String },
        Start(String),
        Stop(String),
        ForceStop(String),
        IsRunning(String),
        FetchLogs { id: String, since: Option<DateTime<Utc>> },
        ValidateExists(String),
    }

    /// Scripted answers for [`MockEngine`]
    #[derive(Debug, Clone)]
    pub struct MockEngineConfig {
        pub image_present: bool,
        /// Lines fed through the progress tracker during a pull
        pub pull_lines: Vec<String>,
        /// Failure message for `pull_image`
        pub pull_error: Option<String>,
        /// Id printed by the create call
        pub created_id: String,
        pub create_error: Option<String>,
        pub start_error: Option<String>,
        pub stop_error: Option<String>,
        pub force_stop_error: Option<String>,
        pub running: bool,
        pub is_running_error: Option<String>,
        /// Containers the runtime knows about
        pub known_containers: Vec<String>,
        /// Answers for successive `fetch_logs` calls; `Err` simulates a failing fetch
        pub log_responses: VecDeque<std::result::Result<String, String>>,
        /// Answer once `log_responses` is exhausted
        pub default_logs: String,
        /// Simulated duration of every call
        pub delay: Option<Duration>,
    }

    impl Default for MockEngineConfig {
        fn default() -> Self {
            Self {
                image_present: true,
                pull_lines: Vec::new(),
                pull_error: None,
                created_id: MOCK_CONTAINER_ID.to_string(),
                create_error: None,
                start_error: None,
                stop_error: None,
                force_stop_error: None,
                running: false,
                is_running_error: None,
                known_containers: Vec::new(),
                log_responses: VecDeque::new(),
                default_logs: String::new(),
                delay: None,
            }
        }
    }

    /// In-memory [`ContainerEngine`]
    #[derive(Debug, Clone, Default)]
    pub struct MockEngine {
        config: Arc<Mutex<MockEngineConfig>>,
        calls: Arc<Mutex<Vec<(MockCall, Instant)>>>,
    }

    fn failed(operation: &str, output: &str) -> DockerError {
        DockerError::CommandFailed {
            operation: operation.to_string(),
            code: 1,
            output: output.to_string(),
        }
    }

    impl MockEngine {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_config(config: MockEngineConfig) -> Self {
            Self {
                config: Arc::new(Mutex::new(config)),
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn config(&self) -> MutexGuard<'_, MockEngineConfig> {
            self.config.lock().unwrap_or_else(|p| p.into_inner())
        }

        /// Mutate the scripted configuration
        pub fn update_config<F>(&self, f: F)
        where
            F: FnOnce(&mut MockEngineConfig),
        {
            f(&mut self.config());
        }

        /// Queue the answer for the next unanswered `fetch_logs` call
        pub fn push_logs(&self, response: std::result::Result<&str, &str>) {
            self.config().log_responses.push_back(
                response
                    .map(str::to_string)
                    .map_err(str::to_string),
            );
        }

        /// Every recorded call, in order
        pub fn calls(&self) -> Vec<MockCall> {
            self.timed_calls().into_iter().map(|(call, _)| call).collect()
        }

        /// Recorded calls with the (tokio) time they were made
        pub fn timed_calls(&self) -> Vec<(MockCall, Instant)> {
            self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
        }

        /// Number of recorded calls matching `predicate`
        pub fn count<F>(&self, predicate: F) -> usize
        where
            F: Fn(&MockCall) -> bool,
        {
            self.calls().iter().filter(|c| predicate(c)).count()
        }

        pub fn clear_calls(&self) {
            self.calls.lock().unwrap_or_else(|p| p.into_inner()).clear();
        }

        async fn record(&self, call: MockCall) {
            debug!("Mock engine call: {:?}", call);
            self.calls
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push((call, Instant::now()));
            let delay = self.config().delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }
    }

    #[async_trait::async_trait]
    impl ContainerEngine for MockEngine {
        async fn image_exists(&self, image: &str) -> Result<bool> {
            validate_image_name(image)?;
            self.record(MockCall::ImageExists(image.to_string())).await;
            Ok(self.config().image_present)
        }

        async fn pull_image(&self, image: &str, observers: &ProgressObservers) -> Result<()> {
            validate_image_name(image)?;
            self.record(MockCall::PullImage(image.to_string())).await;

            let (lines, error) = {
                let config = self.config();
                (config.pull_lines.clone(), config.pull_error.clone())
            };
            let progress = PullProgress::new(observers.clone());
            for line in &lines {
                // Stream warnings are not fatal, as with the CLI engine
                let _ = progress.process_line(line);
            }
            if let Some(error) = error {
                return Err(failed("pull", &error).into());
            }
            self.config().image_present = true;
            Ok(())
        }

        async fn create_and_start(&self, image: &str, port_mapping: &str) -> Result<String> {
            validate_image_name(image)?;
            self.record(MockCall::CreateAndStart {
                image: image.to_string(),
                port_mapping: port_mapping.to_string(),
            })
            .await;

            let mut config = self.config();
            if let Some(error) = &config.create_error {
                return Err(failed("run", error).into());
            }
            let id = super::parse_container_id(&config.created_id)?;
            config.known_containers.push(id.clone());
            config.running = true;
            Ok(id)
        }

        async fn start(&self, container_id: &str) -> Result<()> {
            validate_handle(container_id)?;
            self.record(MockCall::Start(container_id.to_string())).await;
            let mut config = self.config();
            if let Some(error) = &config.start_error {
                return Err(failed("start", error).into());
            }
            config.running = true;
            Ok(())
        }

        async fn stop(&self, container_id: &str) -> Result<()> {
            validate_handle(container_id)?;
            self.record(MockCall::Stop(container_id.to_string())).await;
            let mut config = self.config();
            if let Some(error) = &config.stop_error {
                return Err(failed("stop", error).into());
            }
            config.running = false;
            Ok(())
        }

        async fn force_stop(&self, container_id: &str) -> Result<()> {
            validate_handle(container_id)?;
            self.record(MockCall::ForceStop(container_id.to_string())).await;
            let mut config = self.config();
            if let Some(error) = &config.force_stop_error {
                return Err(failed("kill", error).into());
            }
            config.running = false;
            Ok(())
        }

        async fn is_running(&self, container_id: &str) -> Result<bool> {
            validate_handle(container_id)?;
            self.record(MockCall::IsRunning(container_id.to_string())).await;
            let config = self.config();
            if let Some(error) = &config.is_running_error {
                return Err(failed("inspect", error).into());
            }
            Ok(config.running)
        }

        async fn fetch_logs(
            &self,
            container_id: &str,
            since: Option<DateTime<Utc>>,
        ) -> Result<String> {
            validate_handle(container_id)?;
            self.record(MockCall::FetchLogs {
                id: container_id.to_string(),
                since,
            })
            .await;
            let mut config = self.config();
            match config.log_responses.pop_front() {
                Some(Ok(logs)) => Ok(logs),
                Some(Err(error)) => Err(failed("logs", &error).into()),
                None => Ok(config.default_logs.clone()),
            }
        }

        async fn validate_exists(&self, container_id: &str) -> Result<()> {
            validate_handle(container_id)?;
            self.record(MockCall::ValidateExists(container_id.to_string()))
                .await;
            let config = self.config();
            if config.known_containers.iter().any(|c| c == container_id) {
                Ok(())
            } else {
                Err(failed(
                    "inspect",
                    &format!("Error: No such object: {}", container_id),
                )
                .into())
            }
        }
    }
}
