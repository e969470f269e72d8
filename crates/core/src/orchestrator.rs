//! Activation and deactivation of the managed service
//!
//! Activation either restarts the persisted container or creates a new one
//! (pulling the image first when needed), then hands off to a detached task
//! that waits for readiness:
//!
//! - a restarted instance whose secret is already known is probed over HTTP
//!   until it answers, bounded by [`ReadinessPolicy::subsequent_timeout`];
//! - a new instance has its logs polled until both credentials appear. This
//!   wait is unbounded because first-time initialization can take very long.
//!
//! Progress is published through [`ActivationState`] on a watch channel and
//! pull progress through [`ProgressObservers`].

use crate::config::{ReadinessPolicy, ServiceSettings};
use crate::credentials::{self, Credentials};
use crate::docker::ContainerEngine;
use crate::errors::{ReadinessError, Result, ResultExt, ValidationError};
use crate::probe::ReachabilityProbe;
use crate::pull_progress::{ProgressObservers, Subscription};
use crate::redaction::Masked;
use crate::store::StateStore;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// How readiness is established once the container runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessPath {
    /// Poll logs until the generated credentials show up
    FirstRun,
    /// Probe the service URL, reusing the stored secret
    Subsequent,
}

/// Where the orchestrator currently is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationState {
    Idle,
    CheckingExistingHandle,
    RestartingExisting,
    CheckingImage,
    Pulling,
    CreatingNew,
    WaitingForReadiness(ReadinessPath),
    Ready(Credentials),
    Failed(String),
}

impl ActivationState {
    /// Nothing is in flight
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Idle | Self::Ready(_) | Self::Failed(_))
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

/// Result of a successful activation call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    pub handle: String,
    pub path: ReadinessPath,
    /// The persisted container was restarted rather than created
    pub restarted: bool,
}

/// Result of a successful deactivation call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deactivation {
    AlreadyStopped,
    Stopped,
    ForceStopped,
}

/// Shared with the detached readiness task
#[derive(Clone)]
struct WaitContext {
    engine: Arc<dyn ContainerEngine>,
    store: Arc<dyn StateStore>,
    probe: Arc<dyn ReachabilityProbe>,
    policy: ReadinessPolicy,
    probe_url: String,
    state: Arc<watch::Sender<ActivationState>>,
}

impl WaitContext {
    fn set_state(&self, state: ActivationState) {
        debug!("Activation state -> {:?}", state);
        self.state.send_replace(state);
    }

    /// Replace `expected` with `state`, leaving any newer state in place
    fn replace_state_if(&self, expected: &ActivationState, state: ActivationState) {
        self.state.send_if_modified(|current| {
            if current != expected {
                return false;
            }
            debug!("Activation state -> {:?}", state);
            *current = state;
            true
        });
    }
}

/// Drives activation and deactivation of the single managed container
pub struct Orchestrator {
    ctx: WaitContext,
    settings: ServiceSettings,
    observers: ProgressObservers,
    /// Serialises activate/deactivate
    guard: tokio::sync::Mutex<()>,
    wait_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("settings", &self.settings)
            .field("policy", &self.ctx.policy)
            .field("state", &self.state())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        store: Arc<dyn StateStore>,
        probe: Arc<dyn ReachabilityProbe>,
        settings: ServiceSettings,
    ) -> Self {
        let (state, _) = watch::channel(ActivationState::Idle);
        Self {
            ctx: WaitContext {
                engine,
                store,
                probe,
                policy: ReadinessPolicy::default(),
                probe_url: settings.probe_url.clone(),
                state: Arc::new(state),
            },
            settings,
            observers: ProgressObservers::new(),
            guard: tokio::sync::Mutex::new(()),
            wait_task: Mutex::new(None),
        }
    }

    pub fn with_policy(mut self, policy: ReadinessPolicy) -> Self {
        self.ctx.policy = policy;
        self
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub fn policy(&self) -> &ReadinessPolicy {
        &self.ctx.policy
    }

    /// Current state
    pub fn state(&self) -> ActivationState {
        self.ctx.state.borrow().clone()
    }

    /// Receiver for state changes
    pub fn watch_state(&self) -> watch::Receiver<ActivationState> {
        self.ctx.state.subscribe()
    }

    /// Wait until nothing is in flight and return the settled state
    pub async fn wait_until_settled(&self) -> ActivationState {
        let mut rx = self.watch_state();
        loop {
            {
                let state = rx.borrow_and_update();
                if state.is_settled() {
                    return state.clone();
                }
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }

    /// Receive `(percentage, status)` pull progress until the subscription is dropped
    pub fn subscribe_progress<F>(&self, callback: F) -> Subscription
    where
        F: Fn(f64, &str) + Send + Sync + 'static,
    {
        self.observers.subscribe(callback)
    }

    /// Stored credentials, or defaults if they cannot be read
    pub fn credentials(&self) -> Credentials {
        self.ctx.store.load_credentials().unwrap_or_else(|e| {
            warn!("Failed to load credentials: {}", e);
            Credentials::new("", crate::credentials::DEFAULT_ENDPOINT)
        })
    }

    /// Whether the service can be used right now.
    ///
    /// With a persisted container this probes the service URL; otherwise it
    /// reports whether credentials have been stored.
    pub async fn is_ready(&self) -> bool {
        if self.ctx.store.handle_exists() {
            let reachable = self.ctx.probe.probe(&self.ctx.probe_url).await.is_ok();
            debug!("Reachability of {}: {}", self.ctx.probe_url, reachable);
            return reachable;
        }
        self.ctx.store.credentials_exist()
    }

    /// Bring the service up.
    ///
    /// Returns once the container runs; readiness is awaited on a detached
    /// task (see [`Orchestrator::wait_until_settled`]).
    #[instrument(skip(self), fields(image = %self.settings.image))]
    pub async fn activate(&self) -> Result<Activation> {
        let _guard = self
            .guard
            .try_lock()
            .map_err(|_| ReadinessError::OperationInProgress)?;
        let previous = self
            .ctx
            .state
            .send_replace(ActivationState::CheckingExistingHandle);
        debug!("Activation state {:?} -> CheckingExistingHandle", previous);

        match self.run_activation().await {
            Ok(activation) => {
                info!(
                    "Container {} running, waiting for readiness ({:?})",
                    activation.handle, activation.path
                );
                Ok(activation)
            }
            Err(e) if e.is_already_running() => {
                warn!("Activation rejected: {}", e);
                // An in-flight wait or a ready service keeps its state
                let restored = match previous {
                    ActivationState::WaitingForReadiness(_) | ActivationState::Ready(_) => {
                        previous
                    }
                    _ => ActivationState::Failed(e.to_string()),
                };
                self.ctx
                    .replace_state_if(&ActivationState::CheckingExistingHandle, restored);
                Err(e)
            }
            Err(e) => {
                error!("Activation failed: {}", e);
                self.ctx.set_state(ActivationState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn run_activation(&self) -> Result<Activation> {
        if let Some(handle) = self.existing_handle() {
            if let Some(activation) = self.try_restart(&handle).await? {
                return Ok(activation);
            }
        }

        self.create_new().await
    }

    fn existing_handle(&self) -> Option<String> {
        if !self.ctx.store.handle_exists() {
            return None;
        }
        match self.ctx.store.load_handle() {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Ignoring unreadable container handle: {}", e);
                None
            }
        }
    }

    /// `Ok(None)` means: fall through to creating a new container
    async fn try_restart(&self, handle: &str) -> Result<Option<Activation>> {
        info!("Found existing container {}", handle);

        if let Err(e) = self.ctx.engine.validate_exists(handle).await {
            warn!("Persisted container {} is unusable: {}", handle, e);
            return Ok(None);
        }

        match self.ctx.engine.is_running(handle).await {
            Ok(true) => {
                return Err(ReadinessError::AlreadyRunning {
                    handle: handle.to_string(),
                }
                .into())
            }
            Ok(false) => {}
            Err(e) => {
                warn!("Error checking container status: {}", e);
                return Ok(None);
            }
        }

        self.abort_wait_task();
        self.ctx.set_state(ActivationState::RestartingExisting);
        if let Err(e) = self.ctx.engine.start(handle).await {
            warn!(
                "Failed to start existing container {}, creating a new one: {}",
                handle, e
            );
            return Ok(None);
        }

        let path = match self.ctx.store.load_credentials() {
            Ok(creds) if creds.has_secret() => ReadinessPath::Subsequent,
            _ => {
                debug!("No stored secret for {}, reading it from the logs", handle);
                ReadinessPath::FirstRun
            }
        };
        self.spawn_wait(handle, path);

        Ok(Some(Activation {
            handle: handle.to_string(),
            path,
            restarted: true,
        }))
    }

    async fn create_new(&self) -> Result<Activation> {
        let image = self.settings.image.name().to_string();
        if image.is_empty() {
            return Err(
                ValidationError::new("imageName", "no image name configured", "").into(),
            );
        }
        self.abort_wait_task();

        self.ctx.set_state(ActivationState::CheckingImage);
        let present = self
            .ctx
            .engine
            .image_exists(&image)
            .await
            .op_context(|| format!("check image {}", image))?;

        if present {
            info!("Image {} already present", image);
        } else {
            info!("Image {} not found locally, pulling", image);
            self.ctx.set_state(ActivationState::Pulling);
            self.ctx
                .engine
                .pull_image(&image, &self.observers)
                .await
                .op_context(|| format!("pull image {}", image))?;
        }

        if let Err(e) = self.ctx.store.delete_credentials() {
            warn!("Failed to clear old credentials: {}", e);
        }

        self.ctx.set_state(ActivationState::CreatingNew);
        let handle = self
            .ctx
            .engine
            .create_and_start(&image, &self.settings.port_mapping)
            .await
            .op_context(|| format!("create container from {}", image))?;

        self.ctx
            .store
            .save_handle(&handle)
            .op_context(|| format!("save container handle {}", handle))?;

        self.spawn_wait(&handle, ReadinessPath::FirstRun);

        Ok(Activation {
            handle,
            path: ReadinessPath::FirstRun,
            restarted: false,
        })
    }

    fn spawn_wait(&self, handle: &str, path: ReadinessPath) {
        self.ctx.set_state(ActivationState::WaitingForReadiness(path));
        let ctx = self.ctx.clone();
        let handle = handle.to_string();
        let task = tokio::spawn(async move {
            let outcome = match path {
                ReadinessPath::FirstRun => wait_first_run(&ctx, &handle).await,
                ReadinessPath::Subsequent => wait_subsequent(&ctx).await,
            };
            match outcome {
                Ok(creds) => {
                    info!("Service ready at {}", creds.endpoint);
                    ctx.set_state(ActivationState::Ready(creds));
                }
                Err(e) => {
                    error!("Waiting for readiness failed: {}", e);
                    ctx.set_state(ActivationState::Failed(e.to_string()));
                }
            }
        });

        let previous = self
            .wait_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn abort_wait_task(&self) -> bool {
        let task = self
            .wait_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        match task {
            Some(task) if !task.is_finished() => {
                debug!("Cancelling readiness wait");
                task.abort();
                true
            }
            _ => false,
        }
    }

    /// Stop the persisted container, falling back to a kill
    #[instrument(skip(self))]
    pub async fn deactivate(&self) -> Result<Deactivation> {
        let _guard = self
            .guard
            .try_lock()
            .map_err(|_| ReadinessError::OperationInProgress)?;

        if self.abort_wait_task() {
            self.ctx.set_state(ActivationState::Idle);
        }

        if !self.ctx.store.handle_exists() {
            return Err(ReadinessError::NoHandle.into());
        }
        let handle = self
            .ctx
            .store
            .load_handle()
            .op_context(|| "load container handle")?
            .ok_or(ReadinessError::NoHandle)?;

        self.ctx
            .engine
            .validate_exists(&handle)
            .await
            .op_context(|| format!("validate container {}", handle))?;

        let outcome = stop_container(self.ctx.engine.as_ref(), &handle).await?;
        self.ctx.set_state(ActivationState::Idle);
        Ok(outcome)
    }

    /// Teardown variant of [`Orchestrator::deactivate`]: never fails, only logs
    pub async fn shutdown(&self) {
        info!("Shutdown initiated");
        let _guard = match self.guard.try_lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                warn!("Activation in progress during shutdown, stopping anyway");
                None
            }
        };
        self.abort_wait_task();

        let handle = match self.ctx.store.load_handle() {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                info!("No container handle found during shutdown");
                return;
            }
            Err(e) => {
                error!("Failed to load container handle during shutdown: {}", e);
                return;
            }
        };

        match stop_container(self.ctx.engine.as_ref(), &handle).await {
            Ok(outcome) => info!("Container {} at shutdown: {:?}", handle, outcome),
            Err(e) => error!("Failed to stop container during shutdown: {}", e),
        }
        self.ctx.set_state(ActivationState::Idle);
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.abort_wait_task();
    }
}

async fn stop_container(engine: &dyn ContainerEngine, handle: &str) -> Result<Deactivation> {
    match engine.is_running(handle).await {
        Ok(false) => {
            info!("Container {} is already stopped", handle);
            return Ok(Deactivation::AlreadyStopped);
        }
        Ok(true) => {}
        Err(e) => warn!(
            "Failed to check status of {}, attempting to stop anyway: {}",
            handle, e
        ),
    }

    let graceful = match engine.stop(handle).await {
        Ok(()) => {
            info!("Container {} stopped gracefully", handle);
            return Ok(Deactivation::Stopped);
        }
        Err(e) => e,
    };
    warn!("Graceful stop failed, attempting force stop: {}", graceful);

    match engine.force_stop(handle).await {
        Ok(()) => {
            warn!("Container {} force stopped", handle);
            Ok(Deactivation::ForceStopped)
        }
        Err(force) => Err(ReadinessError::StopFailed {
            graceful: graceful.to_string(),
            force: force.to_string(),
        }
        .into()),
    }
}

/// Poll logs until both credentials are present, then persist them
async fn wait_first_run(ctx: &WaitContext, handle: &str) -> Result<Credentials> {
    info!("First run: extracting credentials from container logs");
    let mut consecutive_failures = 0u32;

    loop {
        match ctx.engine.fetch_logs(handle, None).await {
            Ok(logs) => {
                consecutive_failures = 0;
                let found = credentials::extract(&logs);
                debug!(
                    secret = %Masked(&found.secret),
                    endpoint = %found.endpoint,
                    "Credentials extracted"
                );
                if found.is_complete() {
                    ctx.store
                        .save_credentials(&found.secret, &found.endpoint)
                        .op_context(|| "save credentials")?;
                    info!("Credentials extracted and saved");
                    return Ok(found);
                }
                tokio::time::sleep(ctx.policy.poll_interval).await;
            }
            Err(e) => {
                consecutive_failures += 1;
                let transient = ReadinessError::Transient {
                    message: e.to_string(),
                };
                debug!("{} (consecutive: {})", transient, consecutive_failures);
                let delay = if consecutive_failures > ctx.policy.backoff_after {
                    if consecutive_failures == ctx.policy.backoff_after + 1 {
                        warn!("Repeated log fetch failures, slowing down polling");
                    }
                    ctx.policy.backoff_interval
                } else {
                    ctx.policy.poll_interval
                };
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Probe the service until it answers, then persist the stored secret with
/// the probed endpoint
async fn wait_subsequent(ctx: &WaitContext) -> Result<Credentials> {
    info!("Subsequent run: probing {}", ctx.probe_url);
    let known = ctx.store.load_credentials().op_context(|| "load credentials")?;
    let started = Instant::now();

    while started.elapsed() < ctx.policy.subsequent_timeout {
        match ctx.probe.probe(&ctx.probe_url).await {
            Ok(status) => {
                info!("Service answered with HTTP {}", status);
                ctx.store
                    .save_credentials(&known.secret, &ctx.probe_url)
                    .op_context(|| "save credentials")?;
                return Ok(Credentials::new(known.secret, ctx.probe_url.clone()));
            }
            Err(e) => debug!("{}", e),
        }
        tokio::time::sleep(ctx.policy.poll_interval).await;
    }

    Err(ReadinessError::Timeout {
        elapsed: round_secs(started.elapsed()),
    }
    .into())
}

fn round_secs(elapsed: Duration) -> Duration {
    Duration::from_secs(elapsed.as_secs())
}
