//! Integration tests for activation and deactivation without Docker
//!
//! These tests drive the orchestrator against the mock engine and a
//! file-backed state store in a temporary directory, covering the full
//! lifecycle: first run with pull and log polling, restart of a stopped
//! instance, and teardown.

use anyhow::Result;
use protoman_core::config::{ReadinessPolicy, ServiceImage, ServiceSettings};
use protoman_core::docker::mock::{MockCall, MockEngine, MockEngineConfig, MOCK_CONTAINER_ID};
use protoman_core::orchestrator::{ActivationState, Deactivation, Orchestrator, ReadinessPath};
use protoman_core::probe::mock::MockProbe;
use protoman_core::pull_progress::STATUS_ONLY;
use protoman_core::store::{FileStore, StateStore};
use protoman_core::Credentials;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const IMAGE: &str = "wenkhairu/moodle-prototype:502-stable";

fn fast_policy() -> ReadinessPolicy {
    ReadinessPolicy::default()
        .with_poll_interval(Duration::from_millis(5))
        .with_backoff(5, Duration::from_millis(10))
        .with_subsequent_timeout(Duration::from_millis(300))
}

/// Test helper wiring an orchestrator to the given collaborators
fn orchestrator(
    engine: &Arc<MockEngine>,
    store: &Arc<FileStore>,
    probe: &Arc<MockProbe>,
) -> Orchestrator {
    let settings = ServiceSettings::default().with_image(ServiceImage::new(IMAGE).unwrap());
    Orchestrator::new(engine.clone(), store.clone(), probe.clone(), settings)
        .with_policy(fast_policy())
}

fn pull_transcript() -> Vec<String> {
    [
        "502-stable: Pulling from wenkhairu/moodle-prototype",
        "a1b2c3d4e5f6: Pulling fs layer",
        "0f9e8d7c6b5a: Pulling fs layer",
        "a1b2c3d4e5f6: Downloading [=====>     ]  5MB/10MB",
        "0f9e8d7c6b5a: Downloading [=>         ]  2MB/20MB",
        "a1b2c3d4e5f6: Downloading [==========>] 10MB/10MB",
        "a1b2c3d4e5f6: Download complete",
        "a1b2c3d4e5f6: Extracting [=====>     ]  5MB/10MB",
        "0f9e8d7c6b5a: Downloading [==========>] 20MB/20MB",
        "a1b2c3d4e5f6: Pull complete",
        "0f9e8d7c6b5a: Extracting [==========>] 20MB/20MB",
        "0f9e8d7c6b5a: Pull complete",
        "Digest: sha256:4f4fb700ef54461cfa02571ae0db9a0dc1e0cdb5577484a6d75e68dc38e8acc1",
        "Status: Downloaded newer image for wenkhairu/moodle-prototype:502-stable",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[tokio::test]
async fn test_first_run_pulls_creates_and_extracts_credentials() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let store = Arc::new(FileStore::new(temp_dir.path()));
    let engine = Arc::new(MockEngine::with_config(MockEngineConfig {
        image_present: false,
        pull_lines: pull_transcript(),
        ..Default::default()
    }));
    engine.push_logs(Ok("Starting Moodle setup...\n"));
    engine.push_logs(Ok("Starting Moodle setup...\nInstalling database\n"));
    engine.push_logs(Ok(concat!(
        "Starting Moodle setup...\n",
        "Installing database\n",
        "Generated admin password: Xy7#kq2!\n",
        "Moodle is available at: http://localhost:8080\n",
    )));
    let probe = Arc::new(MockProbe::unreachable());
    let orch = orchestrator(&engine, &store, &probe);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _subscription = orch.subscribe_progress(move |percentage, status| {
        sink.lock().unwrap().push((percentage, status.to_string()));
    });

    let activation = orch.activate().await?;
    assert_eq!(activation.handle, MOCK_CONTAINER_ID);
    assert_eq!(activation.path, ReadinessPath::FirstRun);
    assert_eq!(engine.count(|c| matches!(c, MockCall::PullImage(_))), 1);

    let settled = orch.wait_until_settled().await;
    assert_eq!(
        settled,
        ActivationState::Ready(Credentials::new("Xy7#kq2!", "http://localhost:8080"))
    );
    assert_eq!(engine.count(|c| matches!(c, MockCall::FetchLogs { .. })), 3);

    // Persisted state survives a fresh store instance
    let reopened = FileStore::new(temp_dir.path());
    assert_eq!(reopened.load_handle()?.as_deref(), Some(MOCK_CONTAINER_ID));
    assert_eq!(
        reopened.load_credentials()?,
        Credentials::new("Xy7#kq2!", "http://localhost:8080")
    );

    let seen = seen.lock().unwrap();
    let percentages: Vec<f64> = seen
        .iter()
        .map(|(p, _)| *p)
        .filter(|p| *p != STATUS_ONLY)
        .collect();
    assert!(!percentages.is_empty());
    assert!(percentages.windows(2).all(|w| w[1] >= w[0]));
    assert_eq!(*percentages.last().unwrap(), 100.0);
    assert!(seen
        .iter()
        .any(|(p, s)| *p == STATUS_ONLY && s.starts_with("Downloaded newer image")));
    Ok(())
}

#[tokio::test]
async fn test_restart_after_stop_reuses_secret() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let store = Arc::new(FileStore::new(temp_dir.path()));
    let engine = Arc::new(MockEngine::new());
    engine.update_config(|c| {
        c.default_logs =
            "Generated admin password: first-pw\nMoodle is available at: http://localhost:8080\n"
                .to_string()
    });
    let probe = Arc::new(MockProbe::unreachable());
    probe.push(false);
    probe.push(false);
    probe.push(true);

    let orch = orchestrator(&engine, &store, &probe);
    orch.activate().await?;
    assert!(orch.wait_until_settled().await.is_ready());
    assert_eq!(orch.deactivate().await?, Deactivation::Stopped);
    assert_eq!(orch.state(), ActivationState::Idle);

    engine.clear_calls();
    let activation = orch.activate().await?;
    assert!(activation.restarted);
    assert_eq!(activation.path, ReadinessPath::Subsequent);
    assert_eq!(
        orch.wait_until_settled().await,
        ActivationState::Ready(Credentials::new("first-pw", "http://localhost:8080"))
    );
    assert_eq!(
        engine.count(|c| matches!(
            c,
            MockCall::ImageExists(_) | MockCall::PullImage(_) | MockCall::CreateAndStart { .. }
        )),
        0
    );
    assert_eq!(probe.calls(), 3);
    Ok(())
}

#[tokio::test]
async fn test_running_instance_is_not_touched() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let store = Arc::new(FileStore::new(temp_dir.path()));
    store.save_handle(MOCK_CONTAINER_ID)?;
    store.save_credentials("keep", "http://localhost:8080")?;
    let engine = Arc::new(MockEngine::with_config(MockEngineConfig {
        running: true,
        image_present: false,
        known_containers: vec![MOCK_CONTAINER_ID.to_string()],
        ..Default::default()
    }));
    let probe = Arc::new(MockProbe::reachable());
    let orch = orchestrator(&engine, &store, &probe);

    let err = orch.activate().await.unwrap_err();
    assert!(err.is_already_running());
    assert_eq!(
        engine.calls(),
        vec![
            MockCall::ValidateExists(MOCK_CONTAINER_ID.to_string()),
            MockCall::IsRunning(MOCK_CONTAINER_ID.to_string()),
        ]
    );
    assert_eq!(store.load_credentials()?.secret, "keep");
    Ok(())
}

#[tokio::test]
async fn test_stale_handle_is_replaced() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let store = Arc::new(FileStore::new(temp_dir.path()));
    store.save_handle("0123456789abcdef")?;
    store.save_credentials("stale", "http://localhost:8080")?;
    let engine = Arc::new(MockEngine::new());
    let probe = Arc::new(MockProbe::unreachable());
    let orch = orchestrator(&engine, &store, &probe);

    let activation = orch.activate().await?;
    assert!(!activation.restarted);
    assert_eq!(store.load_handle()?.as_deref(), Some(MOCK_CONTAINER_ID));
    // Credentials of the previous instance are cleared before creation
    assert!(!store.credentials_exist());
    Ok(())
}

#[tokio::test]
async fn test_unreachable_restart_times_out() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let store = Arc::new(FileStore::new(temp_dir.path()));
    store.save_handle(MOCK_CONTAINER_ID)?;
    store.save_credentials("keep", "http://localhost:8080")?;
    let engine = Arc::new(MockEngine::with_config(MockEngineConfig {
        known_containers: vec![MOCK_CONTAINER_ID.to_string()],
        ..Default::default()
    }));
    let probe = Arc::new(MockProbe::unreachable());
    let orch = orchestrator(&engine, &store, &probe);

    orch.activate().await?;
    match orch.wait_until_settled().await {
        ActivationState::Failed(message) => assert!(message.contains("Timed out")),
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(probe.calls() >= 2);
    Ok(())
}

#[tokio::test]
async fn test_force_stop_fallback_succeeds() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let store = Arc::new(FileStore::new(temp_dir.path()));
    store.save_handle(MOCK_CONTAINER_ID)?;
    let engine = Arc::new(MockEngine::with_config(MockEngineConfig {
        running: true,
        known_containers: vec![MOCK_CONTAINER_ID.to_string()],
        stop_error: Some("Error response from daemon: timeout".to_string()),
        ..Default::default()
    }));
    let probe = Arc::new(MockProbe::unreachable());
    let orch = orchestrator(&engine, &store, &probe);

    assert_eq!(orch.deactivate().await?, Deactivation::ForceStopped);
    let calls = engine.calls();
    assert_eq!(
        &calls[calls.len() - 2..],
        &[
            MockCall::Stop(MOCK_CONTAINER_ID.to_string()),
            MockCall::ForceStop(MOCK_CONTAINER_ID.to_string()),
        ]
    );
    // The handle is kept so the instance can be restarted later
    assert!(store.handle_exists());
    Ok(())
}

#[tokio::test]
async fn test_shutdown_without_handle_is_quiet() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let store = Arc::new(FileStore::new(temp_dir.path().join("never-created")));
    let engine = Arc::new(MockEngine::new());
    let probe = Arc::new(MockProbe::unreachable());
    let orch = orchestrator(&engine, &store, &probe);

    orch.shutdown().await;
    assert!(engine.calls().is_empty());
    assert!(!orch.is_ready().await);
    Ok(())
}
