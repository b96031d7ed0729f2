#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use searchy_core::config::{BackendConfig, Config, HealthConfig};
use searchy_core::endpoint::{EndpointState, ServiceEndpoint};
use searchy_core::health::{HealthError, ProbeError, ReadinessProbe};
use searchy_core::session::{Session, SessionError, SessionEvent};

struct AlwaysReady;

#[async_trait]
impl ReadinessProbe for AlwaysReady {
    async fn probe(&self, _endpoint: &ServiceEndpoint) -> Result<(), ProbeError> {
        Ok(())
    }
}

fn config(name: &str, script: &str, max_attempts: u32) -> Config {
    Config {
        backend: BackendConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "{marker}".to_string()],
            role_marker: format!("searchy-session-{}-{name}", std::process::id()),
            base_port: 47_300,
            stop_grace_ms: 1_000,
            startup_attempts: 2,
            ..Default::default()
        },
        health: HealthConfig {
            initial_delay_ms: 10,
            backoff_factor: 2,
            max_delay_ms: 200,
            max_attempts,
            probe_timeout_ms: 200,
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn ready_backend_death_is_reported_and_restart_recovers() {
    let cfg = config("degraded", "sleep 0.5; exit 4", 5);
    let mut session = Session::start_with_probe(cfg, Arc::new(AlwaysReady))
        .await
        .unwrap();
    let first = session.endpoint().unwrap();
    assert_eq!(first.state(), EndpointState::Ready);

    let event = tokio::time::timeout(Duration::from_secs(5), session.next_event())
        .await
        .unwrap();
    assert_eq!(
        event,
        Some(SessionEvent::BackendExited {
            port: first.port(),
            code: Some(4),
        })
    );
    assert_eq!(first.state(), EndpointState::Failed);

    let second = session.restart().await.unwrap();
    assert_eq!(second.state(), EndpointState::Ready);

    session.shutdown().await;
    assert_eq!(second.state(), EndpointState::Stopped);
    assert!(session.endpoint().is_none());
}

#[tokio::test]
async fn backend_that_never_answers_health_is_unavailable() {
    let cfg = config("silent", "trap 'exit 0' TERM; while :; do sleep 0.1; done", 2);

    let error = Session::start(cfg).await.err().unwrap();

    assert!(matches!(
        error,
        SessionError::Health(HealthError::ServiceUnavailable { attempts: 2, .. })
    ));
    assert!(error.is_retryable());
}

#[tokio::test]
async fn early_exit_is_retried_then_reported() {
    let cfg = config("early-exit", "exit 2", 10);

    let error = Session::start(cfg).await.err().unwrap();

    assert!(matches!(
        error,
        SessionError::UnexpectedExit { code: Some(2), .. }
    ));
}

#[tokio::test]
async fn invalid_config_is_not_retryable() {
    let mut cfg = config("invalid", "exit 0", 1);
    cfg.hotkey = "Space".to_string();

    let error = Session::start(cfg).await.err().unwrap();

    assert!(matches!(error, SessionError::Config(_)));
    assert!(!error.is_retryable());
}

#[tokio::test]
async fn clients_and_cache_are_shared_per_session() {
    let cfg = config("parts", "trap 'exit 0' TERM; while :; do sleep 0.1; done", 3);
    let mut session = Session::start_with_probe(cfg, Arc::new(AlwaysReady))
        .await
        .unwrap();

    let first = session.search_client();
    let second = session.search_client();
    first.cancel();
    assert_eq!(first.current_generation(), 1);
    assert_eq!(second.current_generation(), 0);
    assert_eq!(session.cache().stats().entries, 0);
    assert!(session.take_progress().is_some());

    session.shutdown().await;
}

#[tokio::test]
async fn unobserved_crash_does_not_resurface_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let flag = dir.path().join("crashed-once");
    let script = format!(
        "if [ -e '{flag}' ]; then trap 'exit 0' TERM; while :; do sleep 0.1; done; else touch '{flag}'; sleep 0.3; exit 4; fi",
        flag = flag.display()
    );
    let mut session = Session::start_with_probe(config("crash-restart", &script, 5), Arc::new(AlwaysReady))
        .await
        .unwrap();
    let first = session.endpoint().unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while first.state() != EndpointState::Failed {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    let second = session.restart().await.unwrap();
    assert_eq!(second.state(), EndpointState::Ready);

    let stale = tokio::time::timeout(Duration::from_millis(500), session.next_event()).await;
    assert!(stale.is_err(), "old crash reported against the new launch: {stale:?}");
    assert_eq!(second.state(), EndpointState::Ready);

    session.shutdown().await;
}
