#![cfg(unix)]
#![allow(clippy::expect_used)]
// Support code lives in the `core_test_support` crate under tests/common.

use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

use cloud_codex_core::GatewayErr;
use cloud_codex_core::registry::RegistryEventKind;
use cloud_codex_core::registry::SessionRegistry;
use cloud_codex_core::registry::SessionState;
use cloud_codex_protocol::ir::THREAD_START_METHOD;
use core_test_support::test_config;
use core_test_support::write_fake_agent;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_session_per_user() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let script = write_fake_agent(dir.path());
    let registry = SessionRegistry::new(test_config(&dir.path().join("ws"), &script));

    let first = registry.get_or_create("u1").await?;
    let second = registry.get_or_create("u1").await?;
    assert_eq!(first.id, second.id);
    assert_eq!(first.state(), SessionState::Ready);
    assert!(first.working_directory.is_dir());
    assert!(first.working_directory.ends_with("u1"));

    let other = registry.get_or_create("u2").await?;
    assert_ne!(first.id, other.id);

    registry.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_get_or_create_yields_the_same_session() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let script = write_fake_agent(dir.path());
    let registry = SessionRegistry::new(test_config(&dir.path().join("ws"), &script));

    let (a, b) = tokio::join!(registry.get_or_create("u1"), registry.get_or_create("u1"));
    assert_eq!(a?.id, b?.id);

    registry.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn destroy_stops_the_agent_and_removes_the_workspace() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let script = write_fake_agent(dir.path());
    let registry = SessionRegistry::new(test_config(&dir.path().join("ws"), &script));

    let session = registry.get_or_create("u1").await?;
    let workspace = session.working_directory.clone();
    assert!(workspace.is_dir());

    registry.destroy(&session.id).await?;
    assert!(!workspace.exists());
    assert!(session.supervisor.is_closed());
    assert!(matches!(
        registry.get(&session.id),
        Err(GatewayErr::SessionNotFound(_))
    ));
    assert!(registry.session_for_user("u1").is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_failure_leaves_no_session_behind() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    // An "agent" that exits immediately: the initialize call can never
    // complete and the registry must not retain an entry.
    let mut config = test_config(&dir.path().join("ws"), dir.path());
    config.agent.program = "/bin/sh".to_string();
    config.agent.args = vec!["-c".to_string(), "true".to_string()];
    config.request_timeout_ms = 500;
    let registry = SessionRegistry::new(config);

    let err = registry
        .get_or_create("u1")
        .await
        .expect_err("handshake cannot succeed");
    assert!(matches!(err, GatewayErr::Handshake(_)));
    assert!(registry.session_for_user("u1").is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_sessions_are_reaped() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let script = write_fake_agent(dir.path());
    let mut config = test_config(&dir.path().join("ws"), &script);
    config.idle_timeout_ms = 50;
    let registry = SessionRegistry::new(config);

    let session = registry.get_or_create("u1").await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    registry.sweep_idle().await;

    assert!(registry.session_for_user("u1").is_none());
    assert!(!session.working_directory.exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn busy_sessions_survive_the_sweep() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let script = write_fake_agent(dir.path());
    let mut config = test_config(&dir.path().join("ws"), &script);
    config.idle_timeout_ms = 50;
    let registry = SessionRegistry::new(config);

    let session = registry.get_or_create("u1").await?;
    // turn/started with no turn/completed leaves the session busy.
    session
        .supervisor
        .call(cloud_codex_protocol::ir::TURN_START_METHOD, Some(json!({})))
        .await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(session.state(), SessionState::Busy);

    registry.sweep_idle().await;
    assert!(registry.session_for_user("u1").is_some());

    registry.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registry_events_are_tagged_with_session_and_user() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let script = write_fake_agent(dir.path());
    let registry = SessionRegistry::new(test_config(&dir.path().join("ws"), &script));

    let session = registry.get_or_create("u1").await?;
    let mut events = registry.subscribe();

    session
        .supervisor
        .call(THREAD_START_METHOD, Some(json!({})))
        .await?;

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await??;
    assert_eq!(event.user_id, "u1");
    assert_eq!(event.session_id, session.id);
    let RegistryEventKind::SessionEvent(raw) = &event.kind else {
        panic!("expected the forwarded agent notification first");
    };
    assert_eq!(raw.ty, "thread/started");

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await??;
    assert!(matches!(event.kind, RegistryEventKind::IrUpdate(_)));

    registry.shutdown().await;
    Ok(())
}
