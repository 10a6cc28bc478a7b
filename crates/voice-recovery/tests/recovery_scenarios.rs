//! End-to-end recovery scenarios driven on a paused clock

use std::sync::Arc;
use std::time::Duration;
use voice_recovery::prelude::*;
use voice_recovery::checkpoint_key;
use voice_recovery_testing::{sample_snapshot, GatedPersister, MockEnvironment, PingOutcome};

fn config() -> RecoveryConfig {
    RecoveryConfig::new().with_jitter(false)
}

fn orchestrator(env: &MockEnvironment, config: RecoveryConfig) -> RecoveryOrchestrator {
    RecoveryOrchestrator::new(
        config,
        Collaborators {
            state_provider: env.provider.clone(),
            restorer: env.restorer.clone(),
            transport: env.transport.clone(),
            persister: Some(Arc::new(MemoryPersister::new())),
            notifications: env.notifications.clone(),
            diagnostics: env.diagnostics.clone(),
        },
    )
    .unwrap()
}

fn session(env: MockEnvironment, id: &str) -> (MockEnvironment, SessionId) {
    let env = env.with_session(id, sample_snapshot("student-1", "fractions"));
    (env, SessionId::new(id))
}

async fn advance(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

// ============================================================================
// Scenario A: reconnect within two attempts
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_reconnects_on_second_attempt() {
    let (env, s1) = session(MockEnvironment::new(), "S1");
    env.transport.push_pings([PingOutcome::Nack, PingOutcome::Ack]);
    let orch = orchestrator(&env, config());

    orch.on_connection_lost(&s1, Some("network changed")).await;
    assert_eq!(orch.state(&s1), Some(RecoveryState::Recovering));
    assert!(orch.is_recovering(&s1));
    assert!(orch.checkpoint(&s1).is_some());

    advance(10).await;

    assert_eq!(orch.state(&s1), Some(RecoveryState::Restored));
    assert!(!orch.is_recovering(&s1));
    assert_eq!(env.transport.reconnects(), 2);

    let metrics = orch.metrics();
    assert_eq!(metrics.total_recovery_attempts, 1);
    assert_eq!(metrics.successful_recoveries, 1);
    assert_eq!(metrics.failed_recoveries, 0);
    // Delays of 1s then 2s.
    assert_eq!(metrics.average_recovery_time_ms, 3_000);

    let payloads = env.restorer.payloads();
    assert_eq!(payloads.len(), 1);
    assert!(payloads[0].resume_from_checkpoint);

    // The unstable warning is superseded by the recovery inside the debounce window.
    assert_eq!(env.notifications.count(NotificationType::SessionRecovered), 1);
    assert_eq!(env.notifications.count(NotificationType::ConnectionUnstable), 0);
}

#[tokio::test(start_paused = true)]
async fn test_ping_timeout_counts_as_failed_attempt() {
    let (env, s1) = session(MockEnvironment::new(), "S1");
    env.transport.push_pings([PingOutcome::Hang, PingOutcome::Ack]);
    let orch = orchestrator(&env, config());

    orch.on_connection_lost(&s1, None).await;

    // 1s wait + 5s ping timeout, then 2s wait.
    advance(7).await;
    assert_eq!(orch.state(&s1), Some(RecoveryState::Recovering));

    advance(2).await;
    assert_eq!(orch.state(&s1), Some(RecoveryState::Restored));
    assert_eq!(env.transport.pings(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_connection_restored_signal_completes_recovery() {
    let (env, s1) = session(MockEnvironment::new(), "S1");
    let orch = orchestrator(&env, config());

    orch.on_connection_lost(&s1, None).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    orch.on_connection_restored(&s1).await;

    assert_eq!(orch.state(&s1), Some(RecoveryState::Restored));
    assert_eq!(orch.metrics().successful_recoveries, 1);

    // The pending backoff timer fires into a finished recovery.
    advance(30).await;
    assert_eq!(env.transport.reconnects(), 0);
    assert_eq!(orch.metrics().successful_recoveries, 1);
}

// ============================================================================
// Scenario B: retries exhausted
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_exhaustion_opens_breaker_and_falls_back() {
    let (env, s2) = session(MockEnvironment::new(), "S2");
    let orch = orchestrator(&env, config().with_max_retries(5));

    orch.on_connection_lost(&s2, None).await;

    // 1 + 2 + 4 + 8 + 10 seconds of backoff.
    advance(24).await;
    assert_eq!(orch.state(&s2), Some(RecoveryState::Recovering));

    advance(6).await;
    assert_eq!(orch.state(&s2), Some(RecoveryState::FallbackText));
    assert!(orch.is_circuit_open(&s2).await);
    assert_eq!(env.transport.reconnects(), 5);
    assert_eq!(env.transport.text_fallbacks(), 1);

    let metrics = orch.metrics();
    assert_eq!(metrics.fallback_activations, 1);
    assert_eq!(metrics.circuit_breaker_activations, 1);
    assert_eq!(metrics.failed_recoveries, 1);
    assert_eq!(metrics.escalations, 0);
    assert!(env.diagnostics.records().is_empty());
    assert_eq!(env.notifications.count(NotificationType::FallbackToText), 1);
    assert_eq!(env.notifications.count(NotificationType::ConnectionUnstable), 1);
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_short_circuits_to_fallback() {
    let (env, s2) = session(MockEnvironment::new(), "S2");
    let orch = orchestrator(&env, config());

    orch.on_connection_lost(&s2, None).await;
    advance(30).await;
    assert_eq!(orch.state(&s2), Some(RecoveryState::FallbackText));
    let reconnects = env.transport.reconnects();

    orch.on_connection_lost(&s2, None).await;
    assert_eq!(orch.state(&s2), Some(RecoveryState::FallbackText));
    assert!(!orch.is_recovering(&s2));

    advance(30).await;
    assert_eq!(env.transport.reconnects(), reconnects);
    assert_eq!(orch.metrics().fallback_activations, 2);
    assert_eq!(orch.metrics().circuit_breaker_activations, 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_voice_blocked_until_cooldown() {
    let (env, s2) = session(MockEnvironment::new(), "S2");
    let orch = orchestrator(&env, config());

    orch.on_connection_lost(&s2, None).await;
    advance(26).await;
    assert_eq!(orch.state(&s2), Some(RecoveryState::FallbackText));

    let err = orch.retry_voice(&s2).await.unwrap_err();
    match err {
        RecoveryError::CircuitOpen { retry_after_ms, .. } => assert!(retry_after_ms > 0),
        other => panic!("expected CircuitOpen, got {other:?}"),
    }
    assert_eq!(env.transport.retries(), 0);

    // Cooldown is 3 x 10s.
    advance(31).await;
    env.transport.set_default_ping(PingOutcome::Ack);
    orch.retry_voice(&s2).await.unwrap();
    assert_eq!(env.transport.retries(), 1);
    assert_eq!(orch.state(&s2), Some(RecoveryState::Recovering));

    advance(2).await;
    assert_eq!(orch.state(&s2), Some(RecoveryState::Restored));
    assert!(!orch.is_circuit_open(&s2).await);
}

#[tokio::test(start_paused = true)]
async fn test_late_reconnect_after_fallback_resets_breaker() {
    let (env, s2) = session(MockEnvironment::new(), "S2");
    let orch = orchestrator(&env, config());

    orch.on_connection_lost(&s2, None).await;
    advance(26).await;
    assert!(orch.is_circuit_open(&s2).await);

    orch.on_connection_restored(&s2).await;
    assert_eq!(orch.state(&s2), Some(RecoveryState::Restored));
    assert!(!orch.is_circuit_open(&s2).await);
    assert_eq!(orch.metrics().successful_recoveries, 1);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_disabled_escalates() {
    let (env, s2) = session(MockEnvironment::new(), "S2");
    let orch = orchestrator(&env, config().with_max_retries(2).with_fallback_to_text(false));

    orch.on_connection_lost(&s2, None).await;
    advance(5).await;

    assert_eq!(orch.state(&s2), Some(RecoveryState::Escalated));
    assert_eq!(orch.metrics().fallback_activations, 0);
    assert_eq!(orch.metrics().circuit_breaker_activations, 1);
    assert_eq!(env.transport.text_fallbacks(), 0);

    let records = env.diagnostics.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].circuit_breaker_open);
    assert_eq!(records[0].retry_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_without_checkpoint_escalates() {
    let env = MockEnvironment::new();
    let ghost = SessionId::new("ghost");
    let orch = orchestrator(&env, config().with_max_retries(2));

    orch.on_connection_lost(&ghost, None).await;
    assert!(orch.checkpoint(&ghost).is_none());

    advance(5).await;
    assert_eq!(orch.state(&ghost), Some(RecoveryState::Escalated));
    assert_eq!(orch.metrics().fallback_activations, 0);
    let records = env.diagnostics.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].checkpoint.is_none());
}

// ============================================================================
// Scenario C: corruption with no checkpoint
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_corruption_without_checkpoint_escalates() {
    let (env, s3) = session(MockEnvironment::new(), "S3");
    let orch = orchestrator(&env, config());

    orch.on_state_corrupted(&s3, Some("progress hash mismatch")).await;

    assert_eq!(orch.state(&s3), Some(RecoveryState::Escalated));
    assert_eq!(orch.metrics().total_recovery_attempts, 0);
    assert_eq!(orch.metrics().escalations, 1);
    assert_eq!(env.transport.reconnects(), 0);

    let records = env.diagnostics.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].session_id, s3);
    assert_eq!(records[0].retry_count, 0);
    assert_eq!(records[0].severity, Severity::Error);
    assert!(records[0].checkpoint.is_none());

    advance(4).await;
    let sent = env.notifications.notifications();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NotificationType::EscalationRequired);
    assert_eq!(sent[0].data["supportContact"], true);
}

#[tokio::test(start_paused = true)]
async fn test_corruption_with_checkpoint_restores() {
    let (env, s3) = session(MockEnvironment::new(), "S3");
    let orch = orchestrator(&env, config());
    orch.checkpoints().create_checkpoint(&s3, 0).await.unwrap();

    orch.on_state_corrupted(&s3, None).await;

    assert_eq!(orch.state(&s3), Some(RecoveryState::Restored));
    assert_eq!(env.restorer.payloads().len(), 1);
    assert!(env.diagnostics.records().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_restore_failure_escalates_with_checkpoint() {
    let (env, s1) = session(MockEnvironment::new(), "S1");
    env.transport.push_pings([PingOutcome::Ack]);
    env.restorer.fail_with("live session torn down");
    let orch = orchestrator(&env, config());

    orch.on_connection_lost(&s1, None).await;
    advance(5).await;

    assert_eq!(orch.state(&s1), Some(RecoveryState::Escalated));
    assert_eq!(orch.metrics().successful_recoveries, 0);
    let records = env.diagnostics.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].retry_count, 1);
    assert!(records[0].checkpoint.is_some());
    assert!(records[0].error.contains("live session torn down"));
}

#[tokio::test(start_paused = true)]
async fn test_escalation_disabled_emits_nothing() {
    let (env, s3) = session(MockEnvironment::new(), "S3");
    let orch = orchestrator(&env, config().with_escalation(false));

    orch.on_state_corrupted(&s3, None).await;
    advance(5).await;

    assert_eq!(orch.state(&s3), Some(RecoveryState::Escalated));
    assert!(env.diagnostics.records().is_empty());
    assert!(env.notifications.notifications().is_empty());
}

// ============================================================================
// Scenario D: cleanup mid-recovery
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_cleanup_mid_recovery_makes_timers_no_ops() {
    let (env, s1) = session(MockEnvironment::new(), "S1");
    let orch = orchestrator(&env, config());

    orch.on_connection_lost(&s1, None).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    let before = orch.metrics();

    orch.cleanup_session(&s1).await;
    advance(60).await;

    assert_eq!(orch.state(&s1), None);
    assert!(orch.checkpoint(&s1).is_none());
    assert!(orch.tracked_sessions().is_empty());
    assert_eq!(env.transport.reconnects(), 0);
    assert_eq!(orch.metrics(), before);
    assert!(env.notifications.notifications().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_during_ping_is_safe() {
    let (env, s1) = session(MockEnvironment::new(), "S1");
    env.transport.set_default_ping(PingOutcome::Hang);
    let orch = orchestrator(&env, config());

    orch.on_connection_lost(&s1, None).await;
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(env.transport.pings(), 1);

    orch.cleanup_session(&s1).await;
    advance(60).await;

    assert_eq!(env.transport.pings(), 1);
    assert_eq!(orch.state(&s1), None);
    assert_eq!(orch.metrics().failed_recoveries, 0);
    assert_eq!(orch.metrics().fallback_activations, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_during_loss_checkpoint_leaves_nothing() {
    let (env, s1) = session(MockEnvironment::new(), "S1");
    let persister = Arc::new(MemoryPersister::new());
    let orch = RecoveryOrchestrator::new(
        config(),
        Collaborators {
            state_provider: env.provider.clone(),
            restorer: env.restorer.clone(),
            transport: env.transport.clone(),
            persister: Some(persister.clone()),
            notifications: env.notifications.clone(),
            diagnostics: env.diagnostics.clone(),
        },
    )
    .unwrap();
    let gate = env.provider.hold(&s1);

    let lost = tokio::spawn({
        let orch = orch.clone();
        let s1 = s1.clone();
        async move { orch.on_connection_lost(&s1, None).await }
    });
    advance(1).await;
    assert_eq!(env.provider.reads(), 1);

    orch.cleanup_session(&s1).await;
    gate.open();
    lost.await.unwrap();
    advance(120).await;

    assert_eq!(orch.state(&s1), None);
    assert!(orch.checkpoint(&s1).is_none());
    assert!(orch.tracked_sessions().is_empty());
    assert!(!orch.is_recovering(&s1));
    assert!(persister.is_empty());
    assert_eq!(env.transport.reconnects(), 0);
    assert!(env.notifications.notifications().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_during_loss_durable_write_leaves_nothing() {
    let (env, s1) = session(MockEnvironment::new(), "S1");
    let persister = Arc::new(GatedPersister::new());
    let orch = RecoveryOrchestrator::new(
        config(),
        Collaborators {
            state_provider: env.provider.clone(),
            restorer: env.restorer.clone(),
            transport: env.transport.clone(),
            persister: Some(persister.clone()),
            notifications: env.notifications.clone(),
            diagnostics: env.diagnostics.clone(),
        },
    )
    .unwrap();
    let gate = persister.hold_saves();

    let lost = tokio::spawn({
        let orch = orch.clone();
        let s1 = s1.clone();
        async move { orch.on_connection_lost(&s1, None).await }
    });
    advance(1).await;
    assert_eq!(persister.saves(), 1);

    orch.cleanup_session(&s1).await;
    gate.open();
    lost.await.unwrap();
    advance(120).await;

    assert_eq!(orch.state(&s1), None);
    assert!(orch.checkpoint(&s1).is_none());
    assert!(!persister.contains(&checkpoint_key(&s1)));
    assert_eq!(env.transport.reconnects(), 0);
}

// ============================================================================
// Concurrency guard
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_duplicate_connection_lost_is_ignored() {
    let (env, s1) = session(MockEnvironment::new(), "S1");
    env.transport.push_pings([PingOutcome::Ack]);
    let orch = orchestrator(&env, config());

    orch.on_connection_lost(&s1, None).await;
    orch.on_connection_lost(&s1, None).await;
    assert_eq!(env.provider.reads(), 1);
    assert_eq!(orch.metrics().total_recovery_attempts, 1);

    advance(5).await;
    assert_eq!(env.transport.reconnects(), 1);
    assert_eq!(orch.metrics().successful_recoveries, 1);
    assert_eq!(env.restorer.payloads().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sessions_recover_independently() {
    let env = MockEnvironment::new()
        .with_session("a", sample_snapshot("student-a", "fractions"))
        .with_session("b", sample_snapshot("student-b", "decimals"));
    let orch = orchestrator(&env, config());
    let (a, b) = (SessionId::new("a"), SessionId::new("b"));

    orch.on_connection_lost(&a, None).await;
    orch.on_connection_lost(&b, None).await;
    assert!(orch.is_recovering(&a));
    assert!(orch.is_recovering(&b));
    assert_eq!(orch.metrics().total_recovery_attempts, 2);

    orch.on_connection_restored(&a).await;
    assert_eq!(orch.state(&a), Some(RecoveryState::Restored));
    assert_eq!(orch.state(&b), Some(RecoveryState::Recovering));
}

// ============================================================================
// Session errors
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_transient_session_error_starts_recovery() {
    let (env, s1) = session(MockEnvironment::new(), "S1");
    let orch = orchestrator(&env, config());

    orch.on_session_error(&s1, "WebSocket closed with code 1006").await;

    assert_eq!(orch.state(&s1), Some(RecoveryState::Recovering));
    assert_eq!(orch.checkpoint(&s1).unwrap().error_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_session_error_takes_corruption_path() {
    let (env, s1) = session(MockEnvironment::new(), "S1");
    let orch = orchestrator(&env, config());

    orch.on_session_error(&s1, "invalid state: turn index regressed").await;

    assert_eq!(orch.state(&s1), Some(RecoveryState::Escalated));
    assert_eq!(orch.metrics().total_recovery_attempts, 0);
}

// ============================================================================
// Host lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_signal_channel_and_shutdown() {
    let (env, s1) = session(MockEnvironment::new(), "S1");
    let orch = orchestrator(&env, config());
    let signals = orch.start();

    signals
        .send(LifecycleSignal::ConnectionLost {
            session_id: s1.clone(),
            reason: Some("ice failed".into()),
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(orch.state(&s1), Some(RecoveryState::Recovering));

    orch.shutdown();
    advance(60).await;
    assert_eq!(env.transport.reconnects(), 0);
    assert!(signals.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_signals_are_handled_in_order() {
    let (env, s1) = session(MockEnvironment::new(), "S1");
    let orch = orchestrator(&env, config());
    let signals = orch.start();

    signals
        .send(LifecycleSignal::ConnectionLost { session_id: s1.clone(), reason: None })
        .await
        .unwrap();
    signals
        .send(LifecycleSignal::ConnectionRestored { session_id: s1.clone() })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(orch.state(&s1), Some(RecoveryState::Restored));
    orch.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_slow_session_does_not_block_other_signals() {
    let env = MockEnvironment::new()
        .with_session("SLOW", sample_snapshot("student-a", "fractions"))
        .with_session("FAST", sample_snapshot("student-b", "decimals"));
    let (slow, fast) = (SessionId::new("SLOW"), SessionId::new("FAST"));
    let gate = env.provider.hold(&slow);
    let orch = orchestrator(&env, config());
    let signals = orch.start();

    for session_id in [&slow, &fast] {
        signals
            .send(LifecycleSignal::ConnectionLost { session_id: session_id.clone(), reason: None })
            .await
            .unwrap();
    }
    signals
        .send(LifecycleSignal::ConnectionRestored { session_id: slow.clone() })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(orch.state(&fast), Some(RecoveryState::Recovering));
    assert!(orch.checkpoint(&fast).is_some());
    assert_eq!(orch.state(&slow), None);

    // The queued restore for SLOW still runs after its loss is handled.
    gate.open();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(orch.state(&slow), Some(RecoveryState::Restored));
    assert_eq!(orch.state(&fast), Some(RecoveryState::Recovering));
    orch.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_periodic_sweep_checkpoints_tracked_sessions() {
    let (env, s1) = session(MockEnvironment::new(), "S1");
    let orch = orchestrator(&env, config());
    orch.track_session(&s1);
    assert_eq!(orch.state(&s1), Some(RecoveryState::Stable));

    let _signals = orch.start();
    advance(5).await;
    assert!(orch.checkpoint(&s1).is_none());

    advance(6).await;
    assert_eq!(orch.checkpoint(&s1).unwrap().topic, "fractions");

    env.provider.set_state(&s1, sample_snapshot("student-1", "decimals"));
    advance(10).await;
    assert_eq!(orch.checkpoint(&s1).unwrap().topic, "decimals");
    orch.shutdown();
}

#[test]
fn test_invalid_config_is_rejected() {
    let env = MockEnvironment::new();
    let result = RecoveryOrchestrator::new(
        RecoveryConfig::new().with_max_retries(0),
        Collaborators {
            state_provider: env.provider.clone(),
            restorer: env.restorer.clone(),
            transport: env.transport.clone(),
            persister: None,
            notifications: env.notifications.clone(),
            diagnostics: env.diagnostics.clone(),
        },
    );
    assert!(matches!(result, Err(RecoveryError::Config(_))));
}
