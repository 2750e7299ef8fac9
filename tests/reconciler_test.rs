//! Tests for the desired-state reconciler.

mod common;

use common::{opcodes, scripted_session, Frames, Script};
use std::time::Duration;
use trainerlink::{ControlMode, ControlSessionState, EngineConfig, Reconciler};

fn test_config() -> EngineConfig {
    EngineConfig {
        response_timeout: Duration::from_millis(50),
        debounce: Duration::from_millis(20),
        min_sync_interval: Duration::from_millis(25),
        ..EngineConfig::default()
    }
}

async fn reconciler_with(script: Vec<Script>) -> (Reconciler, Frames) {
    let config = test_config();
    let (session, frames) = scripted_session(config.response_timeout, script);
    let reconciler = Reconciler::new(config);
    reconciler.attach_session(session).await;
    (reconciler, frames)
}

/// Wait long enough for debounce, exchange, and confirmation to finish.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn test_sync_requests_control_before_first_command() {
    let (reconciler, frames) = reconciler_with(vec![]).await;

    reconciler.set_desired_state(ControlMode::TargetPower { watts: 100 });
    settle().await;

    // Request control (0x00) must precede the power target (0x05).
    assert_eq!(opcodes(&frames), vec![0x00, 0x05]);
    assert_eq!(
        frames.lock().unwrap()[1],
        vec![0x05, 0x64, 0x00] // 100W little-endian
    );
    assert_eq!(
        reconciler.confirmed_state(),
        ControlMode::TargetPower { watts: 100 }
    );
    assert_eq!(
        reconciler.control_session_state().await,
        ControlSessionState::Controlled
    );
}

#[tokio::test]
async fn test_debounce_coalesces_repeated_calls() {
    let (reconciler, frames) = reconciler_with(vec![]).await;

    // Slider-frequency updates: only the last value in the window syncs.
    for _ in 0..10 {
        reconciler.set_desired_state(ControlMode::TargetPower { watts: 200 });
    }
    settle().await;

    let power_writes = opcodes(&frames).iter().filter(|&&op| op == 0x05).count();
    assert_eq!(power_writes, 1);
}

#[tokio::test]
async fn test_newest_desired_state_wins() {
    let (reconciler, frames) = reconciler_with(vec![]).await;

    reconciler.set_desired_state(ControlMode::TargetPower { watts: 200 });
    reconciler.set_desired_state(ControlMode::Simulation {
        wind_speed_mps: 0.0,
        grade_percent: 4.0,
        crr: 0.004,
        cw: 0.51,
    });
    settle().await;

    // The power intent was superseded before debounce fired; only the
    // simulation command is ever sent.
    let ops = opcodes(&frames);
    assert!(!ops.contains(&0x05));
    assert_eq!(ops.iter().filter(|&&op| op == 0x11).count(), 1);
}

#[tokio::test]
async fn test_target_power_is_clamped() {
    let (reconciler, frames) = reconciler_with(vec![]).await;

    reconciler.set_desired_state(ControlMode::TargetPower { watts: 9000 });
    settle().await;

    assert_eq!(
        reconciler.confirmed_state(),
        ControlMode::TargetPower { watts: 1500 }
    );
    // 1500 = 0x05DC little-endian
    assert_eq!(frames.lock().unwrap()[1], vec![0x05, 0xDC, 0x05]);

    reconciler.set_desired_state(ControlMode::TargetPower { watts: 1 });
    settle().await;

    assert_eq!(
        reconciler.confirmed_state(),
        ControlMode::TargetPower { watts: 25 }
    );
}

#[tokio::test]
async fn test_confirmed_state_unchanged_until_success() {
    let (reconciler, frames) = reconciler_with(vec![Script::Reply(0x01), Script::Silent]).await;

    reconciler.set_desired_state(ControlMode::TargetPower { watts: 150 });
    settle().await;

    // Control was granted but the power target got no response.
    assert_eq!(reconciler.confirmed_state(), ControlMode::Idle);
    assert_eq!(
        reconciler.desired_state(),
        ControlMode::TargetPower { watts: 150 }
    );

    // The pending desired value syncs on the next call.
    reconciler.set_desired_state(ControlMode::TargetPower { watts: 150 });
    settle().await;

    assert_eq!(
        reconciler.confirmed_state(),
        ControlMode::TargetPower { watts: 150 }
    );
    assert_eq!(opcodes(&frames), vec![0x00, 0x05, 0x05]);
}

#[tokio::test]
async fn test_no_command_when_desired_matches_confirmed() {
    let (reconciler, frames) = reconciler_with(vec![]).await;

    reconciler.set_desired_state(ControlMode::TargetPower { watts: 250 });
    settle().await;
    reconciler.set_desired_state(ControlMode::TargetPower { watts: 250 });
    settle().await;

    // One request control + one power target, nothing for the repeat.
    assert_eq!(opcodes(&frames), vec![0x00, 0x05]);
}

#[tokio::test]
async fn test_control_not_permitted_forces_reacquisition() {
    // Control granted, then the power target is answered with
    // Control Not Permitted.
    let (reconciler, frames) =
        reconciler_with(vec![Script::Reply(0x01), Script::Reply(0x05)]).await;

    reconciler.set_desired_state(ControlMode::TargetPower { watts: 180 });
    settle().await;

    assert_eq!(
        reconciler.control_session_state().await,
        ControlSessionState::Lost
    );
    assert_eq!(reconciler.confirmed_state(), ControlMode::Idle);

    // The next sync re-requests control before retrying the target.
    reconciler.set_desired_state(ControlMode::TargetPower { watts: 180 });
    settle().await;

    assert_eq!(opcodes(&frames), vec![0x00, 0x05, 0x00, 0x05]);
    assert_eq!(
        reconciler.confirmed_state(),
        ControlMode::TargetPower { watts: 180 }
    );
}

#[tokio::test]
async fn test_failed_acquisition_leaves_desired_pending() {
    let (reconciler, frames) = reconciler_with(vec![Script::Silent]).await;

    reconciler.set_desired_state(ControlMode::TargetPower { watts: 120 });
    settle().await;

    // Request control timed out; no target command was attempted.
    assert_eq!(opcodes(&frames), vec![0x00]);
    assert_eq!(reconciler.confirmed_state(), ControlMode::Idle);
    assert_eq!(
        reconciler.desired_state(),
        ControlMode::TargetPower { watts: 120 }
    );
    assert_eq!(
        reconciler.control_session_state().await,
        ControlSessionState::Uncontrolled
    );
}

#[tokio::test]
async fn test_idle_desired_sends_stop_when_controlled() {
    let (reconciler, frames) = reconciler_with(vec![]).await;

    reconciler.set_desired_state(ControlMode::TargetPower { watts: 200 });
    settle().await;
    reconciler.set_desired_state(ControlMode::Idle);
    settle().await;

    assert_eq!(opcodes(&frames), vec![0x00, 0x05, 0x08]);
    assert_eq!(frames.lock().unwrap()[2], vec![0x08, 0x01]);
    assert_eq!(reconciler.confirmed_state(), ControlMode::Idle);
}

#[tokio::test]
async fn test_reset_restores_initial_state() {
    let (reconciler, _frames) = reconciler_with(vec![]).await;

    reconciler.set_desired_state(ControlMode::TargetPower { watts: 300 });
    settle().await;
    assert_eq!(
        reconciler.control_session_state().await,
        ControlSessionState::Controlled
    );

    // Link loss: everything re-baselines as if freshly connected.
    reconciler.reset().await;

    assert_eq!(reconciler.desired_state(), ControlMode::Idle);
    assert_eq!(reconciler.confirmed_state(), ControlMode::Idle);
    assert_eq!(
        reconciler.control_session_state().await,
        ControlSessionState::Uncontrolled
    );
}

#[tokio::test]
async fn test_reset_cancels_pending_debounce() {
    let (reconciler, frames) = reconciler_with(vec![]).await;

    reconciler.set_desired_state(ControlMode::TargetPower { watts: 300 });
    reconciler.reset().await;
    settle().await;

    // The queued sync must not fire against a dead link.
    assert!(frames.lock().unwrap().is_empty());
    assert_eq!(reconciler.desired_state(), ControlMode::Idle);
}

#[tokio::test]
async fn test_set_desired_during_in_flight_sync_does_not_stall() {
    // Request control answered slowly, so the first sync is mid-exchange
    // when another set_desired_state call lands. The in-flight exchange
    // must run to completion and later calls must keep syncing.
    let (reconciler, frames) = reconciler_with(vec![Script::ReplyLate(
        0x01,
        Duration::from_millis(40),
    )])
    .await;

    reconciler.set_desired_state(ControlMode::TargetPower { watts: 200 });
    tokio::time::sleep(Duration::from_millis(40)).await;
    // Lands while the request-control exchange is awaiting its reply.
    reconciler.set_desired_state(ControlMode::TargetPower { watts: 200 });
    settle().await;

    reconciler.set_desired_state(ControlMode::TargetPower { watts: 200 });
    settle().await;

    assert_eq!(
        reconciler.confirmed_state(),
        ControlMode::TargetPower { watts: 200 }
    );
    assert_eq!(opcodes(&frames), vec![0x00, 0x05]);
}

#[tokio::test]
async fn test_idle_desired_while_uncontrolled_is_implicitly_confirmed() {
    // Confirmed power target, then the machine revokes control, then the
    // caller wants Idle: the revoked machine is not holding our target, so
    // Idle is recorded without re-acquiring control just to send a stop.
    let (reconciler, frames) = reconciler_with(vec![
        Script::Reply(0x01), // request control
        Script::Reply(0x01), // first power target
        Script::Reply(0x05), // second power target: Control Not Permitted
    ])
    .await;

    reconciler.set_desired_state(ControlMode::TargetPower { watts: 200 });
    settle().await;
    reconciler.set_desired_state(ControlMode::TargetPower { watts: 250 });
    settle().await;

    assert_eq!(
        reconciler.control_session_state().await,
        ControlSessionState::Lost
    );
    assert_eq!(
        reconciler.confirmed_state(),
        ControlMode::TargetPower { watts: 200 }
    );

    reconciler.set_desired_state(ControlMode::Idle);
    settle().await;

    // No stop frame, no re-request; confirmed settles at Idle for good.
    assert_eq!(opcodes(&frames), vec![0x00, 0x05, 0x05]);
    assert_eq!(reconciler.confirmed_state(), ControlMode::Idle);
}

#[tokio::test]
async fn test_sync_without_session_is_safe() {
    let reconciler = Reconciler::new(test_config());

    reconciler.set_desired_state(ControlMode::TargetPower { watts: 200 });
    settle().await;

    assert_eq!(reconciler.confirmed_state(), ControlMode::Idle);
    assert_eq!(
        reconciler.desired_state(),
        ControlMode::TargetPower { watts: 200 }
    );
}
