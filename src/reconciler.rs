//! Desired-state reconciliation for the trainer control point.
//!
//! Callers declare what the machine should be doing (`set_desired_state`)
//! and the reconciler turns that into the minimal sequence of control point
//! commands: debouncing slider-frequency calls, clamping unsafe targets,
//! acquiring control when needed, and only marking a target confirmed once
//! the machine acknowledges it.

use crate::ftms::{self, ResultCode};
use crate::session::ControlSession;
use crate::types::{CommandError, ControlMode, ControlSessionState, EngineConfig};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinHandle;

/// Shadow-state reconciler between the caller's desired control mode and
/// the last mode the machine confirmed.
///
/// Cloning is cheap and shares state; the manager hands clones to its
/// background tasks.
#[derive(Clone)]
pub struct Reconciler {
    shared: Arc<Shared>,
}

struct Shared {
    config: EngineConfig,
    sync_state: Mutex<SyncState>,
    /// The session mutex doubles as the one-outstanding-procedure rail:
    /// whoever holds it owns the control point until the exchange finishes.
    session: tokio::sync::Mutex<Option<ControlSession>>,
}

struct SyncState {
    desired: ControlMode,
    confirmed: ControlMode,
    in_flight: bool,
    last_attempt: Option<Instant>,
    /// Pending debounce timer, replaced on every `set_desired_state` call.
    /// Holds only the sleep; the sync itself runs detached and must never
    /// be aborted mid-exchange.
    debounce: Option<JoinHandle<()>>,
    /// Bumped on every reset so a sync that was in flight across a link
    /// loss cannot write back a stale confirmation.
    generation: u64,
}

impl Reconciler {
    /// Create a reconciler with no session attached.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                sync_state: Mutex::new(SyncState {
                    desired: ControlMode::Idle,
                    confirmed: ControlMode::Idle,
                    in_flight: false,
                    last_attempt: None,
                    debounce: None,
                    generation: 0,
                }),
                session: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Declare the mode the machine should be in.
    ///
    /// Fire-and-forget and safe to call at high frequency (e.g. on every UI
    /// slider tick): each call restarts the debounce window, so only the
    /// last value within the window is actually synced. Must be called from
    /// within a tokio runtime.
    pub fn set_desired_state(&self, mode: ControlMode) {
        let mode = self.clamp(mode);

        let mut state = self.shared.sync_state.lock().unwrap();
        state.desired = mode;

        if let Some(timer) = state.debounce.take() {
            timer.abort();
        }

        let shared = self.shared.clone();
        state.debounce = Some(tokio::spawn(async move {
            tokio::time::sleep(shared.config.debounce).await;
            // Detached: rescheduling the debounce aborts only the sleep,
            // never a sync that is already mid-exchange.
            tokio::spawn(async move {
                Shared::run_sync(&shared).await;
            });
        }));
    }

    /// Apply the safety clamp to a mode before it becomes desired state.
    fn clamp(&self, mode: ControlMode) -> ControlMode {
        match mode {
            ControlMode::TargetPower { watts } => {
                let clamped = watts.clamp(
                    self.shared.config.min_target_power_watts,
                    self.shared.config.max_target_power_watts,
                );
                if clamped != watts {
                    tracing::warn!(
                        requested = watts,
                        clamped,
                        "target power outside safe range, clamping"
                    );
                }
                ControlMode::TargetPower { watts: clamped }
            }
            other => other,
        }
    }

    /// Install a fresh session for a new connection.
    pub async fn attach_session(&self, session: ControlSession) {
        *self.shared.session.lock().await = Some(session);
    }

    /// Reset to the initial state, dropping the session.
    ///
    /// Called on every transition away from `Connected`; a stale desired or
    /// confirmed state must never be assumed valid against a newly
    /// (re)connected, possibly different, machine. Idempotent.
    pub async fn reset(&self) {
        {
            let mut state = self.shared.sync_state.lock().unwrap();
            if let Some(timer) = state.debounce.take() {
                timer.abort();
            }
            state.desired = ControlMode::Idle;
            state.confirmed = ControlMode::Idle;
            state.in_flight = false;
            state.last_attempt = None;
            state.generation += 1;
        }
        *self.shared.session.lock().await = None;
    }

    /// The caller's current desired mode (after clamping).
    pub fn desired_state(&self) -> ControlMode {
        self.shared.sync_state.lock().unwrap().desired.clone()
    }

    /// The last mode the machine acknowledged with a success result.
    pub fn confirmed_state(&self) -> ControlMode {
        self.shared.sync_state.lock().unwrap().confirmed.clone()
    }

    /// State of the control session, `Uncontrolled` when none is attached.
    pub async fn control_session_state(&self) -> ControlSessionState {
        self.shared
            .session
            .lock()
            .await
            .as_ref()
            .map(ControlSession::state)
            .unwrap_or_default()
    }
}

impl Shared {
    /// One sync attempt: diff desired against confirmed and send at most one
    /// command.
    async fn run_sync(self: &Arc<Self>) {
        let (target, generation) = {
            let mut state = self.sync_state.lock().unwrap();
            if state.in_flight {
                tracing::debug!("sync already in flight, skipping");
                return;
            }
            if let Some(last) = state.last_attempt {
                if last.elapsed() < self.config.min_sync_interval {
                    tracing::debug!("sync rate limited, desired state stays pending");
                    return;
                }
            }
            if state.desired == state.confirmed {
                return;
            }
            state.in_flight = true;
            state.last_attempt = Some(Instant::now());
            (state.desired.clone(), state.generation)
        };

        let confirmed = self.dispatch(&target).await;

        let mut state = self.sync_state.lock().unwrap();
        if state.generation != generation {
            // A reset landed while the exchange was in flight; its outcome
            // belongs to the old link.
            return;
        }
        state.in_flight = false;
        if confirmed {
            tracing::debug!(mode = %target, "machine confirmed control mode");
            state.confirmed = target;
        }
    }

    /// Acquire control if needed and send the command for `target`.
    /// Returns whether the machine confirmed it.
    async fn dispatch(&self, target: &ControlMode) -> bool {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut() else {
            tracing::debug!("no control session attached, skipping sync");
            return false;
        };

        if !target.is_idle() && session.state() != ControlSessionState::Controlled {
            if let Err(err) = session.request_control().await {
                tracing::debug!(error = %err, "control acquisition failed, will retry");
                return false;
            }
        }

        let frame = match target {
            // Without control the machine is no longer holding any target
            // of ours, so Idle is already in effect; record it as confirmed
            // rather than re-acquiring control just to send a stop.
            ControlMode::Idle if session.state() != ControlSessionState::Controlled => {
                return true;
            }
            ControlMode::Idle => ftms::build_stop_training(false),
            ControlMode::TargetPower { watts } => ftms::build_set_target_power(*watts),
            ControlMode::TargetResistance { level } => ftms::build_set_target_resistance(*level),
            ControlMode::TargetSpeed { kmh } => ftms::build_set_target_speed(*kmh),
            ControlMode::TargetHeartRate { bpm } => ftms::build_set_target_heart_rate(*bpm),
            ControlMode::Simulation {
                wind_speed_mps,
                grade_percent,
                crr,
                cw,
            } => ftms::build_set_simulation(*wind_speed_mps, *grade_percent, *crr, *cw),
        };

        match session.send_command(frame).await {
            Ok(ResultCode::Success) => true,
            Ok(code) => {
                tracing::warn!(mode = %target, result = %code, "command rejected by machine");
                false
            }
            Err(CommandError::ControlLost) => {
                // Session is now Lost; the next sync re-requests control.
                false
            }
            Err(err) => {
                tracing::debug!(mode = %target, error = %err, "command failed, will retry");
                false
            }
        }
    }
}
