//! Core types for the trainer control engine.

use crate::ftms::ResultCode;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// A control target for the fitness machine.
///
/// The FTMS control point only allows one active target at a time, so the
/// mode is a closed sum type rather than a set of flags: holding a value of
/// this type structurally rules out combined targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    /// No active target; the machine behaves as it would uncontrolled.
    Idle,
    /// ERG mode: the machine adjusts resistance to hold a wattage.
    TargetPower {
        /// Target power in watts
        watts: i16,
    },
    /// Fixed resistance level.
    TargetResistance {
        /// Resistance level (machine-specific scale)
        level: u8,
    },
    /// Target speed.
    TargetSpeed {
        /// Target speed in km/h
        kmh: f32,
    },
    /// Target heart rate.
    TargetHeartRate {
        /// Target heart rate in BPM
        bpm: u8,
    },
    /// Indoor bike simulation (slope mode).
    Simulation {
        /// Wind speed in m/s (headwind positive)
        wind_speed_mps: f32,
        /// Grade in percent
        grade_percent: f32,
        /// Coefficient of rolling resistance
        crr: f32,
        /// Wind resistance coefficient (kg/m)
        cw: f32,
    },
}

impl ControlMode {
    /// Whether this mode carries no target.
    pub fn is_idle(&self) -> bool {
        matches!(self, ControlMode::Idle)
    }
}

impl std::fmt::Display for ControlMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlMode::Idle => write!(f, "Idle"),
            ControlMode::TargetPower { watts } => write!(f, "TargetPower({watts}W)"),
            ControlMode::TargetResistance { level } => write!(f, "TargetResistance({level})"),
            ControlMode::TargetSpeed { kmh } => write!(f, "TargetSpeed({kmh:.2}km/h)"),
            ControlMode::TargetHeartRate { bpm } => write!(f, "TargetHeartRate({bpm}bpm)"),
            ControlMode::Simulation { grade_percent, .. } => {
                write!(f, "Simulation(grade {grade_percent:.2}%)")
            }
        }
    }
}

/// Connection state of the trainer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected
    #[default]
    Disconnected,
    /// Connection in progress
    Connecting,
    /// Active connection
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting..."),
            ConnectionState::Connected => write!(f, "Connected"),
        }
    }
}

/// State of the control-point session with the machine.
///
/// `Controlled` is required before any target-setting command may be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlSessionState {
    /// Control has not been requested on this connection
    #[default]
    Uncontrolled,
    /// A Request Control procedure is outstanding
    RequestingControl,
    /// The machine granted control to this client
    Controlled,
    /// The machine revoked control (Control Not Permitted response)
    Lost,
}

impl std::fmt::Display for ControlSessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlSessionState::Uncontrolled => write!(f, "Uncontrolled"),
            ControlSessionState::RequestingControl => write!(f, "Requesting Control"),
            ControlSessionState::Controlled => write!(f, "Controlled"),
            ControlSessionState::Lost => write!(f, "Control Lost"),
        }
    }
}

/// One decoded telemetry notification.
///
/// Each field is independently optional because the wire format marks field
/// presence per-packet via flag bits.
#[derive(Debug, Clone)]
pub struct TelemetrySample {
    /// When the notification was decoded
    pub timestamp: Instant,
    /// Instantaneous power in watts
    pub power_watts: Option<i16>,
    /// Instantaneous cadence in RPM (rounded from 0.5 RPM resolution)
    pub cadence_rpm: Option<u16>,
    /// Instantaneous speed in km/h
    pub speed_kmh: Option<f32>,
}

impl TelemetrySample {
    /// Whether the sample carries no data fields at all.
    pub fn is_empty(&self) -> bool {
        self.power_watts.is_none() && self.cadence_rpm.is_none() && self.speed_kmh.is_none()
    }
}

/// Events from the trainer engine.
#[derive(Debug, Clone)]
pub enum TrainerEvent {
    /// Connection state changed
    ConnectionChanged(ConnectionState),
    /// New telemetry received from the machine
    Telemetry(TelemetrySample),
}

/// Configuration for the trainer engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Overall timeout for a connect attempt, including service discovery
    /// and characteristic subscription.
    pub connect_timeout: Duration,
    /// Timeout for the radio-level connect inside a connect attempt.
    pub radio_connect_timeout: Duration,
    /// How long to wait for a control-point response before assuming the
    /// command failed.
    pub response_timeout: Duration,
    /// Debounce window for `set_desired_state`: only the last call within
    /// the window triggers a sync.
    pub debounce: Duration,
    /// Minimum interval between two sync attempts.
    pub min_sync_interval: Duration,
    /// Lower safety clamp for target power in watts.
    pub min_target_power_watts: i16,
    /// Upper safety clamp for target power in watts.
    pub max_target_power_watts: i16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            radio_connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_millis(100),
            debounce: Duration::from_millis(100),
            min_sync_interval: Duration::from_millis(250),
            min_target_power_watts: 25,
            max_target_power_watts: 1500,
        }
    }
}

/// Connection-level errors surfaced to the caller.
#[derive(Debug, Error)]
pub enum TrainerError {
    /// BLE adapter not found or unavailable
    #[error("Bluetooth adapter not found")]
    AdapterNotFound,

    /// No peripheral with the given device ID is known to the adapter
    #[error("Trainer not found: {0}")]
    DeviceNotFound(String),

    /// The connect attempt did not reach Connected within the timeout
    #[error("Connection timed out")]
    ConnectionTimeout,

    /// Connection to the trainer failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The peripheral does not expose the Fitness Machine Service
    #[error("Fitness Machine Service not found")]
    ServiceNotFound,

    /// A required FTMS characteristic is missing
    #[error("Required characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    /// Failed to subscribe to notifications
    #[error("Failed to subscribe to notifications: {0}")]
    SubscriptionFailed(String),

    /// An operation requires an active connection
    #[error("Not connected to a trainer")]
    NotConnected,

    /// Generic BLE error
    #[error("BLE error: {0}")]
    Ble(String),
}

/// Control-channel errors, absorbed by the reconciler's retry loop.
#[derive(Debug, Error)]
pub enum CommandError {
    /// No response indication arrived within the response timeout
    #[error("No control point response within timeout")]
    ResponseTimeout,

    /// The machine answered with a non-success result code
    #[error("Command rejected: {0}")]
    Rejected(ResultCode),

    /// The machine revoked control of the session
    #[error("Control of the machine was lost")]
    ControlLost,

    /// A command was attempted without holding control
    #[error("Not in control of the machine")]
    NotInControl,

    /// The control channel to the link is gone (disconnected)
    #[error("Control channel closed")]
    LinkClosed,
}
