//! TrainerLink - FTMS Device-Control Engine
//!
//! A control engine for BLE indoor cycling trainers speaking the Fitness
//! Machine Service protocol. Decodes Indoor Bike Data telemetry in real
//! time and drives the machine's resistance/power target through the
//! control point, reconciling the caller's desired mode against the last
//! mode the machine confirmed.
//!
//! Typical usage: create a [`TrainerManager`], call `initialize()` then
//! `connect(device_id)`, consume telemetry and connection events from
//! `event_receiver()`, and steer the machine with `set_desired_state()` —
//! fire-and-forget, debounced, and retried internally across rejections
//! and control loss.

pub mod ftms;
pub mod manager;
pub mod reconciler;
pub mod session;
pub mod types;

// Re-export commonly used types
pub use ftms::{decode_indoor_bike_data, ControlResponse, FtmsOpcode, ResultCode};
pub use manager::TrainerManager;
pub use reconciler::Reconciler;
pub use session::ControlSession;
pub use types::{
    CommandError, ConnectionState, ControlMode, ControlSessionState, EngineConfig,
    TelemetrySample, TrainerError, TrainerEvent,
};
