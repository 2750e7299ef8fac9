//! Trainer connection lifecycle management.
//!
//! Owns the BLE link to a single fitness machine: connect/disconnect,
//! FTMS characteristic subscription, routing of telemetry and control point
//! notifications, and resetting the control state whenever the link drops.

use crate::ftms::{
    self, ControlResponse, FTMS_CONTROL_POINT_UUID, FTMS_SERVICE_UUID, INDOOR_BIKE_DATA_UUID,
};
use crate::reconciler::Reconciler;
use crate::session::ControlSession;
use crate::types::{
    ConnectionState, ControlMode, ControlSessionState, EngineConfig, TrainerError, TrainerEvent,
};
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use crossbeam::channel::{Receiver, Sender};
use futures::stream::StreamExt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Manages the BLE connection to one FTMS trainer and exposes the control
/// engine built on top of it.
pub struct TrainerManager {
    /// Configuration
    config: EngineConfig,
    /// BLE adapter
    adapter: Option<Adapter>,
    /// Desired-state reconciler driving the control point
    reconciler: Reconciler,
    /// Channel for sending trainer events
    event_tx: Option<Sender<TrainerEvent>>,
    /// State shared with the notification router task
    link: Arc<LinkShared>,
}

struct LinkShared {
    connection_state: Mutex<ConnectionState>,
    peripheral: tokio::sync::Mutex<Option<Peripheral>>,
}

/// Teardown guard for an in-progress connect attempt.
///
/// `connect()` disarms it on every explicit exit path; if the future is
/// dropped instead, the guard tears the partial link down in the background
/// so no radio link, subscription, or control state outlives the attempt.
struct ConnectGuard {
    link: Arc<LinkShared>,
    reconciler: Reconciler,
    event_tx: Option<Sender<TrainerEvent>>,
    armed: bool,
}

impl ConnectGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ConnectGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        tracing::warn!("Connect attempt cancelled, tearing down partial link");
        let link = self.link.clone();
        let reconciler = self.reconciler.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let peripheral = link.peripheral.lock().await.take();
            reconciler.reset().await;
            *link.connection_state.lock().unwrap() = ConnectionState::Disconnected;

            if let Some(peripheral) = peripheral {
                if let Err(err) = peripheral.disconnect().await {
                    tracing::debug!(error = %err, "Peripheral disconnect failed");
                }
            }

            TrainerManager::emit(
                &event_tx,
                TrainerEvent::ConnectionChanged(ConnectionState::Disconnected),
            );
        });
    }
}

impl TrainerManager {
    /// Create a new trainer manager.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            reconciler: Reconciler::new(config.clone()),
            config,
            adapter: None,
            event_tx: None,
            link: Arc::new(LinkShared {
                connection_state: Mutex::new(ConnectionState::Disconnected),
                peripheral: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Create a new trainer manager with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(EngineConfig::default())
    }

    /// Initialize the BLE adapter.
    ///
    /// This must be called before connecting.
    pub async fn initialize(&mut self) -> Result<(), TrainerError> {
        tracing::info!("Initializing TrainerManager");

        let manager = Manager::new()
            .await
            .map_err(|e| TrainerError::Ble(e.to_string()))?;

        let adapters = manager
            .adapters()
            .await
            .map_err(|e| TrainerError::Ble(e.to_string()))?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(TrainerError::AdapterNotFound)?;

        tracing::info!("BLE adapter initialized");
        self.adapter = Some(adapter);

        Ok(())
    }

    /// Get an event receiver for trainer events.
    pub fn event_receiver(&mut self) -> Receiver<TrainerEvent> {
        let (tx, rx) = crossbeam::channel::unbounded();
        self.event_tx = Some(tx);
        rx
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.link.connection_state.lock().unwrap()
    }

    /// Current control session state.
    pub async fn control_session_state(&self) -> ControlSessionState {
        self.reconciler.control_session_state().await
    }

    /// The last control mode the machine acknowledged.
    pub fn confirmed_state(&self) -> ControlMode {
        self.reconciler.confirmed_state()
    }

    /// Declare the mode the machine should be in. See
    /// [`Reconciler::set_desired_state`].
    pub fn set_desired_state(&self, mode: ControlMode) {
        self.reconciler.set_desired_state(mode);
    }

    /// Connect to a trainer by device ID.
    ///
    /// Fails with [`TrainerError::ConnectionTimeout`] when the machine is
    /// not fully connected and subscribed within the configured overall
    /// timeout. Dropping the returned future cancels the attempt: any
    /// partially established link is torn down in the background and a
    /// `Disconnected` event is emitted.
    pub async fn connect(&mut self, device_id: &str) -> Result<(), TrainerError> {
        let adapter = self
            .adapter
            .as_ref()
            .ok_or(TrainerError::AdapterNotFound)?
            .clone();

        if self.connection_state() == ConnectionState::Connected {
            return Ok(());
        }

        tracing::info!(device_id, "Connecting to trainer");
        self.set_connection_state(ConnectionState::Connecting);

        let mut guard = ConnectGuard {
            link: self.link.clone(),
            reconciler: self.reconciler.clone(),
            event_tx: self.event_tx.clone(),
            armed: true,
        };

        let attempt = timeout(
            self.config.connect_timeout,
            self.establish(&adapter, device_id),
        )
        .await;
        guard.disarm();

        match attempt {
            Ok(Ok(())) => {
                self.set_connection_state(ConnectionState::Connected);
                tracing::info!(device_id, "Connected to trainer");
                Ok(())
            }
            Ok(Err(err)) => {
                tracing::warn!(device_id, error = %err, "Connect attempt failed");
                self.disconnect().await;
                Err(err)
            }
            Err(_) => {
                tracing::warn!(device_id, "Connect attempt timed out");
                self.disconnect().await;
                Err(TrainerError::ConnectionTimeout)
            }
        }
    }

    /// Establish the link: radio connect, discovery, subscription, session
    /// wiring.
    async fn establish(&self, adapter: &Adapter, device_id: &str) -> Result<(), TrainerError> {
        let peripherals = adapter
            .peripherals()
            .await
            .map_err(|e| TrainerError::Ble(e.to_string()))?;

        let peripheral = peripherals
            .into_iter()
            .find(|p| p.id().to_string() == device_id)
            .ok_or_else(|| TrainerError::DeviceNotFound(device_id.to_string()))?;

        timeout(self.config.radio_connect_timeout, peripheral.connect())
            .await
            .map_err(|_| TrainerError::ConnectionTimeout)?
            .map_err(|e| TrainerError::ConnectionFailed(e.to_string()))?;

        // Stored before subscription so that a cancelled or failed attempt
        // can still be torn down through disconnect().
        *self.link.peripheral.lock().await = Some(peripheral.clone());

        peripheral
            .discover_services()
            .await
            .map_err(|e| TrainerError::ConnectionFailed(e.to_string()))?;

        let characteristics = peripheral.characteristics();
        if !characteristics
            .iter()
            .any(|c| c.service_uuid == FTMS_SERVICE_UUID)
        {
            return Err(TrainerError::ServiceNotFound);
        }

        let bike_data = Self::find_characteristic(&characteristics, INDOOR_BIKE_DATA_UUID)?;
        let control_point = Self::find_characteristic(&characteristics, FTMS_CONTROL_POINT_UUID)?;

        peripheral
            .subscribe(&bike_data)
            .await
            .map_err(|e| TrainerError::SubscriptionFailed(e.to_string()))?;
        peripheral
            .subscribe(&control_point)
            .await
            .map_err(|e| TrainerError::SubscriptionFailed(e.to_string()))?;

        tracing::debug!("Subscribed to Indoor Bike Data and Control Point");

        let notifications = peripheral
            .notifications()
            .await
            .map_err(|e| TrainerError::Ble(e.to_string()))?;

        let (command_tx, command_rx) = mpsc::channel(8);
        let (response_tx, response_rx) = mpsc::channel(8);

        self.reconciler
            .attach_session(ControlSession::new(
                command_tx,
                response_rx,
                self.config.response_timeout,
            ))
            .await;

        tokio::spawn(Self::run_control_writer(
            peripheral.clone(),
            control_point,
            command_rx,
        ));

        let event_tx = self.event_tx.clone();
        let reconciler = self.reconciler.clone();
        let link = self.link.clone();
        tokio::spawn(async move {
            Self::route_notifications(notifications, response_tx, event_tx, reconciler, link)
                .await;
        });

        Ok(())
    }

    fn find_characteristic(
        characteristics: &std::collections::BTreeSet<Characteristic>,
        uuid: uuid::Uuid,
    ) -> Result<Characteristic, TrainerError> {
        characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .cloned()
            .ok_or(TrainerError::CharacteristicNotFound(uuid))
    }

    /// Forward queued control point frames to the peripheral.
    ///
    /// A failed write is logged and otherwise left to the session's
    /// response timeout, which already treats a missing response as a
    /// failed procedure.
    async fn run_control_writer(
        peripheral: Peripheral,
        control_point: Characteristic,
        mut command_rx: mpsc::Receiver<Vec<u8>>,
    ) {
        while let Some(frame) = command_rx.recv().await {
            tracing::debug!(opcode = frame[0], len = frame.len(), "control point write");
            if let Err(err) = peripheral
                .write(&control_point, &frame, WriteType::WithResponse)
                .await
            {
                tracing::warn!(error = %err, "Control point write failed");
            }
        }
    }

    /// Route notifications from the peripheral until the stream ends.
    ///
    /// Telemetry is decoded and emitted in arrival order, independent of
    /// control channel activity. A stream that ends while we still believe
    /// we are connected is an unexpected disconnect.
    async fn route_notifications(
        mut notifications: std::pin::Pin<
            Box<dyn futures::Stream<Item = btleplug::api::ValueNotification> + Send>,
        >,
        response_tx: mpsc::Sender<ControlResponse>,
        event_tx: Option<Sender<TrainerEvent>>,
        reconciler: Reconciler,
        link: Arc<LinkShared>,
    ) {
        while let Some(notification) = notifications.next().await {
            if notification.uuid == INDOOR_BIKE_DATA_UUID {
                if let Some(sample) = ftms::decode_indoor_bike_data(&notification.value) {
                    Self::emit(&event_tx, TrainerEvent::Telemetry(sample));
                }
            } else if notification.uuid == FTMS_CONTROL_POINT_UUID {
                if let Some(response) = ftms::parse_control_response(&notification.value) {
                    let _ = response_tx.send(response).await;
                } else {
                    tracing::debug!("Unparseable control point indication");
                }
            }
        }

        // Stream end after an explicit disconnect was already handled there.
        let was_connected = {
            let mut state = link.connection_state.lock().unwrap();
            let was = *state;
            *state = ConnectionState::Disconnected;
            was != ConnectionState::Disconnected
        };

        if was_connected {
            tracing::warn!("Trainer link lost");
            link.peripheral.lock().await.take();
            reconciler.reset().await;
            Self::emit(
                &event_tx,
                TrainerEvent::ConnectionChanged(ConnectionState::Disconnected),
            );
        }
    }

    /// Disconnect from the trainer.
    ///
    /// Safe to call at any time, including mid-connect or when already
    /// disconnected. Always leaves the desired/confirmed state at `Idle`
    /// and the session at `Uncontrolled`.
    pub async fn disconnect(&mut self) {
        let peripheral = self.link.peripheral.lock().await.take();
        self.reconciler.reset().await;

        let was_connected = {
            let mut state = self.link.connection_state.lock().unwrap();
            let was = *state;
            *state = ConnectionState::Disconnected;
            was != ConnectionState::Disconnected
        };

        if let Some(peripheral) = peripheral {
            if let Err(err) = peripheral.disconnect().await {
                tracing::debug!(error = %err, "Peripheral disconnect failed");
            }
            tracing::info!("Disconnected from trainer");
        }

        if was_connected {
            self.emit_event(TrainerEvent::ConnectionChanged(ConnectionState::Disconnected));
        }
    }

    fn set_connection_state(&self, state: ConnectionState) {
        *self.link.connection_state.lock().unwrap() = state;
        self.emit_event(TrainerEvent::ConnectionChanged(state));
    }

    fn emit_event(&self, event: TrainerEvent) {
        Self::emit(&self.event_tx, event);
    }

    fn emit(event_tx: &Option<Sender<TrainerEvent>>, event: TrainerEvent) {
        if let Some(tx) = event_tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ControlMode;
    use std::time::Duration;

    fn connecting_link() -> Arc<LinkShared> {
        Arc::new(LinkShared {
            connection_state: Mutex::new(ConnectionState::Connecting),
            peripheral: tokio::sync::Mutex::new(None),
        })
    }

    #[tokio::test]
    async fn test_cancelled_connect_attempt_tears_down_state() {
        let link = connecting_link();
        let reconciler = Reconciler::new(EngineConfig::default());
        reconciler.set_desired_state(ControlMode::TargetPower { watts: 200 });
        let (tx, rx) = crossbeam::channel::unbounded();

        // Dropping an armed guard is what happens when the connect future
        // is cancelled mid-attempt.
        drop(ConnectGuard {
            link: link.clone(),
            reconciler: reconciler.clone(),
            event_tx: Some(tx),
            armed: true,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            *link.connection_state.lock().unwrap(),
            ConnectionState::Disconnected
        );
        assert_eq!(reconciler.desired_state(), ControlMode::Idle);
        assert!(matches!(
            rx.try_recv(),
            Ok(TrainerEvent::ConnectionChanged(ConnectionState::Disconnected))
        ));
    }

    #[tokio::test]
    async fn test_disarmed_guard_leaves_state_alone() {
        let link = connecting_link();
        let reconciler = Reconciler::new(EngineConfig::default());
        let (tx, rx) = crossbeam::channel::unbounded();

        let mut guard = ConnectGuard {
            link: link.clone(),
            reconciler,
            event_tx: Some(tx),
            armed: true,
        };
        guard.disarm();
        drop(guard);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            *link.connection_state.lock().unwrap(),
            ConnectionState::Connecting
        );
        assert!(rx.try_recv().is_err());
    }
}
