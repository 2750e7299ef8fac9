//! Control point session for the Fitness Machine Control Point.
//!
//! The control point is a single request/response rail: the client writes a
//! command frame and the machine answers asynchronously with an indication
//! `[0x80, echoed opcode, result code]`. The device specification requires
//! each control procedure to complete before the next begins, so the session
//! exposes `&mut self` exchanges and the caller never overlaps them.

use crate::ftms::{self, ControlResponse, ResultCode};
use crate::types::{CommandError, ControlSessionState};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

/// Request/response session over the control point characteristic.
///
/// Outbound frames go to the control-point writer task through `command_tx`;
/// response indications arrive from the notification router on
/// `response_rx`. Both channels die with the connection, which is how the
/// session learns the link is gone.
pub struct ControlSession {
    state: ControlSessionState,
    command_tx: mpsc::Sender<Vec<u8>>,
    response_rx: mpsc::Receiver<ControlResponse>,
    response_timeout: Duration,
}

impl ControlSession {
    /// Create a session over the given command/response channels.
    pub fn new(
        command_tx: mpsc::Sender<Vec<u8>>,
        response_rx: mpsc::Receiver<ControlResponse>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            state: ControlSessionState::Uncontrolled,
            command_tx,
            response_rx,
            response_timeout,
        }
    }

    /// Current session state.
    pub fn state(&self) -> ControlSessionState {
        self.state
    }

    /// Request control of the machine.
    ///
    /// No-op when control is already held. Any failure, including the
    /// response timeout, returns the session to `Uncontrolled`; a late
    /// indication from a timed-out request is drained and ignored by the
    /// next exchange.
    pub async fn request_control(&mut self) -> Result<(), CommandError> {
        if self.state == ControlSessionState::Controlled {
            return Ok(());
        }

        self.state = ControlSessionState::RequestingControl;
        tracing::debug!("requesting control of the machine");

        match self.exchange(ftms::build_request_control()).await {
            Ok(ResultCode::Success) => {
                tracing::info!("control of the machine granted");
                self.state = ControlSessionState::Controlled;
                Ok(())
            }
            Ok(code) => {
                tracing::warn!(result = %code, "request control rejected");
                self.state = ControlSessionState::Uncontrolled;
                Err(CommandError::Rejected(code))
            }
            Err(err) => {
                self.state = ControlSessionState::Uncontrolled;
                Err(err)
            }
        }
    }

    /// Send a command frame and wait for its response.
    ///
    /// Requires `Controlled`. A `ControlNotPermitted` response moves the
    /// session to `Lost` so the owner re-requests control before the next
    /// command.
    pub async fn send_command(&mut self, frame: Vec<u8>) -> Result<ResultCode, CommandError> {
        if self.state != ControlSessionState::Controlled {
            return Err(CommandError::NotInControl);
        }

        let result = self.exchange(frame).await?;
        if result == ResultCode::ControlNotPermitted {
            tracing::warn!("machine revoked control");
            self.state = ControlSessionState::Lost;
            return Err(CommandError::ControlLost);
        }

        Ok(result)
    }

    /// Write one frame and await the matching response indication.
    async fn exchange(&mut self, frame: Vec<u8>) -> Result<ResultCode, CommandError> {
        let opcode = frame[0];

        // Anything already queued belongs to a procedure that timed out.
        while let Ok(stale) = self.response_rx.try_recv() {
            tracing::debug!(
                opcode = stale.request_opcode,
                "discarding late control point response"
            );
        }

        self.command_tx
            .send(frame)
            .await
            .map_err(|_| CommandError::LinkClosed)?;

        let deadline = Instant::now() + self.response_timeout;
        loop {
            match timeout_at(deadline, self.response_rx.recv()).await {
                Ok(Some(response)) if response.request_opcode == opcode => {
                    return Ok(response.result);
                }
                Ok(Some(response)) => {
                    tracing::debug!(
                        opcode = response.request_opcode,
                        "ignoring response for a different opcode"
                    );
                }
                Ok(None) => return Err(CommandError::LinkClosed),
                Err(_) => {
                    tracing::debug!(opcode, "control point response timed out");
                    return Err(CommandError::ResponseTimeout);
                }
            }
        }
    }

    /// Drop any claim to control, e.g. on link loss.
    pub fn reset(&mut self) {
        self.state = ControlSessionState::Uncontrolled;
    }
}
