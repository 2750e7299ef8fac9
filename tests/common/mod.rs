//! Shared test infrastructure: a scripted mock machine behind the control
//! session's channel seam.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use trainerlink::{ControlResponse, ControlSession, ResultCode};

/// Frames the mock machine has received, in order.
pub type Frames = Arc<Mutex<Vec<Vec<u8>>>>;

/// How the mock machine answers one incoming frame.
#[allow(dead_code)]
pub enum Script {
    /// Respond immediately with this result code byte
    Reply(u8),
    /// Respond with this result code byte after a delay
    ReplyLate(u8, Duration),
    /// Never respond
    Silent,
}

/// Build a `ControlSession` wired to a scripted mock machine.
///
/// The machine consumes one `Script` entry per received frame and echoes the
/// frame's opcode in its response; once the script is exhausted every frame
/// is answered with Success (0x01).
pub fn scripted_session(
    response_timeout: Duration,
    script: Vec<Script>,
) -> (ControlSession, Frames) {
    let (command_tx, mut command_rx) = mpsc::channel::<Vec<u8>>(8);
    let (response_tx, response_rx) = mpsc::channel(8);

    let frames: Frames = Arc::new(Mutex::new(Vec::new()));
    let frames_task = frames.clone();
    let mut script = VecDeque::from(script);

    tokio::spawn(async move {
        while let Some(frame) = command_rx.recv().await {
            let opcode = frame[0];
            frames_task.lock().unwrap().push(frame);

            let action = script.pop_front().unwrap_or(Script::Reply(0x01));
            let (code, delay) = match action {
                Script::Reply(code) => (code, None),
                Script::ReplyLate(code, delay) => (code, Some(delay)),
                Script::Silent => continue,
            };

            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let response = ControlResponse {
                request_opcode: opcode,
                result: ResultCode::from_byte(code),
            };
            if response_tx.send(response).await.is_err() {
                break;
            }
        }
    });

    (
        ControlSession::new(command_tx, response_rx, response_timeout),
        frames,
    )
}

/// Opcodes of all frames the machine received so far.
#[allow(dead_code)]
pub fn opcodes(frames: &Frames) -> Vec<u8> {
    frames.lock().unwrap().iter().map(|f| f[0]).collect()
}
