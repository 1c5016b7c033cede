//! Per-state handlers.
//!
//! Each handler performs the device work of one state. Returning `Ok(())`
//! advances to the next state on the success path; an [`AbortReason`] ends
//! the session.
//!
//! - `detect`: port open and model detection
//! - `exploit`: exploit payload delivery
//! - `delivery`: boot and diagnostics image streaming
//! - `serial`: serial read, replacement, write and verification

mod delivery;
mod detect;
mod exploit;
mod serial;

use std::sync::mpsc::Receiver;
use std::time::Duration;

use crate::config::SessionConfig;
use crate::events::{LogLevel, PacketDirection, SessionEvent, SessionObserver};
use crate::payload::ExploitPayloadProvider;
use crate::protocol::{AckFrame, Command, TextReply};
use crate::protocol::constants::ACK_FRAME_SIZE;
use crate::state::machine::{AbortReason, SessionState, StateMachineContext};
use crate::transport::{CancelToken, Link, PortDescriptor, SerialTransport};
use crate::vault::{DecryptedImage, ImageVault};

use delivery::handle_diags_delivering;
use detect::{handle_idle, handle_model_detecting};
use exploit::handle_exploit_entering;
use serial::{
    handle_awaiting_new_serial, handle_serial_reading, handle_serial_writing, handle_verifying,
};

/// Bytes of each packet copied into [`SessionEvent::Packet`].
const PACKET_PREVIEW: usize = 32;

/// Outcome of one handler.
pub type StepResult = Result<(), AbortReason>;

/// Message from the caller to a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionControl {
    /// Candidate replacement serial, exactly as typed.
    NewSerial(String),
    Cancel,
}

/// Everything a handler may touch.
pub struct HandlerContext<'a, T: SerialTransport, O: SessionObserver + ?Sized> {
    pub transport: &'a mut T,
    pub observer: &'a O,
    pub state: StateMachineContext,
    pub config: &'a SessionConfig,
    pub port: &'a PortDescriptor,
    pub vault: &'a ImageVault,
    pub payloads: &'a dyn ExploitPayloadProvider,
    pub control: &'a Receiver<SessionControl>,
    pub cancel: CancelToken,
    /// Receive side of the open connection.
    pub link: Option<Link>,
    /// Decrypted images staged this session; removed on exit.
    pub staged: Vec<DecryptedImage>,
}

impl<'a, T: SerialTransport, O: SessionObserver + ?Sized> HandlerContext<'a, T, O> {
    pub(crate) fn emit(&self, event: SessionEvent) {
        self.observer.on_event(&event);
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(SessionEvent::Log {
            level,
            message: message.into(),
        });
    }

    pub(crate) fn link_mut(&mut self) -> Result<&mut Link, AbortReason> {
        self.link.as_mut().ok_or(AbortReason::ConnectionLost)
    }

    /// Notice disconnects and cancellation that happened between steps.
    pub(crate) fn poll_link(&mut self) -> StepResult {
        match self.link.as_mut() {
            Some(link) => Ok(link.poll()?),
            None => Ok(()),
        }
    }

    pub(crate) fn send(&mut self, cmd: &Command) -> StepResult {
        let bytes = cmd.encode();
        if cmd.expects_line() {
            // A text exchange starts from a clean buffer.
            let stale = self.link_mut()?.discard_pending()?;
            if stale > 0 {
                tracing::debug!(bytes = stale, "Discarded stale input");
            }
        }
        self.transport.send(&bytes)?;
        Ok(())
    }

    /// Send a text command and wait for its reply line.
    pub(crate) fn exchange_line(&mut self, cmd: &Command) -> Result<TextReply, AbortReason> {
        self.send(cmd)?;
        let timeout = self.config.response_timeout();
        let line = self.link_mut()?.read_line(timeout)?;
        self.emit_rx(cmd.name(), line.as_bytes());
        Ok(TextReply::parse(&line)?)
    }

    /// Read one binary ack frame.
    pub(crate) fn read_ack(&mut self, timeout: Duration) -> Result<AckFrame, AbortReason> {
        let bytes = self.link_mut()?.read_exact(ACK_FRAME_SIZE, timeout)?;
        self.emit_rx("ACK", &bytes);
        Ok(AckFrame::from_bytes(&bytes)?)
    }

    /// Wait for `ACK <expected>`. WAIT frames restart the timer; NAK is a
    /// refusal.
    pub(crate) fn await_ack(&mut self, what: &str, expected: u32) -> StepResult {
        let timeout = self.config.ack_timeout();
        loop {
            match self.read_ack(timeout)? {
                AckFrame::Ok(value) if value == expected => return Ok(()),
                AckFrame::Ok(value) => {
                    return Err(AbortReason::UnexpectedFrame(format!(
                        "{}: ack for {:#x}, expected {:#x}",
                        what, value, expected
                    )));
                }
                AckFrame::Wait => {
                    tracing::trace!(what, "Device asked to wait");
                }
                AckFrame::Nak(code) => {
                    return Err(AbortReason::DeviceRejected(format!(
                        "{} refused with code {}",
                        what, code
                    )));
                }
            }
        }
    }

    /// Read the serial and return it unparsed.
    pub(crate) fn query_serial(&mut self) -> Result<String, AbortReason> {
        match self.exchange_line(&Command::ReadSerial)? {
            TextReply::Serial(value) => Ok(value),
            TextReply::Err(msg) => Err(AbortReason::DeviceRejected(msg)),
            other => Err(AbortReason::UnexpectedFrame(format!(
                "expected serial, got {:?}",
                other
            ))),
        }
    }

    fn emit_rx(&self, command: &str, data: &[u8]) {
        self.emit(SessionEvent::Packet {
            direction: PacketDirection::Rx,
            command: command.to_string(),
            length: data.len(),
            data: packet_preview(data),
        });
    }
}

/// Run the handler for the current state and return the state to move to.
pub fn handle_state<T: SerialTransport, O: SessionObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> SessionState {
    let current = ctx.state.state.clone();
    if current.is_terminal() {
        return current;
    }
    if let Err(reason) = ctx.poll_link() {
        return SessionState::Aborted(reason);
    }
    let result = match current {
        SessionState::Idle => handle_idle(ctx),
        SessionState::ModelDetecting => handle_model_detecting(ctx),
        SessionState::ExploitEntering => handle_exploit_entering(ctx),
        SessionState::DiagsDelivering => handle_diags_delivering(ctx),
        SessionState::SerialReading => handle_serial_reading(ctx),
        SessionState::AwaitingNewSerial => handle_awaiting_new_serial(ctx),
        SessionState::SerialWriting => handle_serial_writing(ctx),
        SessionState::Verifying => handle_verifying(ctx),
        SessionState::Completed | SessionState::Aborted(_) => return current,
    };
    match result {
        Ok(()) => current.next().unwrap_or(current),
        Err(reason) => SessionState::Aborted(reason),
    }
}

pub(crate) fn packet_preview(data: &[u8]) -> Vec<u8> {
    data.iter().take(PACKET_PREVIEW).copied().collect()
}
