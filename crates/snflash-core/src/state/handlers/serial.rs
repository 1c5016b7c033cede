//! Serial read, replacement, write and verification.

use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::events::{SessionEvent, SessionObserver};
use crate::protocol::{Command, TextReply};
use crate::serial_number;
use crate::state::machine::AbortReason;
use crate::transport::SerialTransport;

use super::{HandlerContext, SessionControl, StepResult};

/// How often the link is checked while waiting for the caller.
const CONTROL_POLL: Duration = Duration::from_millis(50);

pub fn handle_serial_reading<T: SerialTransport, O: SessionObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> StepResult {
    let raw = ctx.query_serial()?;
    let serial = serial_number::parse(&raw).map_err(|e| {
        AbortReason::ProtocolError(format!("device reported serial {:?}: {}", raw, e))
    })?;

    info!(serial = %serial, "Current serial");
    ctx.emit(SessionEvent::OldSerial {
        serial: serial.clone(),
    });
    ctx.state.old_serial = Some(serial);
    Ok(())
}

/// Wait for a valid replacement from the caller. Invalid candidates are
/// reported back and waiting continues; nothing is sent to the device.
pub fn handle_awaiting_new_serial<T: SerialTransport, O: SessionObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> StepResult {
    let deadline = ctx.config.new_serial_timeout().map(|t| Instant::now() + t);
    loop {
        ctx.poll_link()?;

        match ctx.control.recv_timeout(CONTROL_POLL) {
            Ok(SessionControl::NewSerial(candidate)) => match serial_number::parse(&candidate) {
                Ok(serial) => {
                    info!(serial = %serial, "Replacement serial accepted");
                    ctx.state.new_serial = Some(serial);
                    return Ok(());
                }
                Err(error) => {
                    warn!(candidate = %candidate, %error, "Replacement serial rejected");
                    ctx.emit(SessionEvent::SerialRejected { candidate, error });
                }
            },
            Ok(SessionControl::Cancel) => return Err(AbortReason::UserCancelled),
            Err(RecvTimeoutError::Timeout) => {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Err(AbortReason::Timeout);
                }
            }
            // Nobody can supply a serial any more.
            Err(RecvTimeoutError::Disconnected) => return Err(AbortReason::UserCancelled),
        }
    }
}

pub fn handle_serial_writing<T: SerialTransport, O: SessionObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> StepResult {
    let serial = ctx
        .state
        .new_serial
        .clone()
        .ok_or_else(|| AbortReason::ProtocolError("no replacement serial".into()))?;

    match ctx.exchange_line(&Command::WriteSerial(serial.clone()))? {
        TextReply::Ok => {
            ctx.emit(SessionEvent::SerialWritten { serial });
            Ok(())
        }
        TextReply::Err(msg) => Err(AbortReason::DeviceRejected(msg)),
        other => Err(AbortReason::UnexpectedFrame(format!(
            "expected OK, got {:?}",
            other
        ))),
    }
}

/// Read the serial back. A difference is reported, never retried.
pub fn handle_verifying<T: SerialTransport, O: SessionObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> StepResult {
    let expected = ctx
        .state
        .new_serial
        .clone()
        .ok_or_else(|| AbortReason::ProtocolError("no replacement serial".into()))?;

    let actual = ctx.query_serial()?;
    if actual != expected.as_str() {
        return Err(AbortReason::VerificationMismatch { expected, actual });
    }
    info!(serial = %expected, "Serial verified");
    Ok(())
}
