//! Exploit payload delivery.

use tracing::info;

use crate::events::{SessionEvent, SessionObserver};
use crate::protocol::Command;
use crate::protocol::constants::ACK_VALUE_CONTROL;
use crate::state::machine::{AbortReason, SessionPhase};
use crate::transport::SerialTransport;

use super::{HandlerContext, StepResult};

/// Send the model's exploit payload and wait for the device to accept it.
pub fn handle_exploit_entering<T: SerialTransport, O: SessionObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> StepResult {
    let model = ctx
        .state
        .model
        .clone()
        .ok_or_else(|| AbortReason::ProtocolError("model not detected".into()))?;
    let payload = ctx.payloads.payload_for(&model)?;
    let total = payload.len() as u64;

    info!(model = %model, bytes = total, "Sending exploit payload");
    ctx.send(&Command::Exploit(payload))?;
    ctx.await_ack("exploit", ACK_VALUE_CONTROL)?;

    ctx.emit(SessionEvent::Progress {
        phase: SessionPhase::ExploitEntering,
        operation: "exploit".into(),
        current: total,
        total,
    });
    Ok(())
}
