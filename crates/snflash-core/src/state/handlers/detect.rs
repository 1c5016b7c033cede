//! Port open and model detection.

use tracing::{info, warn};

use crate::events::{LogLevel, SessionEvent, SessionObserver};
use crate::protocol::{Command, TextReply};
use crate::state::machine::AbortReason;
use crate::transport::{Link, SerialTransport};

use super::{HandlerContext, StepResult};

/// Open the configured port and start receiving.
pub fn handle_idle<T: SerialTransport, O: SessionObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> StepResult {
    info!(port = %ctx.port, "Opening port");
    let rx = ctx.transport.open(ctx.port)?;
    ctx.link = Some(Link::new(rx, ctx.cancel.clone()));
    ctx.emit(SessionEvent::PortOpened {
        port: ctx.port.name.clone(),
    });
    Ok(())
}

/// Ask the device for its model and check that an image exists for it.
pub fn handle_model_detecting<T: SerialTransport, O: SessionObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> StepResult {
    let reply = match ctx.exchange_line(&Command::QueryModel) {
        Ok(reply) => reply,
        // Silence and line noise look the same to the operator.
        Err(AbortReason::Timeout) | Err(AbortReason::UnexpectedFrame(_)) => {
            warn!("No intelligible reply to model query");
            return Err(AbortReason::NoDeviceResponse);
        }
        Err(other) => return Err(other),
    };

    let model = match reply {
        TextReply::Model(model) => model,
        other => {
            warn!(reply = ?other, "Model query answered with something else");
            return Err(AbortReason::NoDeviceResponse);
        }
    };

    ctx.emit(SessionEvent::ModelDetected {
        model: model.clone(),
    });
    if !ctx.vault.supports(&model) {
        ctx.log(
            LogLevel::Error,
            format!("No diagnostics image registered for {}", model),
        );
        return Err(AbortReason::UnsupportedModel(model));
    }
    ctx.state.model = Some(model);
    Ok(())
}
