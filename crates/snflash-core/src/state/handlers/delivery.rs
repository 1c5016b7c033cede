//! Boot and diagnostics image streaming.
//!
//! A transfer is `XFRB`, then one `XFRC` per chunk, then `XFRE`. Exactly one
//! frame is in flight: the next chunk goes out only after the previous
//! one's ack arrived.

use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::events::{SessionEvent, SessionObserver};
use crate::payload::ChunkState;
use crate::protocol::constants::ACK_VALUE_CONTROL;
use crate::protocol::{Command, ImageKind};
use crate::state::machine::{AbortReason, SessionPhase};
use crate::transport::SerialTransport;
use crate::vault::DecryptedImage;

use super::{HandlerContext, StepResult};

/// Stream the optional boot image, then the model's diagnostics image.
pub fn handle_diags_delivering<T: SerialTransport, O: SessionObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> StepResult {
    let model = ctx
        .state
        .model
        .clone()
        .ok_or_else(|| AbortReason::ProtocolError("model not detected".into()))?;

    if let Some(boot) = ctx.vault.decrypt_boot_image()? {
        let data = stage(ctx, boot)?;
        transfer(ctx, ImageKind::Boot, &data)?;
    }

    let diags = ctx.vault.decrypt_asset(&model)?;
    let data = stage(ctx, diags)?;
    transfer(ctx, ImageKind::Diagnostics, &data)
}

/// Take ownership of a staged image and load its bytes.
fn stage<T: SerialTransport, O: SessionObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
    image: DecryptedImage,
) -> Result<Zeroizing<Vec<u8>>, AbortReason> {
    ctx.emit(SessionEvent::ImageStaged {
        label: image.label().to_string(),
        path: image.path().to_path_buf(),
        bytes: image.len(),
    });
    let data = image.read_all();
    // Keep the file registered for cleanup even if reading failed.
    ctx.staged.push(image);
    let data = data.map_err(|e| AbortReason::ImageUnavailable(e.to_string()))?;
    if data.is_empty() {
        return Err(AbortReason::ImageUnavailable("decrypted image is empty".into()));
    }
    Ok(Zeroizing::new(data))
}

fn transfer<T: SerialTransport, O: SessionObserver + ?Sized>(
    ctx: &mut HandlerContext<'_, T, O>,
    kind: ImageKind,
    data: &[u8],
) -> StepResult {
    let chunk_size = ctx.config.effective_chunk_size();
    let mut chunks = ChunkState::new(data.len(), chunk_size);
    let total_len = u32::try_from(data.len())
        .map_err(|_| AbortReason::ImageUnavailable(format!("{} exceeds 4 GiB", kind)))?;
    let chunk_count = chunks.total as u32;
    let operation = kind.to_string();

    info!(%kind, bytes = total_len, chunks = chunk_count, "Starting transfer");
    ctx.send(&Command::TransferBegin {
        kind,
        total_len,
        chunk_count,
    })?;
    ctx.await_ack("transfer begin", ACK_VALUE_CONTROL)?;

    let mut sent = 0u64;
    while let Some((index, chunk)) = chunks.next_chunk(data) {
        let index = index as u32;
        ctx.send(&Command::TransferChunk {
            index,
            data: chunk.to_vec(),
        })?;
        ctx.await_ack("chunk", index)?;

        sent += chunk.len() as u64;
        debug!(%kind, index, pct = chunks.progress_pct(), "Chunk acknowledged");
        ctx.emit(SessionEvent::Progress {
            phase: SessionPhase::DiagsDelivering,
            operation: operation.clone(),
            current: sent,
            total: total_len as u64,
        });
    }

    ctx.send(&Command::TransferEnd)?;
    ctx.await_ack("transfer end", ACK_VALUE_CONTROL)?;
    info!(%kind, "Transfer complete");
    Ok(())
}
