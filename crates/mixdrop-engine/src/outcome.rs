//! Round outcome resolution.
//!
//! A delivered round marks every part it carried as arrived, then reports
//! once per affected transfer, so a callback sees the whole batch at once.
//! A lost round sends every part it carried back to the ready queue.

use mixdrop_core::{RoundId, TransferId};
use mixdrop_store::{Part, SentTransfer};

use crate::context::EngineContext;

pub(crate) async fn resolve_round(
    ctx: &EngineContext,
    round: RoundId,
    transfers: &[TransferId],
    delivered: bool,
) {
    if delivered {
        for tid in transfers {
            let Some(transfer) = ctx.sent.get(tid) else {
                tracing::debug!(transfer_id = %tid, %round, "round resolved for a closed transfer");
                continue;
            };
            match transfer.finish_in_progress(round) {
                Ok(completed) => {
                    ctx.callbacks.call(*tid, None);
                    if completed {
                        transfer_completed(ctx, &transfer);
                    }
                }
                Err(e) => {
                    tracing::error!(transfer_id = %tid, %round, error = %e, "failed to finish round");
                }
            }
        }
        return;
    }

    let mut parts = Vec::new();
    for tid in transfers {
        if let Some(transfer) = ctx.sent.get(tid) {
            parts.extend(
                transfer
                    .unset_in_progress(round)
                    .into_iter()
                    .map(|n| Part::new(*tid, n)),
            );
        }
    }
    tracing::debug!(%round, parts = parts.len(), "round failed, requeueing parts");
    ctx.requeue(parts).await;
}

fn transfer_completed(ctx: &EngineContext, transfer: &SentTransfer) {
    tracing::info!(
        transfer_id = %transfer.tid(),
        file_name = transfer.file_name(),
        parts = transfer.num_parts(),
        "file transfer complete"
    );
    if let Err(e) = ctx.announcer.send_completion(transfer.recipient()) {
        tracing::warn!(
            transfer_id = %transfer.tid(),
            error = %e,
            "failed to notify recipient of completion"
        );
    }
}
