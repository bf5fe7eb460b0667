//! Receive path — one processor per registered fingerprint.
//!
//! The transport hands every message matching a fingerprint to the processor
//! registered for it. The processor decrypts with that slot's cypher, stores
//! the part, retires the slot and reports progress.

use std::sync::{Arc, Weak};

use mixdrop_core::wire::decode_part;
use mixdrop_core::EncryptedPart;
use mixdrop_store::{Cypher, ReceivedTransfer};

use crate::context::EngineContext;
use crate::transport::{FingerprintProcessor, TransportError};

pub(crate) struct PartProcessor {
    transfer: Arc<ReceivedTransfer>,
    cypher: Cypher,
    ctx: Weak<EngineContext>,
}

impl FingerprintProcessor for PartProcessor {
    fn process(&self, part: &EncryptedPart) {
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        let tid = self.transfer.tid();
        let fp_num = self.cypher.fp_num();

        let plaintext = match self.cypher.decrypt(ctx.crypto.as_ref(), part) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(transfer_id = %tid, fp = fp_num, error = %e, "failed to decrypt part");
                return;
            }
        };
        let (part_num, body) = match decode_part(&plaintext) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(transfer_id = %tid, fp = fp_num, error = %e, "malformed part message");
                return;
            }
        };

        match self.transfer.add_part(body, part_num) {
            Ok(true) => tracing::trace!(transfer_id = %tid, part = part_num, "part received"),
            Ok(false) => tracing::trace!(transfer_id = %tid, part = part_num, "duplicate part"),
            Err(e) => {
                tracing::warn!(transfer_id = %tid, part = part_num, error = %e, "failed to store part");
                return;
            }
        }
        if let Err(e) = self.transfer.use_fingerprint(fp_num) {
            tracing::warn!(transfer_id = %tid, fp = fp_num, error = %e, "failed to retire fingerprint");
        }
        ctx.transport
            .unregister_fingerprint(&self.cypher.fingerprint());

        if self.transfer.is_complete() {
            tracing::info!(transfer_id = %tid, file_name = self.transfer.file_name(), "all parts received");
        }
        ctx.callbacks.call(tid, None);
    }
}

/// Register a processor for every unused fingerprint of `transfer`.
pub(crate) fn register_processors(
    ctx: &Arc<EngineContext>,
    transfer: &Arc<ReceivedTransfer>,
) -> Result<usize, TransportError> {
    let cyphers = transfer.unused_cyphers();
    let count = cyphers.len();
    for cypher in cyphers {
        let fingerprint = cypher.fingerprint();
        let processor = Arc::new(PartProcessor {
            transfer: Arc::clone(transfer),
            cypher,
            ctx: Arc::downgrade(ctx),
        });
        ctx.transport.register_fingerprint(fingerprint, processor)?;
    }
    tracing::debug!(transfer_id = %transfer.tid(), fingerprints = count, "registered receive fingerprints");
    Ok(count)
}

/// Drop every fingerprint of `transfer` still registered.
pub(crate) fn unregister_processors(ctx: &EngineContext, transfer: &ReceivedTransfer) {
    for cypher in transfer.unused_cyphers() {
        ctx.transport.unregister_fingerprint(&cypher.fingerprint());
    }
}
