//! Parts and partitioning.

use bytes::Bytes;
use mixdrop_core::TransferId;

/// One part waiting to be sent. The owning transfer is looked up by ID when
/// the part is dequeued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Part {
    pub transfer_id: TransferId,
    pub part_num: u16,
}

impl Part {
    pub fn new(transfer_id: TransferId, part_num: u16) -> Self {
        Self {
            transfer_id,
            part_num,
        }
    }
}

/// Split `file` into parts of exactly `part_size` bytes. The last part is
/// zero-padded.
pub fn partition_file(file: &[u8], part_size: usize) -> Vec<Bytes> {
    file.chunks(part_size)
        .map(|chunk| {
            let mut part = chunk.to_vec();
            part.resize(part_size, 0);
            Bytes::from(part)
        })
        .collect()
}

/// Fingerprints allotted to a transfer of `num_parts` with the given retry
/// factor: `floor(num_parts * (1 + retry))`, never fewer than `num_parts`.
pub fn num_fingerprints(num_parts: u16, retry: f32) -> u16 {
    let retry = retry.max(0.0);
    let fps = (f32::from(num_parts) * (1.0 + retry)) as u16;
    fps.max(num_parts)
}
