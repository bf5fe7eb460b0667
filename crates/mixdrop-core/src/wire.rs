//! mixdrop wire format.
//!
//! Two things travel between peers:
//!   1. Part messages over the mix network. Each plaintext is a fixed 4-byte
//!      `PartHeader` followed by the part body, zero-padded to the transport's
//!      payload size so every message looks the same on the wire.
//!   2. One `TransferAnnouncement` per transfer over the announcement
//!      channel, carrying everything the receiver needs to decrypt parts.
//!
//! The header is #[repr(C, packed)] with explicit little-endian fields and
//! zerocopy derives. There is no unsafe code in this module.

use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use thiserror::Error;
use zerocopy::byteorder::{LittleEndian, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::crypto::{TransferKey, TransferMac};

/// Current part header version. Unknown versions are rejected.
pub const PART_VERSION: u8 = 0x01;

/// Size of `PartHeader` on the wire.
pub const PART_HEADER_LEN: usize = 4;

// ── Part header ───────────────────────────────────────────────────────────────

/// Prefix of every decrypted part message.
///
/// Wire size: 4 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct PartHeader {
    /// Zero-based index of the part within its file.
    pub part_num: U16<LittleEndian>,

    /// Wire format version. Currently 0x01.
    pub version: u8,

    /// Reserved, must be zero.
    pub flags: u8,
}

assert_eq_size!(PartHeader, [u8; PART_HEADER_LEN]);

/// Bytes of file data that fit in one message of `max_payload` bytes.
pub fn part_size(max_payload: usize) -> Result<usize, WireError> {
    match max_payload.checked_sub(PART_HEADER_LEN) {
        Some(size) if size > 0 => Ok(size),
        _ => Err(WireError::PayloadTooSmall(max_payload)),
    }
}

/// Build the plaintext for one part, padded to exactly `payload_size` bytes.
pub fn encode_part(part_num: u16, body: &[u8], payload_size: usize) -> Result<Vec<u8>, WireError> {
    let needed = PART_HEADER_LEN + body.len();
    if needed > payload_size {
        return Err(WireError::BodyTooLarge {
            needed,
            available: payload_size,
        });
    }

    let header = PartHeader {
        part_num: U16::new(part_num),
        version: PART_VERSION,
        flags: 0,
    };

    let mut out = Vec::with_capacity(payload_size);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(body);
    out.resize(payload_size, 0);
    Ok(out)
}

/// Split a decrypted part message into its part number and body.
///
/// The body still carries padding; the receiver trims the assembled file to
/// the announced size.
pub fn decode_part(message: &[u8]) -> Result<(u16, &[u8]), WireError> {
    let header = PartHeader::read_from_prefix(message).ok_or(WireError::Truncated(message.len()))?;
    if header.version != PART_VERSION {
        return Err(WireError::UnknownVersion(header.version));
    }
    Ok((header.part_num.get(), &message[PART_HEADER_LEN..]))
}

// ── Announcement ──────────────────────────────────────────────────────────────

/// Everything a receiver needs to accept an incoming transfer.
///
/// Sent once per transfer over the announcement channel before any part is
/// transmitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferAnnouncement {
    pub file_name: String,
    pub file_type: String,
    pub key: TransferKey,
    pub mac: TransferMac,
    pub num_parts: u16,
    pub size: u32,
    pub retry: f32,
    #[serde(default)]
    pub preview: Vec<u8>,
}

impl TransferAnnouncement {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(WireError::Announcement)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(payload).map_err(WireError::Announcement)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum WireError {
    #[error("transport payload of {0} bytes cannot carry a part")]
    PayloadTooSmall(usize),
    #[error("part body needs {needed} bytes, payload holds {available}")]
    BodyTooLarge { needed: usize, available: usize },
    #[error("part message of {0} bytes is shorter than its header")]
    Truncated(usize),
    #[error("unknown part version {0:#04x}")]
    UnknownVersion(u8),
    #[error("malformed announcement: {0}")]
    Announcement(serde_json::Error),
}
