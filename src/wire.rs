//! The active-message wire header.
//!
//! Every data fragment begins with a 64-bit header laid out as
//! `group_id:16 | coll_id:8 | step_idx:8 | remote_offset:32`, written in host
//! byte order (the transport is a tightly-coupled interconnect; byte swapping,
//! if any, is the transport's problem). Variable-length steps prepend a second
//! 64-bit word carrying the source member index, so a receiver that gets
//! differently-sized payloads from several peers in the same step can
//! attribute each one.
//!
//! The `(coll_id, step_idx)` pair also doubles as the 16-bit *local id* the
//! demux compares against a completion slot's expectation.

use serde::{Deserialize, Serialize};

/// Group identity, unique within the process.
pub type GroupId = u16;
/// Collective identity, monotonically assigned modulo 256 per group.
pub type CollId = u8;
/// Step index within a plan, as carried on the wire.
pub type StepIdx = u8;
/// Widened step counter used during plan construction; plans whose phases
/// would not fit [`StepIdx`] are rejected, never truncated.
pub type StepIdxExt = u16;
/// Byte offset into the receiver's current step buffer.
pub type Offset = u32;
/// Active-message id consumed from the caller-chosen contiguous range.
pub type AmId = u8;

/// Parsed form of the fixed 64-bit fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub group_id: GroupId,
    pub coll_id: CollId,
    pub step_idx: StepIdx,
    pub remote_offset: Offset,
}

impl Header {
    /// Pack into the on-wire 64-bit representation.
    #[must_use]
    pub fn pack(&self) -> u64 {
        u64::from(self.group_id)
            | (u64::from(self.coll_id) << 16)
            | (u64::from(self.step_idx) << 24)
            | (u64::from(self.remote_offset) << 32)
    }

    /// Unpack from the on-wire representation.
    #[must_use]
    pub fn unpack(raw: u64) -> Self {
        Self {
            group_id: raw as u16,
            coll_id: (raw >> 16) as u8,
            step_idx: (raw >> 24) as u8,
            remote_offset: (raw >> 32) as u32,
        }
    }

    /// The 16-bit `(coll_id, step_idx)` pair used for slot matching.
    #[must_use]
    pub fn local_id(&self) -> u16 {
        u16::from(self.coll_id) | (u16::from(self.step_idx) << 8)
    }

    /// Compose a local id without building a full header.
    #[must_use]
    pub fn make_local_id(coll_id: CollId, step_idx: StepIdx) -> u16 {
        u16::from(coll_id) | (u16::from(step_idx) << 8)
    }
}

/// Number of leading payload bytes occupied by the source-rank extension on
/// variable-length steps.
pub const EXT_HEADER_LEN: usize = 8;

/// Prepend the source-rank extension word to a payload.
pub fn write_ext_header(src_rank: u64, out: &mut Vec<u8>) {
    out.extend_from_slice(&src_rank.to_ne_bytes());
}

/// Split the source-rank extension off a variable-length payload.
///
/// Returns `None` when the payload is too short to carry the extension.
#[must_use]
pub fn read_ext_header(data: &[u8]) -> Option<(u64, &[u8])> {
    if data.len() < EXT_HEADER_LEN {
        return None;
    }
    let mut word = [0u8; EXT_HEADER_LEN];
    word.copy_from_slice(&data[..EXT_HEADER_LEN]);
    Some((u64::from_ne_bytes(word), &data[EXT_HEADER_LEN..]))
}
