//! Completion slots and inbound-fragment matching.
//!
//! Each group owns a window of [`NUM_SLOTS`] completion slots; an in-flight
//! collective occupies the slot at `coll_id mod NUM_SLOTS`, so no more than
//! [`NUM_SLOTS`] collectives can be outstanding per group. Every inbound
//! fragment is compared against the slot's expectation:
//!
//! - **Match** -- the slot's active request is at the fragment's step and
//!   ready to receive; the payload is handed to the executor.
//! - **Early** -- the fragment belongs to a step (or a collective) the local
//!   side has not reached; it is copied into a pooled descriptor and parked
//!   on the slot. Activating a step drains matching descriptors before
//!   waiting for new arrivals.
//! - **Late** -- the fragment names an already-completed collective; it is
//!   dropped with a warning. This is legal only for the tail of a previous
//!   operation.

use crate::exec::ActiveReq;
use crate::wire::{CollId, Header};
use log::{trace, warn};

/// Size of the per-group completion window. Slot lookup happens on every
/// inbound packet, so the window stays a power of two.
pub const NUM_SLOTS: usize = 16;

/// A parked early arrival.
#[derive(Debug)]
pub(crate) struct EarlyDesc {
    pub header: Header,
    /// Payload bytes (wire header already stripped); storage comes from the
    /// slot's descriptor pool.
    pub data: Vec<u8>,
}

/// Recycled storage for early-arrival descriptors, so steady-state parking
/// does not allocate.
#[derive(Debug, Default)]
pub(crate) struct DescPool {
    free: Vec<Vec<u8>>,
}

impl DescPool {
    fn take(&mut self, payload: &[u8]) -> Vec<u8> {
        let mut buf = self.free.pop().unwrap_or_default();
        buf.clear();
        buf.extend_from_slice(payload);
        buf
    }

    pub(crate) fn put(&mut self, buf: Vec<u8>) {
        if self.free.len() < NUM_SLOTS {
            self.free.push(buf);
        }
    }
}

/// One window entry.
#[derive(Default)]
pub(crate) struct CompSlot {
    /// The in-flight request occupying this slot, if any.
    pub active: Option<ActiveReq>,
    /// Early arrivals parked until the local side catches up.
    pub early: Vec<EarlyDesc>,
    pub pool: DescPool,
    /// Most recently completed collective on this slot, used to tell a late
    /// fragment from an early one.
    pub last_done: Option<CollId>,
}

impl CompSlot {
    /// Park a fragment that arrived ahead of the local side.
    pub fn park(&mut self, header: Header, payload: &[u8]) {
        trace!(
            "early arrival: coll {} step {} offset {} ({} bytes)",
            header.coll_id, header.step_idx, header.remote_offset, payload.len()
        );
        let data = self.pool.take(payload);
        self.early.push(EarlyDesc { header, data });
    }

    /// Drop a fragment addressed to an already-completed collective.
    pub fn drop_stale(&mut self, header: Header, len: usize) {
        warn!(
            "dropping stale fragment: coll {} step {} ({len} bytes)",
            header.coll_id, header.step_idx
        );
    }

    /// Drop every parked descriptor, returning storage to the pool. Runs on
    /// cancellation and on slot teardown.
    pub fn drain_early(&mut self) {
        for desc in self.early.drain(..) {
            self.pool.put(desc.data);
        }
    }
}
