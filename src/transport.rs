//! The capability set the engine needs from a point-to-point transport.
//!
//! This is a deliberately thin shim: short/bcopy/zcopy active-message sends,
//! endpoint establishment from an opaque address, memory-domain registration
//! for the zero-copy path, and a poll that surfaces inbound frames one at a
//! time. The engine composes a transport handle rather than aliasing its
//! types; everything behind this trait belongs to the transport.
//!
//! The in-memory loopback fabric used by the test suite lives in
//! [`crate::testing::fabric`].

use crate::error::Result;
use crate::wire::AmId;
use std::rc::Rc;

/// Cheap, copyable handle to an established endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EpHandle(pub u64);

/// Registration handle for a zero-copy send buffer.
///
/// Handles are owned by the op that registered them and must be released
/// through [`Transport::mem_release`]; the op's teardown does so on every
/// exit path, including cancellation.
#[derive(Debug, PartialEq, Eq)]
pub struct MemHandle(pub u64);

/// Size limits advertised by a transport interface.
#[derive(Debug, Clone, Copy)]
pub struct TransportCaps {
    /// Largest payload accepted by a single short send.
    pub max_short: usize,
    /// Largest payload accepted by a single bcopy send.
    pub max_bcopy: usize,
    /// Largest payload accepted by a single zcopy send.
    pub max_zcopy: usize,
    /// Memory-domain registration cap; zero when registration is unsupported.
    pub max_reg: usize,
    /// Whether zcopy sends require a registration handle.
    pub needs_memh: bool,
}

/// One inbound active message, as surfaced by [`Transport::poll`].
#[derive(Debug)]
pub struct Frame {
    pub am_id: AmId,
    /// Packed 64-bit header followed by the payload.
    pub data: Vec<u8>,
}

/// The transport contract.
///
/// All methods take `&self`: the engine is single-threaded per worker, and
/// transport implementations are expected to use interior mutability for
/// their queues, mirroring how a progress-driven communication library
/// behaves underneath a cooperative caller.
pub trait Transport {
    /// Advertised size limits.
    fn caps(&self) -> TransportCaps;

    /// Establish (or retrieve) an endpoint to the peer at `address`.
    fn connect(&self, address: &[u8]) -> Result<EpHandle>;

    /// Inline send: header plus payload, within [`TransportCaps::max_short`].
    fn am_short(&self, ep: EpHandle, id: AmId, header: u64, payload: &[u8]) -> Result<()>;

    /// Buffered-copy send: `pack` writes the full frame (header included)
    /// into a transport-owned staging buffer. Returns the packed length.
    fn am_bcopy(
        &self,
        ep: EpHandle,
        id: AmId,
        pack: &mut dyn FnMut(&mut Vec<u8>),
    ) -> Result<usize>;

    /// Zero-copy send of a registered user buffer.
    fn am_zcopy(
        &self,
        ep: EpHandle,
        id: AmId,
        header: u64,
        payload: &[u8],
        memh: &MemHandle,
    ) -> Result<()>;

    /// Register `len` bytes against the memory domain.
    fn mem_register(&self, len: usize) -> Result<MemHandle>;

    /// Release a registration handle.
    fn mem_release(&self, memh: MemHandle);

    /// Surface the next inbound frame, if any. Called in a loop from the
    /// worker's progress tick.
    fn poll(&self) -> Option<Frame>;
}

/// Shared transport handle used throughout the engine.
pub type TransportRef = Rc<dyn Transport>;

/// Peer-address resolution, the bootstrap half of the collaborator contract.
pub trait AddressResolver {
    /// Resolve a member index to a transport address.
    fn resolve(&self, member: u64) -> Result<Vec<u8>>;

    /// Release a resolved address. Addresses are plain owned buffers here, so
    /// the default is a no-op; hosts bridging to foreign allocators override.
    fn release(&self, _address: Vec<u8>) {}
}
