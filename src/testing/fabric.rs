//! In-memory loopback fabric.
//!
//! Implements the transport contract over per-rank frame queues so a whole
//! group of workers can run inside one test process: a send pushes the
//! framed bytes straight into the destination's inbox, and each worker's
//! progress tick drains its own inbox. The fabric also counts outstanding
//! memory registrations (for leak assertions) and can inject send failures
//! to exercise the resend path.

use crate::error::{Error, Result};
use crate::host::MemberIndex;
use crate::transport::{AddressResolver, EpHandle, Frame, MemHandle, Transport, TransportCaps};
use crate::wire::AmId;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

/// Default caps: roomy enough for most tests, small enough that fragmented
/// and tiered paths are easy to force with payload sizing.
pub fn default_caps() -> TransportCaps {
    TransportCaps {
        max_short: 64,
        max_bcopy: 8192,
        max_zcopy: 1 << 20,
        max_reg: 1 << 20,
        needs_memh: true,
    }
}

/// Shared state of one test interconnect.
pub struct LoopbackFabric {
    caps: TransportCaps,
    inboxes: Vec<RefCell<VecDeque<Frame>>>,
    next_memh: Cell<u64>,
    active_regs: Cell<usize>,
    frames: Cell<usize>,
    /// Pending injected failures per rank: (remaining, retryable).
    faults: RefCell<HashMap<usize, (u32, bool)>>,
}

impl LoopbackFabric {
    #[must_use]
    pub fn new(ranks: usize, caps: TransportCaps) -> Rc<Self> {
        Rc::new(Self {
            caps,
            inboxes: (0..ranks).map(|_| RefCell::new(VecDeque::new())).collect(),
            next_memh: Cell::new(1),
            active_regs: Cell::new(0),
            frames: Cell::new(0),
            faults: RefCell::new(HashMap::new()),
        })
    }

    /// The per-rank transport endpoint of this fabric.
    #[must_use]
    pub fn transport(self: &Rc<Self>, rank: usize) -> Rc<dyn Transport> {
        Rc::new(LoopbackTransport { fabric: Rc::clone(self), rank })
    }

    /// Outstanding memory registrations across every rank.
    #[must_use]
    pub fn active_registrations(&self) -> usize {
        self.active_regs.get()
    }

    /// Total frames delivered so far.
    #[must_use]
    pub fn frames_sent(&self) -> usize {
        self.frames.get()
    }

    /// Make the next `count` sends from `rank` fail.
    pub fn inject_send_failures(&self, rank: usize, count: u32, retryable: bool) {
        self.faults.borrow_mut().insert(rank, (count, retryable));
    }

    fn check_fault(&self, rank: usize) -> Result<()> {
        let mut faults = self.faults.borrow_mut();
        if let Some((remaining, retryable)) = faults.get_mut(&rank) {
            if *remaining > 0 {
                *remaining -= 1;
                let retryable = *retryable;
                return Err(Error::Transport {
                    reason: "injected send failure".into(),
                    retryable,
                });
            }
        }
        Ok(())
    }

    fn deliver(&self, to: usize, frame: Frame) -> Result<()> {
        let inbox = self
            .inboxes
            .get(to)
            .ok_or_else(|| Error::Unreachable(to as MemberIndex))?;
        inbox.borrow_mut().push_back(frame);
        self.frames.set(self.frames.get() + 1);
        Ok(())
    }
}

/// One rank's view of the fabric.
pub struct LoopbackTransport {
    fabric: Rc<LoopbackFabric>,
    rank: usize,
}

impl Transport for LoopbackTransport {
    fn caps(&self) -> TransportCaps {
        self.fabric.caps
    }

    fn connect(&self, address: &[u8]) -> Result<EpHandle> {
        let bytes: [u8; 8] = address
            .try_into()
            .map_err(|_| Error::InvalidParam("malformed loopback address".into()))?;
        Ok(EpHandle(u64::from_ne_bytes(bytes)))
    }

    fn am_short(&self, ep: EpHandle, id: AmId, header: u64, payload: &[u8]) -> Result<()> {
        if payload.len() > self.fabric.caps.max_short {
            return Err(Error::InvalidParam(format!(
                "short frame of {} bytes exceeds the cap",
                payload.len()
            )));
        }
        self.fabric.check_fault(self.rank)?;
        let mut data = Vec::with_capacity(8 + payload.len());
        data.extend_from_slice(&header.to_ne_bytes());
        data.extend_from_slice(payload);
        self.fabric.deliver(ep.0 as usize, Frame { am_id: id, data })
    }

    fn am_bcopy(
        &self,
        ep: EpHandle,
        id: AmId,
        pack: &mut dyn FnMut(&mut Vec<u8>),
    ) -> Result<usize> {
        self.fabric.check_fault(self.rank)?;
        let mut data = Vec::new();
        pack(&mut data);
        let len = data.len();
        self.fabric.deliver(ep.0 as usize, Frame { am_id: id, data })?;
        Ok(len)
    }

    fn am_zcopy(
        &self,
        ep: EpHandle,
        id: AmId,
        header: u64,
        payload: &[u8],
        _memh: &MemHandle,
    ) -> Result<()> {
        if payload.len() > self.fabric.caps.max_zcopy {
            return Err(Error::InvalidParam(format!(
                "zcopy frame of {} bytes exceeds the cap",
                payload.len()
            )));
        }
        self.fabric.check_fault(self.rank)?;
        let mut data = Vec::with_capacity(8 + payload.len());
        data.extend_from_slice(&header.to_ne_bytes());
        data.extend_from_slice(payload);
        self.fabric.deliver(ep.0 as usize, Frame { am_id: id, data })
    }

    fn mem_register(&self, _len: usize) -> Result<MemHandle> {
        let id = self.fabric.next_memh.get();
        self.fabric.next_memh.set(id + 1);
        self.fabric.active_regs.set(self.fabric.active_regs.get() + 1);
        Ok(MemHandle(id))
    }

    fn mem_release(&self, _memh: MemHandle) {
        self.fabric
            .active_regs
            .set(self.fabric.active_regs.get().saturating_sub(1));
    }

    fn poll(&self) -> Option<Frame> {
        self.fabric.inboxes[self.rank].borrow_mut().pop_front()
    }
}

/// Address resolution over the loopback fabric: a member's address is its
/// rank, eight bytes of it.
pub struct RankResolver;

impl AddressResolver for RankResolver {
    fn resolve(&self, member: u64) -> Result<Vec<u8>> {
        Ok(member.to_ne_bytes().to_vec())
    }
}
