//! Collective invocation parameters.
//!
//! A [`CollectiveParams`] describes one concrete collective call: the type
//! and its modifiers, the root (where one applies), send/receive buffer
//! specs, and the reduction operator. Buffers are shared handles
//! ([`SharedBuf`]) because completion is asynchronous: the caller keeps its
//! handle, the op keeps a clone, and the engine writes results through it
//! when the last step fires.

use crate::host::{DtToken, HostOps, MemberIndex, OpToken};
use std::cell::RefCell;
use std::rc::Rc;

/// Byte buffer shared between the caller and in-flight operations.
pub type SharedBuf = Rc<RefCell<Vec<u8>>>;

/// Wrap a byte vector for use in a collective invocation.
#[must_use]
pub fn shared_buf(bytes: Vec<u8>) -> SharedBuf {
    Rc::new(RefCell::new(bytes))
}

/// The collective operations the engine plans and executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollType {
    Barrier,
    Bcast,
    Reduce,
    Allreduce,
    Alltoall,
    Alltoallv,
}

/// Modifier bits describing the requested operation, mirrored into the plan
/// cache signature.
pub mod modifier {
    /// Data originates at a single root.
    pub const SINGLE_SOURCE: u16 = 1 << 0;
    /// Results land at a single root.
    pub const SINGLE_DESTINATION: u16 = 1 << 1;
    /// Arrivals are combined with a reduction operator.
    pub const AGGREGATE: u16 = 1 << 2;
    /// Results are distributed to every member.
    pub const BROADCAST: u16 = 1 << 3;
    /// Per-member counts vary (alltoallv).
    pub const VARIABLE_LENGTH: u16 = 1 << 4;
    /// Force the swap discipline regardless of operator commutativity, for
    /// bit-reproducible reductions.
    pub const AGGREGATE_STABLE: u16 = 1 << 7;
    /// The op is reused across invocations; keep it (and its registrations)
    /// alive after completion.
    pub const PERSISTENT: u16 = 1 << 11;
    /// Pure synchronization.
    pub const BARRIER: u16 = 1 << 12;
}

/// Element counts of one direction of a collective.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Counts {
    /// The same count everywhere (per peer, for alltoall).
    Single(usize),
    /// One count per member (alltoallv).
    PerMember(Vec<u32>),
}

impl Counts {
    /// Total element count across members.
    #[must_use]
    pub fn total(&self) -> usize {
        match self {
            Counts::Single(n) => *n,
            Counts::PerMember(v) => v.iter().map(|c| *c as usize).sum(),
        }
    }

    /// Count for one member; `Single` is uniform.
    #[must_use]
    pub fn for_member(&self, member: MemberIndex) -> usize {
        match self {
            Counts::Single(n) => *n,
            Counts::PerMember(v) => v.get(member as usize).copied().unwrap_or(0) as usize,
        }
    }
}

/// One direction (send or receive) of a collective invocation.
#[derive(Debug, Clone)]
pub struct BufferSpec {
    pub buf: SharedBuf,
    pub counts: Counts,
    /// Element displacements per member (alltoallv).
    pub displs: Option<Vec<u32>>,
    pub dtype: DtToken,
}

impl BufferSpec {
    /// Contiguous spec with a single count.
    #[must_use]
    pub fn contig(buf: SharedBuf, count: usize, dtype: DtToken) -> Self {
        Self { buf, counts: Counts::Single(count), displs: None, dtype }
    }

    /// Variable-length spec with per-member counts and displacements.
    #[must_use]
    pub fn variable(buf: SharedBuf, counts: Vec<u32>, displs: Vec<u32>, dtype: DtToken) -> Self {
        Self { buf, counts: Counts::PerMember(counts), displs: Some(displs), dtype }
    }
}

/// A concrete collective invocation.
#[derive(Debug, Clone)]
pub struct CollectiveParams {
    pub coll_type: CollType,
    pub modifiers: u16,
    pub root: MemberIndex,
    pub send: BufferSpec,
    pub recv: BufferSpec,
    pub op: Option<OpToken>,
}

impl CollectiveParams {
    /// Pure synchronization across the group.
    #[must_use]
    pub fn barrier() -> Self {
        let empty = || BufferSpec::contig(shared_buf(Vec::new()), 0, 0);
        Self {
            coll_type: CollType::Barrier,
            modifiers: modifier::AGGREGATE | modifier::BROADCAST | modifier::BARRIER,
            root: 0,
            send: empty(),
            recv: empty(),
            op: None,
        }
    }

    /// Reduce `count` elements across the group, leaving the result on every
    /// member.
    #[must_use]
    pub fn allreduce(
        send: SharedBuf,
        recv: SharedBuf,
        count: usize,
        dtype: DtToken,
        op: OpToken,
    ) -> Self {
        Self {
            coll_type: CollType::Allreduce,
            modifiers: modifier::AGGREGATE | modifier::BROADCAST,
            root: 0,
            send: BufferSpec::contig(send, count, dtype),
            recv: BufferSpec::contig(recv, count, dtype),
            op: Some(op),
        }
    }

    /// Reduce toward a single root.
    #[must_use]
    pub fn reduce(
        send: SharedBuf,
        recv: SharedBuf,
        count: usize,
        dtype: DtToken,
        op: OpToken,
        root: MemberIndex,
    ) -> Self {
        Self {
            coll_type: CollType::Reduce,
            modifiers: modifier::AGGREGATE | modifier::SINGLE_DESTINATION,
            root,
            send: BufferSpec::contig(send, count, dtype),
            recv: BufferSpec::contig(recv, count, dtype),
            op: Some(op),
        }
    }

    /// Broadcast `count` elements from `root`; `buf` is both the source (on
    /// the root) and the destination (everywhere).
    #[must_use]
    pub fn bcast(buf: SharedBuf, count: usize, dtype: DtToken, root: MemberIndex) -> Self {
        Self {
            coll_type: CollType::Bcast,
            modifiers: modifier::BROADCAST | modifier::SINGLE_SOURCE,
            root,
            send: BufferSpec::contig(Rc::clone(&buf), count, dtype),
            recv: BufferSpec::contig(buf, count, dtype),
            op: None,
        }
    }

    /// Exchange `count_per_peer` elements with every member.
    #[must_use]
    pub fn alltoall(
        send: SharedBuf,
        recv: SharedBuf,
        count_per_peer: usize,
        dtype: DtToken,
    ) -> Self {
        Self {
            coll_type: CollType::Alltoall,
            modifiers: 0,
            root: 0,
            send: BufferSpec::contig(send, count_per_peer, dtype),
            recv: BufferSpec::contig(recv, count_per_peer, dtype),
            op: None,
        }
    }

    /// Variable-count exchange with every member.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn alltoallv(
        send: SharedBuf,
        send_counts: Vec<u32>,
        send_displs: Vec<u32>,
        recv: SharedBuf,
        recv_counts: Vec<u32>,
        recv_displs: Vec<u32>,
        dtype: DtToken,
    ) -> Self {
        Self {
            coll_type: CollType::Alltoallv,
            modifiers: modifier::VARIABLE_LENGTH,
            root: 0,
            send: BufferSpec::variable(send, send_counts, send_displs, dtype),
            recv: BufferSpec::variable(recv, recv_counts, recv_displs, dtype),
            op: None,
        }
    }

    /// Mark the operation persistent: the materialized op (and its zcopy
    /// registrations) outlives individual invocations.
    #[must_use]
    pub fn persistent(mut self) -> Self {
        self.modifiers |= modifier::PERSISTENT;
        self
    }

    /// Request the stable-reduction swap discipline.
    #[must_use]
    pub fn stable(mut self) -> Self {
        self.modifiers |= modifier::AGGREGATE_STABLE;
        self
    }

    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.modifiers & modifier::PERSISTENT != 0
    }

    #[must_use]
    pub fn is_stable(&self) -> bool {
        self.modifiers & modifier::AGGREGATE_STABLE != 0
    }

    /// Total send payload in bytes, used for algorithm selection and tier
    /// thresholds.
    #[must_use]
    pub fn send_bytes(&self, host: &dyn HostOps) -> usize {
        let len = host.dt_convert(self.send.dtype).map_or(0, |i| i.len);
        self.send.counts.total() * len
    }

    /// The cache signature of this invocation.
    #[must_use]
    pub fn signature(&self) -> CollSignature {
        CollSignature {
            modifiers: self.modifiers,
            root: self.root,
            send_shape: self.send.counts.clone(),
            recv_shape: self.recv.counts.clone(),
            dtype: self.send.dtype,
            op: self.op,
        }
    }
}

/// Cache key fragment capturing everything that distinguishes one collective
/// invocation's plan from another's.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollSignature {
    pub modifiers: u16,
    pub root: MemberIndex,
    pub send_shape: Counts,
    pub recv_shape: Counts,
    pub dtype: DtToken,
    pub op: Option<OpToken>,
}
