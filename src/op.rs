//! Operation materialization: binding a plan to one concrete invocation.
//!
//! Materialization walks the plan's phases and produces a [`Step`] per phase:
//! transport tier by message size, fragmentation parameters, per-step flags,
//! staging-buffer sizing, and zero-copy registration. The op owns every
//! buffer and registration it creates; registrations are released when the
//! op is dropped, which covers completion, error, and cancellation paths
//! alike.

use crate::builders::plummer::NodeMap;
use crate::coll::{CollType, CollectiveParams, Counts};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::group::TopoSummary;
use crate::host::{DtInfo, HostOps, MemberIndex};
use crate::plan::{Method, Phase, Plan, PlummerStage};
use crate::transport::{MemHandle, TransportCaps, TransportRef};
use crate::wire::StepIdx;
use std::rc::Rc;

/// Per-step behavior flags.
pub(crate) mod flags {
    /// Arrivals are parked until every local send of the step went out.
    pub const RECV_AFTER_SEND: u16 = 1 << 0;
    /// The whole message must be received before any forward is sent.
    pub const RECV_BEFORE_SEND1: u16 = 1 << 1;
    /// Each received fragment is forwardable on its own (pipelined waypoint).
    pub const RECV1_BEFORE_SEND: u16 = 1 << 2;
    /// First step of the op: seeds from the user's send buffer.
    pub const FIRST_STEP: u16 = 1 << 3;
    /// Last step: completion fires the finalization callback.
    pub const LAST_STEP: u16 = 1 << 4;
    /// Exactly one peer.
    pub const SINGLE_ENDPOINT: u16 = 1 << 5;
    /// Message lengths vary per peer; each fragment carries its own length.
    pub const LENGTH_PER_REQUEST: u16 = 1 << 6;
    /// The message does not fit one transport frame.
    pub const FRAGMENTED: u16 = 1 << 7;
    /// Fragments are forwarded as they arrive.
    pub const PIPELINED: u16 = 1 << 8;
}

/// Transport tier selected for a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendTier {
    Short,
    Bcopy,
    Zcopy,
}

/// Size thresholds governing tier selection, derived from the transport caps
/// (clamped by configuration) at materialization time.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Thresholds {
    pub max_short_one: usize,
    pub max_short_max: usize,
    pub max_bcopy_one: usize,
    pub max_bcopy_max: usize,
    pub max_zcopy_one: usize,
    pub max_reg: usize,
}

impl Thresholds {
    pub fn from_caps(caps: &TransportCaps, config: &Config) -> Self {
        let short = config.max_short_override.map_or(caps.max_short, |o| o.min(caps.max_short));
        let bcopy = config.max_bcopy_override.map_or(caps.max_bcopy, |o| o.min(caps.max_bcopy));
        let zcopy = config.max_zcopy_override.map_or(caps.max_zcopy, |o| o.min(caps.max_zcopy));
        Self {
            max_short_one: short,
            max_short_max: short,
            max_bcopy_one: bcopy,
            max_bcopy_max: bcopy,
            max_zcopy_one: zcopy,
            max_reg: caps.max_reg,
        }
    }

    /// Receive-side thresholds: identical to the send side except where the
    /// receiver's memory domain caps registration lower.
    pub fn recv_side(&self, caps: &TransportCaps) -> Self {
        let mut t = *self;
        t.max_reg = t.max_reg.min(caps.max_reg);
        t
    }

    /// Tier for a single frame of `len` bytes.
    pub fn tier_for(&self, len: usize) -> Result<SendTier> {
        if len <= self.max_short_one {
            Ok(SendTier::Short)
        } else if len <= self.max_bcopy_one {
            Ok(SendTier::Bcopy)
        } else if len <= self.max_zcopy_one {
            Ok(SendTier::Zcopy)
        } else {
            Err(Error::InvalidParam(format!(
                "no transport tier admits a {len}-byte frame"
            )))
        }
    }

    /// Fragment length for a `total`-byte message exceeding every
    /// single-frame tier, aligned down to a whole element. Totals small
    /// enough for the short budget fragment through the short tier.
    pub fn fragment_length(&self, total: usize, dt_len: usize) -> usize {
        let raw = if total <= self.max_short_max {
            self.max_short_one
        } else {
            self.max_bcopy_max.min(self.max_zcopy_one)
        }
        .max(1);
        if dt_len <= 1 {
            return raw;
        }
        let aligned = raw - raw % dt_len;
        if aligned == 0 { dt_len } else { aligned }
    }
}

/// A phase bound to this invocation's sizes and transport selection.
#[derive(Debug)]
pub(crate) struct Step {
    pub phase_idx: usize,
    pub step_index: StepIdx,
    pub flags: u16,
    pub tier: SendTier,
    /// Bytes sent to each primary peer; zero for receive-only and
    /// variable-length steps.
    pub send_len: usize,
    /// Bytes expected from each source; zero when unknown until runtime.
    pub recv_len: usize,
    /// Number of inbound sources.
    pub recv_sources: u32,
    pub fragment_length: usize,
    pub fragments: u32,
    /// Base byte offset the receiver places this rank's payload at.
    pub remote_base: usize,
    pub send_thresh: Thresholds,
    pub recv_thresh: Thresholds,
    /// Zero-copy registration, owned by the op.
    pub memh: Option<MemHandle>,
}

impl Step {
    pub fn has(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

/// Alltoallv two-level state, allocated with the op and filled in as the
/// gather steps complete.
pub(crate) struct PlummerState {
    pub map: NodeMap,
    /// Gathered per-ordinal send-count arrays, `local_members x N` entries.
    pub send_counts: Vec<u8>,
    /// Gathered per-ordinal recv-count arrays.
    pub recv_counts: Vec<u8>,
    /// Concatenated packed send images of this node, ordinal-major.
    pub gathered: Vec<u8>,
    /// Staged inter-node payloads, source-leader-major.
    pub inter_rx: Vec<u8>,
}

impl PlummerState {
    /// Count (in elements) rank-ordinal `o` on this node sends to / receives
    /// from global member `peer`, per the gathered tables.
    pub fn count_at(table: &[u8], n: usize, ordinal: usize, peer: usize) -> usize {
        let at = (ordinal * n + peer) * 4;
        u32::from_ne_bytes(table[at..at + 4].try_into().unwrap()) as usize
    }
}

/// A plan bound to buffers, datatypes, and transport selection.
pub(crate) struct Op {
    pub plan: Rc<Plan>,
    pub params: CollectiveParams,
    pub dt: DtInfo,
    pub steps: Vec<Step>,
    /// Working accumulator: the packed local contribution, reduced in place.
    pub acc: Vec<u8>,
    /// Per-source staging for ordered folds and block exchanges.
    pub temp: Vec<u8>,
    /// Packing scratch for block runs.
    pub scratch: Vec<u8>,
    pub plummer: Option<PlummerState>,
    /// Optimization countdown; the hook runs when it reaches zero.
    pub opt_cnt: u32,
    pub persistent: bool,
    pub commutative: bool,
    pub stable: bool,
    pub member_count: MemberIndex,
    pub transport: TransportRef,
}

impl Drop for Op {
    fn drop(&mut self) {
        // Registrations are released in reverse acquisition order.
        for step in self.steps.iter_mut().rev() {
            if let Some(memh) = step.memh.take() {
                self.transport.mem_release(memh);
            }
        }
    }
}

impl Op {
    /// Message length of the op's uniform payload (reduce-family and bcast).
    pub fn msg_len(&self) -> usize {
        self.params.send.counts.total().max(self.params.recv.counts.total()) * self.dt.len
    }

    /// Per-peer block length for alltoall.
    pub fn block_len(&self) -> usize {
        match &self.params.send.counts {
            Counts::Single(c) => c * self.dt.len,
            Counts::PerMember(_) => 0,
        }
    }
}

/// Element bounds of ring block `b` when `count` elements split across `n`
/// members: sizes differ by at most one, larger blocks first.
pub(crate) fn ring_block(count: usize, n: u64, b: u64) -> (usize, usize) {
    let n = n as usize;
    let b = b as usize;
    let q = count / n;
    let rem = count % n;
    (b * q + b.min(rem), q + usize::from(b < rem))
}

/// Datatype of a barrier-style zero-payload collective.
const DT_NONE: DtInfo = DtInfo { len: 1, contig: true };

fn resolve_dtype(params: &CollectiveParams, host: &dyn HostOps) -> Result<DtInfo> {
    if params.send.dtype == 0 && params.send.counts.total() == 0 {
        return Ok(DT_NONE);
    }
    let mut dt = host.dt_convert(params.send.dtype)?;
    if !host.dt_is_predefined(params.send.dtype) {
        // Generic external datatypes always go through the pack callbacks.
        dt.contig = false;
    }
    Ok(dt)
}

/// Bind `plan` to one invocation.
#[allow(clippy::too_many_arguments)]
pub(crate) fn materialize(
    plan: Rc<Plan>,
    params: CollectiveParams,
    member_count: MemberIndex,
    topo: &TopoSummary,
    host: &dyn HostOps,
    transport: &TransportRef,
    config: &Config,
) -> Result<Op> {
    let dt = resolve_dtype(&params, host)?;
    let commutative = params.op.is_none_or(|op| host.op_is_commute(op));
    let stable = params.is_stable();

    if (!commutative || stable)
        && plan
            .phases
            .iter()
            .any(|ph| ph.method == Method::ReduceRecursive && ph.peers.len() > 1)
    {
        return Err(Error::InvalidParam(
            "K-ary recursive exchange cannot preserve operator order; use factor 2".into(),
        ));
    }
    if !commutative && plan.phases.iter().any(|ph| ph.method.reduces()) && !plan.support_non_commutative
    {
        return Err(Error::InvalidParam(
            "selected algorithm does not support non-commutative operators".into(),
        ));
    }
    if !dt.contig && matches!(params.coll_type, CollType::Alltoall | CollType::Alltoallv) {
        return Err(Error::InvalidParam(
            "non-contiguous datatypes are not supported for alltoall variants".into(),
        ));
    }

    let caps = transport.caps();
    let send_thresh = Thresholds::from_caps(&caps, config);
    let recv_thresh = send_thresh.recv_side(&caps);

    let n = member_count;
    let len = params.send.counts.total().max(params.recv.counts.total()) * dt.len;
    let block = match &params.send.counts {
        Counts::Single(c) => c * dt.len,
        Counts::PerMember(_) => 0,
    };

    let plummer = matches!(params.coll_type, CollType::Alltoallv).then(|| {
        let map = NodeMap::new(plan.my_index, n, u64::from(topo.ppn.max(1)));
        let local = map.node_members.len();
        PlummerState {
            map,
            send_counts: vec![0u8; local * n as usize * 4],
            recv_counts: vec![0u8; local * n as usize * 4],
            gathered: Vec::new(),
            inter_rx: Vec::new(),
        }
    });

    let mut steps = Vec::with_capacity(plan.phases.len());
    let mut temp_len = 0usize;
    let mut scratch_len = 0usize;

    let last = plan.phases.len().saturating_sub(1);
    for (i, phase) in plan.phases.iter().enumerate() {
        let mut step = build_step(
            phase,
            i,
            &plummer,
            dt.len,
            len,
            block,
            plan.my_index,
            n,
            send_thresh,
            recv_thresh,
            config,
        )?;
        if i == 0 {
            step.flags |= flags::FIRST_STEP;
        }
        if i == last {
            step.flags |= flags::LAST_STEP;
        }

        // Staging demand.
        match phase.method {
            Method::ReduceTerminal | Method::ReduceWaypoint if step.recv_sources > 1 => {
                temp_len = temp_len.max(step.recv_sources as usize * len);
            }
            Method::BruckAlltoall => {
                temp_len = temp_len.max(step.recv_len);
                scratch_len = scratch_len.max(step.send_len);
            }
            _ => {}
        }

        // Zero-copy registration happens up front so repeated invocations of
        // a persistent op reuse the handle.
        if step.tier == SendTier::Zcopy && caps.needs_memh {
            step.memh = Some(transport.mem_register(step.send_len)?);
        }
        steps.push(step);
    }

    let acc_len = match params.coll_type {
        CollType::Barrier => 0,
        CollType::Alltoall => n as usize * block,
        CollType::Alltoallv => params.recv.counts.total() * dt.len,
        _ => len,
    };

    let persistent = params.is_persistent();
    Ok(Op {
        plan,
        params,
        dt,
        steps,
        acc: vec![0u8; acc_len],
        temp: vec![0u8; temp_len],
        scratch: vec![0u8; scratch_len],
        plummer,
        opt_cnt: config.opt_count,
        persistent,
        commutative,
        stable,
        member_count,
        transport: Rc::clone(transport),
    })
}

#[allow(clippy::too_many_arguments)]
fn build_step(
    phase: &Phase,
    phase_idx: usize,
    plummer: &Option<PlummerState>,
    dt_len: usize,
    len: usize,
    block: usize,
    my: MemberIndex,
    n: MemberIndex,
    send_thresh: Thresholds,
    recv_thresh: Thresholds,
    config: &Config,
) -> Result<Step> {
    let peer_cnt = phase.peers.len() as u32;
    let mut f = 0u16;
    let (send_len, recv_len, recv_sources, remote_base) = match phase.method {
        Method::SendTerminal => (len, 0, 0, phase.remote_slot as usize * len),
        Method::RecvTerminal => (0, len, 1, 0),
        Method::ReduceTerminal => (0, len, peer_cnt, 0),
        Method::ReduceRecursive => {
            f |= flags::RECV_AFTER_SEND;
            (len, len, peer_cnt, 0)
        }
        Method::ReduceScatterRing | Method::AllgatherRing => {
            let rs = phase.method == Method::ReduceScatterRing;
            let (tx_block, rx_block) = ring_step_blocks(rs, u64::from(phase.step_index), my, n);
            let count = len / dt_len.max(1);
            let (tx_off, tx_elems) = ring_block(count, n, tx_block);
            let (_, rx_elems) = ring_block(count, n, rx_block);
            (tx_elems * dt_len, rx_elems * dt_len, 1, tx_off * dt_len)
        }
        Method::ReduceWaypoint => {
            f |= flags::RECV_BEFORE_SEND1;
            (len, len, peer_cnt, phase.remote_slot as usize * len)
        }
        Method::ScatterWaypoint => {
            f |= flags::RECV_BEFORE_SEND1;
            (len, len, 1, 0)
        }
        Method::BruckAlltoall => {
            f |= flags::RECV_AFTER_SEND;
            let k = phase.step_index as u32;
            let cnt = crate::builders::bruck::round_blocks(n, k).count();
            (cnt * block, cnt * block, 1, 0)
        }
        Method::PlummerIntra(stage) => {
            let ps = plummer
                .as_ref()
                .ok_or_else(|| Error::InvalidParam("two-level phase outside alltoallv".into()))?;
            let counts_len = n as usize * 4;
            let local = ps.map.node_members.len() as u32;
            let leader = ps.map.is_leader();
            match stage {
                PlummerStage::GatherSendCounts | PlummerStage::GatherRecvCounts => {
                    if leader {
                        (0, counts_len, local - 1, 0)
                    } else {
                        (counts_len, 0, 0, phase.remote_slot as usize * counts_len)
                    }
                }
                PlummerStage::GatherSendBuffers => {
                    f |= flags::LENGTH_PER_REQUEST;
                    if leader { (0, 0, local - 1, 0) } else { (0, 0, 0, 0) }
                }
                PlummerStage::ScatterRecvBuffers => {
                    f |= flags::LENGTH_PER_REQUEST;
                    if leader { (0, 0, 0, 0) } else { (0, 0, 1, 0) }
                }
            }
        }
        Method::PlummerInter => {
            f |= flags::LENGTH_PER_REQUEST;
            (0, 0, peer_cnt, 0)
        }
    };

    if peer_cnt <= 1 {
        f |= flags::SINGLE_ENDPOINT;
    }

    let (tier, fragment_length, fragments) = if send_len == 0 {
        (SendTier::Bcopy, send_thresh.fragment_length(0, dt_len), 1)
    } else {
        // A zcopy frame must also fit the memory domain's registration cap.
        let whole = send_thresh.tier_for(send_len).ok().filter(|t| {
            *t != SendTier::Zcopy || send_thresh.max_reg == 0 || send_len <= send_thresh.max_reg
        });
        match whole {
            Some(tier) => (tier, send_len, 1),
            None => {
                f |= flags::FRAGMENTED;
                let fl = send_thresh.fragment_length(send_len, dt_len);
                (send_thresh.tier_for(fl)?, fl, send_len.div_ceil(fl) as u32)
            }
        }
    };
    if phase.method == Method::ScatterWaypoint && fragments > 1 && config.pipelining {
        f |= flags::PIPELINED | flags::RECV1_BEFORE_SEND;
    }

    Ok(Step {
        phase_idx,
        step_index: phase.step_index,
        flags: f,
        tier,
        send_len,
        recv_len,
        recv_sources,
        fragment_length,
        fragments: fragments.max(1),
        remote_base,
        send_thresh,
        recv_thresh,
        memh: None,
    })
}

/// Ring send/recv block indices for member `my` of an `n`-ring at plan step
/// `s`. Reduce-scatter steps walk the ring backwards from the member's own
/// block; allgather steps then circulate each member's completed block.
pub(crate) fn ring_step_blocks(reduce_scatter: bool, s: u64, my: u64, n: u64) -> (u64, u64) {
    if reduce_scatter {
        let tx = (my + n - s % n) % n;
        let rx = (my + 2 * n - s % n - 1) % n;
        (tx, rx)
    } else {
        let sa = (s - (n - 1)) % n;
        let tx = (my + 1 + n - sa) % n;
        let rx = (my + n - sa) % n;
        (tx, rx)
    }
}
