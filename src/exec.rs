//! Step execution.
//!
//! Each materialized step runs a small state machine: build the outgoing
//! send queue, drain it through the transport, account inbound payloads
//! against the step's expectation, run the method's completion action, and
//! advance. Dispatch across methods is a single match over the phase's
//! method tag -- per-method behavior lives in the match arms rather than in
//! indirect callbacks.
//!
//! Ordering rules honored here:
//! - `RECV_AFTER_SEND` -- arrivals are parked (by the demux) until every
//!   local send of the step went out; recursive exchange would otherwise
//!   fold a peer's contribution into the buffer it is about to send.
//! - `RECV_BEFORE_SEND1` -- fan-in waypoints fold after the whole message
//!   set arrived, then forward.
//! - `RECV1_BEFORE_SEND` -- pipelined fan-out waypoints forward each
//!   fragment the moment it lands.
//! - A retryable transport failure leaves the queue intact and replays from
//!   the current item on the next progress tick; non-retryable failures
//!   terminate the request.

use crate::coll::CollType;
use crate::error::{Error, Result};
use crate::group::{ExecCtx, RequestState};
use crate::host::MemberIndex;
use crate::op::{flags, ring_block, ring_step_blocks, Op, SendTier, Step};
use crate::plan::{Method, PlummerStage};
use crate::transport::EpHandle;
use crate::wire::{
    read_ext_header, write_ext_header, CollId, Header, EXT_HEADER_LEN,
};
use log::{debug, trace};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Where a send item's bytes live.
#[derive(Debug, Clone)]
pub(crate) enum Src {
    Acc,
    Scratch,
    Owned(Rc<Vec<u8>>),
}

/// One outgoing frame, fully resolved except for the actual transport call.
#[derive(Debug)]
pub(crate) struct SendItem {
    pub ep: EpHandle,
    pub peer: MemberIndex,
    pub src: Src,
    pub off: usize,
    pub len: usize,
    pub remote_offset: u32,
    pub ext_src: Option<u64>,
    pub tier: SendTier,
}

/// Per-invocation execution state; occupies a completion slot while active.
pub(crate) struct ActiveReq {
    pub coll_id: CollId,
    pub op: Op,
    /// Index of the op's home in the group's handle store.
    pub store_idx: usize,
    /// Current step within the op.
    pub cur: usize,
    /// Outstanding receive expectation: bytes, or messages when the step's
    /// payloads are empty.
    pub pending: u64,
    pub byte_counted: bool,
    pub sendq: VecDeque<SendItem>,
    pub tx_built: bool,
    pub recv_finalized: bool,
    /// Bytes already forwarded by a pipelined waypoint.
    pub forwarded: usize,
    /// Set when a retryable failure parked the send queue.
    pub resend: bool,
    pub resend_count: u32,
    pub user: Rc<RefCell<RequestState>>,
    /// Terminal execution status, held until FIFO order lets it fire.
    pub done: Option<Result<()>>,
}

impl ActiveReq {
    pub fn new(coll_id: CollId, op: Op, store_idx: usize, user: Rc<RefCell<RequestState>>) -> Self {
        Self {
            coll_id,
            op,
            store_idx,
            cur: 0,
            pending: 0,
            byte_counted: false,
            sendq: VecDeque::new(),
            tx_built: false,
            recv_finalized: false,
            forwarded: 0,
            resend: false,
            resend_count: 0,
            user,
            done: None,
        }
    }

    fn step(&self) -> &Step {
        &self.op.steps[self.cur]
    }

    /// The `(coll_id, step_idx)` pair the demux matches against.
    pub fn local_id(&self) -> Option<u16> {
        if self.done.is_some() || self.op.steps.is_empty() {
            return None;
        }
        Some(Header::make_local_id(self.coll_id, self.step().step_index))
    }
}

/// Demux classification of an inbound fragment against an active request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Accept {
    Match,
    Early,
    Stale,
}

pub(crate) fn classify(req: &ActiveReq, header: &Header) -> Accept {
    if req.done.is_some() || req.op.steps.is_empty() {
        return Accept::Stale;
    }
    let step = req.step();
    if header.step_idx == step.step_index {
        if step.has(flags::RECV_AFTER_SEND) && !(req.tx_built && req.sendq.is_empty()) {
            Accept::Early
        } else {
            Accept::Match
        }
    } else if header.step_idx > step.step_index {
        Accept::Early
    } else {
        Accept::Stale
    }
}

/* ---------- Trigger ---------- */

/// Start (or restart, for persistent ops) the request's op.
pub(crate) fn start(req: &mut ActiveReq, ctx: &ExecCtx) -> Result<()> {
    if req.op.opt_cnt > 0 {
        req.op.opt_cnt -= 1;
        if req.op.opt_cnt == 0 {
            optimize(&mut req.op, ctx);
        }
    }
    op_init(&mut req.op, ctx)?;
    if req.op.steps.is_empty() {
        return finish(req, ctx);
    }
    enter_step(req, ctx)?;
    advance(req, ctx)
}

/// The optimization hook: once a persistent op has proven hot, trade the
/// per-send copy of bcopy for a one-time registration and zcopy sends.
fn optimize(op: &mut Op, ctx: &ExecCtx) {
    let caps = ctx.transport.caps();
    if !caps.needs_memh {
        return;
    }
    for step in &mut op.steps {
        if step.tier == SendTier::Bcopy
            && step.send_len > 0
            && step.send_len <= step.send_thresh.max_zcopy_one
            && step.send_len <= caps.max_reg
            && step.memh.is_none()
        {
            if let Ok(memh) = ctx.transport.mem_register(step.send_len) {
                debug!(
                    "step {} rewritten bcopy -> zcopy ({} bytes)",
                    step.step_index, step.send_len
                );
                step.memh = Some(memh);
                step.tier = SendTier::Zcopy;
            }
        }
    }
}

/* ---------- Initialization and finalization ---------- */

fn pack_user(op: &Op, ctx: &ExecCtx, buf: &[u8], count: usize, out: &mut [u8]) {
    if op.dt.contig {
        out[..count * op.dt.len].copy_from_slice(&buf[..count * op.dt.len]);
    } else {
        ctx.host.dt_pack(op.params.send.dtype, buf, count, out);
    }
}

fn unpack_user(op: &Op, ctx: &ExecCtx, data: &[u8], count: usize, out: &mut [u8]) {
    if op.dt.contig {
        out[..count * op.dt.len].copy_from_slice(&data[..count * op.dt.len]);
    } else {
        ctx.host.dt_unpack(op.params.recv.dtype, data, count, out);
    }
}

/// Seed the op's working buffers from the user's invocation.
fn op_init(op: &mut Op, ctx: &ExecCtx) -> Result<()> {
    op.temp.fill(0);
    match op.params.coll_type {
        CollType::Barrier => {}
        CollType::Allreduce | CollType::Reduce => {
            let count = op.params.send.counts.total();
            let buf = op.params.send.buf.clone();
            let src = buf.borrow();
            let mut acc = std::mem::take(&mut op.acc);
            pack_user(op, ctx, &src, count, &mut acc);
            op.acc = acc;
        }
        CollType::Bcast => {
            if op.plan.my_index == op.params.root {
                let count = op.params.send.counts.total();
                let buf = op.params.send.buf.clone();
                let src = buf.borrow();
                let mut acc = std::mem::take(&mut op.acc);
                pack_user(op, ctx, &src, count, &mut acc);
                op.acc = acc;
            } else {
                op.acc.fill(0);
            }
        }
        CollType::Alltoall => {
            // Local rotation: position i holds the block destined to
            // (my + i) mod n.
            let n = op.member_count;
            let b = op.block_len();
            let my = op.plan.my_index;
            let src = op.params.send.buf.borrow();
            for i in 0..n {
                let from = ((my + i) % n) as usize * b;
                let at = i as usize * b;
                op.acc[at..at + b].copy_from_slice(&src[from..from + b]);
            }
        }
        CollType::Alltoallv => {
            let n = op.member_count as usize;
            let send_counts: Vec<u32> = (0..n)
                .map(|d| op.params.send.counts.for_member(d as u64) as u32)
                .collect();
            let recv_counts: Vec<u32> = (0..n)
                .map(|d| op.params.recv.counts.for_member(d as u64) as u32)
                .collect();
            let dt = op.dt.len;
            let ps = op
                .plummer
                .as_mut()
                .ok_or_else(|| Error::InvalidParam("alltoallv without two-level state".into()))?;
            if ps.map.is_leader() {
                // Own tables land at ordinal 0; peers' rows arrive later.
                ps.send_counts.fill(0);
                ps.recv_counts.fill(0);
                for d in 0..n {
                    ps.send_counts[d * 4..d * 4 + 4]
                        .copy_from_slice(&send_counts[d].to_ne_bytes());
                    ps.recv_counts[d * 4..d * 4 + 4]
                        .copy_from_slice(&recv_counts[d].to_ne_bytes());
                }
                ps.gathered = pack_variable(
                    &op.params.send.buf.borrow(),
                    &send_counts,
                    op.params.send.displs.as_deref(),
                    dt,
                );
                ps.inter_rx.clear();
            }
            op.acc.fill(0);
        }
    }
    Ok(())
}

/// Pack a variable-count user buffer into a destination-ordered image.
fn pack_variable(buf: &[u8], counts: &[u32], displs: Option<&[u32]>, dt: usize) -> Vec<u8> {
    let total: usize = counts.iter().map(|c| *c as usize).sum();
    let mut out = Vec::with_capacity(total * dt);
    let mut flat = 0usize;
    for (d, c) in counts.iter().enumerate() {
        let c = *c as usize;
        let at = displs.map_or(flat, |dv| dv[d] as usize) * dt;
        out.extend_from_slice(&buf[at..at + c * dt]);
        flat += c;
    }
    out
}

/// The finalization callback: copy the aggregate out to the user and mark
/// the request's execution terminal.
fn finish(req: &mut ActiveReq, ctx: &ExecCtx) -> Result<()> {
    let op = &mut req.op;
    match op.params.coll_type {
        CollType::Barrier => {}
        CollType::Allreduce => {
            let count = op.params.recv.counts.total();
            let buf = op.params.recv.buf.clone();
            let mut dst = buf.borrow_mut();
            let acc = std::mem::take(&mut op.acc);
            unpack_user(op, ctx, &acc, count, &mut dst);
            op.acc = acc;
        }
        CollType::Reduce => {
            if op.plan.my_index == op.params.root {
                let count = op.params.recv.counts.total();
                let buf = op.params.recv.buf.clone();
                let mut dst = buf.borrow_mut();
                let acc = std::mem::take(&mut op.acc);
                unpack_user(op, ctx, &acc, count, &mut dst);
                op.acc = acc;
            }
        }
        CollType::Bcast => {
            if op.plan.my_index != op.params.root {
                let count = op.params.recv.counts.total();
                let buf = op.params.recv.buf.clone();
                let mut dst = buf.borrow_mut();
                let acc = std::mem::take(&mut op.acc);
                unpack_user(op, ctx, &acc, count, &mut dst);
                op.acc = acc;
            }
        }
        CollType::Alltoall => {
            // Inverse rotation with reversal: position i holds the block
            // from (my - i) mod n.
            let n = op.member_count;
            let b = op.block_len();
            let my = op.plan.my_index;
            let mut dst = op.params.recv.buf.borrow_mut();
            for s in 0..n {
                let i = ((my + n - s) % n) as usize * b;
                let at = s as usize * b;
                dst[at..at + b].copy_from_slice(&op.acc[i..i + b]);
            }
        }
        CollType::Alltoallv => {
            let n = op.member_count as usize;
            let dt = op.dt.len;
            if let Some(ps) = &op.plummer {
                if ps.map.is_leader() {
                    let img = assemble_image(op, op.plan.my_index);
                    op.acc.copy_from_slice(&img);
                }
            }
            // Scatter the source-ordered image into the user layout.
            let mut dst = op.params.recv.buf.borrow_mut();
            let mut run = 0usize;
            for s in 0..n {
                let c = op.params.recv.counts.for_member(s as u64) * dt;
                let at = op
                    .params
                    .recv
                    .displs
                    .as_ref()
                    .map_or(run, |dv| dv[s] as usize * dt);
                dst[at..at + c].copy_from_slice(&op.acc[run..run + c]);
                run += c;
            }
        }
    }
    trace!("coll {} execution complete", req.coll_id);
    req.done = Some(Ok(()));
    Ok(())
}

/* ---------- Step lifecycle ---------- */

/// Reset per-step state and compute the step's receive expectation.
fn enter_step(req: &mut ActiveReq, ctx: &ExecCtx) -> Result<()> {
    req.tx_built = false;
    req.recv_finalized = false;
    req.forwarded = 0;
    req.resend_count = 0;
    prepare_step(req, ctx)?;
    compute_expectations(req)?;
    let step = req.step();
    trace!(
        "step {} activated: pending {} ({}), {} tx fragments",
        step.step_index,
        req.pending,
        if req.byte_counted { "bytes" } else { "messages" },
        step.fragments
    );
    Ok(())
}

/// Step-entry buffer work that must precede any arrival.
fn prepare_step(req: &mut ActiveReq, _ctx: &ExecCtx) -> Result<()> {
    let dt = req.op.dt.len;
    let n = req.op.member_count as usize;
    let method = req.op.plan.phases[req.step().phase_idx].method;
    match method {
        Method::PlummerIntra(PlummerStage::GatherSendBuffers) => {
            let ps = req.op.plummer.as_mut().unwrap();
            if ps.map.is_leader() {
                // Counts are complete now; size the node image and keep the
                // leader's own image at ordinal 0.
                let local = ps.map.node_members.len();
                let total: usize = (0..local)
                    .map(|o| total_send_bytes(&ps.send_counts, n, o, dt))
                    .sum();
                ps.gathered.resize(total, 0);
            }
        }
        Method::PlummerInter => {
            let me = req.op.plan.my_index;
            let leaders = req.op.plummer.as_ref().unwrap().map.leaders.clone();
            let total: usize = leaders
                .iter()
                .filter(|l| **l != me)
                .map(|l| node_to_node_bytes(&req.op, *l))
                .sum();
            req.op.plummer.as_mut().unwrap().inter_rx.resize(total, 0);
        }
        _ => {}
    }
    Ok(())
}

fn compute_expectations(req: &mut ActiveReq) -> Result<()> {
    let op = &req.op;
    let step = &op.steps[req.cur];
    let method = op.plan.phases[step.phase_idx].method;
    let (pending, bytes) = if step.has(flags::LENGTH_PER_REQUEST) {
        let dt = op.dt.len;
        let n = op.member_count as usize;
        let ps = op
            .plummer
            .as_ref()
            .ok_or_else(|| Error::InvalidParam("variable-length step without state".into()))?;
        match method {
            Method::PlummerIntra(PlummerStage::GatherSendBuffers) => {
                let local = ps.map.node_members.len();
                let total = if ps.map.is_leader() {
                    (1..local)
                        .map(|o| total_send_bytes(&ps.send_counts, n, o, dt))
                        .sum()
                } else {
                    0
                };
                (total as u64, true)
            }
            Method::PlummerInter => {
                let me = op.plan.my_index;
                let total: usize = ps
                    .map
                    .leaders
                    .iter()
                    .filter(|l| **l != me)
                    .map(|l| node_to_node_bytes(op, *l))
                    .sum();
                (total as u64, true)
            }
            Method::PlummerIntra(PlummerStage::ScatterRecvBuffers) => {
                if ps.map.is_leader() {
                    (0, true)
                } else {
                    ((op.params.recv.counts.total() * dt) as u64, true)
                }
            }
            _ => (0, true),
        }
    } else if step.recv_len > 0 {
        (
            step.recv_len as u64 * u64::from(step.recv_sources),
            true,
        )
    } else {
        (u64::from(step.recv_sources), false)
    };
    req.pending = pending;
    req.byte_counted = bytes;
    Ok(())
}

fn tx_ready(req: &ActiveReq) -> bool {
    let step = req.step();
    if step.has(flags::RECV_BEFORE_SEND1) || step.has(flags::PIPELINED) {
        req.pending == 0 && req.recv_finalized
    } else {
        true
    }
}

/// Drive the current step as far as it will go without new arrivals, then
/// advance through completed steps until the op finishes or stalls.
pub(crate) fn advance(req: &mut ActiveReq, ctx: &ExecCtx) -> Result<()> {
    loop {
        if req.done.is_some() {
            return Ok(());
        }
        if req.pending == 0 && !req.recv_finalized {
            recv_complete(req, ctx)?;
            req.recv_finalized = true;
        }
        if !req.tx_built && tx_ready(req) {
            build_tx(req, ctx)?;
            req.tx_built = true;
        }
        push_sends(req, ctx)?;
        if req.resend {
            return Ok(());
        }
        let step_done =
            req.tx_built && req.sendq.is_empty() && req.pending == 0 && req.recv_finalized;
        if !step_done {
            return Ok(());
        }
        if req.step().has(flags::LAST_STEP) || req.cur + 1 >= req.op.steps.len() {
            return finish(req, ctx);
        }
        req.cur += 1;
        enter_step(req, ctx)?;
    }
}

/* ---------- Send side ---------- */

/// Queue the step's outgoing frames.
fn build_tx(req: &mut ActiveReq, ctx: &ExecCtx) -> Result<()> {
    let method = req.op.plan.phases[req.step().phase_idx].method;
    match method {
        Method::SendTerminal | Method::ReduceRecursive => {
            let (len, base) = (req.step().send_len, req.step().remote_base);
            let peers: Vec<_> = peer_list(req);
            for (ep, member) in peers {
                emit(req, ep, member, Src::Acc, 0, len, base, None)?;
            }
        }
        Method::RecvTerminal | Method::ReduceTerminal => {}
        Method::ReduceScatterRing | Method::AllgatherRing => {
            let op = &req.op;
            let step = req.step();
            let s = u64::from(step.step_index);
            let rs = method == Method::ReduceScatterRing;
            let (tx_block, _) = ring_step_blocks(rs, s, op.plan.my_index, op.member_count);
            let count = op.msg_len() / op.dt.len.max(1);
            let (off_e, len_e) = ring_block(count, op.member_count, tx_block);
            let (off, len) = (off_e * op.dt.len, len_e * op.dt.len);
            let (ep, member) = peer_list(req)[0];
            emit(req, ep, member, Src::Acc, off, len, off, None)?;
        }
        Method::ReduceWaypoint => {
            // Forward the folded subtree to the parent.
            let op = &req.op;
            let step = req.step();
            let phase = &op.plan.phases[step.phase_idx];
            let parent = *op.plan.aux_peer(phase).expect("fan-in waypoint has a parent");
            let (len, base) = (step.send_len, step.remote_base);
            emit(req, parent.ep, parent.member, Src::Acc, 0, len, base, None)?;
        }
        Method::ScatterWaypoint => {
            if req.step().has(flags::PIPELINED) {
                // Every fragment was forwarded as it arrived.
                trace!("pipelined waypoint forwarded {} bytes", req.forwarded);
            } else {
                let len = req.step().send_len;
                for (ep, member) in peer_list(req) {
                    emit(req, ep, member, Src::Acc, 0, len, 0, None)?;
                }
            }
        }
        Method::BruckAlltoall => {
            // Pack this round's block run and ship it to the stride peer.
            let op = &mut req.op;
            let step = &op.steps[req.cur];
            let b = op.block_len();
            let k = u32::from(step.step_index);
            let mut run = 0usize;
            for blk in crate::builders::bruck::round_blocks(op.member_count, k) {
                let at = blk as usize * b;
                op.scratch[run..run + b].copy_from_slice(&op.acc[at..at + b]);
                run += b;
            }
            let (ep, member) = peer_list(req)[0];
            emit(req, ep, member, Src::Scratch, 0, run, 0, None)?;
        }
        Method::PlummerIntra(stage) => build_plummer_intra_tx(req, ctx, stage)?,
        Method::PlummerInter => build_plummer_inter_tx(req, ctx)?,
    }
    Ok(())
}

fn peer_list(req: &ActiveReq) -> Vec<(EpHandle, MemberIndex)> {
    let phase = &req.op.plan.phases[req.step().phase_idx];
    req.op
        .plan
        .phase_peers(phase)
        .iter()
        .map(|p| (p.ep, p.member))
        .collect()
}

fn build_plummer_intra_tx(req: &mut ActiveReq, _ctx: &ExecCtx, stage: PlummerStage) -> Result<()> {
    let n = req.op.member_count as usize;
    let dt = req.op.dt.len;
    let leader = req.op.plummer.as_ref().unwrap().map.is_leader();
    match stage {
        PlummerStage::GatherSendCounts | PlummerStage::GatherRecvCounts if !leader => {
            let which_recv = stage == PlummerStage::GatherRecvCounts;
            let counts = counts_bytes(&req.op, n, which_recv);
            let base = req.step().remote_base;
            let (ep, member) = peer_list(req)[0];
            emit(req, ep, member, Src::Owned(Rc::new(counts)), 0, n * 4, base, None)?;
        }
        PlummerStage::GatherSendBuffers if !leader => {
            let op = &req.op;
            let counts: Vec<u32> = (0..n)
                .map(|d| op.params.send.counts.for_member(d as u64) as u32)
                .collect();
            let image = pack_variable(
                &op.params.send.buf.borrow(),
                &counts,
                op.params.send.displs.as_deref(),
                dt,
            );
            if !image.is_empty() {
                let me = op.plan.my_index;
                let len = image.len();
                let (ep, member) = peer_list(req)[0];
                emit(req, ep, member, Src::Owned(Rc::new(image)), 0, len, 0, Some(me))?;
            }
        }
        PlummerStage::ScatterRecvBuffers if leader => {
            let members: Vec<MemberIndex> =
                req.op.plummer.as_ref().unwrap().map.node_members[1..].to_vec();
            let peers = peer_list(req);
            for (i, d) in members.iter().enumerate() {
                let image = assemble_image(&req.op, *d);
                if image.is_empty() {
                    continue;
                }
                let (ep, member) = peers[i];
                let len = image.len();
                emit(req, ep, member, Src::Owned(Rc::new(image)), 0, len, 0, None)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn build_plummer_inter_tx(req: &mut ActiveReq, _ctx: &ExecCtx) -> Result<()> {
    let me = req.op.plan.my_index;
    let leaders = req.op.plummer.as_ref().unwrap().map.leaders.clone();
    let peers = peer_list(req);
    let mut pi = 0usize;
    for l in leaders.iter().filter(|l| **l != me) {
        let payload = inter_payload(&req.op, *l);
        let (ep, member) = peers[pi];
        pi += 1;
        if payload.is_empty() {
            continue;
        }
        let len = payload.len();
        emit(req, ep, member, Src::Owned(Rc::new(payload)), 0, len, 0, Some(me))?;
    }
    Ok(())
}

/// Split one logical message into queued frames, fragmenting where no single
/// tier admits it. Frames carrying a source-rank extension ride bcopy, where
/// the pack callback can prepend the extension without an extra copy of the
/// payload.
#[allow(clippy::too_many_arguments)]
fn emit(
    req: &mut ActiveReq,
    ep: EpHandle,
    peer: MemberIndex,
    src: Src,
    off: usize,
    len: usize,
    remote_base: usize,
    ext_src: Option<u64>,
) -> Result<()> {
    let dt_len = req.op.dt.len;
    let (lpr, thresh, has_memh, step_frag) = {
        let step = req.step();
        (
            step.has(flags::LENGTH_PER_REQUEST),
            step.send_thresh,
            step.memh.is_some(),
            step.fragment_length,
        )
    };
    if len == 0 {
        if !lpr {
            req.sendq.push_back(SendItem {
                ep,
                peer,
                src,
                off,
                len: 0,
                remote_offset: remote_base as u32,
                ext_src,
                tier: SendTier::Short,
            });
        }
        return Ok(());
    }

    // Extension-carrying frames ride bcopy, where the pack callback prepends
    // the source rank; zcopy needs the registration made at materialization.
    // Dynamic (variable-length) messages size their own fragments; fixed
    // messages reuse the step's precomputed fragment length.
    let msg_frag = if lpr { thresh.fragment_length(len, dt_len) } else { step_frag };
    let (frag_len, tier) = if ext_src.is_some() {
        if len <= thresh.max_bcopy_one {
            (len, SendTier::Bcopy)
        } else {
            (msg_frag.min(thresh.max_bcopy_one.max(1)), SendTier::Bcopy)
        }
    } else {
        match thresh.tier_for(len) {
            Ok(SendTier::Zcopy) if !has_memh => {
                let fl = msg_frag.min(thresh.max_bcopy_one.max(1));
                (fl, thresh.tier_for(fl.min(len))?)
            }
            Ok(t) => (len, t),
            Err(_) => (msg_frag, thresh.tier_for(msg_frag.min(len))?),
        }
    };

    let mut at = 0usize;
    while at < len {
        let l = frag_len.min(len - at);
        req.sendq.push_back(SendItem {
            ep,
            peer,
            src: src.clone(),
            off: off + at,
            len: l,
            remote_offset: (remote_base + at) as u32,
            ext_src,
            tier: if ext_src.is_some() {
                SendTier::Bcopy
            } else if l == len {
                tier
            } else {
                thresh.tier_for(l)?
            },
        });
        at += l;
    }
    Ok(())
}

/// Drain the send queue. A retryable failure leaves the failing item at the
/// front and parks the queue for the next progress tick.
pub(crate) fn push_sends(req: &mut ActiveReq, ctx: &ExecCtx) -> Result<()> {
    req.resend = false;
    while let Some(item) = req.sendq.front() {
        let step = &req.op.steps[req.cur];
        let header = Header {
            group_id: ctx.group_id,
            coll_id: req.coll_id,
            step_idx: step.step_index,
            remote_offset: item.remote_offset,
        }
        .pack();
        match send_one(&req.op, step, item, header, ctx) {
            Ok(()) => {
                req.sendq.pop_front();
            }
            Err(e) if e.is_retryable() && req.resend_count < ctx.config.resend_limit => {
                req.resend_count += 1;
                req.resend = true;
                debug!(
                    "retryable send failure to {} (attempt {}), parked for resend",
                    item.peer, req.resend_count
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn send_one(op: &Op, step: &Step, item: &SendItem, header: u64, ctx: &ExecCtx) -> Result<()> {
    let payload: &[u8] = match &item.src {
        Src::Acc => &op.acc[item.off..item.off + item.len],
        Src::Scratch => &op.scratch[item.off..item.off + item.len],
        Src::Owned(v) => &v[item.off..item.off + item.len],
    };
    match item.tier {
        SendTier::Short => ctx.transport.am_short(item.ep, ctx.am_id, header, payload),
        SendTier::Bcopy => ctx
            .transport
            .am_bcopy(item.ep, ctx.am_id, &mut |out: &mut Vec<u8>| {
                out.extend_from_slice(&header.to_ne_bytes());
                if let Some(src_rank) = item.ext_src {
                    write_ext_header(src_rank, out);
                }
                out.extend_from_slice(payload);
            })
            .map(|_| ()),
        SendTier::Zcopy => {
            let memh = step
                .memh
                .as_ref()
                .ok_or_else(|| Error::InvalidParam("zcopy frame without registration".into()))?;
            ctx.transport
                .am_zcopy(item.ep, ctx.am_id, header, payload, memh)
        }
    }
}

/* ---------- Receive side ---------- */

/// Apply one inbound payload to the current step.
pub(crate) fn on_payload(req: &mut ActiveReq, ctx: &ExecCtx, header: Header, data: &[u8]) -> Result<()> {
    let step = &req.op.steps[req.cur];
    let phase = &req.op.plan.phases[step.phase_idx];
    let method = phase.method;
    let expects_ext = matches!(
        method,
        Method::PlummerInter | Method::PlummerIntra(PlummerStage::GatherSendBuffers)
    );
    let (src_rank, payload) = if expects_ext {
        read_ext_header(data).ok_or_else(|| {
            Error::InvalidParam(format!(
                "variable-length fragment shorter than its {EXT_HEADER_LEN}-byte extension"
            ))
        })?
    } else {
        (0, data)
    };
    let off = header.remote_offset as usize;
    let dlen = payload.len();
    // No single frame can exceed what the receive side calibrated for.
    debug_assert!(dlen <= step.recv_thresh.max_bcopy_one.max(step.recv_thresh.max_zcopy_one));
    // Non-commutative operators follow the plan's swap derivation; stable
    // reductions force the discipline onto commutative ones as well.
    let swap = if req.op.commutative { req.op.stable } else { phase.is_swap };

    match method {
        Method::RecvTerminal => {
            req.op.acc[off..off + dlen].copy_from_slice(payload);
        }
        Method::ScatterWaypoint => {
            req.op.acc[off..off + dlen].copy_from_slice(payload);
            if step.has(flags::PIPELINED) {
                // Forward this fragment right away.
                let peers = peer_list(req);
                for (ep, member) in peers {
                    emit(req, ep, member, Src::Acc, off, dlen, off, None)?;
                }
                req.forwarded += dlen;
            }
        }
        Method::ReduceTerminal | Method::ReduceWaypoint => {
            if step.recv_sources > 1 {
                req.op.temp[off..off + dlen].copy_from_slice(payload);
            } else {
                reduce_into(req, ctx, off, payload, swap);
            }
        }
        Method::ReduceRecursive | Method::ReduceScatterRing => {
            reduce_into(req, ctx, off, payload, swap);
        }
        Method::AllgatherRing => {
            req.op.acc[off..off + dlen].copy_from_slice(payload);
        }
        Method::BruckAlltoall => {
            req.op.temp[off..off + dlen].copy_from_slice(payload);
        }
        Method::PlummerIntra(stage) => {
            plummer_arrival(req, stage, src_rank, off, payload)?;
        }
        Method::PlummerInter => {
            let base = inter_rx_base(&req.op, src_rank);
            let ps = req.op.plummer.as_mut().unwrap();
            ps.inter_rx[base + off..base + off + dlen].copy_from_slice(payload);
        }
        Method::SendTerminal => {
            unreachable!("SendTerminal sends only; it never receives a payload")
        }
    }

    req.pending = req
        .pending
        .saturating_sub(if req.byte_counted { dlen as u64 } else { 1 });
    Ok(())
}

/// `dst = payload (+) dst`, or the swapped discipline for order-preserving
/// reductions: the local half moves to a temporary, the wire payload takes
/// its place, and the temporary folds on top, keeping the earlier-rank
/// operand on the left.
fn reduce_into(req: &mut ActiveReq, ctx: &ExecCtx, off: usize, payload: &[u8], swap: bool) {
    let op_token = req.op.params.op.unwrap_or_default();
    let dtype = req.op.params.send.dtype;
    let dt = req.op.dt.len.max(1);
    let count = payload.len() / dt;
    let dst = &mut req.op.acc[off..off + payload.len()];
    if swap {
        let tmp = dst.to_vec();
        dst.copy_from_slice(payload);
        ctx.host.reduce(op_token, &tmp, dst, count, dtype);
    } else {
        ctx.host.reduce(op_token, payload, dst, count, dtype);
    }
}

/// Method completion actions that run once the step's receive expectation
/// is met.
fn recv_complete(req: &mut ActiveReq, ctx: &ExecCtx) -> Result<()> {
    let step = &req.op.steps[req.cur];
    let phase = &req.op.plan.phases[step.phase_idx];
    match phase.method {
        Method::ReduceTerminal | Method::ReduceWaypoint if step.recv_sources > 1 => {
            // Fold staged children in rank order: the local subtree covers
            // the earlier ranks, so each fold keeps it on the left.
            let sources = step.recv_sources as usize;
            let len = step.recv_len;
            let op_token = req.op.params.op.unwrap_or_default();
            let dtype = req.op.params.send.dtype;
            let count = len / req.op.dt.len.max(1);
            for c in 0..sources {
                let tmp = req.op.acc[..len].to_vec();
                req.op.acc[..len].copy_from_slice(&req.op.temp[c * len..(c + 1) * len]);
                let (acc, _) = req.op.acc.split_at_mut(len);
                ctx.host.reduce(op_token, &tmp, acc, count, dtype);
            }
        }
        Method::BruckAlltoall => {
            // Scatter the received run back into this round's positions.
            let b = req.op.block_len();
            let k = u32::from(step.step_index);
            let mut run = 0usize;
            for blk in crate::builders::bruck::round_blocks(req.op.member_count, k) {
                let at = blk as usize * b;
                req.op.acc[at..at + b].copy_from_slice(&req.op.temp[run..run + b]);
                run += b;
            }
        }
        _ => {}
    }
    Ok(())
}

/* ---------- Two-level alltoallv bookkeeping ---------- */

fn counts_bytes(op: &Op, n: usize, recv_side: bool) -> Vec<u8> {
    let counts = if recv_side { &op.params.recv.counts } else { &op.params.send.counts };
    let mut out = Vec::with_capacity(n * 4);
    for d in 0..n {
        out.extend_from_slice(&(counts.for_member(d as u64) as u32).to_ne_bytes());
    }
    out
}

fn total_send_bytes(table: &[u8], n: usize, ordinal: usize, dt: usize) -> usize {
    (0..n)
        .map(|d| crate::op::PlummerState::count_at(table, n, ordinal, d))
        .sum::<usize>()
        * dt
}

/// Byte offset of ordinal `o`'s image within the node's gathered buffer.
fn gathered_base(table: &[u8], n: usize, ordinal: usize, dt: usize) -> usize {
    (0..ordinal).map(|o| total_send_bytes(table, n, o, dt)).sum()
}

/// Bytes the node led by `leader` sends to this node, per the gathered
/// receive counts.
fn node_to_node_bytes(op: &Op, leader: MemberIndex) -> usize {
    let ps = op.plummer.as_ref().unwrap();
    let n = op.member_count as usize;
    let dt = op.dt.len;
    let src_node = ps.map.node_of(leader);
    let members = ps.map.members_of(src_node, op.member_count);
    let local = ps.map.node_members.len();
    members
        .iter()
        .map(|s| {
            (0..local)
                .map(|d_ord| {
                    crate::op::PlummerState::count_at(&ps.recv_counts, n, d_ord, *s as usize)
                })
                .sum::<usize>()
        })
        .sum::<usize>()
        * dt
}

/// Base offset of `src_leader`'s payload within the inter staging buffer.
fn inter_rx_base(op: &Op, src_leader: MemberIndex) -> usize {
    let ps = op.plummer.as_ref().unwrap();
    let me = op.plan.my_index;
    ps.map
        .leaders
        .iter()
        .filter(|l| **l != me && **l < src_leader)
        .map(|l| node_to_node_bytes(op, *l))
        .sum()
}

fn plummer_arrival(
    req: &mut ActiveReq,
    stage: PlummerStage,
    src_rank: u64,
    off: usize,
    payload: &[u8],
) -> Result<()> {
    let n = req.op.member_count as usize;
    let dt = req.op.dt.len;
    match stage {
        PlummerStage::GatherSendCounts => {
            let ps = req.op.plummer.as_mut().unwrap();
            ps.send_counts[off..off + payload.len()].copy_from_slice(payload);
        }
        PlummerStage::GatherRecvCounts => {
            let ps = req.op.plummer.as_mut().unwrap();
            ps.recv_counts[off..off + payload.len()].copy_from_slice(payload);
        }
        PlummerStage::GatherSendBuffers => {
            let ps = req.op.plummer.as_mut().unwrap();
            let ordinal = (src_rank - ps.map.node_members[0]) as usize;
            let base = gathered_base(&ps.send_counts, n, ordinal, dt);
            ps.gathered[base + off..base + off + payload.len()].copy_from_slice(payload);
        }
        PlummerStage::ScatterRecvBuffers => {
            req.op.acc[off..off + payload.len()].copy_from_slice(payload);
        }
    }
    Ok(())
}

/// Offset of the `(s -> d)` slice within ordinal `o = ord(s)`'s image.
fn image_offset(table: &[u8], n: usize, ordinal: usize, d: usize, dt: usize) -> usize {
    (0..d)
        .map(|d2| crate::op::PlummerState::count_at(table, n, ordinal, d2))
        .sum::<usize>()
        * dt
}

/// The payload this leader ships to `target_leader`: source-major
/// concatenation of every `(s in my node -> d in target node)` slice.
fn inter_payload(op: &Op, target_leader: MemberIndex) -> Vec<u8> {
    let ps = op.plummer.as_ref().unwrap();
    let n = op.member_count as usize;
    let dt = op.dt.len;
    let dst_members = ps.map.members_of(ps.map.node_of(target_leader), op.member_count);
    let mut out = Vec::new();
    for (o, _s) in ps.map.node_members.iter().enumerate() {
        let base = gathered_base(&ps.send_counts, n, o, dt);
        for d in &dst_members {
            let at = base + image_offset(&ps.send_counts, n, o, *d as usize, dt);
            let c = crate::op::PlummerState::count_at(&ps.send_counts, n, o, *d as usize) * dt;
            out.extend_from_slice(&ps.gathered[at..at + c]);
        }
    }
    out
}

/// Offset of the `(s -> d)` slice within `src_leader`'s inter payload, as
/// computed from the receive-count tables.
fn inter_payload_offset(op: &Op, src_leader: MemberIndex, s: MemberIndex, d_ord: usize) -> usize {
    let ps = op.plummer.as_ref().unwrap();
    let n = op.member_count as usize;
    let dt = op.dt.len;
    let src_members = ps.map.members_of(ps.map.node_of(src_leader), op.member_count);
    let local = ps.map.node_members.len();
    let mut off = 0usize;
    for s2 in &src_members {
        if *s2 == s {
            break;
        }
        for d2 in 0..local {
            off += crate::op::PlummerState::count_at(&ps.recv_counts, n, d2, *s2 as usize) * dt;
        }
    }
    for d2 in 0..d_ord {
        off += crate::op::PlummerState::count_at(&ps.recv_counts, n, d2, s as usize) * dt;
    }
    off
}

/// Assemble the full source-ordered receive image of node member `d`.
fn assemble_image(op: &Op, d: MemberIndex) -> Vec<u8> {
    let ps = op.plummer.as_ref().unwrap();
    let n = op.member_count as usize;
    let dt = op.dt.len;
    let d_ord = (d - ps.map.node_members[0]) as usize;
    let mut out = Vec::new();
    for s in 0..n as u64 {
        let c = crate::op::PlummerState::count_at(&ps.recv_counts, n, d_ord, s as usize) * dt;
        if c == 0 {
            continue;
        }
        if ps.map.node_of(s) == ps.map.my_node {
            let o = (s - ps.map.node_members[0]) as usize;
            let at = gathered_base(&ps.send_counts, n, o, dt)
                + image_offset(&ps.send_counts, n, o, d as usize, dt);
            out.extend_from_slice(&ps.gathered[at..at + c]);
        } else {
            let l = ps.map.members_of(ps.map.node_of(s), op.member_count)[0];
            let at = inter_rx_base(op, l) + inter_payload_offset(op, l, s, d_ord);
            out.extend_from_slice(&ps.inter_rx[at..at + c]);
        }
    }
    out
}

/* ---------- Cancellation ---------- */

/// Unwind a cancelled request: execution stops, the op's registrations are
/// released when the op is dropped, and the stored status turns terminal.
pub(crate) fn cancel(req: &mut ActiveReq) {
    if req.done.is_none() {
        debug!("coll {} cancelled", req.coll_id);
        req.sendq.clear();
        req.done = Some(Err(Error::Canceled));
    }
}
