//! Binomial trees for broadcast and rooted reduce.
//!
//! Both directions use the same tree shape over root-relative indices: the
//! parent of `r'` clears its lowest set bit, the children of `r'` are
//! `r' + 2^j` for `j` below the parent's own lowest bit (every `j` for the
//! root). A child at `r' + 2^j` therefore roots the contiguous index range
//! `[r' + 2^j, r' + 2^(j+1))`, which is what lets a fan-in fold its children
//! in rank order for non-commutative operators. Each rank gets a single
//! phase:
//!
//! - broadcast -- root: `SendTerminal` to its children; interior:
//!   `ScatterWaypoint` (receive from parent, forward to children); leaf:
//!   `RecvTerminal`.
//! - reduce -- leaf: `SendTerminal` to its parent; interior:
//!   `ReduceWaypoint` (receive children, fold, forward); root:
//!   `ReduceTerminal`.
//!
//! Fan-in arrivals are staged per child; a child's staging ordinal at its
//! parent equals its branch index `j`, recorded on the sending phase as
//! `remote_slot`.

use crate::builders::BuildCtx;
use crate::catalog::ALGO_TREE;
use crate::coll::CollectiveParams;
use crate::config::Config;
use crate::error::Result;
use crate::host::MemberIndex;
use crate::plan::{Method, Phase, Plan};

/// Children of a root-relative index, ascending.
fn children(rel: u64, n: u64) -> Vec<u64> {
    let mut out = Vec::new();
    let max_bit = if rel == 0 { u64::MAX } else { 1u64 << rel.trailing_zeros() };
    let mut bit = 1u64;
    while bit < max_bit && rel + bit < n {
        out.push(rel + bit);
        bit <<= 1;
    }
    out
}

/// Parent of a root-relative index (clears the lowest set bit).
fn parent(rel: u64) -> u64 {
    rel & (rel - 1)
}

/// Ordinal of `rel` within its parent's child list: its branch index.
fn child_ordinal(rel: u64) -> u32 {
    rel.trailing_zeros()
}

fn build(ctx: &mut BuildCtx<'_>, root: MemberIndex, fan_in: bool) -> Result<Plan> {
    let n = ctx.member_count;
    let algo = ALGO_TREE;
    let mut plan = Plan::new(algo, ctx.my_index);
    let rel = (ctx.my_index + n - root % n) % n;
    let to_real = |r: u64| (r + root) % n;

    let step_index = plan.claim_steps(1)?;
    if n <= 1 {
        plan.support_large_dtype = true;
        return Ok(plan);
    }

    let kids = children(rel, n);
    let phase = if rel == 0 {
        // Root.
        let mut peers = Vec::with_capacity(kids.len());
        for c in &kids {
            peers.push(ctx.connect(to_real(*c))?);
        }
        let range = plan.push_peers(peers);
        let method = if fan_in { Method::ReduceTerminal } else { Method::SendTerminal };
        let mut ph = Phase::new(method, step_index, range);
        ph.ep_cnt = kids.len() as u8;
        ph.is_swap = fan_in; // local subtree precedes every child's
        ph
    } else if kids.is_empty() {
        // Leaf.
        let pr = ctx.connect(to_real(parent(rel)))?;
        let range = plan.push_peers([pr]);
        let method = if fan_in { Method::SendTerminal } else { Method::RecvTerminal };
        let mut ph = Phase::new(method, step_index, range);
        if fan_in {
            ph.remote_slot = child_ordinal(rel);
        }
        ph
    } else {
        // Interior waypoint: children are the primary peer set, the parent
        // sits on the other direction.
        let mut peers = Vec::with_capacity(kids.len());
        for c in &kids {
            peers.push(ctx.connect(to_real(*c))?);
        }
        let range = plan.push_peers(peers);
        let aux = plan.push_peer(ctx.connect(to_real(parent(rel)))?);
        let method = if fan_in { Method::ReduceWaypoint } else { Method::ScatterWaypoint };
        let mut ph = Phase::new(method, step_index, range);
        ph.ep_cnt = kids.len() as u8;
        ph.aux_peer = Some(aux);
        if fan_in {
            ph.remote_slot = child_ordinal(rel);
        }
        ph.is_swap = fan_in;
        ph
    };
    plan.push_phase(phase)?;
    plan.support_non_commutative = fan_in;
    plan.support_large_dtype = true;
    Ok(plan)
}

/// Broadcast from `params.root`.
pub fn create_bcast(
    ctx: &mut BuildCtx<'_>,
    _config: &Config,
    params: &CollectiveParams,
) -> Result<Plan> {
    build(ctx, params.root, false)
}

/// Reduce toward `params.root`.
pub fn create_reduce(
    ctx: &mut BuildCtx<'_>,
    _config: &Config,
    params: &CollectiveParams,
) -> Result<Plan> {
    build(ctx, params.root, true)
}
