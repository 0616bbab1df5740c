//! Ring allreduce: reduce-scatter followed by allgather.
//!
//! `2*(N-1)` phases total; the first `N-1` run the reduce-scatter half, the
//! rest the allgather half. Every phase talks to the same two neighbours --
//! receive from `(r - 1) mod N`, send to `(r + 1) mod N` -- so only phase 0
//! establishes endpoints and the later phases share its arena entries. The
//! phase reports `ep_cnt = 1` because a single send is issued per step; the
//! receive endpoint is kept for threshold calibration and demux.
//!
//! With `N = 2` both neighbours are the same member and the phase collapses
//! to a single endpoint, which is also the one place the plan-level endpoint
//! count is reduced; the arena accounting there is covered by an explicit
//! test.

use crate::builders::BuildCtx;
use crate::catalog::ALGO_RING;
use crate::coll::CollectiveParams;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::plan::{Method, Phase, Plan};
use log::debug;

pub fn create(ctx: &mut BuildCtx<'_>, _config: &Config, _params: &CollectiveParams) -> Result<Plan> {
    let n = ctx.member_count;
    if n < 2 {
        return Err(Error::InvalidParam("ring needs at least 2 members".into()));
    }

    let mut plan = Plan::new(ALGO_RING, ctx.my_index);
    let my = ctx.my_index;
    let src = (my + n - 1) % n;
    let dst = (my + 1) % n;
    debug!("{my}'s ring peers: source {src}, destination {dst}");

    // Phase 0 owns the endpoints; every later phase shares them.
    let dst_peer = ctx.connect(dst)?;
    let range = plan.push_peers([dst_peer]);
    let aux = if src == dst {
        // Two-member collapse: one endpoint serves both directions.
        None
    } else {
        Some(plan.push_peer(ctx.connect(src)?))
    };

    let steps = 2 * (n - 1);
    for s in 0..steps {
        let method = if s < n - 1 {
            Method::ReduceScatterRing
        } else {
            Method::AllgatherRing
        };
        let step_index = plan.claim_steps(1)?;
        let mut phase = Phase::new(method, step_index, range.clone());
        phase.ep_cnt = 1;
        phase.aux_peer = aux;
        plan.push_phase(phase)?;
    }

    plan.support_large_dtype = true;
    Ok(plan)
}
