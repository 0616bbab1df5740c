//! Bruck alltoall: log-phase block exchange.
//!
//! After a local rotation that puts the block destined to `(r + i) mod N` at
//! position `i`, round `k` packs every position whose index has bit `k` set,
//! sends the packed run to `(r + 2^k) mod N`, and overwrites the same
//! positions with the run received from `(r - 2^k) mod N`. A final inverse
//! rotation (with reversal) lands each block at its source's slot. The
//! rotations are buffer work owned by the op; the plan only carries the
//! per-round peers.

use crate::builders::BuildCtx;
use crate::catalog::ALGO_BRUCK;
use crate::coll::CollectiveParams;
use crate::config::Config;
use crate::error::Result;
use crate::plan::{Method, Phase, Plan};

/// Block positions exchanged in round `k` of an `n`-member bruck plan.
pub(crate) fn round_blocks(n: u64, k: u32) -> impl Iterator<Item = u64> {
    (0..n).filter(move |i| i & (1u64 << k) != 0)
}

pub fn create(ctx: &mut BuildCtx<'_>, _config: &Config, _params: &CollectiveParams) -> Result<Plan> {
    let n = ctx.member_count;
    let my = ctx.my_index;
    let mut plan = Plan::new(ALGO_BRUCK, my);
    if n <= 1 {
        return Ok(plan);
    }

    let rounds = 64 - (n - 1).leading_zeros();
    for k in 0..rounds {
        let stride = 1u64 << k;
        let dst = (my + stride) % n;
        let src = (my + n - stride) % n;
        let step_index = plan.claim_steps(1)?;
        let dp = ctx.connect(dst)?;
        let range = plan.push_peers([dp]);
        let aux = if src == dst { None } else { Some(plan.push_peer(ctx.connect(src)?)) };
        let mut phase = Phase::new(Method::BruckAlltoall, step_index, range);
        phase.ep_cnt = 1;
        phase.aux_peer = aux;
        plan.push_phase(phase)?;
    }
    Ok(plan)
}
