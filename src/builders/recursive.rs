//! Recursive K-ing: barrier and allreduce over K-ary sub-group exchanges.
//!
//! For `N = K^s` members the plan is `s` phases; at step `i` the peers of
//! rank `r` are the other members of its `K^(i+1)`-sized sub-group, reached
//! with stride `K^i`. For member counts that are not a power of the factor,
//! the leading `2*extra` ranks are paired into pre/post terminal phases and
//! the recursive core runs over remapped indices:
//!
//! ```text
//!  example, N = 6:   0    1    2    3    4    5
//!  pre-              0 -> 1    2 -> 3    4    5
//!  recursive              1   <->  3    4 <-> 5
//!                         1   <->  4    3 <-> 5
//!  post-             0 <- 1    2 <- 3    4    5
//! ```
//!
//! Even ranks in the prefix take only the pre/post phases; odd ranks take
//! everything under remapped index `r / 2`; ranks past the prefix participate
//! under `r - extra`. Step indices advance identically on every rank -- the
//! pre and post steps are claimed even by ranks that skip them -- so all
//! ranks agree on the demux keys.

use crate::builders::{identity_members, local_index, BuildCtx};
use crate::catalog::ALGO_RECURSIVE;
use crate::coll::CollectiveParams;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::host::MemberIndex;
use crate::plan::{Method, Phase, Plan};
use log::debug;

/// Swap is decided purely from the local index relative to the step's
/// sub-group boundary: the lower half swaps so the earlier-rank operand
/// stays on the left of a non-commutative reduction.
pub(crate) fn swap_for(factor: u64, local_step: u16, index: u64) -> bool {
    let mut scale = 1u64;
    for _ in 0..=local_step {
        scale *= factor;
    }
    index % scale < scale / factor
}

/// Full build across the whole group.
pub fn create(ctx: &mut BuildCtx<'_>, config: &Config, _params: &CollectiveParams) -> Result<Plan> {
    let members = identity_members(ctx.member_count);
    create_partial(ctx, config, &members)
}

/// Partial build over an explicit member list.
pub fn create_partial(
    ctx: &mut BuildCtx<'_>,
    config: &Config,
    member_list: &[MemberIndex],
) -> Result<Plan> {
    let mut plan = Plan::new(ALGO_RECURSIVE, ctx.my_index);
    let factor = u64::from(config.recursive.factor.max(2)).min(member_list.len() as u64);
    connect(ctx, &mut plan, member_list, factor.max(2), true)?;
    plan.support_non_commutative = true;
    plan.support_large_dtype = true;
    Ok(plan)
}

/// Populate `plan` with the recursive phases for `member_list`.
///
/// A rank absent from the list contributes an empty segment: only the step
/// counter advances, keeping downstream step indices consistent.
pub(crate) fn connect(
    ctx: &mut BuildCtx<'_>,
    plan: &mut Plan,
    member_list: &[MemberIndex],
    factor: u64,
    check_swap: bool,
) -> Result<()> {
    let member_cnt = member_list.len() as u64;
    if member_cnt == 0 {
        return Err(Error::InvalidParam("empty member list".into()));
    }

    let mut step_size = 1u64;
    let mut step_cnt: u16 = 0;
    while step_size < member_cnt {
        step_size *= factor;
        step_cnt += 1;
    }
    debug!(
        "recursive factor {factor}, step size {step_size}, member {} of {member_cnt}",
        ctx.my_index
    );

    let Some(my) = local_index(ctx.my_index, member_list) else {
        // Not part of this sub-group: advance the step counter only.
        let claimed = if step_size != member_cnt { (step_cnt - 1) + 2 } else { step_cnt };
        plan.claim_steps(claimed)?;
        return Ok(());
    };

    if step_size == member_cnt {
        pow_factor(ctx, plan, member_list, my as u64, factor, step_cnt, check_swap)
    } else {
        if factor != 2 {
            return Err(Error::InvalidParam(
                "non-power-of-K member counts require factor 2".into(),
            ));
        }
        non_pow_factor(ctx, plan, member_list, my as u64, step_size, step_cnt, check_swap)
    }
}

/// `N = K^s`: every rank runs `s` pure recursive phases.
fn pow_factor(
    ctx: &mut BuildCtx<'_>,
    plan: &mut Plan,
    member_list: &[MemberIndex],
    my: u64,
    factor: u64,
    step_cnt: u16,
    check_swap: bool,
) -> Result<()> {
    let mut step_size = 1u64;
    for local_step in 0..step_cnt {
        let scale = step_size * factor;
        let base = my - my % scale;
        let step_index = plan.claim_steps(1)?;

        let mut peers = Vec::with_capacity(factor as usize - 1);
        for j in 1..factor {
            let peer = base + ((my - base + step_size * j) % scale);
            debug!(
                "{my}'s peer #{j}/{} (step #{}/{step_cnt}): {peer}",
                factor - 1,
                local_step + 1
            );
            peers.push(ctx.connect(member_list[peer as usize])?);
        }
        let range = plan.push_peers(peers);
        let mut phase = Phase::new(Method::ReduceRecursive, step_index, range);
        phase.ep_cnt = (factor - 1) as u8;
        phase.is_swap = check_swap && swap_for(factor, local_step, my);
        plan.push_phase(phase)?;
        step_size = scale;
    }
    Ok(())
}

/// Non-power member count: binary pre/post pairing around a recursive core
/// over the nearest lower power of two.
fn non_pow_factor(
    ctx: &mut BuildCtx<'_>,
    plan: &mut Plan,
    member_list: &[MemberIndex],
    my: u64,
    step_size: u64,
    step_cnt: u16,
    check_swap: bool,
) -> Result<()> {
    let member_cnt = member_list.len() as u64;
    let near = step_cnt - 1;
    let p = step_size >> 1;
    let extra = member_cnt - p;
    let paired = my < 2 * extra;
    let is_odd = my % 2 == 1;

    let new_my = if paired {
        if is_odd { Some(my / 2) } else { None }
    } else {
        Some(my - extra)
    };

    // Pre: even prefix ranks fold their contribution into their odd partner.
    let pre_step = plan.claim_steps(1)?;
    if paired {
        let (method, peer) = if is_odd {
            (Method::ReduceTerminal, my - 1)
        } else {
            (Method::SendTerminal, my + 1)
        };
        let pr = ctx.connect(member_list[peer as usize])?;
        let range = plan.push_peers([pr]);
        plan.push_phase(Phase::new(method, pre_step, range))?;
    }

    // Recursive core over the remapped indices.
    if let Some(nm) = new_my {
        let mut size = 1u64;
        for i in 0..near {
            let scale = size * 2;
            let base = nm - nm % scale;
            let step_index = plan.claim_steps(1)?;
            let peer_new = base + ((nm - base + size) % scale);
            // Translate the remapped index back to a group member.
            let real = if peer_new < extra { 2 * peer_new + 1 } else { peer_new + extra };
            debug!("{my}'s remapped peer (step #{}/{near}): {real}", i + 1);
            let pr = ctx.connect(member_list[real as usize])?;
            let range = plan.push_peers([pr]);
            let mut phase = Phase::new(Method::ReduceRecursive, step_index, range);
            phase.is_swap = check_swap && swap_for(2, i, nm);
            plan.push_phase(phase)?;
            size = scale;
        }
    } else {
        plan.claim_steps(near)?;
    }

    // Post: mirror of the pre phase, scattering the result back.
    let post_step = plan.claim_steps(1)?;
    if paired {
        let (method, peer) = if is_odd {
            (Method::SendTerminal, my - 1)
        } else {
            (Method::RecvTerminal, my + 1)
        };
        let pr = ctx.connect(member_list[peer as usize])?;
        let range = plan.push_peers([pr]);
        plan.push_phase(Phase::new(method, post_step, range))?;
    }

    Ok(())
}
