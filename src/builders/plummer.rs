//! Two-level alltoallv: intra-node aggregation around one inter-node
//! exchange.
//!
//! Nodes are derived from the group's topology summary (`ppn` members per
//! node, the lowest rank of each node acting as leader). The protocol runs
//! five steps, each claimed by every rank so demux keys agree group-wide:
//!
//! 1. gather send-counts at the leader
//! 2. gather recv-counts at the leader
//! 3. gather send buffers at the leader (variable length)
//! 4. alltoallv between leaders (variable length, source-attributed)
//! 5. scatter each member's assembled receive image (variable length)
//!
//! Non-leaders build phases for steps 1-3 and 5; leaders for all five. A
//! single-node group skips the inter phase; its step is still claimed.

use crate::builders::BuildCtx;
use crate::catalog::ALGO_PLUMMER;
use crate::coll::CollectiveParams;
use crate::config::Config;
use crate::error::Result;
use crate::host::MemberIndex;
use crate::plan::{Method, Phase, Plan, PlummerStage};

/// Node layout derived from the topology summary. The last node may be
/// smaller when the member count is not a multiple of `ppn`.
#[derive(Debug, Clone)]
pub(crate) struct NodeMap {
    pub ppn: u64,
    pub my_node: u64,
    pub ordinal: u64,
    pub node_members: Vec<MemberIndex>,
    pub leaders: Vec<MemberIndex>,
}

impl NodeMap {
    pub fn new(my_index: MemberIndex, member_cnt: u64, ppn: u64) -> Self {
        let ppn = ppn.clamp(1, member_cnt.max(1));
        let my_node = my_index / ppn;
        let first = my_node * ppn;
        let last = (first + ppn).min(member_cnt);
        Self {
            ppn,
            my_node,
            ordinal: my_index - first,
            node_members: (first..last).collect(),
            leaders: (0..member_cnt).step_by(ppn as usize).collect(),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.ordinal == 0
    }

    pub fn leader(&self) -> MemberIndex {
        self.node_members[0]
    }

    /// Members of an arbitrary node.
    pub fn members_of(&self, node: u64, member_cnt: u64) -> Vec<MemberIndex> {
        let first = node * self.ppn;
        let last = (first + self.ppn).min(member_cnt);
        (first..last).collect()
    }

    pub fn node_of(&self, member: MemberIndex) -> u64 {
        member / self.ppn
    }
}

pub fn create(ctx: &mut BuildCtx<'_>, _config: &Config, _params: &CollectiveParams) -> Result<Plan> {
    let n = ctx.member_count;
    let map = NodeMap::new(ctx.my_index, n, u64::from(ctx.topo.ppn.max(1)));
    let mut plan = Plan::new(ALGO_PLUMMER, ctx.my_index);
    let leader = map.is_leader();

    let gather_stages = [
        PlummerStage::GatherSendCounts,
        PlummerStage::GatherRecvCounts,
        PlummerStage::GatherSendBuffers,
    ];
    for stage in gather_stages {
        let step_index = plan.claim_steps(1)?;
        if map.node_members.len() < 2 {
            continue; // every member its own leader; nothing to gather
        }
        let mut phase = if leader {
            let mut peers = Vec::with_capacity(map.node_members.len() - 1);
            for m in &map.node_members[1..] {
                peers.push(ctx.connect(*m)?);
            }
            let range = plan.push_peers(peers);
            let mut ph = Phase::new(Method::PlummerIntra(stage), step_index, range);
            ph.ep_cnt = (map.node_members.len() - 1) as u8;
            ph
        } else {
            let pr = ctx.connect(map.leader())?;
            let range = plan.push_peers([pr]);
            Phase::new(Method::PlummerIntra(stage), step_index, range)
        };
        phase.remote_slot = map.ordinal as u32;
        plan.push_phase(phase)?;
    }

    // Inter-node exchange, leaders only.
    let step_index = plan.claim_steps(1)?;
    if leader && map.leaders.len() > 1 {
        let my = ctx.my_index;
        let mut peers = Vec::with_capacity(map.leaders.len() - 1);
        for l in map.leaders.iter().filter(|l| **l != my) {
            peers.push(ctx.connect(*l)?);
        }
        let range = plan.push_peers(peers);
        let mut phase = Phase::new(Method::PlummerInter, step_index, range);
        phase.ep_cnt = (map.leaders.len() - 1) as u8;
        plan.push_phase(phase)?;
    }

    // Scatter assembled receive images back to the node.
    let step_index = plan.claim_steps(1)?;
    if map.node_members.len() >= 2 {
        let mut phase = if leader {
            let mut peers = Vec::with_capacity(map.node_members.len() - 1);
            for m in &map.node_members[1..] {
                peers.push(ctx.connect(*m)?);
            }
            let range = plan.push_peers(peers);
            let mut ph = Phase::new(
                Method::PlummerIntra(PlummerStage::ScatterRecvBuffers),
                step_index,
                range,
            );
            ph.ep_cnt = (map.node_members.len() - 1) as u8;
            ph
        } else {
            let pr = ctx.connect(map.leader())?;
            let range = plan.push_peers([pr]);
            Phase::new(
                Method::PlummerIntra(PlummerStage::ScatterRecvBuffers),
                step_index,
                range,
            )
        };
        phase.remote_slot = map.ordinal as u32;
        plan.push_phase(phase)?;
    }

    plan.support_large_dtype = true;
    Ok(plan)
}
