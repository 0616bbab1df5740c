//! Plans, phases, and methods: the read-mostly output of plan construction.
//!
//! A [`Plan`] is the ordered phase list for one (algorithm, group) pair. It is
//! owned by the group, shared with every operation materialized from it via
//! `Rc`, and immutable after construction -- per-invocation state lives
//! exclusively in the op. Phases do not hold peer handles directly: they
//! carry index ranges into the plan-owned peer arena, so a phase stays a
//! small record and every peer handle lives exactly as long as the plan.

use crate::catalog::AlgoId;
use crate::error::{Error, Result};
use crate::host::MemberIndex;
use crate::transport::EpHandle;
use crate::wire::{StepIdx, StepIdxExt};
use serde::Serialize;
use std::fmt;
use std::ops::Range;

/// Upper bound on phases per plan.
pub const MAX_PHASES: usize = 32;

/// Stage of the two-level alltoallv protocol an intra-node phase drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlummerStage {
    GatherSendCounts,
    GatherRecvCounts,
    GatherSendBuffers,
    ScatterRecvBuffers,
}

/// The communication method applied at one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Method {
    /// Leaf: send the local contribution, receive nothing.
    SendTerminal,
    /// Sink: receive and overwrite, send nothing.
    RecvTerminal,
    /// Sink: receive and reduce, send nothing.
    ReduceTerminal,
    /// Exchange with the step's sub-group peers and reduce arrivals.
    ReduceRecursive,
    /// Ring step of the reduce-scatter half.
    ReduceScatterRing,
    /// Ring step of the allgather half.
    AllgatherRing,
    /// Tree interior on the fan-in side: receive children, reduce, forward.
    ReduceWaypoint,
    /// Tree interior on the fan-out side: receive from parent, forward.
    ScatterWaypoint,
    /// One round of the log-phase alltoall block exchange.
    BruckAlltoall,
    /// Leader-to-leader alltoallv of aggregated node data.
    PlummerInter,
    /// Intra-node stage of the two-level alltoallv.
    PlummerIntra(PlummerStage),
}

impl Method {
    /// Whether arrivals at this phase are combined with the reduction
    /// operator (as opposed to written verbatim).
    #[must_use]
    pub fn reduces(&self) -> bool {
        matches!(
            self,
            Method::ReduceTerminal
                | Method::ReduceRecursive
                | Method::ReduceScatterRing
                | Method::ReduceWaypoint
        )
    }

    /// Whether this phase both receives and forwards.
    #[must_use]
    pub fn is_waypoint(&self) -> bool {
        matches!(self, Method::ReduceWaypoint | Method::ScatterWaypoint)
    }
}

/// A peer entry in the plan's arena: the global member index and the endpoint
/// established to it at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanPeer {
    pub member: MemberIndex,
    pub ep: EpHandle,
}

/// One logical peer-communication step of a plan.
///
/// `peers` names the phase's primary peer set: send targets for fan-out
/// methods, expected sources for fan-in methods, the exchange partners for
/// recursive phases. `aux_peer` holds the second-direction peer of methods
/// whose source and destination differ -- the ring and bruck receive side, or
/// the forward target of a fan-in waypoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub method: Method,
    /// Number of sends the executor issues per fragment. Ring phases report 1
    /// even though two endpoints are stored.
    pub ep_cnt: u8,
    /// Primary peers, as a range into [`Plan::peers`].
    pub peers: Range<usize>,
    /// Second-direction peer, kept for threshold calibration and demux.
    pub aux_peer: Option<usize>,
    /// Demux key, assigned monotonically within the plan.
    pub step_index: StepIdx,
    /// Buffer-swap discipline before reduction, derived solely from the local
    /// index relative to the step's sub-group boundary.
    pub is_swap: bool,
    /// Staging ordinal at the receiving peer, for phases whose arrivals are
    /// parked per source (tree fan-in, intra-node gathers).
    pub remote_slot: u32,
}

impl Phase {
    /// A phase skeleton with the common defaults filled in.
    #[must_use]
    pub fn new(method: Method, step_index: StepIdx, peers: Range<usize>) -> Self {
        let ep_cnt = peers.len().max(1) as u8;
        Self {
            method,
            ep_cnt,
            peers,
            aux_peer: None,
            step_index,
            is_swap: false,
            remote_slot: 0,
        }
    }
}

/// An ordered phase list for one (algorithm, group) pair.
#[derive(Debug)]
pub struct Plan {
    pub algo: AlgoId,
    pub my_index: MemberIndex,
    pub phases: Vec<Phase>,
    /// Peer arena the phases index into.
    pub peers: Vec<PlanPeer>,
    /// Widened step counter; also the next step index a follow-on builder
    /// segment would be assigned. Advances on every rank, including ranks
    /// that skip the corresponding phases.
    pub step_cnt: StepIdxExt,
    /// Total endpoint count across phases. The collapsed `N = 2` ring phase
    /// counts a single endpoint.
    pub ep_cnt: usize,
    pub support_non_commutative: bool,
    pub support_large_dtype: bool,
}

impl Plan {
    /// Fresh, empty plan for the given algorithm and local member.
    #[must_use]
    pub fn new(algo: AlgoId, my_index: MemberIndex) -> Self {
        Self {
            algo,
            my_index,
            phases: Vec::new(),
            peers: Vec::new(),
            step_cnt: 0,
            ep_cnt: 0,
            support_non_commutative: false,
            support_large_dtype: false,
        }
    }

    /// Append peers to the arena, returning the range a phase should store.
    pub fn push_peers(&mut self, peers: impl IntoIterator<Item = PlanPeer>) -> Range<usize> {
        let start = self.peers.len();
        self.peers.extend(peers);
        self.ep_cnt += self.peers.len() - start;
        start..self.peers.len()
    }

    /// Append a single peer, returning its arena index.
    pub fn push_peer(&mut self, peer: PlanPeer) -> usize {
        self.peers.push(peer);
        self.ep_cnt += 1;
        self.peers.len() - 1
    }

    /// Append a phase, enforcing the phase budget.
    pub fn push_phase(&mut self, phase: Phase) -> Result<()> {
        if self.phases.len() >= MAX_PHASES {
            return Err(Error::InvalidParam(format!(
                "plan exceeds {MAX_PHASES} phases"
            )));
        }
        self.phases.push(phase);
        Ok(())
    }

    /// Claim the next `n` step indices, verifying they fit the wire field.
    /// Step indices that would not fit the 8-bit header field are a
    /// construction error, never a silent truncation.
    pub fn claim_steps(&mut self, n: StepIdxExt) -> Result<StepIdx> {
        let first = self.step_cnt;
        let end = first
            .checked_add(n)
            .ok_or_else(|| Error::InvalidParam("step index overflow".into()))?;
        if end > StepIdxExt::from(StepIdx::MAX) + 1 {
            return Err(Error::InvalidParam(format!(
                "step index {end} exceeds the wire format"
            )));
        }
        self.step_cnt = end;
        Ok(first as StepIdx)
    }

    /// Resolve a phase's primary peers.
    #[must_use]
    pub fn phase_peers(&self, phase: &Phase) -> &[PlanPeer] {
        &self.peers[phase.peers.clone()]
    }

    /// Resolve a phase's second-direction peer, falling back to the first
    /// primary peer for phases where both directions coincide.
    #[must_use]
    pub fn aux_peer(&self, phase: &Phase) -> Option<&PlanPeer> {
        phase
            .aux_peer
            .map(|i| &self.peers[i])
            .or_else(|| self.phase_peers(phase).first())
    }

    /// Structural equality: same phase sequence, methods, peer indices, and
    /// step indices. Used by the cache idempotence law.
    #[must_use]
    pub fn same_structure(&self, other: &Plan) -> bool {
        self.algo == other.algo
            && self.phases == other.phases
            && self.peers == other.peers
            && self.step_cnt == other.step_cnt
    }

    /// Introspection summary of the built plan.
    #[must_use]
    pub fn explain(&self) -> PlanExplanation {
        PlanExplanation {
            algo: self.algo,
            my_index: self.my_index,
            step_cnt: self.step_cnt,
            ep_cnt: self.ep_cnt,
            phases: self
                .phases
                .iter()
                .map(|ph| PhaseSummary {
                    step: ph.step_index,
                    method: ph.method,
                    ep_cnt: ph.ep_cnt,
                    peers: self.phase_peers(ph).iter().map(|p| p.member).collect(),
                    aux_peer: ph.aux_peer.map(|i| self.peers[i].member),
                    is_swap: ph.is_swap,
                })
                .collect(),
        }
    }
}

/// Serializable, printable description of a plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanExplanation {
    pub algo: AlgoId,
    pub my_index: MemberIndex,
    pub step_cnt: StepIdxExt,
    pub ep_cnt: usize,
    pub phases: Vec<PhaseSummary>,
}

/// One phase in a [`PlanExplanation`].
#[derive(Debug, Clone, Serialize)]
pub struct PhaseSummary {
    pub step: StepIdx,
    pub method: Method,
    pub ep_cnt: u8,
    pub peers: Vec<MemberIndex>,
    pub aux_peer: Option<MemberIndex>,
    pub is_swap: bool,
}

impl PlanExplanation {
    /// JSON rendering of the explanation.
    ///
    /// # Errors
    ///
    /// If serialization fails.
    #[cfg(feature = "explain")]
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for PlanExplanation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "plan algo={} member={} steps={} eps={}",
            self.algo, self.my_index, self.step_cnt, self.ep_cnt
        )?;
        for ph in &self.phases {
            writeln!(
                f,
                "  step {:>3}  {:<26} eps={} peers={:?} aux={:?} swap={}",
                ph.step,
                format!("{:?}", ph.method),
                ph.ep_cnt,
                ph.peers,
                ph.aux_peer,
                ph.is_swap
            )?;
        }
        Ok(())
    }
}
