//! Plan builders.
//!
//! Every registered algorithm lives in a submodule and exposes a `create`
//! function with the [`BuilderFn`] signature. Builders share a contract:
//!
//! - **Full vs partial build.** A full build spans the whole group; a partial
//!   build receives an explicit member list (hierarchical intra/inter
//!   sub-groups). The local builder index is the member's position in that
//!   list; a member absent from the list produces an empty plan whose step
//!   counter is still advanced, so step indices agree across every rank.
//! - Peers are connected through [`BuildCtx::connect`] as phases are
//!   populated; builder-local indices are translated back through the member
//!   list before they are stored, so stored peers are always globally
//!   addressable.
//! - Any failure frees the partially built plan (builders return `Result`
//!   and the plan is dropped on the error path).

use crate::error::Result;
use crate::group::{EndpointTable, TopoSummary};
use crate::host::MemberIndex;
use crate::plan::{Plan, PlanPeer};
use crate::transport::{AddressResolver, TransportRef};
use crate::{coll::CollectiveParams, config::Config};
use std::rc::Rc;

pub mod bruck;
pub mod plummer;
pub mod recursive;
pub mod ring;
pub mod tree;

/// Group-context view handed to builders: identity plus the endpoint table
/// peers are connected through.
pub struct BuildCtx<'g> {
    pub my_index: MemberIndex,
    pub member_count: MemberIndex,
    pub topo: &'g TopoSummary,
    pub(crate) eps: &'g mut EndpointTable,
    pub(crate) transport: &'g TransportRef,
    pub(crate) resolver: &'g Rc<dyn AddressResolver>,
}

impl<'g> BuildCtx<'g> {
    /// Establish (or look up) the endpoint to a group member and record it in
    /// the plan's arena form. Lookups are idempotent: the same member always
    /// yields the same handle.
    pub fn connect(&mut self, member: MemberIndex) -> Result<PlanPeer> {
        let ep = self
            .eps
            .lookup(self.transport, self.resolver, member)?;
        Ok(PlanPeer { member, ep })
    }
}

/// Signature every registered plan builder implements.
pub type BuilderFn = fn(&mut BuildCtx<'_>, &Config, &CollectiveParams) -> Result<Plan>;

/// The identity member list used by full builds.
pub(crate) fn identity_members(member_cnt: MemberIndex) -> Vec<MemberIndex> {
    (0..member_cnt).collect()
}

/// Position of the local member within a build's member list, or `None` when
/// this rank sits outside the sub-group.
pub(crate) fn local_index(my_index: MemberIndex, member_list: &[MemberIndex]) -> Option<usize> {
    member_list.iter().position(|m| *m == my_index)
}
