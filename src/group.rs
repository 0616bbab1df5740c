//! Group context and the worker that progresses it.
//!
//! A [`Group`] owns everything one communicator needs: identity, member
//! count and index, a topology summary, the lazily populated endpoint
//! table, the plan cache, the completion-slot window, and the in-flight
//! FIFO. A [`Worker`] composes a transport handle with the set of groups
//! living on it and routes inbound frames to the right group by the wire
//! header's group id -- the engine extends the transport's worker by
//! composition, never by aliasing its types.
//!
//! Everything here is single-threaded cooperative: all progress for a group
//! happens on the thread that owns its worker, so the fast path takes no
//! locks. Workers on distinct threads progress independently.

use crate::cache::PlanCache;
use crate::catalog::{self, SelectInput};
use crate::coll::CollectiveParams;
use crate::config::Config;
use crate::demux::{CompSlot, NUM_SLOTS};
use crate::error::{Error, Result};
use crate::exec::{self, Accept, ActiveReq};
use crate::host::{Distance, HostOps, MemberIndex};
use crate::listener;
use crate::op::{self, Op};
use crate::transport::{AddressResolver, EpHandle, TransportRef};
use crate::wire::{AmId, CollId, GroupId, Header};
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

/// Placeholder member index for groups whose membership arrives later via
/// the bootstrap listener's group-info broadcast.
pub const MEMBER_PENDING: MemberIndex = MemberIndex::MAX;

/// Compact summary of where the group's members sit relative to each other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopoSummary {
    /// Members per node.
    pub ppn: u16,
    /// Members per socket.
    pub pps: u16,
    pub node_count: u16,
    pub ppn_balanced: bool,
    pub pps_balanced: bool,
    pub ranks_contiguous: bool,
}

impl TopoSummary {
    /// Evenly laid out group: `ppn` members per node, contiguous ranks.
    #[must_use]
    pub fn uniform(member_count: MemberIndex, ppn: u16) -> Self {
        let ppn = ppn.max(1);
        Self {
            ppn,
            pps: ppn,
            node_count: member_count.div_ceil(u64::from(ppn)) as u16,
            ppn_balanced: member_count % u64::from(ppn) == 0,
            pps_balanced: true,
            ranks_contiguous: true,
        }
    }

    /// Everyone on one node.
    #[must_use]
    pub fn single_node(member_count: MemberIndex) -> Self {
        Self::uniform(member_count, member_count.max(1) as u16)
    }

    /// Derive a summary by probing the host's distance oracle: the members
    /// closer than [`Distance::Net`] to member 0 form the first node.
    #[must_use]
    pub fn from_host(host: &dyn HostOps, member_count: MemberIndex) -> Self {
        let ppn = (0..member_count)
            .take_while(|m| host.rank_distance(0, *m) < Distance::Net)
            .count()
            .max(1) as u16;
        Self::uniform(member_count, ppn)
    }

    #[must_use]
    pub fn multi_node(&self) -> bool {
        self.node_count > 1
    }
}

/// Everything needed to create a group.
#[derive(Clone)]
pub struct GroupParams {
    /// 16-bit group identity, unique within the process.
    pub id: GroupId,
    pub member_count: MemberIndex,
    /// This process's index, or [`MEMBER_PENDING`] when membership will be
    /// delivered by the bootstrap listener.
    pub member_index: MemberIndex,
    pub topo: TopoSummary,
    pub host: Rc<dyn HostOps>,
    pub resolver: Rc<dyn AddressResolver>,
}

/// Lazily populated member-index -> endpoint table. Lookups are idempotent:
/// a member maps to at most one endpoint for the group's lifetime.
pub(crate) struct EndpointTable {
    eps: Vec<Option<EpHandle>>,
}

impl EndpointTable {
    pub(crate) fn new(member_count: MemberIndex) -> Self {
        Self { eps: vec![None; member_count as usize] }
    }

    pub(crate) fn lookup(
        &mut self,
        transport: &TransportRef,
        resolver: &Rc<dyn AddressResolver>,
        member: MemberIndex,
    ) -> Result<EpHandle> {
        let at = member as usize;
        if at >= self.eps.len() {
            self.eps.resize(at + 1, None);
        }
        if let Some(ep) = self.eps[at] {
            return Ok(ep);
        }
        let addr = resolver
            .resolve(member)
            .map_err(|_| Error::Unreachable(member))?;
        let ep = transport.connect(&addr)?;
        resolver.release(addr);
        trace!("member {member} connected");
        self.eps[at] = Some(ep);
        Ok(ep)
    }
}

/// Shared view of one request's externally visible state.
pub struct RequestState {
    pub(crate) status: Option<Result<()>>,
    pub(crate) cancel_requested: bool,
    pub(crate) coll_id: CollId,
}

/// Caller-side handle to an in-flight collective.
pub struct RequestHandle {
    state: Rc<RefCell<RequestState>>,
}

impl RequestHandle {
    /// Non-blocking status probe: `InProgress` until a terminal status has
    /// been set, then that status on every subsequent call.
    pub fn check_status(&self) -> Result<()> {
        match &self.state.borrow().status {
            None => Err(Error::InProgress),
            Some(s) => s.clone(),
        }
    }

    /// Mark the request cancelled; the executor unwinds it on the owning
    /// worker's next progress tick.
    pub fn cancel(&self) {
        self.state.borrow_mut().cancel_requested = true;
    }

    #[must_use]
    pub fn coll_id(&self) -> CollId {
        self.state.borrow().coll_id
    }
}

/// Handle to a materialized (and possibly persistent) collective.
#[derive(Debug, Clone)]
pub struct CollHandle {
    pub(crate) group: GroupId,
    pub(crate) index: usize,
}

/// Home of a materialized op between invocations. `op` is `None` while the
/// op occupies a completion slot.
pub(crate) struct OpSlot {
    pub op: Option<Op>,
    pub persistent: bool,
}

/// Per-send context handed to the executor.
pub(crate) struct ExecCtx {
    pub transport: TransportRef,
    pub host: Rc<dyn HostOps>,
    pub config: Rc<Config>,
    pub group_id: GroupId,
    pub am_id: AmId,
}

/// One process group: membership, endpoints, plans, and the in-flight
/// window.
pub struct Group {
    pub(crate) params: GroupParams,
    pub(crate) eps: EndpointTable,
    pub(crate) cache: PlanCache,
    pub(crate) slots: Vec<CompSlot>,
    pub(crate) ops: Vec<OpSlot>,
    pub(crate) next_coll_id: CollId,
    /// Start order; completions fire strictly in this order.
    pub(crate) fifo: VecDeque<CollId>,
    pub(crate) membership_pending: bool,
}

impl Group {
    fn new(params: GroupParams, config: &Config) -> Self {
        let membership_pending = params.member_index == MEMBER_PENDING;
        let member_count = params.member_count;
        Self {
            params,
            eps: EndpointTable::new(member_count),
            cache: PlanCache::new(config.cache_enable),
            slots: (0..NUM_SLOTS).map(|_| CompSlot::default()).collect(),
            ops: Vec::new(),
            next_coll_id: 0,
            fifo: VecDeque::new(),
            membership_pending,
        }
    }

    #[must_use]
    pub fn id(&self) -> GroupId {
        self.params.id
    }

    #[must_use]
    pub fn member_count(&self) -> MemberIndex {
        self.params.member_count
    }

    #[must_use]
    pub fn member_index(&self) -> MemberIndex {
        self.params.member_index
    }

    /// Number of collectives currently in flight.
    #[must_use]
    pub fn inflight(&self) -> usize {
        self.fifo.len()
    }

    #[must_use]
    pub fn cached_plans(&self) -> usize {
        self.cache.len()
    }

    /// Route one inbound data frame into the window.
    fn handle_frame(&mut self, ctx: &ExecCtx, header: Header, payload: &[u8]) {
        let slot = &mut self.slots[header.coll_id as usize % NUM_SLOTS];
        let decision = match &slot.active {
            Some(req) if req.coll_id == header.coll_id => exec::classify(req, &header),
            _ if slot.last_done == Some(header.coll_id) => Accept::Stale,
            _ => Accept::Early,
        };
        match decision {
            Accept::Match => {
                let req = slot.active.as_mut().expect("matched slot has a request");
                if let Err(e) = exec::on_payload(req, ctx, header, payload) {
                    req.done = Some(Err(e));
                }
                pump_slot(slot, ctx);
            }
            Accept::Early => slot.park(header, payload),
            Accept::Stale => slot.drop_stale(header, payload.len()),
        }
        self.fire_completions();
    }

    /// Fire user completions in start (FIFO) order. An op that finished
    /// executing ahead of an older sibling waits in its slot until the
    /// sibling completes.
    fn fire_completions(&mut self) -> usize {
        let mut fired = 0;
        while let Some(&front) = self.fifo.front() {
            let slot = &mut self.slots[front as usize % NUM_SLOTS];
            let ready = slot
                .active
                .as_ref()
                .is_some_and(|r| r.coll_id == front && r.done.is_some());
            if !ready {
                break;
            }
            let req = slot.active.take().expect("checked above");
            slot.last_done = Some(front);
            // Drop any stale tail parked for this collective.
            slot.early.retain(|d| d.header.coll_id != front);
            let ActiveReq { op, store_idx, user, done, .. } = req;
            let status = done.expect("terminal");
            if self.ops[store_idx].persistent && status.is_ok() {
                self.ops[store_idx].op = Some(op);
            }
            // A dropped op releases its registrations here.
            user.borrow_mut().status = Some(status);
            self.fifo.pop_front();
            fired += 1;
            debug!("coll {front} completion fired");
        }
        fired
    }

    /// Per-tick housekeeping: cancellations and parked resends.
    fn drive(&mut self, ctx: &ExecCtx) -> usize {
        let mut work = 0;
        for slot in &mut self.slots {
            let cancel = slot
                .active
                .as_ref()
                .is_some_and(|r| r.done.is_none() && r.user.borrow().cancel_requested);
            if cancel {
                exec::cancel(slot.active.as_mut().expect("checked above"));
                slot.drain_early();
                work += 1;
                continue;
            }
            if slot.active.as_ref().is_some_and(|r| r.resend) {
                pump_slot(slot, ctx);
                work += 1;
            }
        }
        work + self.fire_completions()
    }
}

/// Drive a slot's request to quiescence, draining parked arrivals as the
/// step machine becomes willing to accept them.
fn pump_slot(slot: &mut CompSlot, ctx: &ExecCtx) {
    let CompSlot { active, early, pool, .. } = slot;
    let Some(req) = active.as_mut() else { return };
    loop {
        if let Err(e) = exec::advance(req, ctx) {
            req.done = Some(Err(e));
        }
        if req.done.is_some() || req.resend {
            return;
        }
        let Some(lid) = req.local_id() else { return };
        let Some(at) = early.iter().position(|d| d.header.local_id() == lid) else {
            return;
        };
        if exec::classify(req, &early[at].header) != Accept::Match {
            return;
        }
        let desc = early.swap_remove(at);
        if let Err(e) = exec::on_payload(req, ctx, desc.header, &desc.data) {
            req.done = Some(Err(e));
        }
        pool.put(desc.data);
    }
}

/// The engine-side extension of a transport worker: the set of groups
/// sharing one progress context, plus the configuration and active-message
/// id range they consume.
pub struct Worker {
    transport: TransportRef,
    config: Rc<Config>,
    /// First id of the consumed range; reserved for the bootstrap
    /// listener's group-info broadcast. Data frames ride the next id.
    base_am_id: AmId,
    groups: HashMap<GroupId, Group>,
}

impl Worker {
    #[must_use]
    pub fn new(transport: TransportRef, config: Config, base_am_id: AmId) -> Self {
        Self {
            transport,
            config: Rc::new(config),
            base_am_id,
            groups: HashMap::new(),
        }
    }

    #[must_use]
    pub fn data_am_id(&self) -> AmId {
        self.base_am_id.wrapping_add(1)
    }

    /// Create a group on this worker.
    ///
    /// # Errors
    ///
    /// `InvalidParam` when the group id is already taken.
    pub fn create_group(&mut self, params: GroupParams) -> Result<GroupId> {
        let id = params.id;
        if self.groups.contains_key(&id) {
            return Err(Error::InvalidParam(format!("group id {id} already exists")));
        }
        debug!(
            "group {id} created: member {}/{}",
            params.member_index, params.member_count
        );
        self.groups.insert(id, Group::new(params, &self.config));
        Ok(id)
    }

    /// Tear a group down, dropping its plans, cache, and endpoints.
    pub fn destroy_group(&mut self, id: GroupId) {
        if let Some(mut group) = self.groups.remove(&id) {
            group.cache.flush();
        }
    }

    #[must_use]
    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(&id)
    }

    /// The plan behind a materialized collective, for introspection and
    /// tests. `None` while the collective is in flight.
    #[must_use]
    pub fn plan(&self, handle: &CollHandle) -> Option<Rc<crate::plan::Plan>> {
        let op = self
            .groups
            .get(&handle.group)?
            .ops
            .get(handle.index)?
            .op
            .as_ref()?;
        Some(Rc::clone(&op.plan))
    }

    /// Replace a group's topology summary after a reconfiguration; cached
    /// plans embed peer choices, so the cache is flushed whole.
    pub fn reconfigure_topology(&mut self, id: GroupId, topo: TopoSummary) -> Result<()> {
        let group = self
            .groups
            .get_mut(&id)
            .ok_or_else(|| Error::NoElement(format!("group {id}")))?;
        group.params.topo = topo;
        group.cache.flush();
        Ok(())
    }

    /// Plan and materialize a collective: select the algorithm, probe the
    /// plan cache (building and caching on a miss), and bind the plan to
    /// this invocation's buffers and transport tiers.
    pub fn collective_create(
        &mut self,
        gid: GroupId,
        params: CollectiveParams,
    ) -> Result<CollHandle> {
        let group = self
            .groups
            .get_mut(&gid)
            .ok_or_else(|| Error::NoElement(format!("group {gid}")))?;
        if group.membership_pending {
            return Err(Error::InvalidParam(
                "group membership has not arrived yet".into(),
            ));
        }
        let host = Rc::clone(&group.params.host);
        let op_commutes = params.op.is_none_or(|o| host.op_is_commute(o));
        let entry = catalog::select(
            &self.config,
            params.coll_type,
            &SelectInput {
                member_count: group.params.member_count,
                topo: &group.params.topo,
                msg_bytes: params.send_bytes(&*host),
                op_commutes,
                operate_tags: params
                    .op
                    .and_then(|o| host.operate_param(o, params.send.dtype)),
            },
        )?;

        let sig = params.signature();
        let plan = if let Some(plan) = group.cache.find(entry.algo, &sig) {
            trace!("plan cache hit for {}", entry.name);
            plan
        } else {
            let mut bctx = crate::builders::BuildCtx {
                my_index: group.params.member_index,
                member_count: group.params.member_count,
                topo: &group.params.topo,
                eps: &mut group.eps,
                transport: &self.transport,
                resolver: &group.params.resolver,
            };
            let plan = Rc::new((entry.build)(&mut bctx, &self.config, &params)?);
            debug!(
                "built {} plan: {} phases, {} steps",
                entry.name,
                plan.phases.len(),
                plan.step_cnt
            );
            group.cache.update(entry.algo, sig, &plan);
            plan
        };

        let op = op::materialize(
            plan,
            params,
            group.params.member_count,
            &group.params.topo,
            &*host,
            &self.transport,
            &self.config,
        )?;
        group.ops.push(OpSlot { persistent: op.persistent, op: Some(op) });
        Ok(CollHandle { group: gid, index: group.ops.len() - 1 })
    }

    /// Start a materialized collective.
    ///
    /// # Errors
    ///
    /// `InProgress` when the handle is already active or when the window of
    /// [`NUM_SLOTS`] concurrent collectives is full -- progress the worker
    /// and retry. Other errors mean the start failed outright.
    pub fn collective_start(&mut self, handle: &CollHandle) -> Result<RequestHandle> {
        let am_id = self.data_am_id();
        let group = self
            .groups
            .get_mut(&handle.group)
            .ok_or_else(|| Error::NoElement(format!("group {}", handle.group)))?;

        let coll_id = group.next_coll_id;
        let slot_idx = coll_id as usize % NUM_SLOTS;
        if group.slots[slot_idx].active.is_some() {
            // Window full: the slot for this id is still occupied.
            return Err(Error::InProgress);
        }
        let op = group
            .ops
            .get_mut(handle.index)
            .ok_or_else(|| Error::NoElement("collective handle".into()))?
            .op
            .take()
            .ok_or(Error::InProgress)?;

        group.next_coll_id = group.next_coll_id.wrapping_add(1);
        let state = Rc::new(RefCell::new(RequestState {
            status: None,
            cancel_requested: false,
            coll_id,
        }));
        let mut req = ActiveReq::new(coll_id, op, handle.index, Rc::clone(&state));
        let ctx = ExecCtx {
            transport: Rc::clone(&self.transport),
            host: Rc::clone(&group.params.host),
            config: Rc::clone(&self.config),
            group_id: handle.group,
            am_id,
        };
        trace!("coll {coll_id} started on group {}", handle.group);
        if let Err(e) = exec::start(&mut req, &ctx) {
            req.done = Some(Err(e));
        }
        group.fifo.push_back(coll_id);
        group.slots[slot_idx].active = Some(req);
        pump_slot(&mut group.slots[slot_idx], &ctx);
        group.fire_completions();
        Ok(RequestHandle { state })
    }

    /// Drain the transport, route frames, and drive every group forward.
    /// Returns the number of completed work units.
    pub fn progress(&mut self) -> usize {
        let mut work = 0;
        let transport = Rc::clone(&self.transport);
        let am_data = self.data_am_id();
        while let Some(frame) = transport.poll() {
            work += 1;
            if frame.am_id == self.base_am_id {
                listener::handle_info_frame(&mut self.groups, &frame.data);
                continue;
            }
            if frame.data.len() < 8 {
                warn!("runt frame dropped ({} bytes)", frame.data.len());
                continue;
            }
            let header = Header::unpack(u64::from_ne_bytes(frame.data[..8].try_into().unwrap()));
            let Some(group) = self.groups.get_mut(&header.group_id) else {
                warn!("fragment for unknown group {} dropped", header.group_id);
                continue;
            };
            let ctx = ExecCtx {
                transport: Rc::clone(&transport),
                host: Rc::clone(&group.params.host),
                config: Rc::clone(&self.config),
                group_id: header.group_id,
                am_id: am_data,
            };
            group.handle_frame(&ctx, header, &frame.data[8..]);
        }
        for (gid, group) in &mut self.groups {
            let ctx = ExecCtx {
                transport: Rc::clone(&transport),
                host: Rc::clone(&group.params.host),
                config: Rc::clone(&self.config),
                group_id: *gid,
                am_id: am_data,
            };
            work += group.drive(&ctx);
        }
        work
    }

    /// Send the group-info broadcast to every other member, the way the
    /// bootstrap listener's owner announces final membership.
    pub fn broadcast_group_info(&mut self, gid: GroupId) -> Result<()> {
        let transport = Rc::clone(&self.transport);
        let base = self.base_am_id;
        let group = self
            .groups
            .get_mut(&gid)
            .ok_or_else(|| Error::NoElement(format!("group {gid}")))?;
        listener::broadcast_info(group, &transport, base)
    }
}
