//! # Convene
//!
//! A **collective-operation planning and execution engine** for group
//! communication runtimes. Convene sits above a point-to-point
//! active-message transport (short/bcopy/zcopy sends, endpoints, a progress
//! function) and implements MPI-style collectives -- barrier, broadcast,
//! reduce, all-reduce, alltoall, alltoallv -- over arbitrary process groups.
//!
//! ## Key Features
//!
//! - **Plan construction** - per-algorithm builders synthesize an ordered
//!   phase list naming the local process's peers and method at every step
//! - **Algorithm catalog** - recursive K-ing, ring reduce-scatter/allgather,
//!   binomial trees, bruck alltoall, and two-level leader-aggregated
//!   alltoallv, selected by configuration, message size, and topology
//! - **Plan caching** - identical invocations reuse the same immutable plan
//! - **Operation materialization** - plans bind to concrete buffers with
//!   per-step transport tiers, fragmentation, and zero-copy registration
//! - **Step execution** - a compact state machine drives sends, matches
//!   inbound fragments, reduces on arrival (with non-commutative swap
//!   discipline), pipelines fragments, and replays retryable send failures
//! - **Message demux** - a 16-slot window multiplexes concurrent
//!   collectives and parks early arrivals until the local side catches up
//!
//! ## Quick Start
//!
//! ```no_run
//! use convene::*;
//! use convene::testing::{i32_buf, i32_zeroed, read_i32, Cluster, TEST_GROUP};
//! # use anyhow::Result;
//!
//! # fn main() -> Result<()> {
//! // Four ranks over the in-memory loopback fabric.
//! let mut cluster = Cluster::new(4);
//!
//! let recvs: Vec<_> = (0..4).map(|_| i32_zeroed(4)).collect();
//! let bufs: Vec<_> = (0..4).map(|_| i32_buf(&[1, 2, 3, 4])).collect();
//!
//! // Start the same allreduce on every rank and pump to completion.
//! let handles = (0..4u64)
//!     .map(|r| {
//!         cluster.worker(r).collective_create(
//!             TEST_GROUP,
//!             CollectiveParams::allreduce(
//!                 bufs[r as usize].clone(),
//!                 recvs[r as usize].clone(),
//!                 4,
//!                 DT_I32,
//!                 OP_SUM,
//!             ),
//!         )
//!     })
//!     .collect::<Result<Vec<_>, _>>()?;
//! let reqs = cluster.start_all(&handles)?;
//! cluster.pump_until(&reqs)?;
//!
//! assert_eq!(read_i32(&recvs[0]), vec![4, 8, 12, 16]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! - **`Worker`** - the engine-side extension of a transport worker; owns
//!   groups, routes inbound frames, and drives all progress cooperatively
//!   on the owning thread
//! - **`Group`** - one communicator: membership, endpoint table, plan
//!   cache, and the in-flight window of at most 16 concurrent collectives
//! - **`Plan`** - the ordered phase list for one (algorithm, group) pair;
//!   immutable and shared, with peers held in a plan-owned arena
//! - **`CollHandle`** - a materialized invocation; persistent handles are
//!   restartable and keep their zero-copy registrations warm
//! - **`RequestHandle`** - non-blocking status probe and cancellation for
//!   one in-flight collective
//!
//! ## Architecture
//!
//! Convene uses a **plan / op / step** split:
//! 1. The [`catalog`] picks an algorithm for the invocation
//! 2. A [`builders`] entry synthesizes (or the group cache replays) a plan
//! 3. The op materializer binds the plan to buffers, tiers, and fragments
//! 4. The executor advances step state machines as the worker progresses,
//!    fed by the demux window routing `(group, coll, step)`-tagged frames
//!
//! The host runtime plugs in through two seams: [`Transport`] (the wire)
//! and [`HostOps`] (datatypes, reduction operators, topology distance).
//! [`host::PredefinedHost`] ships built-in implementations of both sides'
//! basics so the engine runs -- and is tested -- standalone.
//!
//! ## Module Overview
//!
//! - [`group`] - groups, workers, requests, endpoint tables
//! - [`catalog`] - algorithm registry and selection
//! - [`builders`] - plan builders per algorithm family
//! - [`plan`] - plans, phases, methods, introspection
//! - [`coll`] - collective invocation parameters
//! - [`host`] - the host-collaborator contract and built-ins
//! - [`transport`] - the transport capability set
//! - [`wire`] - the 64-bit fragment header
//! - [`config`] - engine tuning knobs
//! - [`error`] - error kinds
//! - [`testing`] - loopback fabric and multi-rank test harness

pub mod builders;
pub mod catalog;
pub mod coll;
pub mod config;
pub mod error;
pub mod group;
pub mod host;
pub mod plan;
pub mod testing;
pub mod transport;
pub mod wire;

mod cache;
mod demux;
mod exec;
mod listener;
mod op;

// General re-exports
pub use catalog::{AlgoId, ALGO_BRUCK, ALGO_PLUMMER, ALGO_RECURSIVE, ALGO_RING, ALGO_TREE};
pub use coll::{shared_buf, BufferSpec, CollType, CollectiveParams, Counts, SharedBuf};
pub use config::Config;
pub use demux::NUM_SLOTS;
pub use error::{Error, Result};
pub use group::{
    CollHandle, Group, GroupParams, RequestHandle, TopoSummary, Worker, MEMBER_PENDING,
};
pub use host::{
    Distance, DtInfo, HostOps, MemberIndex, PredefinedHost, DT_F64, DT_I32, DT_I32_STRIDED,
    DT_I64, DT_MAT2, DT_U64, OP_MATMUL, OP_MAX, OP_MIN, OP_PROD, OP_SUM,
};
pub use plan::{Method, Phase, Plan, PlanExplanation, PlummerStage, MAX_PHASES};
pub use transport::{AddressResolver, EpHandle, MemHandle, Transport, TransportCaps};
pub use wire::{AmId, CollId, GroupId, Header, StepIdx};
