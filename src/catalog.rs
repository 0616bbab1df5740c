//! The process-wide plan catalog.
//!
//! Algorithm builders register themselves here, keyed by
//! `(collective type, algorithm id)`. The registry is assembled once at first
//! use and read-only afterwards; groups consult [`select`] to pick a builder
//! for each invocation. Selection order: explicit configuration override,
//! then topology-aware candidates, then recursive K-ing, then ring.

use crate::builders;
use crate::coll::CollType;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::group::TopoSummary;
use std::sync::LazyLock;

/// Identifier of a registered algorithm, unique per collective type.
pub type AlgoId = u16;

/// Recursive K-ing (barrier, allreduce).
pub const ALGO_RECURSIVE: AlgoId = 1;
/// Ring reduce-scatter + allgather (allreduce).
pub const ALGO_RING: AlgoId = 2;
/// Binomial tree (bcast, reduce).
pub const ALGO_TREE: AlgoId = 3;
/// Bruck log-phase exchange (alltoall).
pub const ALGO_BRUCK: AlgoId = 4;
/// Two-level leader-aggregated exchange (alltoallv).
pub const ALGO_PLUMMER: AlgoId = 5;

/// A registered algorithm: its key and the builder that synthesizes plans.
pub struct AlgoEntry {
    pub coll: CollType,
    pub algo: AlgoId,
    pub name: &'static str,
    pub build: builders::BuilderFn,
}

/// Registration shorthand used by the builder modules.
macro_rules! register_algo {
    ($coll:expr, $algo:expr, $name:literal, $build:path) => {
        AlgoEntry { coll: $coll, algo: $algo, name: $name, build: $build }
    };
}

static CATALOG: LazyLock<Vec<AlgoEntry>> = LazyLock::new(|| {
    vec![
        register_algo!(
            CollType::Barrier,
            ALGO_RECURSIVE,
            "barrier_recursive",
            builders::recursive::create
        ),
        register_algo!(
            CollType::Allreduce,
            ALGO_RECURSIVE,
            "allreduce_recursive",
            builders::recursive::create
        ),
        register_algo!(
            CollType::Allreduce,
            ALGO_RING,
            "allreduce_ring",
            builders::ring::create
        ),
        register_algo!(
            CollType::Bcast,
            ALGO_TREE,
            "bcast_binomial",
            builders::tree::create_bcast
        ),
        register_algo!(
            CollType::Reduce,
            ALGO_TREE,
            "reduce_binomial",
            builders::tree::create_reduce
        ),
        register_algo!(
            CollType::Alltoall,
            ALGO_BRUCK,
            "alltoall_bruck",
            builders::bruck::create
        ),
        register_algo!(
            CollType::Alltoallv,
            ALGO_PLUMMER,
            "alltoallv_plummer",
            builders::plummer::create
        ),
    ]
});

/// Look up a specific registered algorithm.
pub fn find(coll: CollType, algo: AlgoId) -> Result<&'static AlgoEntry> {
    CATALOG
        .iter()
        .find(|e| e.coll == coll && e.algo == algo)
        .ok_or_else(|| Error::InvalidParam(format!("no algorithm {algo} for {coll:?}")))
}

/// Inputs algorithm selection consults beyond the collective type itself.
pub struct SelectInput<'a> {
    pub member_count: u64,
    pub topo: &'a TopoSummary,
    pub msg_bytes: usize,
    pub op_commutes: bool,
    /// Predefined `(op, dtype)` tags, when the host has them; switch offload
    /// is only negotiable for tagged pairs.
    pub operate_tags: Option<(u16, u16)>,
}

fn override_for(config: &Config, coll: CollType) -> Option<AlgoId> {
    match coll {
        CollType::Barrier => config.algo.barrier,
        CollType::Bcast => config.algo.bcast,
        CollType::Reduce => config.algo.reduce,
        CollType::Allreduce => config.algo.allreduce,
        CollType::Alltoall => config.algo.alltoall,
        CollType::Alltoallv => config.algo.alltoallv,
    }
}

/// Pick the algorithm for one invocation.
///
/// Consults, in order: the explicit configuration override, topology-aware
/// candidates (multi-node, balanced placement), recursive K-ing, and finally
/// ring. INC availability would insert an offload candidate ahead of the
/// recursive tier; with offload disabled the chain skips straight through.
///
/// # Errors
///
/// `InvalidParam` when an explicit override names an algorithm that is not
/// registered for the collective type.
pub fn select<'a>(
    config: &Config,
    coll: CollType,
    input: &SelectInput<'a>,
) -> Result<&'static AlgoEntry> {
    if let Some(algo) = override_for(config, coll) {
        return find(coll, algo);
    }

    let algo = match coll {
        CollType::Barrier => ALGO_RECURSIVE,
        CollType::Bcast | CollType::Reduce => ALGO_TREE,
        CollType::Alltoall => ALGO_BRUCK,
        CollType::Alltoallv => ALGO_PLUMMER,
        CollType::Allreduce => {
            // Ring amortizes bandwidth for large commutative payloads; the
            // recursive plan is the only one that preserves operator order,
            // degrades more gracefully on unbalanced placements, and has the
            // fixed step shape the switch-offload fast path requires.
            let small = input.msg_bytes <= config.large_thresh;
            let unbalanced = !input.topo.ppn_balanced;
            let tiny_pow2 = input.member_count.is_power_of_two() && input.member_count <= 4;
            let offload = config.inc_enable && input.operate_tags.is_some();
            if !input.op_commutes || small || unbalanced || tiny_pow2 || offload {
                ALGO_RECURSIVE
            } else {
                ALGO_RING
            }
        }
    };
    find(coll, algo)
}

/// All registered entries, for introspection.
pub fn entries() -> impl Iterator<Item = &'static AlgoEntry> {
    CATALOG.iter()
}
