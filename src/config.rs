//! Engine configuration.
//!
//! A [`Config`] is attached to a worker at creation time and consulted by the
//! plan catalog (algorithm overrides, message-size cutoffs), the plan builders
//! (recursive factor), and the op materializer (pipelining, optimization
//! countdown, transport-cap clamps). All fields have sensible defaults; the
//! struct derives serde so deployments can load it from whatever format the
//! host application prefers.

use crate::catalog::AlgoId;
use serde::{Deserialize, Serialize};

/// Recursive K-ing tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecursiveConfig {
    /// The K in recursive K-ing. Clamped to the member count at build time.
    pub factor: u32,
}

impl Default for RecursiveConfig {
    fn default() -> Self {
        Self { factor: 2 }
    }
}

/// Per-collective algorithm overrides. `None` lets the catalog decide.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlgoOverrides {
    pub barrier: Option<AlgoId>,
    pub bcast: Option<AlgoId>,
    pub reduce: Option<AlgoId>,
    pub allreduce: Option<AlgoId>,
    pub alltoall: Option<AlgoId>,
    pub alltoallv: Option<AlgoId>,
}

/// Worker-wide engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub recursive: RecursiveConfig,

    /// Explicit algorithm selection, consulted before every other rule.
    pub algo: AlgoOverrides,

    /// Enable the per-group plan cache.
    pub cache_enable: bool,

    /// Forward fragments of waypoint steps as soon as each one is complete,
    /// instead of waiting for the whole message.
    pub pipelining: bool,

    /// Number of successful invocations after which a persistent operation's
    /// optimization hook runs and may rewrite steps to a cheaper tier.
    pub opt_count: u32,

    /// Upper bound on retryable-send replays per step before the failure is
    /// treated as fatal.
    pub resend_limit: u32,

    /// Message-size cutoff between recursive K-ing and ring for allreduce.
    pub large_thresh: usize,

    /// Optional clamps applied on top of the transport's reported caps.
    pub max_short_override: Option<usize>,
    pub max_bcopy_override: Option<usize>,
    pub max_zcopy_override: Option<usize>,

    /// In-network-computing offload. The switch protocol is not part of this
    /// engine; the flag only influences algorithm selection.
    pub inc_enable: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recursive: RecursiveConfig::default(),
            algo: AlgoOverrides::default(),
            cache_enable: true,
            pipelining: true,
            opt_count: 3,
            resend_limit: 8,
            large_thresh: 64 * 1024,
            max_short_override: None,
            max_bcopy_override: None,
            max_zcopy_override: None,
            inc_enable: false,
        }
    }
}
