//! Test harness: an in-process cluster of workers over the loopback fabric.
//!
//! A [`Cluster`] owns one worker per rank, all wired to the same
//! [`fabric::LoopbackFabric`], with one group spanning every rank. Tests
//! start a collective on each rank and pump every worker's progress until
//! all requests turn terminal. Buffer helpers convert between typed slices
//! and the byte buffers collectives operate on.

pub mod fabric;

use crate::coll::{shared_buf, CollectiveParams, SharedBuf};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::group::{CollHandle, GroupParams, RequestHandle, TopoSummary, Worker};
use crate::host::PredefinedHost;
use crate::transport::TransportCaps;
use crate::wire::GroupId;
use fabric::{default_caps, LoopbackFabric, RankResolver};
use std::rc::Rc;

/// Progress rounds before a stuck cluster is declared deadlocked.
const PUMP_LIMIT: usize = 20_000;

/// The group id every cluster test group uses.
pub const TEST_GROUP: GroupId = 1;

/// Base of the active-message id range the test workers consume.
pub const TEST_AM_BASE: u8 = 10;

/// An in-process group of workers sharing a loopback fabric.
pub struct Cluster {
    pub fabric: Rc<LoopbackFabric>,
    pub workers: Vec<Worker>,
    ranks: u64,
}

impl Cluster {
    /// `n` ranks on a single node, default caps and configuration.
    #[must_use]
    pub fn new(n: u64) -> Self {
        Self::custom(n, n.max(1), default_caps(), Config::default())
    }

    /// `n` ranks spread `ppn` to a node.
    #[must_use]
    pub fn with_ppn(n: u64, ppn: u64) -> Self {
        Self::custom(n, ppn, default_caps(), Config::default())
    }

    /// Single-node cluster with specific transport caps.
    #[must_use]
    pub fn with_caps(n: u64, caps: TransportCaps) -> Self {
        Self::custom(n, n.max(1), caps, Config::default())
    }

    /// Single-node cluster with a specific engine configuration.
    #[must_use]
    pub fn with_config(n: u64, config: Config) -> Self {
        Self::custom(n, n.max(1), default_caps(), config)
    }

    /// Fully custom cluster.
    #[must_use]
    pub fn custom(n: u64, ppn: u64, caps: TransportCaps, config: Config) -> Self {
        let fabric = LoopbackFabric::new(n as usize, caps);
        let host = Rc::new(PredefinedHost::with_ppn(ppn));
        let resolver = Rc::new(RankResolver);
        // Topology comes from the host's distance oracle, the way an
        // embedding runtime would derive it.
        let topo = TopoSummary::from_host(&*host, n);
        let workers = (0..n)
            .map(|r| {
                let mut w =
                    Worker::new(fabric.transport(r as usize), config.clone(), TEST_AM_BASE);
                w.create_group(GroupParams {
                    id: TEST_GROUP,
                    member_count: n,
                    member_index: r,
                    topo: topo.clone(),
                    host: host.clone(),
                    resolver: resolver.clone(),
                })
                .expect("fresh worker accepts the test group");
                w
            })
            .collect();
        Self { fabric, workers, ranks: n }
    }

    #[must_use]
    pub fn ranks(&self) -> u64 {
        self.ranks
    }

    pub fn worker(&mut self, rank: u64) -> &mut Worker {
        &mut self.workers[rank as usize]
    }

    /// Materialize the same collective on every rank.
    pub fn create_all(
        &mut self,
        mk: impl Fn(u64) -> CollectiveParams,
    ) -> Result<Vec<CollHandle>> {
        (0..self.ranks)
            .map(|r| self.workers[r as usize].collective_create(TEST_GROUP, mk(r)))
            .collect()
    }

    /// Start previously materialized collectives, one per rank.
    pub fn start_all(&mut self, handles: &[CollHandle]) -> Result<Vec<RequestHandle>> {
        handles
            .iter()
            .enumerate()
            .map(|(r, h)| self.workers[r].collective_start(h))
            .collect()
    }

    /// Create, start, and drive one collective to completion on every rank.
    pub fn run(&mut self, mk: impl Fn(u64) -> CollectiveParams) -> Result<()> {
        let handles = self.create_all(mk)?;
        let reqs = self.start_all(&handles)?;
        self.pump_until(&reqs)
    }

    /// Run `ticks` progress rounds across all workers.
    pub fn pump(&mut self, ticks: usize) {
        for _ in 0..ticks {
            for w in &mut self.workers {
                w.progress();
            }
        }
    }

    /// Pump until every request reaches a terminal status, surfacing the
    /// first failure.
    ///
    /// # Panics
    ///
    /// If the cluster stops making progress before the requests complete.
    pub fn pump_until(&mut self, reqs: &[RequestHandle]) -> Result<()> {
        for _ in 0..PUMP_LIMIT {
            for w in &mut self.workers {
                w.progress();
            }
            if reqs
                .iter()
                .all(|r| !matches!(r.check_status(), Err(Error::InProgress)))
            {
                for r in reqs {
                    r.check_status()?;
                }
                return Ok(());
            }
        }
        panic!("cluster did not converge within {PUMP_LIMIT} progress rounds");
    }
}

/* ---------- Typed buffer helpers ---------- */

/// Byte buffer holding the given i32 values.
#[must_use]
pub fn i32_buf(vals: &[i32]) -> SharedBuf {
    shared_buf(vals.iter().flat_map(|v| v.to_ne_bytes()).collect())
}

/// Zeroed byte buffer sized for `n` i32 values.
#[must_use]
pub fn i32_zeroed(n: usize) -> SharedBuf {
    shared_buf(vec![0u8; n * 4])
}

/// Read an i32 buffer back.
#[must_use]
pub fn read_i32(buf: &SharedBuf) -> Vec<i32> {
    buf.borrow()
        .chunks_exact(4)
        .map(|c| i32::from_ne_bytes(c.try_into().unwrap()))
        .collect()
}

/// Byte buffer holding the given i64 values.
#[must_use]
pub fn i64_buf(vals: &[i64]) -> SharedBuf {
    shared_buf(vals.iter().flat_map(|v| v.to_ne_bytes()).collect())
}

/// Zeroed byte buffer sized for `n` i64 values.
#[must_use]
pub fn i64_zeroed(n: usize) -> SharedBuf {
    shared_buf(vec![0u8; n * 8])
}

/// Read an i64 buffer back.
#[must_use]
pub fn read_i64(buf: &SharedBuf) -> Vec<i64> {
    buf.borrow()
        .chunks_exact(8)
        .map(|c| i64::from_ne_bytes(c.try_into().unwrap()))
        .collect()
}

/// Assert that a buffer holds exactly the given i32 values.
///
/// # Panics
///
/// On mismatch, with both sides in the message.
pub fn assert_i32_buf(buf: &SharedBuf, expected: &[i32]) {
    let got = read_i32(buf);
    assert_eq!(got, expected, "buffer contents differ");
}
