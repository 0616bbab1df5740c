//! Bruck alltoall.

use anyhow::Result;
use convene::testing::{i32_buf, i32_zeroed, read_i32, Cluster, TEST_GROUP};
use convene::{CollectiveParams, Method, DT_I32};

fn pattern(n: u64, per_peer: usize) -> Result<()> {
    let mut cluster = Cluster::new(n);
    let recvs: Vec<_> = (0..n).map(|_| i32_zeroed(n as usize * per_peer)).collect();

    cluster.run(|r| {
        // Rank r sends r*100 + dst (repeated per element) to every dst.
        let vals: Vec<i32> = (0..n)
            .flat_map(|d| {
                std::iter::repeat_n(r as i32 * 100 + d as i32, per_peer)
            })
            .collect();
        CollectiveParams::alltoall(
            i32_buf(&vals),
            recvs[r as usize].clone(),
            per_peer,
            DT_I32,
        )
    })?;

    for (d, recv) in recvs.iter().enumerate() {
        let expect: Vec<i32> = (0..n)
            .flat_map(|s| std::iter::repeat_n(s as i32 * 100 + d as i32, per_peer))
            .collect();
        assert_eq!(read_i32(recv), expect, "rank {d} of {n}");
    }
    Ok(())
}

#[test]
fn four_ranks_single_element_blocks() -> Result<()> {
    pattern(4, 1)
}

#[test]
fn eight_ranks_wider_blocks() -> Result<()> {
    pattern(8, 3)
}

#[test]
fn non_power_member_counts() -> Result<()> {
    pattern(3, 2)?;
    pattern(6, 1)?;
    pattern(7, 2)
}

#[test]
fn single_member_exchange_is_local() -> Result<()> {
    pattern(1, 4)
}

#[test]
fn log_phase_plan_shape() -> Result<()> {
    let n = 8u64;
    let mut cluster = Cluster::new(n);
    let h = cluster.worker(3).collective_create(
        TEST_GROUP,
        CollectiveParams::alltoall(i32_zeroed(8), i32_zeroed(8), 1, DT_I32),
    )?;
    let plan = cluster.worker(3).plan(&h).unwrap();

    assert_eq!(plan.phases.len(), 3);
    for (k, phase) in plan.phases.iter().enumerate() {
        assert_eq!(phase.method, Method::BruckAlltoall);
        assert_eq!(phase.ep_cnt, 1);
        let stride = 1u64 << k;
        assert_eq!(plan.phase_peers(phase)[0].member, (3 + stride) % n);
        assert_eq!(plan.aux_peer(phase).unwrap().member, (3 + n - stride) % n);
    }
    Ok(())
}
