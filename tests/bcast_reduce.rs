//! Binomial-tree broadcast and rooted reduce.

use anyhow::Result;
use convene::coll::shared_buf;
use convene::testing::{i32_buf, i32_zeroed, i64_buf, read_i32, read_i64, Cluster, TEST_GROUP};
use convene::transport::TransportCaps;
use convene::{CollectiveParams, Config, Method, DT_I32, DT_MAT2, OP_MATMUL, OP_SUM};

#[test]
fn broadcast_reaches_every_rank() -> Result<()> {
    for n in [2u64, 3, 5, 8] {
        let mut cluster = Cluster::new(n);
        let payload: Vec<i32> = (0..16).collect();
        let bufs: Vec<_> = (0..n)
            .map(|r| if r == 0 { i32_buf(&payload) } else { i32_zeroed(16) })
            .collect();

        cluster.run(|r| CollectiveParams::bcast(bufs[r as usize].clone(), 16, DT_I32, 0))?;

        for buf in &bufs {
            assert_eq!(read_i32(buf), payload);
        }
    }
    Ok(())
}

#[test]
fn broadcast_from_a_nonzero_root() -> Result<()> {
    let n = 5u64;
    let root = 2u64;
    let mut cluster = Cluster::new(n);
    let payload = vec![7, 8, 9];
    let bufs: Vec<_> = (0..n)
        .map(|r| if r == root { i32_buf(&payload) } else { i32_zeroed(3) })
        .collect();

    cluster.run(|r| CollectiveParams::bcast(bufs[r as usize].clone(), 3, DT_I32, root))?;

    for buf in &bufs {
        assert_eq!(read_i32(buf), payload);
    }
    Ok(())
}

#[test]
fn fragmented_broadcast_pipelines_through_interior_ranks() -> Result<()> {
    // Small caps force fragmentation; interior tree ranks forward each
    // fragment as it lands.
    let caps = TransportCaps {
        max_short: 8,
        max_bcopy: 32,
        max_zcopy: 32,
        max_reg: 1 << 20,
        needs_memh: true,
    };
    let n = 8u64;
    let mut cluster = Cluster::custom(n, n, caps, Config::default());
    let payload: Vec<i32> = (0..64).map(|i| i * 3 + 1).collect();
    let bufs: Vec<_> = (0..n)
        .map(|r| if r == 0 { i32_buf(&payload) } else { i32_zeroed(64) })
        .collect();

    cluster.run(|r| CollectiveParams::bcast(bufs[r as usize].clone(), 64, DT_I32, 0))?;

    for buf in &bufs {
        assert_eq!(read_i32(buf), payload);
    }
    Ok(())
}

#[test]
fn reduce_lands_only_on_the_root() -> Result<()> {
    let n = 6u64;
    let mut cluster = Cluster::new(n);
    let recvs: Vec<_> = (0..n).map(|_| i32_zeroed(2)).collect();

    cluster.run(|r| {
        CollectiveParams::reduce(
            i32_buf(&[r as i32, 1]),
            recvs[r as usize].clone(),
            2,
            DT_I32,
            OP_SUM,
            0,
        )
    })?;

    assert_eq!(read_i32(&recvs[0]), vec![15, 6]);
    for recv in &recvs[1..] {
        assert_eq!(read_i32(recv), vec![0, 0], "non-root buffers stay untouched");
    }
    Ok(())
}

#[test]
fn tree_reduce_folds_children_in_rank_order() -> Result<()> {
    // Non-commutative operator through interior waypoints.
    let n = 8u64;
    let mut cluster = Cluster::new(n);
    let inputs: Vec<Vec<i64>> = (0..n).map(|r| vec![r as i64 + 2, 1, 1, 1]).collect();
    let expect = inputs[1..].iter().fold(inputs[0].clone(), |a, b| {
        vec![
            a[0] * b[0] + a[1] * b[2],
            a[0] * b[1] + a[1] * b[3],
            a[2] * b[0] + a[3] * b[2],
            a[2] * b[1] + a[3] * b[3],
        ]
    });
    let recvs: Vec<_> = (0..n).map(|_| shared_buf(vec![0u8; 32])).collect();

    cluster.run(|r| {
        CollectiveParams::reduce(
            i64_buf(&inputs[r as usize]),
            recvs[r as usize].clone(),
            1,
            DT_MAT2,
            OP_MATMUL,
            0,
        )
    })?;

    assert_eq!(read_i64(&recvs[0]), expect);
    Ok(())
}

#[test]
fn tree_plans_use_waypoint_methods() -> Result<()> {
    let n = 8u64;
    let mut cluster = Cluster::new(n);
    let methods: Vec<Method> = (0..n)
        .map(|r| {
            let h = cluster
                .worker(r)
                .collective_create(
                    TEST_GROUP,
                    CollectiveParams::bcast(i32_zeroed(4), 4, DT_I32, 0),
                )
                .unwrap();
            let plan = cluster.worker(r).plan(&h).unwrap();
            assert_eq!(plan.phases.len(), 1);
            plan.phases[0].method
        })
        .collect();

    assert_eq!(methods[0], Method::SendTerminal);
    // Even non-root ranks carry contiguous subtrees and forward; odd ranks
    // are leaves.
    for (r, m) in methods.iter().enumerate().skip(1) {
        let expect = if r % 2 == 0 { Method::ScatterWaypoint } else { Method::RecvTerminal };
        assert_eq!(*m, expect, "rank {r}");
    }
    Ok(())
}
