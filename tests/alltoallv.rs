//! Two-level alltoallv: intra-node gathers, one inter-node exchange, and
//! the scatter back.

use anyhow::Result;
use convene::testing::{i32_buf, i32_zeroed, read_i32, Cluster, TEST_GROUP};
use convene::{CollectiveParams, Method, PlummerStage, DT_I32};

/// Uniform counts: rank s sends `s*100 + d` to every d.
fn uniform(n: u64, ppn: u64) -> Result<()> {
    let mut cluster = Cluster::with_ppn(n, ppn);
    let recvs: Vec<_> = (0..n).map(|_| i32_zeroed(n as usize)).collect();
    let counts = vec![1u32; n as usize];
    let displs: Vec<u32> = (0..n as u32).collect();

    cluster.run(|r| {
        let vals: Vec<i32> = (0..n).map(|d| r as i32 * 100 + d as i32).collect();
        CollectiveParams::alltoallv(
            i32_buf(&vals),
            counts.clone(),
            displs.clone(),
            recvs[r as usize].clone(),
            counts.clone(),
            displs.clone(),
            DT_I32,
        )
    })?;

    for (d, recv) in recvs.iter().enumerate() {
        let expect: Vec<i32> = (0..n).map(|s| s as i32 * 100 + d as i32).collect();
        assert_eq!(read_i32(recv), expect, "rank {d}");
    }
    Ok(())
}

#[test]
fn eight_ranks_two_per_node() -> Result<()> {
    uniform(8, 2)
}

#[test]
fn every_rank_its_own_node() -> Result<()> {
    uniform(4, 1)
}

#[test]
fn everyone_on_one_node() -> Result<()> {
    uniform(6, 6)
}

#[test]
fn ragged_last_node() -> Result<()> {
    // 7 ranks, 3 per node: nodes of 3, 3, and 1.
    uniform(7, 3)
}

#[test]
fn variable_counts_with_holes() -> Result<()> {
    // cnt(s -> d) = (s + d) % 3, so some pairs exchange nothing at all.
    let n = 4u64;
    let ppn = 2u64;
    let cnt = |s: u64, d: u64| ((s + d) % 3) as usize;

    let mut cluster = Cluster::with_ppn(n, ppn);
    let mut recvs = Vec::new();
    let mut send_specs = Vec::new();
    let mut recv_specs = Vec::new();
    for r in 0..n {
        let send_counts: Vec<u32> = (0..n).map(|d| cnt(r, d) as u32).collect();
        let recv_counts: Vec<u32> = (0..n).map(|s| cnt(s, r) as u32).collect();
        let send_displs: Vec<u32> = send_counts
            .iter()
            .scan(0u32, |acc, c| {
                let at = *acc;
                *acc += c;
                Some(at)
            })
            .collect();
        let recv_displs: Vec<u32> = recv_counts
            .iter()
            .scan(0u32, |acc, c| {
                let at = *acc;
                *acc += c;
                Some(at)
            })
            .collect();
        let send_vals: Vec<i32> = (0..n)
            .flat_map(|d| (0..cnt(r, d)).map(move |k| (r * 1000 + d * 10) as i32 + k as i32))
            .collect();
        let total_recv: usize = recv_counts.iter().map(|c| *c as usize).sum();
        recvs.push(i32_zeroed(total_recv));
        send_specs.push((i32_buf(&send_vals), send_counts, send_displs));
        recv_specs.push((recv_counts, recv_displs));
    }

    let handles = cluster.create_all(|r| {
        let (buf, counts, displs) = &send_specs[r as usize];
        let (rcounts, rdispls) = &recv_specs[r as usize];
        CollectiveParams::alltoallv(
            buf.clone(),
            counts.clone(),
            displs.clone(),
            recvs[r as usize].clone(),
            rcounts.clone(),
            rdispls.clone(),
            DT_I32,
        )
    })?;
    let reqs = cluster.start_all(&handles)?;
    cluster.pump_until(&reqs)?;

    for d in 0..n {
        let expect: Vec<i32> = (0..n)
            .flat_map(|s| (0..cnt(s, d)).map(move |k| (s * 1000 + d * 10) as i32 + k as i32))
            .collect();
        assert_eq!(read_i32(&recvs[d as usize]), expect, "rank {d}");
    }
    Ok(())
}

#[test]
fn leaders_and_members_split_the_protocol_steps() -> Result<()> {
    let n = 8u64;
    let mut cluster = Cluster::with_ppn(n, 2);
    let counts = vec![1u32; 8];
    let displs: Vec<u32> = (0..8).collect();
    let mk = |_r: u64| {
        CollectiveParams::alltoallv(
            i32_zeroed(8),
            counts.clone(),
            displs.clone(),
            i32_zeroed(8),
            counts.clone(),
            displs.clone(),
            DT_I32,
        )
    };

    let h0 = cluster.worker(0).collective_create(TEST_GROUP, mk(0))?;
    let leader = cluster.worker(0).plan(&h0).unwrap();
    let methods: Vec<Method> = leader.phases.iter().map(|p| p.method).collect();
    assert_eq!(
        methods,
        vec![
            Method::PlummerIntra(PlummerStage::GatherSendCounts),
            Method::PlummerIntra(PlummerStage::GatherRecvCounts),
            Method::PlummerIntra(PlummerStage::GatherSendBuffers),
            Method::PlummerInter,
            Method::PlummerIntra(PlummerStage::ScatterRecvBuffers),
        ]
    );
    // Inter phase talks to the three other leaders.
    assert_eq!(leader.phases[3].ep_cnt, 3);

    let h1 = cluster.worker(1).collective_create(TEST_GROUP, mk(1))?;
    let member = cluster.worker(1).plan(&h1).unwrap();
    let methods: Vec<Method> = member.phases.iter().map(|p| p.method).collect();
    assert_eq!(
        methods,
        vec![
            Method::PlummerIntra(PlummerStage::GatherSendCounts),
            Method::PlummerIntra(PlummerStage::GatherRecvCounts),
            Method::PlummerIntra(PlummerStage::GatherSendBuffers),
            Method::PlummerIntra(PlummerStage::ScatterRecvBuffers),
        ]
    );
    // Step indices skip the inter step the member does not participate in.
    assert_eq!(member.phases[3].step_index, 4);
    assert_eq!(member.step_cnt, leader.step_cnt);
    Ok(())
}
