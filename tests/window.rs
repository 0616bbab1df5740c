//! The in-flight window: concurrency bounds, FIFO completion, cancellation,
//! resend, and resource release.

use anyhow::Result;
use convene::testing::{i32_buf, i32_zeroed, read_i32, Cluster, TEST_GROUP};
use convene::{CollectiveParams, Error, GroupParams, TopoSummary, DT_I32, MEMBER_PENDING, NUM_SLOTS, OP_SUM};
use std::rc::Rc;

#[test]
fn concurrent_collectives_use_distinct_slots_and_complete_in_order() -> Result<()> {
    let n = 4u64;
    let mut cluster = Cluster::new(n);

    // Three overlapping allreduces per rank.
    let mut all_reqs = Vec::new();
    let mut recvs = Vec::new();
    for i in 0..3 {
        let bufs: Vec<_> = (0..n).map(|r| i32_buf(&[(i * 10 + r) as i32])).collect();
        let outs: Vec<_> = (0..n).map(|_| i32_zeroed(1)).collect();
        let handles = cluster.create_all(|r| {
            CollectiveParams::allreduce(
                bufs[r as usize].clone(),
                outs[r as usize].clone(),
                1,
                DT_I32,
                OP_SUM,
            )
        })?;
        let reqs = cluster.start_all(&handles)?;
        // Monotonic ids, distinct window slots.
        for req in &reqs {
            assert_eq!(req.coll_id(), i as u8);
        }
        all_reqs.extend(reqs);
        recvs.push(outs);
    }

    // Completion order on rank 0 follows start order.
    let rank0: Vec<_> = all_reqs.iter().step_by(n as usize).collect();
    let mut seen = Vec::new();
    for _ in 0..20_000 {
        cluster.pump(1);
        for (i, req) in rank0.iter().enumerate() {
            if !seen.contains(&i) && req.check_status() != Err(Error::InProgress) {
                seen.push(i);
            }
        }
        if seen.len() == rank0.len() {
            break;
        }
    }
    let mut sorted = seen.clone();
    sorted.sort_unstable();
    assert_eq!(seen, sorted, "completions fired out of start order");

    for (i, outs) in recvs.iter().enumerate() {
        let expect: i32 = (0..n as i32).map(|r| i as i32 * 10 + r).sum();
        for out in outs {
            assert_eq!(read_i32(out), vec![expect]);
        }
    }
    Ok(())
}

#[test]
fn window_bounds_outstanding_collectives() -> Result<()> {
    let mut cluster = Cluster::new(2);
    let handles0 = (0..NUM_SLOTS + 1)
        .map(|_| {
            cluster
                .worker(0)
                .collective_create(TEST_GROUP, CollectiveParams::barrier())
        })
        .collect::<Result<Vec<_>, _>>()?;
    let handles1 = (0..NUM_SLOTS + 1)
        .map(|_| {
            cluster
                .worker(1)
                .collective_create(TEST_GROUP, CollectiveParams::barrier())
        })
        .collect::<Result<Vec<_>, _>>()?;

    // Rank 0 fills its window; the 17th start must report InProgress.
    let mut reqs = Vec::new();
    for h in &handles0[..NUM_SLOTS] {
        reqs.push(cluster.worker(0).collective_start(h)?);
    }
    let err = cluster.worker(0).collective_start(&handles0[NUM_SLOTS]);
    assert!(matches!(err, Err(Error::InProgress)));

    // The peer drains the window; then the deferred start goes through.
    for h in &handles1[..NUM_SLOTS] {
        reqs.push(cluster.worker(1).collective_start(h)?);
    }
    cluster.pump_until(&reqs)?;

    let late0 = cluster.worker(0).collective_start(&handles0[NUM_SLOTS])?;
    let late1 = cluster.worker(1).collective_start(&handles1[NUM_SLOTS])?;
    cluster.pump_until(&[late0, late1])?;
    Ok(())
}

#[test]
fn cancellation_unwinds_and_releases_registrations() -> Result<()> {
    let mut cluster = Cluster::new(2);
    let fabric = Rc::clone(&cluster.fabric);

    // Big enough for the zero-copy tier, so a registration exists to leak.
    let count = 8192usize;
    let h = cluster.worker(0).collective_create(
        TEST_GROUP,
        CollectiveParams::allreduce(
            i32_buf(&vec![1; count]),
            i32_zeroed(count),
            count,
            DT_I32,
            OP_SUM,
        ),
    )?;
    assert!(fabric.active_registrations() > 0, "zcopy step registered");

    let req = cluster.worker(0).collective_start(&h)?;
    cluster.pump(20);
    assert_eq!(req.check_status(), Err(Error::InProgress));

    req.cancel();
    cluster.pump(5);
    assert_eq!(req.check_status(), Err(Error::Canceled));
    assert_eq!(
        fabric.active_registrations(),
        0,
        "cancellation released the registration"
    );
    Ok(())
}

#[test]
fn retryable_send_failures_replay() -> Result<()> {
    let mut cluster = Cluster::new(2);
    cluster.fabric.inject_send_failures(0, 2, true);
    cluster.run(|_| CollectiveParams::barrier())?;
    Ok(())
}

#[test]
fn fatal_send_failures_reach_the_caller() -> Result<()> {
    let mut cluster = Cluster::new(2);
    cluster.fabric.inject_send_failures(0, 1, false);

    let handles = cluster.create_all(|_| CollectiveParams::barrier())?;
    let r0 = cluster.worker(0).collective_start(&handles[0])?;
    let r1 = cluster.worker(1).collective_start(&handles[1])?;
    cluster.pump(10);

    assert!(matches!(
        r0.check_status(),
        Err(Error::Transport { retryable: false, .. })
    ));
    // The peer can never be released; cancel it to clean up.
    r1.cancel();
    cluster.pump(5);
    assert_eq!(r1.check_status(), Err(Error::Canceled));
    Ok(())
}

#[test]
fn exhausted_resend_budget_turns_fatal() -> Result<()> {
    let mut cluster = Cluster::new(2);
    cluster.fabric.inject_send_failures(0, 1000, true);

    let handles = cluster.create_all(|_| CollectiveParams::barrier())?;
    let r0 = cluster.worker(0).collective_start(&handles[0])?;
    let r1 = cluster.worker(1).collective_start(&handles[1])?;
    cluster.pump(100);

    assert!(matches!(r0.check_status(), Err(Error::Transport { .. })));
    r1.cancel();
    cluster.pump(5);
    Ok(())
}

#[test]
fn persistent_ops_restart_and_optimize() -> Result<()> {
    let n = 2u64;
    let mut config = convene::Config::default();
    config.opt_count = 2;
    let mut cluster = Cluster::with_config(n, config);
    let fabric = Rc::clone(&cluster.fabric);

    // 256 bytes: bcopy tier at materialization, zcopy candidate once hot.
    let count = 64usize;
    let sends: Vec<_> = (0..n).map(|r| i32_buf(&vec![r as i32 + 1; count])).collect();
    let recvs: Vec<_> = (0..n).map(|_| i32_zeroed(count)).collect();
    let handles = cluster.create_all(|r| {
        CollectiveParams::allreduce(
            sends[r as usize].clone(),
            recvs[r as usize].clone(),
            count,
            DT_I32,
            OP_SUM,
        )
        .persistent()
    })?;
    assert_eq!(fabric.active_registrations(), 0, "bcopy needs no registration");

    // First invocation: counts down, still bcopy.
    let reqs = cluster.start_all(&handles)?;
    cluster.pump_until(&reqs)?;
    assert_eq!(fabric.active_registrations(), 0);
    for recv in &recvs {
        assert_eq!(read_i32(recv), vec![3; count]);
    }

    // Second invocation trips the optimization hook: the hot step registers
    // once and flips to zcopy.
    let reqs = cluster.start_all(&handles)?;
    cluster.pump_until(&reqs)?;
    assert_eq!(fabric.active_registrations(), n as usize);
    for recv in &recvs {
        assert_eq!(read_i32(recv), vec![3; count]);
    }

    // Registrations live as long as the persistent op does.
    let reqs = cluster.start_all(&handles)?;
    cluster.pump_until(&reqs)?;
    assert_eq!(fabric.active_registrations(), n as usize);

    drop(cluster);
    assert_eq!(fabric.active_registrations(), 0, "op teardown released them");
    Ok(())
}

#[test]
fn completed_ops_leave_no_registrations_behind() -> Result<()> {
    let mut cluster = Cluster::new(2);
    let fabric = Rc::clone(&cluster.fabric);

    let count = 8192usize; // zcopy tier
    let recvs: Vec<_> = (0..2).map(|_| i32_zeroed(count)).collect();
    cluster.run(|r| {
        CollectiveParams::allreduce(
            i32_buf(&vec![r as i32; count]),
            recvs[r as usize].clone(),
            count,
            DT_I32,
            OP_SUM,
        )
    })?;
    assert_eq!(read_i32(&recvs[0])[0], 1);
    assert_eq!(fabric.active_registrations(), 0);
    Ok(())
}

#[test]
fn deferred_membership_arrives_via_the_info_broadcast() -> Result<()> {
    let mut cluster = Cluster::new(2);
    let gid = 9;
    let host = Rc::new(convene::PredefinedHost::with_ppn(2));
    let resolver = Rc::new(convene::testing::fabric::RankResolver);

    cluster.worker(0).create_group(GroupParams {
        id: gid,
        member_count: 2,
        member_index: 0,
        topo: TopoSummary::single_node(2),
        host: host.clone(),
        resolver: resolver.clone(),
    })?;
    cluster.worker(1).create_group(GroupParams {
        id: gid,
        member_count: 2,
        member_index: MEMBER_PENDING,
        topo: TopoSummary::single_node(2),
        host,
        resolver,
    })?;

    // A collective before membership arrives is refused.
    let err = cluster
        .worker(1)
        .collective_create(gid, CollectiveParams::barrier());
    assert!(matches!(err, Err(Error::InvalidParam(_))));

    cluster.worker(0).broadcast_group_info(gid)?;
    cluster.pump(2);
    assert_eq!(cluster.worker(1).group(gid).unwrap().member_index(), 1);

    // The released group now runs collectives.
    let h0 = cluster
        .worker(0)
        .collective_create(gid, CollectiveParams::barrier())?;
    let h1 = cluster
        .worker(1)
        .collective_create(gid, CollectiveParams::barrier())?;
    let r0 = cluster.worker(0).collective_start(&h0)?;
    let r1 = cluster.worker(1).collective_start(&h1)?;
    cluster.pump_until(&[r0, r1])?;
    Ok(())
}

#[test]
fn unknown_group_fragments_are_dropped_quietly() -> Result<()> {
    // A frame for a group only rank 0 knows about must not disturb rank 1.
    let mut cluster = Cluster::new(2);
    let gid = 33;
    let host = Rc::new(convene::PredefinedHost::with_ppn(2));
    let resolver = Rc::new(convene::testing::fabric::RankResolver);
    cluster.worker(0).create_group(GroupParams {
        id: gid,
        member_count: 2,
        member_index: 0,
        topo: TopoSummary::single_node(2),
        host,
        resolver,
    })?;
    let h = cluster
        .worker(0)
        .collective_create(gid, CollectiveParams::barrier())?;
    let req = cluster.worker(0).collective_start(&h)?;
    // Rank 1 receives and drops the fragment; its own groups are untouched.
    cluster.pump(5);
    assert_eq!(req.check_status(), Err(Error::InProgress));
    req.cancel();
    cluster.pump(5);
    Ok(())
}
