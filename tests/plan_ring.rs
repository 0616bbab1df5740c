//! Structure of ring allreduce plans.

use anyhow::Result;
use convene::testing::{i32_buf, i32_zeroed, Cluster, TEST_GROUP};
use convene::{CollectiveParams, Config, Method, Plan, ALGO_RING, DT_I32, OP_SUM};
use std::rc::Rc;

fn ring_config() -> Config {
    let mut config = Config::default();
    config.algo.allreduce = Some(ALGO_RING);
    config
}

fn ring_plans(n: u64, count: usize) -> Result<Vec<Rc<Plan>>> {
    let mut cluster = Cluster::with_config(n, ring_config());
    (0..n)
        .map(|r| {
            let params = CollectiveParams::allreduce(
                i32_buf(&vec![0; count]),
                i32_zeroed(count),
                count,
                DT_I32,
                OP_SUM,
            );
            let h = cluster.worker(r).collective_create(TEST_GROUP, params)?;
            Ok(cluster.worker(r).plan(&h).unwrap())
        })
        .collect()
}

#[test]
fn phase_split_between_the_two_halves() -> Result<()> {
    for n in [3u64, 4, 5, 8] {
        let plans = ring_plans(n, n as usize)?;
        for (r, plan) in plans.iter().enumerate() {
            assert_eq!(plan.phases.len(), 2 * (n as usize - 1), "rank {r} of {n}");
            for (s, phase) in plan.phases.iter().enumerate() {
                let expect = if s < n as usize - 1 {
                    Method::ReduceScatterRing
                } else {
                    Method::AllgatherRing
                };
                assert_eq!(phase.method, expect, "rank {r} of {n}, phase {s}");
                assert_eq!(phase.step_index as usize, s);
                assert_eq!(phase.ep_cnt, 1);
            }
        }
    }
    Ok(())
}

#[test]
fn neighbours_are_fixed_for_the_whole_plan() -> Result<()> {
    let n = 5u64;
    let plans = ring_plans(n, n as usize)?;
    for (r, plan) in plans.iter().enumerate() {
        let r = r as u64;
        for phase in &plan.phases {
            assert_eq!(plan.phase_peers(phase)[0].member, (r + 1) % n);
            assert_eq!(plan.aux_peer(phase).unwrap().member, (r + n - 1) % n);
        }
        // One send endpoint and one receive endpoint, shared by every phase.
        assert_eq!(plan.peers.len(), 2);
        assert_eq!(plan.ep_cnt, 2);
    }
    Ok(())
}

#[test]
fn explanations_render_and_serialize() -> Result<()> {
    let plans = ring_plans(4, 4)?;
    let explanation = plans[2].explain();
    assert_eq!(explanation.phases.len(), 6);
    assert_eq!(explanation.my_index, 2);

    let text = explanation.to_string();
    assert!(text.contains("ReduceScatterRing"));
    assert!(text.contains("AllgatherRing"));

    let json = explanation.to_json()?;
    assert!(json.contains("ReduceScatterRing"));
    Ok(())
}

#[test]
fn two_member_ring_collapses_to_one_endpoint() -> Result<()> {
    let plans = ring_plans(2, 2)?;
    for plan in &plans {
        assert_eq!(plan.phases.len(), 2);
        for phase in &plan.phases {
            assert_eq!(phase.ep_cnt, 1);
            assert!(phase.aux_peer.is_none());
        }
        // The collapsed phase stores a single arena entry, counted once.
        assert_eq!(plan.peers.len(), 1);
        assert_eq!(plan.ep_cnt, 1);
    }
    // Source and destination are the same member.
    assert_eq!(plans[0].phase_peers(&plans[0].phases[0])[0].member, 1);
    assert_eq!(plans[1].phase_peers(&plans[1].phases[0])[0].member, 0);
    Ok(())
}
