//! End-to-end allreduce behavior over the loopback fabric.

use anyhow::Result;
use convene::coll::shared_buf;
use convene::testing::{i32_buf, i32_zeroed, i64_buf, read_i32, read_i64, Cluster, TEST_GROUP};
use convene::transport::TransportCaps;
use convene::{
    CollectiveParams, Config, ALGO_RECURSIVE, ALGO_RING, DT_I32, DT_I32_STRIDED, DT_MAT2,
    OP_MATMUL, OP_SUM,
};

#[test]
fn recursive_doubling_on_four_ranks() -> Result<()> {
    let mut cluster = Cluster::new(4);
    let recvs: Vec<_> = (0..4).map(|_| i32_zeroed(4)).collect();
    let sends: Vec<_> = (0..4).map(|_| i32_buf(&[1, 2, 3, 4])).collect();

    cluster.run(|r| {
        CollectiveParams::allreduce(
            sends[r as usize].clone(),
            recvs[r as usize].clone(),
            4,
            DT_I32,
            OP_SUM,
        )
    })?;

    for recv in &recvs {
        assert_eq!(read_i32(recv), vec![4, 8, 12, 16]);
    }
    Ok(())
}

#[test]
fn three_ranks_fold_through_the_paired_prefix() -> Result<()> {
    let mut cluster = Cluster::new(3);
    let recvs: Vec<_> = (0..3).map(|_| i32_zeroed(1)).collect();

    cluster.run(|r| {
        CollectiveParams::allreduce(
            i32_buf(&[r as i32 + 1]),
            recvs[r as usize].clone(),
            1,
            DT_I32,
            OP_SUM,
        )
    })?;

    for recv in &recvs {
        assert_eq!(read_i32(recv), vec![6]);
    }
    Ok(())
}

// The same sum over a spread of member counts, power-of-two and not.
macro_rules! allreduce_sum_over {
    ($($n:literal),*) => {
        paste::paste! {
            $(
                #[test]
                fn [<sums_across_ $n _ranks>]() -> Result<()> {
                    let n = $n as u64;
                    let mut cluster = Cluster::new(n);
                    let recvs: Vec<_> = (0..n).map(|_| i32_zeroed(2)).collect();
                    cluster.run(|r| {
                        CollectiveParams::allreduce(
                            i32_buf(&[r as i32, 1]),
                            recvs[r as usize].clone(),
                            2,
                            DT_I32,
                            OP_SUM,
                        )
                    })?;
                    let total: i32 = (0..$n).sum();
                    for recv in &recvs {
                        assert_eq!(read_i32(recv), vec![total, $n]);
                    }
                    Ok(())
                }
            )*
        }
    };
}

allreduce_sum_over!(2, 3, 4, 5, 6, 7, 8, 12, 16);

#[test]
fn k_ary_recursive_exchange() -> Result<()> {
    let mut config = Config::default();
    config.recursive.factor = 3;
    let mut cluster = Cluster::with_config(9, config);
    let recvs: Vec<_> = (0..9).map(|_| i32_zeroed(1)).collect();

    cluster.run(|r| {
        CollectiveParams::allreduce(
            i32_buf(&[r as i32 + 1]),
            recvs[r as usize].clone(),
            1,
            DT_I32,
            OP_SUM,
        )
    })?;

    for recv in &recvs {
        assert_eq!(read_i32(recv), vec![45]);
    }
    Ok(())
}

fn ring_config() -> Config {
    let mut config = Config::default();
    config.algo.allreduce = Some(ALGO_RING);
    config
}

#[test]
fn two_member_ring() -> Result<()> {
    let mut cluster = Cluster::with_config(2, ring_config());
    let recvs: Vec<_> = (0..2).map(|_| i32_zeroed(2)).collect();
    let sends = [i32_buf(&[10, 20]), i32_buf(&[30, 40])];

    cluster.run(|r| {
        CollectiveParams::allreduce(
            sends[r as usize].clone(),
            recvs[r as usize].clone(),
            2,
            DT_I32,
            OP_SUM,
        )
    })?;

    for recv in &recvs {
        assert_eq!(read_i32(recv), vec![40, 60]);
    }
    Ok(())
}

#[test]
fn four_member_ring() -> Result<()> {
    let mut cluster = Cluster::with_config(4, ring_config());
    let recvs: Vec<_> = (0..4).map(|_| i32_zeroed(4)).collect();

    cluster.run(|r| {
        CollectiveParams::allreduce(
            i32_buf(&[1, 1, 1, 1]),
            recvs[r as usize].clone(),
            4,
            DT_I32,
            OP_SUM,
        )
    })?;

    for recv in &recvs {
        assert_eq!(read_i32(recv), vec![4, 4, 4, 4]);
    }
    Ok(())
}

#[test]
fn ring_with_uneven_blocks() -> Result<()> {
    // 7 elements over 3 members: block sizes 3, 2, 2.
    let mut cluster = Cluster::with_config(3, ring_config());
    let recvs: Vec<_> = (0..3).map(|_| i32_zeroed(7)).collect();

    cluster.run(|r| {
        CollectiveParams::allreduce(
            i32_buf(&[r as i32 + 1; 7]),
            recvs[r as usize].clone(),
            7,
            DT_I32,
            OP_SUM,
        )
    })?;

    for recv in &recvs {
        assert_eq!(read_i32(recv), vec![6; 7]);
    }
    Ok(())
}

/* ---------- Non-commutative operators ---------- */

fn mat(vals: [i64; 4]) -> Vec<i64> {
    vals.to_vec()
}

fn matmul(a: &[i64], b: &[i64]) -> Vec<i64> {
    vec![
        a[0] * b[0] + a[1] * b[2],
        a[0] * b[1] + a[1] * b[3],
        a[2] * b[0] + a[3] * b[2],
        a[2] * b[1] + a[3] * b[3],
    ]
}

#[test]
fn matrix_product_preserves_rank_order() -> Result<()> {
    for n in [2u64, 4, 8] {
        let mut cluster = Cluster::new(n);
        // [[r+2, 1], [1, 1]] matrices do not commute pairwise.
        let inputs: Vec<Vec<i64>> = (0..n)
            .map(|r| mat([r as i64 + 2, 1, 1, 1]))
            .collect();
        let expect = inputs[1..]
            .iter()
            .fold(inputs[0].clone(), |acc, m| matmul(&acc, m));
        let recvs: Vec<_> = (0..n).map(|_| shared_buf(vec![0u8; 32])).collect();

        cluster.run(|r| {
            CollectiveParams::allreduce(
                i64_buf(&inputs[r as usize]),
                recvs[r as usize].clone(),
                1,
                DT_MAT2,
                OP_MATMUL,
            )
        })?;

        for recv in &recvs {
            assert_eq!(read_i64(recv), expect, "n = {n}");
        }
    }
    Ok(())
}

#[test]
fn non_commutative_operators_refuse_the_ring() {
    let mut cluster = Cluster::with_config(4, ring_config());
    let params = CollectiveParams::allreduce(
        i64_buf(&[1, 0, 0, 1]),
        shared_buf(vec![0u8; 32]),
        1,
        DT_MAT2,
        OP_MATMUL,
    );
    let err = cluster
        .worker(0)
        .collective_create(TEST_GROUP, params)
        .unwrap_err();
    assert!(matches!(err, convene::Error::InvalidParam(_)), "{err}");
}

#[test]
fn stable_modifier_is_accepted_for_commutative_sums() -> Result<()> {
    let mut cluster = Cluster::new(4);
    let recvs: Vec<_> = (0..4).map(|_| i32_zeroed(3)).collect();

    cluster.run(|r| {
        CollectiveParams::allreduce(
            i32_buf(&[r as i32, 2 * r as i32, 3]),
            recvs[r as usize].clone(),
            3,
            DT_I32,
            OP_SUM,
        )
        .stable()
    })?;

    for recv in &recvs {
        assert_eq!(read_i32(recv), vec![6, 12, 12]);
    }
    Ok(())
}

/* ---------- Fragmentation ---------- */

fn capped(max_short: usize, max_bcopy: usize) -> TransportCaps {
    TransportCaps {
        max_short,
        max_bcopy,
        max_zcopy: 1 << 20,
        max_reg: 1 << 20,
        needs_memh: true,
    }
}

#[test]
fn fragment_length_does_not_change_ring_results() -> Result<()> {
    // 64 ints over 4 members: 64-byte blocks, fragmented ever finer.
    let count = 64usize;
    let mut reference: Option<Vec<i32>> = None;
    for max_bcopy in [64usize, 32, 16, 8] {
        let mut config = ring_config();
        config.max_zcopy_override = Some(max_bcopy);
        let mut cluster = Cluster::custom(4, 4, capped(4, max_bcopy), config);
        let recvs: Vec<_> = (0..4).map(|_| i32_zeroed(count)).collect();

        cluster.run(|r| {
            let vals: Vec<i32> = (0..count).map(|i| (r as i32 + 1) * i as i32).collect();
            CollectiveParams::allreduce(
                i32_buf(&vals),
                recvs[r as usize].clone(),
                count,
                DT_I32,
                OP_SUM,
            )
        })?;

        let got = read_i32(&recvs[0]);
        for recv in &recvs[1..] {
            assert_eq!(read_i32(recv), got);
        }
        match &reference {
            None => reference = Some(got),
            Some(expect) => assert_eq!(&got, expect, "max_bcopy = {max_bcopy}"),
        }
    }
    Ok(())
}

#[test]
fn fragmented_recursive_exchange_with_swap() -> Result<()> {
    // Non-commutative payload large enough to fragment.
    let n = 4u64;
    let count = 8usize; // 256 bytes of matrices per rank
    let mut config = Config::default();
    config.max_zcopy_override = Some(64);
    let mut cluster = Cluster::custom(n, n, capped(16, 64), config);
    let inputs: Vec<Vec<i64>> = (0..n)
        .map(|r| {
            (0..count)
                .flat_map(|i| [r as i64 + i as i64 + 2, 1, 1, 1])
                .collect()
        })
        .collect();
    let mut expect = vec![0i64; 4 * count];
    for i in 0..count {
        let mut acc = inputs[0][i * 4..(i + 1) * 4].to_vec();
        for input in &inputs[1..] {
            acc = matmul(&acc, &input[i * 4..(i + 1) * 4]);
        }
        expect[i * 4..(i + 1) * 4].copy_from_slice(&acc);
    }
    let recvs: Vec<_> = (0..n).map(|_| shared_buf(vec![0u8; 32 * count])).collect();

    cluster.run(|r| {
        CollectiveParams::allreduce(
            i64_buf(&inputs[r as usize]),
            recvs[r as usize].clone(),
            count,
            DT_MAT2,
            OP_MATMUL,
        )
    })?;

    for recv in &recvs {
        assert_eq!(read_i64(recv), expect);
    }
    Ok(())
}

/* ---------- Non-contiguous datatypes ---------- */

#[test]
fn strided_datatype_is_staged_through_a_contig_buffer() -> Result<()> {
    // Four i32 values at an 8-byte stride: 28-byte user span.
    let n = 3u64;
    let count = 4usize;
    let span = (count - 1) * 8 + 4;
    let mk_strided = |vals: &[i32]| {
        let mut bytes = vec![0u8; span];
        for (i, v) in vals.iter().enumerate() {
            bytes[i * 8..i * 8 + 4].copy_from_slice(&v.to_ne_bytes());
        }
        shared_buf(bytes)
    };
    let read_strided = |buf: &convene::SharedBuf| -> Vec<i32> {
        let bytes = buf.borrow();
        (0..count)
            .map(|i| i32::from_ne_bytes(bytes[i * 8..i * 8 + 4].try_into().unwrap()))
            .collect()
    };

    let mut cluster = Cluster::new(n);
    let recvs: Vec<_> = (0..n).map(|_| shared_buf(vec![0u8; span])).collect();
    cluster.run(|r| {
        CollectiveParams::allreduce(
            mk_strided(&[r as i32, 10, 20, 30]),
            recvs[r as usize].clone(),
            count,
            DT_I32_STRIDED,
            OP_SUM,
        )
    })?;

    for recv in &recvs {
        assert_eq!(read_strided(recv), vec![3, 30, 60, 90]);
    }
    Ok(())
}

/* ---------- Algorithm selection sanity ---------- */

#[test]
fn small_messages_stay_on_the_recursive_plan() -> Result<()> {
    let mut cluster = Cluster::new(8);
    let h = cluster.worker(0).collective_create(
        TEST_GROUP,
        CollectiveParams::allreduce(i32_buf(&[0; 8]), i32_zeroed(8), 8, DT_I32, OP_SUM),
    )?;
    assert_eq!(cluster.worker(0).plan(&h).unwrap().algo, ALGO_RECURSIVE);
    Ok(())
}
