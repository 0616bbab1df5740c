//! The host-collaborator contract.
//!
//! The engine does not interpret datatypes or reduction operators itself; the
//! embedding runtime (an MPI library, typically) supplies them through the
//! [`HostOps`] trait. Operator and datatype handles cross the boundary as
//! opaque tokens, exactly like the `void *` handles the host would otherwise
//! pass around.
//!
//! [`PredefinedHost`] implements the contract for a small set of built-in
//! datatypes and operators so the engine (and its test suite) can run
//! standalone, playing the role the host MPI library plays in production.
//! It also serves as the reference for the reduce convention: `reduce(src,
//! dst)` computes `dst = src (+) dst` with `src` holding the contribution of
//! *earlier* ranks, which is what the executor's swap discipline preserves
//! for non-commutative operators.

use crate::error::{Error, Result};

/// Member index within a group. The wire format reserves 48 bits for roots,
/// so a 64-bit integer is used throughout.
pub type MemberIndex = u64;

/// Opaque host reduction-operator handle.
pub type OpToken = u64;
/// Opaque host datatype handle.
pub type DtToken = u64;

/// Relative placement of two members, as reported by the host's topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Distance {
    SameRank,
    L3,
    Socket,
    Host,
    Net,
}

/// Engine-internal view of a converted datatype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtInfo {
    /// Packed length of one element in bytes.
    pub len: usize,
    /// Whether elements are laid out contiguously in the user buffer.
    pub contig: bool,
}

/// Everything the engine requires from the embedding runtime.
pub trait HostOps {
    /// Apply the reduction: `dst = src (+) dst`, element-wise over `count`
    /// packed elements of `dtype`.
    fn reduce(&self, op: OpToken, src: &[u8], dst: &mut [u8], count: usize, dtype: DtToken);

    /// Whether the operator commutes.
    fn op_is_commute(&self, op: OpToken) -> bool;

    /// Stable small tags for `(op, dtype)`, used in cache signatures and by
    /// offload negotiation. `None` when the pair has no predefined tag.
    fn operate_param(&self, op: OpToken, dtype: DtToken) -> Option<(u16, u16)>;

    /// Convert an external datatype handle into the engine's view.
    fn dt_convert(&self, dtype: DtToken) -> Result<DtInfo>;

    /// Whether the datatype is one of the host's predefined ones.
    fn dt_is_predefined(&self, dtype: DtToken) -> bool;

    /// Total byte span of `count` elements in the user's layout, and the
    /// leading gap to the first byte.
    fn dt_span(&self, dtype: DtToken, count: usize) -> (usize, isize);

    /// Pack `count` elements from the user layout into contiguous bytes.
    fn dt_pack(&self, dtype: DtToken, src: &[u8], count: usize, dst: &mut [u8]);

    /// Unpack contiguous bytes back into the user layout.
    fn dt_unpack(&self, dtype: DtToken, src: &[u8], count: usize, dst: &mut [u8]);

    /// Distance between two members of the bootstrap communicator.
    fn rank_distance(&self, a: MemberIndex, b: MemberIndex) -> Distance;
}

/* ---------- Built-in datatypes and operators ---------- */

/// 32-bit signed integer.
pub const DT_I32: DtToken = 1;
/// 64-bit signed integer.
pub const DT_I64: DtToken = 2;
/// 64-bit unsigned integer.
pub const DT_U64: DtToken = 3;
/// 64-bit float.
pub const DT_F64: DtToken = 4;
/// 2x2 matrix of i64, row-major. Reduction by matrix product, which does not
/// commute; exists to exercise the swap discipline.
pub const DT_MAT2: DtToken = 5;
/// 32-bit signed integer with an 8-byte stride in the user layout. The only
/// built-in non-contiguous datatype.
pub const DT_I32_STRIDED: DtToken = 6;

pub const OP_SUM: OpToken = 1;
pub const OP_PROD: OpToken = 2;
pub const OP_MIN: OpToken = 3;
pub const OP_MAX: OpToken = 4;
/// Matrix product over [`DT_MAT2`]; the non-commutative operator.
pub const OP_MATMUL: OpToken = 5;

const STRIDE_EXTENT: usize = 8;

/// Host implementation backed by the built-in datatypes and operators.
///
/// Topology is synthesized from a processes-per-node / per-socket shape:
/// members land on node `index / ppn`, socket `(index % ppn) / pps`.
#[derive(Debug, Clone)]
pub struct PredefinedHost {
    ppn: u64,
    pps: u64,
}

impl Default for PredefinedHost {
    fn default() -> Self {
        // Degenerate shape: every member on its own node.
        Self { ppn: 1, pps: 1 }
    }
}

impl PredefinedHost {
    /// Host with `ppn` members per node, one socket per node.
    #[must_use]
    pub fn with_ppn(ppn: u64) -> Self {
        Self { ppn: ppn.max(1), pps: ppn.max(1) }
    }

    /// Host with an explicit node/socket shape.
    #[must_use]
    pub fn with_shape(ppn: u64, pps: u64) -> Self {
        Self { ppn: ppn.max(1), pps: pps.max(1).min(ppn.max(1)) }
    }

    fn elem_len(dtype: DtToken) -> Option<DtInfo> {
        match dtype {
            DT_I32 => Some(DtInfo { len: 4, contig: true }),
            DT_I64 | DT_U64 | DT_F64 => Some(DtInfo { len: 8, contig: true }),
            DT_MAT2 => Some(DtInfo { len: 32, contig: true }),
            DT_I32_STRIDED => Some(DtInfo { len: 4, contig: false }),
            _ => None,
        }
    }
}

macro_rules! reduce_numeric {
    ($ty:ty, $op:expr, $src:expr, $dst:expr, $count:expr) => {{
        let width = size_of::<$ty>();
        for i in 0..$count {
            let s = <$ty>::from_ne_bytes($src[i * width..(i + 1) * width].try_into().unwrap());
            let d = <$ty>::from_ne_bytes($dst[i * width..(i + 1) * width].try_into().unwrap());
            let r: $ty = match $op {
                OP_SUM => s + d,
                OP_PROD => s * d,
                OP_MIN => {
                    if s < d {
                        s
                    } else {
                        d
                    }
                }
                OP_MAX => {
                    if s > d {
                        s
                    } else {
                        d
                    }
                }
                _ => d,
            };
            $dst[i * width..(i + 1) * width].copy_from_slice(&r.to_ne_bytes());
        }
    }};
}

impl HostOps for PredefinedHost {
    fn reduce(&self, op: OpToken, src: &[u8], dst: &mut [u8], count: usize, dtype: DtToken) {
        match dtype {
            DT_I32 | DT_I32_STRIDED => reduce_numeric!(i32, op, src, dst, count),
            DT_I64 => reduce_numeric!(i64, op, src, dst, count),
            DT_U64 => reduce_numeric!(u64, op, src, dst, count),
            DT_F64 => reduce_numeric!(f64, op, src, dst, count),
            DT_MAT2 => {
                debug_assert_eq!(op, OP_MATMUL);
                for i in 0..count {
                    let at = i * 32;
                    let load = |buf: &[u8], j: usize| {
                        i64::from_ne_bytes(buf[at + j * 8..at + (j + 1) * 8].try_into().unwrap())
                    };
                    let (a, b, c, d) = (load(src, 0), load(src, 1), load(src, 2), load(src, 3));
                    let (e, f, g, h) = (load(dst, 0), load(dst, 1), load(dst, 2), load(dst, 3));
                    // dst = src * dst, row-major
                    let out = [a * e + b * g, a * f + b * h, c * e + d * g, c * f + d * h];
                    for (j, v) in out.iter().enumerate() {
                        dst[at + j * 8..at + (j + 1) * 8].copy_from_slice(&v.to_ne_bytes());
                    }
                }
            }
            _ => {}
        }
    }

    fn op_is_commute(&self, op: OpToken) -> bool {
        !matches!(op, OP_MATMUL)
    }

    fn operate_param(&self, op: OpToken, dtype: DtToken) -> Option<(u16, u16)> {
        if op <= OP_MATMUL && dtype <= DT_I32_STRIDED {
            Some((op as u16, dtype as u16))
        } else {
            None
        }
    }

    fn dt_convert(&self, dtype: DtToken) -> Result<DtInfo> {
        Self::elem_len(dtype).ok_or_else(|| Error::InvalidParam(format!("unknown datatype {dtype}")))
    }

    fn dt_is_predefined(&self, dtype: DtToken) -> bool {
        Self::elem_len(dtype).is_some()
    }

    fn dt_span(&self, dtype: DtToken, count: usize) -> (usize, isize) {
        match dtype {
            DT_I32_STRIDED if count > 0 => ((count - 1) * STRIDE_EXTENT + 4, 0),
            _ => {
                let len = Self::elem_len(dtype).map_or(0, |i| i.len);
                (count * len, 0)
            }
        }
    }

    fn dt_pack(&self, dtype: DtToken, src: &[u8], count: usize, dst: &mut [u8]) {
        if dtype == DT_I32_STRIDED {
            for i in 0..count {
                dst[i * 4..(i + 1) * 4]
                    .copy_from_slice(&src[i * STRIDE_EXTENT..i * STRIDE_EXTENT + 4]);
            }
        } else {
            let len = Self::elem_len(dtype).map_or(0, |i| i.len) * count;
            dst[..len].copy_from_slice(&src[..len]);
        }
    }

    fn dt_unpack(&self, dtype: DtToken, src: &[u8], count: usize, dst: &mut [u8]) {
        if dtype == DT_I32_STRIDED {
            for i in 0..count {
                dst[i * STRIDE_EXTENT..i * STRIDE_EXTENT + 4]
                    .copy_from_slice(&src[i * 4..(i + 1) * 4]);
            }
        } else {
            let len = Self::elem_len(dtype).map_or(0, |i| i.len) * count;
            dst[..len].copy_from_slice(&src[..len]);
        }
    }

    fn rank_distance(&self, a: MemberIndex, b: MemberIndex) -> Distance {
        if a == b {
            Distance::SameRank
        } else if a / self.ppn != b / self.ppn {
            Distance::Net
        } else if (a % self.ppn) / self.pps != (b % self.ppn) / self.pps {
            Distance::Host
        } else {
            Distance::Socket
        }
    }
}
