//! Padding and trimming protocol for lane packing.
//!
//! [`pad_for_vectorize`] extends the selected axes so they divide evenly by
//! the lane width (and tile evenly across a sharding hierarchy), and
//! returns the [`PadRecord`] describing exactly what it did. The record is
//! consumed verbatim by [`slice_for_vectorize`] after unpacking — it is
//! never recomputed, which is what guarantees the pad/trim pair is an
//! exact inverse.

use crate::expr::Expr;
use crate::ops::{Op, PadFill, PadVec, ReduceOp};

/// Per-axis `(before, after)` padding applied to a tensor before packing.
///
/// Axes that were not selected for packing carry a `(0, 0)` entry.
#[derive(Clone, Debug, PartialEq)]
pub struct PadRecord {
    pads: PadVec,
}

impl PadRecord {
    /// Create an all-zero record for a tensor of the given rank.
    pub fn zero(rank: usize) -> PadRecord {
        PadRecord {
            pads: (0..rank).map(|_| (0, 0)).collect(),
        }
    }

    pub fn rank(&self) -> usize {
        self.pads.len()
    }

    pub fn get(&self, axis: usize) -> (usize, usize) {
        self.pads[axis]
    }

    pub fn set(&mut self, axis: usize, pad: (usize, usize)) {
        self.pads[axis] = pad;
    }

    /// True if no axis carries any padding.
    pub fn is_zero(&self) -> bool {
        self.pads.iter().all(|&(before, after)| before == 0 && after == 0)
    }

    pub fn pads(&self) -> &[(usize, usize)] {
        &self.pads
    }

    /// Return the record with its axes rearranged by a permutation, for
    /// carrying a record through a transpose. `perm[i]` is the source axis
    /// of output axis `i`.
    pub fn permuted(&self, perm: &[usize]) -> PadRecord {
        PadRecord {
            pads: perm.iter().map(|&src| self.pads[src]).collect(),
        }
    }

    /// Build a record of rank `new_rank` by relocating each axis through
    /// `map`. Axes that map to `None` are dropped; unmapped output axes are
    /// zero.
    pub fn remapped(
        &self,
        new_rank: usize,
        map: impl Fn(usize) -> Option<usize>,
    ) -> PadRecord {
        let mut out = PadRecord::zero(new_rank);
        for (axis, &pad) in self.pads.iter().enumerate() {
            if let Some(new_axis) = map(axis) {
                out.pads[new_axis] = pad;
            }
        }
        out
    }
}

/// Compute `(init_pad, extra_pad)` for one axis.
///
/// `dim + init_pad` is the smallest multiple of `lane` at or above `dim`.
/// `extra_pad` then grows in whole-lane increments until the packed extent
/// `(dim + init_pad + extra_pad) / lane` is a multiple of
/// `hierarchy_fanout`, so the packed tensor tiles evenly across a
/// downstream compute hierarchy.
pub fn find_minimum_pad(dim: usize, lane: usize, hierarchy_fanout: usize) -> (usize, usize) {
    assert!(lane > 0 && hierarchy_fanout > 0, "invalid pad parameters");
    let init_pad = (lane - dim % lane) % lane;
    let mut extra_pad = 0;
    while ((dim + init_pad + extra_pad) / lane) % hierarchy_fanout != 0 {
        extra_pad += lane;
    }
    (init_pad, extra_pad)
}

/// Pad `expr` (of fixed shape `shape`) so every axis in `axes` divides
/// evenly by the matching lane width, using `fill` for the new elements.
///
/// Returns the padded expression and the record to later hand to
/// [`slice_for_vectorize`]. When no axis needs padding the input
/// expression is returned unchanged.
pub fn pad_for_vectorize(
    expr: &Expr,
    shape: &[usize],
    axes: &[usize],
    lanes: &[usize],
    fill: PadFill,
    hierarchy_fanout: usize,
) -> (Expr, PadRecord) {
    assert_eq!(axes.len(), lanes.len(), "pad axes/lanes arity mismatch");
    let mut record = PadRecord::zero(shape.len());
    for (&axis, &lane) in axes.iter().zip(lanes) {
        let (init, extra) = find_minimum_pad(shape[axis], lane, hierarchy_fanout);
        record.set(axis, (0, init + extra));
    }
    if record.is_zero() {
        return (expr.clone(), record);
    }
    let padded = Expr::call(
        Op::Pad {
            pads: record.pads.clone(),
            fill,
        },
        [expr.clone()],
    );
    (padded, record)
}

/// Trim a just-unpacked expression back to `target_shape`, undoing the
/// padding described by `record`.
///
/// This is an exact no-op (the input is returned unchanged) when the
/// record is all-zero. The record must be the one produced by the matching
/// [`pad_for_vectorize`] call.
pub fn slice_for_vectorize(expr: &Expr, target_shape: &[usize], record: &PadRecord) -> Expr {
    debug_assert_eq!(target_shape.len(), record.rank());
    if record.is_zero() {
        return expr.clone();
    }
    Expr::call(
        Op::Slice {
            starts: target_shape.iter().map(|_| 0).collect(),
            ends: target_shape.iter().copied().collect(),
        },
        [expr.clone()],
    )
}

/// Fill element for padding the input of a reduction.
pub fn reduce_fill(op: ReduceOp) -> PadFill {
    match op {
        ReduceOp::Sum | ReduceOp::Mean => PadFill::Zero,
        ReduceOp::Max => PadFill::NegInf,
        ReduceOp::Min => PadFill::PosInf,
    }
}

#[cfg(test)]
mod tests {
    use super::{find_minimum_pad, pad_for_vectorize, slice_for_vectorize, PadRecord};
    use crate::expr::{Expr, TensorType};
    use crate::ops::{Op, PadFill};
    use crate::value::DataType;

    #[test]
    fn test_find_minimum_pad() {
        struct Case {
            dim: usize,
            lane: usize,
            fanout: usize,
            expected: (usize, usize),
        }

        let cases = [
            Case {
                dim: 36,
                lane: 32,
                fanout: 1,
                expected: (28, 0),
            },
            Case {
                dim: 64,
                lane: 32,
                fanout: 1,
                expected: (0, 0),
            },
            Case {
                dim: 1,
                lane: 8,
                fanout: 1,
                expected: (7, 0),
            },
            // 36 -> 64 = 2 lanes; 2 is not divisible by 4, so two more
            // whole lanes are appended.
            Case {
                dim: 36,
                lane: 32,
                fanout: 4,
                expected: (28, 64),
            },
            Case {
                dim: 64,
                lane: 32,
                fanout: 2,
                expected: (0, 0),
            },
        ];

        for (i, case) in cases.iter().enumerate() {
            assert_eq!(
                find_minimum_pad(case.dim, case.lane, case.fanout),
                case.expected,
                "case {}",
                i
            );
        }
    }

    #[test]
    fn test_pad_then_trim_restores_shape() {
        let x = Expr::var("x", TensorType::fixed(DataType::Float, &[36, 64, 128]));
        let (padded, record) =
            pad_for_vectorize(&x, &[36, 64, 128], &[0], &[32], PadFill::Zero, 1);
        assert_eq!(record.get(0), (0, 28));
        assert_eq!(record.get(1), (0, 0));
        assert_eq!(record.get(2), (0, 0));
        assert_eq!(
            padded.fixed_shape().as_deref(),
            Some(&[64usize, 64, 128][..])
        );

        let trimmed = slice_for_vectorize(&padded, &[36, 64, 128], &record);
        assert_eq!(
            trimmed.fixed_shape().as_deref(),
            Some(&[36usize, 64, 128][..])
        );
    }

    #[test]
    fn test_zero_pad_is_noop() {
        let x = Expr::var("x", TensorType::fixed(DataType::Float, &[32, 64]));
        let (padded, record) = pad_for_vectorize(&x, &[32, 64], &[0], &[32], PadFill::Zero, 1);
        assert!(record.is_zero());
        assert!(padded.ptr_eq(&x));

        let trimmed = slice_for_vectorize(&padded, &[32, 64], &record);
        assert!(trimmed.ptr_eq(&x));
        assert!(!matches!(trimmed.as_call(), Some((Op::Slice { .. }, _))));
    }

    #[test]
    fn test_record_permute_and_remap() {
        let mut record = PadRecord::zero(3);
        record.set(0, (0, 28));
        let permuted = record.permuted(&[2, 0, 1]);
        assert_eq!(permuted.get(1), (0, 28));
        assert_eq!(permuted.get(0), (0, 0));

        let remapped = record.remapped(2, |axis| match axis {
            0 => Some(1),
            _ => None,
        });
        assert_eq!(remapped.get(1), (0, 28));
        assert_eq!(remapped.get(0), (0, 0));
    }
}
