//! Vectorization rules for layout operators: transpose, reshape, expand
//! and unsqueeze.
//!
//! These operators move whole axes around, so a packed axis survives as
//! long as the axis algebra in [`super::axes`] can name its new position.
//! Reshape is the delicate one: only axis mappings that keep the packed
//! element runs contiguous may carry a packing through.

use smallvec::SmallVec;

use super::axes::{axis_after_unsqueeze, reshape_axis_map, transpose_axis, ReshapeAxisMap};
use super::{
    check_candidate, generate_vectorize_axes, pack_operand, unpack_result, VectorizeOptions,
    VectorizeRule,
};
use crate::expr::Expr;
use crate::ops::{AxisVec, DimVec, Op, PadFill};
use crate::pattern::{Match, Pattern};

pub struct TransposeVectorize {
    opts: VectorizeOptions,
}

impl TransposeVectorize {
    pub fn new(opts: VectorizeOptions) -> TransposeVectorize {
        TransposeVectorize { opts }
    }
}

impl VectorizeRule for TransposeVectorize {
    fn name(&self) -> &'static str {
        "vectorize-transpose"
    }

    fn pattern(&self) -> Pattern {
        Pattern::op("Transpose").with_name("root")
    }

    fn applies_to(&self, op: &Op) -> bool {
        matches!(op, Op::Transpose { .. })
    }

    fn candidates(&self, pat_match: &Match) -> Vec<Expr> {
        let root = pat_match.expect("root");
        let Some((Op::Transpose { perm }, args)) = root.as_call() else {
            return Vec::new();
        };
        let x = &args[0];
        let (Some(shape), Some(dtype)) = (x.fixed_shape(), x.checked_dtype()) else {
            return Vec::new();
        };
        let lane = self.opts.lane_for(dtype);
        let out_shape: DimVec = perm.iter().map(|&src| shape[src]).collect();

        let mut out = Vec::new();
        for axes in generate_vectorize_axes(self.opts.max_rank, shape.len()) {
            if axes.is_empty() || axes.iter().any(|&a| shape[a] <= 1) {
                continue;
            }
            let packed = pack_operand(x, &shape, &axes, lane, PadFill::Zero, &self.opts);
            let inner = Expr::call(Op::Transpose { perm: perm.clone() }, [packed.expr]);

            let out_axes: AxisVec = axes.iter().map(|&a| transpose_axis(perm, a)).collect();
            let record = packed.record.permuted(perm);
            let cand = unpack_result(&inner, &packed.lanes, &out_axes, &out_shape, &record);
            out.extend(check_candidate(cand, root));
        }
        out
    }
}

pub struct ReshapeVectorize {
    opts: VectorizeOptions,
}

impl ReshapeVectorize {
    pub fn new(opts: VectorizeOptions) -> ReshapeVectorize {
        ReshapeVectorize { opts }
    }
}

impl VectorizeRule for ReshapeVectorize {
    fn name(&self) -> &'static str {
        "vectorize-reshape"
    }

    fn pattern(&self) -> Pattern {
        Pattern::op("Reshape").with_name("root")
    }

    fn applies_to(&self, op: &Op) -> bool {
        matches!(op, Op::Reshape { .. })
    }

    fn candidates(&self, pat_match: &Match) -> Vec<Expr> {
        let root = pat_match.expect("root");
        let Some((Op::Reshape { shape: new_shape }, args)) = root.as_call() else {
            return Vec::new();
        };
        let x = &args[0];
        let (Some(shape), Some(dtype)) = (x.fixed_shape(), x.checked_dtype()) else {
            return Vec::new();
        };
        let lane = self.opts.lane_for(dtype);

        let mut out = Vec::new();
        'menu: for axes in generate_vectorize_axes(self.opts.max_rank, shape.len()) {
            if axes.is_empty() || axes.iter().any(|&a| shape[a] <= 1) {
                continue;
            }

            // Where does each packed axis land, and may it stay packed?
            let mut mapped: SmallVec<[(usize, usize, bool); 2]> = SmallVec::new();
            for &axis in &axes {
                let (out_axis, needs_exact) =
                    match reshape_axis_map(&shape, new_shape, axis) {
                        ReshapeAxisMap::One2One(n) | ReshapeAxisMap::UnsqueezeLike(n) => {
                            (n, false)
                        }
                        // A merged axis only keeps its runs contiguous if
                        // no fill sits between them.
                        ReshapeAxisMap::MergeFastest(n) => (n, true),
                        ReshapeAxisMap::Fragmenting => continue 'menu,
                    };
                if needs_exact && shape[axis] % lane != 0 {
                    continue 'menu;
                }
                if mapped.iter().any(|&(_, n, _)| n == out_axis) {
                    continue 'menu;
                }
                mapped.push((axis, out_axis, needs_exact));
            }

            let packed = pack_operand(x, &shape, &axes, lane, PadFill::Zero, &self.opts);

            // Target shape of the reshape in packed space: each mapped
            // output axis shrinks by the lane width (with padding folded
            // in for one-to-one carries).
            let mut inner_shape: DimVec = new_shape.clone();
            for &(axis, out_axis, needs_exact) in &mapped {
                let (_, pad_after) = packed.record.get(axis);
                inner_shape[out_axis] = if needs_exact {
                    new_shape[out_axis] / lane
                } else {
                    (shape[axis] + pad_after) / lane
                };
            }
            let inner = Expr::call(
                Op::Reshape { shape: inner_shape },
                [packed.expr],
            );

            let out_axes: AxisVec = mapped.iter().map(|&(_, n, _)| n).collect();
            let lanes: AxisVec = mapped.iter().map(|_| lane).collect();
            let record = packed.record.remapped(new_shape.len(), |axis| {
                mapped
                    .iter()
                    .find_map(|&(a, n, _)| (a == axis).then_some(n))
            });
            let cand = unpack_result(&inner, &lanes, &out_axes, new_shape, &record);
            out.extend(check_candidate(cand, root));
        }
        out
    }
}

pub struct ExpandVectorize {
    opts: VectorizeOptions,
}

impl ExpandVectorize {
    pub fn new(opts: VectorizeOptions) -> ExpandVectorize {
        ExpandVectorize { opts }
    }
}

impl VectorizeRule for ExpandVectorize {
    fn name(&self) -> &'static str {
        "vectorize-expand"
    }

    fn pattern(&self) -> Pattern {
        Pattern::op("Expand").with_name("root")
    }

    fn applies_to(&self, op: &Op) -> bool {
        matches!(op, Op::Expand { .. })
    }

    fn candidates(&self, pat_match: &Match) -> Vec<Expr> {
        let root = pat_match.expect("root");
        let Some((Op::Expand { shape: target }, args)) = root.as_call() else {
            return Vec::new();
        };
        let x = &args[0];
        let (Some(shape), Some(dtype)) = (x.fixed_shape(), x.checked_dtype()) else {
            return Vec::new();
        };
        let lane = self.opts.lane_for(dtype);
        let offset = target.len() - shape.len();

        let mut out = Vec::new();
        for axes in generate_vectorize_axes(self.opts.max_rank, shape.len()) {
            // Size-1 axes are the ones being broadcast; packing is only
            // meaningful on axes the input actually owns.
            if axes.is_empty() || axes.iter().any(|&a| shape[a] <= 1) {
                continue;
            }
            let packed = pack_operand(x, &shape, &axes, lane, PadFill::Zero, &self.opts);

            let mut inner_target: DimVec = target.clone();
            for (&axis, &packed_lane) in packed.axes.iter().zip(&packed.lanes) {
                let (_, pad_after) = packed.record.get(axis);
                inner_target[axis + offset] = (shape[axis] + pad_after) / packed_lane;
            }
            let inner = Expr::call(
                Op::Expand {
                    shape: inner_target,
                },
                [packed.expr],
            );

            let out_axes: AxisVec = axes.iter().map(|&a| a + offset).collect();
            let record = packed
                .record
                .remapped(target.len(), |axis| Some(axis + offset));
            let target_shape: DimVec = target.clone();
            let cand =
                unpack_result(&inner, &packed.lanes, &out_axes, &target_shape, &record);
            out.extend(check_candidate(cand, root));
        }
        out
    }
}

pub struct UnsqueezeVectorize {
    opts: VectorizeOptions,
}

impl UnsqueezeVectorize {
    pub fn new(opts: VectorizeOptions) -> UnsqueezeVectorize {
        UnsqueezeVectorize { opts }
    }
}

impl VectorizeRule for UnsqueezeVectorize {
    fn name(&self) -> &'static str {
        "vectorize-unsqueeze"
    }

    fn pattern(&self) -> Pattern {
        Pattern::op("Unsqueeze").with_name("root")
    }

    fn applies_to(&self, op: &Op) -> bool {
        matches!(op, Op::Unsqueeze { .. })
    }

    fn candidates(&self, pat_match: &Match) -> Vec<Expr> {
        let root = pat_match.expect("root");
        let Some((Op::Unsqueeze { axes: inserted }, args)) = root.as_call() else {
            return Vec::new();
        };
        let x = &args[0];
        let (Some(shape), Some(dtype)) = (x.fixed_shape(), x.checked_dtype()) else {
            return Vec::new();
        };
        let Some(out_shape) = root.fixed_shape() else {
            return Vec::new();
        };
        let lane = self.opts.lane_for(dtype);

        let mut out = Vec::new();
        for axes in generate_vectorize_axes(self.opts.max_rank, shape.len()) {
            if axes.is_empty() || axes.iter().any(|&a| shape[a] <= 1) {
                continue;
            }
            let packed = pack_operand(x, &shape, &axes, lane, PadFill::Zero, &self.opts);
            let inner = Expr::call(
                Op::Unsqueeze {
                    axes: inserted.clone(),
                },
                [packed.expr],
            );

            let out_axes: AxisVec = axes
                .iter()
                .map(|&a| axis_after_unsqueeze(a, inserted))
                .collect();
            let record = packed
                .record
                .remapped(out_shape.len(), |axis| {
                    Some(axis_after_unsqueeze(axis, inserted))
                });
            let cand = unpack_result(&inner, &packed.lanes, &out_axes, &out_shape, &record);
            out.extend(check_candidate(cand, root));
        }
        out
    }
}
