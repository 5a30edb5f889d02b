//! Vectorization rules for data-movement operators: slice, concat,
//! gather and scatter.
//!
//! These operators relocate whole rows, so packing is legal exactly when
//! the packed runs are never cut: slice bounds must sit on lane
//! boundaries, concatenated pieces must need no fill at the seam, and
//! indexed axes must stay unpacked.

use super::pad::{find_minimum_pad, PadRecord};
use super::{
    check_candidate, generate_vectorize_axes, pack_operand, unpack_result, VectorizeOptions,
    VectorizeRule,
};
use crate::expr::Expr;
use crate::ops::{AxisVec, DimVec, Op, PadFill};
use crate::pattern::{Match, Pattern};
use crate::vectorize::axes::axis_after_gather;

pub struct SliceVectorize {
    opts: VectorizeOptions,
}

impl SliceVectorize {
    pub fn new(opts: VectorizeOptions) -> SliceVectorize {
        SliceVectorize { opts }
    }
}

impl VectorizeRule for SliceVectorize {
    fn name(&self) -> &'static str {
        "vectorize-slice"
    }

    fn pattern(&self) -> Pattern {
        Pattern::op("Slice").with_name("root")
    }

    fn applies_to(&self, op: &Op) -> bool {
        matches!(op, Op::Slice { .. })
    }

    fn candidates(&self, pat_match: &Match) -> Vec<Expr> {
        let root = pat_match.expect("root");
        let Some((Op::Slice { starts, ends }, args)) = root.as_call() else {
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
            // Packed axes must be fill-free and cut on lane boundaries.
            // Hierarchy padding counts as fill: it would shift the scaled
            // bounds, so such an axis is declined rather than packed.
            for &a in &axes {
                if starts[a] % lane != 0 || ends[a] % lane != 0 {
                    continue 'menu;
                }
                let (init, extra) =
                    find_minimum_pad(shape[a], lane, self.opts.hierarchy_fanout);
                if init + extra != 0 {
                    continue 'menu;
                }
            }

            let packed = pack_operand(x, &shape, &axes, lane, PadFill::Zero, &self.opts);
            debug_assert!(packed.record.is_zero());

            let inner_starts: DimVec = starts
                .iter()
                .enumerate()
                .map(|(a, &s)| if axes.contains(&a) { s / lane } else { s })
                .collect();
            let inner_ends: DimVec = ends
                .iter()
                .enumerate()
                .map(|(a, &e)| if axes.contains(&a) { e / lane } else { e })
                .collect();
            let inner = Expr::call(
                Op::Slice {
                    starts: inner_starts,
                    ends: inner_ends,
                },
                [packed.expr],
            );

            let out_shape: DimVec = starts.iter().zip(ends).map(|(&s, &e)| e - s).collect();
            let record = PadRecord::zero(out_shape.len());
            let cand = unpack_result(&inner, &packed.lanes, &axes, &out_shape, &record);
            out.extend(check_candidate(cand, root));
        }
        out
    }
}

pub struct ConcatVectorize {
    opts: VectorizeOptions,
}

impl ConcatVectorize {
    pub fn new(opts: VectorizeOptions) -> ConcatVectorize {
        ConcatVectorize { opts }
    }
}

impl VectorizeRule for ConcatVectorize {
    fn name(&self) -> &'static str {
        "vectorize-concat"
    }

    fn pattern(&self) -> Pattern {
        Pattern::op("Concat").with_name("root")
    }

    fn applies_to(&self, op: &Op) -> bool {
        matches!(op, Op::Concat { .. })
    }

    fn candidates(&self, pat_match: &Match) -> Vec<Expr> {
        let root = pat_match.expect("root");
        let Some((&Op::Concat { axis: cat_axis }, args)) = root.as_call() else {
            return Vec::new();
        };
        let Some(items) = args[0].as_tuple() else {
            return Vec::new();
        };
        let Some(item_shapes) = items
            .iter()
            .map(|item| item.fixed_shape())
            .collect::<Option<Vec<_>>>()
        else {
            return Vec::new();
        };
        let (Some(out_shape), Some(dtype)) = (root.fixed_shape(), items[0].checked_dtype())
        else {
            return Vec::new();
        };
        let lane = self.opts.lane_for(dtype);

        let mut out = Vec::new();
        for axes in generate_vectorize_axes(self.opts.max_rank, out_shape.len()) {
            if axes.is_empty() || axes.iter().any(|&a| out_shape[a] <= 1) {
                continue;
            }
            // Fill at the seam would land in the middle of the output, so
            // a packed concat axis requires every piece to come through
            // with no pad at all, hierarchy pad included.
            if axes.contains(&cat_axis)
                && item_shapes.iter().any(|s| {
                    let (init, extra) =
                        find_minimum_pad(s[cat_axis], lane, self.opts.hierarchy_fanout);
                    init + extra != 0
                })
            {
                continue;
            }

            let packed_items: Vec<Expr> = items
                .iter()
                .zip(&item_shapes)
                .map(|(item, shape)| {
                    pack_operand(item, shape, &axes, lane, PadFill::Zero, &self.opts).expr
                })
                .collect();
            let inner = Expr::call(
                Op::Concat { axis: cat_axis },
                [Expr::tuple(packed_items)],
            );

            let mut record = PadRecord::zero(out_shape.len());
            for &a in &axes {
                if a != cat_axis {
                    let (init, extra) =
                        find_minimum_pad(out_shape[a], lane, self.opts.hierarchy_fanout);
                    record.set(a, (0, init + extra));
                }
            }
            let lanes: AxisVec = axes.iter().map(|_| lane).collect();
            let cand = unpack_result(&inner, &lanes, &axes, &out_shape, &record);
            out.extend(check_candidate(cand, root));
        }
        out
    }
}

pub struct GatherVectorize {
    opts: VectorizeOptions,
}

impl GatherVectorize {
    pub fn new(opts: VectorizeOptions) -> GatherVectorize {
        GatherVectorize { opts }
    }
}

impl VectorizeRule for GatherVectorize {
    fn name(&self) -> &'static str {
        "vectorize-gather"
    }

    fn pattern(&self) -> Pattern {
        Pattern::op("Gather").with_name("root")
    }

    fn applies_to(&self, op: &Op) -> bool {
        matches!(op, Op::Gather { .. })
    }

    fn candidates(&self, pat_match: &Match) -> Vec<Expr> {
        let root = pat_match.expect("root");
        let Some((&Op::Gather { axis: gather_axis }, args)) = root.as_call() else {
            return Vec::new();
        };
        let (data, indices) = (&args[0], &args[1]);
        let (Some(shape), Some(dtype)) = (data.fixed_shape(), data.checked_dtype()) else {
            return Vec::new();
        };
        let (Some(idx_shape), Some(out_shape)) = (indices.fixed_shape(), root.fixed_shape())
        else {
            return Vec::new();
        };
        let lane = self.opts.lane_for(dtype);

        let mut out = Vec::new();
        for axes in generate_vectorize_axes(self.opts.max_rank, shape.len()) {
            // The gathered axis is addressed element-by-element and must
            // stay unpacked.
            if axes.is_empty()
                || axes.contains(&gather_axis)
                || axes.iter().any(|&a| shape[a] <= 1)
            {
                continue;
            }
            let packed = pack_operand(data, &shape, &axes, lane, PadFill::Zero, &self.opts);
            let inner = Expr::call(
                Op::Gather { axis: gather_axis },
                [packed.expr, indices.clone()],
            );

            let out_axes: AxisVec = axes
                .iter()
                .filter_map(|&a| axis_after_gather(a, gather_axis, idx_shape.len()))
                .collect();
            let record = packed.record.remapped(out_shape.len(), |a| {
                axis_after_gather(a, gather_axis, idx_shape.len())
            });
            let cand = unpack_result(&inner, &packed.lanes, &out_axes, &out_shape, &record);
            out.extend(check_candidate(cand, root));
        }
        out
    }
}

pub struct ScatterNdVectorize {
    opts: VectorizeOptions,
}

impl ScatterNdVectorize {
    pub fn new(opts: VectorizeOptions) -> ScatterNdVectorize {
        ScatterNdVectorize { opts }
    }
}

impl VectorizeRule for ScatterNdVectorize {
    fn name(&self) -> &'static str {
        "vectorize-scatter-nd"
    }

    fn pattern(&self) -> Pattern {
        Pattern::op("ScatterNd").with_name("root")
    }

    fn applies_to(&self, op: &Op) -> bool {
        matches!(op, Op::ScatterNd)
    }

    fn candidates(&self, pat_match: &Match) -> Vec<Expr> {
        let root = pat_match.expect("root");
        let Some((Op::ScatterNd, args)) = root.as_call() else {
            return Vec::new();
        };
        let (data, indices, updates) = (&args[0], &args[1], &args[2]);
        let (Some(shape), Some(dtype)) = (data.fixed_shape(), data.checked_dtype()) else {
            return Vec::new();
        };
        let (Some(idx_shape), Some(upd_shape)) =
            (indices.fixed_shape(), updates.fixed_shape())
        else {
            return Vec::new();
        };
        // `indices` is `[m, k]`: each row addresses a slice through the
        // first `k` data axes.
        let k = idx_shape[1];
        let lane = self.opts.lane_for(dtype);

        let mut out = Vec::new();
        for axes in generate_vectorize_axes(self.opts.max_rank, shape.len()) {
            if axes.is_empty()
                || axes.iter().any(|&a| a < k || shape[a] <= 1)
            {
                continue;
            }
            let packed_data =
                pack_operand(data, &shape, &axes, lane, PadFill::Zero, &self.opts);
            // The same axes of each update slice pack identically; slice
            // axis `a` of the data is axis `a - k + 1` of the updates.
            let upd_axes: AxisVec = axes.iter().map(|&a| a - k + 1).collect();
            let packed_updates = pack_operand(
                updates,
                &upd_shape,
                &upd_axes,
                lane,
                PadFill::Zero,
                &self.opts,
            );
            let inner = Expr::call(
                Op::ScatterNd,
                [packed_data.expr, indices.clone(), packed_updates.expr],
            );
            let cand = unpack_result(
                &inner,
                &packed_data.lanes,
                &axes,
                &shape,
                &packed_data.record,
            );
            out.extend(check_candidate(cand, root));
        }
        out
    }
}
