//! Vectorization rule for `Reduce`.
//!
//! Packing a reduced axis turns the reduction lane-consuming: the kernel
//! reduces across lanes as well as across packed groups, and the packed
//! axis disappears from the output with no unpack step. The padding fill
//! must then be the reduction's identity element, which is why `Mean`
//! never packs a reduced axis (zeros would be counted in the divisor).

use super::pad::reduce_fill;
use super::{
    check_candidate, generate_vectorize_axes, pack_operand, unpack_result, VectorizeOptions,
    VectorizeRule,
};
use crate::expr::Expr;
use crate::ops::{AxisVec, Op, ReduceOp};
use crate::pattern::{Match, Pattern};
use crate::vectorize::axes::axis_after_reduce;

pub struct ReduceVectorize {
    opts: VectorizeOptions,
}

impl ReduceVectorize {
    pub fn new(opts: VectorizeOptions) -> ReduceVectorize {
        ReduceVectorize { opts }
    }
}

impl VectorizeRule for ReduceVectorize {
    fn name(&self) -> &'static str {
        "vectorize-reduce"
    }

    fn pattern(&self) -> Pattern {
        Pattern::op("Reduce").with_name("root")
    }

    fn applies_to(&self, op: &Op) -> bool {
        matches!(op, Op::Reduce { .. })
    }

    fn candidates(&self, pat_match: &Match) -> Vec<Expr> {
        let root = pat_match.expect("root");
        let Some((
            Op::Reduce {
                op,
                axes: reduce_axes,
                keep_dims,
            },
            args,
        )) = root.as_call()
        else {
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
        let fill = reduce_fill(*op);

        let mut out = Vec::new();
        for pack_axes in generate_vectorize_axes(self.opts.max_rank, shape.len()) {
            if pack_axes.is_empty() || pack_axes.iter().any(|&a| shape[a] <= 1) {
                continue;
            }
            // A lane of zero fill would shift the mean's divisor.
            if *op == ReduceOp::Mean
                && pack_axes.iter().any(|a| reduce_axes.contains(a))
            {
                continue;
            }

            let packed =
                pack_operand(x, &shape, &pack_axes, lane, fill, &self.opts);
            let inner = Expr::call(
                Op::Reduce {
                    op: *op,
                    axes: reduce_axes.clone(),
                    keep_dims: *keep_dims,
                },
                [packed.expr],
            );

            // Packed axes that are themselves reduced vanish with the
            // reduction; only the survivors are unpacked, at their
            // post-reduction positions.
            let survivors: Vec<(usize, usize)> = pack_axes
                .iter()
                .filter_map(|&a| {
                    axis_after_reduce(a, reduce_axes, *keep_dims).map(|out_axis| (a, out_axis))
                })
                .collect();

            let cand = if survivors.is_empty() {
                inner
            } else {
                let out_axes: AxisVec = survivors.iter().map(|&(_, o)| o).collect();
                let lanes: AxisVec = survivors.iter().map(|_| lane).collect();
                let record = packed.record.remapped(out_shape.len(), |axis| {
                    axis_after_reduce(axis, reduce_axes, *keep_dims)
                });
                unpack_result(&inner, &lanes, &out_axes, &out_shape, &record)
            };
            out.extend(check_candidate(cand, root));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{Expr, TensorType};
    use crate::value::DataType;

    fn reduce(op: ReduceOp, x: Expr, axes: &[usize], keep_dims: bool) -> Expr {
        Expr::call(
            Op::Reduce {
                op,
                axes: AxisVec::from_slice(axes),
                keep_dims,
            },
            [x],
        )
    }

    fn float_var(name: &str, shape: &[usize]) -> Expr {
        Expr::var(name, TensorType::fixed(DataType::Float, shape))
    }

    fn candidates(opts: VectorizeOptions, graph: &Expr) -> Vec<Expr> {
        let rule = ReduceVectorize::new(opts);
        let pat_match = rule.pattern().test(graph).expect("pattern should match");
        rule.candidates(&pat_match)
    }

    #[test]
    fn test_packed_reduced_axis_is_lane_consuming() {
        let opts = VectorizeOptions {
            lane_bytes: 128,
            ..Default::default()
        };
        let graph = reduce(ReduceOp::Max, float_var("x", &[4, 100]), &[1], false);
        let cands = candidates(opts, &graph);
        assert_eq!(cands.len(), 2);

        // The axis-1 candidate reduces the packed axis away entirely; no
        // unpack or trim step follows the reduction.
        let k_cand = &cands[1];
        assert!(matches!(k_cand.as_call().unwrap().0, Op::Reduce { .. }));
        assert_eq!(k_cand.fixed_shape().as_deref(), Some(&[4usize][..]));

        // The axis-0 candidate packs a surviving axis and must unpack.
        let m_cand = &cands[0];
        assert!(matches!(m_cand.as_call().unwrap().0, Op::Slice { .. }));
        assert_eq!(m_cand.fixed_shape().as_deref(), Some(&[4usize][..]));
    }

    #[test]
    fn test_mean_never_packs_reduced_axis() {
        let opts = VectorizeOptions {
            lane_bytes: 128,
            ..Default::default()
        };
        let graph = reduce(ReduceOp::Mean, float_var("x", &[4, 100]), &[0, 1], false);
        assert!(candidates(opts, &graph).is_empty());

        // A surviving axis is still fair game for `Mean`.
        let graph = reduce(ReduceOp::Mean, float_var("x", &[4, 100]), &[1], false);
        let cands = candidates(opts, &graph);
        assert_eq!(cands.len(), 1);
        assert_eq!(cands[0].fixed_shape().as_deref(), Some(&[4usize][..]));
    }

    #[test]
    fn test_keep_dims_preserves_axis_positions() {
        let opts = VectorizeOptions {
            lane_bytes: 128,
            ..Default::default()
        };
        let graph = reduce(ReduceOp::Sum, float_var("x", &[36, 64]), &[1], true);
        let cands = candidates(opts, &graph);
        assert_eq!(cands.len(), 2);
        for cand in &cands {
            assert_eq!(cand.fixed_shape().as_deref(), Some(&[36usize, 1][..]));
        }
    }
}
