//! Vectorization rule for `ResizeImage`.
//!
//! Resampling reads neighbor elements along the spatial axes, so those
//! stay unpacked; only the batch and channel axes of the `[N, C, H, W]`
//! input may pack.

use super::{
    check_candidate, generate_vectorize_axes, pack_operand, unpack_result, VectorizeOptions,
    VectorizeRule,
};
use crate::expr::Expr;
use crate::ops::{Op, PadFill};
use crate::pattern::{Match, Pattern};

pub struct ResizeImageVectorize {
    opts: VectorizeOptions,
}

impl ResizeImageVectorize {
    pub fn new(opts: VectorizeOptions) -> ResizeImageVectorize {
        ResizeImageVectorize { opts }
    }
}

impl VectorizeRule for ResizeImageVectorize {
    fn name(&self) -> &'static str {
        "vectorize-resize-image"
    }

    fn pattern(&self) -> Pattern {
        Pattern::op("ResizeImage").with_name("root")
    }

    fn applies_to(&self, op: &Op) -> bool {
        matches!(op, Op::ResizeImage { .. })
    }

    fn candidates(&self, pat_match: &Match) -> Vec<Expr> {
        let root = pat_match.expect("root");
        let Some((
            &Op::ResizeImage {
                scale_h,
                scale_w,
                mode,
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

        let mut out = Vec::new();
        for axes in generate_vectorize_axes(self.opts.max_rank, shape.len()) {
            if axes.is_empty()
                || axes.iter().any(|&a| a >= 2 || shape[a] <= 1)
            {
                continue;
            }
            let packed = pack_operand(x, &shape, &axes, lane, PadFill::Zero, &self.opts);
            let inner = Expr::call(
                Op::ResizeImage {
                    scale_h,
                    scale_w,
                    mode,
                },
                [packed.expr],
            );
            // The batch/channel axes keep their positions and padding.
            let cand = unpack_result(
                &inner,
                &packed.lanes,
                &packed.axes,
                &out_shape,
                &packed.record,
            );
            out.extend(check_candidate(cand, root));
        }
        out
    }
}
