//! The vectorization rewrite engine.
//!
//! Each submodule contributes [`VectorizeRule`]s for one operator family.
//! A rule is a pure function from a pattern match to a list of fully
//! type-checked candidate rewrites, each of the shape
//! pad → pack → lane-aware operator → unpack → trim. Rules never mutate
//! the graph; the driver in [`crate::rewrite`] owns substitution.

use crate::expr::Expr;
use crate::ops::{AxisVec, MaskVectorStyle, Op, PackAxes, PadFill};
use crate::pattern::{Match, Pattern};
use crate::value::DataType;

pub mod axes;
pub mod pad;

mod conv;
mod elementwise;
mod fold;
mod layout;
mod matmul;
mod movement;
mod norm;
mod reduce;
mod resize;

#[cfg(test)]
mod tests;

pub use conv::{Conv2DVectorize, LowerConv2D};
pub use elementwise::{
    BinaryVectorize, CastVectorize, CompareVectorize, UnaryVectorize, WhereVectorize,
};
pub use fold::{
    FoldNopDevectorize, FoldNopVectorize, FoldVectorizeConcatDevectorize,
    FoldVectorizeDevectorize, PropagateDevectorizeBinary, PropagateDevectorizeTranspose,
    PropagateDevectorizeUnary,
};
pub use layout::{ExpandVectorize, ReshapeVectorize, TransposeVectorize, UnsqueezeVectorize};
pub use matmul::MatMulVectorize;
pub use movement::{ConcatVectorize, GatherVectorize, ScatterNdVectorize, SliceVectorize};
pub use norm::{InstanceNormVectorize, LayerNormVectorize, SoftmaxVectorize};
pub use reduce::ReduceVectorize;
pub use resize::ResizeImageVectorize;

use pad::PadRecord;

/// Static configuration for the vectorizer.
///
/// This is threaded explicitly through rule construction; rules hold a
/// copy and stay pure functions of their match.
#[derive(Copy, Clone, Debug)]
pub struct VectorizeOptions {
    /// Width of the hardware vector in bytes. The per-operand lane count
    /// is `lane_bytes / element_size`.
    pub lane_bytes: usize,

    /// Upper bound on how many axes may be jointly packed per operand
    /// (1 or 2 in practice).
    pub max_rank: usize,

    /// Tiling factor imposed by a downstream multi-core/multi-chip plan.
    /// 1 for single-core targets.
    pub hierarchy_fanout: usize,

    /// How vectorized boolean masks are represented.
    pub mask_style: MaskVectorStyle,
}

impl Default for VectorizeOptions {
    fn default() -> VectorizeOptions {
        VectorizeOptions {
            lane_bytes: 32,
            max_rank: 1,
            hierarchy_fanout: 1,
            mask_style: MaskVectorStyle::Fat,
        }
    }
}

impl VectorizeOptions {
    /// Lane element count for operands of a given element type.
    pub fn lane_for(&self, dtype: DataType) -> usize {
        (self.lane_bytes / dtype.size_bytes()).max(1)
    }
}

/// Lazily yield every candidate axis set for one operand: the empty set,
/// then every single axis, then (if `max_rank > 1`) every unordered pair.
pub fn generate_vectorize_axes(
    max_rank: usize,
    rank: usize,
) -> impl Iterator<Item = AxisVec> {
    let singles = (0..rank).map(|axis| AxisVec::from_slice(&[axis]));
    let pair_count = if max_rank > 1 && rank > 1 {
        rank * (rank - 1) / 2
    } else {
        0
    };
    let pairs = (0..rank)
        .flat_map(move |i| (i + 1..rank).map(move |j| AxisVec::from_slice(&[i, j])))
        .take(pair_count);
    std::iter::once(AxisVec::new()).chain(singles).chain(pairs)
}

/// A vectorization or canonicalization rewrite rule.
///
/// Rules are pure: the same match and configuration always produce the
/// same candidates, in the same order. [`replace`](Self::replace) keeps
/// the historical first-candidate-wins behavior for drivers without a
/// cost model; the emission order is a compatibility guarantee, not a
/// claim of optimality.
pub trait VectorizeRule {
    /// Identifier used in diagnostics.
    fn name(&self) -> &'static str;

    /// The pattern the driver matches against graph nodes.
    fn pattern(&self) -> Pattern;

    /// True if this rule is responsible for the given operator. Used by
    /// the driver's unsupported-operator check.
    fn applies_to(&self, op: &Op) -> bool;

    /// Produce zero or more fully-formed candidate replacements for a
    /// match. An empty list means "pattern matched but no legal
    /// vectorization exists" and is the expected majority outcome.
    fn candidates(&self, pat_match: &Match) -> Vec<Expr>;

    /// Return the first candidate, if any.
    fn replace(&self, pat_match: &Match) -> Option<Expr> {
        self.candidates(pat_match).into_iter().next()
    }
}

/// The full rule set for a configuration, in application order.
pub fn default_rules(opts: VectorizeOptions) -> Vec<Box<dyn VectorizeRule>> {
    vec![
        Box::new(UnaryVectorize::new(opts)),
        Box::new(BinaryVectorize::new(opts)),
        Box::new(CompareVectorize::new(opts)),
        Box::new(WhereVectorize::new(opts)),
        Box::new(CastVectorize::new(opts)),
        Box::new(ReduceVectorize::new(opts)),
        Box::new(MatMulVectorize::new(opts)),
        // The packed conv lowering is preferred when legal; the plain
        // im2col lowering is the fallback.
        Box::new(Conv2DVectorize::new(opts)),
        Box::new(LowerConv2D::new()),
        Box::new(TransposeVectorize::new(opts)),
        Box::new(ReshapeVectorize::new(opts)),
        Box::new(ExpandVectorize::new(opts)),
        Box::new(UnsqueezeVectorize::new(opts)),
        Box::new(SliceVectorize::new(opts)),
        Box::new(ConcatVectorize::new(opts)),
        Box::new(GatherVectorize::new(opts)),
        Box::new(ScatterNdVectorize::new(opts)),
        Box::new(SoftmaxVectorize::new(opts)),
        Box::new(LayerNormVectorize::new(opts)),
        Box::new(InstanceNormVectorize::new(opts)),
        Box::new(ResizeImageVectorize::new(opts)),
    ]
}

/// Cancellation and propagation rules, applied opportunistically to keep
/// the graph canonical as other rules fire.
pub fn fold_rules() -> Vec<Box<dyn VectorizeRule>> {
    vec![
        Box::new(FoldVectorizeDevectorize),
        Box::new(FoldNopVectorize),
        Box::new(FoldNopDevectorize),
        Box::new(FoldVectorizeConcatDevectorize),
        Box::new(PropagateDevectorizeUnary),
        Box::new(PropagateDevectorizeBinary),
        Box::new(PropagateDevectorizeTranspose),
    ]
}

/// One packed operand of a candidate: the pad+pack expression plus the
/// bookkeeping needed to undo it.
pub(crate) struct PackedOperand {
    pub expr: Expr,
    pub record: PadRecord,
    pub lanes: AxisVec,
    pub axes: AxisVec,
}

/// Pad `expr` on `axes` and wrap it in a `Pack`.
pub(crate) fn pack_operand(
    expr: &Expr,
    shape: &[usize],
    axes: &[usize],
    lane: usize,
    fill: PadFill,
    opts: &VectorizeOptions,
) -> PackedOperand {
    let lanes: AxisVec = axes.iter().map(|_| lane).collect();
    let (padded, record) =
        pad::pad_for_vectorize(expr, shape, axes, &lanes, fill, opts.hierarchy_fanout);
    let packed = Expr::call(
        Op::Pack(PackAxes::new(lanes.clone(), AxisVec::from_slice(axes))),
        [padded],
    );
    PackedOperand {
        expr: packed,
        record,
        lanes,
        axes: AxisVec::from_slice(axes),
    }
}

/// Unpack a candidate's result and trim it back to `target_shape` using
/// the pad record produced when its input was packed.
pub(crate) fn unpack_result(
    expr: &Expr,
    lanes: &[usize],
    axes: &[usize],
    target_shape: &[usize],
    record: &PadRecord,
) -> Expr {
    let unpacked = Expr::call(
        Op::Unpack(PackAxes::new(
            AxisVec::from_slice(lanes),
            AxisVec::from_slice(axes),
        )),
        [expr.clone()],
    );
    pad::slice_for_vectorize(&unpacked, target_shape, record)
}

/// Admit a candidate only if it type-checks to the same type as the
/// expression it replaces. Invalid construction is an expected outcome of
/// speculative rewrites, never an error; a changed shape or dtype means a
/// rule's pad bookkeeping did not cover some axis.
pub(crate) fn check_candidate(expr: Expr, replaces: &Expr) -> Option<Expr> {
    if expr.checked_type().is_invalid() {
        return None;
    }
    (expr.checked_type() == replaces.checked_type()).then_some(expr)
}
