//! Vectorization rules for elementwise operators: unary and binary math,
//! comparisons, select and cast.
//!
//! Elementwise operators are lane-oblivious, so any axis set is legal and
//! the whole candidate menu is emitted. Broadcast operands are packed
//! only on axes where they actually have extent; size-1 axes keep
//! broadcasting against the packed extent.

use super::pad::{find_minimum_pad, pad_for_vectorize, PadRecord};
use super::{
    check_candidate, generate_vectorize_axes, pack_operand, unpack_result, VectorizeOptions,
    VectorizeRule,
};
use crate::expr::Expr;
use crate::ops::{AxisVec, LaneRescale, MaskVectorStyle, Op, PackAxes, PadFill};
use crate::pattern::{Match, Pattern};
use crate::tensor::broadcast_shapes;

/// Map a set of output axes to the axes of one broadcast operand.
///
/// Axes the operand lacks, or has extent 1 on, are dropped: the operand
/// stays unpacked there and broadcasts against the packed extent.
fn operand_axes(out_axes: &[usize], out_rank: usize, shape: &[usize]) -> AxisVec {
    let offset = out_rank - shape.len();
    out_axes
        .iter()
        .filter_map(|&out_axis| {
            let axis = out_axis.checked_sub(offset)?;
            (shape[axis] > 1).then_some(axis)
        })
        .collect()
}

/// Pad record for the broadcast output of a candidate.
fn output_record(
    out_shape: &[usize],
    axes: &[usize],
    lane: usize,
    fanout: usize,
) -> PadRecord {
    let mut record = PadRecord::zero(out_shape.len());
    for &axis in axes {
        let (init, extra) = find_minimum_pad(out_shape[axis], lane, fanout);
        record.set(axis, (0, init + extra));
    }
    record
}

pub struct UnaryVectorize {
    opts: VectorizeOptions,
}

impl UnaryVectorize {
    pub fn new(opts: VectorizeOptions) -> UnaryVectorize {
        UnaryVectorize { opts }
    }
}

impl VectorizeRule for UnaryVectorize {
    fn name(&self) -> &'static str {
        "vectorize-unary"
    }

    fn pattern(&self) -> Pattern {
        Pattern::op_family("Unary", |op| matches!(op, Op::Unary(_))).with_name("root")
    }

    fn applies_to(&self, op: &Op) -> bool {
        matches!(op, Op::Unary(_))
    }

    fn candidates(&self, pat_match: &Match) -> Vec<Expr> {
        let root = pat_match.expect("root");
        let Some((&Op::Unary(op), args)) = root.as_call() else {
            return Vec::new();
        };
        let x = &args[0];
        let (Some(shape), Some(dtype)) = (x.fixed_shape(), x.checked_dtype()) else {
            return Vec::new();
        };
        let lane = self.opts.lane_for(dtype);

        let mut out = Vec::new();
        for axes in generate_vectorize_axes(self.opts.max_rank, shape.len()) {
            if axes.is_empty() || axes.iter().any(|&a| shape[a] <= 1) {
                continue;
            }
            let packed = pack_operand(x, &shape, &axes, lane, PadFill::Zero, &self.opts);
            let inner = Expr::call(Op::Unary(op), [packed.expr]);
            let cand =
                unpack_result(&inner, &packed.lanes, &packed.axes, &shape, &packed.record);
            out.extend(check_candidate(cand, root));
        }
        out
    }
}

pub struct BinaryVectorize {
    opts: VectorizeOptions,
}

impl BinaryVectorize {
    pub fn new(opts: VectorizeOptions) -> BinaryVectorize {
        BinaryVectorize { opts }
    }
}

impl VectorizeRule for BinaryVectorize {
    fn name(&self) -> &'static str {
        "vectorize-binary"
    }

    fn pattern(&self) -> Pattern {
        Pattern::op_family("Binary", |op| matches!(op, Op::Binary(_))).with_name("root")
    }

    fn applies_to(&self, op: &Op) -> bool {
        matches!(op, Op::Binary(_))
    }

    fn candidates(&self, pat_match: &Match) -> Vec<Expr> {
        let root = pat_match.expect("root");
        let Some((&Op::Binary(op), args)) = root.as_call() else {
            return Vec::new();
        };
        let (a, b) = (&args[0], &args[1]);
        let (Some(a_shape), Some(b_shape)) = (a.fixed_shape(), b.fixed_shape()) else {
            return Vec::new();
        };
        let Some(out_shape) = broadcast_shapes(&a_shape, &b_shape) else {
            return Vec::new();
        };
        let Some(dtype) = a.checked_dtype() else {
            return Vec::new();
        };
        let lane = self.opts.lane_for(dtype);

        let mut out = Vec::new();
        for axes in generate_vectorize_axes(self.opts.max_rank, out_shape.len()) {
            if axes.is_empty() || axes.iter().any(|&ax| out_shape[ax] <= 1) {
                continue;
            }
            let pack_side = |arg: &Expr, shape: &[usize]| {
                let arg_axes = operand_axes(&axes, out_shape.len(), shape);
                if arg_axes.is_empty() {
                    arg.clone()
                } else {
                    pack_operand(arg, shape, &arg_axes, lane, PadFill::Zero, &self.opts).expr
                }
            };
            let inner = Expr::call(
                Op::Binary(op),
                [pack_side(a, &a_shape), pack_side(b, &b_shape)],
            );
            let record =
                output_record(&out_shape, &axes, lane, self.opts.hierarchy_fanout);
            let lanes: AxisVec = axes.iter().map(|_| lane).collect();
            let cand = unpack_result(&inner, &lanes, &axes, &out_shape, &record);
            out.extend(check_candidate(cand, root));
        }
        out
    }
}

pub struct CompareVectorize {
    opts: VectorizeOptions,
}

impl CompareVectorize {
    pub fn new(opts: VectorizeOptions) -> CompareVectorize {
        CompareVectorize { opts }
    }
}

impl VectorizeRule for CompareVectorize {
    fn name(&self) -> &'static str {
        "vectorize-compare"
    }

    fn pattern(&self) -> Pattern {
        Pattern::op_family("Compare", |op| matches!(op, Op::Compare(_))).with_name("root")
    }

    fn applies_to(&self, op: &Op) -> bool {
        matches!(op, Op::Compare(_))
    }

    fn candidates(&self, pat_match: &Match) -> Vec<Expr> {
        let root = pat_match.expect("root");
        let Some((&Op::Compare(op), args)) = root.as_call() else {
            return Vec::new();
        };
        let (a, b) = (&args[0], &args[1]);
        let (Some(a_shape), Some(b_shape)) = (a.fixed_shape(), b.fixed_shape()) else {
            return Vec::new();
        };
        let Some(out_shape) = broadcast_shapes(&a_shape, &b_shape) else {
            return Vec::new();
        };
        let Some(dtype) = a.checked_dtype() else {
            return Vec::new();
        };
        // The comparison result is a mask; producing one in vector form
        // must be allowed by the mask style.
        match self.opts.mask_style {
            MaskVectorStyle::None => return Vec::new(),
            MaskVectorStyle::Thin if dtype.size_bytes() != 1 => return Vec::new(),
            _ => {}
        }
        let lane = self.opts.lane_for(dtype);

        let mut out = Vec::new();
        for axes in generate_vectorize_axes(self.opts.max_rank, out_shape.len()) {
            if axes.is_empty() || axes.iter().any(|&ax| out_shape[ax] <= 1) {
                continue;
            }
            let pack_side = |arg: &Expr, shape: &[usize]| {
                let arg_axes = operand_axes(&axes, out_shape.len(), shape);
                if arg_axes.is_empty() {
                    arg.clone()
                } else {
                    pack_operand(arg, shape, &arg_axes, lane, PadFill::Zero, &self.opts).expr
                }
            };
            let inner = Expr::call(
                Op::Compare(op),
                [pack_side(a, &a_shape), pack_side(b, &b_shape)],
            );
            let record =
                output_record(&out_shape, &axes, lane, self.opts.hierarchy_fanout);
            let lanes: AxisVec = axes.iter().map(|_| lane).collect();
            let cand = unpack_result(&inner, &lanes, &axes, &out_shape, &record);
            out.extend(check_candidate(cand, root));
        }
        out
    }
}

pub struct WhereVectorize {
    opts: VectorizeOptions,
}

impl WhereVectorize {
    pub fn new(opts: VectorizeOptions) -> WhereVectorize {
        WhereVectorize { opts }
    }
}

impl WhereVectorize {
    /// Pad and pack the mask operand using the configured mask style.
    fn pack_mask(&self, mask: &Expr, shape: &[usize], axes: &[usize], lane: usize) -> Expr {
        let lanes: AxisVec = axes.iter().map(|_| lane).collect();
        let (padded, _) = pad_for_vectorize(
            mask,
            shape,
            axes,
            &lanes,
            PadFill::Zero,
            self.opts.hierarchy_fanout,
        );
        Expr::call(
            Op::PackMask {
                pack: PackAxes::new(lanes, AxisVec::from_slice(axes)),
                style: self.opts.mask_style,
            },
            [padded],
        )
    }
}

impl VectorizeRule for WhereVectorize {
    fn name(&self) -> &'static str {
        "vectorize-where"
    }

    fn pattern(&self) -> Pattern {
        Pattern::op("Where").with_name("root")
    }

    fn applies_to(&self, op: &Op) -> bool {
        matches!(op, Op::Where)
    }

    fn candidates(&self, pat_match: &Match) -> Vec<Expr> {
        let root = pat_match.expect("root");
        let Some((Op::Where, args)) = root.as_call() else {
            return Vec::new();
        };
        let (mask, a, b) = (&args[0], &args[1], &args[2]);
        let (Some(mask_shape), Some(a_shape), Some(b_shape)) =
            (mask.fixed_shape(), a.fixed_shape(), b.fixed_shape())
        else {
            return Vec::new();
        };
        let Some(data_shape) = broadcast_shapes(&a_shape, &b_shape) else {
            return Vec::new();
        };
        let Some(out_shape) = broadcast_shapes(&mask_shape, &data_shape) else {
            return Vec::new();
        };
        let Some(dtype) = a.checked_dtype() else {
            return Vec::new();
        };
        match self.opts.mask_style {
            MaskVectorStyle::None => return Vec::new(),
            MaskVectorStyle::Thin if dtype.size_bytes() != 1 => return Vec::new(),
            _ => {}
        }
        let lane = self.opts.lane_for(dtype);

        let mut out = Vec::new();
        for axes in generate_vectorize_axes(self.opts.max_rank, out_shape.len()) {
            if axes.is_empty() || axes.iter().any(|&ax| out_shape[ax] <= 1) {
                continue;
            }
            let pack_data = |arg: &Expr, shape: &[usize]| {
                let arg_axes = operand_axes(&axes, out_shape.len(), shape);
                if arg_axes.is_empty() {
                    arg.clone()
                } else {
                    pack_operand(arg, shape, &arg_axes, lane, PadFill::Zero, &self.opts).expr
                }
            };
            let mask_axes = operand_axes(&axes, out_shape.len(), &mask_shape);
            let packed_mask = if mask_axes.is_empty() {
                mask.clone()
            } else {
                self.pack_mask(mask, &mask_shape, &mask_axes, lane)
            };
            let inner = Expr::call(
                Op::Where,
                [packed_mask, pack_data(a, &a_shape), pack_data(b, &b_shape)],
            );
            let record =
                output_record(&out_shape, &axes, lane, self.opts.hierarchy_fanout);
            let lanes: AxisVec = axes.iter().map(|_| lane).collect();
            let cand = unpack_result(&inner, &lanes, &axes, &out_shape, &record);
            out.extend(check_candidate(cand, root));
        }
        out
    }
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

pub struct CastVectorize {
    opts: VectorizeOptions,
}

impl CastVectorize {
    pub fn new(opts: VectorizeOptions) -> CastVectorize {
        CastVectorize { opts }
    }
}

impl VectorizeRule for CastVectorize {
    fn name(&self) -> &'static str {
        "vectorize-cast"
    }

    fn pattern(&self) -> Pattern {
        Pattern::op("Cast").with_name("root")
    }

    fn applies_to(&self, op: &Op) -> bool {
        matches!(op, Op::Cast { .. })
    }

    fn candidates(&self, pat_match: &Match) -> Vec<Expr> {
        let root = pat_match.expect("root");
        let Some((Op::Cast { to, rescale }, args)) = root.as_call() else {
            return Vec::new();
        };
        // Lane-rescaling casts are themselves products of this rule.
        if rescale.is_some() {
            return Vec::new();
        }
        let x = &args[0];
        let (Some(shape), Some(in_dtype)) = (x.fixed_shape(), x.checked_dtype()) else {
            return Vec::new();
        };
        let in_lane = self.opts.lane_for(in_dtype);
        let out_lane = self.opts.lane_for(*to);
        // Pad so the axis divides evenly under both the input and the
        // output lane width; the lane boundary then survives the cast.
        let pad_lane = in_lane / gcd(in_lane, out_lane) * out_lane;

        let mut out = Vec::new();
        for axes in generate_vectorize_axes(self.opts.max_rank, shape.len()) {
            if axes.is_empty() || axes.iter().any(|&a| shape[a] <= 1) {
                continue;
            }
            // `pad_lane` only controls how far the axes are padded; the
            // pack itself uses the input lane width.
            let pad_lanes: AxisVec = axes.iter().map(|_| pad_lane).collect();
            let (padded, record) = pad_for_vectorize(
                x,
                &shape,
                &axes,
                &pad_lanes,
                PadFill::Zero,
                self.opts.hierarchy_fanout,
            );
            let in_lanes: AxisVec = axes.iter().map(|_| in_lane).collect();
            let out_lanes: AxisVec = axes.iter().map(|_| out_lane).collect();
            let packed = Expr::call(
                Op::Pack(PackAxes::new(in_lanes.clone(), axes.clone())),
                [padded],
            );

            let rescale = (in_lane != out_lane).then(|| LaneRescale {
                axes: axes.clone(),
                in_lanes: in_lanes.clone(),
                out_lanes: out_lanes.clone(),
            });
            let inner = Expr::call(Op::Cast { to: *to, rescale }, [packed]);
            let cand = unpack_result(&inner, &out_lanes, &axes, &shape, &record);
            out.extend(check_candidate(cand, root));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{Expr, TensorType};
    use crate::ops::{DimVec, UnaryOp};
    use crate::value::DataType;

    fn float_var(name: &str, shape: &[usize]) -> Expr {
        Expr::var(name, TensorType::fixed(DataType::Float, shape))
    }

    fn rule_candidates(rule: &dyn VectorizeRule, graph: &Expr) -> Vec<Expr> {
        let pat_match = rule.pattern().test(graph).expect("pattern should match");
        rule.candidates(&pat_match)
    }

    #[test]
    fn test_unary_candidates_per_axis() {
        let opts = VectorizeOptions {
            lane_bytes: 128,
            ..Default::default()
        };
        let graph = float_var("x", &[36, 64]).unary(UnaryOp::Exp);
        let cands = rule_candidates(&UnaryVectorize::new(opts), &graph);
        // One candidate per single axis; the empty axis set is skipped.
        assert_eq!(cands.len(), 2);
        for cand in &cands {
            assert_eq!(cand.fixed_shape().as_deref(), Some(&[36usize, 64][..]));
        }
    }

    #[test]
    fn test_unary_skips_size_one_axes() {
        let opts = VectorizeOptions {
            lane_bytes: 128,
            ..Default::default()
        };
        let graph = float_var("x", &[1, 64]).unary(UnaryOp::Abs);
        let cands = rule_candidates(&UnaryVectorize::new(opts), &graph);
        assert_eq!(cands.len(), 1);
    }

    #[test]
    fn test_unary_declines_unknown_shape() {
        use crate::expr::Dimension;
        let opts = VectorizeOptions::default();
        let x = Expr::var(
            "x",
            TensorType::new(DataType::Float, &[Dimension::Unknown, Dimension::Fixed(8)]),
        );
        let graph = x.unary(UnaryOp::Neg);
        assert!(rule_candidates(&UnaryVectorize::new(opts), &graph).is_empty());
    }

    #[test]
    fn test_binary_exact_divisible_axis_needs_no_trim() {
        let opts = VectorizeOptions {
            lane_bytes: 128,
            ..Default::default()
        };
        // f32 lane is 32 and both dims divide by it, so neither operand is
        // padded and the result needs no trailing slice.
        let graph = float_var("a", &[64, 128]) + float_var("b", &[64, 128]);
        let cands = rule_candidates(&BinaryVectorize::new(opts), &graph);
        assert_eq!(cands.len(), 2);
        for cand in &cands {
            let (op, _) = cand.as_call().unwrap();
            assert!(matches!(op, Op::Unpack(_)), "top of {:?} should unpack", cand);
        }
    }

    #[test]
    fn test_binary_broadcast_operand_stays_unpacked() {
        let opts = VectorizeOptions {
            lane_bytes: 128,
            ..Default::default()
        };
        let graph = float_var("a", &[4, 64]) + float_var("b", &[64]);
        let cands = rule_candidates(&BinaryVectorize::new(opts), &graph);
        assert_eq!(cands.len(), 2);

        // Candidate packing axis 0 packs only `a`; `b` has no axis there.
        let axis0 = &cands[0];
        assert_eq!(axis0.fixed_shape().as_deref(), Some(&[4usize, 64][..]));
    }

    #[test]
    fn test_compare_respects_mask_style() {
        let graph = Expr::call(
            Op::Compare(crate::ops::CompareOp::Less),
            [float_var("a", &[64]), float_var("b", &[64])],
        );

        let none_opts = VectorizeOptions {
            mask_style: MaskVectorStyle::None,
            ..Default::default()
        };
        assert!(rule_candidates(&CompareVectorize::new(none_opts), &graph).is_empty());

        // Thin masks require 1-byte data elements.
        let thin_opts = VectorizeOptions {
            mask_style: MaskVectorStyle::Thin,
            ..Default::default()
        };
        assert!(rule_candidates(&CompareVectorize::new(thin_opts), &graph).is_empty());

        let fat_opts = VectorizeOptions::default();
        assert!(!rule_candidates(&CompareVectorize::new(fat_opts), &graph).is_empty());
    }

    #[test]
    fn test_where_packs_mask_with_mask_op() {
        let opts = VectorizeOptions {
            lane_bytes: 128,
            ..Default::default()
        };
        let mask = Expr::var("m", TensorType::fixed(DataType::UInt8, &[64]));
        let graph = Expr::call(
            Op::Where,
            [mask, float_var("a", &[64]), float_var("b", &[64])],
        );
        let cands = rule_candidates(&WhereVectorize::new(opts), &graph);
        assert_eq!(cands.len(), 1);

        let (op, args) = cands[0].as_call().unwrap();
        assert!(matches!(op, Op::Unpack(_)));
        let (inner_op, inner_args) = args[0].as_call().unwrap();
        assert!(matches!(inner_op, Op::Where));
        assert!(matches!(
            inner_args[0].as_call().unwrap().0,
            Op::PackMask { .. }
        ));
    }

    #[test]
    fn test_cast_rescales_lanes() {
        let opts = VectorizeOptions {
            lane_bytes: 128,
            ..Default::default()
        };
        let x = Expr::var("x", TensorType::fixed(DataType::Float, &[256]));
        let graph = Expr::call(
            Op::Cast {
                to: DataType::Int8,
                rescale: None,
            },
            [x],
        );
        let cands = rule_candidates(&CastVectorize::new(opts), &graph);
        assert_eq!(cands.len(), 1);

        let cand = &cands[0];
        assert_eq!(cand.fixed_shape().as_deref(), Some(&[256usize][..]));
        // f32 lane is 32, i8 lane is 128. The packed extent shrinks from
        // 256/32 = 8 supers to 256/128 = 2.
        let (op, args) = cand.as_call().unwrap();
        let Op::Unpack(pack) = op else {
            panic!("expected unpack at {:?}", cand)
        };
        assert_eq!(pack.lanes(), &[128]);
        let (cast_op, _) = args[0].as_call().unwrap();
        let Op::Cast {
            rescale: Some(rescale),
            ..
        } = cast_op
        else {
            panic!("expected rescaling cast")
        };
        assert_eq!(rescale.in_lanes.as_slice(), &[32]);
        assert_eq!(rescale.out_lanes.as_slice(), &[128]);

        let shape: Option<DimVec> = args[0].fixed_shape();
        assert_eq!(shape.as_deref(), Some(&[2usize][..]));
    }
}
