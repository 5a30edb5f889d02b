//! Vectorization rules for normalization operators.
//!
//! Normalizations reduce internally, so lane fill on a normalized axis
//! would corrupt the statistics. Softmax masks itself: `-inf` fill turns
//! into zero weight after the exponential. The mean/variance
//! normalizations instead record the fake element count in the
//! operator's `pad_tail`, which the kernel subtracts from its reduction.

use super::{
    check_candidate, generate_vectorize_axes, pack_operand, unpack_result, VectorizeOptions,
    VectorizeRule,
};
use crate::expr::Expr;
use crate::ops::{AxisVec, Op, PadFill, PadVec};
use crate::pattern::{Match, Pattern};

pub struct SoftmaxVectorize {
    opts: VectorizeOptions,
}

impl SoftmaxVectorize {
    pub fn new(opts: VectorizeOptions) -> SoftmaxVectorize {
        SoftmaxVectorize { opts }
    }
}

impl VectorizeRule for SoftmaxVectorize {
    fn name(&self) -> &'static str {
        "vectorize-softmax"
    }

    fn pattern(&self) -> Pattern {
        Pattern::op("Softmax").with_name("root")
    }

    fn applies_to(&self, op: &Op) -> bool {
        matches!(op, Op::Softmax { .. })
    }

    fn candidates(&self, pat_match: &Match) -> Vec<Expr> {
        let root = pat_match.expect("root");
        let Some((&Op::Softmax { axis }, args)) = root.as_call() else {
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
            // `exp(-inf) == 0`: fill on the softmax axis drops out of the
            // normalizing sum by itself.
            let fill = if axes.contains(&axis) {
                PadFill::NegInf
            } else {
                PadFill::Zero
            };
            let packed = pack_operand(x, &shape, &axes, lane, fill, &self.opts);
            let inner = Expr::call(Op::Softmax { axis }, [packed.expr]);
            let cand =
                unpack_result(&inner, &packed.lanes, &packed.axes, &shape, &packed.record);
            out.extend(check_candidate(cand, root));
        }
        out
    }
}

pub struct LayerNormVectorize {
    opts: VectorizeOptions,
}

impl LayerNormVectorize {
    pub fn new(opts: VectorizeOptions) -> LayerNormVectorize {
        LayerNormVectorize { opts }
    }
}

impl VectorizeRule for LayerNormVectorize {
    fn name(&self) -> &'static str {
        "vectorize-layer-norm"
    }

    fn pattern(&self) -> Pattern {
        Pattern::op("LayerNorm").with_name("root")
    }

    fn applies_to(&self, op: &Op) -> bool {
        matches!(op, Op::LayerNorm { .. })
    }

    fn candidates(&self, pat_match: &Match) -> Vec<Expr> {
        let root = pat_match.expect("root");
        let Some((
            Op::LayerNorm {
                axis,
                epsilon,
                pad_tail,
            },
            args,
        )) = root.as_call()
        else {
            return Vec::new();
        };
        if !pad_tail.is_empty() {
            return Vec::new();
        }
        let (x, scale, bias) = (&args[0], &args[1], &args[2]);
        let (Some(shape), Some(dtype)) = (x.fixed_shape(), x.checked_dtype()) else {
            return Vec::new();
        };
        let (Some(scale_shape), Some(bias_shape)) = (scale.fixed_shape(), bias.fixed_shape())
        else {
            return Vec::new();
        };
        let lane = self.opts.lane_for(dtype);

        let mut out = Vec::new();
        for axes in generate_vectorize_axes(self.opts.max_rank, shape.len()) {
            if axes.is_empty() || axes.iter().any(|&a| shape[a] <= 1) {
                continue;
            }
            let packed = pack_operand(x, &shape, &axes, lane, PadFill::Zero, &self.opts);

            // Packed axes inside the normalized suffix add fake elements
            // to the internal mean/variance; the kernel is told how many
            // to ignore per axis.
            let mut tail = PadVec::new();
            let mut suffix_axes = AxisVec::new();
            for &a in &axes {
                if a >= *axis {
                    let (_, pad_after) = packed.record.get(a);
                    if pad_after > 0 {
                        tail.push((a, pad_after));
                    }
                    suffix_axes.push(a - *axis);
                }
            }
            // The per-element scale and bias pack in lockstep with the
            // normalized suffix they multiply.
            let pack_param = |param: &Expr, param_shape: &[usize]| {
                if suffix_axes.is_empty() {
                    param.clone()
                } else {
                    pack_operand(
                        param,
                        param_shape,
                        &suffix_axes,
                        lane,
                        PadFill::Zero,
                        &self.opts,
                    )
                    .expr
                }
            };
            let inner = Expr::call(
                Op::LayerNorm {
                    axis: *axis,
                    epsilon: *epsilon,
                    pad_tail: tail,
                },
                [
                    packed.expr,
                    pack_param(scale, &scale_shape),
                    pack_param(bias, &bias_shape),
                ],
            );
            let cand =
                unpack_result(&inner, &packed.lanes, &packed.axes, &shape, &packed.record);
            out.extend(check_candidate(cand, root));
        }
        out
    }
}

pub struct InstanceNormVectorize {
    opts: VectorizeOptions,
}

impl InstanceNormVectorize {
    pub fn new(opts: VectorizeOptions) -> InstanceNormVectorize {
        InstanceNormVectorize { opts }
    }
}

impl VectorizeRule for InstanceNormVectorize {
    fn name(&self) -> &'static str {
        "vectorize-instance-norm"
    }

    fn pattern(&self) -> Pattern {
        Pattern::op("InstanceNorm").with_name("root")
    }

    fn applies_to(&self, op: &Op) -> bool {
        matches!(op, Op::InstanceNorm { .. })
    }

    fn candidates(&self, pat_match: &Match) -> Vec<Expr> {
        let root = pat_match.expect("root");
        let Some((Op::InstanceNorm { epsilon, pad_tail }, args)) = root.as_call() else {
            return Vec::new();
        };
        if !pad_tail.is_empty() {
            return Vec::new();
        }
        let (x, scale, bias) = (&args[0], &args[1], &args[2]);
        let (Some(shape), Some(dtype)) = (x.fixed_shape(), x.checked_dtype()) else {
            return Vec::new();
        };
        let lane = self.opts.lane_for(dtype);
        let channels = shape[1];

        let mut out = Vec::new();
        for axes in generate_vectorize_axes(self.opts.max_rank, shape.len()) {
            if axes.is_empty() || axes.iter().any(|&a| shape[a] <= 1) {
                continue;
            }
            let packed = pack_operand(x, &shape, &axes, lane, PadFill::Zero, &self.opts);

            // Statistics are per (n, c) over the spatial axes.
            let mut tail = PadVec::new();
            for &a in &axes {
                if a >= 2 {
                    let (_, pad_after) = packed.record.get(a);
                    if pad_after > 0 {
                        tail.push((a, pad_after));
                    }
                }
            }
            let channel_packed = axes.contains(&1);
            let pack_param = |param: &Expr| {
                if channel_packed {
                    pack_operand(
                        param,
                        &[channels],
                        &[0],
                        lane,
                        PadFill::Zero,
                        &self.opts,
                    )
                    .expr
                } else {
                    param.clone()
                }
            };
            let inner = Expr::call(
                Op::InstanceNorm {
                    epsilon: *epsilon,
                    pad_tail: tail,
                },
                [packed.expr, pack_param(scale), pack_param(bias)],
            );
            let cand =
                unpack_result(&inner, &packed.lanes, &packed.axes, &shape, &packed.record);
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

    fn float_var(name: &str, shape: &[usize]) -> Expr {
        Expr::var(name, TensorType::fixed(DataType::Float, shape))
    }

    fn candidates(rule: &dyn VectorizeRule, graph: &Expr) -> Vec<Expr> {
        let pat_match = rule.pattern().test(graph).expect("pattern should match");
        rule.candidates(&pat_match)
    }

    fn opts() -> VectorizeOptions {
        VectorizeOptions {
            lane_bytes: 128,
            ..Default::default()
        }
    }

    #[test]
    fn test_softmax_axis_uses_neg_inf_fill() {
        let graph = Expr::call(Op::Softmax { axis: 1 }, [float_var("x", &[4, 100])]);
        let cands = candidates(&SoftmaxVectorize::new(opts()), &graph);
        assert_eq!(cands.len(), 2);

        // Find the pad feeding the axis-1 candidate's pack.
        let fills: Vec<PadFill> = cands
            .iter()
            .filter_map(|cand| {
                let mut node = cand.clone();
                loop {
                    let (op, args) = node.as_call()?;
                    if let Op::Pad { fill, .. } = op {
                        return Some(*fill);
                    }
                    node = args[0].clone();
                }
            })
            .collect();
        assert_eq!(fills, [PadFill::Zero, PadFill::NegInf]);
    }

    #[test]
    fn test_layer_norm_records_pad_tail() {
        let graph = Expr::call(
            Op::LayerNorm {
                axis: 1,
                epsilon: 1e-5,
                pad_tail: PadVec::new(),
            },
            [
                float_var("x", &[4, 100]),
                float_var("scale", &[100]),
                float_var("bias", &[100]),
            ],
        );
        let cands = candidates(&LayerNormVectorize::new(opts()), &graph);
        assert_eq!(cands.len(), 2);

        // Axis 1 lies in the normalized suffix and is padded 100 -> 128,
        // so the packed kernel must ignore 28 fake elements.
        let inner = |cand: &Expr| -> Op {
            let mut node = cand.clone();
            loop {
                let (op, args) = node.as_call().unwrap();
                if matches!(op, Op::LayerNorm { .. }) {
                    return op.clone();
                }
                node = args[0].clone();
            }
        };
        let Op::LayerNorm { pad_tail, .. } = inner(&cands[0]) else {
            unreachable!()
        };
        assert!(pad_tail.is_empty());
        let Op::LayerNorm { pad_tail, .. } = inner(&cands[1]) else {
            unreachable!()
        };
        assert_eq!(pad_tail.as_slice(), &[(1, 28)]);
    }

    #[test]
    fn test_layer_norm_packs_scale_and_bias_with_suffix() {
        let graph = Expr::call(
            Op::LayerNorm {
                axis: 1,
                epsilon: 1e-5,
                pad_tail: PadVec::new(),
            },
            [
                float_var("x", &[4, 64]),
                float_var("scale", &[64]),
                float_var("bias", &[64]),
            ],
        );
        let cands = candidates(&LayerNormVectorize::new(opts()), &graph);
        assert_eq!(cands.len(), 2);

        // Axis-1 candidate: scale and bias are packed alongside x.
        let (op, args) = cands[1].as_call().unwrap();
        assert!(matches!(op, Op::Unpack(_)));
        let (_, norm_args) = args[0].as_call().unwrap();
        assert!(matches!(norm_args[1].as_call().unwrap().0, Op::Pack(_)));
        assert!(matches!(norm_args[2].as_call().unwrap().0, Op::Pack(_)));
    }

    #[test]
    fn test_instance_norm_channel_packing() {
        let graph = Expr::call(
            Op::InstanceNorm {
                epsilon: 1e-5,
                pad_tail: PadVec::new(),
            },
            [
                float_var("x", &[1, 64, 8, 8]),
                float_var("scale", &[64]),
                float_var("bias", &[64]),
            ],
        );
        let cands = candidates(&InstanceNormVectorize::new(opts()), &graph);
        // Axes 1, 2 and 3 are packable (axis 0 has extent 1).
        assert_eq!(cands.len(), 3);
        for cand in &cands {
            assert_eq!(
                cand.fixed_shape().as_deref(),
                Some(&[1usize, 64, 8, 8][..])
            );
        }

        // Spatial packing (8 -> 32) must report its fake elements.
        let find_norm = |cand: &Expr| -> Op {
            let mut node = cand.clone();
            loop {
                let (op, args) = node.as_call().unwrap();
                if matches!(op, Op::InstanceNorm { .. }) {
                    return op.clone();
                }
                node = args[0].clone();
            }
        };
        let Op::InstanceNorm { pad_tail, .. } = find_norm(&cands[1]) else {
            unreachable!()
        };
        assert_eq!(pad_tail.as_slice(), &[(2, 24)]);
    }
}
