//! Vectorization rule for `MatMul`.
//!
//! Unlike the elementwise rules, matmul does not enumerate the generic
//! axis menu: the two operands' packings must agree on the contraction
//! axis, so the rule emits a fixed list of known-good pairings instead.
//! Packing K on both sides sets the `pack_k` flag, which tells the kernel
//! to also reduce across lanes while contracting; zero fill makes the
//! padded K tail contribute nothing.

use super::pad::{pad_for_vectorize, PadRecord};
use super::{check_candidate, unpack_result, VectorizeOptions, VectorizeRule};
use crate::expr::Expr;
use crate::ops::{AxisVec, Op, PackAxes, PadFill};
use crate::pattern::{Match, Pattern};

/// Which of an operand's two innermost axes are packed in one pairing.
#[derive(Copy, Clone)]
struct OperandPacking {
    outer: bool,
    inner: bool,
}

/// One legal joint packing of both matmul operands.
struct Pairing {
    a: OperandPacking,
    b: OperandPacking,
    pack_k: bool,
}

const NOT_PACKED: OperandPacking = OperandPacking {
    outer: false,
    inner: false,
};

pub struct MatMulVectorize {
    opts: VectorizeOptions,
}

impl MatMulVectorize {
    pub fn new(opts: VectorizeOptions) -> MatMulVectorize {
        MatMulVectorize { opts }
    }

    /// The pairings tried, in emission order. Pairings that pack two axes
    /// of one operand are only available when `max_rank` allows.
    fn pairings(&self) -> Vec<Pairing> {
        // For `a` the outer role is M and the inner role is K; for `b`
        // the outer role is K and the inner role is N.
        let mut pairings = vec![Pairing {
            a: NOT_PACKED,
            b: OperandPacking {
                outer: false,
                inner: true,
            },
            pack_k: false,
        }];
        if self.opts.max_rank > 1 {
            pairings.push(Pairing {
                a: OperandPacking {
                    outer: true,
                    inner: false,
                },
                b: OperandPacking {
                    outer: false,
                    inner: true,
                },
                pack_k: false,
            });
            pairings.push(Pairing {
                a: OperandPacking {
                    outer: true,
                    inner: true,
                },
                b: OperandPacking {
                    outer: true,
                    inner: true,
                },
                pack_k: true,
            });
            pairings.push(Pairing {
                a: OperandPacking {
                    outer: false,
                    inner: true,
                },
                b: OperandPacking {
                    outer: true,
                    inner: true,
                },
                pack_k: true,
            });
        }
        // K on both sides, N unpacked: the only lane-reducing pairing
        // available at rank 1.
        pairings.push(Pairing {
            a: OperandPacking {
                outer: false,
                inner: true,
            },
            b: OperandPacking {
                outer: true,
                inner: false,
            },
            pack_k: true,
        });
        pairings
    }
}

/// Map the `(m, k)` or `(k, n)` roles of an operand to its physical axes.
fn role_axes(rank: usize, transposed: bool) -> (usize, usize) {
    if transposed {
        (rank - 1, rank - 2)
    } else {
        (rank - 2, rank - 1)
    }
}

impl VectorizeRule for MatMulVectorize {
    fn name(&self) -> &'static str {
        "vectorize-matmul"
    }

    fn pattern(&self) -> Pattern {
        Pattern::op("MatMul").with_name("root")
    }

    fn applies_to(&self, op: &Op) -> bool {
        matches!(op, Op::MatMul { .. })
    }

    fn candidates(&self, pat_match: &Match) -> Vec<Expr> {
        let root = pat_match.expect("root");
        let Some((
            &Op::MatMul {
                transpose_a,
                transpose_b,
                pack_k,
            },
            args,
        )) = root.as_call()
        else {
            return Vec::new();
        };
        // Already vectorized.
        if pack_k {
            return Vec::new();
        }
        let (a, b) = (&args[0], &args[1]);
        let (Some(a_shape), Some(b_shape)) = (a.fixed_shape(), b.fixed_shape()) else {
            return Vec::new();
        };
        let (Some(out_shape), Some(dtype)) = (root.fixed_shape(), a.checked_dtype()) else {
            return Vec::new();
        };
        if a_shape.len() < 2 || b_shape.len() < 2 {
            return Vec::new();
        }
        let lane = self.opts.lane_for(dtype);

        let (m_axis, ak_axis) = role_axes(a_shape.len(), transpose_a);
        let (bk_axis, n_axis) = role_axes(b_shape.len(), transpose_b);
        let out_rank = out_shape.len();

        let mut out = Vec::new();
        for pairing in self.pairings() {
            let mut a_axes = AxisVec::new();
            if pairing.a.outer {
                a_axes.push(m_axis);
            }
            if pairing.a.inner {
                a_axes.push(ak_axis);
            }
            let mut b_axes = AxisVec::new();
            if pairing.b.outer {
                b_axes.push(bk_axis);
            }
            if pairing.b.inner {
                b_axes.push(n_axis);
            }
            if a_axes.iter().any(|&ax| a_shape[ax] <= 1)
                || b_axes.iter().any(|&ax| b_shape[ax] <= 1)
            {
                continue;
            }

            let pack_side = |arg: &Expr, shape: &[usize], axes: &[usize]| {
                if axes.is_empty() {
                    (arg.clone(), PadRecord::zero(shape.len()))
                } else {
                    let lanes: AxisVec = axes.iter().map(|_| lane).collect();
                    let (padded, record) = pad_for_vectorize(
                        arg,
                        shape,
                        axes,
                        &lanes,
                        PadFill::Zero,
                        self.opts.hierarchy_fanout,
                    );
                    let packed = Expr::call(
                        Op::Pack(PackAxes::new(lanes, AxisVec::from_slice(axes))),
                        [padded],
                    );
                    (packed, record)
                }
            };
            let (packed_a, a_record) = pack_side(a, &a_shape, &a_axes);
            let (packed_b, b_record) = pack_side(b, &b_shape, &b_axes);
            let inner = Expr::call(
                Op::MatMul {
                    transpose_a,
                    transpose_b,
                    pack_k: pairing.pack_k,
                },
                [packed_a, packed_b],
            );

            // M and N survive into the output at the two innermost axes;
            // K is contracted away (lane-reduced when `pack_k`).
            let mut out_axes = AxisVec::new();
            let mut record = PadRecord::zero(out_rank);
            if pairing.a.outer {
                out_axes.push(out_rank - 2);
                record.set(out_rank - 2, a_record.get(m_axis));
            }
            if pairing.b.inner {
                out_axes.push(out_rank - 1);
                record.set(out_rank - 1, b_record.get(n_axis));
            }

            let cand = if out_axes.is_empty() {
                inner
            } else {
                let lanes: AxisVec = out_axes.iter().map(|_| lane).collect();
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

    fn matmul(a: Expr, b: Expr) -> Expr {
        Expr::call(
            Op::MatMul {
                transpose_a: false,
                transpose_b: false,
                pack_k: false,
            },
            [a, b],
        )
    }

    fn float_var(name: &str, shape: &[usize]) -> Expr {
        Expr::var(name, TensorType::fixed(DataType::Float, shape))
    }

    fn candidates(opts: VectorizeOptions, graph: &Expr) -> Vec<Expr> {
        let rule = MatMulVectorize::new(opts);
        let pat_match = rule.pattern().test(graph).expect("pattern should match");
        rule.candidates(&pat_match)
    }

    #[test]
    fn test_rank1_pairings() {
        let opts = VectorizeOptions {
            lane_bytes: 128,
            ..Default::default()
        };
        let graph = matmul(float_var("a", &[36, 100]), float_var("b", &[100, 64]));
        let cands = candidates(opts, &graph);
        // N-only, then K-on-both-sides.
        assert_eq!(cands.len(), 2);
        for cand in &cands {
            assert_eq!(cand.fixed_shape().as_deref(), Some(&[36usize, 64][..]));
        }

        // The K pairing's result is fully devectorized by the contraction
        // itself: the candidate's top operator is the matmul.
        let (op, _) = cands[1].as_call().unwrap();
        assert!(matches!(op, Op::MatMul { pack_k: true, .. }));
    }

    #[test]
    fn test_rank2_adds_mn_pairings() {
        let opts = VectorizeOptions {
            lane_bytes: 128,
            max_rank: 2,
            ..Default::default()
        };
        let graph = matmul(float_var("a", &[36, 100]), float_var("b", &[100, 64]));
        let cands = candidates(opts, &graph);
        assert_eq!(cands.len(), 5);
        for cand in &cands {
            assert_eq!(cand.fixed_shape().as_deref(), Some(&[36usize, 64][..]));
        }
    }

    #[test]
    fn test_batch_dims_pass_through() {
        let opts = VectorizeOptions {
            lane_bytes: 128,
            ..Default::default()
        };
        let graph = matmul(float_var("a", &[3, 8, 100]), float_var("b", &[3, 100, 64]));
        let cands = candidates(opts, &graph);
        assert_eq!(cands.len(), 2);
        for cand in &cands {
            assert_eq!(cand.fixed_shape().as_deref(), Some(&[3usize, 8, 64][..]));
        }
    }

    #[test]
    fn test_transposed_operand_roles() {
        let opts = VectorizeOptions {
            lane_bytes: 128,
            ..Default::default()
        };
        // a is [K, M] with transpose_a set.
        let graph = Expr::call(
            Op::MatMul {
                transpose_a: true,
                transpose_b: false,
                pack_k: false,
            },
            [float_var("a", &[100, 36]), float_var("b", &[100, 64])],
        );
        let rule = MatMulVectorize::new(opts);
        let pat_match = rule.pattern().test(&graph).unwrap();
        let cands = rule.candidates(&pat_match);
        assert_eq!(cands.len(), 2);
        for cand in &cands {
            assert_eq!(cand.fixed_shape().as_deref(), Some(&[36usize, 64][..]));
        }
    }
}
