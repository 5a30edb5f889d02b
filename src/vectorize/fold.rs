//! Cancellation and propagation rules.
//!
//! Rewriting one operator at a time leaves `Unpack` / `Pack` pairs at the
//! seams between vectorized regions. The fold rules cancel exact pairs
//! (by returning the inner subexpression itself, so repeated folding is
//! observably idempotent) and the propagation rules push an `Unpack`
//! below lane-oblivious operators until a cancelling `Pack` comes into
//! reach.

use super::axes::transpose_axis;
use super::{check_candidate, VectorizeRule};
use crate::expr::Expr;
use crate::ops::{AxisVec, Op, PackAxes};
use crate::pattern::{Match, Pattern};

/// Return the pack parameters and argument if `expr` is an `Unpack`.
fn as_unpack(expr: &Expr) -> Option<(&PackAxes, &Expr)> {
    match expr.as_call() {
        Some((Op::Unpack(pack), args)) => Some((pack, &args[0])),
        _ => None,
    }
}

/// Cancels `Pack(Unpack(x))` with identical parameters to `x`.
pub struct FoldVectorizeDevectorize;

impl VectorizeRule for FoldVectorizeDevectorize {
    fn name(&self) -> &'static str {
        "fold-pack-unpack"
    }

    fn pattern(&self) -> Pattern {
        Pattern::op("Pack").with_name("root")
    }

    fn applies_to(&self, op: &Op) -> bool {
        matches!(op, Op::Pack(_))
    }

    fn candidates(&self, pat_match: &Match) -> Vec<Expr> {
        let root = pat_match.expect("root");
        let Some((Op::Pack(outer), args)) = root.as_call() else {
            return Vec::new();
        };
        let Some((inner, x)) = as_unpack(&args[0]) else {
            return Vec::new();
        };
        if outer != inner {
            return Vec::new();
        }
        // The inner expression is returned as-is, not rebuilt.
        vec![x.clone()]
    }
}

/// Removes a `Pack` or `PackMask` with an empty axis set.
pub struct FoldNopVectorize;

impl VectorizeRule for FoldNopVectorize {
    fn name(&self) -> &'static str {
        "fold-nop-pack"
    }

    fn pattern(&self) -> Pattern {
        Pattern::op_family("Pack", |op| {
            matches!(op, Op::Pack(_) | Op::PackMask { .. })
        })
        .with_name("root")
    }

    fn applies_to(&self, op: &Op) -> bool {
        matches!(op, Op::Pack(_) | Op::PackMask { .. })
    }

    fn candidates(&self, pat_match: &Match) -> Vec<Expr> {
        let root = pat_match.expect("root");
        match root.as_call() {
            Some((Op::Pack(pack), args)) if pack.is_empty() => vec![args[0].clone()],
            Some((Op::PackMask { pack, .. }, args)) if pack.is_empty() => {
                vec![args[0].clone()]
            }
            _ => Vec::new(),
        }
    }
}

/// Removes an `Unpack` with an empty axis set.
pub struct FoldNopDevectorize;

impl VectorizeRule for FoldNopDevectorize {
    fn name(&self) -> &'static str {
        "fold-nop-unpack"
    }

    fn pattern(&self) -> Pattern {
        Pattern::op("Unpack").with_name("root")
    }

    fn applies_to(&self, op: &Op) -> bool {
        matches!(op, Op::Unpack(_))
    }

    fn candidates(&self, pat_match: &Match) -> Vec<Expr> {
        let root = pat_match.expect("root");
        match root.as_call() {
            Some((Op::Unpack(pack), args)) if pack.is_empty() => vec![args[0].clone()],
            _ => Vec::new(),
        }
    }
}

/// Cancels `Pack(Concat(Unpack(x_0), ..., Unpack(x_n)))` when every
/// unpack uses the outer pack's parameters and the concat axis is not
/// packed: the concatenation then never cuts a lane and can run directly
/// on the packed pieces.
pub struct FoldVectorizeConcatDevectorize;

impl VectorizeRule for FoldVectorizeConcatDevectorize {
    fn name(&self) -> &'static str {
        "fold-pack-concat-unpack"
    }

    fn pattern(&self) -> Pattern {
        Pattern::op("Pack").with_name("root")
    }

    fn applies_to(&self, op: &Op) -> bool {
        matches!(op, Op::Pack(_))
    }

    fn candidates(&self, pat_match: &Match) -> Vec<Expr> {
        let root = pat_match.expect("root");
        let Some((Op::Pack(outer), args)) = root.as_call() else {
            return Vec::new();
        };
        let Some((&Op::Concat { axis }, concat_args)) = args[0].as_call() else {
            return Vec::new();
        };
        if outer.axes().contains(&axis) {
            return Vec::new();
        }
        let Some(items) = concat_args[0].as_tuple() else {
            return Vec::new();
        };
        let Some(packed_items) = items
            .iter()
            .map(|item| {
                let (inner, x) = as_unpack(item)?;
                (inner == outer).then(|| x.clone())
            })
            .collect::<Option<Vec<Expr>>>()
        else {
            return Vec::new();
        };
        let cand = Expr::call(Op::Concat { axis }, [Expr::tuple(packed_items)]);
        check_candidate(cand, root).into_iter().collect()
    }
}

/// Pushes an `Unpack` below a unary elementwise operator.
pub struct PropagateDevectorizeUnary;

impl VectorizeRule for PropagateDevectorizeUnary {
    fn name(&self) -> &'static str {
        "propagate-unpack-unary"
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
        let Some((pack, x)) = as_unpack(&args[0]) else {
            return Vec::new();
        };
        let cand = Expr::call(
            Op::Unpack(pack.clone()),
            [Expr::call(Op::Unary(op), [x.clone()])],
        );
        check_candidate(cand, root).into_iter().collect()
    }
}

/// Pushes a pair of matching `Unpack`s below a binary operator.
///
/// Both operands must unpack with the same parameters from equal packed
/// shapes; broadcasting between a packed and an unpacked extent would
/// change meaning.
pub struct PropagateDevectorizeBinary;

impl VectorizeRule for PropagateDevectorizeBinary {
    fn name(&self) -> &'static str {
        "propagate-unpack-binary"
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
        let (Some((pack_a, a)), Some((pack_b, b))) =
            (as_unpack(&args[0]), as_unpack(&args[1]))
        else {
            return Vec::new();
        };
        if pack_a != pack_b {
            return Vec::new();
        }
        let (Some(a_shape), Some(b_shape)) = (a.fixed_shape(), b.fixed_shape()) else {
            return Vec::new();
        };
        if a_shape != b_shape {
            return Vec::new();
        }
        let cand = Expr::call(
            Op::Unpack(pack_a.clone()),
            [Expr::call(Op::Binary(op), [a.clone(), b.clone()])],
        );
        check_candidate(cand, root).into_iter().collect()
    }
}

/// Pushes an `Unpack` below a transpose, remapping the packed axes
/// through the permutation.
pub struct PropagateDevectorizeTranspose;

impl VectorizeRule for PropagateDevectorizeTranspose {
    fn name(&self) -> &'static str {
        "propagate-unpack-transpose"
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
        let Some((pack, x)) = as_unpack(&args[0]) else {
            return Vec::new();
        };
        let out_axes: AxisVec = pack
            .axes()
            .iter()
            .map(|&a| transpose_axis(perm, a))
            .collect();
        let cand = Expr::call(
            Op::Unpack(PackAxes::new(AxisVec::from_slice(pack.lanes()), out_axes)),
            [Expr::call(
                Op::Transpose { perm: perm.clone() },
                [x.clone()],
            )],
        );
        check_candidate(cand, root).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{Expr, TensorType};
    use crate::ops::{BinaryOp, DimVec, UnaryOp};
    use crate::value::DataType;

    fn float_var(name: &str, shape: &[usize]) -> Expr {
        Expr::var(name, TensorType::fixed(DataType::Float, shape))
    }

    fn pack(lanes: &[usize], axes: &[usize]) -> PackAxes {
        PackAxes::new(AxisVec::from_slice(lanes), AxisVec::from_slice(axes))
    }

    fn replace(rule: &dyn VectorizeRule, graph: &Expr) -> Option<Expr> {
        rule.pattern()
            .test(graph)
            .and_then(|pat_match| rule.replace(&pat_match))
    }

    #[test]
    fn test_pack_unpack_cancels_to_same_node() {
        let x = float_var("x", &[2, 64]);
        let p = pack(&[32], &[1]);
        let graph = Expr::call(
            Op::Pack(p.clone()),
            [Expr::call(Op::Unpack(p), [x.clone()])],
        );
        let folded = replace(&FoldVectorizeDevectorize, &graph).unwrap();
        assert!(folded.ptr_eq(&x));
    }

    #[test]
    fn test_pack_unpack_mismatch_does_not_cancel() {
        let x = float_var("x", &[2, 64]);
        let graph = Expr::call(
            Op::Pack(pack(&[32], &[1])),
            [Expr::call(Op::Unpack(pack(&[16], &[1])), [x])],
        );
        assert!(replace(&FoldVectorizeDevectorize, &graph).is_none());
    }

    #[test]
    fn test_empty_axis_pack_and_unpack_are_removed() {
        let x = float_var("x", &[2, 64]);
        let packed = Expr::call(Op::Pack(pack(&[], &[])), [x.clone()]);
        assert!(replace(&FoldNopVectorize, &packed).unwrap().ptr_eq(&x));

        let unpacked = Expr::call(Op::Unpack(pack(&[], &[])), [x.clone()]);
        assert!(replace(&FoldNopDevectorize, &unpacked).unwrap().ptr_eq(&x));
    }

    #[test]
    fn test_concat_sandwich_folds() {
        let p = pack(&[32], &[1]);
        let a = float_var("a", &[1, 64]);
        let b = float_var("b", &[2, 64]);
        let graph = Expr::call(
            Op::Pack(p.clone()),
            [Expr::call(
                Op::Concat { axis: 0 },
                [Expr::tuple([
                    Expr::call(Op::Unpack(p.clone()), [a.clone()]),
                    Expr::call(Op::Unpack(p.clone()), [b.clone()]),
                ])],
            )],
        );
        let folded = replace(&FoldVectorizeConcatDevectorize, &graph).unwrap();
        let (op, args) = folded.as_call().unwrap();
        assert!(matches!(op, Op::Concat { axis: 0 }));
        let items = args[0].as_tuple().unwrap();
        assert!(items[0].ptr_eq(&a));
        assert!(items[1].ptr_eq(&b));

        // The concat axis being packed blocks the fold.
        let on_packed_axis = Expr::call(
            Op::Pack(p.clone()),
            [Expr::call(
                Op::Concat { axis: 1 },
                [Expr::tuple([
                    Expr::call(Op::Unpack(p.clone()), [a]),
                    Expr::call(Op::Unpack(p), [b]),
                ])],
            )],
        );
        assert!(replace(&FoldVectorizeConcatDevectorize, &on_packed_axis).is_none());
    }

    #[test]
    fn test_unary_propagation() {
        let x = float_var("x", &[2, 64]);
        let p = pack(&[32], &[1]);
        let graph = Expr::call(Op::Unpack(p), [x]).unary(UnaryOp::Exp);
        let pushed = replace(&PropagateDevectorizeUnary, &graph).unwrap();
        let (op, args) = pushed.as_call().unwrap();
        assert!(matches!(op, Op::Unpack(_)));
        assert!(matches!(
            args[0].as_call().unwrap().0,
            Op::Unary(UnaryOp::Exp)
        ));
    }

    #[test]
    fn test_binary_propagation_requires_matching_packs() {
        let p = pack(&[32], &[1]);
        let a = Expr::call(Op::Unpack(p.clone()), [float_var("a", &[2, 64])]);
        let b = Expr::call(Op::Unpack(p), [float_var("b", &[2, 64])]);
        let graph = a.clone().binary(BinaryOp::Add, b);
        let pushed = replace(&PropagateDevectorizeBinary, &graph).unwrap();
        assert!(matches!(pushed.as_call().unwrap().0, Op::Unpack(_)));

        let other = Expr::call(Op::Unpack(pack(&[16], &[1])), [float_var("c", &[2, 32])]);
        let graph = a.binary(BinaryOp::Add, other);
        assert!(replace(&PropagateDevectorizeBinary, &graph).is_none());
    }

    #[test]
    fn test_transpose_propagation_remaps_axes() {
        let x = float_var("x", &[2, 64]);
        let graph = Expr::call(
            Op::Transpose {
                perm: DimVec::from_slice(&[1, 0]),
            },
            [Expr::call(Op::Unpack(pack(&[32], &[1])), [x])],
        );
        let pushed = replace(&PropagateDevectorizeTranspose, &graph).unwrap();
        let (op, _) = pushed.as_call().unwrap();
        let Op::Unpack(p) = op else {
            panic!("expected unpack")
        };
        assert_eq!(p.axes(), &[0]);
        assert_eq!(p.lanes(), &[32]);
    }
}
