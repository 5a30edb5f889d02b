//! End-to-end equivalence tests: rewritten graphs must compute the same
//! values as the originals, up to float rounding, on randomized inputs.

use crate::eval::{cosine_similarity, evaluate};
use crate::expr::{Expr, TensorType};
use crate::ops::{
    AxisVec, CompareOp, DimVec, MaskVectorStyle, Op, ReduceOp, ResizeMode, UnaryOp,
};
use crate::rewrite::vectorize;
use crate::tensor::Tensor;
use crate::value::{DataType, Value};
use crate::vectorize::VectorizeOptions;

fn opts() -> VectorizeOptions {
    VectorizeOptions {
        lane_bytes: 128,
        ..Default::default()
    }
}

fn narrow_opts() -> VectorizeOptions {
    VectorizeOptions {
        lane_bytes: 16,
        ..Default::default()
    }
}

fn fanout_opts() -> VectorizeOptions {
    VectorizeOptions {
        lane_bytes: 128,
        hierarchy_fanout: 2,
        ..Default::default()
    }
}

fn float_var(name: &str, shape: &[usize]) -> Expr {
    Expr::var(name, TensorType::fixed(DataType::Float, shape))
}

fn int_var(name: &str, shape: &[usize]) -> Expr {
    Expr::var(name, TensorType::fixed(DataType::Int32, shape))
}

fn random_floats(rng: &mut fastrand::Rng, shape: &[usize]) -> Value {
    let len: usize = shape.iter().product();
    let data: Vec<f32> = (0..len).map(|_| rng.f32() * 2. - 1.).collect();
    Value::Float(Tensor::from_data(shape, data))
}

fn random_ints(rng: &mut fastrand::Rng, shape: &[usize]) -> Value {
    let len: usize = shape.iter().product();
    let data: Vec<i32> = (0..len).map(|_| rng.i32(-50..50)).collect();
    Value::Int32(Tensor::from_data(shape, data))
}

/// Evaluate `graph` before and after rewriting and require the results
/// to match. Also asserts that the rewrite changed the graph when
/// `expect_rewrite` is set, so a silently-declining rule cannot pass.
fn check_equivalent(
    graph: &Expr,
    inputs: &[(&str, Value)],
    opts: VectorizeOptions,
    expect_rewrite: bool,
) {
    let rewritten = vectorize(graph, opts).unwrap();
    if expect_rewrite {
        assert!(
            !rewritten.ptr_eq(graph),
            "rewrite left the graph untouched"
        );
    }
    let want = evaluate(graph, inputs).unwrap();
    let got = evaluate(&rewritten, inputs).unwrap();
    assert_eq!(got.shape(), want.shape());
    match (&want, &got) {
        (Value::Float(w), Value::Float(g)) => {
            let sim = cosine_similarity(w.data(), g.data());
            assert!(sim > 0.999, "cosine similarity {} too low", sim);
        }
        (Value::Int32(w), Value::Int32(g)) => assert_eq!(w.data(), g.data()),
        (Value::Mask(w), Value::Mask(g)) => assert_eq!(w.data(), g.data()),
        _ => panic!("dtype changed by rewrite"),
    }
}

#[test]
fn test_unary_chain_equivalence() {
    let mut rng = fastrand::Rng::with_seed(0x5eed);
    let x = float_var("x", &[4, 100]);
    let graph = (x.unary(UnaryOp::Abs) + 1.0).unary(UnaryOp::Sqrt).unary(UnaryOp::Log);
    let inputs = [("x", random_floats(&mut rng, &[4, 100]))];
    check_equivalent(&graph, &inputs, opts(), true);
}

#[test]
fn test_binary_broadcast_equivalence() {
    let mut rng = fastrand::Rng::with_seed(1);
    let a = float_var("a", &[4, 100]);
    let b = float_var("b", &[100]);
    let graph = a * b + 0.5;
    let inputs = [
        ("a", random_floats(&mut rng, &[4, 100])),
        ("b", random_floats(&mut rng, &[100])),
    ];
    check_equivalent(&graph, &inputs, opts(), true);
}

#[test]
fn test_int_arithmetic_equivalence() {
    let mut rng = fastrand::Rng::with_seed(2);
    let a = int_var("a", &[3, 40]);
    let b = int_var("b", &[3, 40]);
    let graph = Expr::call(
        Op::Reduce {
            op: ReduceOp::Max,
            axes: AxisVec::from_slice(&[1]),
            keep_dims: false,
        },
        [a * b],
    );
    let inputs = [
        ("a", random_ints(&mut rng, &[3, 40])),
        ("b", random_ints(&mut rng, &[3, 40])),
    ];
    check_equivalent(&graph, &inputs, opts(), true);
}

#[test]
fn test_compare_where_equivalence() {
    let mut rng = fastrand::Rng::with_seed(3);
    let a = float_var("a", &[4, 100]);
    let b = float_var("b", &[4, 100]);
    let mask = Expr::call(Op::Compare(CompareOp::Less), [a.clone(), b.clone()]);
    let graph = Expr::call(Op::Where, [mask, a, b]);
    let inputs = [
        ("a", random_floats(&mut rng, &[4, 100])),
        ("b", random_floats(&mut rng, &[4, 100])),
    ];
    check_equivalent(&graph, &inputs, opts(), true);
}

#[test]
fn test_where_thin_masks_decline_float_data() {
    // Thin masks require 1-byte data lanes; with f32 data the compare
    // and where rules stand down but the graph must still evaluate.
    let mut rng = fastrand::Rng::with_seed(4);
    let a = float_var("a", &[4, 100]);
    let b = float_var("b", &[4, 100]);
    let mask = Expr::call(Op::Compare(CompareOp::Greater), [a.clone(), b.clone()]);
    let graph = Expr::call(Op::Where, [mask, a, b]);
    let inputs = [
        ("a", random_floats(&mut rng, &[4, 100])),
        ("b", random_floats(&mut rng, &[4, 100])),
    ];
    let thin = VectorizeOptions {
        lane_bytes: 128,
        mask_style: MaskVectorStyle::Thin,
        ..Default::default()
    };
    check_equivalent(&graph, &inputs, thin, false);
}

#[test]
fn test_cast_round_trip_equivalence() {
    let mut rng = fastrand::Rng::with_seed(5);
    let x = float_var("x", &[2, 100]);
    let ints = Expr::call(
        Op::Cast {
            to: DataType::Int32,
            rescale: None,
        },
        [x * 10.0],
    );
    let graph = Expr::call(
        Op::Cast {
            to: DataType::Float,
            rescale: None,
        },
        [ints],
    );
    let inputs = [("x", random_floats(&mut rng, &[2, 100]))];
    check_equivalent(&graph, &inputs, opts(), true);
}

#[test]
fn test_reduce_equivalence() {
    let mut rng = fastrand::Rng::with_seed(6);
    let inputs = [("x", random_floats(&mut rng, &[4, 100]))];
    for (op, axes) in [
        (ReduceOp::Max, vec![1]),
        (ReduceOp::Sum, vec![0]),
        (ReduceOp::Min, vec![0, 1]),
        (ReduceOp::Mean, vec![1]),
    ] {
        let x = float_var("x", &[4, 100]);
        let graph = Expr::call(
            Op::Reduce {
                op,
                axes: axes.iter().copied().collect(),
                keep_dims: false,
            },
            [x],
        );
        check_equivalent(&graph, &inputs, opts(), true);
    }
}

#[test]
fn test_matmul_equivalence() {
    let mut rng = fastrand::Rng::with_seed(7);
    let a = float_var("a", &[3, 5]);
    let b = float_var("b", &[5, 7]);
    let graph = Expr::call(
        Op::MatMul {
            transpose_a: false,
            transpose_b: false,
            pack_k: false,
        },
        [a, b],
    );
    let inputs = [
        ("a", random_floats(&mut rng, &[3, 5])),
        ("b", random_floats(&mut rng, &[5, 7])),
    ];
    check_equivalent(&graph, &inputs, opts(), true);
}

#[test]
fn test_batched_matmul_equivalence() {
    let mut rng = fastrand::Rng::with_seed(8);
    let a = float_var("a", &[2, 6, 33]);
    let b = float_var("b", &[2, 33, 9]);
    let graph = Expr::call(
        Op::MatMul {
            transpose_a: false,
            transpose_b: false,
            pack_k: false,
        },
        [a, b],
    );
    let inputs = [
        ("a", random_floats(&mut rng, &[2, 6, 33])),
        ("b", random_floats(&mut rng, &[2, 33, 9])),
    ];
    check_equivalent(&graph, &inputs, opts(), true);
}

#[test]
fn test_conv_lowering_equivalence() {
    // Channels do not divide the lane, so the plain im2col lowering runs.
    let mut rng = fastrand::Rng::with_seed(9);
    let x = float_var("x", &[1, 3, 6, 6]);
    let w = float_var("w", &[8, 3, 3, 3]);
    let graph = Expr::call(
        Op::Conv2D {
            stride: [1, 1],
            padding: [1, 1, 1, 1],
            dilation: [1, 1],
            fused_clamp: None,
        },
        [x, w],
    );
    let inputs = [
        ("x", random_floats(&mut rng, &[1, 3, 6, 6])),
        ("w", random_floats(&mut rng, &[8, 3, 3, 3])),
    ];
    check_equivalent(&graph, &inputs, opts(), true);
}

#[test]
fn test_packed_conv_equivalence() {
    // lane_bytes 16 gives an f32 lane of 4, which divides the channels.
    let mut rng = fastrand::Rng::with_seed(10);
    let x = float_var("x", &[1, 4, 6, 6]);
    let w = float_var("w", &[8, 4, 3, 3]);
    let graph = Expr::call(
        Op::Conv2D {
            stride: [1, 1],
            padding: [0, 0, 0, 0],
            dilation: [1, 1],
            fused_clamp: None,
        },
        [x, w],
    );
    let inputs = [
        ("x", random_floats(&mut rng, &[1, 4, 6, 6])),
        ("w", random_floats(&mut rng, &[8, 4, 3, 3])),
    ];
    check_equivalent(&graph, &inputs, narrow_opts(), true);
}

#[test]
fn test_transpose_equivalence() {
    let mut rng = fastrand::Rng::with_seed(11);
    let x = float_var("x", &[36, 64]);
    let graph = Expr::call(
        Op::Transpose {
            perm: DimVec::from_slice(&[1, 0]),
        },
        [x.unary(UnaryOp::Exp)],
    );
    let inputs = [("x", random_floats(&mut rng, &[36, 64]))];
    check_equivalent(&graph, &inputs, opts(), true);
}

#[test]
fn test_reshape_equivalence() {
    let mut rng = fastrand::Rng::with_seed(12);
    let x = float_var("x", &[2, 3, 32]);
    let graph = Expr::call(
        Op::Reshape {
            shape: DimVec::from_slice(&[6, 32]),
        },
        [x.unary(UnaryOp::Sigmoid)],
    );
    let inputs = [("x", random_floats(&mut rng, &[2, 3, 32]))];
    check_equivalent(&graph, &inputs, opts(), true);
}

#[test]
fn test_expand_equivalence() {
    let mut rng = fastrand::Rng::with_seed(13);
    let x = float_var("x", &[1, 64]);
    let graph = Expr::call(
        Op::Expand {
            shape: DimVec::from_slice(&[8, 64]),
        },
        [x.unary(UnaryOp::Neg)],
    );
    let inputs = [("x", random_floats(&mut rng, &[1, 64]))];
    check_equivalent(&graph, &inputs, opts(), true);
}

#[test]
fn test_unsqueeze_equivalence() {
    let mut rng = fastrand::Rng::with_seed(14);
    let x = float_var("x", &[36, 64]);
    let graph = Expr::call(
        Op::Unsqueeze {
            axes: AxisVec::from_slice(&[0]),
        },
        [x + 2.0],
    );
    let inputs = [("x", random_floats(&mut rng, &[36, 64]))];
    check_equivalent(&graph, &inputs, opts(), true);
}

#[test]
fn test_slice_equivalence() {
    let mut rng = fastrand::Rng::with_seed(15);
    let x = float_var("x", &[128, 8]);
    let graph = Expr::call(
        Op::Slice {
            starts: DimVec::from_slice(&[32, 0]),
            ends: DimVec::from_slice(&[96, 8]),
        },
        [x.unary(UnaryOp::Abs)],
    );
    let inputs = [("x", random_floats(&mut rng, &[128, 8]))];
    check_equivalent(&graph, &inputs, opts(), true);
}

#[test]
fn test_concat_equivalence() {
    let mut rng = fastrand::Rng::with_seed(16);
    let a = float_var("a", &[4, 32]);
    let b = float_var("b", &[4, 64]);
    let graph = Expr::call(Op::Concat { axis: 1 }, [Expr::tuple([a, b])]);
    let inputs = [
        ("a", random_floats(&mut rng, &[4, 32])),
        ("b", random_floats(&mut rng, &[4, 64])),
    ];
    check_equivalent(&graph, &inputs, opts(), true);
}

// Two-level padding: a fanout of 2 rounds packed group counts up to a
// multiple of 2, so axes that are exact at fanout 1 can grow extra fill.

#[test]
fn test_unary_chain_hierarchy_fanout_equivalence() {
    let mut rng = fastrand::Rng::with_seed(40);
    let x = float_var("x", &[4, 100]);
    let graph = (x.unary(UnaryOp::Abs) + 1.0).unary(UnaryOp::Sqrt);
    let inputs = [("x", random_floats(&mut rng, &[4, 100]))];
    check_equivalent(&graph, &inputs, fanout_opts(), true);
}

#[test]
fn test_slice_hierarchy_fanout_equivalence() {
    let mut rng = fastrand::Rng::with_seed(41);
    // Axis 0 is lane-aligned but gains an extra lane group of fill under
    // fanout 2; the slice must decline it rather than shift its bounds.
    let x = float_var("x", &[32, 8]);
    let graph = Expr::call(
        Op::Slice {
            starts: DimVec::from_slice(&[0, 0]),
            ends: DimVec::from_slice(&[32, 4]),
        },
        [x.unary(UnaryOp::Abs)],
    );
    let inputs = [("x", random_floats(&mut rng, &[32, 8]))];
    check_equivalent(&graph, &inputs, fanout_opts(), true);
}

#[test]
fn test_concat_hierarchy_fanout_equivalence() {
    let mut rng = fastrand::Rng::with_seed(42);
    // The 32-row piece would need fill at the seam under fanout 2, so the
    // concat axis stays unpacked and the free axis packs instead.
    let a = float_var("a", &[32, 8]);
    let b = float_var("b", &[64, 8]);
    let graph = Expr::call(Op::Concat { axis: 0 }, [Expr::tuple([a, b])]);
    let inputs = [
        ("a", random_floats(&mut rng, &[32, 8])),
        ("b", random_floats(&mut rng, &[64, 8])),
    ];
    check_equivalent(&graph, &inputs, fanout_opts(), true);
}

#[test]
fn test_gather_equivalence() {
    let mut rng = fastrand::Rng::with_seed(17);
    let table = float_var("table", &[40, 8]);
    let ids = Expr::constant(Tensor::from_data(&[5], vec![3i32, 0, 39, 17, 17]));
    let graph = Expr::call(Op::Gather { axis: 0 }, [table * 2.0, ids]);
    let inputs = [("table", random_floats(&mut rng, &[40, 8]))];
    check_equivalent(&graph, &inputs, opts(), true);
}

#[test]
fn test_scatter_nd_equivalence() {
    let mut rng = fastrand::Rng::with_seed(18);
    let data = float_var("data", &[40, 8]);
    let updates = float_var("updates", &[3, 8]);
    let ids = Expr::constant(Tensor::from_data(&[3, 1], vec![3i32, 7, 9]));
    let graph = Expr::call(Op::ScatterNd, [data, ids, updates]);
    let inputs = [
        ("data", random_floats(&mut rng, &[40, 8])),
        ("updates", random_floats(&mut rng, &[3, 8])),
    ];
    check_equivalent(&graph, &inputs, opts(), true);
}

#[test]
fn test_softmax_equivalence() {
    // The packed axis is lane-padded with -inf, which must not perturb
    // the real probabilities.
    let mut rng = fastrand::Rng::with_seed(19);
    let x = float_var("x", &[4, 100]);
    let graph = Expr::call(Op::Softmax { axis: 1 }, [x]);
    let inputs = [("x", random_floats(&mut rng, &[4, 100]))];
    check_equivalent(&graph, &inputs, opts(), true);
}

#[test]
fn test_layer_norm_equivalence() {
    let mut rng = fastrand::Rng::with_seed(20);
    let x = float_var("x", &[2, 100]);
    let scale = float_var("scale", &[100]);
    let bias = float_var("bias", &[100]);
    let graph = Expr::call(
        Op::LayerNorm {
            axis: 1,
            epsilon: 1e-5,
            pad_tail: Default::default(),
        },
        [x, scale, bias],
    );
    let inputs = [
        ("x", random_floats(&mut rng, &[2, 100])),
        ("scale", random_floats(&mut rng, &[100])),
        ("bias", random_floats(&mut rng, &[100])),
    ];
    check_equivalent(&graph, &inputs, opts(), true);
}

#[test]
fn test_instance_norm_equivalence() {
    let mut rng = fastrand::Rng::with_seed(21);
    let x = float_var("x", &[1, 8, 5, 5]);
    let scale = float_var("scale", &[8]);
    let bias = float_var("bias", &[8]);
    let graph = Expr::call(
        Op::InstanceNorm {
            epsilon: 1e-5,
            pad_tail: Default::default(),
        },
        [x, scale, bias],
    );
    let inputs = [
        ("x", random_floats(&mut rng, &[1, 8, 5, 5])),
        ("scale", random_floats(&mut rng, &[8])),
        ("bias", random_floats(&mut rng, &[8])),
    ];
    check_equivalent(&graph, &inputs, narrow_opts(), true);
}

#[test]
fn test_resize_equivalence() {
    let mut rng = fastrand::Rng::with_seed(22);
    let inputs = [("x", random_floats(&mut rng, &[1, 8, 4, 4]))];
    for mode in [ResizeMode::Nearest, ResizeMode::Bilinear] {
        let x = float_var("x", &[1, 8, 4, 4]);
        let graph = Expr::call(
            Op::ResizeImage {
                scale_h: 2,
                scale_w: 2,
                mode,
            },
            [x],
        );
        check_equivalent(&graph, &inputs, narrow_opts(), true);
    }
}

#[test]
fn test_mixed_graph_equivalence() {
    // A small attention-like block touching matmul, softmax, binary
    // arithmetic, transpose, and reduce in one graph.
    let mut rng = fastrand::Rng::with_seed(23);
    let q = float_var("q", &[6, 33]);
    let k = float_var("k", &[6, 33]);
    let v = float_var("v", &[6, 8]);
    let scores = Expr::call(
        Op::MatMul {
            transpose_a: false,
            transpose_b: true,
            pack_k: false,
        },
        [q, k],
    ) * 0.174;
    let weights = Expr::call(Op::Softmax { axis: 1 }, [scores]);
    let mixed = Expr::call(
        Op::MatMul {
            transpose_a: false,
            transpose_b: false,
            pack_k: false,
        },
        [weights, v],
    );
    let graph = Expr::call(
        Op::Reduce {
            op: ReduceOp::Sum,
            axes: AxisVec::from_slice(&[0]),
            keep_dims: false,
        },
        [mixed],
    );
    let inputs = [
        ("q", random_floats(&mut rng, &[6, 33])),
        ("k", random_floats(&mut rng, &[6, 33])),
        ("v", random_floats(&mut rng, &[6, 8])),
    ];
    check_equivalent(&graph, &inputs, opts(), true);
}

#[test]
fn test_shared_subgraph_equivalence() {
    let mut rng = fastrand::Rng::with_seed(24);
    let x = float_var("x", &[4, 100]);
    let shared = x.unary(UnaryOp::Exp);
    let graph = shared.clone() + shared * 0.5;
    let inputs = [("x", random_floats(&mut rng, &[4, 100]))];
    check_equivalent(&graph, &inputs, opts(), true);
}
