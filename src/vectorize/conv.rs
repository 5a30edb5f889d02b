//! `Conv2D` rules: im2col lowering and its channel-packed variant.
//!
//! Convolution is rewritten as a patch-matrix product. The patch rows are
//! ordered `(kh, kw, c)` with channels fastest-varying, so packing the
//! input's channel axis keeps each lane a contiguous run of channels and
//! the reshaped weight matrix packs its contraction axis the same way.
//! The packed variant is therefore a `pack_k` matmul with no unpack step.

use super::{check_candidate, VectorizeOptions, VectorizeRule};
use crate::expr::Expr;
use crate::ops::{AxisVec, BinaryOp, DimVec, Op, PackAxes};
use crate::pattern::{Match, Pattern};

/// Spatial output extent of a convolution along one axis.
fn conv_out_size(dim: usize, pad_lo: usize, pad_hi: usize, k: usize, stride: usize, dilation: usize) -> usize {
    let span = dilation * (k - 1) + 1;
    (dim + pad_lo + pad_hi - span) / stride + 1
}

struct ConvShapes {
    channels: usize,
    out_channels: usize,
    kernel: [usize; 2],
    out_h: usize,
    out_w: usize,
}

/// Extract and sanity-check the shapes a conv lowering needs. Returns
/// `None` when the lowering does not apply (dynamic shapes or a batch).
fn conv_shapes(
    x: &Expr,
    w: &Expr,
    stride: [usize; 2],
    padding: [usize; 4],
    dilation: [usize; 2],
) -> Option<ConvShapes> {
    let x_shape = x.fixed_shape()?;
    let w_shape = w.fixed_shape()?;
    let ([n, c, h, width], [o, wc, kh, kw]) = (
        <[usize; 4]>::try_from(x_shape.as_slice()).ok()?,
        <[usize; 4]>::try_from(w_shape.as_slice()).ok()?,
    );
    if n != 1 || c != wc {
        return None;
    }
    let [top, left, bottom, right] = padding;
    Some(ConvShapes {
        channels: c,
        out_channels: o,
        kernel: [kh, kw],
        out_h: conv_out_size(h, top, bottom, kh, stride[0], dilation[0]),
        out_w: conv_out_size(width, left, right, kw, stride[1], dilation[1]),
    })
}

/// Reshape the `[O, C, kh, kw]` weights into the `[O, kh * kw * C]` patch
/// matrix, channels fastest-varying.
fn weight_matrix(w: &Expr, shapes: &ConvShapes) -> Expr {
    let [kh, kw] = shapes.kernel;
    let transposed = Expr::call(
        Op::Transpose {
            perm: DimVec::from_slice(&[0, 2, 3, 1]),
        },
        [w.clone()],
    );
    Expr::call(
        Op::Reshape {
            shape: DimVec::from_slice(&[shapes.out_channels, kh * kw * shapes.channels]),
        },
        [transposed],
    )
}

/// Reshape the `[O, oh * ow]` matmul result back to feature-map layout.
fn output_reshape(y: Expr, shapes: &ConvShapes) -> Expr {
    Expr::call(
        Op::Reshape {
            shape: DimVec::from_slice(&[1, shapes.out_channels, shapes.out_h, shapes.out_w]),
        },
        [y],
    )
}

/// Lowers `Conv2D` to im2col + matmul in unpacked form.
pub struct LowerConv2D;

impl LowerConv2D {
    #[allow(clippy::new_without_default)]
    pub fn new() -> LowerConv2D {
        LowerConv2D
    }
}

impl VectorizeRule for LowerConv2D {
    fn name(&self) -> &'static str {
        "lower-conv2d"
    }

    fn pattern(&self) -> Pattern {
        Pattern::op("Conv2D").with_name("root")
    }

    fn applies_to(&self, op: &Op) -> bool {
        matches!(op, Op::Conv2D { .. })
    }

    fn candidates(&self, pat_match: &Match) -> Vec<Expr> {
        let root = pat_match.expect("root");
        let Some((
            &Op::Conv2D {
                stride,
                padding,
                dilation,
                fused_clamp,
            },
            args,
        )) = root.as_call()
        else {
            return Vec::new();
        };
        let (x, w) = (&args[0], &args[1]);
        let Some(shapes) = conv_shapes(x, w, stride, padding, dilation) else {
            return Vec::new();
        };

        let cols = Expr::call(
            Op::Im2col {
                kernel: shapes.kernel,
                stride,
                padding,
                dilation,
            },
            [x.clone()],
        );
        let y = Expr::call(
            Op::MatMul {
                transpose_a: false,
                transpose_b: false,
                pack_k: false,
            },
            [weight_matrix(w, &shapes), cols],
        );
        let mut out = output_reshape(y, &shapes);
        if let Some((lo, hi)) = fused_clamp {
            out = out
                .binary(BinaryOp::Min, Expr::constant(hi))
                .binary(BinaryOp::Max, Expr::constant(lo));
        }
        check_candidate(out, root).into_iter().collect()
    }
}

/// Channel-packed im2col lowering.
pub struct Conv2DVectorize {
    opts: VectorizeOptions,
}

impl Conv2DVectorize {
    pub fn new(opts: VectorizeOptions) -> Conv2DVectorize {
        Conv2DVectorize { opts }
    }
}

impl VectorizeRule for Conv2DVectorize {
    fn name(&self) -> &'static str {
        "vectorize-conv2d"
    }

    fn pattern(&self) -> Pattern {
        Pattern::op("Conv2D").with_name("root")
    }

    fn applies_to(&self, op: &Op) -> bool {
        matches!(op, Op::Conv2D { .. })
    }

    fn candidates(&self, pat_match: &Match) -> Vec<Expr> {
        let root = pat_match.expect("root");
        let Some((
            &Op::Conv2D {
                stride,
                padding,
                dilation,
                fused_clamp,
            },
            args,
        )) = root.as_call()
        else {
            return Vec::new();
        };
        // Dilation would break up the channel runs inside each patch row,
        // and a fused clamp cannot be applied pre-contraction.
        if dilation != [1, 1] || fused_clamp.is_some() {
            return Vec::new();
        }
        let (x, w) = (&args[0], &args[1]);
        let Some(shapes) = conv_shapes(x, w, stride, padding, dilation) else {
            return Vec::new();
        };
        let Some(dtype) = x.checked_dtype() else {
            return Vec::new();
        };
        let lane = self.opts.lane_for(dtype);
        // Padding the channel axis would interleave fill into every patch
        // row, so only an exactly divisible channel count qualifies.
        if shapes.channels % lane != 0 || shapes.channels <= 1 {
            return Vec::new();
        }

        let packed_x = Expr::call(
            Op::Pack(PackAxes::new(
                AxisVec::from_slice(&[lane]),
                AxisVec::from_slice(&[1]),
            )),
            [x.clone()],
        );
        let cols = Expr::call(
            Op::Im2col {
                kernel: shapes.kernel,
                stride,
                padding,
                dilation,
            },
            [packed_x],
        );
        let packed_w = Expr::call(
            Op::Pack(PackAxes::new(
                AxisVec::from_slice(&[lane]),
                AxisVec::from_slice(&[1]),
            )),
            [weight_matrix(w, &shapes)],
        );
        let y = Expr::call(
            Op::MatMul {
                transpose_a: false,
                transpose_b: false,
                pack_k: true,
            },
            [packed_w, cols],
        );
        check_candidate(output_reshape(y, &shapes), root).into_iter().collect()
    }
}
