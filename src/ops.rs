//! The closed operator set of the expression IR.
//!
//! `Op` is a tagged union rather than an open trait so that every rewrite,
//! inference and evaluation path is forced to handle each operator
//! exhaustively.

use smallvec::SmallVec;

use crate::value::DataType;

/// Axes are stored inline for the common 1-2 axis case.
pub type AxisVec = SmallVec<[usize; 2]>;

/// Per-axis `(before, after)` padding amounts.
pub type PadVec = SmallVec<[(usize, usize); 4]>;

/// Shape scratch vector.
pub type DimVec = SmallVec<[usize; 4]>;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum UnaryOp {
    Neg,
    Abs,
    Sqrt,
    Exp,
    Log,
    Erf,
    Sigmoid,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    Pow,
}

impl BinaryOp {
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Mul | BinaryOp::Min | BinaryOp::Max
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum CompareOp {
    Equal,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ReduceOp {
    Sum,
    Mean,
    Min,
    Max,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ResizeMode {
    Nearest,
    Bilinear,
}

/// How a vectorized boolean mask is represented.
#[derive(Copy, Clone, Debug, PartialEq, Default)]
pub enum MaskVectorStyle {
    /// Masks are never vectorized; compare/where rules emit no candidates.
    None,
    /// Mask lanes mirror the data lanes, one mask element per data lane.
    #[default]
    Fat,
    /// Masks are stored as 1-byte elements with their own (wider) lane
    /// count. Only usable alongside 1-byte data.
    Thin,
}

/// Fill element used when padding an axis up to a lane boundary.
///
/// The choice is numerically load-bearing: a max-style reduction padded
/// with anything greater than `-inf` could let a fake lane win.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PadFill {
    Zero,
    NegInf,
    PosInf,
}

impl PadFill {
    pub fn as_f32(self) -> f32 {
        match self {
            PadFill::Zero => 0.0,
            PadFill::NegInf => f32::NEG_INFINITY,
            PadFill::PosInf => f32::INFINITY,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            PadFill::Zero => 0,
            PadFill::NegInf => i32::MIN,
            PadFill::PosInf => i32::MAX,
        }
    }
}

/// The `(lanes, axes)` parameters of a pack or unpack operator.
///
/// `axes` index the un-packed shape and each selected axis is grouped into
/// lanes of the matching width.
#[derive(Clone, Debug, PartialEq)]
pub struct PackAxes {
    lanes: AxisVec,
    axes: AxisVec,
}

impl PackAxes {
    /// Create pack parameters.
    ///
    /// Panics if `lanes` and `axes` differ in length or `axes` contains
    /// duplicates. These are rule-construction defects, not data errors.
    pub fn new<L, A>(lanes: L, axes: A) -> PackAxes
    where
        L: IntoIterator<Item = usize>,
        A: IntoIterator<Item = usize>,
    {
        let lanes: AxisVec = lanes.into_iter().collect();
        let axes: AxisVec = axes.into_iter().collect();
        assert_eq!(
            lanes.len(),
            axes.len(),
            "pack lanes/axes arity mismatch: {} vs {}",
            lanes.len(),
            axes.len()
        );
        for (i, &axis) in axes.iter().enumerate() {
            assert!(
                !axes[..i].contains(&axis),
                "pack axes contain duplicate axis {}",
                axis
            );
        }
        PackAxes { lanes, axes }
    }

    pub fn lanes(&self) -> &[usize] {
        &self.lanes
    }

    pub fn axes(&self) -> &[usize] {
        &self.axes
    }

    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    /// Return the lane width used for `axis`, if it is packed.
    pub fn lane_for(&self, axis: usize) -> Option<usize> {
        self.axes
            .iter()
            .position(|&a| a == axis)
            .map(|i| self.lanes[i])
    }
}

/// Lane re-grouping performed by a packed `Cast` whose output element size
/// differs from its input element size.
#[derive(Clone, Debug, PartialEq)]
pub struct LaneRescale {
    pub axes: AxisVec,
    pub in_lanes: AxisVec,
    pub out_lanes: AxisVec,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    Unary(UnaryOp),
    Binary(BinaryOp),
    Compare(CompareOp),
    /// `Where(mask, a, b)`: elementwise select.
    Where,
    Reduce {
        op: ReduceOp,
        axes: AxisVec,
        keep_dims: bool,
    },
    MatMul {
        transpose_a: bool,
        transpose_b: bool,
        /// Set when both operands are lane-packed along K; the kernel then
        /// also reduces across lanes while contracting.
        pack_k: bool,
    },
    Conv2D {
        stride: [usize; 2],
        /// Top, left, bottom, right spatial padding.
        padding: [usize; 4],
        dilation: [usize; 2],
        fused_clamp: Option<(f32, f32)>,
    },
    /// Patch-matrix extraction produced when lowering `Conv2D`. Rows are
    /// ordered `(kh, kw, c)` with channels fastest-varying, columns are
    /// `(oh, ow)`.
    Im2col {
        kernel: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 4],
        dilation: [usize; 2],
    },
    Transpose {
        perm: DimVec,
    },
    Reshape {
        shape: DimVec,
    },
    /// Full-rank slice with static bounds.
    Slice {
        starts: DimVec,
        ends: DimVec,
    },
    /// Concatenates the elements of a tuple argument.
    Concat {
        axis: usize,
    },
    Gather {
        axis: usize,
    },
    /// `ScatterNd(data, indices, updates)` with `[m, k]` index tuples.
    ScatterNd,
    Cast {
        to: DataType,
        /// Lane re-grouping for packed casts whose element size changes.
        rescale: Option<LaneRescale>,
    },
    Expand {
        shape: DimVec,
    },
    Unsqueeze {
        axes: AxisVec,
    },
    Softmax {
        axis: usize,
    },
    LayerNorm {
        axis: usize,
        epsilon: f32,
        /// `(axis, count)` fake trailing elements introduced by lane
        /// padding on normalized axes; the kernel masks them out of its
        /// internal reduction.
        pad_tail: PadVec,
    },
    InstanceNorm {
        epsilon: f32,
        pad_tail: PadVec,
    },
    ResizeImage {
        scale_h: usize,
        scale_w: usize,
        mode: ResizeMode,
    },
    Pad {
        pads: PadVec,
        fill: PadFill,
    },
    Pack(PackAxes),
    Unpack(PackAxes),
    PackMask {
        pack: PackAxes,
        style: MaskVectorStyle,
    },
}

impl Op {
    /// Return the name of this operator, used in patterns and diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Unary(op) => match op {
                UnaryOp::Neg => "Neg",
                UnaryOp::Abs => "Abs",
                UnaryOp::Sqrt => "Sqrt",
                UnaryOp::Exp => "Exp",
                UnaryOp::Log => "Log",
                UnaryOp::Erf => "Erf",
                UnaryOp::Sigmoid => "Sigmoid",
            },
            Op::Binary(op) => match op {
                BinaryOp::Add => "Add",
                BinaryOp::Sub => "Sub",
                BinaryOp::Mul => "Mul",
                BinaryOp::Div => "Div",
                BinaryOp::Min => "Min",
                BinaryOp::Max => "Max",
                BinaryOp::Pow => "Pow",
            },
            Op::Compare(op) => match op {
                CompareOp::Equal => "Equal",
                CompareOp::Less => "Less",
                CompareOp::LessOrEqual => "LessOrEqual",
                CompareOp::Greater => "Greater",
                CompareOp::GreaterOrEqual => "GreaterOrEqual",
            },
            Op::Where => "Where",
            Op::Reduce { .. } => "Reduce",
            Op::MatMul { .. } => "MatMul",
            Op::Conv2D { .. } => "Conv2D",
            Op::Im2col { .. } => "Im2col",
            Op::Transpose { .. } => "Transpose",
            Op::Reshape { .. } => "Reshape",
            Op::Slice { .. } => "Slice",
            Op::Concat { .. } => "Concat",
            Op::Gather { .. } => "Gather",
            Op::ScatterNd => "ScatterNd",
            Op::Cast { .. } => "Cast",
            Op::Expand { .. } => "Expand",
            Op::Unsqueeze { .. } => "Unsqueeze",
            Op::Softmax { .. } => "Softmax",
            Op::LayerNorm { .. } => "LayerNorm",
            Op::InstanceNorm { .. } => "InstanceNorm",
            Op::ResizeImage { .. } => "ResizeImage",
            Op::Pad { .. } => "Pad",
            Op::Pack(_) => "Pack",
            Op::Unpack(_) => "Unpack",
            Op::PackMask { .. } => "PackMask",
        }
    }

    /// True if this is a binary operator whose operands may be swapped.
    pub fn is_commutative(&self) -> bool {
        matches!(self, Op::Binary(op) if op.is_commutative())
    }
}
