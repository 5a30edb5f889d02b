//! Reference interpreter for expression graphs.
//!
//! The interpreter exists to check rewrites, not to be fast: every kernel
//! is a plain index loop. Packed values are carried in logical (padded,
//! unpacked) form together with a marker recording the pack parameters;
//! `Pack` validates lane alignment and attaches the marker, `Unpack`
//! detaches it, and shape-parameterized operators in between scale their
//! parameters from packed to logical units using the marker.

use std::error::Error;
use std::fmt;

use rustc_hash::FxHashMap;

use crate::expr::{Expr, ExprKind, ExprRef};
use crate::ops::{
    BinaryOp, CompareOp, Op, PackAxes, PadFill, PadVec, ReduceOp, ResizeMode, UnaryOp,
};
use crate::tensor::{broadcast_shapes, indices, Tensor};
use crate::value::{DataType, Value};
use crate::vectorize::axes::{
    axis_after_gather, axis_after_reduce, axis_after_unsqueeze, reshape_axis_map,
    transpose_axis, ReshapeAxisMap,
};

#[derive(Debug, PartialEq, Eq)]
pub enum EvalError {
    /// A free variable was not supplied an input value.
    MissingInput(String),
    /// An operator received arguments it cannot evaluate.
    Operator { op: &'static str, reason: String },
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::MissingInput(name) => {
                write!(f, "no input value supplied for \"{}\"", name)
            }
            EvalError::Operator { op, reason } => write!(f, "{}: {}", op, reason),
        }
    }
}

impl Error for EvalError {}

fn op_err(op: &'static str, reason: impl Into<String>) -> EvalError {
    EvalError::Operator {
        op,
        reason: reason.into(),
    }
}

/// Apply the same tensor kernel to whichever element type a value holds.
macro_rules! per_tensor {
    ($value:expr, |$t:ident| $body:expr) => {
        match $value {
            Value::Float($t) => Value::Float($body),
            Value::Int32($t) => Value::Int32($body),
            Value::Mask($t) => Value::Mask($body),
        }
    };
}

/// A value in flight: its logical tensor plus the pack marker, if any.
#[derive(Clone)]
struct PackedValue {
    value: Value,
    mark: Option<PackAxes>,
}

impl PackedValue {
    fn plain(value: Value) -> PackedValue {
        PackedValue { value, mark: None }
    }
}

/// Evaluate a graph with the given named inputs.
///
/// The result must be fully unpacked; a graph whose root still carries
/// pack markers is malformed.
pub fn evaluate(expr: &Expr, inputs: &[(&str, Value)]) -> Result<Value, EvalError> {
    let mut evaluator = Evaluator {
        inputs,
        memo: FxHashMap::default(),
    };
    let out = evaluator.eval(expr)?;
    if out.mark.is_some() {
        return Err(op_err("Pack", "graph result is still packed"));
    }
    Ok(out.value)
}

/// Cosine similarity of two equal-length float slices.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len());
    let mut dot = 0f64;
    let mut norm_a = 0f64;
    let mut norm_b = 0f64;
    for (&x, &y) in a.iter().zip(b) {
        dot += x as f64 * y as f64;
        norm_a += x as f64 * x as f64;
        norm_b += y as f64 * y as f64;
    }
    if norm_a == 0. && norm_b == 0. {
        return 1.;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())) as f32
}

struct Evaluator<'a> {
    inputs: &'a [(&'a str, Value)],
    memo: FxHashMap<ExprRef, PackedValue>,
}

impl Evaluator<'_> {
    fn eval(&mut self, expr: &Expr) -> Result<PackedValue, EvalError> {
        if let Some(cached) = self.memo.get(&ExprRef(expr.clone())) {
            return Ok(cached.clone());
        }
        let result = match expr.kind() {
            ExprKind::Var { name, .. } => self
                .inputs
                .iter()
                .find_map(|(n, v)| (*n == name.as_str()).then(|| PackedValue::plain(v.clone())))
                .ok_or_else(|| EvalError::MissingInput(name.clone()))?,
            ExprKind::Constant(value) => PackedValue::plain(value.clone()),
            ExprKind::Tuple(_) => {
                return Err(op_err("Tuple", "tuple outside a concat argument"))
            }
            ExprKind::Call { op, args } => self.eval_call(op, args)?,
        };
        self.memo.insert(ExprRef(expr.clone()), result.clone());
        Ok(result)
    }

    fn eval_call(&mut self, op: &Op, args: &[Expr]) -> Result<PackedValue, EvalError> {
        match op {
            Op::Unary(unary) => {
                let x = self.eval(&args[0])?;
                Ok(PackedValue {
                    value: eval_unary(*unary, &x.value)?,
                    mark: x.mark,
                })
            }
            Op::Binary(binary) => {
                let (a, b) = (self.eval(&args[0])?, self.eval(&args[1])?);
                let value = eval_binary(*binary, &a.value, &b.value)?;
                let mark = elementwise_mark("Binary", value.ndim(), &[&a, &b])?;
                Ok(PackedValue { value, mark })
            }
            Op::Compare(compare) => {
                let (a, b) = (self.eval(&args[0])?, self.eval(&args[1])?);
                let value = eval_compare(*compare, &a.value, &b.value)?;
                let mark = elementwise_mark("Compare", value.ndim(), &[&a, &b])?;
                Ok(PackedValue { value, mark })
            }
            Op::Where => {
                let mask = self.eval(&args[0])?;
                let (a, b) = (self.eval(&args[1])?, self.eval(&args[2])?);
                let value = eval_where(&mask.value, &a.value, &b.value)?;
                let mark = elementwise_mark("Where", value.ndim(), &[&mask, &a, &b])?;
                Ok(PackedValue { value, mark })
            }
            Op::Reduce {
                op: reduce,
                axes,
                keep_dims,
            } => {
                let x = self.eval(&args[0])?;
                let value = eval_reduce(*reduce, axes, *keep_dims, &x.value)?;
                let mark = reduce_mark(&x.mark, axes, *keep_dims);
                Ok(PackedValue { value, mark })
            }
            Op::MatMul {
                transpose_a,
                transpose_b,
                pack_k,
            } => self.eval_matmul(args, *transpose_a, *transpose_b, *pack_k),
            Op::Conv2D {
                stride,
                padding,
                dilation,
                fused_clamp,
            } => {
                let x = self.eval(&args[0])?;
                let w = self.eval(&args[1])?;
                if x.mark.is_some() || w.mark.is_some() {
                    return Err(op_err("Conv2D", "packed operands are not supported"));
                }
                Ok(PackedValue::plain(eval_conv2d(
                    &x.value,
                    &w.value,
                    *stride,
                    *padding,
                    *dilation,
                    *fused_clamp,
                )?))
            }
            Op::Im2col {
                kernel,
                stride,
                padding,
                dilation,
            } => {
                let x = self.eval(&args[0])?;
                let out_mark = match &x.mark {
                    None => None,
                    Some(pack) if pack.axes() == [1] => Some(PackAxes::new(
                        [pack.lanes()[0]],
                        [0usize],
                    )),
                    Some(_) => {
                        return Err(op_err("Im2col", "only the channel axis may be packed"))
                    }
                };
                Ok(PackedValue {
                    value: eval_im2col(&x.value, *kernel, *stride, *padding, *dilation)?,
                    mark: out_mark,
                })
            }
            Op::Transpose { perm } => {
                let x = self.eval(&args[0])?;
                let mark = x.mark.map(|pack| {
                    let axes: Vec<usize> =
                        pack.axes().iter().map(|&a| transpose_axis(perm, a)).collect();
                    PackAxes::new(pack.lanes().to_vec(), axes)
                });
                Ok(PackedValue {
                    value: per_tensor!(&x.value, |t| transpose_tensor(t, perm)),
                    mark,
                })
            }
            Op::Reshape { shape } => self.eval_reshape(&args[0], shape),
            Op::Slice { starts, ends } => {
                let x = self.eval(&args[0])?;
                let mut lo: Vec<usize> = starts.iter().copied().collect();
                let mut hi: Vec<usize> = ends.iter().copied().collect();
                if let Some(pack) = &x.mark {
                    for (&lane, &axis) in pack.lanes().iter().zip(pack.axes()) {
                        lo[axis] *= lane;
                        hi[axis] *= lane;
                    }
                }
                Ok(PackedValue {
                    value: per_tensor!(&x.value, |t| slice_tensor(t, &lo, &hi)),
                    mark: x.mark,
                })
            }
            Op::Concat { axis } => self.eval_concat(&args[0], *axis),
            Op::Gather { axis } => {
                let data = self.eval(&args[0])?;
                let idx = self.eval(&args[1])?;
                if idx.mark.is_some() {
                    return Err(op_err("Gather", "packed indices are not supported"));
                }
                let indices_tensor = idx
                    .value
                    .as_i32()
                    .ok_or_else(|| op_err("Gather", "indices must be i32"))?;
                if let Some(pack) = &data.mark {
                    if pack.axes().contains(axis) {
                        return Err(op_err("Gather", "the gathered axis is packed"));
                    }
                }
                let idx_rank = indices_tensor.ndim();
                let mark = data.mark.map(|pack| {
                    let (lanes, axes): (Vec<usize>, Vec<usize>) = pack
                        .lanes()
                        .iter()
                        .zip(pack.axes())
                        .filter_map(|(&lane, &a)| {
                            axis_after_gather(a, *axis, idx_rank).map(|out| (lane, out))
                        })
                        .unzip();
                    PackAxes::new(lanes, axes)
                });
                Ok(PackedValue {
                    value: per_tensor!(&data.value, |t| {
                        gather_tensor(t, indices_tensor, *axis)
                    }),
                    mark,
                })
            }
            Op::ScatterNd => self.eval_scatter_nd(args),
            Op::Cast { to, rescale } => {
                let x = self.eval(&args[0])?;
                let mark = match (&x.mark, rescale) {
                    (mark, None) => mark.clone(),
                    (Some(pack), Some(rescale)) => {
                        if pack.axes() != rescale.axes.as_slice()
                            || pack.lanes() != rescale.in_lanes.as_slice()
                        {
                            return Err(op_err("Cast", "lane rescale does not match pack"));
                        }
                        Some(PackAxes::new(
                            rescale.out_lanes.clone(),
                            rescale.axes.clone(),
                        ))
                    }
                    (None, Some(_)) => {
                        return Err(op_err("Cast", "lane rescale of an unpacked value"))
                    }
                };
                Ok(PackedValue {
                    value: eval_cast(*to, &x.value)?,
                    mark,
                })
            }
            Op::Expand { shape } => {
                let x = self.eval(&args[0])?;
                let offset = shape.len() - x.value.ndim();
                let mut target: Vec<usize> = shape.iter().copied().collect();
                let mark = x.mark.map(|pack| {
                    let axes: Vec<usize> =
                        pack.axes().iter().map(|&a| a + offset).collect();
                    PackAxes::new(pack.lanes().to_vec(), axes)
                });
                if let Some(pack) = &mark {
                    for (&lane, &axis) in pack.lanes().iter().zip(pack.axes()) {
                        target[axis] *= lane;
                    }
                }
                Ok(PackedValue {
                    value: per_tensor!(&x.value, |t| expand_tensor(t, &target)),
                    mark,
                })
            }
            Op::Unsqueeze { axes } => {
                let x = self.eval(&args[0])?;
                let mut shape: Vec<usize> = x.value.shape().to_vec();
                let mut inserted: Vec<usize> = axes.iter().copied().collect();
                inserted.sort_unstable();
                for &axis in &inserted {
                    shape.insert(axis, 1);
                }
                let mark = x.mark.map(|pack| {
                    let new_axes: Vec<usize> = pack
                        .axes()
                        .iter()
                        .map(|&a| axis_after_unsqueeze(a, axes))
                        .collect();
                    PackAxes::new(pack.lanes().to_vec(), new_axes)
                });
                Ok(PackedValue {
                    value: per_tensor!(&x.value, |t| t.reshaped(&shape)),
                    mark,
                })
            }
            Op::Softmax { axis } => {
                let x = self.eval(&args[0])?;
                Ok(PackedValue {
                    value: eval_softmax(&x.value, *axis)?,
                    mark: x.mark,
                })
            }
            Op::LayerNorm {
                axis,
                epsilon,
                pad_tail,
            } => {
                let x = self.eval(&args[0])?;
                let scale = self.eval(&args[1])?;
                let bias = self.eval(&args[2])?;
                Ok(PackedValue {
                    value: eval_layer_norm(
                        &x.value,
                        &scale.value,
                        &bias.value,
                        *axis,
                        *epsilon,
                        pad_tail,
                    )?,
                    mark: x.mark,
                })
            }
            Op::InstanceNorm { epsilon, pad_tail } => {
                let x = self.eval(&args[0])?;
                let scale = self.eval(&args[1])?;
                let bias = self.eval(&args[2])?;
                Ok(PackedValue {
                    value: eval_instance_norm(
                        &x.value,
                        &scale.value,
                        &bias.value,
                        *epsilon,
                        pad_tail,
                    )?,
                    mark: x.mark,
                })
            }
            Op::ResizeImage {
                scale_h,
                scale_w,
                mode,
            } => {
                let x = self.eval(&args[0])?;
                if let Some(pack) = &x.mark {
                    if pack.axes().iter().any(|&a| a >= 2) {
                        return Err(op_err("ResizeImage", "a spatial axis is packed"));
                    }
                }
                Ok(PackedValue {
                    value: eval_resize(&x.value, *scale_h, *scale_w, *mode)?,
                    mark: x.mark,
                })
            }
            Op::Pad { pads, fill } => {
                let x = self.eval(&args[0])?;
                if x.mark.is_some() {
                    return Err(op_err("Pad", "padding a packed value"));
                }
                Ok(PackedValue::plain(eval_pad(&x.value, pads, *fill)?))
            }
            Op::Pack(pack) => {
                let x = self.eval(&args[0])?;
                self.apply_pack(x, pack, "Pack")
            }
            Op::PackMask { pack, .. } => {
                let x = self.eval(&args[0])?;
                if x.value.as_mask().is_none() {
                    return Err(op_err("PackMask", "operand is not a mask"));
                }
                self.apply_pack(x, pack, "PackMask")
            }
            Op::Unpack(pack) => {
                let x = self.eval(&args[0])?;
                match &x.mark {
                    Some(mark) if mark == pack => Ok(PackedValue::plain(x.value)),
                    Some(_) => Err(op_err("Unpack", "pack parameters do not match")),
                    None => Err(op_err("Unpack", "operand is not packed")),
                }
            }
        }
    }

    fn apply_pack(
        &self,
        x: PackedValue,
        pack: &PackAxes,
        op: &'static str,
    ) -> Result<PackedValue, EvalError> {
        if x.mark.is_some() {
            return Err(op_err(op, "operand is already packed"));
        }
        for (&lane, &axis) in pack.lanes().iter().zip(pack.axes()) {
            let dim = x.value.shape()[axis];
            if lane == 0 || dim % lane != 0 {
                return Err(op_err(
                    op,
                    format!("axis {} extent {} is not a multiple of lane {}", axis, dim, lane),
                ));
            }
        }
        Ok(PackedValue {
            value: x.value,
            mark: Some(pack.clone()),
        })
    }

    fn eval_matmul(
        &mut self,
        args: &[Expr],
        transpose_a: bool,
        transpose_b: bool,
        pack_k: bool,
    ) -> Result<PackedValue, EvalError> {
        let a = self.eval(&args[0])?;
        let b = self.eval(&args[1])?;
        let (ta, tb) = (
            a.value
                .as_f32()
                .ok_or_else(|| op_err("MatMul", "operands must be f32"))?,
            b.value
                .as_f32()
                .ok_or_else(|| op_err("MatMul", "operands must be f32"))?,
        );
        let a_rank = ta.ndim();
        let b_rank = tb.ndim();
        let (m_axis, ak_axis) = if transpose_a {
            (a_rank - 1, a_rank - 2)
        } else {
            (a_rank - 2, a_rank - 1)
        };
        let (bk_axis, n_axis) = if transpose_b {
            (b_rank - 1, b_rank - 2)
        } else {
            (b_rank - 2, b_rank - 1)
        };
        if let Some(pack) = &a.mark {
            if pack.axes().iter().any(|&ax| ax != m_axis && ax != ak_axis) {
                return Err(op_err("MatMul", "a batch axis is packed"));
            }
        }
        if let Some(pack) = &b.mark {
            if pack.axes().iter().any(|&ax| ax != n_axis && ax != bk_axis) {
                return Err(op_err("MatMul", "a batch axis is packed"));
            }
        }

        let a_k_packed = a.mark.as_ref().is_some_and(|p| p.axes().contains(&ak_axis));
        let b_k_packed = b.mark.as_ref().is_some_and(|p| p.axes().contains(&bk_axis));
        if pack_k != (a_k_packed && b_k_packed) {
            return Err(op_err("MatMul", "pack_k flag does not match operand packing"));
        }
        let m_lane = a
            .mark
            .as_ref()
            .and_then(|p| p.lane_for(m_axis));
        let n_lane = b.mark.as_ref().and_then(|p| p.lane_for(n_axis));

        let value = matmul_tensors(ta, tb, transpose_a, transpose_b)?;
        let out_rank = value.ndim();
        let mut lanes = Vec::new();
        let mut axes = Vec::new();
        if let Some(lane) = m_lane {
            lanes.push(lane);
            axes.push(out_rank - 2);
        }
        if let Some(lane) = n_lane {
            lanes.push(lane);
            axes.push(out_rank - 1);
        }
        let mark = (!axes.is_empty()).then(|| PackAxes::new(lanes, axes));
        Ok(PackedValue {
            value: Value::Float(value),
            mark,
        })
    }

    fn eval_reshape(&mut self, arg: &Expr, shape: &[usize]) -> Result<PackedValue, EvalError> {
        let x = self.eval(arg)?;
        let Some(pack) = &x.mark else {
            return Ok(PackedValue {
                value: per_tensor!(&x.value, |t| t.reshaped(shape)),
                mark: None,
            });
        };
        // The reshape parameter is in packed units, but a packed axis of
        // small extent can lose its identity in packed-space grouping
        // (a fully packed axis has packed extent 1). Classify on the
        // logical shapes instead, as the rules do: find output axes which,
        // scaled back up by the lanes, carry every packed axis through.
        let out_axes = packed_reshape_axes(x.value.shape(), shape, pack)
            .ok_or_else(|| op_err("Reshape", "a packed axis fragments"))?;
        let mut target: Vec<usize> = shape.to_vec();
        let mut lanes = Vec::new();
        let mut axes = Vec::new();
        for (&lane, &out_axis) in pack.lanes().iter().zip(&out_axes) {
            target[out_axis] *= lane;
            lanes.push(lane);
            axes.push(out_axis);
        }
        Ok(PackedValue {
            value: per_tensor!(&x.value, |t| t.reshaped(&target)),
            mark: Some(PackAxes::new(lanes, axes)),
        })
    }

    fn eval_concat(&mut self, arg: &Expr, axis: usize) -> Result<PackedValue, EvalError> {
        let Some(items) = arg.as_tuple() else {
            return Err(op_err("Concat", "argument must be a tuple"));
        };
        if items.is_empty() {
            return Err(op_err("Concat", "empty tuple"));
        }
        let evaluated: Vec<PackedValue> = items
            .iter()
            .map(|item| self.eval(item))
            .collect::<Result<_, _>>()?;
        let mark = evaluated[0].mark.clone();
        if evaluated.iter().any(|pv| pv.mark != mark) {
            return Err(op_err("Concat", "mixed packing among pieces"));
        }
        if let Some(pack) = &mark {
            if let Some(lane) = pack.lane_for(axis) {
                for pv in &evaluated {
                    if pv.value.shape()[axis] % lane != 0 {
                        return Err(op_err("Concat", "a piece cuts a lane at the seam"));
                    }
                }
            }
        }
        let value = match &evaluated[0].value {
            Value::Float(_) => {
                let tensors: Option<Vec<&Tensor<f32>>> =
                    evaluated.iter().map(|pv| pv.value.as_f32()).collect();
                let tensors = tensors.ok_or_else(|| op_err("Concat", "mixed dtypes"))?;
                Value::Float(concat_tensors(&tensors, axis)?)
            }
            Value::Int32(_) => {
                let tensors: Option<Vec<&Tensor<i32>>> =
                    evaluated.iter().map(|pv| pv.value.as_i32()).collect();
                let tensors = tensors.ok_or_else(|| op_err("Concat", "mixed dtypes"))?;
                Value::Int32(concat_tensors(&tensors, axis)?)
            }
            Value::Mask(_) => {
                let tensors: Option<Vec<&Tensor<u8>>> =
                    evaluated.iter().map(|pv| pv.value.as_mask()).collect();
                let tensors = tensors.ok_or_else(|| op_err("Concat", "mixed dtypes"))?;
                Value::Mask(concat_tensors(&tensors, axis)?)
            }
        };
        Ok(PackedValue { value, mark })
    }

    fn eval_scatter_nd(&mut self, args: &[Expr]) -> Result<PackedValue, EvalError> {
        let data = self.eval(&args[0])?;
        let idx = self.eval(&args[1])?;
        let updates = self.eval(&args[2])?;
        let indices_tensor = idx
            .value
            .as_i32()
            .ok_or_else(|| op_err("ScatterNd", "indices must be i32"))?;
        let k = indices_tensor.shape()[1];
        match (&data.mark, &updates.mark) {
            (None, None) => {}
            (Some(dp), Some(up)) => {
                let expected: Vec<usize> = dp.axes().iter().map(|&a| a - k + 1).collect();
                if dp.axes().iter().any(|&a| a < k)
                    || up.axes() != expected.as_slice()
                    || up.lanes() != dp.lanes()
                {
                    return Err(op_err("ScatterNd", "update packing does not match data"));
                }
            }
            _ => return Err(op_err("ScatterNd", "update packing does not match data")),
        }
        let value = match (&data.value, &updates.value) {
            (Value::Float(d), Value::Float(u)) => {
                Value::Float(scatter_nd_tensor(d, indices_tensor, u)?)
            }
            (Value::Int32(d), Value::Int32(u)) => {
                Value::Int32(scatter_nd_tensor(d, indices_tensor, u)?)
            }
            _ => return Err(op_err("ScatterNd", "data/update dtype mismatch")),
        };
        Ok(PackedValue {
            value,
            mark: data.mark,
        })
    }
}

/// Merge the pack markers of elementwise operands, right-aligned against
/// the output rank.
fn elementwise_mark(
    op: &'static str,
    out_rank: usize,
    operands: &[&PackedValue],
) -> Result<Option<PackAxes>, EvalError> {
    let mut merged: Vec<(usize, usize)> = Vec::new();
    for pv in operands {
        let Some(pack) = &pv.mark else { continue };
        let offset = out_rank - pv.value.ndim();
        for (&lane, &axis) in pack.lanes().iter().zip(pack.axes()) {
            let out_axis = axis + offset;
            match merged.iter().find(|&&(a, _)| a == out_axis) {
                Some(&(_, l)) if l == lane => {}
                Some(_) => return Err(op_err(op, "operands disagree on a packed lane")),
                None => merged.push((out_axis, lane)),
            }
        }
    }
    if merged.is_empty() {
        return Ok(None);
    }
    merged.sort_unstable();
    let (axes, lanes): (Vec<usize>, Vec<usize>) = merged.into_iter().unzip();
    Ok(Some(PackAxes::new(lanes, axes)))
}

fn reduce_mark(mark: &Option<PackAxes>, axes: &[usize], keep_dims: bool) -> Option<PackAxes> {
    let pack = mark.as_ref()?;
    let (lanes, out_axes): (Vec<usize>, Vec<usize>) = pack
        .lanes()
        .iter()
        .zip(pack.axes())
        .filter_map(|(&lane, &a)| axis_after_reduce(a, axes, keep_dims).map(|o| (lane, o)))
        .unzip();
    (!out_axes.is_empty()).then(|| PackAxes::new(lanes, out_axes))
}

fn unary_f32(op: UnaryOp, x: f32) -> f32 {
    match op {
        UnaryOp::Neg => -x,
        UnaryOp::Abs => x.abs(),
        UnaryOp::Sqrt => x.sqrt(),
        UnaryOp::Exp => x.exp(),
        UnaryOp::Log => x.ln(),
        UnaryOp::Erf => erf(x),
        UnaryOp::Sigmoid => 1. / (1. + (-x).exp()),
    }
}

/// Abramowitz-Stegun 7.1.26 rational approximation, accurate to ~1.5e-7.
fn erf(x: f32) -> f32 {
    let sign = if x < 0. { -1. } else { 1. };
    let x = x.abs();
    let t = 1. / (1. + 0.3275911 * x);
    let poly = t
        * (0.254829592 + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    sign * (1. - poly * (-x * x).exp())
}

fn eval_unary(op: UnaryOp, x: &Value) -> Result<Value, EvalError> {
    match x {
        Value::Float(t) => Ok(Value::Float(t.map(|v| unary_f32(op, v)))),
        Value::Int32(t) => match op {
            UnaryOp::Neg => Ok(Value::Int32(t.map(|v| v.wrapping_neg()))),
            UnaryOp::Abs => Ok(Value::Int32(t.map(|v| v.wrapping_abs()))),
            _ => Err(op_err("Unary", "operator requires a float operand")),
        },
        Value::Mask(_) => Err(op_err("Unary", "mask operand")),
    }
}

fn binary_f32(op: BinaryOp, a: f32, b: f32) -> f32 {
    match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Min => a.min(b),
        BinaryOp::Max => a.max(b),
        BinaryOp::Pow => a.powf(b),
    }
}

fn binary_i32(op: BinaryOp, a: i32, b: i32) -> i32 {
    match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        // Division by zero can only occur in lane fill, which is trimmed
        // before it is observed; any defined value will do.
        BinaryOp::Div => {
            if b == 0 {
                0
            } else {
                a.wrapping_div(b)
            }
        }
        BinaryOp::Min => a.min(b),
        BinaryOp::Max => a.max(b),
        BinaryOp::Pow => {
            if b < 0 {
                0
            } else {
                a.wrapping_pow(b as u32)
            }
        }
    }
}

fn broadcast_map<T: Copy>(
    op: &'static str,
    a: &Tensor<T>,
    b: &Tensor<T>,
    f: impl Fn(T, T) -> T,
) -> Result<Tensor<T>, EvalError> {
    let shape = broadcast_shapes(a.shape(), b.shape())
        .ok_or_else(|| op_err(op, "shapes do not broadcast"))?;
    let data: Vec<T> = indices(&shape)
        .map(|idx| f(a.broadcast_get(&idx), b.broadcast_get(&idx)))
        .collect();
    Ok(Tensor::from_data(&shape, data))
}

fn eval_binary(op: BinaryOp, a: &Value, b: &Value) -> Result<Value, EvalError> {
    match (a, b) {
        (Value::Float(ta), Value::Float(tb)) => Ok(Value::Float(broadcast_map(
            "Binary",
            ta,
            tb,
            |x, y| binary_f32(op, x, y),
        )?)),
        (Value::Int32(ta), Value::Int32(tb)) => Ok(Value::Int32(broadcast_map(
            "Binary",
            ta,
            tb,
            |x, y| binary_i32(op, x, y),
        )?)),
        _ => Err(op_err("Binary", "operand dtype mismatch")),
    }
}

fn compare<T: PartialOrd>(op: CompareOp, a: T, b: T) -> u8 {
    let result = match op {
        CompareOp::Equal => a == b,
        CompareOp::Less => a < b,
        CompareOp::LessOrEqual => a <= b,
        CompareOp::Greater => a > b,
        CompareOp::GreaterOrEqual => a >= b,
    };
    result as u8
}

fn eval_compare(op: CompareOp, a: &Value, b: &Value) -> Result<Value, EvalError> {
    fn go<T: Copy + PartialOrd>(
        op: CompareOp,
        a: &Tensor<T>,
        b: &Tensor<T>,
    ) -> Result<Tensor<u8>, EvalError> {
        let shape = broadcast_shapes(a.shape(), b.shape())
            .ok_or_else(|| op_err("Compare", "shapes do not broadcast"))?;
        let data: Vec<u8> = indices(&shape)
            .map(|idx| compare(op, a.broadcast_get(&idx), b.broadcast_get(&idx)))
            .collect();
        Ok(Tensor::from_data(&shape, data))
    }
    match (a, b) {
        (Value::Float(ta), Value::Float(tb)) => Ok(Value::Mask(go(op, ta, tb)?)),
        (Value::Int32(ta), Value::Int32(tb)) => Ok(Value::Mask(go(op, ta, tb)?)),
        _ => Err(op_err("Compare", "operand dtype mismatch")),
    }
}

fn eval_where(mask: &Value, a: &Value, b: &Value) -> Result<Value, EvalError> {
    let mask_tensor = mask
        .as_mask()
        .ok_or_else(|| op_err("Where", "condition must be a mask"))?;
    fn go<T: Copy>(
        mask: &Tensor<u8>,
        a: &Tensor<T>,
        b: &Tensor<T>,
    ) -> Result<Tensor<T>, EvalError> {
        let data_shape = broadcast_shapes(a.shape(), b.shape())
            .ok_or_else(|| op_err("Where", "shapes do not broadcast"))?;
        let shape = broadcast_shapes(&data_shape, mask.shape())
            .ok_or_else(|| op_err("Where", "shapes do not broadcast"))?;
        let data: Vec<T> = indices(&shape)
            .map(|idx| {
                if mask.broadcast_get(&idx) != 0 {
                    a.broadcast_get(&idx)
                } else {
                    b.broadcast_get(&idx)
                }
            })
            .collect();
        Ok(Tensor::from_data(&shape, data))
    }
    match (a, b) {
        (Value::Float(ta), Value::Float(tb)) => Ok(Value::Float(go(mask_tensor, ta, tb)?)),
        (Value::Int32(ta), Value::Int32(tb)) => Ok(Value::Int32(go(mask_tensor, ta, tb)?)),
        (Value::Mask(ta), Value::Mask(tb)) => Ok(Value::Mask(go(mask_tensor, ta, tb)?)),
        _ => Err(op_err("Where", "branch dtype mismatch")),
    }
}

fn reduce_out_shape(shape: &[usize], axes: &[usize], keep_dims: bool) -> Vec<usize> {
    shape
        .iter()
        .enumerate()
        .filter_map(|(i, &d)| {
            if axes.contains(&i) {
                keep_dims.then_some(1)
            } else {
                Some(d)
            }
        })
        .collect()
}

fn eval_reduce(
    op: ReduceOp,
    axes: &[usize],
    keep_dims: bool,
    x: &Value,
) -> Result<Value, EvalError> {
    match x {
        Value::Float(t) => {
            let (init, fold): (f32, fn(f32, f32) -> f32) = match op {
                ReduceOp::Sum | ReduceOp::Mean => (0., |acc, v| acc + v),
                ReduceOp::Min => (f32::INFINITY, f32::min),
                ReduceOp::Max => (f32::NEG_INFINITY, f32::max),
            };
            let mut out = reduce_tensor(t, axes, keep_dims, init, fold);
            if op == ReduceOp::Mean {
                let count: usize = axes.iter().map(|&a| t.shape()[a]).product();
                for v in out.data_mut() {
                    *v /= count as f32;
                }
            }
            Ok(Value::Float(out))
        }
        Value::Int32(t) => {
            let (init, fold): (i32, fn(i32, i32) -> i32) = match op {
                ReduceOp::Sum | ReduceOp::Mean => (0, |acc, v| acc.wrapping_add(v)),
                ReduceOp::Min => (i32::MAX, std::cmp::min),
                ReduceOp::Max => (i32::MIN, std::cmp::max),
            };
            let mut out = reduce_tensor(t, axes, keep_dims, init, fold);
            if op == ReduceOp::Mean {
                let count: usize = axes.iter().map(|&a| t.shape()[a]).product();
                for v in out.data_mut() {
                    *v /= count as i32;
                }
            }
            Ok(Value::Int32(out))
        }
        Value::Mask(_) => Err(op_err("Reduce", "mask operand")),
    }
}

fn reduce_tensor<T: Copy>(
    t: &Tensor<T>,
    axes: &[usize],
    keep_dims: bool,
    init: T,
    fold: fn(T, T) -> T,
) -> Tensor<T> {
    let out_shape = reduce_out_shape(t.shape(), axes, keep_dims);
    let mut out = Tensor::full(&out_shape, init);
    for idx in indices(t.shape()) {
        let out_idx: Vec<usize> = idx
            .iter()
            .enumerate()
            .filter_map(|(i, &v)| {
                if axes.contains(&i) {
                    keep_dims.then_some(0)
                } else {
                    Some(v)
                }
            })
            .collect();
        let acc = out.get(&out_idx);
        out.set(&out_idx, fold(acc, t.get(&idx)));
    }
    out
}

fn matmul_tensors(
    a: &Tensor<f32>,
    b: &Tensor<f32>,
    transpose_a: bool,
    transpose_b: bool,
) -> Result<Tensor<f32>, EvalError> {
    let a_rank = a.ndim();
    let b_rank = b.ndim();
    if a_rank < 2 || b_rank < 2 {
        return Err(op_err("MatMul", "operands must have rank >= 2"));
    }
    let (m, ka) = if transpose_a {
        (a.shape()[a_rank - 1], a.shape()[a_rank - 2])
    } else {
        (a.shape()[a_rank - 2], a.shape()[a_rank - 1])
    };
    let (kb, n) = if transpose_b {
        (b.shape()[b_rank - 1], b.shape()[b_rank - 2])
    } else {
        (b.shape()[b_rank - 2], b.shape()[b_rank - 1])
    };
    if ka != kb {
        return Err(op_err("MatMul", "contraction extents differ"));
    }
    let batch_shape = broadcast_shapes(&a.shape()[..a_rank - 2], &b.shape()[..b_rank - 2])
        .ok_or_else(|| op_err("MatMul", "batch shapes do not broadcast"))?;
    let mut out_shape = batch_shape.clone();
    out_shape.push(m);
    out_shape.push(n);

    let operand_index = |shape: &[usize], batch: &[usize], row: usize, col: usize| {
        let rank = shape.len();
        let mut idx = vec![0; rank];
        for i in 0..rank - 2 {
            let batch_i = batch.len() - (rank - 2) + i;
            idx[i] = if shape[i] == 1 { 0 } else { batch[batch_i] };
        }
        idx[rank - 2] = row;
        idx[rank - 1] = col;
        idx
    };

    let mut data = Vec::with_capacity(out_shape.iter().product());
    for batch in indices(&batch_shape) {
        for i in 0..m {
            for j in 0..n {
                let mut acc = 0f32;
                for p in 0..ka {
                    let (ar, ac) = if transpose_a { (p, i) } else { (i, p) };
                    let (br, bc) = if transpose_b { (j, p) } else { (p, j) };
                    acc += a.get(&operand_index(a.shape(), &batch, ar, ac))
                        * b.get(&operand_index(b.shape(), &batch, br, bc));
                }
                data.push(acc);
            }
        }
    }
    Ok(Tensor::from_data(&out_shape, data))
}

fn eval_conv2d(
    x: &Value,
    w: &Value,
    stride: [usize; 2],
    padding: [usize; 4],
    dilation: [usize; 2],
    fused_clamp: Option<(f32, f32)>,
) -> Result<Value, EvalError> {
    let (x, w) = (
        x.as_f32().ok_or_else(|| op_err("Conv2D", "input must be f32"))?,
        w.as_f32().ok_or_else(|| op_err("Conv2D", "weights must be f32"))?,
    );
    let [n, c, h, width] = <[usize; 4]>::try_from(x.shape())
        .map_err(|_| op_err("Conv2D", "input must be [N, C, H, W]"))?;
    let [o, wc, kh, kw] = <[usize; 4]>::try_from(w.shape())
        .map_err(|_| op_err("Conv2D", "weights must be [O, C, kh, kw]"))?;
    if c != wc {
        return Err(op_err("Conv2D", "channel counts differ"));
    }
    let [top, left, _bottom, _right] = padding;
    let span_h = dilation[0] * (kh - 1) + 1;
    let span_w = dilation[1] * (kw - 1) + 1;
    let out_h = (h + padding[0] + padding[2] - span_h) / stride[0] + 1;
    let out_w = (width + padding[1] + padding[3] - span_w) / stride[1] + 1;

    let mut data = Vec::with_capacity(n * o * out_h * out_w);
    for img in 0..n {
        for oc in 0..o {
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut acc = 0f32;
                    for ic in 0..c {
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let iy = (oy * stride[0] + ky * dilation[0]) as isize
                                    - top as isize;
                                let ix = (ox * stride[1] + kx * dilation[1]) as isize
                                    - left as isize;
                                if iy < 0 || ix < 0 || iy >= h as isize || ix >= width as isize
                                {
                                    continue;
                                }
                                acc += x.get(&[img, ic, iy as usize, ix as usize])
                                    * w.get(&[oc, ic, ky, kx]);
                            }
                        }
                    }
                    if let Some((lo, hi)) = fused_clamp {
                        acc = acc.clamp(lo, hi);
                    }
                    data.push(acc);
                }
            }
        }
    }
    Ok(Value::Float(Tensor::from_data(
        &[n, o, out_h, out_w],
        data,
    )))
}

fn eval_im2col(
    x: &Value,
    kernel: [usize; 2],
    stride: [usize; 2],
    padding: [usize; 4],
    dilation: [usize; 2],
) -> Result<Value, EvalError> {
    let x = x.as_f32().ok_or_else(|| op_err("Im2col", "input must be f32"))?;
    let [n, c, h, width] = <[usize; 4]>::try_from(x.shape())
        .map_err(|_| op_err("Im2col", "input must be [N, C, H, W]"))?;
    if n != 1 {
        return Err(op_err("Im2col", "batch must be 1"));
    }
    let [kh, kw] = kernel;
    let span_h = dilation[0] * (kh - 1) + 1;
    let span_w = dilation[1] * (kw - 1) + 1;
    let out_h = (h + padding[0] + padding[2] - span_h) / stride[0] + 1;
    let out_w = (width + padding[1] + padding[3] - span_w) / stride[1] + 1;

    // Rows are (kh, kw, c) with the channel fastest-varying, columns are
    // output positions.
    let mut data = Vec::with_capacity(kh * kw * c * out_h * out_w);
    for ky in 0..kh {
        for kx in 0..kw {
            for ic in 0..c {
                for oy in 0..out_h {
                    for ox in 0..out_w {
                        let iy =
                            (oy * stride[0] + ky * dilation[0]) as isize - padding[0] as isize;
                        let ix =
                            (ox * stride[1] + kx * dilation[1]) as isize - padding[1] as isize;
                        let value = if iy < 0
                            || ix < 0
                            || iy >= h as isize
                            || ix >= width as isize
                        {
                            0.
                        } else {
                            x.get(&[0, ic, iy as usize, ix as usize])
                        };
                        data.push(value);
                    }
                }
            }
        }
    }
    Ok(Value::Float(Tensor::from_data(
        &[kh * kw * c, out_h * out_w],
        data,
    )))
}

/// Find, for each packed input axis of a reshape, the output axis its
/// lanes land on.
///
/// `super_target` is the reshape parameter in packed units. An assignment
/// of distinct output axes is valid when scaling those axes back up by the
/// lanes yields a logical target through which every packed axis maps
/// one-to-one, unsqueeze-like, or as the fastest factor of a merge.
/// Returns `None` when no assignment works.
fn packed_reshape_axes(
    logical_in: &[usize],
    super_target: &[usize],
    pack: &PackAxes,
) -> Option<Vec<usize>> {
    fn assignment_valid(
        logical_in: &[usize],
        super_target: &[usize],
        pack: &PackAxes,
        chosen: &[usize],
    ) -> bool {
        let mut logical_target: Vec<usize> = super_target.to_vec();
        for (&lane, &out_axis) in pack.lanes().iter().zip(chosen) {
            logical_target[out_axis] *= lane;
        }
        pack.axes().iter().zip(chosen).all(|(&axis, &out)| {
            matches!(
                reshape_axis_map(logical_in, &logical_target, axis),
                ReshapeAxisMap::One2One(n)
                    | ReshapeAxisMap::UnsqueezeLike(n)
                    | ReshapeAxisMap::MergeFastest(n) if n == out
            )
        })
    }

    fn search(
        logical_in: &[usize],
        super_target: &[usize],
        pack: &PackAxes,
        chosen: &mut Vec<usize>,
    ) -> bool {
        if chosen.len() == pack.axes().len() {
            return assignment_valid(logical_in, super_target, pack, chosen);
        }
        for out in 0..super_target.len() {
            if chosen.contains(&out) {
                continue;
            }
            chosen.push(out);
            if search(logical_in, super_target, pack, chosen) {
                return true;
            }
            chosen.pop();
        }
        false
    }

    let mut chosen = Vec::new();
    search(logical_in, super_target, pack, &mut chosen).then_some(chosen)
}

fn transpose_tensor<T: Copy>(t: &Tensor<T>, perm: &[usize]) -> Tensor<T> {
    let out_shape: Vec<usize> = perm.iter().map(|&src| t.shape()[src]).collect();
    let data: Vec<T> = indices(&out_shape)
        .map(|idx| {
            let src: Vec<usize> = (0..perm.len())
                .map(|src_axis| idx[transpose_axis(perm, src_axis)])
                .collect();
            t.get(&src)
        })
        .collect();
    Tensor::from_data(&out_shape, data)
}

fn slice_tensor<T: Copy>(t: &Tensor<T>, starts: &[usize], ends: &[usize]) -> Tensor<T> {
    let out_shape: Vec<usize> = starts.iter().zip(ends).map(|(&s, &e)| e - s).collect();
    let data: Vec<T> = indices(&out_shape)
        .map(|idx| {
            let src: Vec<usize> = idx.iter().zip(starts).map(|(&i, &s)| i + s).collect();
            t.get(&src)
        })
        .collect();
    Tensor::from_data(&out_shape, data)
}

fn expand_tensor<T: Copy>(t: &Tensor<T>, target: &[usize]) -> Tensor<T> {
    let data: Vec<T> = indices(target).map(|idx| t.broadcast_get(&idx)).collect();
    Tensor::from_data(target, data)
}

fn concat_tensors<T: Copy>(items: &[&Tensor<T>], axis: usize) -> Result<Tensor<T>, EvalError> {
    let mut out_shape = items[0].shape().to_vec();
    out_shape[axis] = items.iter().map(|t| t.shape()[axis]).sum();
    for t in items {
        if t.ndim() != out_shape.len()
            || t.shape()
                .iter()
                .enumerate()
                .any(|(i, &d)| i != axis && d != out_shape[i])
        {
            return Err(op_err("Concat", "piece shapes differ off the concat axis"));
        }
    }
    let data: Vec<T> = indices(&out_shape)
        .map(|idx| {
            let mut offset = idx[axis];
            for t in items {
                if offset < t.shape()[axis] {
                    let mut src = idx.clone();
                    src[axis] = offset;
                    return t.get(&src);
                }
                offset -= t.shape()[axis];
            }
            unreachable!("concat index out of range")
        })
        .collect();
    Ok(Tensor::from_data(&out_shape, data))
}

fn gather_tensor<T: Copy>(t: &Tensor<T>, idx: &Tensor<i32>, axis: usize) -> Tensor<T> {
    let mut out_shape: Vec<usize> = t.shape()[..axis].to_vec();
    out_shape.extend_from_slice(idx.shape());
    out_shape.extend_from_slice(&t.shape()[axis + 1..]);
    let idx_rank = idx.ndim();
    let data: Vec<T> = indices(&out_shape)
        .map(|out_idx| {
            let picked = idx.get(&out_idx[axis..axis + idx_rank]) as usize;
            let mut src: Vec<usize> = out_idx[..axis].to_vec();
            src.push(picked);
            src.extend_from_slice(&out_idx[axis + idx_rank..]);
            t.get(&src)
        })
        .collect();
    Tensor::from_data(&out_shape, data)
}

fn scatter_nd_tensor<T: Copy>(
    data: &Tensor<T>,
    idx: &Tensor<i32>,
    updates: &Tensor<T>,
) -> Result<Tensor<T>, EvalError> {
    let [rows, k] = <[usize; 2]>::try_from(idx.shape())
        .map_err(|_| op_err("ScatterNd", "indices must be [m, k]"))?;
    let mut out = data.clone();
    let slice_shape = &data.shape()[k..];
    for row in 0..rows {
        let base: Vec<usize> = (0..k).map(|i| idx.get(&[row, i]) as usize).collect();
        for tail in indices(slice_shape) {
            let mut dst = base.clone();
            dst.extend_from_slice(&tail);
            let mut src = vec![row];
            src.extend_from_slice(&tail);
            out.set(&dst, updates.get(&src));
        }
    }
    Ok(out)
}

fn eval_cast(to: DataType, x: &Value) -> Result<Value, EvalError> {
    match (x, to) {
        (Value::Float(t), DataType::Float) => Ok(Value::Float(t.clone())),
        (Value::Float(t), DataType::Int32) => Ok(Value::Int32(t.map(|v| v as i32))),
        (Value::Int32(t), DataType::Int32) => Ok(Value::Int32(t.clone())),
        (Value::Int32(t), DataType::Float) => Ok(Value::Float(t.map(|v| v as f32))),
        (Value::Mask(t), DataType::Float) => Ok(Value::Float(t.map(|v| v as f32))),
        (Value::Mask(t), DataType::Int32) => Ok(Value::Int32(t.map(|v| v as i32))),
        (Value::Mask(t), DataType::UInt8) => Ok(Value::Mask(t.clone())),
        _ => Err(op_err("Cast", "unsupported conversion")),
    }
}

fn eval_softmax(x: &Value, axis: usize) -> Result<Value, EvalError> {
    let t = x.as_f32().ok_or_else(|| op_err("Softmax", "input must be f32"))?;
    let mut out = t.clone();
    let mut outer_shape = t.shape().to_vec();
    let extent = outer_shape[axis];
    outer_shape[axis] = 1;
    for base in indices(&outer_shape) {
        let mut idx = base.clone();
        let mut max = f32::NEG_INFINITY;
        for i in 0..extent {
            idx[axis] = i;
            max = max.max(t.get(&idx));
        }
        // An all-fill row stays zero rather than turning into NaN.
        if max == f32::NEG_INFINITY {
            for i in 0..extent {
                idx[axis] = i;
                out.set(&idx, 0.);
            }
            continue;
        }
        let mut sum = 0f32;
        for i in 0..extent {
            idx[axis] = i;
            let e = (t.get(&idx) - max).exp();
            out.set(&idx, e);
            sum += e;
        }
        for i in 0..extent {
            idx[axis] = i;
            let e = out.get(&idx);
            out.set(&idx, e / sum);
        }
    }
    Ok(Value::Float(out))
}

/// True if a suffix/spatial index points at lane fill.
fn in_pad_tail(idx: &[usize], shape: &[usize], pad_tail: &PadVec) -> bool {
    pad_tail
        .iter()
        .any(|&(axis, count)| idx[axis] >= shape[axis] - count)
}

fn eval_layer_norm(
    x: &Value,
    scale: &Value,
    bias: &Value,
    axis: usize,
    epsilon: f32,
    pad_tail: &PadVec,
) -> Result<Value, EvalError> {
    let t = x.as_f32().ok_or_else(|| op_err("LayerNorm", "input must be f32"))?;
    let (scale, bias) = (
        scale
            .as_f32()
            .ok_or_else(|| op_err("LayerNorm", "scale must be f32"))?,
        bias.as_f32()
            .ok_or_else(|| op_err("LayerNorm", "bias must be f32"))?,
    );
    let shape = t.shape().to_vec();
    let (prefix, suffix) = shape.split_at(axis);
    let real_count: usize = suffix
        .iter()
        .enumerate()
        .map(|(i, &d)| {
            d - pad_tail
                .iter()
                .find_map(|&(a, count)| (a == axis + i).then_some(count))
                .unwrap_or(0)
        })
        .product();
    let tail_pads = shift_tail(pad_tail, axis);
    let mut out = t.clone();
    for base in indices(prefix) {
        let mut sum = 0f64;
        let mut sum_sq = 0f64;
        for tail in indices(suffix) {
            if in_pad_tail(&tail, suffix, &tail_pads) {
                continue;
            }
            let mut idx = base.clone();
            idx.extend_from_slice(&tail);
            let v = t.get(&idx) as f64;
            sum += v;
            sum_sq += v * v;
        }
        let mean = sum / real_count as f64;
        let variance = sum_sq / real_count as f64 - mean * mean;
        let inv_std = 1. / (variance + epsilon as f64).sqrt();
        for tail in indices(suffix) {
            let mut idx = base.clone();
            idx.extend_from_slice(&tail);
            if in_pad_tail(&tail, suffix, &tail_pads) {
                out.set(&idx, 0.);
                continue;
            }
            let v = t.get(&idx) as f64;
            let normed = ((v - mean) * inv_std) as f32;
            out.set(&idx, normed * scale.get(&tail) + bias.get(&tail));
        }
    }
    Ok(Value::Float(out))
}

/// Rebase pad-tail axes from tensor coordinates to suffix coordinates.
fn shift_tail(pad_tail: &PadVec, axis: usize) -> PadVec {
    pad_tail
        .iter()
        .map(|&(a, count)| (a - axis, count))
        .collect()
}

fn eval_instance_norm(
    x: &Value,
    scale: &Value,
    bias: &Value,
    epsilon: f32,
    pad_tail: &PadVec,
) -> Result<Value, EvalError> {
    let t = x
        .as_f32()
        .ok_or_else(|| op_err("InstanceNorm", "input must be f32"))?;
    let (scale, bias) = (
        scale
            .as_f32()
            .ok_or_else(|| op_err("InstanceNorm", "scale must be f32"))?,
        bias.as_f32()
            .ok_or_else(|| op_err("InstanceNorm", "bias must be f32"))?,
    );
    let shape = t.shape().to_vec();
    if shape.len() < 3 {
        return Err(op_err("InstanceNorm", "input must have rank >= 3"));
    }
    let spatial = &shape[2..];
    let real_count: usize = spatial
        .iter()
        .enumerate()
        .map(|(i, &d)| {
            d - pad_tail
                .iter()
                .find_map(|&(a, count)| (a == 2 + i).then_some(count))
                .unwrap_or(0)
        })
        .product();
    let tail = shift_tail(pad_tail, 2);
    let mut out = t.clone();
    for img in 0..shape[0] {
        for channel in 0..shape[1] {
            let mut sum = 0f64;
            let mut sum_sq = 0f64;
            for pos in indices(spatial) {
                if in_pad_tail(&pos, spatial, &tail) {
                    continue;
                }
                let mut idx = vec![img, channel];
                idx.extend_from_slice(&pos);
                let v = t.get(&idx) as f64;
                sum += v;
                sum_sq += v * v;
            }
            let mean = sum / real_count as f64;
            let variance = sum_sq / real_count as f64 - mean * mean;
            let inv_std = 1. / (variance + epsilon as f64).sqrt();
            for pos in indices(spatial) {
                let mut idx = vec![img, channel];
                idx.extend_from_slice(&pos);
                if in_pad_tail(&pos, spatial, &tail) {
                    out.set(&idx, 0.);
                    continue;
                }
                let v = t.get(&idx) as f64;
                let normed = ((v - mean) * inv_std) as f32;
                out.set(&idx, normed * scale.get(&[channel]) + bias.get(&[channel]));
            }
        }
    }
    Ok(Value::Float(out))
}

fn eval_resize(
    x: &Value,
    scale_h: usize,
    scale_w: usize,
    mode: ResizeMode,
) -> Result<Value, EvalError> {
    let t = x
        .as_f32()
        .ok_or_else(|| op_err("ResizeImage", "input must be f32"))?;
    let [n, c, h, w] = <[usize; 4]>::try_from(t.shape())
        .map_err(|_| op_err("ResizeImage", "input must be [N, C, H, W]"))?;
    let (out_h, out_w) = (h * scale_h, w * scale_w);
    let sample = |img: usize, channel: usize, oy: usize, ox: usize| -> f32 {
        match mode {
            ResizeMode::Nearest => t.get(&[img, channel, oy / scale_h, ox / scale_w]),
            ResizeMode::Bilinear => {
                // Half-pixel source coordinates.
                let sy = ((oy as f32 + 0.5) / scale_h as f32 - 0.5).clamp(0., (h - 1) as f32);
                let sx = ((ox as f32 + 0.5) / scale_w as f32 - 0.5).clamp(0., (w - 1) as f32);
                let (y0, x0) = (sy.floor() as usize, sx.floor() as usize);
                let (y1, x1) = ((y0 + 1).min(h - 1), (x0 + 1).min(w - 1));
                let (fy, fx) = (sy - y0 as f32, sx - x0 as f32);
                let top = t.get(&[img, channel, y0, x0]) * (1. - fx)
                    + t.get(&[img, channel, y0, x1]) * fx;
                let bottom = t.get(&[img, channel, y1, x0]) * (1. - fx)
                    + t.get(&[img, channel, y1, x1]) * fx;
                top * (1. - fy) + bottom * fy
            }
        }
    };
    let mut data = Vec::with_capacity(n * c * out_h * out_w);
    for img in 0..n {
        for channel in 0..c {
            for oy in 0..out_h {
                for ox in 0..out_w {
                    data.push(sample(img, channel, oy, ox));
                }
            }
        }
    }
    Ok(Value::Float(Tensor::from_data(&[n, c, out_h, out_w], data)))
}

fn eval_pad(x: &Value, pads: &[(usize, usize)], fill: PadFill) -> Result<Value, EvalError> {
    fn go<T: Copy>(t: &Tensor<T>, pads: &[(usize, usize)], fill: T) -> Tensor<T> {
        let out_shape: Vec<usize> = t
            .shape()
            .iter()
            .zip(pads)
            .map(|(&d, &(before, after))| before + d + after)
            .collect();
        let mut out = Tensor::full(&out_shape, fill);
        for idx in indices(t.shape()) {
            let dst: Vec<usize> =
                idx.iter().zip(pads).map(|(&i, &(before, _))| i + before).collect();
            out.set(&dst, t.get(&idx));
        }
        out
    }
    match x {
        Value::Float(t) => Ok(Value::Float(go(t, pads, fill.as_f32()))),
        Value::Int32(t) => Ok(Value::Int32(go(t, pads, fill.as_i32()))),
        Value::Mask(t) => match fill {
            PadFill::Zero => Ok(Value::Mask(go(t, pads, 0))),
            _ => Err(op_err("Pad", "non-zero fill for a mask")),
        },
    }
}
