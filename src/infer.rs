//! Per-operator shape and type inference.
//!
//! Inference is invoked implicitly through [`Expr::checked_type`] and is
//! exhaustive over [`Op`]. A shape or type contradiction produces
//! [`CheckedType::Invalid`] rather than an error: rewrite rules build
//! speculative expressions and discard the invalid ones.
//!
//! Lane-packed tensors are modeled in the "super-element" view: packing an
//! axis divides its extent by the lane width (rounding up) and unpacking
//! multiplies it back. The lane dimension itself is implicit in the
//! element type, as the code generator sees it.

use crate::expr::{CheckedType, Dimension, Expr, ExprKind, TensorType};
use crate::ops::{Op, PackAxes};
use crate::value::DataType;

/// Compute the checked type of an expression, assuming the checked types of
/// its children are available (they are computed on demand).
pub fn infer(expr: &Expr) -> CheckedType {
    match expr.kind() {
        ExprKind::Var { ty, .. } => CheckedType::Tensor(ty.clone()),
        ExprKind::Constant(value) => {
            CheckedType::Tensor(TensorType::fixed(value.dtype(), value.shape()))
        }
        ExprKind::Tuple(items) => {
            CheckedType::Tuple(items.iter().map(|item| item.checked_type().clone()).collect())
        }
        ExprKind::Call { op, args } => infer_call(op, args),
    }
}

macro_rules! try_tensor {
    ($args:expr, $index:expr, $op:expr) => {
        match $args.get($index).map(|arg| arg.checked_type()) {
            Some(CheckedType::Tensor(ty)) => ty.clone(),
            Some(CheckedType::Invalid(reason)) => {
                return CheckedType::Invalid(reason.clone())
            }
            Some(CheckedType::Tuple(_)) => {
                return CheckedType::invalid(format!(
                    "{}: input {} is a tuple, expected a tensor",
                    $op, $index
                ))
            }
            None => {
                return CheckedType::invalid(format!("{}: missing input {}", $op, $index))
            }
        }
    };
}

fn infer_call(op: &Op, args: &[Expr]) -> CheckedType {
    let name = op.name();
    match op {
        Op::Unary(_) => {
            let x = try_tensor!(args, 0, name);
            CheckedType::Tensor(x)
        }
        Op::Binary(_) => {
            let a = try_tensor!(args, 0, name);
            let b = try_tensor!(args, 1, name);
            if a.dtype != b.dtype {
                return CheckedType::invalid(format!(
                    "{}: operand dtypes differ ({} vs {})",
                    name, a.dtype, b.dtype
                ));
            }
            match broadcast_dims(&a.shape, &b.shape) {
                Some(shape) => CheckedType::Tensor(TensorType { dtype: a.dtype, shape }),
                None => CheckedType::invalid(format!("{}: shapes do not broadcast", name)),
            }
        }
        Op::Compare(_) => {
            let a = try_tensor!(args, 0, name);
            let b = try_tensor!(args, 1, name);
            if a.dtype != b.dtype {
                return CheckedType::invalid(format!("{}: operand dtypes differ", name));
            }
            match broadcast_dims(&a.shape, &b.shape) {
                Some(shape) => CheckedType::Tensor(TensorType {
                    dtype: DataType::UInt8,
                    shape,
                }),
                None => CheckedType::invalid(format!("{}: shapes do not broadcast", name)),
            }
        }
        Op::Where => {
            let mask = try_tensor!(args, 0, name);
            let a = try_tensor!(args, 1, name);
            let b = try_tensor!(args, 2, name);
            if mask.dtype != DataType::UInt8 {
                return CheckedType::invalid("Where: mask must be u8");
            }
            if a.dtype != b.dtype {
                return CheckedType::invalid("Where: branch dtypes differ");
            }
            let branches = match broadcast_dims(&a.shape, &b.shape) {
                Some(shape) => shape,
                None => return CheckedType::invalid("Where: branch shapes do not broadcast"),
            };
            match broadcast_dims(&branches, &mask.shape) {
                Some(shape) => CheckedType::Tensor(TensorType { dtype: a.dtype, shape }),
                None => CheckedType::invalid("Where: mask shape does not broadcast"),
            }
        }
        Op::Reduce { axes, keep_dims, .. } => {
            let x = try_tensor!(args, 0, name);
            for &axis in axes {
                if axis >= x.rank() {
                    return CheckedType::invalid(format!(
                        "Reduce: axis {} out of range for rank {}",
                        axis,
                        x.rank()
                    ));
                }
            }
            let shape = x
                .shape
                .iter()
                .enumerate()
                .filter_map(|(i, &dim)| {
                    if axes.contains(&i) {
                        keep_dims.then_some(Dimension::Fixed(1))
                    } else {
                        Some(dim)
                    }
                })
                .collect();
            CheckedType::Tensor(TensorType { dtype: x.dtype, shape })
        }
        Op::MatMul {
            transpose_a,
            transpose_b,
            ..
        } => {
            let a = try_tensor!(args, 0, name);
            let b = try_tensor!(args, 1, name);
            if a.dtype != b.dtype {
                return CheckedType::invalid("MatMul: operand dtypes differ");
            }
            if a.rank() < 2 || b.rank() < 2 {
                return CheckedType::invalid("MatMul: operands must have rank >= 2");
            }
            let (ar, br) = (a.rank(), b.rank());
            let (m, k_a) = if *transpose_a {
                (a.shape[ar - 1], a.shape[ar - 2])
            } else {
                (a.shape[ar - 2], a.shape[ar - 1])
            };
            let (k_b, n) = if *transpose_b {
                (b.shape[br - 1], b.shape[br - 2])
            } else {
                (b.shape[br - 2], b.shape[br - 1])
            };
            if let (Some(ka), Some(kb)) = (k_a.size(), k_b.size()) {
                if ka != kb {
                    return CheckedType::invalid(format!(
                        "MatMul: contraction dims differ ({} vs {})",
                        ka, kb
                    ));
                }
            }
            let batch = match broadcast_dims(&a.shape[..ar - 2], &b.shape[..br - 2]) {
                Some(batch) => batch,
                None => return CheckedType::invalid("MatMul: batch dims do not broadcast"),
            };
            let mut shape = batch;
            shape.push(m);
            shape.push(n);
            CheckedType::Tensor(TensorType { dtype: a.dtype, shape })
        }
        Op::Conv2D {
            stride,
            padding,
            dilation,
            ..
        } => {
            let x = try_tensor!(args, 0, name);
            let w = try_tensor!(args, 1, name);
            if x.rank() != 4 || w.rank() != 4 {
                return CheckedType::invalid("Conv2D: inputs must have rank 4");
            }
            if let (Some(c_in), Some(c_w)) = (x.shape[1].size(), w.shape[1].size()) {
                if c_in != c_w {
                    return CheckedType::invalid("Conv2D: channel counts differ");
                }
            }
            let spatial = |dim: Dimension, kernel: Dimension, pads: usize, stride, dil| {
                match (dim.size(), kernel.size()) {
                    (Some(d), Some(k)) => {
                        let span = dil * (k - 1) + 1;
                        if d + pads < span {
                            None
                        } else {
                            Some(Dimension::Fixed((d + pads - span) / stride + 1))
                        }
                    }
                    _ => Some(Dimension::Unknown),
                }
            };
            let oh = spatial(
                x.shape[2],
                w.shape[2],
                padding[0] + padding[2],
                stride[0],
                dilation[0],
            );
            let ow = spatial(
                x.shape[3],
                w.shape[3],
                padding[1] + padding[3],
                stride[1],
                dilation[1],
            );
            match (oh, ow) {
                (Some(oh), Some(ow)) => CheckedType::Tensor(TensorType {
                    dtype: x.dtype,
                    shape: vec![x.shape[0], w.shape[0], oh, ow],
                }),
                _ => CheckedType::invalid("Conv2D: kernel larger than padded input"),
            }
        }
        Op::Im2col {
            kernel,
            stride,
            padding,
            dilation,
        } => {
            let x = try_tensor!(args, 0, name);
            if x.rank() != 4 {
                return CheckedType::invalid("Im2col: input must have rank 4");
            }
            if x.shape[0].size() != Some(1) {
                return CheckedType::invalid("Im2col: batch size must be 1");
            }
            let out_extent = |dim: Dimension, k: usize, pads: usize, stride, dil| {
                dim.size().map(|d| {
                    let span = dil * (k - 1) + 1;
                    (d + pads - span) / stride + 1
                })
            };
            let oh = out_extent(
                x.shape[2],
                kernel[0],
                padding[0] + padding[2],
                stride[0],
                dilation[0],
            );
            let ow = out_extent(
                x.shape[3],
                kernel[1],
                padding[1] + padding[3],
                stride[1],
                dilation[1],
            );
            let rows = x
                .shape[1]
                .size()
                .map(|c| Dimension::Fixed(kernel[0] * kernel[1] * c))
                .unwrap_or(Dimension::Unknown);
            let cols = match (oh, ow) {
                (Some(oh), Some(ow)) => Dimension::Fixed(oh * ow),
                _ => Dimension::Unknown,
            };
            CheckedType::Tensor(TensorType {
                dtype: x.dtype,
                shape: vec![rows, cols],
            })
        }
        Op::Transpose { perm } => {
            let x = try_tensor!(args, 0, name);
            if perm.len() != x.rank() || !is_permutation(perm) {
                return CheckedType::invalid(format!(
                    "Transpose: {:?} is not a permutation of rank {}",
                    perm,
                    x.rank()
                ));
            }
            let shape = perm.iter().map(|&i| x.shape[i]).collect();
            CheckedType::Tensor(TensorType { dtype: x.dtype, shape })
        }
        Op::Reshape { shape } => {
            let x = try_tensor!(args, 0, name);
            let Some(in_shape) = x.fixed_shape() else {
                return CheckedType::invalid("Reshape: input shape must be fixed");
            };
            let in_len: usize = in_shape.iter().product();
            let out_len: usize = shape.iter().product();
            if in_len != out_len {
                return CheckedType::invalid(format!(
                    "Reshape: cannot reshape {} elements into {:?}",
                    in_len, shape
                ));
            }
            CheckedType::Tensor(TensorType {
                dtype: x.dtype,
                shape: shape.iter().map(|&d| Dimension::Fixed(d)).collect(),
            })
        }
        Op::Slice { starts, ends } => {
            let x = try_tensor!(args, 0, name);
            if starts.len() != x.rank() || ends.len() != x.rank() {
                return CheckedType::invalid("Slice: bounds rank mismatch");
            }
            let mut shape = Vec::with_capacity(x.rank());
            for i in 0..x.rank() {
                if starts[i] > ends[i] {
                    return CheckedType::invalid("Slice: start exceeds end");
                }
                if let Some(dim) = x.shape[i].size() {
                    if ends[i] > dim {
                        return CheckedType::invalid(format!(
                            "Slice: end {} exceeds dim {} on axis {}",
                            ends[i], dim, i
                        ));
                    }
                }
                shape.push(Dimension::Fixed(ends[i] - starts[i]));
            }
            CheckedType::Tensor(TensorType { dtype: x.dtype, shape })
        }
        Op::Concat { axis } => {
            let items = match args.first().map(|arg| arg.kind()) {
                Some(ExprKind::Tuple(items)) if !items.is_empty() => items,
                _ => return CheckedType::invalid("Concat: expected a non-empty tuple input"),
            };
            let first = match items[0].checked_type().as_tensor() {
                Some(ty) => ty.clone(),
                None => return CheckedType::invalid("Concat: tuple item is not a tensor"),
            };
            if *axis >= first.rank() {
                return CheckedType::invalid("Concat: axis out of range");
            }
            let mut total = first.shape[*axis];
            for item in &items[1..] {
                let ty = match item.checked_type().as_tensor() {
                    Some(ty) => ty,
                    None => return CheckedType::invalid("Concat: tuple item is not a tensor"),
                };
                if ty.dtype != first.dtype || ty.rank() != first.rank() {
                    return CheckedType::invalid("Concat: item types differ");
                }
                for i in 0..first.rank() {
                    if i == *axis {
                        continue;
                    }
                    if let (Some(a), Some(b)) = (first.shape[i].size(), ty.shape[i].size()) {
                        if a != b {
                            return CheckedType::invalid(format!(
                                "Concat: dims differ on non-concat axis {}",
                                i
                            ));
                        }
                    }
                }
                total = match (total.size(), ty.shape[*axis].size()) {
                    (Some(a), Some(b)) => Dimension::Fixed(a + b),
                    _ => Dimension::Unknown,
                };
            }
            let mut shape = first.shape.clone();
            shape[*axis] = total;
            CheckedType::Tensor(TensorType {
                dtype: first.dtype,
                shape,
            })
        }
        Op::Gather { axis } => {
            let data = try_tensor!(args, 0, name);
            let idx = try_tensor!(args, 1, name);
            if idx.dtype != DataType::Int32 {
                return CheckedType::invalid("Gather: indices must be i32");
            }
            if *axis >= data.rank() {
                return CheckedType::invalid("Gather: axis out of range");
            }
            let mut shape = Vec::with_capacity(data.rank() - 1 + idx.rank());
            shape.extend_from_slice(&data.shape[..*axis]);
            shape.extend_from_slice(&idx.shape);
            shape.extend_from_slice(&data.shape[*axis + 1..]);
            CheckedType::Tensor(TensorType {
                dtype: data.dtype,
                shape,
            })
        }
        Op::ScatterNd => {
            let data = try_tensor!(args, 0, name);
            let idx = try_tensor!(args, 1, name);
            let updates = try_tensor!(args, 2, name);
            if idx.dtype != DataType::Int32 {
                return CheckedType::invalid("ScatterNd: indices must be i32");
            }
            if idx.rank() != 2 {
                return CheckedType::invalid("ScatterNd: indices must have shape [m, k]");
            }
            if updates.dtype != data.dtype {
                return CheckedType::invalid("ScatterNd: update dtype differs from data");
            }
            if let Some(k) = idx.shape[1].size() {
                if k > data.rank() {
                    return CheckedType::invalid("ScatterNd: index tuple longer than data rank");
                }
                let expected_rank = 1 + data.rank() - k;
                if updates.rank() != expected_rank {
                    return CheckedType::invalid("ScatterNd: update rank mismatch");
                }
                for (i, &dim) in data.shape[k..].iter().enumerate() {
                    if let (Some(a), Some(b)) = (dim.size(), updates.shape[1 + i].size()) {
                        if a != b {
                            return CheckedType::invalid("ScatterNd: update slice shape mismatch");
                        }
                    }
                }
            }
            CheckedType::Tensor(data)
        }
        Op::Cast { to, rescale } => {
            let x = try_tensor!(args, 0, name);
            let mut shape = x.shape.clone();
            if let Some(rescale) = rescale {
                for (i, &axis) in rescale.axes.iter().enumerate() {
                    if axis >= shape.len() {
                        return CheckedType::invalid("Cast: rescale axis out of range");
                    }
                    let (in_lane, out_lane) = (rescale.in_lanes[i], rescale.out_lanes[i]);
                    match shape[axis].size() {
                        Some(dim) if (dim * in_lane) % out_lane == 0 => {
                            shape[axis] = Dimension::Fixed(dim * in_lane / out_lane);
                        }
                        _ => {
                            return CheckedType::invalid(
                                "Cast: packed extent does not regroup to the output lane count",
                            )
                        }
                    }
                }
            }
            CheckedType::Tensor(TensorType { dtype: *to, shape })
        }
        Op::Expand { shape } => {
            let x = try_tensor!(args, 0, name);
            if shape.len() < x.rank() {
                return CheckedType::invalid("Expand: target rank below input rank");
            }
            let offset = shape.len() - x.rank();
            for (i, &target) in shape.iter().enumerate().skip(offset) {
                if let Some(dim) = x.shape[i - offset].size() {
                    if dim != 1 && dim != target {
                        return CheckedType::invalid(format!(
                            "Expand: dim {} incompatible with target {} on axis {}",
                            dim, target, i
                        ));
                    }
                }
            }
            CheckedType::Tensor(TensorType {
                dtype: x.dtype,
                shape: shape.iter().map(|&d| Dimension::Fixed(d)).collect(),
            })
        }
        Op::Unsqueeze { axes } => {
            let x = try_tensor!(args, 0, name);
            let out_rank = x.rank() + axes.len();
            if axes.iter().any(|&a| a >= out_rank) {
                return CheckedType::invalid("Unsqueeze: axis out of range");
            }
            let mut shape = Vec::with_capacity(out_rank);
            let mut src = x.shape.iter();
            for i in 0..out_rank {
                if axes.contains(&i) {
                    shape.push(Dimension::Fixed(1));
                } else {
                    match src.next() {
                        Some(&dim) => shape.push(dim),
                        None => return CheckedType::invalid("Unsqueeze: duplicate axes"),
                    }
                }
            }
            CheckedType::Tensor(TensorType { dtype: x.dtype, shape })
        }
        Op::Softmax { axis } => {
            let x = try_tensor!(args, 0, name);
            if *axis >= x.rank() {
                return CheckedType::invalid("Softmax: axis out of range");
            }
            if x.dtype != DataType::Float {
                return CheckedType::invalid("Softmax: input must be f32");
            }
            CheckedType::Tensor(x)
        }
        Op::LayerNorm { axis, .. } => {
            let x = try_tensor!(args, 0, name);
            let scale = try_tensor!(args, 1, name);
            let bias = try_tensor!(args, 2, name);
            if *axis >= x.rank() {
                return CheckedType::invalid("LayerNorm: axis out of range");
            }
            let suffix = &x.shape[*axis..];
            for (which, ty) in [("scale", &scale), ("bias", &bias)] {
                if ty.shape.len() != suffix.len() {
                    return CheckedType::invalid(format!(
                        "LayerNorm: {} rank does not match normalized suffix",
                        which
                    ));
                }
                for (a, b) in ty.shape.iter().zip(suffix) {
                    if let (Some(a), Some(b)) = (a.size(), b.size()) {
                        if a != b {
                            return CheckedType::invalid(format!(
                                "LayerNorm: {} shape does not match normalized suffix",
                                which
                            ));
                        }
                    }
                }
            }
            CheckedType::Tensor(x)
        }
        Op::InstanceNorm { .. } => {
            let x = try_tensor!(args, 0, name);
            let scale = try_tensor!(args, 1, name);
            let bias = try_tensor!(args, 2, name);
            if x.rank() < 3 {
                return CheckedType::invalid("InstanceNorm: input must have rank >= 3");
            }
            for (which, ty) in [("scale", &scale), ("bias", &bias)] {
                if ty.rank() != 1 {
                    return CheckedType::invalid(format!(
                        "InstanceNorm: {} must have rank 1",
                        which
                    ));
                }
                if let (Some(a), Some(b)) = (ty.shape[0].size(), x.shape[1].size()) {
                    if a != b {
                        return CheckedType::invalid(format!(
                            "InstanceNorm: {} length does not match channel count",
                            which
                        ));
                    }
                }
            }
            CheckedType::Tensor(x)
        }
        Op::ResizeImage { scale_h, scale_w, .. } => {
            let x = try_tensor!(args, 0, name);
            if x.rank() != 4 {
                return CheckedType::invalid("ResizeImage: input must have rank 4");
            }
            if *scale_h == 0 || *scale_w == 0 {
                return CheckedType::invalid("ResizeImage: zero scale");
            }
            let scale = |dim: Dimension, s: usize| match dim.size() {
                Some(d) => Dimension::Fixed(d * s),
                None => Dimension::Unknown,
            };
            CheckedType::Tensor(TensorType {
                dtype: x.dtype,
                shape: vec![
                    x.shape[0],
                    x.shape[1],
                    scale(x.shape[2], *scale_h),
                    scale(x.shape[3], *scale_w),
                ],
            })
        }
        Op::Pad { pads, .. } => {
            let x = try_tensor!(args, 0, name);
            if pads.len() != x.rank() {
                return CheckedType::invalid("Pad: pads rank mismatch");
            }
            let shape = x
                .shape
                .iter()
                .zip(pads.iter())
                .map(|(&dim, &(before, after))| match dim.size() {
                    Some(d) => Dimension::Fixed(d + before + after),
                    None if before == 0 && after == 0 => Dimension::Unknown,
                    None => Dimension::Unknown,
                })
                .collect();
            CheckedType::Tensor(TensorType { dtype: x.dtype, shape })
        }
        Op::Pack(pack) => {
            let x = try_tensor!(args, 0, name);
            infer_pack(&x, pack)
        }
        Op::PackMask { pack, .. } => {
            let x = try_tensor!(args, 0, name);
            if x.dtype != DataType::UInt8 {
                return CheckedType::invalid("PackMask: input must be a u8 mask");
            }
            infer_pack(&x, pack)
        }
        Op::Unpack(pack) => {
            let x = try_tensor!(args, 0, name);
            let mut shape = x.shape.clone();
            for (&axis, &lane) in pack.axes().iter().zip(pack.lanes()) {
                if axis >= shape.len() {
                    return CheckedType::invalid(format!(
                        "Unpack: axis {} out of range for rank {}",
                        axis,
                        shape.len()
                    ));
                }
                shape[axis] = match shape[axis].size() {
                    Some(d) => Dimension::Fixed(d * lane),
                    None => Dimension::Unknown,
                };
            }
            CheckedType::Tensor(TensorType { dtype: x.dtype, shape })
        }
    }
}

fn infer_pack(x: &TensorType, pack: &PackAxes) -> CheckedType {
    let mut shape = x.shape.clone();
    for (&axis, &lane) in pack.axes().iter().zip(pack.lanes()) {
        if axis >= shape.len() {
            return CheckedType::invalid(format!(
                "Pack: axis {} out of range for rank {}",
                axis,
                shape.len()
            ));
        }
        if lane == 0 {
            return CheckedType::invalid("Pack: zero lane width");
        }
        shape[axis] = match shape[axis].size() {
            Some(d) => Dimension::Fixed(d.div_ceil(lane)),
            None => return CheckedType::invalid("Pack: packed axis size is unknown"),
        };
    }
    CheckedType::Tensor(TensorType {
        dtype: x.dtype,
        shape,
    })
}

/// Broadcast two dimension lists using right-aligned numpy rules.
pub fn broadcast_dims(a: &[Dimension], b: &[Dimension]) -> Option<Vec<Dimension>> {
    let rank = a.len().max(b.len());
    let mut out = Vec::with_capacity(rank);
    for i in 0..rank {
        let da = if i + a.len() >= rank {
            a[i + a.len() - rank]
        } else {
            Dimension::Fixed(1)
        };
        let db = if i + b.len() >= rank {
            b[i + b.len() - rank]
        } else {
            Dimension::Fixed(1)
        };
        let dim = match (da.size(), db.size()) {
            (Some(x), Some(y)) if x == y => Dimension::Fixed(x),
            (Some(1), Some(y)) => Dimension::Fixed(y),
            (Some(x), Some(1)) => Dimension::Fixed(x),
            (Some(_), Some(_)) => return None,
            // An unknown dim broadcasts optimistically; runtime shape
            // checks own the residual risk.
            _ => Dimension::Unknown,
        };
        out.push(dim);
    }
    Some(out)
}

fn is_permutation(perm: &[usize]) -> bool {
    let mut seen = vec![false; perm.len()];
    for &p in perm {
        if p >= perm.len() || seen[p] {
            return false;
        }
        seen[p] = true;
    }
    true
}

#[cfg(test)]
mod tests {
    use crate::expr::{CheckedType, Dimension, Expr, TensorType};
    use crate::ops::{Op, PackAxes, ReduceOp};
    use crate::value::DataType;

    fn var(name: &str, shape: &[usize]) -> Expr {
        Expr::var(name, TensorType::fixed(DataType::Float, shape))
    }

    fn shape_of(expr: &Expr) -> Vec<usize> {
        expr.fixed_shape().expect("expected fixed shape").to_vec()
    }

    #[test]
    fn test_infer_shapes() {
        struct Case {
            expr: Expr,
            expected: Vec<usize>,
        }

        let cases = [
            Case {
                expr: var("a", &[2, 3]) + var("b", &[1, 3]),
                expected: vec![2, 3],
            },
            Case {
                expr: Expr::call(
                    Op::Reduce {
                        op: ReduceOp::Sum,
                        axes: [1].into_iter().collect(),
                        keep_dims: false,
                    },
                    [var("x", &[4, 5, 6])],
                ),
                expected: vec![4, 6],
            },
            Case {
                expr: Expr::call(
                    Op::MatMul {
                        transpose_a: false,
                        transpose_b: false,
                        pack_k: false,
                    },
                    [var("a", &[2, 3, 4]), var("b", &[4, 5])],
                ),
                expected: vec![2, 3, 5],
            },
            Case {
                expr: Expr::call(
                    Op::Transpose {
                        perm: [2, 0, 1].into_iter().collect(),
                    },
                    [var("x", &[2, 3, 4])],
                ),
                expected: vec![4, 2, 3],
            },
            Case {
                expr: Expr::call(
                    Op::Pack(PackAxes::new([32usize], [0usize])),
                    [var("x", &[36, 64])],
                ),
                expected: vec![2, 64],
            },
            Case {
                expr: Expr::call(
                    Op::Unpack(PackAxes::new([32usize], [0usize])),
                    [Expr::call(
                        Op::Pack(PackAxes::new([32usize], [0usize])),
                        [var("x", &[64, 8])],
                    )],
                ),
                expected: vec![64, 8],
            },
            Case {
                expr: Expr::call(
                    Op::Gather { axis: 1 },
                    [
                        var("x", &[4, 10, 8]),
                        Expr::var("i", TensorType::fixed(DataType::Int32, &[2, 3])),
                    ],
                ),
                expected: vec![4, 2, 3, 8],
            },
        ];

        for (i, case) in cases.iter().enumerate() {
            assert_eq!(shape_of(&case.expr), case.expected, "case {}", i);
        }
    }

    #[test]
    fn test_infer_invalid() {
        let bad_add = var("a", &[2, 3]) + var("b", &[4]);
        assert!(bad_add.checked_type().is_invalid());

        let bad_matmul = Expr::call(
            Op::MatMul {
                transpose_a: false,
                transpose_b: false,
                pack_k: false,
            },
            [var("a", &[2, 3]), var("b", &[5, 4])],
        );
        assert!(bad_matmul.checked_type().is_invalid());

        // Invalidity propagates to consumers.
        let consumer = bad_add.unary(crate::ops::UnaryOp::Abs);
        assert!(consumer.checked_type().is_invalid());
    }

    #[test]
    fn test_infer_unknown_dims() {
        let x = Expr::var(
            "x",
            TensorType::new(
                DataType::Float,
                &[Dimension::Unknown, Dimension::Fixed(8)],
            ),
        );
        let packed = Expr::call(Op::Pack(PackAxes::new([4usize], [0usize])), [x]);
        // Packing an unknown extent cannot be checked.
        assert!(matches!(packed.checked_type(), CheckedType::Invalid(_)));
    }
}
