//! Immutable, reference-counted expression IR.
//!
//! An [`Expr`] is a cheap-to-clone handle to a shared node. Rewrites never
//! mutate a node; they build new trees which freely share subtrees with the
//! old ones. Each node carries a lazily-computed, single-assignment checked
//! type.

use std::cell::OnceCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Add, Div, Mul, Sub};
use std::rc::Rc;

use crate::infer;
use crate::ops::{BinaryOp, DimVec, Op, UnaryOp};
use crate::value::{DataType, Value};

/// Size of one dimension of a tensor type.
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum Dimension {
    /// A dimension with a static size.
    Fixed(usize),
    /// A dimension whose size is only known at runtime.
    Unknown,
}

impl Dimension {
    pub fn size(self) -> Option<usize> {
        match self {
            Dimension::Fixed(size) => Some(size),
            Dimension::Unknown => None,
        }
    }
}

impl From<usize> for Dimension {
    fn from(size: usize) -> Dimension {
        Dimension::Fixed(size)
    }
}

impl fmt::Debug for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Fixed(size) => write!(f, "{}", size),
            Dimension::Unknown => write!(f, "?"),
        }
    }
}

/// Static element type and shape of a tensor-valued expression.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorType {
    pub dtype: DataType,
    pub shape: Vec<Dimension>,
}

impl TensorType {
    pub fn new(dtype: DataType, shape: &[Dimension]) -> TensorType {
        TensorType {
            dtype,
            shape: shape.to_vec(),
        }
    }

    /// Convenience constructor for a fully-fixed shape.
    pub fn fixed(dtype: DataType, shape: &[usize]) -> TensorType {
        TensorType {
            dtype,
            shape: shape.iter().copied().map(Dimension::Fixed).collect(),
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Return the shape as concrete sizes if every dimension is fixed.
    pub fn fixed_shape(&self) -> Option<DimVec> {
        self.shape.iter().map(|d| d.size()).collect()
    }
}

/// The memoized result of type inference for an expression.
#[derive(Clone, Debug, PartialEq)]
pub enum CheckedType {
    Tensor(TensorType),
    Tuple(Vec<CheckedType>),
    /// The expression is not well-formed (eg. a shape contradiction). This
    /// is an ordinary value: candidate construction tests for it and
    /// discards the candidate rather than failing.
    Invalid(String),
}

impl CheckedType {
    pub fn is_invalid(&self) -> bool {
        match self {
            CheckedType::Invalid(_) => true,
            CheckedType::Tuple(items) => items.iter().any(|t| t.is_invalid()),
            CheckedType::Tensor(_) => false,
        }
    }

    pub fn as_tensor(&self) -> Option<&TensorType> {
        match self {
            CheckedType::Tensor(ty) => Some(ty),
            _ => None,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> CheckedType {
        CheckedType::Invalid(reason.into())
    }
}

pub enum ExprKind {
    /// Free tensor placeholder with a declared type.
    Var { name: String, ty: TensorType },
    /// Literal tensor.
    Constant(Value),
    /// Ordered heterogeneous group of expressions.
    Tuple(Vec<Expr>),
    /// Operator application.
    Call { op: Op, args: Vec<Expr> },
}

struct ExprNode {
    kind: ExprKind,
    checked: OnceCell<CheckedType>,
}

/// Handle to an immutable expression node.
#[derive(Clone)]
pub struct Expr {
    node: Rc<ExprNode>,
}

impl Expr {
    fn from_kind(kind: ExprKind) -> Expr {
        Expr {
            node: Rc::new(ExprNode {
                kind,
                checked: OnceCell::new(),
            }),
        }
    }

    /// Create a free variable with a declared type.
    pub fn var(name: &str, ty: TensorType) -> Expr {
        Expr::from_kind(ExprKind::Var {
            name: name.to_string(),
            ty,
        })
    }

    /// Create a constant from a tensor literal or scalar.
    pub fn constant<V: Into<Value>>(value: V) -> Expr {
        Expr::from_kind(ExprKind::Constant(value.into()))
    }

    pub fn tuple<I: Into<Vec<Expr>>>(items: I) -> Expr {
        Expr::from_kind(ExprKind::Tuple(items.into()))
    }

    /// Apply an operator to arguments.
    pub fn call<I: Into<Vec<Expr>>>(op: Op, args: I) -> Expr {
        Expr::from_kind(ExprKind::Call {
            op,
            args: args.into(),
        })
    }

    pub fn unary(&self, op: UnaryOp) -> Expr {
        Expr::call(Op::Unary(op), [self.clone()])
    }

    pub fn binary(&self, op: BinaryOp, rhs: Expr) -> Expr {
        Expr::call(Op::Binary(op), [self.clone(), rhs])
    }

    pub fn kind(&self) -> &ExprKind {
        &self.node.kind
    }

    /// Return the operator and arguments if this is a call node.
    pub fn as_call(&self) -> Option<(&Op, &[Expr])> {
        match &self.node.kind {
            ExprKind::Call { op, args } => Some((op, args)),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Expr]> {
        match &self.node.kind {
            ExprKind::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_constant(&self) -> Option<&Value> {
        match &self.node.kind {
            ExprKind::Constant(value) => Some(value),
            _ => None,
        }
    }

    pub fn var_name(&self) -> Option<&str> {
        match &self.node.kind {
            ExprKind::Var { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Return this expression's checked type, computing and memoizing it on
    /// first use. Once set it never changes.
    pub fn checked_type(&self) -> &CheckedType {
        self.node.checked.get_or_init(|| infer::infer(self))
    }

    /// Return the checked tensor shape, if this expression is tensor-typed.
    pub fn checked_shape(&self) -> Option<&[Dimension]> {
        self.checked_type().as_tensor().map(|ty| ty.shape.as_slice())
    }

    pub fn checked_dtype(&self) -> Option<DataType> {
        self.checked_type().as_tensor().map(|ty| ty.dtype)
    }

    /// Return the shape as concrete sizes if the type is valid and every
    /// dimension is fixed.
    pub fn fixed_shape(&self) -> Option<DimVec> {
        self.checked_type().as_tensor().and_then(|ty| ty.fixed_shape())
    }

    /// True if `self` and `other` are the same node.
    pub fn ptr_eq(&self, other: &Expr) -> bool {
        Rc::ptr_eq(&self.node, &other.node)
    }
}

impl PartialEq for Expr {
    /// Structural equality, with a pointer-identity fast path.
    fn eq(&self, other: &Expr) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        match (&self.node.kind, &other.node.kind) {
            (
                ExprKind::Var { name: a, ty: ta },
                ExprKind::Var { name: b, ty: tb },
            ) => a == b && ta == tb,
            (ExprKind::Constant(a), ExprKind::Constant(b)) => a == b,
            (ExprKind::Tuple(a), ExprKind::Tuple(b)) => a == b,
            (
                ExprKind::Call { op: op_a, args: args_a },
                ExprKind::Call { op: op_b, args: args_b },
            ) => op_a == op_b && args_a == args_b,
            _ => false,
        }
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node.kind {
            ExprKind::Var { name, .. } => write!(f, "%{}", name),
            ExprKind::Constant(value) => match value.item_f32() {
                Some(x) => write!(f, "{}", x),
                None => write!(f, "const{:?}", value.shape()),
            },
            ExprKind::Tuple(items) => f.debug_list().entries(items).finish(),
            ExprKind::Call { op, args } => {
                write!(f, "{}(", op.name())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}", arg)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Wrapper around an [`Expr`] which uses pointer identity for equality and
/// hashing, for use as a memo-cache key.
#[derive(Clone)]
pub struct ExprRef(pub Expr);

impl PartialEq for ExprRef {
    fn eq(&self, other: &ExprRef) -> bool {
        self.0.ptr_eq(&other.0)
    }
}

impl Eq for ExprRef {}

impl Hash for ExprRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Rc::as_ptr(&self.0.node).hash(state)
    }
}

macro_rules! impl_binop_for_expr {
    ($trait:ident, $method:ident, $op:ident) => {
        impl $trait for Expr {
            type Output = Expr;

            fn $method(self, rhs: Expr) -> Expr {
                self.binary(BinaryOp::$op, rhs)
            }
        }

        impl<V: Into<Value>> $trait<V> for Expr {
            type Output = Expr;

            fn $method(self, rhs: V) -> Expr {
                self.binary(BinaryOp::$op, Expr::constant(rhs))
            }
        }
    };
}

impl_binop_for_expr!(Add, add, Add);
impl_binop_for_expr!(Sub, sub, Sub);
impl_binop_for_expr!(Mul, mul, Mul);
impl_binop_for_expr!(Div, div, Div);

#[cfg(test)]
mod tests {
    use super::{Expr, TensorType};
    use crate::ops::UnaryOp;
    use crate::value::DataType;

    fn var(name: &str, shape: &[usize]) -> Expr {
        Expr::var(name, TensorType::fixed(DataType::Float, shape))
    }

    #[test]
    fn test_structural_equality() {
        let x = var("x", &[4]);
        let a = x.clone().unary(UnaryOp::Abs) + 1.0;
        let b = x.clone().unary(UnaryOp::Abs) + 1.0;
        assert_eq!(a, b);
        assert!(!a.ptr_eq(&b));

        let c = x.unary(UnaryOp::Neg) + 1.0;
        assert_ne!(a, c);
    }

    #[test]
    fn test_checked_type_is_memoized() {
        let x = var("x", &[2, 3]);
        let sum = x.clone() + var("y", &[3]);
        let first = sum.checked_type().clone();
        assert_eq!(sum.checked_type(), &first);
        assert_eq!(
            sum.fixed_shape().as_deref(),
            Some(&[2usize, 3][..])
        );
    }
}
