//! Pattern DSL and matcher for expression subtrees.
//!
//! Rules declare a [`Pattern`] describing the subgraph they rewrite. The
//! matcher walks an [`Expr`], records name → subexpression bindings in a
//! [`Match`], and backtracks through commutative operand swaps and
//! [`Pattern::alt`] alternatives.

use std::ops::{Add, Div, Mul, Neg, Sub};

use crate::expr::{Expr, ExprKind};
use crate::ops::{BinaryOp, Op, UnaryOp};
use crate::value::DataType;

/// Tracks an association between named symbols in a pattern and the
/// subexpressions they have been resolved to.
struct SymbolMap {
    // Modified only by extending and truncating.
    symbols: Vec<(&'static str, Expr)>,

    // Stack of `symbols` lengths at each checkpoint.
    checkpoints: Vec<usize>,
}

impl SymbolMap {
    fn new() -> SymbolMap {
        SymbolMap {
            symbols: Vec::new(),
            checkpoints: Vec::new(),
        }
    }

    /// Save the current state of the map, for backtracking.
    fn checkpoint(&mut self) {
        self.checkpoints.push(self.symbols.len());
    }

    /// Discard any symbols recorded since the last `checkpoint`.
    fn revert(&mut self) {
        if let Some(checkpoint) = self.checkpoints.pop() {
            self.symbols.truncate(checkpoint);
        }
    }

    fn add(&mut self, name: &'static str, expr: Expr) {
        self.symbols.push((name, expr));
    }

    fn find(&self, name: &str) -> Option<&Expr> {
        self.symbols
            .iter()
            .find_map(|(sym, expr)| (*sym == name).then_some(expr))
    }
}

/// The result of matching a [`Pattern`] against an expression.
pub struct Match {
    symbols: SymbolMap,
}

impl Match {
    /// Return the subexpression that a symbol or named operator resolved to.
    pub fn get(&self, name: &str) -> Option<&Expr> {
        self.symbols.find(name)
    }

    /// Like [`get`](Self::get), but panics if the symbol is unbound. Use for
    /// symbols the pattern is known to contain.
    pub fn expect(&self, name: &str) -> &Expr {
        self.get(name)
            .unwrap_or_else(|| panic!("symbol \"{}\" not bound by pattern", name))
    }
}

/// Absolute tolerance for matching float constants against constant patterns.
const CONST_TOLERANCE: f32 = 1e-4;

#[derive(Clone, Debug)]
pub struct ConstantPattern {
    value: f32,
}

impl ConstantPattern {
    fn matches(&self, expr: &Expr) -> bool {
        expr.as_constant()
            .and_then(|value| value.item_f32())
            .is_some_and(|x| (x - self.value).abs() <= CONST_TOLERANCE)
    }
}

#[derive(Clone, Debug)]
pub struct CallPattern {
    /// Name of the operator or operator family (for diagnostics, and for
    /// matching when `by_name` is set).
    name: &'static str,

    /// When set, the operator matches if `Op::name` equals `name`;
    /// otherwise `test` decides.
    by_name: bool,

    /// Predicate that the call's operator must satisfy.
    test: fn(&Op) -> bool,

    /// Patterns the inputs must match. `None` accepts any arity; the rule
    /// reads the arguments off the bound call itself.
    inputs: Option<Vec<Pattern>>,

    /// Identifier used to look up the call after a successful match.
    key: Option<&'static str>,
}

impl CallPattern {
    fn matches(&self, expr: &Expr, symbols: &mut SymbolMap) -> bool {
        let Some((op, args)) = expr.as_call() else {
            return false;
        };
        let op_ok = if self.by_name {
            op.name() == self.name
        } else {
            (self.test)(op)
        };
        if !op_ok {
            return false;
        }
        let Some(input_pats) = &self.inputs else {
            return true;
        };
        if input_pats.len() != args.len() {
            return false;
        }

        // For commutative binary operators, allow the pattern to match
        // either way around.
        if let (true, [pat_a, pat_b], [arg_a, arg_b]) =
            (op.is_commutative(), &input_pats[..], args)
        {
            symbols.checkpoint();
            if pat_a.test_impl(arg_a, symbols) && pat_b.test_impl(arg_b, symbols) {
                return true;
            }
            symbols.revert();

            pat_b.test_impl(arg_a, symbols) && pat_a.test_impl(arg_b, symbols)
        } else {
            input_pats
                .iter()
                .zip(args)
                .all(|(pat, arg)| pat.test_impl(arg, symbols))
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct SymbolPattern {
    name: &'static str,

    /// True if this symbol can only match a constant.
    constant: bool,

    /// If set, the matched expression's checked dtype must equal this.
    dtype: Option<DataType>,
}

/// Specifies a pattern for an expression subtree.
///
/// Patterns are created with constructor methods and combined with math
/// operators. For example `Pattern::constant(1.0) + Pattern::symbol("x")`
/// describes an `Add` call taking the float constant `1.0` and a free
/// variable `x` as inputs.
#[derive(Clone, Debug)]
pub enum Pattern {
    /// Matches an operator application.
    Call(CallPattern),
    /// Matches a constant with a given value.
    Constant(ConstantPattern),
    /// Matches any expression (optionally constrained), binding it to a name.
    Symbol(SymbolPattern),
    /// Matches the first alternative that succeeds.
    Alt(Box<Pattern>, Box<Pattern>),
}

impl Pattern {
    /// Create a pattern matching a call to the operator named `name`, with
    /// any arguments.
    pub fn op(name: &'static str) -> Pattern {
        Pattern::Call(CallPattern {
            name,
            by_name: true,
            test: |_| true,
            inputs: None,
            key: None,
        })
    }

    /// Create a pattern matching calls whose operator satisfies `test`.
    pub fn op_family(name: &'static str, test: fn(&Op) -> bool) -> Pattern {
        Pattern::Call(CallPattern {
            name,
            by_name: false,
            test,
            inputs: None,
            key: None,
        })
    }

    /// Create a pattern matching an operator with specific input patterns.
    pub fn call<I: Into<Vec<Pattern>>>(
        name: &'static str,
        test: fn(&Op) -> bool,
        inputs: I,
    ) -> Pattern {
        Pattern::Call(CallPattern {
            name,
            by_name: false,
            test,
            inputs: Some(inputs.into()),
            key: None,
        })
    }

    pub fn binary_op<A: Into<Pattern>, B: Into<Pattern>>(
        op: BinaryOp,
        input_a: A,
        input_b: B,
    ) -> Pattern {
        let test: fn(&Op) -> bool = match op {
            BinaryOp::Add => |op| matches!(op, Op::Binary(BinaryOp::Add)),
            BinaryOp::Sub => |op| matches!(op, Op::Binary(BinaryOp::Sub)),
            BinaryOp::Mul => |op| matches!(op, Op::Binary(BinaryOp::Mul)),
            BinaryOp::Div => |op| matches!(op, Op::Binary(BinaryOp::Div)),
            BinaryOp::Min => |op| matches!(op, Op::Binary(BinaryOp::Min)),
            BinaryOp::Max => |op| matches!(op, Op::Binary(BinaryOp::Max)),
            BinaryOp::Pow => |op| matches!(op, Op::Binary(BinaryOp::Pow)),
        };
        Pattern::call("Binary", test, [input_a.into(), input_b.into()])
    }

    pub fn unary_op<I: Into<Pattern>>(op: UnaryOp, input: I) -> Pattern {
        let test: fn(&Op) -> bool = match op {
            UnaryOp::Neg => |op| matches!(op, Op::Unary(UnaryOp::Neg)),
            UnaryOp::Abs => |op| matches!(op, Op::Unary(UnaryOp::Abs)),
            UnaryOp::Sqrt => |op| matches!(op, Op::Unary(UnaryOp::Sqrt)),
            UnaryOp::Exp => |op| matches!(op, Op::Unary(UnaryOp::Exp)),
            UnaryOp::Log => |op| matches!(op, Op::Unary(UnaryOp::Log)),
            UnaryOp::Erf => |op| matches!(op, Op::Unary(UnaryOp::Erf)),
            UnaryOp::Sigmoid => |op| matches!(op, Op::Unary(UnaryOp::Sigmoid)),
        };
        Pattern::call("Unary", test, [input.into()])
    }

    /// Set the identifier used to look up this pattern's match with
    /// [`Match::get`].
    pub fn with_name(self, name: &'static str) -> Pattern {
        match self {
            Pattern::Call(mut call) => {
                call.key = Some(name);
                Pattern::Call(call)
            }
            Pattern::Symbol(mut symbol) => {
                symbol.name = name;
                Pattern::Symbol(symbol)
            }
            // Constants don't support keys.
            other => other,
        }
    }

    /// Create a pattern that matches a scalar float constant with a given
    /// value, within a small tolerance.
    pub fn constant(value: f32) -> Pattern {
        Pattern::Constant(ConstantPattern { value })
    }

    /// Create a pattern that matches any expression.
    ///
    /// All symbols with the same name must resolve to the same node for a
    /// pattern to match.
    pub fn symbol(name: &'static str) -> Pattern {
        Pattern::Symbol(SymbolPattern {
            name,
            constant: false,
            dtype: None,
        })
    }

    /// Create a pattern that matches any constant.
    pub fn const_symbol(name: &'static str) -> Pattern {
        Pattern::Symbol(SymbolPattern {
            name,
            constant: true,
            dtype: None,
        })
    }

    /// Constrain a symbol pattern to expressions of a given element type.
    pub fn with_dtype(self, dtype: DataType) -> Pattern {
        match self {
            Pattern::Symbol(mut symbol) => {
                symbol.dtype = Some(dtype);
                Pattern::Symbol(symbol)
            }
            other => other,
        }
    }

    /// Create a pattern that tries `a`, then `b` if `a` fails.
    pub fn alt(a: Pattern, b: Pattern) -> Pattern {
        Pattern::Alt(Box::new(a), Box::new(b))
    }

    /// Test this pattern against an expression.
    ///
    /// If the pattern matches, returns a [`Match`] for looking up the
    /// subexpressions that symbols resolved to.
    pub fn test(&self, expr: &Expr) -> Option<Match> {
        let mut symbols = SymbolMap::new();
        if self.test_impl(expr, &mut symbols) {
            Some(Match { symbols })
        } else {
            None
        }
    }

    fn test_impl(&self, expr: &Expr, symbols: &mut SymbolMap) -> bool {
        match self {
            Pattern::Call(call_pat) => {
                if call_pat.matches(expr, symbols) {
                    if let Some(key) = call_pat.key {
                        symbols.add(key, expr.clone());
                    }
                    true
                } else {
                    false
                }
            }
            Pattern::Constant(const_pat) => const_pat.matches(expr),
            Pattern::Symbol(sym_pat) => {
                if sym_pat.constant && !matches!(expr.kind(), ExprKind::Constant(_)) {
                    return false;
                }
                if let Some(dtype) = sym_pat.dtype {
                    if expr.checked_dtype() != Some(dtype) {
                        return false;
                    }
                }
                // A repeated symbol must resolve to the same node.
                if let Some(resolved) = symbols.find(sym_pat.name) {
                    resolved == expr
                } else {
                    symbols.add(sym_pat.name, expr.clone());
                    true
                }
            }
            Pattern::Alt(a, b) => {
                symbols.checkpoint();
                if a.test_impl(expr, symbols) {
                    return true;
                }
                symbols.revert();
                b.test_impl(expr, symbols)
            }
        }
    }
}

impl From<f32> for Pattern {
    fn from(val: f32) -> Pattern {
        Pattern::constant(val)
    }
}

macro_rules! impl_binop_for_pattern {
    ($trait:ident, $method:ident, $op:ident) => {
        impl<I: Into<Pattern>> $trait<I> for Pattern {
            type Output = Pattern;

            fn $method(self, rhs: I) -> Pattern {
                Pattern::binary_op(BinaryOp::$op, self, rhs.into())
            }
        }

        impl $trait<Pattern> for f32 {
            type Output = Pattern;

            fn $method(self, rhs: Pattern) -> Pattern {
                Pattern::binary_op(BinaryOp::$op, Pattern::constant(self), rhs)
            }
        }
    };
}
impl_binop_for_pattern!(Add, add, Add);
impl_binop_for_pattern!(Mul, mul, Mul);
impl_binop_for_pattern!(Div, div, Div);
impl_binop_for_pattern!(Sub, sub, Sub);

impl Neg for Pattern {
    type Output = Pattern;

    fn neg(self) -> Pattern {
        Pattern::unary_op(UnaryOp::Neg, self)
    }
}

#[cfg(test)]
mod tests {
    use super::Pattern;
    use crate::expr::{Expr, TensorType};
    use crate::ops::UnaryOp;
    use crate::value::DataType;

    /// Build an expression for the softsign function `x / (1 + |x|)`.
    fn softsign(x: &Expr) -> Expr {
        x.clone() / (Expr::constant(1.0) + x.unary(UnaryOp::Abs))
    }

    fn float_var(name: &str, shape: &[usize]) -> Expr {
        Expr::var(name, TensorType::fixed(DataType::Float, shape))
    }

    #[test]
    fn test_pattern_match() {
        struct Case {
            pattern: Pattern,
            expect_match: bool,
        }

        let x = Pattern::symbol("x");
        let c = Pattern::const_symbol("c");
        let unary_op = Pattern::unary_op;

        let cases = [
            Case {
                pattern: x.clone() / (1.0 + unary_op(UnaryOp::Abs, x.clone())),
                expect_match: true,
            },
            // Constant symbol instead of fixed constant.
            Case {
                pattern: x.clone() / (c.clone() + unary_op(UnaryOp::Abs, x.clone())),
                expect_match: true,
            },
            // Operands of the non-commutative "/" swapped.
            Case {
                pattern: (1.0 + unary_op(UnaryOp::Abs, x.clone())) / x.clone(),
                expect_match: false,
            },
            // Operands of the commutative "+" swapped around.
            Case {
                pattern: x.clone() / (unary_op(UnaryOp::Abs, x.clone()) + 1.0),
                expect_match: true,
            },
            // "+" operator swapped for "-".
            Case {
                pattern: x.clone() / (1.0 - unary_op(UnaryOp::Abs, x.clone())),
                expect_match: false,
            },
            // Modified constant value.
            Case {
                pattern: x.clone() / (1.1 + unary_op(UnaryOp::Abs, x.clone())),
                expect_match: false,
            },
            // Constant within the allowed tolerance.
            Case {
                pattern: x.clone() / (1.00001 + unary_op(UnaryOp::Abs, x.clone())),
                expect_match: true,
            },
            // Symbol "x" does not resolve to the same node everywhere.
            Case {
                pattern: x.clone() / (x.clone() + unary_op(UnaryOp::Abs, x.clone())),
                expect_match: false,
            },
            // Non-constant input matched against a constant symbol.
            Case {
                pattern: c.clone() / (1.0 + unary_op(UnaryOp::Abs, x.clone())),
                expect_match: false,
            },
            // Alt: second alternative succeeds.
            Case {
                pattern: Pattern::alt(
                    Pattern::op("MatMul"),
                    x.clone() / (1.0 + unary_op(UnaryOp::Abs, x.clone())),
                ),
                expect_match: true,
            },
            // Typed wildcard with the wrong dtype.
            Case {
                pattern: x.clone().with_dtype(DataType::Int32)
                    / (1.0 + unary_op(UnaryOp::Abs, x.clone().with_dtype(DataType::Int32))),
                expect_match: false,
            },
        ];

        let input = float_var("x", &[4]);
        let graph = softsign(&input);

        for (i, Case { pattern, expect_match }) in cases.into_iter().enumerate() {
            let pat_match = pattern.test(&graph);
            assert_eq!(pat_match.is_some(), expect_match, "mismatch for case {}", i);
            if let Some(pat_match) = pat_match {
                assert!(pat_match.expect("x").ptr_eq(&input));
            }
        }
    }

    #[test]
    fn test_call_with_key() {
        let input = float_var("x", &[4]);
        let graph = softsign(&input);

        let x = Pattern::symbol("x");
        let pat = x.clone()
            / (1.0 + Pattern::unary_op(UnaryOp::Abs, x.clone()).with_name("abs_op"));
        let pat_match = pat.test(&graph).unwrap();
        let abs = pat_match.expect("abs_op");
        assert_eq!(abs.as_call().unwrap().0.name(), "Abs");
    }

    #[test]
    fn test_op_name_pattern() {
        let input = float_var("x", &[4]);
        let graph = softsign(&input);
        assert!(Pattern::op("Div").test(&graph).is_some());
        assert!(Pattern::op("MatMul").test(&graph).is_none());
    }
}
