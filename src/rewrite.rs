//! The rewrite driver.
//!
//! [`Rewriter`] walks a graph bottom-up, replaces each operator with the
//! first candidate its rule produces, and folds pack/unpack seams as they
//! appear. Shared subexpressions are rewritten once: the memo is keyed on
//! node identity, so a DAG stays a DAG.

use std::error::Error;
use std::fmt;

use rustc_hash::FxHashMap;

use crate::diagnostics::Diagnostics;
use crate::expr::{Expr, ExprKind, ExprRef};
use crate::ops::Op;
use crate::vectorize::{default_rules, fold_rules, VectorizeOptions, VectorizeRule};

/// Errors that cause vectorization to fail outright.
///
/// An operator that merely has no legal packing is not an error; rules
/// decline by returning no candidates and the operator is left as it was.
#[derive(Debug, PartialEq, Eq)]
pub enum VectorizeError {
    /// The graph contains an operator no configured rule is responsible
    /// for.
    UnsupportedOperator(&'static str),
}

impl fmt::Display for VectorizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VectorizeError::UnsupportedOperator(name) => {
                write!(f, "graph contains unsupported operator \"{}\"", name)
            }
        }
    }
}

impl Error for VectorizeError {}

/// Applies vectorization rules and folds over a whole expression graph.
pub struct Rewriter {
    rules: Vec<Box<dyn VectorizeRule>>,
    folds: Vec<Box<dyn VectorizeRule>>,
    diagnostics: Diagnostics,
}

impl Rewriter {
    /// Create a rewriter with the default rule set for `opts`.
    pub fn new(opts: VectorizeOptions) -> Rewriter {
        Rewriter {
            rules: default_rules(opts),
            folds: fold_rules(),
            diagnostics: Diagnostics::from_env(),
        }
    }

    /// Create a rewriter with an explicit rule and fold set.
    pub fn with_rules(
        rules: Vec<Box<dyn VectorizeRule>>,
        folds: Vec<Box<dyn VectorizeRule>>,
    ) -> Rewriter {
        Rewriter {
            rules,
            folds,
            diagnostics: Diagnostics::from_env(),
        }
    }

    pub fn set_diagnostics(&mut self, diagnostics: Diagnostics) {
        self.diagnostics = diagnostics;
    }

    /// Rewrite a graph, returning the transformed root.
    pub fn rewrite(&self, expr: &Expr) -> Result<Expr, VectorizeError> {
        let mut memo: FxHashMap<ExprRef, Expr> = FxHashMap::default();
        self.rewrite_expr(expr, &mut memo)
    }

    fn rewrite_expr(
        &self,
        expr: &Expr,
        memo: &mut FxHashMap<ExprRef, Expr>,
    ) -> Result<Expr, VectorizeError> {
        if let Some(cached) = memo.get(&ExprRef(expr.clone())) {
            return Ok(cached.clone());
        }

        let rebuilt = match expr.kind() {
            ExprKind::Call { op, args } => {
                let new_args = args
                    .iter()
                    .map(|arg| self.rewrite_expr(arg, memo))
                    .collect::<Result<Vec<_>, _>>()?;
                if new_args.iter().zip(args).all(|(new, old)| new.ptr_eq(old)) {
                    expr.clone()
                } else {
                    Expr::call(op.clone(), new_args)
                }
            }
            ExprKind::Tuple(items) => {
                let new_items = items
                    .iter()
                    .map(|item| self.rewrite_expr(item, memo))
                    .collect::<Result<Vec<_>, _>>()?;
                if new_items.iter().zip(items).all(|(new, old)| new.ptr_eq(old)) {
                    expr.clone()
                } else {
                    Expr::tuple(new_items)
                }
            }
            ExprKind::Var { .. } | ExprKind::Constant(_) => expr.clone(),
        };

        if let Some((op, _)) = rebuilt.as_call() {
            if !self.is_supported(op) {
                return Err(VectorizeError::UnsupportedOperator(op.name()));
            }
        }

        let result = self.apply_rules(&rebuilt);
        let result = self.fold_node(&result);
        memo.insert(ExprRef(expr.clone()), result.clone());
        Ok(result)
    }

    /// Replace `expr` with the first candidate any rule produces for it.
    fn apply_rules(&self, expr: &Expr) -> Expr {
        let Some((op, _)) = expr.as_call() else {
            return expr.clone();
        };
        for rule in &self.rules {
            let Some(pat_match) = rule.pattern().test(expr) else {
                continue;
            };
            if let Some(replacement) = rule.replace(&pat_match) {
                self.diagnostics
                    .info(rule.name(), format_args!("rewrote {}", op.name()));
                // Replacements introduce their own pack/unpack seams which
                // may cancel against the (already rewritten) children.
                return self.fold_tree(&replacement);
            }
        }
        if !is_scaffolding(op) {
            self.diagnostics
                .warn(op.name(), format_args!("no vectorization candidate"));
        }
        expr.clone()
    }

    /// Apply the folds bottom-up over a freshly built subtree.
    fn fold_tree(&self, expr: &Expr) -> Expr {
        let rebuilt = match expr.kind() {
            ExprKind::Call { op, args } => {
                let new_args: Vec<Expr> =
                    args.iter().map(|arg| self.fold_tree(arg)).collect();
                if new_args.iter().zip(args).all(|(new, old)| new.ptr_eq(old)) {
                    expr.clone()
                } else {
                    Expr::call(op.clone(), new_args)
                }
            }
            ExprKind::Tuple(items) => {
                let new_items: Vec<Expr> =
                    items.iter().map(|item| self.fold_tree(item)).collect();
                if new_items.iter().zip(items).all(|(new, old)| new.ptr_eq(old)) {
                    expr.clone()
                } else {
                    Expr::tuple(new_items)
                }
            }
            ExprKind::Var { .. } | ExprKind::Constant(_) => return expr.clone(),
        };
        self.fold_node(&rebuilt)
    }

    /// Apply the folds at one node until none fires.
    fn fold_node(&self, expr: &Expr) -> Expr {
        let mut current = expr.clone();
        'fixpoint: loop {
            for fold in &self.folds {
                let Some(pat_match) = fold.pattern().test(&current) else {
                    continue;
                };
                if let Some(folded) = fold.replace(&pat_match) {
                    self.diagnostics
                        .info(fold.name(), format_args!("folded {:?}", current));
                    current = folded;
                    continue 'fixpoint;
                }
            }
            return current;
        }
    }

    fn is_supported(&self, op: &Op) -> bool {
        // A folds-only pass has no opinion about operator coverage; it
        // cancels seams and leaves everything else alone.
        self.rules.is_empty()
            || is_scaffolding(op)
            || self.rules.iter().any(|rule| rule.applies_to(op))
    }
}

/// Operators the rewriter itself introduces; they need no rule of their
/// own.
fn is_scaffolding(op: &Op) -> bool {
    matches!(
        op,
        Op::Pack(_) | Op::Unpack(_) | Op::PackMask { .. } | Op::Pad { .. } | Op::Im2col { .. }
    )
}

/// Vectorize a graph with the default rules for `opts`.
pub fn vectorize(expr: &Expr, opts: VectorizeOptions) -> Result<Expr, VectorizeError> {
    Rewriter::new(opts).rewrite(expr)
}
