//! packwise rewrites tensor compute graphs so their inner loops line up
//! with fixed-width SIMD lanes.
//!
//! The input is an expression graph over logical tensor shapes. The
//! rewriter walks it bottom-up and, for each operator it knows how to
//! vectorize, wraps the operands in lane-packing views: axes are padded
//! to a multiple of the lane width and regrouped so that consecutive
//! elements of the packed axes land in consecutive lanes. A folding pass
//! then cancels adjacent unpack/pack pairs so packed values flow between
//! operators without bouncing through logical layout.
//!
//! # Usage
//!
//! Build a graph with [`Expr`], rewrite it with [`vectorize`], and check
//! the result against the original with [`eval::evaluate`]:
//!
//! ```
//! use packwise::{vectorize, Expr, TensorType, VectorizeOptions};
//! use packwise::ops::UnaryOp;
//! use packwise::value::DataType;
//!
//! let x = Expr::var("x", TensorType::fixed(DataType::Float, &[4, 100]));
//! let graph = x.unary(UnaryOp::Exp) + 1.0;
//! let packed = vectorize(&graph, VectorizeOptions::default()).unwrap();
//! assert!(!packed.ptr_eq(&graph));
//! ```
//!
//! The packed graph computes the same values as the original; lane fill
//! introduced by padding is trimmed before it can be observed.

pub mod diagnostics;
pub mod eval;
pub mod expr;
pub mod ops;
pub mod pattern;
pub mod rewrite;
pub mod tensor;
pub mod value;
pub mod vectorize;

mod infer;

pub use expr::{Dimension, Expr, TensorType};
pub use rewrite::{vectorize, Rewriter, VectorizeError};
pub use vectorize::{VectorizeOptions, VectorizeRule};
