//! Symbolic expressions evaluated lazily against an [`Env`].
//!
//! Derived scan variables are written as expression trees over the names
//! bound by loops and constants. Evaluation is one-shot and partial: an
//! expression whose free symbols are all bound collapses to a concrete
//! [`data_types::Value`], anything else is returned as a residual tree.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod arith;
mod env;
mod expr;

pub use env::{Binding, Env};
pub use expr::{BinaryOp, Expr, MemoizedExpr, UnaryOp};

/// Errors raised while evaluating an expression.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    /// Division (or modulo) hit a zero denominator at eval time.
    #[error("division by zero")]
    DivisionByZero,

    /// An operator was applied to operand types it does not support.
    #[error("type mismatch: cannot apply {op} to {lhs} and {rhs}")]
    TypeMismatch {
        /// Operator name.
        op: &'static str,
        /// Left operand description.
        lhs: &'static str,
        /// Right operand description.
        rhs: &'static str,
    },

    /// Elementwise operation over arrays of different shapes.
    #[error("shape mismatch: {lhs:?} vs {rhs:?}")]
    ShapeMismatch {
        /// Left shape.
        lhs: Vec<usize>,
        /// Right shape.
        rhs: Vec<usize>,
    },

    /// Call of a function the environment does not register.
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    /// Method not supported by the receiver value.
    #[error("unknown method {method} on {receiver}")]
    UnknownMethod {
        /// Method name.
        method: String,
        /// Receiver description.
        receiver: &'static str,
    },

    /// A function was called with the wrong number of arguments.
    #[error("{name} expects {expected} argument(s), got {got}")]
    WrongArity {
        /// Function name.
        name: String,
        /// Expected argument count.
        expected: usize,
        /// Actual argument count.
        got: usize,
    },

    /// `value()` was asked for a concrete result but symbols stayed free.
    #[error("unresolved symbols: {0:?}")]
    UnresolvedSymbols(Vec<String>),

    /// Writing to a name the environment marks const.
    #[error("cannot assign to const name {0:?}")]
    AssignToConst(String),

    /// Index out of range on an array value.
    #[error("index {index} out of bounds for axis of length {len}")]
    IndexOutOfBounds {
        /// Requested index.
        index: i64,
        /// Axis length.
        len: usize,
    },
}

/// Evaluation result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
