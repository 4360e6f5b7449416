//! Step generation for parameterized scans.
//!
//! A scan is declared as a map of loop variables (levels of nesting),
//! derived variables, constants and filters. [`scan_iters`] turns that
//! declaration into a lazy sequence of typed steps honoring the data
//! dependencies between variables: outer loops advance before inner
//! generators are re-evaluated, derived variables are computed in
//! topological ready-groups, optimizer-backed loops are driven through
//! their ask/tell interface, and filtered steps advance the position
//! without being yielded.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use snafu::Snafu;

mod feedback;
mod iter;
mod loops;
mod optimizer;
pub mod plan;

pub use feedback::FeedbackPipes;
pub use iter::{scan_iters, LevelInfo, ScanConfig, ScanIter, ScanStep, StepStatus};
pub use loops::{FilterFn, FunctionDef, Kwds, LoopEntry, LoopSource, LoopSpec};
pub use optimizer::{Dimension, GridSearch, OptimizeResult, Optimizer, OptimizerConfig, OptimizerFactory};

/// Errors raised while planning or driving a scan.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("circular dependency among {names:?}"))]
    CircularDependency { names: Vec<String> },

    #[snafu(display("loop {keys:?} produced {got} value(s) per step, expected {expected}"))]
    KeyArity {
        keys: Vec<String>,
        expected: usize,
        got: usize,
    },

    #[snafu(display("loop {keys:?} is not iterable: expression evaluated to a scalar"))]
    LoopNotIterable { keys: Vec<String> },

    #[snafu(display("evaluating expression for {name:?}: {source}"))]
    Expression {
        name: String,
        source: expression::Error,
    },

    #[snafu(display("user function {name:?} failed: {source}"))]
    UserFunction {
        name: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[snafu(display("loop generator for {keys:?} failed: {source}"))]
    Generator {
        keys: Vec<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Result alias for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
