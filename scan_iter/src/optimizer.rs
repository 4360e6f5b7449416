//! The adaptive-search interface optimizer-backed loops are driven
//! through, and a simple built-in grid policy.
//!
//! The iterator only sees three methods: `ask` for the next coordinate,
//! `tell` for feedback, and `get_result` for the final estimate that is
//! substituted on the last allowed iteration. Concrete search policies
//! are supplied by the caller as factory closures.

use std::sync::Arc;

use data_types::Value;

/// One search dimension of an optimizer-backed loop.
#[derive(Debug, Clone)]
pub struct Dimension {
    /// Variable name this dimension feeds.
    pub name: String,
    /// Lower bound.
    pub low: f64,
    /// Upper bound.
    pub high: f64,
}

impl Dimension {
    /// A named `[low, high]` box.
    pub fn new(name: impl Into<String>, low: f64, high: f64) -> Self {
        Self {
            name: name.into(),
            low,
            high,
        }
    }
}

/// The optimizer's current best estimate.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizeResult {
    /// Best coordinate, one value per dimension.
    pub x: Vec<Value>,
    /// Objective value at `x`, when the policy tracks one.
    pub fun: Option<Value>,
}

/// An adaptive search policy.
pub trait Optimizer: Send {
    /// Suggest the next coordinate to evaluate.
    fn ask(&mut self) -> Vec<Value>;

    /// Deliver feedback for a previously suggested coordinate.
    fn tell(&mut self, suggested: Vec<Value>, value: Value);

    /// The best estimate so far.
    fn get_result(&self) -> OptimizeResult;
}

/// Builds a fresh policy instance when its loop level is entered.
pub type OptimizerFactory = Arc<dyn Fn(&[Dimension]) -> Box<dyn Optimizer> + Send + Sync>;

/// Declaration of an optimizer-backed loop entry.
#[derive(Clone)]
pub struct OptimizerConfig {
    /// Search dimensions, one per bound name.
    pub dimensions: Vec<Dimension>,
    /// Policy constructor.
    pub factory: OptimizerFactory,
    /// Iterations granted to this policy; the last one evaluates
    /// `get_result().x` instead of a fresh suggestion.
    pub maxiter: usize,
    /// Whether feedback is minimized (otherwise maximized).
    pub minimize: bool,
}

impl std::fmt::Debug for OptimizerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimizerConfig")
            .field("dimensions", &self.dimensions)
            .field("maxiter", &self.maxiter)
            .field("minimize", &self.minimize)
            .finish()
    }
}

impl OptimizerConfig {
    /// Config with the built-in grid policy.
    pub fn grid(dimensions: Vec<Dimension>, maxiter: usize, minimize: bool) -> Self {
        Self {
            dimensions,
            factory: Arc::new(|dims| Box::new(GridSearch::new(dims))),
            maxiter,
            minimize,
        }
    }

    /// Config with a custom policy factory.
    pub fn with_factory(
        dimensions: Vec<Dimension>,
        maxiter: usize,
        minimize: bool,
        factory: OptimizerFactory,
    ) -> Self {
        Self {
            dimensions,
            factory,
            maxiter,
            minimize,
        }
    }
}

/// Exhaustive search over a uniform grid, remembering the best feedback.
///
/// Each `ask` subdivides the box a little further (1, 2, 4, ... points
/// per axis in a coarse-to-fine sweep); useful as a dependency-free
/// default policy and in tests.
#[derive(Debug)]
pub struct GridSearch {
    dims: Vec<Dimension>,
    step: usize,
    best: Option<(Vec<Value>, f64)>,
    last_asked: Vec<Value>,
}

impl GridSearch {
    /// A grid policy over `dims`.
    pub fn new(dims: &[Dimension]) -> Self {
        Self {
            dims: dims.to_vec(),
            step: 0,
            best: None,
            last_asked: vec![],
        }
    }

    fn point(&self, n: usize) -> Vec<Value> {
        // van der Corput style refinement: walk each axis through
        // midpoints of progressively halved intervals
        let mut t = 0.0;
        let mut denom = 1.0;
        let mut k = n + 1;
        while k > 0 {
            denom *= 2.0;
            t += (k % 2) as f64 / denom;
            k /= 2;
        }
        self.dims
            .iter()
            .map(|d| Value::Float(d.low + (d.high - d.low) * t))
            .collect()
    }
}

impl Optimizer for GridSearch {
    fn ask(&mut self) -> Vec<Value> {
        let p = self.point(self.step);
        self.step += 1;
        self.last_asked = p.clone();
        p
    }

    fn tell(&mut self, suggested: Vec<Value>, value: Value) {
        let Some(v) = value.as_f64() else { return };
        let better = match &self.best {
            Some((_, best)) => v < *best,
            None => true,
        };
        if better {
            self.best = Some((suggested, v));
        }
    }

    fn get_result(&self) -> OptimizeResult {
        match &self.best {
            Some((x, v)) => OptimizeResult {
                x: x.clone(),
                fun: Some(Value::Float(*v)),
            },
            None => OptimizeResult {
                x: if self.last_asked.is_empty() {
                    self.dims
                        .iter()
                        .map(|d| Value::Float((d.low + d.high) / 2.0))
                        .collect()
                } else {
                    self.last_asked.clone()
                },
                fun: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_tracks_best_feedback() {
        let dims = vec![Dimension::new("x", 0.0, 1.0)];
        let mut opt = GridSearch::new(&dims);
        for _ in 0..8 {
            let p = opt.ask();
            let x = p[0].as_f64().unwrap();
            // minimum at x = 0.25
            opt.tell(p, Value::Float((x - 0.25).abs()));
        }
        let best = opt.get_result();
        let x = best.x[0].as_f64().unwrap();
        assert!((x - 0.25).abs() < 0.2, "best x = {x}");
    }

    #[test]
    fn untold_grid_still_answers() {
        let dims = vec![Dimension::new("x", -1.0, 1.0)];
        let opt = GridSearch::new(&dims);
        assert_eq!(opt.get_result().x, vec![Value::Float(0.0)]);
    }
}
