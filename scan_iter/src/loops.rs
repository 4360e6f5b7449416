//! Loop and function declarations a scan is assembled from.

use std::collections::BTreeMap;
use std::sync::Arc;

use data_types::Value;
use expression::Expr;

use crate::optimizer::OptimizerConfig;

/// The variable bag bound at a step.
pub type Kwds = BTreeMap<String, Value>;

/// Fallible user callback result.
pub type UserResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// A user callable evaluated against the currently bound names.
pub type UserFn = Arc<dyn Fn(&Kwds) -> UserResult<Value> + Send + Sync>;

/// A user callable producing the values of one loop variable, re-invoked
/// with the current bindings every time its level is re-entered.
pub type GeneratorFn =
    Arc<dyn Fn(&Kwds) -> UserResult<Box<dyn Iterator<Item = Value> + Send>> + Send + Sync>;

/// A step predicate; steps it rejects are suppressed but still advance
/// the scan position.
pub type FilterFn = Arc<dyn Fn(&Kwds) -> bool + Send + Sync>;

/// Where one loop entry's values come from.
#[derive(Clone)]
pub enum LoopSource {
    /// A fixed, finite sequence.
    Values(Vec<Value>),
    /// An expression over outer names, evaluated to an array on entry.
    Expr(Expr),
    /// A callable re-materialized on every level entry. `deps` names the
    /// outer variables it reads (Rust cannot introspect the closure).
    Generator {
        /// Names the generator consumes.
        deps: Vec<String>,
        /// The generator itself.
        f: GeneratorFn,
    },
    /// An adaptive search policy driving this entry via ask/tell.
    Optimizer(OptimizerConfig),
}

impl std::fmt::Debug for LoopSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Values(v) => f.debug_tuple("Values").field(&v.len()).finish(),
            Self::Expr(e) => f.debug_tuple("Expr").field(e).finish(),
            Self::Generator { deps, .. } => f.debug_tuple("Generator").field(deps).finish(),
            Self::Optimizer(c) => f.debug_tuple("Optimizer").field(c).finish(),
        }
    }
}

impl LoopSource {
    /// A fixed sequence from anything convertible to values.
    pub fn values<T: Into<Value>>(vals: impl IntoIterator<Item = T>) -> Self {
        Self::Values(vals.into_iter().map(Into::into).collect())
    }

    /// `0..n` as integer values.
    pub fn range(n: usize) -> Self {
        Self::values((0..n as i64).collect::<Vec<_>>())
    }

    /// A generator closure with its declared dependencies.
    pub fn generator(
        deps: impl IntoIterator<Item = &'static str>,
        f: impl Fn(&Kwds) -> UserResult<Box<dyn Iterator<Item = Value> + Send>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self::Generator {
            deps: deps.into_iter().map(str::to_string).collect(),
            f: Arc::new(f),
        }
    }

    /// Number of steps this source will produce, when statically known.
    pub fn size_hint(&self) -> Option<usize> {
        match self {
            Self::Values(v) => Some(v.len()),
            Self::Optimizer(c) => Some(c.maxiter),
            Self::Expr(_) | Self::Generator { .. } => None,
        }
    }

    /// The outer names this source consumes.
    pub fn deps(&self) -> Vec<String> {
        match self {
            Self::Values(_) => vec![],
            Self::Expr(e) => e.symbols(),
            Self::Generator { deps, .. } => deps.clone(),
            Self::Optimizer(_) => vec![],
        }
    }
}

/// One key group of a loop level: the names it binds and their source.
///
/// A group with several names unpacks each produced value (an array of
/// matching outer length, or an optimizer coordinate of matching arity).
#[derive(Debug, Clone)]
pub struct LoopEntry {
    /// Names bound by this entry.
    pub keys: Vec<String>,
    /// Value source.
    pub source: LoopSource,
}

/// One nesting level: entries advance together in lockstep and the level
/// ends when the shortest entry ends.
#[derive(Debug, Clone, Default)]
pub struct LoopSpec {
    /// Parallel entries of the level.
    pub entries: Vec<LoopEntry>,
}

impl LoopSpec {
    /// A level binding a single name.
    pub fn single(key: impl Into<String>, source: LoopSource) -> Self {
        Self {
            entries: vec![LoopEntry {
                keys: vec![key.into()],
                source,
            }],
        }
    }

    /// A level advancing several entries in lockstep.
    pub fn zip(entries: impl IntoIterator<Item = (Vec<String>, LoopSource)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(keys, source)| LoopEntry { keys, source })
                .collect(),
        }
    }

    /// All names bound at this level.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .flat_map(|e| e.keys.iter().map(String::as_str))
    }

    /// Steps this level will take, when every entry is sized.
    pub fn size_hint(&self) -> Option<usize> {
        self.entries
            .iter()
            .map(|e| e.source.size_hint())
            .collect::<Option<Vec<_>>>()
            .map(|sizes| sizes.into_iter().min().unwrap_or(0))
    }
}

/// A derived variable: either an expression over other names, or an
/// opaque callable with declared dependencies.
#[derive(Clone)]
pub enum FunctionDef {
    /// Expression whose free symbols are the dependencies.
    Expr(Expr),
    /// User callable plus its declared dependencies.
    Callable {
        /// Names the callable consumes.
        deps: Vec<String>,
        /// The callable itself.
        f: UserFn,
    },
}

impl std::fmt::Debug for FunctionDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Expr(e) => f.debug_tuple("Expr").field(e).finish(),
            Self::Callable { deps, .. } => f.debug_tuple("Callable").field(deps).finish(),
        }
    }
}

impl FunctionDef {
    /// A callable with its declared dependencies.
    pub fn callable(
        deps: impl IntoIterator<Item = &'static str>,
        f: impl Fn(&Kwds) -> UserResult<Value> + Send + Sync + 'static,
    ) -> Self {
        Self::Callable {
            deps: deps.into_iter().map(str::to_string).collect(),
            f: Arc::new(f),
        }
    }

    /// The names this definition consumes.
    pub fn deps(&self) -> Vec<String> {
        match self {
            Self::Expr(e) => e.symbols(),
            Self::Callable { deps, .. } => deps.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_source_counts() {
        let s = LoopSource::range(3);
        assert_eq!(s.size_hint(), Some(3));
        assert!(s.deps().is_empty());
    }

    #[test]
    fn zip_level_size_is_shortest() {
        let spec = LoopSpec::zip([
            (vec!["a".to_string()], LoopSource::range(5)),
            (vec!["b".to_string()], LoopSource::range(3)),
        ]);
        assert_eq!(spec.size_hint(), Some(3));
        assert_eq!(spec.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn generator_level_size_is_unknown(){
        let spec = LoopSpec::single(
            "g",
            LoopSource::generator(["a"], |_| Ok(Box::new(std::iter::empty()))),
        );
        assert_eq!(spec.size_hint(), None);
    }
}
