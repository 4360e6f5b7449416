//! Serializable scan recipes for the submission server.
//!
//! Closures cannot cross a process boundary, so a submitted scan is
//! restricted to the declarative subset: constant values, expression
//! functions, concrete or expression loop sources and expression
//! filters. Anything richer runs in the submitting process instead.

use std::collections::BTreeMap;

use data_types::Value;
use expression::Expr;
use scan_iter::LoopSource;
use serde::{Deserialize, Serialize};

use crate::{Database, Scan};

/// One loop source a recipe can carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecipeSource {
    /// A fixed sequence.
    Values(Vec<Value>),
    /// An expression over outer names, evaluated to an array on entry.
    Expr(Expr),
}

/// One key group of a recipe level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeEntry {
    /// Names bound by this entry.
    pub keys: Vec<String>,
    /// Where its values come from.
    pub source: RecipeSource,
}

/// One nesting level of a recipe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecipeLevel {
    /// Parallel entries advancing in lockstep.
    pub entries: Vec<RecipeEntry>,
}

/// The declarative subset of a scan that survives serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRecipe {
    /// Application name.
    pub app: String,
    /// Catalog tags.
    pub tags: Vec<String>,
    /// Database parameter (`tcp://` URL or local path).
    pub database: String,
    /// Constants bound before the scan.
    pub constants: BTreeMap<String, Value>,
    /// Nesting levels, outermost first.
    pub loops: Vec<RecipeLevel>,
    /// Derived variables.
    pub functions: BTreeMap<String, Expr>,
    /// Step filters (truthiness of the expression).
    pub filters: Vec<Expr>,
}

impl ScanRecipe {
    /// A recipe writing to `database`.
    pub fn new(app: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            tags: vec![],
            database: database.into(),
            constants: BTreeMap::new(),
            loops: vec![],
            functions: BTreeMap::new(),
            filters: vec![],
        }
    }

    /// Rehydrate into a runnable scan.
    pub fn into_scan(self) -> Scan {
        let mut scan = Scan::with_database(&self.app, Database::parse(&self.database));
        for tag in self.tags {
            scan.tag(tag);
        }
        for (name, value) in self.constants {
            scan.set_const(name, value);
        }
        for (name, expr) in self.functions {
            scan.set(name, expr);
        }
        for (level, spec) in self.loops.into_iter().enumerate() {
            for entry in spec.entries {
                let source = match entry.source {
                    RecipeSource::Values(v) => LoopSource::Values(v),
                    RecipeSource::Expr(e) => LoopSource::Expr(e),
                };
                scan.loops
                    .entry(level as i64)
                    .or_default()
                    .push((entry.keys, source));
            }
        }
        for expr in self.filters {
            scan.add_filter_expr(-1, expr);
        }
        scan
    }
}
