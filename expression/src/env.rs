//! The name/value environment expressions are evaluated against.

use std::collections::HashMap;
use std::sync::Arc;

use data_types::Value;
use observability_deps::tracing::debug;

use crate::{arith, Error, Result};

/// A registered callable, applied to already-evaluated arguments.
pub type EnvFunction = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// What a name resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// A concrete value (const or variable).
    Value(Value),
    /// A registered function; not a value, only callable.
    Function,
}

/// Evaluation environment: constants, variables, reference chains and a
/// registry of allowed functions.
///
/// Constants reject writes. Reference chains are followed on read; a write
/// through a reference lands on the chain's root. Every successful write
/// bumps the written name's generation, which memoized expressions use for
/// invalidation.
pub struct Env {
    consts: HashMap<String, Value>,
    variables: HashMap<String, Value>,
    refs: HashMap<String, String>,
    functions: HashMap<String, EnvFunction>,
    generations: HashMap<String, u64>,
    counter: u64,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env")
            .field("consts", &self.consts.len())
            .field("variables", &self.variables.len())
            .field("refs", &self.refs)
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn float1(f: fn(f64) -> f64, name: &'static str) -> EnvFunction {
    Arc::new(move |args: &[Value]| {
        let [v] = args else {
            return Err(Error::WrongArity {
                name: name.to_string(),
                expected: 1,
                got: args.len(),
            });
        };
        arith::map_float(name, f, v)
    })
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

impl Env {
    /// A fresh environment with the builtin math functions and constants.
    pub fn new() -> Self {
        let mut functions: HashMap<String, EnvFunction> = HashMap::new();
        let builtins: [(&str, fn(f64) -> f64); 16] = [
            ("sin", f64::sin),
            ("cos", f64::cos),
            ("tan", f64::tan),
            ("sinh", f64::sinh),
            ("cosh", f64::cosh),
            ("tanh", f64::tanh),
            ("arcsin", f64::asin),
            ("arccos", f64::acos),
            ("arctan", f64::atan),
            ("exp", f64::exp),
            ("log", f64::ln),
            ("log2", f64::log2),
            ("log10", f64::log10),
            ("sqrt", f64::sqrt),
            ("sign", f64::signum),
            ("floor", f64::floor),
        ];
        for (name, f) in builtins {
            functions.insert(name.to_string(), float1(f, name));
        }
        functions.insert(
            "abs".to_string(),
            Arc::new(|args: &[Value]| {
                let [v] = args else {
                    return Err(Error::WrongArity {
                        name: "abs".into(),
                        expected: 1,
                        got: args.len(),
                    });
                };
                arith::abs(v)
            }),
        );

        let mut consts = HashMap::new();
        consts.insert("pi".to_string(), Value::Float(std::f64::consts::PI));
        consts.insert("e".to_string(), Value::Float(std::f64::consts::E));

        Self {
            consts,
            variables: HashMap::new(),
            refs: HashMap::new(),
            functions,
            generations: HashMap::new(),
            counter: 0,
        }
    }

    /// An environment seeded from a variable map.
    pub fn with_variables(vars: impl IntoIterator<Item = (String, Value)>) -> Self {
        let mut env = Self::new();
        for (k, v) in vars {
            // seeding cannot hit a const: the map is fresh
            env.set(&k, v).ok();
        }
        env
    }

    /// Follow a reference chain to its root name.
    fn root_of<'a>(&'a self, name: &'a str) -> &'a str {
        let mut cur = name;
        while let Some(next) = self.refs.get(cur) {
            cur = next;
        }
        cur
    }

    /// Resolve a name to its binding, following references.
    pub fn lookup(&self, name: &str) -> Option<Binding> {
        let root = self.root_of(name);
        if let Some(v) = self.consts.get(root) {
            return Some(Binding::Value(v.clone()));
        }
        if let Some(v) = self.variables.get(root) {
            return Some(Binding::Value(v.clone()));
        }
        if self.functions.contains_key(root) {
            return Some(Binding::Function);
        }
        None
    }

    /// Resolve a name to its value, following references.
    pub fn get(&self, name: &str) -> Option<Value> {
        match self.lookup(name)? {
            Binding::Value(v) => Some(v),
            Binding::Function => None,
        }
    }

    /// Whether the name resolves to anything.
    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Whether the name (after reference resolution) is const.
    pub fn is_const(&self, name: &str) -> bool {
        self.consts.contains_key(self.root_of(name))
    }

    /// The registered function for `name`, if any.
    pub fn function(&self, name: &str) -> Option<&EnvFunction> {
        self.functions.get(self.root_of(name))
    }

    /// Register an additional function.
    pub fn register_function(&mut self, name: impl Into<String>, f: EnvFunction) {
        self.functions.insert(name.into(), f);
    }

    /// Bind a const; later writes to the name fail.
    pub fn set_const(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        self.bump(&name);
        self.consts.insert(name, value.into());
    }

    /// Write a variable, following reference chains to their root.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let root = self.root_of(name).to_string();
        if self.consts.contains_key(&root) {
            return Err(Error::AssignToConst(root));
        }
        self.bump(&root);
        self.variables.insert(root, value.into());
        Ok(())
    }

    /// Remove a variable binding.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        let root = self.root_of(name).to_string();
        if self.consts.contains_key(&root) {
            return Err(Error::AssignToConst(root));
        }
        self.bump(&root);
        self.variables.remove(&root);
        Ok(())
    }

    /// Make `alias` a reference to `target`. Reference cycles are refused.
    pub fn create_ref(&mut self, alias: impl Into<String>, target: impl Into<String>) {
        let alias = alias.into();
        let target = target.into();
        if self.root_of(&target) == alias {
            debug!(%alias, %target, "refusing to create reference cycle");
            return;
        }
        self.bump(&alias);
        self.refs.insert(alias, target);
    }

    fn bump(&mut self, name: &str) {
        self.counter += 1;
        self.generations.insert(name.to_string(), self.counter);
    }

    /// Generation stamp of a name (0 if never written).
    pub fn generation(&self, name: &str) -> u64 {
        self.generations
            .get(self.root_of(name))
            .copied()
            .unwrap_or(0)
    }
}
