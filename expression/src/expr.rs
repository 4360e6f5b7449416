//! The expression tree and its evaluation rules.

use std::fmt::Display;

use data_types::Value;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{arith, Binding, Env, Error, Result};

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum UnaryOp {
    Neg,
    Abs,
    Not,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Rem,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    fn name(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::FloorDiv => "floordiv",
            Self::Rem => "rem",
            Self::Pow => "pow",
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Lt => "lt",
            Self::Le => "le",
            Self::Gt => "gt",
            Self::Ge => "ge",
            Self::And => "and",
            Self::Or => "or",
        }
    }
}

/// A symbolic expression.
///
/// Leaves are literals, free symbols, or dotted cross-references into the
/// config tree. Inner nodes are operator applications and method calls.
/// Construction applies the cheap algebraic identities (`0 + x -> x`,
/// `1 * x -> x`, `x ** 0 -> 1`, ...); nothing else is evaluated until
/// [`Expr::eval`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// A literal value.
    Const(Value),
    /// A free name, resolved against the environment.
    Symbol(String),
    /// A dotted cross-reference (config-tree lookup).
    Query(String),
    /// Unary operator application.
    Unary(UnaryOp, Box<Expr>),
    /// Binary operator application.
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// Method call on an object expression; `__call__` applies registered
    /// functions, `__getitem__` indexes arrays.
    Method {
        /// Receiver.
        obj: Box<Expr>,
        /// Method name.
        name: String,
        /// Evaluated arguments.
        args: Vec<Expr>,
    },
}

fn num_eq(e: &Expr, n: f64) -> bool {
    match e {
        Expr::Const(v) => v.as_f64() == Some(n),
        _ => false,
    }
}

impl Expr {
    /// A literal expression.
    pub fn constant(v: impl Into<Value>) -> Self {
        Self::Const(v.into())
    }

    /// A free symbol.
    pub fn symbol(name: impl Into<String>) -> Self {
        Self::Symbol(name.into())
    }

    /// A config-tree cross reference.
    pub fn query(name: impl Into<String>) -> Self {
        Self::Query(name.into())
    }

    /// Apply a unary operator.
    pub fn unary(op: UnaryOp, a: Self) -> Self {
        match (op, &a) {
            // --x -> x
            (UnaryOp::Neg, Self::Unary(UnaryOp::Neg, inner)) => (**inner).clone(),
            _ => Self::Unary(op, Box::new(a)),
        }
    }

    /// Apply a binary operator, folding the identity cases.
    pub fn binary(op: BinaryOp, a: Self, b: Self) -> Self {
        use BinaryOp::*;
        match op {
            Add if num_eq(&a, 0.0) => return b,
            Add | Sub if num_eq(&b, 0.0) => return a,
            Sub if num_eq(&a, 0.0) => return Self::unary(UnaryOp::Neg, b),
            Mul if num_eq(&a, 0.0) || num_eq(&b, 0.0) => return Self::constant(0),
            Mul if num_eq(&a, 1.0) => return b,
            Mul | Div if num_eq(&b, 1.0) => return a,
            Div | FloorDiv if num_eq(&a, 0.0) => return Self::constant(0),
            Rem if num_eq(&b, 1.0) => return Self::constant(0),
            Pow if num_eq(&b, 0.0) => return Self::constant(1),
            Pow if num_eq(&b, 1.0) => return a,
            Pow if num_eq(&a, 0.0) => return Self::constant(0),
            _ => {}
        }
        Self::Binary(op, Box::new(a), Box::new(b))
    }

    /// Raise to a power.
    pub fn pow(self, rhs: impl Into<Self>) -> Self {
        Self::binary(BinaryOp::Pow, self, rhs.into())
    }

    /// Call this expression (it must resolve to a registered function).
    pub fn call(self, args: impl IntoIterator<Item = Self>) -> Self {
        Self::Method {
            obj: Box::new(self),
            name: "__call__".to_string(),
            args: args.into_iter().collect(),
        }
    }

    /// Index this expression (`__getitem__`).
    pub fn index(self, idx: impl Into<Self>) -> Self {
        Self::Method {
            obj: Box::new(self),
            name: "__getitem__".to_string(),
            args: vec![idx.into()],
        }
    }

    /// Comparison helper (no `std::ops` for comparisons).
    pub fn cmp_op(self, op: BinaryOp, rhs: impl Into<Self>) -> Self {
        Self::binary(op, self, rhs.into())
    }

    /// The free symbol names reachable from this node.
    pub fn symbols(&self) -> Vec<String> {
        let mut out = vec![];
        self.collect_symbols(&mut out);
        out
    }

    fn collect_symbols(&self, out: &mut Vec<String>) {
        match self {
            Self::Const(_) => {}
            Self::Symbol(name) | Self::Query(name) => {
                if !out.iter().any(|n| n == name) {
                    out.push(name.clone());
                }
            }
            Self::Unary(_, a) => a.collect_symbols(out),
            Self::Binary(_, a, b) => {
                a.collect_symbols(out);
                b.collect_symbols(out);
            }
            Self::Method { obj, args, .. } => {
                obj.collect_symbols(out);
                for a in args {
                    a.collect_symbols(out);
                }
            }
        }
    }

    /// One-shot partial evaluation: every bound symbol is substituted and
    /// every closed subtree folded. Returns [`Expr::Const`] when nothing
    /// stays free.
    pub fn eval(&self, env: &Env) -> Result<Self> {
        match self {
            Self::Const(_) => Ok(self.clone()),
            Self::Symbol(name) | Self::Query(name) => match env.lookup(name) {
                Some(Binding::Value(v)) => Ok(Self::Const(v)),
                // functions are not values: stay symbolic until called
                Some(Binding::Function) | None => Ok(self.clone()),
            },
            Self::Unary(op, a) => {
                let a = a.eval(env)?;
                match &a {
                    Self::Const(v) => {
                        let r = match op {
                            UnaryOp::Neg => arith::neg(v)?,
                            UnaryOp::Abs => arith::abs(v)?,
                            UnaryOp::Not => Value::Bool(!v.is_truthy()),
                        };
                        Ok(Self::Const(r))
                    }
                    _ => Ok(Self::Unary(*op, Box::new(a))),
                }
            }
            Self::Binary(op, a, b) => {
                let a = a.eval(env)?;
                let b = b.eval(env)?;
                match (&a, &b) {
                    (Self::Const(x), Self::Const(y)) => {
                        Ok(Self::Const(apply_binary(*op, x, y)?))
                    }
                    _ => Ok(Self::Binary(*op, Box::new(a), Box::new(b))),
                }
            }
            Self::Method { obj, name, args } => {
                let obj_e = obj.eval(env)?;
                let args_e = args
                    .iter()
                    .map(|a| a.eval(env))
                    .collect::<Result<Vec<_>>>()?;
                let all_const = args_e.iter().all(|a| matches!(a, Self::Const(_)));

                if name == "__call__" {
                    if let Self::Symbol(fname) = &obj_e {
                        if let Some(f) = env.function(fname) {
                            if all_const {
                                let vals: Vec<Value> = args_e
                                    .iter()
                                    .map(|a| match a {
                                        Self::Const(v) => v.clone(),
                                        _ => unreachable!(),
                                    })
                                    .collect();
                                return Ok(Self::Const(f(&vals)?));
                            }
                        } else if all_const {
                            return Err(Error::UnknownFunction(fname.clone()));
                        }
                    }
                } else if let (Self::Const(recv), true) = (&obj_e, all_const) {
                    let vals: Vec<Value> = args_e
                        .iter()
                        .map(|a| match a {
                            Self::Const(v) => v.clone(),
                            _ => unreachable!(),
                        })
                        .collect();
                    return Ok(Self::Const(apply_method(recv, name, &vals)?));
                }

                Ok(Self::Method {
                    obj: Box::new(obj_e),
                    name: name.clone(),
                    args: args_e,
                })
            }
        }
    }

    /// Evaluate to a concrete value; free symbols are an error.
    pub fn value(&self, env: &Env) -> Result<Value> {
        match self.eval(env)? {
            Self::Const(v) => Ok(v),
            residual => {
                let free: Vec<String> = residual
                    .symbols()
                    .into_iter()
                    .filter(|s| env.function(s).is_none())
                    .collect();
                Err(Error::UnresolvedSymbols(free))
            }
        }
    }

    /// Symbolic first derivative with respect to `x`. Non-differentiable
    /// nodes contribute zero, as the scan only needs the arithmetic rules.
    pub fn derivative(&self, x: &str) -> Self {
        use BinaryOp::*;
        match self {
            Self::Const(_) | Self::Query(_) => Self::constant(0),
            Self::Symbol(name) => {
                Self::constant(if name == x { 1 } else { 0 })
            }
            Self::Unary(UnaryOp::Neg, a) => {
                Self::unary(UnaryOp::Neg, a.derivative(x))
            }
            Self::Unary(..) => Self::constant(0),
            Self::Binary(Add, a, b) => {
                Self::binary(Add, a.derivative(x), b.derivative(x))
            }
            Self::Binary(Sub, a, b) => {
                Self::binary(Sub, a.derivative(x), b.derivative(x))
            }
            Self::Binary(Mul, a, b) => {
                let da_b = Self::binary(Mul, a.derivative(x), (**b).clone());
                let a_db = Self::binary(Mul, (**a).clone(), b.derivative(x));
                Self::binary(Add, da_b, a_db)
            }
            Self::Binary(Div, a, b) => {
                let da_b = Self::binary(Mul, a.derivative(x), (**b).clone());
                let a_db = Self::binary(Mul, (**a).clone(), b.derivative(x));
                let num = Self::binary(Sub, da_b, a_db);
                let den = (**b).clone().pow(Self::constant(2));
                Self::binary(Div, num, den)
            }
            Self::Binary(Pow, a, b) => match (&**a, &**b) {
                // x ** c rule when the exponent is constant
                (_, Self::Const(_)) => {
                    let bm1 = Self::binary(Sub, (**b).clone(), Self::constant(1));
                    let inner = Self::binary(Mul, (**b).clone(), (**a).clone().pow(bm1));
                    Self::binary(Mul, inner, a.derivative(x))
                }
                _ => Self::constant(0),
            },
            Self::Binary(..) | Self::Method { .. } => Self::constant(0),
        }
    }
}

fn apply_binary(op: BinaryOp, a: &Value, b: &Value) -> Result<Value> {
    use BinaryOp::*;
    match op {
        Add => arith::add(a, b),
        Sub => arith::sub(a, b),
        Mul => arith::mul(a, b),
        Div => arith::div(a, b),
        FloorDiv => arith::floordiv(a, b),
        Rem => arith::rem(a, b),
        Pow => arith::pow(a, b),
        Eq | Ne | Lt | Le | Gt | Ge => arith::compare(op.name(), a, b),
        And => Ok(Value::Bool(a.is_truthy() && b.is_truthy())),
        Or => Ok(Value::Bool(a.is_truthy() || b.is_truthy())),
    }
}

fn apply_method(recv: &Value, name: &str, args: &[Value]) -> Result<Value> {
    match (recv, name) {
        (Value::Array(a), "__getitem__") => {
            let [idx] = args else {
                return Err(Error::WrongArity {
                    name: "__getitem__".into(),
                    expected: 1,
                    got: args.len(),
                });
            };
            let Some(i) = idx.as_i64() else {
                return Err(Error::UnknownMethod {
                    method: name.to_string(),
                    receiver: "array",
                });
            };
            let len = a.outer_len() as i64;
            let i = if i < 0 { i + len } else { i };
            if i < 0 || i >= len {
                return Err(Error::IndexOutOfBounds {
                    index: i,
                    len: len as usize,
                });
            }
            a.outer_iter()
                .nth(i as usize)
                .ok_or(Error::IndexOutOfBounds {
                    index: i,
                    len: len as usize,
                })
        }
        (Value::Array(a), "len") => Ok(Value::Int(a.outer_len() as i64)),
        (Value::Str(s), "len") => Ok(Value::Int(s.len() as i64)),
        (Value::Complex { re, .. }, "re") => Ok(Value::Float(*re)),
        (Value::Complex { im, .. }, "im") => Ok(Value::Float(*im)),
        _ => Err(Error::UnknownMethod {
            method: name.to_string(),
            receiver: "value",
        }),
    }
}

impl From<Value> for Expr {
    fn from(v: Value) -> Self {
        Self::Const(v)
    }
}

impl From<f64> for Expr {
    fn from(v: f64) -> Self {
        Self::constant(v)
    }
}

impl From<i64> for Expr {
    fn from(v: i64) -> Self {
        Self::constant(v)
    }
}

impl From<i32> for Expr {
    fn from(v: i32) -> Self {
        Self::constant(v)
    }
}

macro_rules! std_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<T: Into<Expr>> std::ops::$trait<T> for Expr {
            type Output = Expr;

            fn $method(self, rhs: T) -> Expr {
                Expr::binary($op, self, rhs.into())
            }
        }
    };
}

std_op!(Add, add, BinaryOp::Add);
std_op!(Sub, sub, BinaryOp::Sub);
std_op!(Mul, mul, BinaryOp::Mul);
std_op!(Div, div, BinaryOp::Div);
std_op!(Rem, rem, BinaryOp::Rem);

impl std::ops::Neg for Expr {
    type Output = Self;

    fn neg(self) -> Self {
        Self::unary(UnaryOp::Neg, self)
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Const(v) => write!(f, "{v:?}"),
            Self::Symbol(s) => write!(f, "{s}"),
            Self::Query(q) => write!(f, ".{q}"),
            Self::Unary(op, a) => write!(f, "{op:?}({a})"),
            Self::Binary(op, a, b) => write!(f, "({a} {} {b})", op.name()),
            Self::Method { obj, name, args } => {
                let args = args
                    .iter()
                    .map(|a| a.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                if name == "__call__" {
                    write!(f, "{obj}({args})")
                } else {
                    write!(f, "{obj}.{name}({args})")
                }
            }
        }
    }
}

/// An expression plus a memoized result, invalidated when any symbol it
/// depends on changes generation in the environment.
pub struct MemoizedExpr {
    expr: Expr,
    symbols: Vec<String>,
    cache: Mutex<Option<(Vec<u64>, Value)>>,
}

impl std::fmt::Debug for MemoizedExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoizedExpr")
            .field("expr", &self.expr)
            .finish()
    }
}

impl MemoizedExpr {
    /// Wrap an expression for repeated evaluation.
    pub fn new(expr: Expr) -> Self {
        let symbols = expr.symbols();
        Self {
            expr,
            symbols,
            cache: Mutex::new(None),
        }
    }

    /// The wrapped expression.
    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Evaluate, reusing the cached value while no dependency changed.
    pub fn value(&self, env: &Env) -> Result<Value> {
        let gens: Vec<u64> = self.symbols.iter().map(|s| env.generation(s)).collect();
        if let Some((cached_gens, v)) = &*self.cache.lock() {
            if *cached_gens == gens {
                return Ok(v.clone());
            }
        }
        let v = self.expr.value(env)?;
        *self.cache.lock() = Some((gens, v.clone()));
        Ok(v)
    }
}

impl From<Expr> for MemoizedExpr {
    fn from(expr: Expr) -> Self {
        Self::new(expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn sym(s: &str) -> Expr {
        Expr::symbol(s)
    }

    #[test]
    fn identities_fold_at_construction() {
        let x = sym("x");
        assert_eq!(Expr::constant(0) + x.clone(), x);
        assert_eq!(x.clone() * 1.0, x);
        assert_eq!(x.clone() * 0, Expr::constant(0));
        assert_eq!(x.clone().pow(0), Expr::constant(1));
        assert_eq!(x.clone().pow(1), x);
        assert_eq!(x.clone() % 1, Expr::constant(0));
        assert_eq!(-(-x.clone()), x);
    }

    #[test]
    fn partial_eval_leaves_residual() {
        let e = sym("a") + sym("b");
        let mut env = Env::new();
        env.set("a", 1).unwrap();

        let r = e.eval(&env).unwrap();
        assert_eq!(r, Expr::constant(1) + sym("b"));
        assert_eq!(r.symbols(), vec!["b".to_string()]);

        env.set("b", 2).unwrap();
        assert_eq!(e.value(&env).unwrap(), Value::Int(3));
    }

    #[test]
    fn unresolved_value_is_an_error() {
        let e = sym("a") * sym("missing");
        let mut env = Env::new();
        env.set("a", 2).unwrap();
        assert_matches!(e.value(&env), Err(Error::UnresolvedSymbols(names)) => {
            assert_eq!(names, vec!["missing".to_string()]);
        });
    }

    #[test]
    fn division_by_zero_only_fails_at_eval() {
        let e = sym("a") / 0;
        let mut env = Env::new();
        env.set("a", 1).unwrap();
        assert_matches!(e.value(&env), Err(Error::DivisionByZero));
    }

    #[test]
    fn builtin_call() {
        let e = sym("sin").call([sym("x")]);
        let mut env = Env::new();
        env.set("x", 0.0).unwrap();
        assert_eq!(e.value(&env).unwrap(), Value::Float(0.0));
    }

    #[test]
    fn unknown_function_call_fails() {
        let e = sym("frobnicate").call([Expr::constant(1)]);
        let env = Env::new();
        assert_matches!(e.value(&env), Err(Error::UnknownFunction(_)));
    }

    #[test]
    fn array_indexing() {
        let arr: Value = vec![10.0, 20.0, 30.0].into();
        let e = Expr::constant(arr).index(Expr::constant(-1));
        assert_eq!(e.value(&Env::new()).unwrap(), Value::Float(30.0));
    }

    #[test]
    fn array_index_out_of_bounds() {
        let arr: Value = vec![10.0].into();
        let e = Expr::constant(arr).index(Expr::constant(5));
        assert_matches!(e.value(&Env::new()), Err(Error::IndexOutOfBounds { .. }));
    }

    #[test]
    fn derivative_of_polynomial() {
        // d/dx (x^2 + 3x) = 2x + 3
        let e = sym("x").pow(2) + sym("x") * 3;
        let d = e.derivative("x");

        let mut env = Env::new();
        env.set("x", 5.0).unwrap();
        assert_eq!(d.value(&env).unwrap().as_f64(), Some(13.0));
    }

    #[test]
    fn memoized_value_tracks_generations() {
        let m = MemoizedExpr::new(sym("x") * 2);
        let mut env = Env::new();
        env.set("x", 1).unwrap();
        assert_eq!(m.value(&env).unwrap(), Value::Int(2));

        // unrelated write does not invalidate
        env.set("y", 9).unwrap();
        assert_eq!(m.value(&env).unwrap(), Value::Int(2));

        env.set("x", 3).unwrap();
        assert_eq!(m.value(&env).unwrap(), Value::Int(6));
    }

    #[test]
    fn query_resolves_like_a_symbol() {
        let e = Expr::query("setup.bias") + 1;
        let mut env = Env::new();
        assert_eq!(e.eval(&env).unwrap(), e);

        env.set("setup.bias", 0.5).unwrap();
        assert_eq!(e.value(&env).unwrap(), Value::Float(1.5));
    }

    #[test]
    fn comparison_ops() {
        let e = sym("a").cmp_op(BinaryOp::Lt, sym("b"));
        let mut env = Env::new();
        env.set("a", 1).unwrap();
        env.set("b", 2).unwrap();
        assert_eq!(e.value(&env).unwrap(), Value::Bool(true));
    }
}
