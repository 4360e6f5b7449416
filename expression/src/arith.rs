//! Dynamic arithmetic over [`Value`]s: scalar promotion, complex numbers
//! and elementwise array broadcasting.

use data_types::{ArrayValue, Value};

use crate::{Error, Result};

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Int(_) => "int",
        Value::Float(_) => "float",
        Value::Complex { .. } => "complex",
        Value::Str(_) => "str",
        Value::Bytes(_) => "bytes",
        Value::Array(_) => "array",
        Value::Opaque(_) => "opaque",
    }
}

fn type_mismatch(op: &'static str, a: &Value, b: &Value) -> Error {
    Error::TypeMismatch {
        op,
        lhs: kind(a),
        rhs: kind(b),
    }
}

fn as_complex(v: &Value) -> Option<(f64, f64)> {
    match v {
        Value::Complex { re, im } => Some((*re, *im)),
        other => other.as_f64().map(|re| (re, 0.0)),
    }
}

/// `true` when both operands are integers, so integer ops stay integer.
fn both_int(a: &Value, b: &Value) -> Option<(i64, i64)> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some((*x, *y)),
        _ => None,
    }
}

fn complex_result(re: f64, im: f64) -> Value {
    if im == 0.0 {
        Value::Float(re)
    } else {
        Value::Complex { re, im }
    }
}

/// Apply `op` elementwise when either side is an array.
fn broadcast(
    op: &'static str,
    a: &Value,
    b: &Value,
    scalar: &dyn Fn(&Value, &Value) -> Result<Value>,
) -> Result<Value> {
    match (a, b) {
        (Value::Array(x), Value::Array(y)) => {
            if x.shape != y.shape {
                return Err(Error::ShapeMismatch {
                    lhs: x.shape.clone(),
                    rhs: y.shape.clone(),
                });
            }
            let data = x
                .data
                .iter()
                .zip(y.data.iter())
                .map(|(u, v)| scalar(u, v))
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::Array(ArrayValue {
                shape: x.shape.clone(),
                data,
            }))
        }
        (Value::Array(x), s) => {
            let data = x
                .data
                .iter()
                .map(|u| scalar(u, s))
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::Array(ArrayValue {
                shape: x.shape.clone(),
                data,
            }))
        }
        (s, Value::Array(y)) => {
            let data = y
                .data
                .iter()
                .map(|v| scalar(s, v))
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::Array(ArrayValue {
                shape: y.shape.clone(),
                data,
            }))
        }
        _ => Err(type_mismatch(op, a, b)),
    }
}

macro_rules! numeric_binop {
    ($name:ident, $opname:literal, $int:expr, $float:expr, $complex:expr) => {
        pub(crate) fn $name(a: &Value, b: &Value) -> Result<Value> {
            if let Some((x, y)) = both_int(a, b) {
                return $int(x, y);
            }
            match (as_complex(a), as_complex(b)) {
                (Some((ar, ai)), Some((br, bi))) => {
                    if ai == 0.0 && bi == 0.0 {
                        $float(ar, br)
                    } else {
                        $complex(ar, ai, br, bi)
                    }
                }
                _ => broadcast($opname, a, b, &|u, v| $name(u, v)),
            }
        }
    };
}

numeric_binop!(
    add,
    "add",
    |x: i64, y: i64| Ok(Value::Int(x.wrapping_add(y))),
    |x: f64, y: f64| Ok(Value::Float(x + y)),
    |ar: f64, ai: f64, br: f64, bi: f64| Ok(complex_result(ar + br, ai + bi))
);

numeric_binop!(
    sub,
    "sub",
    |x: i64, y: i64| Ok(Value::Int(x.wrapping_sub(y))),
    |x: f64, y: f64| Ok(Value::Float(x - y)),
    |ar: f64, ai: f64, br: f64, bi: f64| Ok(complex_result(ar - br, ai - bi))
);

numeric_binop!(
    mul,
    "mul",
    |x: i64, y: i64| Ok(Value::Int(x.wrapping_mul(y))),
    |x: f64, y: f64| Ok(Value::Float(x * y)),
    |ar: f64, ai: f64, br: f64, bi: f64| Ok(complex_result(
        ar * br - ai * bi,
        ar * bi + ai * br
    ))
);

pub(crate) fn div(a: &Value, b: &Value) -> Result<Value> {
    match (as_complex(a), as_complex(b)) {
        (Some((ar, ai)), Some((br, bi))) => {
            let denom = br * br + bi * bi;
            if denom == 0.0 {
                return Err(Error::DivisionByZero);
            }
            Ok(complex_result(
                (ar * br + ai * bi) / denom,
                (ai * br - ar * bi) / denom,
            ))
        }
        _ => broadcast("div", a, b, &div),
    }
}

pub(crate) fn floordiv(a: &Value, b: &Value) -> Result<Value> {
    if let Some((x, y)) = both_int(a, b) {
        if y == 0 {
            return Err(Error::DivisionByZero);
        }
        return Ok(Value::Int(x.div_euclid(y)));
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => {
            if y == 0.0 {
                return Err(Error::DivisionByZero);
            }
            Ok(Value::Float((x / y).floor()))
        }
        _ => broadcast("floordiv", a, b, &floordiv),
    }
}

pub(crate) fn rem(a: &Value, b: &Value) -> Result<Value> {
    if let Some((x, y)) = both_int(a, b) {
        if y == 0 {
            return Err(Error::DivisionByZero);
        }
        return Ok(Value::Int(x.rem_euclid(y)));
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => {
            if y == 0.0 {
                return Err(Error::DivisionByZero);
            }
            Ok(Value::Float(x.rem_euclid(y)))
        }
        _ => broadcast("rem", a, b, &rem),
    }
}

pub(crate) fn pow(a: &Value, b: &Value) -> Result<Value> {
    if let Some((x, y)) = both_int(a, b) {
        if y >= 0 {
            return Ok(Value::Int(x.wrapping_pow(y.min(u32::MAX as i64) as u32)));
        }
        // negative integer exponents leave the integers
        return Ok(Value::Float((x as f64).powi(y as i32)));
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Ok(Value::Float(x.powf(y))),
        _ => broadcast("pow", a, b, &pow),
    }
}

/// Compare two values, `None` for incomparable kinds.
fn partial_cmp(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => x.partial_cmp(y),
        _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
    }
}

pub(crate) fn compare(op: &'static str, a: &Value, b: &Value) -> Result<Value> {
    use std::cmp::Ordering::*;
    if matches!(op, "eq" | "ne") {
        let eq = match partial_cmp(a, b) {
            Some(Equal) => true,
            Some(_) => false,
            None => a == b,
        };
        return Ok(Value::Bool(if op == "eq" { eq } else { !eq }));
    }
    let ord = partial_cmp(a, b).ok_or_else(|| type_mismatch(op, a, b))?;
    let r = match op {
        "lt" => ord == Less,
        "le" => ord != Greater,
        "gt" => ord == Greater,
        "ge" => ord != Less,
        _ => unreachable!("not a comparison: {op}"),
    };
    Ok(Value::Bool(r))
}

pub(crate) fn neg(a: &Value) -> Result<Value> {
    match a {
        Value::Int(x) => Ok(Value::Int(-x)),
        Value::Float(x) => Ok(Value::Float(-x)),
        Value::Complex { re, im } => Ok(Value::Complex { re: -re, im: -im }),
        Value::Array(x) => {
            let data = x.data.iter().map(neg).collect::<Result<Vec<_>>>()?;
            Ok(Value::Array(ArrayValue {
                shape: x.shape.clone(),
                data,
            }))
        }
        other => Err(type_mismatch("neg", other, &Value::Null)),
    }
}

pub(crate) fn abs(a: &Value) -> Result<Value> {
    match a {
        Value::Int(x) => Ok(Value::Int(x.abs())),
        Value::Float(x) => Ok(Value::Float(x.abs())),
        Value::Complex { re, im } => Ok(Value::Float(re.hypot(*im))),
        Value::Array(x) => {
            let data = x.data.iter().map(abs).collect::<Result<Vec<_>>>()?;
            Ok(Value::Array(ArrayValue {
                shape: x.shape.clone(),
                data,
            }))
        }
        other => Err(type_mismatch("abs", other, &Value::Null)),
    }
}

/// Apply a float function elementwise, promoting ints.
pub(crate) fn map_float(name: &str, f: fn(f64) -> f64, v: &Value) -> Result<Value> {
    match v {
        Value::Array(x) => {
            let data = x
                .data
                .iter()
                .map(|u| map_float(name, f, u))
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::Array(ArrayValue {
                shape: x.shape.clone(),
                data,
            }))
        }
        other => match other.as_f64() {
            Some(x) => Ok(Value::Float(f(x))),
            None => Err(type_mismatch("call", other, &Value::Null)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn integer_ops_stay_integer() {
        assert_eq!(add(&Value::Int(2), &Value::Int(3)).unwrap(), Value::Int(5));
        assert_eq!(
            pow(&Value::Int(2), &Value::Int(10)).unwrap(),
            Value::Int(1024)
        );
        assert_eq!(
            floordiv(&Value::Int(7), &Value::Int(2)).unwrap(),
            Value::Int(3)
        );
    }

    #[test]
    fn mixed_ops_promote_to_float() {
        assert_eq!(
            mul(&Value::Int(2), &Value::Float(1.5)).unwrap(),
            Value::Float(3.0)
        );
    }

    #[test]
    fn complex_division() {
        let i = Value::Complex { re: 0.0, im: 1.0 };
        assert_eq!(div(&i, &i).unwrap(), Value::Float(1.0));
        assert_matches!(div(&i, &Value::Int(0)), Err(Error::DivisionByZero));
    }

    #[test]
    fn array_scalar_broadcast() {
        let a: Value = vec![0.0, 1.0, 2.0].into();
        let r = mul(&a, &Value::Int(2)).unwrap();
        assert_eq!(r, vec![0.0, 2.0, 4.0].into());
    }

    #[test]
    fn array_shape_mismatch() {
        let a: Value = vec![0.0, 1.0].into();
        let b: Value = vec![0.0, 1.0, 2.0].into();
        assert_matches!(add(&a, &b), Err(Error::ShapeMismatch { .. }));
    }

    #[test]
    fn comparisons() {
        assert_eq!(
            compare("lt", &Value::Int(1), &Value::Float(1.5)).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            compare("eq", &Value::Str("a".into()), &Value::Str("a".into())).unwrap(),
            Value::Bool(true)
        );
        assert_matches!(
            compare("lt", &Value::Str("a".into()), &Value::Int(1)),
            Err(Error::TypeMismatch { .. })
        );
    }
}
