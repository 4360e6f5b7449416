//! The dynamic value bag carried through scans, records and the wire.
//!
//! Steps bind heterogeneous values (scalars, arrays, user blobs); this is
//! the tagged sum they travel in. Opaque payloads are only interpreted at
//! the application boundary.

use observability_deps::tracing::warn;
use serde::{Deserialize, Serialize};

/// A single dynamic value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Absent / not-a-value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Double-precision float.
    Float(f64),
    /// Complex number as a `(re, im)` pair.
    Complex {
        /// Real part.
        re: f64,
        /// Imaginary part.
        im: f64,
    },
    /// UTF-8 string.
    Str(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// N-dimensional array.
    Array(ArrayValue),
    /// Serialized user object, passed through untouched.
    Opaque(Vec<u8>),
}

impl Value {
    /// A float NaN, the fill value for unwritten dense positions.
    pub fn nan() -> Self {
        Self::Float(f64::NAN)
    }

    /// Whether this is a float NaN (the dense-array fill marker).
    pub fn is_nan(&self) -> bool {
        matches!(self, Self::Float(v) if v.is_nan())
    }

    /// Numeric view of scalar values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(*b as u8 as f64),
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer view, without silent truncation of floats.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Bool(b) => Some(*b as i64),
            Self::Int(v) => Some(*v),
            Self::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    /// Truthiness used by filters: zero, empty and null are false.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Int(v) => *v != 0,
            Self::Float(v) => *v != 0.0,
            Self::Complex { re, im } => *re != 0.0 || *im != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::Bytes(b) => !b.is_empty(),
            Self::Array(a) => !a.data.is_empty(),
            Self::Opaque(_) => true,
        }
    }

    /// Shape of the value: `None` for scalars, the array shape otherwise.
    pub fn shape(&self) -> Option<&[usize]> {
        match self {
            Self::Array(a) => Some(&a.shape),
            _ => None,
        }
    }

    /// Iterate the outermost axis of an array value, or yield the value
    /// itself once for scalars. Used when a loop binds over a value.
    pub fn outer_iter(&self) -> Box<dyn Iterator<Item = Value> + Send + '_> {
        match self {
            Self::Array(a) => Box::new(a.outer_iter()),
            other => Box::new(std::iter::once(other.clone())),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        if v > i64::MAX as usize {
            warn!(v, "usize value clamped to i64::MAX");
        }
        Self::Int(v.min(i64::MAX as usize) as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Self::Array(ArrayValue::vector(v.into_iter().map(Self::Float).collect()))
    }
}

impl From<Vec<i64>> for Value {
    fn from(v: Vec<i64>) -> Self {
        Self::Array(ArrayValue::vector(v.into_iter().map(Self::Int).collect()))
    }
}

impl From<ArrayValue> for Value {
    fn from(v: ArrayValue) -> Self {
        Self::Array(v)
    }
}

/// An N-dimensional array of values in row-major order.
///
/// Invariant: `data.len() == shape.iter().product()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayValue {
    /// Per-axis lengths.
    pub shape: Vec<usize>,
    /// Row-major elements.
    pub data: Vec<Value>,
}

impl ArrayValue {
    /// Build an array, checking the shape/data invariant.
    pub fn new(shape: Vec<usize>, data: Vec<Value>) -> Option<Self> {
        (shape.iter().product::<usize>() == data.len()).then(|| Self { shape, data })
    }

    /// A one-dimensional array over `data`.
    pub fn vector(data: Vec<Value>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    /// Number of entries along the outermost axis.
    pub fn outer_len(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Iterate the outermost axis, yielding scalars for 1-D arrays and
    /// sub-arrays otherwise.
    pub fn outer_iter(&self) -> impl Iterator<Item = Value> + Send + '_ {
        let stride: usize = self.shape.iter().skip(1).product();
        let inner_shape: Vec<usize> = self.shape.iter().skip(1).copied().collect();
        (0..self.outer_len()).map(move |i| {
            if inner_shape.is_empty() {
                self.data[i].clone()
            } else {
                Value::Array(Self {
                    shape: inner_shape.clone(),
                    data: self.data[i * stride..(i + 1) * stride].to_vec(),
                })
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_views() {
        assert_eq!(Value::Int(3).as_f64(), Some(3.0));
        assert_eq!(Value::Float(2.5).as_i64(), None);
        assert_eq!(Value::Float(2.0).as_i64(), Some(2));
        assert_eq!(Value::Str("x".into()).as_f64(), None);
        assert!(Value::nan().is_nan());
        assert!(!Value::Int(0).is_nan());
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::Float(0.5).is_truthy());
        assert!(!Value::Str(String::new()).is_truthy());
        assert!(Value::Complex { re: 0.0, im: 1.0 }.is_truthy());
    }

    #[test]
    fn array_invariant() {
        assert!(ArrayValue::new(vec![2, 3], vec![Value::Int(0); 6]).is_some());
        assert!(ArrayValue::new(vec![2, 3], vec![Value::Int(0); 5]).is_none());
    }

    #[test]
    fn outer_iter_of_vector_yields_scalars() {
        let v: Value = vec![1.0, 2.0, 3.0].into();
        let items: Vec<_> = v.outer_iter().collect();
        assert_eq!(
            items,
            vec![Value::Float(1.0), Value::Float(2.0), Value::Float(3.0)]
        );
    }

    #[test]
    fn outer_iter_of_matrix_yields_rows() {
        let a = ArrayValue::new(vec![2, 2], (0..4).map(Value::Int).collect()).unwrap();
        let rows: Vec<_> = Value::Array(a).outer_iter().collect();
        assert_eq!(
            rows[1],
            Value::Array(ArrayValue::vector(vec![Value::Int(2), Value::Int(3)]))
        );
    }

    #[test]
    fn scalar_outer_iter_is_single() {
        assert_eq!(Value::Int(7).outer_iter().count(), 1);
    }
}
