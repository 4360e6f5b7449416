//! Row-major dense scratch array used while materializing buffers.

use data_types::Value;
use ndarray::{ArrayD, IxDyn};

use crate::slicing::NormOp;

pub(crate) struct Dense {
    shape: Vec<usize>,
    data: Vec<Value>,
}

impl Dense {
    /// NaN-filled array of the given shape.
    pub(crate) fn new(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![Value::nan(); len],
        }
    }

    fn offset(&self, idx: &[usize]) -> usize {
        debug_assert_eq!(idx.len(), self.shape.len());
        let mut off = 0;
        for (i, n) in idx.iter().zip(&self.shape) {
            off = off * n + i;
        }
        off
    }

    /// Last write wins, matching duplicate-position semantics.
    pub(crate) fn set(&mut self, idx: &[usize], v: Value) {
        let off = self.offset(idx);
        self.data[off] = v;
    }

    /// Drop contracted axes (taking their only index) and mirror reversed
    /// axes, per the normalized request.
    pub(crate) fn contract_and_reverse(self, norm: &[NormOp]) -> Self {
        debug_assert_eq!(norm.len(), self.shape.len());
        let out_shape: Vec<usize> = self
            .shape
            .iter()
            .zip(norm)
            .filter(|(_, op)| !op.contract)
            .map(|(n, _)| *n)
            .collect();
        let mut out = Self::new(out_shape.clone());

        let mut out_idx = vec![0usize; out_shape.len()];
        let mut src_idx = vec![0usize; self.shape.len()];
        let total: usize = out_shape.iter().product();
        for flat in 0..total {
            // unravel flat -> out_idx
            let mut rem = flat;
            for (slot, n) in out_idx.iter_mut().zip(&out_shape).rev() {
                *slot = rem % n;
                rem /= n;
            }
            let mut k = 0;
            for (axis, op) in norm.iter().enumerate() {
                src_idx[axis] = if op.contract {
                    0
                } else {
                    let j = out_idx[k];
                    k += 1;
                    if op.reversed {
                        self.shape[axis] - 1 - j
                    } else {
                        j
                    }
                };
            }
            let v = self.data[self.offset(&src_idx)].clone();
            out.set(&out_idx, v);
        }
        out
    }

    pub(crate) fn into_ndarray(self) -> ArrayD<Value> {
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.data)
            .expect("shape/data invariant maintained internally")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full(len: usize) -> NormOp {
        NormOp::full(len)
    }

    #[test]
    fn set_and_read_back() {
        let mut d = Dense::new(vec![2, 3]);
        d.set(&[1, 2], Value::Int(7));
        let a = d.into_ndarray();
        assert_eq!(a[[1, 2]], Value::Int(7));
        assert!(a[[0, 0]].is_nan());
    }

    #[test]
    fn reverse_mirrors_an_axis() {
        let mut d = Dense::new(vec![3]);
        for i in 0..3 {
            d.set(&[i], Value::Int(i as i64));
        }
        let mut op = full(3);
        op.reversed = true;
        let a = d.contract_and_reverse(&[op]).into_ndarray();
        assert_eq!(
            a.iter().cloned().collect::<Vec<_>>(),
            vec![Value::Int(2), Value::Int(1), Value::Int(0)]
        );
    }

    #[test]
    fn contract_collapses_an_axis() {
        let mut d = Dense::new(vec![1, 2]);
        d.set(&[0, 0], Value::Int(1));
        d.set(&[0, 1], Value::Int(2));
        let mut c = full(1);
        c.contract = true;
        let a = d.contract_and_reverse(&[c, full(2)]).into_ndarray();
        assert_eq!(a.shape(), &[2]);
        assert_eq!(a[[0]], Value::Int(1));
    }
}
