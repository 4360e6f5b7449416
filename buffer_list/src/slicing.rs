//! Slice normalization and entry filtering.
//!
//! All arithmetic happens in dense index space: outer axis `i` runs over
//! `0..rd[i]-lu[i]`, inner axes over their `inner_shape` lengths. A
//! request is normalized into one forward range per axis plus flags for
//! axes that collapse (integer index) or reverse (negative step); the
//! collapse/reverse pass runs after materialization.

use data_types::{SliceOp, SliceSpec};

use crate::{Error, Result};

/// One normalized axis: a forward `start..stop` range with positive step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NormOp {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
    pub contract: bool,
    pub reversed: bool,
}

impl NormOp {
    pub(crate) fn full(len: usize) -> Self {
        Self {
            start: 0,
            stop: len as i64,
            step: 1,
            contract: false,
            reversed: false,
        }
    }

    /// Output-axis length of this range over an axis of length `len`.
    pub(crate) fn out_len(&self) -> usize {
        if self.stop <= self.start {
            0
        } else {
            ((self.stop - self.start + self.step - 1) / self.step) as usize
        }
    }

    /// Whether dense index `j` survives, and its output index.
    pub(crate) fn project(&self, j: usize) -> Option<usize> {
        let j = j as i64;
        if j < self.start || j >= self.stop || (j - self.start) % self.step != 0 {
            return None;
        }
        Some(((j - self.start) / self.step) as usize)
    }
}

/// Normalize a request against the buffer's axis lengths.
///
/// Integer indexes are bound-checked (an out-of-range index is an error);
/// out-of-range *slices* simply clamp to empty. Negative outer steps turn
/// into the equivalent forward range plus a `reversed` flag.
pub(crate) fn normalize(spec: &SliceSpec, axis_lens: &[usize]) -> Result<Vec<NormOp>> {
    let ndim = axis_lens.len();
    let ops = spec.expand(ndim);
    if ops.len() != ndim {
        return Err(Error::DimensionMismatch {
            expected: ndim,
            got: ops.len(),
        });
    }

    ops.iter()
        .zip(axis_lens)
        .enumerate()
        .map(|(axis, (op, &len))| normalize_axis(axis, *op, len as i64))
        .collect()
}

fn normalize_axis(axis: usize, op: SliceOp, n: i64) -> Result<NormOp> {
    match op {
        SliceOp::Ellipsis => unreachable!("expanded before normalization"),
        SliceOp::Index(raw) => {
            let j = if raw < 0 { raw + n } else { raw };
            if j < 0 || j >= n {
                return Err(Error::IndexOutOfBounds {
                    axis,
                    index: raw,
                    len: n as usize,
                });
            }
            Ok(NormOp {
                start: j,
                stop: j + 1,
                step: 1,
                contract: true,
                reversed: false,
            })
        }
        SliceOp::Range { start, stop, step } => {
            let step = step.unwrap_or(1);
            if step == 0 {
                return Err(Error::ZeroStep { axis });
            }
            if step > 0 {
                let start = resolve(start.unwrap_or(0), n).clamp(0, n);
                let stop = resolve(stop.unwrap_or(n), n).clamp(0, n);
                Ok(NormOp {
                    start,
                    stop,
                    step,
                    contract: false,
                    reversed: false,
                })
            } else {
                // a[start:stop:-k] walks down from start to stop+1; express
                // it as the forward range over the same members, reversed
                // after materialization
                let k = -step;
                let start = resolve(start.unwrap_or(n - 1), n).min(n - 1);
                let stop = resolve(stop.unwrap_or(-n - 1), n).max(-1);
                if start < 0 || start <= stop {
                    return Ok(NormOp {
                        start: 0,
                        stop: 0,
                        step: k,
                        contract: false,
                        reversed: true,
                    });
                }
                let lowest = start - k * ((start - (stop + 1)) / k);
                Ok(NormOp {
                    start: lowest,
                    stop: start + 1,
                    step: k,
                    contract: false,
                    reversed: true,
                })
            }
        }
    }
}

fn resolve(v: i64, n: i64) -> i64 {
    if v < 0 {
        v + n
    } else {
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: Option<i64>, stop: Option<i64>, step: Option<i64>) -> SliceOp {
        SliceOp::Range { start, stop, step }
    }

    #[test]
    fn forward_range_over_short_axis_clamps() {
        let op = normalize_axis(0, range(Some(1), Some(100), Some(2)), 5).unwrap();
        assert_eq!((op.start, op.stop, op.step), (1, 5, 2));
        assert_eq!(op.out_len(), 2);
        assert_eq!(op.project(3), Some(1));
        assert_eq!(op.project(2), None);
    }

    #[test]
    fn negative_bounds_resolve_from_the_end() {
        let op = normalize_axis(0, range(Some(-3), None, None), 5).unwrap();
        assert_eq!((op.start, op.stop), (2, 5));
    }

    #[test]
    fn negative_step_matches_numpy_members() {
        // a[4:0:-2] over n=5 -> indices 4, 2
        let op = normalize_axis(0, range(Some(4), Some(0), Some(-2)), 5).unwrap();
        assert!(op.reversed);
        assert_eq!((op.start, op.stop, op.step), (2, 5, 2));
        assert_eq!(op.out_len(), 2);

        // a[::-1] -> all, reversed
        let op = normalize_axis(0, range(None, None, Some(-1)), 4).unwrap();
        assert_eq!((op.start, op.stop, op.step), (0, 4, 1));
        assert!(op.reversed);
    }

    #[test]
    fn empty_negative_range() {
        let op = normalize_axis(0, range(Some(0), Some(3), Some(-1)), 5).unwrap();
        assert_eq!(op.out_len(), 0);
    }

    #[test]
    fn index_bounds() {
        let op = normalize_axis(0, SliceOp::Index(-1), 4).unwrap();
        assert!(op.contract);
        assert_eq!(op.start, 3);
        assert!(normalize_axis(0, SliceOp::Index(4), 4).is_err());
        assert!(normalize_axis(0, SliceOp::Index(-5), 4).is_err());
    }

    #[test]
    fn spec_expansion_checks_dimensions() {
        let spec = SliceSpec(vec![SliceOp::Index(0); 3]);
        assert!(normalize(&spec, &[4, 4]).is_err());
    }
}
