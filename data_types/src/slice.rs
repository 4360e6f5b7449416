//! Slice descriptors exchanged between readers and the recorder.
//!
//! The wire form deliberately mirrors the reader-side indexing surface:
//! per-axis ranges with optional bounds/step, bare integer indexes that
//! collapse an axis, and an ellipsis filling the untouched middle axes.

use serde::{Deserialize, Serialize};

/// One axis of a slice request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SliceOp {
    /// `start..stop` with a stride; `None` bounds mean "from the edge".
    Range {
        /// Inclusive start, negative counts from the upper bound.
        start: Option<i64>,
        /// Exclusive stop, negative counts from the upper bound.
        stop: Option<i64>,
        /// Stride; negative reverses the axis.
        step: Option<i64>,
    },
    /// A single index, collapsing the axis.
    Index(i64),
    /// Expands to full ranges over all axes not otherwise named.
    Ellipsis,
}

impl SliceOp {
    /// The full, unbounded range over one axis.
    pub fn full() -> Self {
        Self::Range {
            start: None,
            stop: None,
            step: None,
        }
    }
}

/// A multi-axis slice request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SliceSpec(pub Vec<SliceOp>);

impl SliceSpec {
    /// The everything slice.
    pub fn all() -> Self {
        Self(vec![SliceOp::Ellipsis])
    }

    /// Expand any ellipsis so the spec has exactly `ndim` axis entries.
    ///
    /// A spec longer than `ndim` is returned unchanged; the consumer
    /// reports the dimensionality error with its own context.
    pub fn expand(&self, ndim: usize) -> Vec<SliceOp> {
        let ellipsis_at = self.0.iter().position(|s| matches!(s, SliceOp::Ellipsis));
        let explicit = self
            .0
            .iter()
            .filter(|s| !matches!(s, SliceOp::Ellipsis))
            .count();
        match ellipsis_at {
            Some(at) if explicit <= ndim => {
                let mut out = Vec::with_capacity(ndim);
                out.extend(self.0[..at].iter().copied());
                out.extend(std::iter::repeat(SliceOp::full()).take(ndim - explicit));
                out.extend(self.0[at + 1..].iter().filter(|s| !matches!(s, SliceOp::Ellipsis)).copied());
                out
            }
            _ => {
                let mut out: Vec<SliceOp> = self.0.clone();
                while out.len() < ndim {
                    out.push(SliceOp::full());
                }
                out
            }
        }
    }
}

impl From<Vec<SliceOp>> for SliceSpec {
    fn from(v: Vec<SliceOp>) -> Self {
        Self(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_pads_missing_axes() {
        let s = SliceSpec(vec![SliceOp::Index(1)]);
        let full = s.expand(3);
        assert_eq!(full.len(), 3);
        assert_eq!(full[0], SliceOp::Index(1));
        assert_eq!(full[1], SliceOp::full());
    }

    #[test]
    fn expand_fills_ellipsis_in_the_middle() {
        let s = SliceSpec(vec![SliceOp::Index(0), SliceOp::Ellipsis, SliceOp::Index(-1)]);
        let full = s.expand(4);
        assert_eq!(
            full,
            vec![
                SliceOp::Index(0),
                SliceOp::full(),
                SliceOp::full(),
                SliceOp::Index(-1),
            ]
        );
    }

    #[test]
    fn expand_of_bare_ellipsis_is_all_axes() {
        assert_eq!(SliceSpec::all().expand(2), vec![SliceOp::full(); 2]);
    }
}
