//! Append-only, sparsely indexed N-dimensional buffers.
//!
//! A `BufferList` collects `(position, value)` pairs as a scan fills a
//! variable, keeps the bounding box of everything appended, and can at
//! any moment materialize a dense array (NaN where nothing landed yet) or
//! answer a sliced read. Entries are batched in memory and flushed to an
//! append-only chunk file; readers see the flushed prefix plus the
//! current batch.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::sync::Arc;

use data_types::{ArrayValue, SliceSpec, Value};
use ndarray::ArrayD;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub use chunk_store::{Entry, EntryFile};

mod dense;
mod slicing;

use dense::Dense;
use slicing::NormOp;

/// Entries buffered in memory before a flush.
const FLUSH_THRESHOLD: usize = 1000;

/// Errors raised by buffer operations.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("index {index} out of bounds on axis {axis} of length {len}"))]
    IndexOutOfBounds { axis: usize, index: i64, len: usize },

    #[snafu(display("slice has {got} axes, buffer has {expected}"))]
    DimensionMismatch { expected: usize, got: usize },

    #[snafu(display("slice step must be nonzero on axis {axis}"))]
    ZeroStep { axis: usize },

    #[snafu(display("chunk file error: {source}"))]
    Chunk { source: chunk_store::Error },

    #[snafu(display("remote buffer read failed: {source}"))]
    Remote {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Result alias for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Serializable buffer summary stored in record headers: where the chunk
/// file lives (relative to the data root) and the bounds so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferHeader {
    /// Relative chunk-file path, if file-backed.
    pub file: Option<String>,
    /// Lower outer bounds.
    pub lu: Vec<usize>,
    /// Upper outer bounds, exclusive.
    pub rd: Vec<usize>,
    /// Shape of each value; empty for scalar or heterogeneous rows,
    /// `None` before the first append.
    pub inner_shape: Option<Vec<usize>>,
}

/// Read-side access to a buffer that lives in another process.
pub trait EntrySource: Send + Sync + std::fmt::Debug {
    /// All entries surviving `slice`, with inner axes already narrowed.
    fn fetch(
        &self,
        slice: Option<&SliceSpec>,
    ) -> std::result::Result<Vec<Entry>, Box<dyn std::error::Error + Send + Sync>>;
}

#[derive(Debug)]
enum Backing {
    /// In-process only; the batch is the storage and never flushes.
    Cache,
    /// Backed by an append-only chunk file.
    File(EntryFile),
    /// All reads go through a remote source.
    Remote(Arc<dyn EntrySource>),
}

#[derive(Debug, Default)]
struct State {
    lu: Vec<usize>,
    rd: Vec<usize>,
    inner_shape: Option<Vec<usize>>,
    batch: Vec<Entry>,
    deleted: bool,
}

/// See the crate docs.
#[derive(Debug)]
pub struct BufferList {
    backing: Backing,
    state: Mutex<State>,
}

impl BufferList {
    /// An in-process buffer with no persistence.
    pub fn cache() -> Self {
        Self {
            backing: Backing::Cache,
            state: Mutex::new(State::default()),
        }
    }

    /// A buffer flushing to `file`.
    pub fn file(file: EntryFile) -> Self {
        Self {
            backing: Backing::File(file),
            state: Mutex::new(State::default()),
        }
    }

    /// Reopen a buffer from its header; `file` must already point at the
    /// resolved absolute chunk path when the header names one.
    pub fn from_header(header: &BufferHeader, file: Option<EntryFile>) -> Self {
        let backing = match file {
            Some(f) => Backing::File(f),
            None => Backing::Cache,
        };
        Self {
            backing,
            state: Mutex::new(State {
                lu: header.lu.clone(),
                rd: header.rd.clone(),
                inner_shape: header.inner_shape.clone(),
                batch: vec![],
                deleted: false,
            }),
        }
    }

    /// An in-process buffer preloaded with entries read from elsewhere
    /// (an export archive, a wire reply).
    pub fn from_entries(header: &BufferHeader, entries: Vec<Entry>) -> Self {
        Self {
            backing: Backing::Cache,
            state: Mutex::new(State {
                lu: header.lu.clone(),
                rd: header.rd.clone(),
                inner_shape: header.inner_shape.clone(),
                batch: entries,
                deleted: false,
            }),
        }
    }

    /// A remote view: bounds from the header, entries from `source`.
    pub fn remote(header: &BufferHeader, source: Arc<dyn EntrySource>) -> Self {
        Self {
            backing: Backing::Remote(source),
            state: Mutex::new(State {
                lu: header.lu.clone(),
                rd: header.rd.clone(),
                inner_shape: header.inner_shape.clone(),
                batch: vec![],
                deleted: false,
            }),
        }
    }

    /// The chunk file, when file-backed.
    pub fn chunk_file(&self) -> Option<&EntryFile> {
        match &self.backing {
            Backing::File(f) => Some(f),
            _ => None,
        }
    }

    /// Snapshot for a record header. `file` is filled by the caller,
    /// which knows the path's data-root-relative form.
    pub fn header(&self, file: Option<String>) -> BufferHeader {
        let s = self.state.lock();
        BufferHeader {
            file,
            lu: s.lu.clone(),
            rd: s.rd.clone(),
            inner_shape: s.inner_shape.clone(),
        }
    }

    /// Lower outer bounds.
    pub fn lu(&self) -> Vec<usize> {
        self.state.lock().lu.clone()
    }

    /// Upper outer bounds, exclusive.
    pub fn rd(&self) -> Vec<usize> {
        self.state.lock().rd.clone()
    }

    /// `(rd - lu) + inner_shape`.
    pub fn shape(&self) -> Vec<usize> {
        let s = self.state.lock();
        let mut shape: Vec<usize> = s.lu.iter().zip(&s.rd).map(|(l, r)| r - l).collect();
        shape.extend(s.inner_shape.iter().flatten().copied());
        shape
    }

    /// Append a value at an outer position.
    ///
    /// With `dims`, `pos` is the full scan position and the value belongs
    /// only to the listed axes: entries outside them must sit at 0 or the
    /// call is a no-op, and `pos` is projected onto `dims` before use.
    pub fn append(&self, pos: &[usize], value: Value, dims: Option<&[usize]>) -> Result<()> {
        let pos: Vec<usize> = match dims {
            Some(dims) => {
                if pos
                    .iter()
                    .enumerate()
                    .any(|(i, p)| !dims.contains(&i) && *p != 0)
                {
                    return Ok(());
                }
                dims.iter().map(|&i| pos.get(i).copied().unwrap_or(0)).collect()
            }
            None => pos.to_vec(),
        };

        let mut s = self.state.lock();
        if s.lu.len() != pos.len() {
            s.lu = pos.clone();
            s.rd = pos.iter().map(|p| p + 1).collect();
        } else {
            for (i, p) in pos.iter().enumerate() {
                s.lu[i] = s.lu[i].min(*p);
                s.rd[i] = s.rd[i].max(p + 1);
            }
        }

        let new_shape: Vec<usize> = value.shape().map(|sh| sh.to_vec()).unwrap_or_default();
        match &mut s.inner_shape {
            None => s.inner_shape = Some(new_shape),
            Some(cur) if *cur != new_shape => {
                // heterogeneous rows: store values whole from here on
                *cur = vec![];
            }
            Some(_) => {}
        }

        s.batch.push((pos, value));
        if s.batch.len() >= FLUSH_THRESHOLD {
            Self::flush_locked(&self.backing, &mut s)?;
        }
        Ok(())
    }

    fn flush_locked(backing: &Backing, s: &mut State) -> Result<()> {
        if s.deleted || s.batch.is_empty() {
            return Ok(());
        }
        if let Backing::File(f) = backing {
            f.append_batch(&s.batch).context(ChunkSnafu)?;
            s.batch.clear();
        }
        Ok(())
    }

    /// Flush the in-memory batch to the chunk file. Idempotent; a no-op
    /// for cache and remote buffers.
    pub fn flush(&self) -> Result<()> {
        let mut s = self.state.lock();
        Self::flush_locked(&self.backing, &mut s)
    }

    /// Unlink the chunk file and drop buffered entries.
    pub fn delete(&self) -> Result<()> {
        let mut s = self.state.lock();
        s.deleted = true;
        s.batch.clear();
        if let Backing::File(f) = &self.backing {
            f.delete().context(ChunkSnafu)?;
        }
        Ok(())
    }

    fn axis_lens(s: &State) -> Vec<usize> {
        let mut lens: Vec<usize> = s.lu.iter().zip(&s.rd).map(|(l, r)| r - l).collect();
        lens.extend(s.inner_shape.iter().flatten().copied());
        lens
    }

    fn local_entries(&self, s: &State, norm: Option<&[NormOp]>) -> Result<Vec<Entry>> {
        let stored = match &self.backing {
            Backing::File(f) => f.read_all().context(ChunkSnafu)?,
            _ => vec![],
        };
        let all = stored.into_iter().chain(s.batch.iter().cloned());

        let Some(norm) = norm else {
            return Ok(all.collect());
        };
        let outer = s.lu.len();
        let inner_norm = &norm[outer..];
        let mut out = vec![];
        'entry: for (pos, value) in all {
            for (i, op) in norm[..outer].iter().enumerate() {
                let j = pos[i].saturating_sub(s.lu[i]);
                if op.project(j).is_none() {
                    continue 'entry;
                }
            }
            let value = if inner_norm.is_empty() {
                value
            } else {
                gather_inner(&value, inner_norm)
            };
            out.push((pos, value));
        }
        Ok(out)
    }

    /// All stored entries in append order, optionally narrowed by a
    /// slice: positions outside it are dropped, and when the value shape
    /// is known the trailing slice axes narrow each value.
    pub fn entries(&self, slice: Option<&SliceSpec>) -> Result<Vec<Entry>> {
        if let Backing::Remote(source) = &self.backing {
            return source.fetch(slice).context(RemoteSnafu);
        }
        let s = self.state.lock();
        let norm = match slice {
            Some(spec) => Some(slicing::normalize(spec, &Self::axis_lens(&s))?),
            None => None,
        };
        self.local_entries(&s, norm.as_deref())
    }

    /// The values of every entry, in append order.
    pub fn values(&self) -> Result<Vec<Value>> {
        Ok(self.entries(None)?.into_iter().map(|(_, v)| v).collect())
    }

    /// The positions of every entry, in append order.
    pub fn positions(&self) -> Result<Vec<Vec<usize>>> {
        Ok(self.entries(None)?.into_iter().map(|(p, _)| p).collect())
    }

    /// Materialize the dense array over the current bounds, NaN where no
    /// entry landed. Duplicate positions resolve last-wins.
    pub fn array(&self) -> Result<ArrayD<Value>> {
        let (norm, entries, lu) = {
            let s = self.state.lock();
            let lens = Self::axis_lens(&s);
            let norm: Vec<NormOp> = lens.iter().map(|&n| NormOp::full(n)).collect();
            if let Backing::Remote(source) = &self.backing {
                let entries = source.fetch(None).context(RemoteSnafu)?;
                (norm, entries, s.lu.clone())
            } else {
                let entries = self.local_entries(&s, None)?;
                (norm, entries, s.lu.clone())
            }
        };
        Ok(assemble(&norm, lu.len(), &lu, entries).into_ndarray())
    }

    /// Sliced dense read (`buffer[spec]`): integer indexes collapse their
    /// axes, negative outer steps reverse after materialization, and an
    /// out-of-range slice yields an empty result.
    pub fn get(&self, spec: &SliceSpec) -> Result<ArrayD<Value>> {
        let (norm, entries, lu, outer) = {
            let s = self.state.lock();
            let norm = slicing::normalize(spec, &Self::axis_lens(&s))?;
            let outer = s.lu.len();
            if let Backing::Remote(source) = &self.backing {
                let entries = source.fetch(Some(spec)).context(RemoteSnafu)?;
                (norm, entries, s.lu.clone(), outer)
            } else {
                let entries = self.local_entries(&s, Some(&norm))?;
                (norm, entries, s.lu.clone(), outer)
            }
        };
        let dense = assemble(&norm, outer, &lu, entries);
        Ok(dense.contract_and_reverse(&norm).into_ndarray())
    }
}

/// Narrow a value's axes by the inner part of a normalized slice.
/// Reversal and contraction are postponed to the dense pass.
fn gather_inner(value: &Value, inner: &[NormOp]) -> Value {
    let Value::Array(a) = value else {
        return value.clone();
    };
    if a.shape.len() != inner.len() {
        return value.clone();
    }
    let out_shape: Vec<usize> = inner.iter().map(NormOp::out_len).collect();
    let total: usize = out_shape.iter().product();
    let mut data = Vec::with_capacity(total);
    let mut out_idx = vec![0usize; out_shape.len()];
    for flat in 0..total {
        let mut rem = flat;
        for (slot, n) in out_idx.iter_mut().zip(&out_shape).rev() {
            *slot = rem % n;
            rem /= n;
        }
        let mut off = 0;
        for (axis, op) in inner.iter().enumerate() {
            let src = (op.start + out_idx[axis] as i64 * op.step) as usize;
            off = off * a.shape[axis] + src;
        }
        data.push(a.data[off].clone());
    }
    Value::Array(ArrayValue {
        shape: out_shape,
        data,
    })
}

/// Place entries into the dense array described by `norm`.
fn assemble(norm: &[NormOp], outer: usize, lu: &[usize], entries: Vec<Entry>) -> Dense {
    let shape: Vec<usize> = norm.iter().map(NormOp::out_len).collect();
    let mut dense = Dense::new(shape.clone());
    let inner_dims = &shape[outer..];
    let inner_total: usize = inner_dims.iter().product();

    for (pos, value) in entries {
        let mut idx = Vec::with_capacity(norm.len());
        let mut ok = true;
        for (i, op) in norm[..outer].iter().enumerate() {
            let j = pos.get(i).map_or(0, |p| p.saturating_sub(lu[i]));
            match op.project(j) {
                Some(o) => idx.push(o),
                None => {
                    ok = false;
                    break;
                }
            }
        }
        if !ok {
            continue;
        }
        match (&value, inner_dims.is_empty()) {
            (Value::Array(a), false) if a.data.len() == inner_total => {
                let mut inner_idx = vec![0usize; inner_dims.len()];
                for (flat, v) in a.data.iter().enumerate() {
                    let mut rem = flat;
                    for (slot, n) in inner_idx.iter_mut().zip(inner_dims).rev() {
                        *slot = rem % n;
                        rem /= n;
                    }
                    let mut full = idx.clone();
                    full.extend(inner_idx.iter().copied());
                    dense.set(&full, v.clone());
                }
            }
            _ => {
                let mut full = idx;
                full.extend(std::iter::repeat(0).take(inner_dims.len()));
                dense.set(&full, value);
            }
        }
    }
    dense
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use data_types::SliceOp;

    fn spec(ops: Vec<SliceOp>) -> SliceSpec {
        SliceSpec(ops)
    }

    fn range(start: Option<i64>, stop: Option<i64>, step: Option<i64>) -> SliceOp {
        SliceOp::Range { start, stop, step }
    }

    fn floats(a: &ArrayD<Value>) -> Vec<f64> {
        a.iter().map(|v| v.as_f64().unwrap()).collect()
    }

    #[test]
    fn append_iter_round_trip() {
        let dir = test_helpers::tmp_dir().unwrap();
        let bl = BufferList::file(EntryFile::create_under(dir.path()).unwrap());
        for i in 0..5usize {
            bl.append(&[i], Value::Float(i as f64 * 10.0), None).unwrap();
        }
        let entries = bl.entries(None).unwrap();
        assert_eq!(entries.len(), 5);
        for (i, (pos, v)) in entries.iter().enumerate() {
            assert_eq!(pos, &vec![i]);
            assert_eq!(v.as_f64(), Some(i as f64 * 10.0));
        }

        let a = bl.array().unwrap();
        assert_eq!(a.shape(), &[5]);
        assert_eq!(floats(&a), vec![0.0, 10.0, 20.0, 30.0, 40.0]);
    }

    #[test]
    fn flush_is_idempotent_and_readers_see_batch() {
        let dir = test_helpers::tmp_dir().unwrap();
        let file = EntryFile::create_under(dir.path()).unwrap();
        let bl = BufferList::file(file.clone());
        bl.append(&[0], Value::Int(1), None).unwrap();

        // unflushed: file empty, entries still complete
        assert!(file.read_all().unwrap().is_empty());
        assert_eq!(bl.entries(None).unwrap().len(), 1);

        bl.flush().unwrap();
        bl.flush().unwrap();
        assert_eq!(file.read_all().unwrap().len(), 1);
        assert_eq!(bl.entries(None).unwrap().len(), 1);
    }

    #[test]
    fn out_of_order_appends_materialize_densely() {
        let bl = BufferList::cache();
        bl.append(&[0], Value::Int(1), None).unwrap();
        bl.append(&[2], Value::Int(3), None).unwrap();
        bl.append(&[1], Value::Int(2), None).unwrap();

        let a = bl.array().unwrap();
        assert_eq!(floats(&a), vec![1.0, 2.0, 3.0]);
        assert!(!a.iter().any(|v| v.is_nan()));
    }

    #[test]
    fn unwritten_positions_are_nan() {
        let bl = BufferList::cache();
        bl.append(&[0], Value::Float(1.0), None).unwrap();
        bl.append(&[3], Value::Float(4.0), None).unwrap();
        let a = bl.array().unwrap();
        assert_eq!(a.shape(), &[4]);
        assert!(a[[1]].is_nan());
        assert!(a[[2]].is_nan());
    }

    #[test]
    fn duplicate_positions_are_last_wins() {
        let bl = BufferList::cache();
        bl.append(&[0], Value::Int(1), None).unwrap();
        bl.append(&[0], Value::Int(9), None).unwrap();
        assert_eq!(bl.entries(None).unwrap().len(), 2);
        assert_eq!(bl.array().unwrap()[[0]], Value::Int(9));
    }

    #[test]
    fn nonzero_origin_offsets_indices() {
        let bl = BufferList::cache();
        bl.append(&[3], Value::Int(30), None).unwrap();
        bl.append(&[5], Value::Int(50), None).unwrap();
        assert_eq!(bl.lu(), vec![3]);
        assert_eq!(bl.rd(), vec![6]);
        let a = bl.array().unwrap();
        assert_eq!(a.shape(), &[3]);
        assert_eq!(a[[0]], Value::Int(30));
        assert!(a[[1]].is_nan());
        assert_eq!(a[[2]], Value::Int(50));
    }

    fn two_d() -> BufferList {
        // A[i][j] = 10*i + j over 3x4
        let bl = BufferList::cache();
        for i in 0..3usize {
            for j in 0..4usize {
                bl.append(&[i, j], Value::Int((10 * i + j) as i64), None)
                    .unwrap();
            }
        }
        bl
    }

    #[test]
    fn slicing_matches_dense_indexing() {
        let bl = two_d();

        // A[1:, ::2]
        let a = bl
            .get(&spec(vec![
                range(Some(1), None, None),
                range(None, None, Some(2)),
            ]))
            .unwrap();
        assert_eq!(a.shape(), &[2, 2]);
        assert_eq!(floats(&a), vec![10.0, 12.0, 20.0, 22.0]);

        // A[0] collapses the first axis
        let a = bl.get(&spec(vec![SliceOp::Index(0)])).unwrap();
        assert_eq!(a.shape(), &[4]);
        assert_eq!(floats(&a), vec![0.0, 1.0, 2.0, 3.0]);

        // A[-1, -1]
        let a = bl
            .get(&spec(vec![SliceOp::Index(-1), SliceOp::Index(-1)]))
            .unwrap();
        assert_eq!(a.shape(), &[] as &[usize]);
        assert_eq!(floats(&a), vec![23.0]);
    }

    #[test]
    fn negative_step_reverses_outer_axis() {
        let bl = two_d();
        // A[::-1, 0]
        let a = bl
            .get(&spec(vec![range(None, None, Some(-1)), SliceOp::Index(0)]))
            .unwrap();
        assert_eq!(floats(&a), vec![20.0, 10.0, 0.0]);

        // A[2:0:-1, 1]
        let a = bl
            .get(&spec(vec![
                range(Some(2), Some(0), Some(-1)),
                SliceOp::Index(1),
            ]))
            .unwrap();
        assert_eq!(floats(&a), vec![21.0, 11.0]);
    }

    #[test]
    fn out_of_bound_slice_is_empty_not_an_error() {
        let bl = two_d();
        let a = bl
            .get(&spec(vec![range(Some(10), Some(20), None), SliceOp::Ellipsis]))
            .unwrap();
        assert_eq!(a.shape(), &[0, 4]);
    }

    #[test]
    fn out_of_bound_index_is_an_error() {
        let bl = two_d();
        assert_matches!(
            bl.get(&spec(vec![SliceOp::Index(7)])),
            Err(Error::IndexOutOfBounds { axis: 0, .. })
        );
    }

    #[test]
    fn inner_axes_are_sliced_through_values() {
        let bl = BufferList::cache();
        for i in 0..2usize {
            let row: Vec<Value> = (0..4).map(|j| Value::Int((10 * i + j) as i64)).collect();
            bl.append(&[i], Value::Array(ArrayValue::vector(row)), None)
                .unwrap();
        }
        assert_eq!(bl.shape(), vec![2, 4]);

        // entries narrowed on the inner axis
        let entries = bl
            .entries(Some(&spec(vec![
                range(None, None, None),
                range(Some(1), Some(3), None),
            ])))
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[1].1,
            Value::Array(ArrayValue::vector(vec![Value::Int(11), Value::Int(12)]))
        );

        // dense sliced read across outer and inner axes
        let a = bl
            .get(&spec(vec![SliceOp::Index(1), range(Some(1), Some(3), None)]))
            .unwrap();
        assert_eq!(floats(&a), vec![11.0, 12.0]);
    }

    #[test]
    fn heterogeneous_values_downgrade_inner_shape() {
        let bl = BufferList::cache();
        bl.append(&[0], Value::Array(ArrayValue::vector(vec![Value::Int(1); 3])), None)
            .unwrap();
        assert_eq!(bl.shape(), vec![1, 3]);

        bl.append(&[1], Value::Int(5), None).unwrap();
        // rows are objects now: no inner axes
        assert_eq!(bl.shape(), vec![2]);
        let a = bl.array().unwrap();
        assert_eq!(a.shape(), &[2]);
        assert_matches!(&a[[0]], Value::Array(_));
        assert_eq!(a[[1]], Value::Int(5));
    }

    #[test]
    fn dims_projection_rules() {
        // variable varies over axis 0 only, scan has two levels
        let bl = BufferList::cache();
        bl.append(&[1, 0], Value::Int(10), Some(&[0])).unwrap();
        // inner level moved on: not this variable's turn, call is a no-op
        bl.append(&[1, 1], Value::Int(99), Some(&[0])).unwrap();
        bl.append(&[2, 0], Value::Int(20), Some(&[0])).unwrap();

        let entries = bl.entries(None).unwrap();
        assert_eq!(
            entries,
            vec![(vec![1], Value::Int(10)), (vec![2], Value::Int(20))]
        );
    }

    #[test]
    fn delete_then_flush_is_a_no_op() {
        let dir = test_helpers::tmp_dir().unwrap();
        let file = EntryFile::create_under(dir.path()).unwrap();
        let bl = BufferList::file(file.clone());
        bl.append(&[0], Value::Int(1), None).unwrap();
        bl.flush().unwrap();
        assert!(file.path().exists());

        bl.delete().unwrap();
        assert!(!file.path().exists());
        bl.flush().unwrap();
        assert!(!file.path().exists());
    }

    #[test]
    fn header_round_trip_reopens_bounds() {
        let dir = test_helpers::tmp_dir().unwrap();
        let file = EntryFile::create_under(dir.path()).unwrap();
        let bl = BufferList::file(file.clone());
        bl.append(&[2], Value::Float(1.5), None).unwrap();
        bl.flush().unwrap();

        let header = bl.header(Some(chunk_store::relative_path(file.path())));
        assert_eq!(header.lu, vec![2]);
        assert_eq!(header.rd, vec![3]);

        let reopened = BufferList::from_header(&header, Some(file));
        assert_eq!(reopened.entries(None).unwrap().len(), 1);
        assert_eq!(reopened.lu(), vec![2]);
    }

    #[derive(Debug)]
    struct CannedSource(Vec<Entry>);

    impl EntrySource for CannedSource {
        fn fetch(
            &self,
            _slice: Option<&SliceSpec>,
        ) -> std::result::Result<Vec<Entry>, Box<dyn std::error::Error + Send + Sync>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn remote_buffer_reads_through_its_source() {
        let header = BufferHeader {
            file: None,
            lu: vec![0],
            rd: vec![2],
            inner_shape: Some(vec![]),
        };
        let source = Arc::new(CannedSource(vec![
            (vec![0], Value::Int(5)),
            (vec![1], Value::Int(6)),
        ]));
        let bl = BufferList::remote(&header, source);
        assert_eq!(floats(&bl.array().unwrap()), vec![5.0, 6.0]);
    }
}
