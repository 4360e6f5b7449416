//! Shared data types used by the scan engine crates.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::collections::BTreeMap;
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod slice;
mod value;

pub use slice::{SliceOp, SliceSpec};
pub use value::{ArrayValue, Value};

/// Unique ID for a `Record` in the catalog.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type, Serialize, Deserialize,
)]
#[sqlx(transparent)]
pub struct RecordId(i64);

#[allow(missing_docs)]
impl RecordId {
    pub fn new(v: i64) -> Self {
        Self(v)
    }
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique ID for a running scan, assigned by the submitting process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScanId(Uuid);

impl ScanId {
    /// Mint a fresh scan ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn get(&self) -> Uuid {
        self.0
    }
}

impl Default for ScanId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ScanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One page row of a record listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRow {
    /// Record id.
    pub id: RecordId,
    /// Application name.
    pub app: String,
    /// Tags, sorted.
    pub tags: Vec<String>,
    /// Creation time.
    pub ctime: DateTime<Utc>,
}

/// Application names folded into a tree on `.` separators, for grouped
/// browsing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppTree(pub BTreeMap<String, AppTree>);

impl AppTree {
    /// Add one dotted application name to the tree.
    pub fn insert(&mut self, app: &str) {
        let mut node = self;
        for part in app.split('.') {
            node = node.0.entry(part.to_string()).or_default();
        }
    }
}

/// A record listing: total match count, the app tree over the matches,
/// and one page of rows (newest first).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordListing {
    /// Rows matching the filter, ignoring paging.
    pub total: i64,
    /// App-name tree over the matching records.
    pub apps: AppTree,
    /// The requested page, ordered by creation time descending.
    pub rows: Vec<QueryRow>,
}

/// Self-contained description of a scan, captured when its record is
/// created and stored in the record header.
///
/// `axis` maps every emitted variable name to the loop levels it varies
/// over; an empty tuple marks a scan-wide constant. `hidden` holds the
/// name patterns that were excluded from emission, so a record is
/// self-describing even if the runner's patterns change later.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordDescription {
    /// Application name, dotted for hierarchical grouping (e.g. `t1.rabi`).
    pub app: String,
    /// Free-form tags attached to the catalog row.
    pub tags: Vec<String>,
    /// Variable name -> loop levels it varies over.
    pub axis: BTreeMap<String, Vec<usize>>,
    /// Expected iteration count per level, when known.
    pub totals: BTreeMap<usize, Option<u64>>,
    /// Creation time, captured by the runner at scan start.
    pub ctime: Option<DateTime<Utc>>,
    /// The command line that started the scan.
    pub scripts: Vec<String>,
    /// Environment snapshot at scan start.
    pub env: BTreeMap<String, String>,
    /// Hidden-name patterns in effect when the record was created.
    pub hidden: Vec<String>,
}

impl RecordDescription {
    /// A minimal description carrying only the application name.
    pub fn new(app: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_id_display() {
        assert_eq!(RecordId::new(42).to_string(), "42");
        assert_eq!(RecordId::new(42).get(), 42);
    }

    #[test]
    fn scan_ids_are_unique() {
        assert_ne!(ScanId::new(), ScanId::new());
    }

    #[test]
    fn description_roundtrip() {
        let mut d = RecordDescription::new("demo.sweep");
        d.axis.insert("x".into(), vec![0]);
        d.axis.insert("y".into(), vec![0, 1]);
        d.hidden.push("^__.*".into());

        // serde_json stands in for the wire codec here; the CBOR path is
        // exercised by the protocol crate.
        let v = serde_json::to_value(&d).unwrap();
        let back: RecordDescription = serde_json::from_value(v).unwrap();
        assert_eq!(back, d);
    }
}
