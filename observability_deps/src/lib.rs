//! Re-export of the tracing stack so every workspace crate picks up the
//! same version and feature set from a single place. Import macros as
//! `use observability_deps::tracing::{debug, info, warn, error};`.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(missing_docs)]

pub use tracing;
