//! The in-process cache of open records.
//!
//! Bounded by entry count with oldest-touch eviction. Concurrent misses
//! for the same id share a single load: the first request installs a
//! shared loading future, later ones await it instead of re-reading the
//! header from disk.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use data_types::RecordId;
use futures::future::{BoxFuture, FutureExt, Shared};
use observability_deps::tracing::debug;
use parking_lot::Mutex;
use record::Record;
use record_catalog::Catalog;
use tokio::sync::Mutex as AsyncMutex;

use crate::{Error, Result};

/// Default cache capacity.
pub const DEFAULT_CACHE_ENTRIES: usize = 1024;

type SharedRecord = Arc<AsyncMutex<Record>>;
type LoadFuture = Shared<BoxFuture<'static, Result<SharedRecord, String>>>;

enum Entry {
    Ready { touched: u64, record: SharedRecord },
    Loading(LoadFuture),
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<RecordId, Entry>,
    clock: u64,
}

/// See the module docs.
pub struct RecordCache {
    cap: usize,
    state: Mutex<CacheState>,
}

impl std::fmt::Debug for RecordCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCache")
            .field("cap", &self.cap)
            .field("len", &self.state.lock().entries.len())
            .finish()
    }
}

impl RecordCache {
    /// A cache bounded to `cap` open records.
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Insert a freshly created record.
    pub fn insert(&self, id: RecordId, record: SharedRecord) {
        let mut s = self.state.lock();
        s.clock += 1;
        let touched = s.clock;
        s.entries.insert(id, Entry::Ready { touched, record });
        Self::evict(&mut s, self.cap);
    }

    /// Forget a record (after deletion).
    pub fn remove(&self, id: RecordId) {
        self.state.lock().entries.remove(&id);
    }

    /// Fetch a record, loading it through `catalog`/`datapath` on a miss.
    pub async fn get_or_load(
        &self,
        id: RecordId,
        catalog: &Catalog,
        datapath: &PathBuf,
    ) -> Result<SharedRecord> {
        let fut = {
            let mut s = self.state.lock();
            s.clock += 1;
            let now = s.clock;
            match s.entries.get_mut(&id) {
                Some(Entry::Ready { touched, record }) => {
                    *touched = now;
                    return Ok(Arc::clone(record));
                }
                Some(Entry::Loading(f)) => f.clone(),
                None => {
                    let catalog = catalog.clone();
                    let datapath = datapath.clone();
                    let fut: LoadFuture = load(id, catalog, datapath).boxed().shared();
                    s.entries.insert(id, Entry::Loading(fut.clone()));
                    fut
                }
            }
        };

        match fut.await {
            Ok(record) => {
                let mut s = self.state.lock();
                s.clock += 1;
                let touched = s.clock;
                s.entries.insert(
                    id,
                    Entry::Ready {
                        touched,
                        record: Arc::clone(&record),
                    },
                );
                Self::evict(&mut s, self.cap);
                Ok(record)
            }
            Err(message) => {
                self.state.lock().entries.remove(&id);
                Err(Error::Load { id, message })
            }
        }
    }

    fn evict(s: &mut CacheState, cap: usize) {
        while s.entries.len() > cap {
            let oldest = s
                .entries
                .iter()
                .filter_map(|(id, e)| match e {
                    Entry::Ready { touched, .. } => Some((*id, *touched)),
                    Entry::Loading(_) => None,
                })
                .min_by_key(|(_, touched)| *touched)
                .map(|(id, _)| id);
            match oldest {
                Some(id) => {
                    debug!(%id, "evicting record from cache");
                    s.entries.remove(&id);
                }
                None => break,
            }
        }
    }
}

async fn load(id: RecordId, catalog: Catalog, datapath: PathBuf) -> Result<SharedRecord, String> {
    let file = catalog
        .file_of(id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("no record with id {id}"))?;
    let header = datapath.join("objects").join(file);
    let record = Record::open(&datapath, &header).map_err(|e| e.to_string())?;
    Ok(Arc::new(AsyncMutex::new(record)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::RecordDescription;

    fn shared(app: &str) -> SharedRecord {
        Arc::new(AsyncMutex::new(Record::cache(RecordDescription::new(app))))
    }

    #[test]
    fn eviction_drops_the_oldest_touch() {
        let cache = RecordCache::new(2);
        cache.insert(RecordId::new(1), shared("a"));
        cache.insert(RecordId::new(2), shared("b"));
        // touch 1 so 2 becomes the eviction candidate
        {
            let mut s = cache.state.lock();
            s.clock += 1;
            let clock = s.clock;
            if let Some(Entry::Ready { touched, .. }) = s.entries.get_mut(&RecordId::new(1)) {
                *touched = clock;
            }
        }
        cache.insert(RecordId::new(3), shared("c"));

        let s = cache.state.lock();
        assert!(s.entries.contains_key(&RecordId::new(1)));
        assert!(!s.entries.contains_key(&RecordId::new(2)));
        assert!(s.entries.contains_key(&RecordId::new(3)));
    }

    #[tokio::test]
    async fn missing_record_load_fails_and_clears() {
        let dir = test_helpers::tmp_dir().unwrap();
        let catalog = Catalog::connect("sqlite::memory:").await.unwrap();
        let cache = RecordCache::new(8);
        let err = cache
            .get_or_load(RecordId::new(42), &catalog, &dir.path().to_path_buf())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Load { .. }));
        assert!(cache.state.lock().entries.is_empty());
    }
}
