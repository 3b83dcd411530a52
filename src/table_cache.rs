use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::cache::{await_leader, Cache, Flight, LruCache, SingleFlight};
use crate::opt::Options;
use crate::sstable::{BlockCache, Sstable};
use crate::storage::Storage;
use crate::util::comparator::{BytewiseComparator, Comparator};
use crate::IResult;

/// A `TableCache` is the per-worker cache of open tables, keyed by file
/// path, together with the block cache shared by all of them. Each opened
/// table gets a worker-unique file id that namespaces its block-cache keys.
pub struct TableCache<S: Storage, C: Comparator = BytewiseComparator> {
    storage: S,
    options: Options<C>,
    cache: LruCache<PathBuf, Arc<Sstable<S::F>>>,
    flights: SingleFlight<PathBuf>,
    block_cache: Arc<BlockCache>,
    next_file_id: AtomicU64,
}

impl<S: Storage, C: Comparator> TableCache<S, C> {
    pub fn new(storage: S, options: Options<C>) -> Self {
        let block_cache = Arc::new(BlockCache::new(options.block_cache_capacity_bytes));
        TableCache {
            cache: LruCache::new(options.table_cache_capacity_entries),
            flights: SingleFlight::new(),
            block_cache,
            storage,
            options,
            next_file_id: AtomicU64::new(1),
        }
    }

    pub fn options(&self) -> &Options<C> {
        &self.options
    }

    pub fn block_cache(&self) -> &Arc<BlockCache> {
        &self.block_cache
    }

    /// Opens the table stored at `path`, consulting the cache first.
    /// Concurrent opens of the same path are coalesced; the cache entry is
    /// only inserted once the open (footer, index and filter reads)
    /// completed, so a failed or cancelled open leaves no trace.
    pub async fn open_sstable(&self, path: &Path) -> IResult<Arc<Sstable<S::F>>> {
        let key = path.to_path_buf();
        loop {
            if let Some(table) = self.cache.get(&key) {
                return Ok(table);
            }
            match self.flights.join(&key) {
                Flight::Leader(_guard) => {
                    if let Some(table) = self.cache.get(&key) {
                        return Ok(table);
                    }
                    let file = self.storage.open(path).await?;
                    let file_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
                    let table = Arc::new(
                        Sstable::open(file, file_id, &self.options, self.block_cache.clone())
                            .await?,
                    );
                    self.cache.insert(key, table.clone(), 1);
                    debug!(path = %path.display(), file_id, "opened table into cache");
                    return Ok(table);
                }
                Flight::Waiter(rx) => await_leader(rx).await,
            }
        }
    }

    /// Drops the cache's own reference for `path`. Tables still referenced
    /// by cursors stay alive until those cursors go away.
    pub fn evict(&self, path: &Path) {
        self.cache.erase(&path.to_path_buf());
    }

    pub fn cached_tables(&self) -> usize {
        self.cache.len()
    }
}
