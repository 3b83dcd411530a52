//! The on-disk table layout and the reader over it.
//!
//! A table file is a flat sequence of blocks capped by a fixed-length
//! footer:
//!
//! ```text
//! [data block]* [filter block]? [metaindex block] [index block] [footer]
//! ```
//!
//! Every block except the footer carries a 5-byte trailer on disk: one
//! compression tag byte followed by a masked CRC-32C (Castagnoli) taken
//! over the block body and the tag together. The reader verifies and
//! strips the trailer before a buffer ever becomes a `Block`.
//!
//! The footer occupies the last 48 bytes of the file: the varint-encoded
//! handles (offset, size) of the metaindex and index blocks, zero padding
//! up to 40 bytes, then the 8-byte magic number. All fixed-width integers
//! in the format are little-endian.
//!
//! Navigation starts at the index block, which holds one entry per data
//! block: the key is a separator that sorts at or above everything in that
//! data block and below the next one, the value is the data block's
//! encoded handle. The metaindex block maps meta-block names to handles;
//! today its only entry is `"filter."` + policy name, locating the filter
//! block. The filter block is written uncompressed, is read once at open,
//! and never enters the block cache.

use std::cmp::Ordering;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::cache::{await_leader, Cache, Flight, LruCache, SingleFlight};
use crate::filter::FilterPolicy;
use crate::iterator::Cursor;
use crate::opt::{CompressionType, Options, ReadErrorPolicy, ReadOptions};
use crate::sstable::block::{Block, BlockBuilder, BlockCursor};
use crate::sstable::filter_block::{FilterBlockBuilder, FilterBlockReader};
use crate::sstable::format::{
    read_block, read_with_policy, BlockHandle, Footer, K_BLOCK_TRAILER_SIZE,
    K_FOOTER_ENCODED_LENGTH,
};
use crate::storage::{RandomAccessFile, WritableFile};
use crate::util::coding::put_fixed_32;
use crate::util::comparator::{BytewiseComparator, Comparator};
use crate::util::crc32::{extend, mask};
use crate::{Error, IResult};

pub mod block;
pub mod cursor;
pub mod filter_block;
pub mod format;

/// Cache key of a block: blocks are immutable, so a given offset in a file
/// always decodes to the same block and the size is redundant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockCacheKey {
    pub file_id: u64,
    pub offset: u64,
}

/// Bounded LRU over decoded index and data blocks, shared by every table of
/// one worker. Fills are coalesced so one miss produces exactly one read.
pub struct BlockCache {
    lru: LruCache<BlockCacheKey, Arc<Block>>,
    flights: SingleFlight<BlockCacheKey>,
}

impl BlockCache {
    pub fn new(capacity_bytes: usize) -> Self {
        BlockCache {
            lru: LruCache::new(capacity_bytes),
            flights: SingleFlight::new(),
        }
    }

    pub fn find(&self, key: &BlockCacheKey) -> Option<Arc<Block>> {
        self.lru.get(key)
    }

    /// Returns the cached block under `key`, or decodes one from the bytes
    /// `produce` yields. Concurrent calls for the same key await the first
    /// one instead of issuing their own read.
    pub async fn find_or_create<Fut>(
        &self,
        key: BlockCacheKey,
        produce: Fut,
    ) -> IResult<Arc<Block>>
    where
        Fut: Future<Output = IResult<Bytes>>,
    {
        let mut produce = Some(produce);
        loop {
            if let Some(block) = self.lru.get(&key) {
                return Ok(block);
            }
            match self.flights.join(&key) {
                Flight::Leader(_guard) => {
                    // A previous leader may have filled the slot between the
                    // lookup above and taking leadership.
                    if let Some(block) = self.lru.get(&key) {
                        return Ok(block);
                    }
                    let fut = produce.take().expect("a fill leads at most once");
                    let data = fut.await?;
                    let block = Arc::new(Block::new(data)?);
                    self.lru.insert(key, block.clone(), block.size());
                    return Ok(block);
                }
                Flight::Waiter(rx) => await_leader(rx).await,
            }
        }
    }

    pub fn erase(&self, key: &BlockCacheKey) {
        self.lru.erase(key);
    }

    pub fn total_charge(&self) -> usize {
        self.lru.total_charge()
    }
}

/// An open immutable table: the file handle, the parsed footer metadata,
/// the (lazily iterated) index block and the optional filter reader.
/// Tables are shared between the table cache and any open cursors.
impl<F: RandomAccessFile> std::fmt::Debug for Sstable<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sstable").field("file_id", &self.file_id).finish()
    }
}

pub struct Sstable<F: RandomAccessFile> {
    file: F,
    file_id: u64,
    index_handle: BlockHandle,
    index_block: Arc<Block>,
    filter_reader: Option<FilterBlockReader>,
    block_cache: Arc<BlockCache>,
    read_error_policy: ReadErrorPolicy,
}

impl<F: RandomAccessFile> Sstable<F> {
    /// Opens the table stored in `file`: reads the footer, pulls the index
    /// block through the block cache, and sets up the filter reader if a
    /// policy is configured. The metaindex and filter blocks are read
    /// directly and never cached. A missing filter entry in the metaindex
    /// is not an error.
    pub async fn open<C: Comparator>(
        file: F,
        file_id: u64,
        options: &Options<C>,
        block_cache: Arc<BlockCache>,
    ) -> IResult<Sstable<F>> {
        let policy = options.read_error_policy;
        let size = file.size().await?;
        if size < K_FOOTER_ENCODED_LENGTH as u64 {
            return Err(Error::Corruption("file is too short to be an sstable"));
        }
        let footer_buf = read_with_policy(
            &file,
            size - K_FOOTER_ENCODED_LENGTH as u64,
            K_FOOTER_ENCODED_LENGTH,
            policy,
        )
        .await?;
        let footer = Footer::decode_from(&footer_buf)?;

        // Read the index block through the cache; its entries are parsed
        // lazily by cursors.
        let index_key = BlockCacheKey {
            file_id,
            offset: footer.index_handle.offset(),
        };
        let index_block = block_cache
            .find_or_create(
                index_key,
                read_block(&file, &footer.index_handle, options.paranoid_checks, policy),
            )
            .await?;

        let mut table = Sstable {
            file,
            file_id,
            index_handle: footer.index_handle,
            index_block,
            filter_reader: None,
            block_cache,
            read_error_policy: policy,
        };
        if let Some(filter_policy) = &options.filter_policy {
            table
                .read_meta(
                    &footer.metaindex_handle,
                    filter_policy.clone(),
                    options.paranoid_checks,
                )
                .await?;
        }
        debug!(file_id, size, filter = table.filter_reader.is_some(), "opened sstable");
        Ok(table)
    }

    async fn read_meta(
        &mut self,
        metaindex_handle: &BlockHandle,
        filter_policy: Arc<dyn FilterPolicy>,
        verify_checksums: bool,
    ) -> IResult<()> {
        if metaindex_handle.size() == 0 {
            return Ok(());
        }
        let contents = read_block(
            &self.file,
            metaindex_handle,
            verify_checksums,
            self.read_error_policy,
        )
        .await?;
        let meta_block = Arc::new(Block::new(contents)?);
        let mut cursor = BlockCursor::new(meta_block, BytewiseComparator::default());
        let filter_key = format!("filter.{}", filter_policy.name());
        cursor.seek(filter_key.as_bytes());
        if cursor.valid() && cursor.key() == filter_key.as_bytes() {
            let (filter_handle, _) = BlockHandle::decode_from(cursor.value())?;
            let data = read_block(
                &self.file,
                &filter_handle,
                verify_checksums,
                self.read_error_policy,
            )
            .await?;
            self.filter_reader = Some(FilterBlockReader::new(filter_policy, data));
        } else {
            debug!(file_id = self.file_id, "no filter entry in metaindex block");
        }
        cursor.status()
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    pub(crate) fn index_block(&self) -> &Arc<Block> {
        &self.index_block
    }

    pub(crate) fn index_offset(&self) -> u64 {
        self.index_handle.offset()
    }

    pub(crate) fn evict_block(&self, offset: u64) {
        self.block_cache.erase(&BlockCacheKey {
            file_id: self.file_id,
            offset,
        });
    }

    /// Reads the data block behind `handle`, going through the block cache
    /// unless the read options opt out of populating it.
    pub(crate) async fn read_data_block(
        &self,
        handle: &BlockHandle,
        options: ReadOptions,
    ) -> IResult<Arc<Block>> {
        let key = BlockCacheKey {
            file_id: self.file_id,
            offset: handle.offset(),
        };
        if options.fill_cache {
            self.block_cache
                .find_or_create(
                    key,
                    read_block(
                        &self.file,
                        handle,
                        options.verify_checksums,
                        self.read_error_policy,
                    ),
                )
                .await
        } else {
            if let Some(block) = self.block_cache.find(&key) {
                return Ok(block);
            }
            let data = read_block(
                &self.file,
                handle,
                options.verify_checksums,
                self.read_error_policy,
            )
            .await?;
            Ok(Arc::new(Block::new(data)?))
        }
    }

    /// Point lookup: returns the value stored under exactly `key`, or
    /// `None`. A negative filter answer skips the data-block read entirely.
    pub async fn get<C: Comparator>(
        &self,
        cmp: C,
        options: ReadOptions,
        key: &[u8],
    ) -> IResult<Option<Bytes>> {
        let mut index_cursor = BlockCursor::new(self.index_block.clone(), cmp.clone());
        index_cursor.seek(key);
        if let Err(e) = index_cursor.status() {
            self.evict_block(self.index_offset());
            return Err(e);
        }
        if !index_cursor.valid() {
            return Ok(None);
        }
        let (handle, _) = BlockHandle::decode_from(index_cursor.value())?;
        if let Some(filter) = &self.filter_reader {
            if !filter.key_may_match(handle.offset(), key) {
                return Ok(None);
            }
        }
        let block = self.read_data_block(&handle, options).await?;
        let mut cursor = BlockCursor::new(block, cmp.clone());
        cursor.seek(key);
        if let Err(e) = cursor.status() {
            self.evict_block(handle.offset());
            return Err(e);
        }
        if cursor.valid() && cmp.compare(cursor.key(), key) == Ordering::Equal {
            return Ok(Some(cursor.value_view()));
        }
        Ok(None)
    }
}

/// Builds a table file from keys added in strictly increasing order. Used
/// by flush/compaction upstream and by the test fixtures here.
pub struct TableBuilder<W: WritableFile, C: Comparator> {
    c: C,
    options: Options<C>,
    // Underlying sstable file.
    file: W,
    offset: u64,
    data_block: BlockBuilder<C>,
    index_block: BlockBuilder<C>,
    // The last key of the data block under construction.
    last_key: Vec<u8>,
    num_entries: usize,
    closed: bool,
    filter_block: Option<FilterBlockBuilder>,
    // Iff true we have flushed a data block but not yet emitted its index
    // entry: the entry is deferred until the first key of the next block is
    // known, which allows shorter separator keys.
    pending_index_entry: bool,
    pending_handle: BlockHandle,
}

impl<W: WritableFile, C: Comparator> TableBuilder<W, C> {
    pub fn new(file: W, options: Options<C>) -> Self {
        let filter_block = options.filter_policy.clone().map(|policy| {
            let mut fb = FilterBlockBuilder::new(policy);
            fb.start_block(0);
            fb
        });
        let c = options.comparator.clone();
        Self {
            c: c.clone(),
            data_block: BlockBuilder::new(options.block_restart_interval, c.clone()),
            index_block: BlockBuilder::new(options.block_restart_interval, c),
            options,
            file,
            offset: 0,
            last_key: vec![],
            num_entries: 0,
            closed: false,
            filter_block,
            pending_index_entry: false,
            pending_handle: BlockHandle::new(0, 0),
        }
    }

    /// Adds a key/value pair to the table being constructed. Flushes the
    /// data block once it reaches the configured size.
    ///
    /// # Panics
    ///
    /// * If `key` does not sort after every previously added key.
    /// * If the builder is closed.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> IResult<()> {
        self.assert_not_closed();
        if self.num_entries > 0 {
            assert_eq!(
                self.c.compare(key, self.last_key.as_slice()),
                Ordering::Greater,
                "[TableBuilder] keys must be added in strictly increasing order"
            );
        }

        self.maybe_append_index_block(Some(key));
        if let Some(fb) = self.filter_block.as_mut() {
            fb.add_key(key);
        }
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);

        if self.data_block.current_size_estimate() >= self.options.block_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Flushes the data block under construction, if any.
    pub fn flush(&mut self) -> IResult<()> {
        self.assert_not_closed();
        if !self.data_block.empty() {
            assert!(
                !self.pending_index_entry,
                "[TableBuilder] the index entry of the previous data block must be emitted before flushing the next"
            );
            let data_block = self.data_block.finish();
            let (compressed, compression) = compress_block(data_block, self.options.compression)?;
            write_raw_block(
                &mut self.file,
                compressed.as_slice(),
                compression,
                &mut self.pending_handle,
                &mut self.offset,
            )?;
            self.data_block.reset();
            self.pending_index_entry = true;
            self.file.flush()?;
            if let Some(fb) = &mut self.filter_block {
                fb.start_block(self.offset);
            }
        }
        Ok(())
    }

    /// Finishes the table: writes the filter, metaindex and index blocks
    /// and the footer. The builder is closed afterwards.
    pub fn finish(&mut self, sync: bool) -> IResult<()> {
        // Write the last data block.
        self.flush()?;
        self.assert_not_closed();
        self.closed = true;

        // Write the filter block, uncompressed.
        let mut filter_block_handle = BlockHandle::new(0, 0);
        let has_filter_block = if let Some(fb) = &mut self.filter_block {
            let data = fb.finish().to_vec();
            write_raw_block(
                &mut self.file,
                &data,
                CompressionType::KNoCompression,
                &mut filter_block_handle,
                &mut self.offset,
            )?;
            true
        } else {
            false
        };

        // Write the metaindex block.
        let mut meta_block_handle = BlockHandle::new(0, 0);
        let mut meta_block_builder =
            BlockBuilder::new(self.options.block_restart_interval, self.c.clone());
        if has_filter_block {
            let filter_policy = self.options.filter_policy.as_ref().unwrap();
            let filter_key = format!("filter.{}", filter_policy.name());
            meta_block_builder.add(filter_key.as_bytes(), &filter_block_handle.encoded());
        }
        let meta_block = meta_block_builder.finish();
        let (compressed, compression) = compress_block(meta_block, self.options.compression)?;
        write_raw_block(
            &mut self.file,
            compressed.as_slice(),
            compression,
            &mut meta_block_handle,
            &mut self.offset,
        )?;

        // Write the index block.
        self.maybe_append_index_block(None);
        let index_block = self.index_block.finish();
        let mut index_block_handle = BlockHandle::new(0, 0);
        let (compressed, compression) = compress_block(index_block, self.options.compression)?;
        write_raw_block(
            &mut self.file,
            compressed.as_slice(),
            compression,
            &mut index_block_handle,
            &mut self.offset,
        )?;
        self.index_block.reset();

        // Write the footer.
        let footer = Footer::new(meta_block_handle, index_block_handle).encode();
        self.file.append(footer.as_slice())?;
        self.offset += footer.len() as u64;
        if sync {
            self.file.flush()?;
        }
        Ok(())
    }

    /// Number of key/value pairs added so far.
    #[inline]
    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    /// Size of the file generated so far. After a successful `finish` this
    /// is the final file size.
    #[inline]
    pub fn file_size(&self) -> u64 {
        self.offset
    }

    #[inline]
    fn assert_not_closed(&self) {
        assert!(
            !self.closed,
            "[TableBuilder] operation on a closed TableBuilder"
        );
    }

    /// Emits the deferred index entry for the last flushed data block, with
    /// a separator shortened against `key` (or a successor at end of table).
    fn maybe_append_index_block(&mut self, key: Option<&[u8]>) -> bool {
        if self.pending_index_entry {
            assert!(
                self.data_block.empty(),
                "[TableBuilder] data block must be flushed before its index entry is emitted"
            );
            let s = if let Some(k) = key {
                self.c.find_shortest_separator(&self.last_key, k)
            } else {
                self.c.find_short_successor(&self.last_key)
            };
            self.index_block.add(&s, &self.pending_handle.encoded());
            self.pending_index_entry = false;
            return true;
        }
        false
    }
}

/// Compresses `raw_block` with the configured algorithm, falling back to no
/// compression for unknown settings.
fn compress_block(
    raw_block: &[u8],
    compression: CompressionType,
) -> IResult<(Vec<u8>, CompressionType)> {
    match compression {
        CompressionType::KSnappyCompression => {
            let mut enc = snap::raw::Encoder::new();
            let compressed = enc.compress_vec(raw_block)?;
            Ok((compressed, CompressionType::KSnappyCompression))
        }
        CompressionType::KNoCompression | CompressionType::UnKnown => {
            Ok((Vec::from(raw_block), CompressionType::KNoCompression))
        }
    }
}

/// Writes block data followed by its trailer, updating `handle` and
/// `offset` to describe the written extent.
fn write_raw_block<W: WritableFile>(
    file: &mut W,
    data: &[u8],
    compression: CompressionType,
    handle: &mut BlockHandle,
    offset: &mut u64,
) -> IResult<()> {
    file.append(data)?;
    handle.set_offset(*offset);
    handle.set_size(data.len() as u64);
    // Trailer: compression tag + masked crc of body and tag.
    let mut trailer = vec![compression as u8];
    let crc = mask(extend(data, &[compression as u8]));
    put_fixed_32(&mut trailer, crc);
    debug_assert_eq!(trailer.len(), K_BLOCK_TRAILER_SIZE);
    file.append(trailer.as_slice())?;
    *offset += (data.len() + K_BLOCK_TRAILER_SIZE) as u64;
    Ok(())
}
