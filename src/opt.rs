use std::sync::Arc;

use crate::filter::FilterPolicy;
use crate::util::comparator::{BytewiseComparator, Comparator};

/// Compression applied to a block before it is written, recorded in the
/// 1-byte tag of the block trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    KNoCompression = 0,
    KSnappyCompression = 1,
    UnKnown = 2,
}

impl From<u8> for CompressionType {
    fn from(v: u8) -> Self {
        match v {
            0 => CompressionType::KNoCompression,
            1 => CompressionType::KSnappyCompression,
            _ => CompressionType::UnKnown,
        }
    }
}

/// What to do when the storage layer reports a transient failure.
#[derive(Debug, Clone, Copy)]
pub enum ReadErrorPolicy {
    /// Propagate the first error to the caller.
    Surface,
    /// Retry the read up to the given number of times before surfacing.
    Retry(usize),
}

#[derive(Clone)]
pub struct Options<C: Comparator = BytewiseComparator> {
    /// Comparator defining the key order of every table read through these
    /// options. Must match the comparator the tables were built with.
    pub comparator: C,
    /// Approximate uncompressed size of each data block built by
    /// `TableBuilder`.
    pub block_size: usize,
    /// Number of keys between restart points.
    pub block_restart_interval: u32,
    /// Read-ahead hint for sequential scans over table files, in bytes.
    pub sstable_buffer_size: usize,
    pub compression: CompressionType,
    /// `None` disables filter blocks on both the read and the write path.
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,
    pub block_cache_capacity_bytes: usize,
    pub table_cache_capacity_entries: usize,
    pub read_error_policy: ReadErrorPolicy,
    /// Verify block checksums while opening a table (footer, index and meta
    /// reads). Per-read verification is controlled by `ReadOptions`.
    pub paranoid_checks: bool,
}

impl<C: Comparator + Default> Default for Options<C> {
    fn default() -> Self {
        Options {
            comparator: C::default(),
            block_size: 4 * 1024,
            block_restart_interval: 16,
            sstable_buffer_size: 64 * 1024,
            compression: CompressionType::KNoCompression,
            filter_policy: None,
            block_cache_capacity_bytes: 8 * 1024 * 1024,
            table_cache_capacity_entries: 1000,
            read_error_policy: ReadErrorPolicy::Surface,
            paranoid_checks: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    pub verify_checksums: bool,
    /// Whether data blocks read for this operation should populate the
    /// block cache.
    pub fill_cache: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        ReadOptions {
            verify_checksums: true,
            fill_cache: true,
        }
    }
}
