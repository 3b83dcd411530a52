use std::sync::Arc;

use bytes::Bytes;

use crate::filter::FilterPolicy;
use crate::util::coding::{decode_fixed_32, put_fixed_32};

// Generate a new filter every 2KB of file offset covered by data blocks.
const FILTER_BASE_LG: u8 = 11;
const FILTER_BASE: u64 = 1 << FILTER_BASE_LG;

/// Accumulates keys per 2KB region of data-block offsets and emits one
/// filter per region, followed by the offset directory and the base lg.
pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    // Flattened key bytes with their start offsets, split out into owned
    // keys when a filter is generated.
    keys: Vec<u8>,
    start: Vec<usize>,
    result: Vec<u8>,
    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    pub fn new(policy: Arc<dyn FilterPolicy>) -> Self {
        FilterBlockBuilder {
            policy,
            keys: vec![],
            start: vec![],
            result: vec![],
            filter_offsets: vec![],
        }
    }

    /// Tells the builder that a data block begins at `block_offset`. Must be
    /// called with non-decreasing offsets.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset / FILTER_BASE;
        debug_assert!(filter_index >= self.filter_offsets.len() as u64);
        while filter_index > self.filter_offsets.len() as u64 {
            self.generate_filter();
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.start.push(self.keys.len());
        self.keys.extend_from_slice(key);
    }

    pub fn finish(&mut self) -> &[u8] {
        if !self.start.is_empty() {
            self.generate_filter();
        }
        let array_offset = self.result.len() as u32;
        for i in 0..self.filter_offsets.len() {
            put_fixed_32(&mut self.result, self.filter_offsets[i]);
        }
        put_fixed_32(&mut self.result, array_offset);
        self.result.push(FILTER_BASE_LG);
        self.result.as_slice()
    }

    fn generate_filter(&mut self) {
        self.filter_offsets.push(self.result.len() as u32);
        if self.start.is_empty() {
            // No keys for this region; an empty filter matches nothing.
            return;
        }
        self.start.push(self.keys.len()); // simplify length computation
        let tmp_keys: Vec<Vec<u8>> = self
            .start
            .windows(2)
            .map(|w| self.keys[w[0]..w[1]].to_vec())
            .collect();
        let filter = self.policy.create_filter(&tmp_keys);
        self.result.extend_from_slice(&filter);
        self.keys.clear();
        self.start.clear();
    }
}

/// Parses a filter block and answers per-data-block membership queries. The
/// block stays out of the block cache and lives as long as its table.
pub struct FilterBlockReader {
    policy: Arc<dyn FilterPolicy>,
    data: Bytes,
    // Start of the offset directory.
    offset_array: usize,
    num_filters: usize,
    base_lg: u8,
}

impl FilterBlockReader {
    pub fn new(policy: Arc<dyn FilterPolicy>, data: Bytes) -> Self {
        let mut reader = FilterBlockReader {
            policy,
            data: Bytes::new(),
            offset_array: 0,
            num_filters: 0,
            base_lg: 0,
        };
        let n = data.len();
        if n < 5 {
            // 1 byte base lg + 4 byte array offset at minimum.
            return reader;
        }
        let base_lg = data[n - 1];
        let array_offset = decode_fixed_32(&data[n - 5..]) as usize;
        if array_offset > n - 5 {
            return reader;
        }
        reader.base_lg = base_lg;
        reader.offset_array = array_offset;
        reader.num_filters = (n - 5 - array_offset) / 4;
        reader.data = data;
        reader
    }

    /// Whether `key` may be present in the data block starting at
    /// `block_offset`. Missing or malformed per-region filters err on the
    /// side of a match.
    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index >= self.num_filters {
            return true;
        }
        let start = decode_fixed_32(&self.data[self.offset_array + index * 4..]) as usize;
        // For the last filter this reads the stored array offset, which is
        // exactly the end of the filter data region.
        let limit = decode_fixed_32(&self.data[self.offset_array + index * 4 + 4..]) as usize;
        if start <= limit && limit <= self.offset_array {
            if start == limit {
                // Empty filter: this region holds no keys.
                return false;
            }
            return self.policy.key_may_match(&self.data[start..limit], key);
        }
        true
    }
}
