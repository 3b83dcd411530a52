use std::cmp::Ordering;
use std::mem::size_of;
use std::sync::Arc;

use bytes::Bytes;

use crate::iterator::Cursor;
use crate::util::coding::{decode_fixed_32, put_fixed_32, VarintU32};
use crate::util::comparator::Comparator;
use crate::{Error, IResult};

/// Serializes an ordered run of entries into the block wire layout.
///
/// Consecutive keys tend to share a prefix, so each entry stores only the
/// suffix that differs from the previous key, while values are stored
/// whole:
///
/// ```text
/// entry := shared:varint32 non_shared:varint32 value_len:varint32
///          key_tail[non_shared] value[value_len]
/// block := entry* restart_offset:u32[num_restarts] num_restarts:u32
/// ```
///
/// Every `restart_interval` entries the key is written in full
/// (`shared == 0`) and the entry's offset is pushed onto the restart
/// directory appended at finish time; the cursor binary-searches that
/// directory instead of replaying the block from its first entry.
pub struct BlockBuilder<C: Comparator> {
    c: C,
    restart_interval: u32,
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    counter: u32,
    finished: bool,
    last_key: Vec<u8>,
}

impl<C: Comparator> BlockBuilder<C> {
    pub fn new(restart_interval: u32, c: C) -> Self {
        assert!(
            restart_interval >= 1,
            "[BlockBuilder] block restart interval must be at least 1, but got {}",
            restart_interval
        );
        BlockBuilder {
            c,
            restart_interval,
            buffer: vec![],
            restarts: vec![0], // First restart point is at offset 0.
            counter: 0,
            finished: false,
            last_key: vec![],
        }
    }

    /// Resets the contents as if the `BlockBuilder` was just constructed.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.finished = false;
        self.last_key.clear();
    }

    /// Appends an entry. `key` must sort after every previously added key
    /// and `finish` must not have been called since the last `reset`.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        assert!(
            !self.finished,
            "[BlockBuilder] cannot add to a finished block"
        );
        assert!(
            self.empty() || self.c.compare(key, self.last_key.as_slice()) == Ordering::Greater,
            "[BlockBuilder] keys must be added in strictly increasing order"
        );

        let mut shared = 0;
        if self.counter < self.restart_interval {
            // See how much sharing to do with the previous key.
            let min_length = std::cmp::min(self.last_key.len(), key.len());
            while shared < min_length && self.last_key[shared] == key[shared] {
                shared += 1;
            }
        } else {
            // Restart compression.
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
        }

        let non_shared = key.len() - shared;

        // Add "<shared><non_shared><value_size>" to buffer.
        VarintU32::put_varint(&mut self.buffer, shared as u32);
        VarintU32::put_varint(&mut self.buffer, non_shared as u32);
        VarintU32::put_varint(&mut self.buffer, value.len() as u32);

        // Add key delta to buffer followed by value.
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
    }

    /// Finishes building the block and returns a slice of its contents.
    /// The slice stays valid until `reset` is called.
    pub fn finish(&mut self) -> &[u8] {
        for i in 0..self.restarts.len() {
            put_fixed_32(&mut self.buffer, self.restarts[i]);
        }
        put_fixed_32(&mut self.buffer, self.restarts.len() as u32);
        self.finished = true;
        self.buffer.as_slice()
    }

    /// An estimate of the current (uncompressed) size of the block being
    /// built.
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len()
            + self.restarts.len() * size_of::<u32>()
            + size_of::<u32>()
    }

    /// True iff no entries have been added since the last `reset`.
    pub fn empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// An immutable block body plus its restart-point directory. The body is
/// the on-disk bytes with the trailer already stripped and decompressed.
#[derive(Debug)]
pub struct Block {
    data: Bytes,
    // Offset in data of the restart array.
    restarts_offset: usize,
    num_restarts: u32,
}

impl Block {
    pub fn new(data: Bytes) -> IResult<Self> {
        let len = data.len();
        if len < size_of::<u32>() {
            return Err(Error::Corruption("block too small to hold restart count"));
        }
        let num_restarts = decode_fixed_32(&data[len - 4..]);
        if num_restarts == 0 {
            return Err(Error::Corruption("block has an empty restart array"));
        }
        let directory = num_restarts as usize * 4 + 4;
        if directory > len {
            return Err(Error::Corruption("restart array exceeds block size"));
        }
        let block = Block {
            data,
            restarts_offset: len - directory,
            num_restarts,
        };
        // The directory must be strictly increasing offsets into the entry
        // region.
        let mut prev = None;
        for i in 0..num_restarts {
            let offset = block.restart_point(i) as usize;
            if offset > block.restarts_offset || prev.map_or(false, |p| offset <= p) {
                return Err(Error::Corruption("restart offset out of range"));
            }
            prev = Some(offset);
        }
        Ok(block)
    }

    /// Number of bytes held by this block, used as its cache charge.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn num_restarts(&self) -> u32 {
        self.num_restarts
    }

    fn restart_point(&self, index: u32) -> u32 {
        debug_assert!(index < self.num_restarts);
        decode_fixed_32(&self.data[self.restarts_offset + index as usize * 4..])
    }
}

/// Position inside a `Block`. Keys are materialized by prefix
/// reconstruction; values are ranges into the shared block image, so a
/// value view handed out stays valid as long as the block is referenced.
pub struct BlockCursor<C: Comparator> {
    cmp: C,
    block: Arc<Block>,
    // Offset of the current entry, == restarts_offset once exhausted.
    current_offset: usize,
    // Offset where the next entry parse starts.
    next_offset: usize,
    key: Vec<u8>,
    value: std::ops::Range<usize>,
    valid: bool,
    err: Option<Error>,
}

impl<C: Comparator> BlockCursor<C> {
    pub fn new(block: Arc<Block>, cmp: C) -> Self {
        BlockCursor {
            cmp,
            block,
            current_offset: 0,
            next_offset: 0,
            key: vec![],
            value: 0..0,
            valid: false,
            err: None,
        }
    }

    /// A refcounted view of the current value, backed by the block image.
    pub fn value_view(&self) -> Bytes {
        debug_assert!(self.valid);
        self.block.data.slice(self.value.clone())
    }

    pub fn current(&self) -> Option<(&[u8], &[u8])> {
        if self.valid {
            Some((self.key.as_slice(), &self.block.data[self.value.clone()]))
        } else {
            None
        }
    }

    fn corrupt(&mut self, msg: &'static str) -> bool {
        self.err = Some(Error::Corruption(msg));
        self.valid = false;
        self.current_offset = self.block.restarts_offset;
        self.next_offset = self.block.restarts_offset;
        false
    }

    fn seek_to_restart_point(&mut self, index: u32) {
        self.key.clear();
        self.valid = false;
        self.next_offset = self.block.restart_point(index) as usize;
    }

    /// Decodes the entry at `next_offset`, reconstructing its key from the
    /// previous one. Returns false at the end of the entry region or on a
    /// malformed entry.
    fn parse_next_key(&mut self) -> bool {
        self.current_offset = self.next_offset;
        let limit = self.block.restarts_offset;
        if self.current_offset >= limit {
            self.valid = false;
            return false;
        }
        let data = self.block.data.as_ref();
        let mut p = self.current_offset;

        let (shared, n) = match VarintU32::read(&data[p..limit]) {
            Some(v) => v,
            None => return self.corrupt("bad entry header in block"),
        };
        p += n;
        let (non_shared, n) = match VarintU32::read(&data[p..limit]) {
            Some(v) => v,
            None => return self.corrupt("bad entry header in block"),
        };
        p += n;
        let (value_len, n) = match VarintU32::read(&data[p..limit]) {
            Some(v) => v,
            None => return self.corrupt("bad entry header in block"),
        };
        p += n;

        let (shared, non_shared, value_len) = (shared as usize, non_shared as usize, value_len as usize);
        if p + non_shared + value_len > limit {
            return self.corrupt("block entry overruns restart array");
        }
        if shared > self.key.len() {
            // Also catches a restart entry whose shared prefix is not zero.
            return self.corrupt("corrupted prefix-compressed key");
        }

        self.key.truncate(shared);
        self.key.extend_from_slice(&data[p..p + non_shared]);
        self.value = p + non_shared..p + non_shared + value_len;
        self.next_offset = self.value.end;
        self.valid = true;
        true
    }

    /// Decodes the full key that starts at restart point `index`, for the
    /// binary search in `seek`.
    fn restart_key(&mut self, index: u32) -> Option<std::ops::Range<usize>> {
        let limit = self.block.restarts_offset;
        let data = self.block.data.as_ref();
        let mut p = self.block.restart_point(index) as usize;

        let (shared, n) = VarintU32::read(&data[p..limit])?;
        p += n;
        let (non_shared, n) = VarintU32::read(&data[p..limit])?;
        p += n;
        let (_value_len, n) = VarintU32::read(&data[p..limit])?;
        p += n;
        if shared != 0 || p + non_shared as usize > limit {
            return None;
        }
        Some(p..p + non_shared as usize)
    }
}

impl<C: Comparator> Cursor for BlockCursor<C> {
    fn valid(&self) -> bool {
        self.valid
    }

    fn seek_to_first(&mut self) {
        if self.err.is_some() {
            return;
        }
        self.seek_to_restart_point(0);
        self.parse_next_key();
    }

    fn seek_to_last(&mut self) {
        if self.err.is_some() {
            return;
        }
        self.seek_to_restart_point(self.block.num_restarts - 1);
        // Walk forward until the next parse would leave the entry region.
        while self.parse_next_key() && self.next_offset < self.block.restarts_offset {}
    }

    fn seek(&mut self, target: &[u8]) {
        if self.err.is_some() {
            return;
        }
        // Binary search over restart points for the last restart whose key
        // is < target.
        let mut left = 0u32;
        let mut right = self.block.num_restarts - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            let mid_key = match self.restart_key(mid) {
                Some(range) => range,
                None => {
                    self.corrupt("bad restart entry in block");
                    return;
                }
            };
            if self.cmp.compare(&self.block.data[mid_key], target) == Ordering::Less {
                // Keys at restarts before "mid" are smaller than target.
                left = mid;
            } else {
                right = mid - 1;
            }
        }
        // Linear scan to the first entry >= target.
        self.seek_to_restart_point(left);
        loop {
            if !self.parse_next_key() {
                return;
            }
            if self.cmp.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    fn next(&mut self) {
        assert!(self.valid, "[BlockCursor] next called past the end");
        self.parse_next_key();
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.key
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.block.data[self.value.clone()]
    }

    fn status(&mut self) -> IResult<()> {
        match self.err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::comparator::BytewiseComparator;

    fn build_block(entries: &[(&str, &str)], restart_interval: u32) -> Arc<Block> {
        let mut builder = BlockBuilder::new(restart_interval, BytewiseComparator::default());
        for (k, v) in entries {
            builder.add(k.as_bytes(), v.as_bytes());
        }
        let data = Bytes::copy_from_slice(builder.finish());
        Arc::new(Block::new(data).unwrap())
    }

    const ENTRIES: &[(&str, &str)] = &[
        ("deck", "v1"),
        ("dock", "v2"),
        ("duck", "v3"),
        ("duct", "v4"),
        ("dust", "v5"),
    ];

    #[test]
    fn test_iterate_all_entries() {
        for interval in [1, 2, 16] {
            let block = build_block(ENTRIES, interval);
            let mut cursor = BlockCursor::new(block.clone(), BytewiseComparator::default());
            cursor.seek_to_first();
            let mut collected = vec![];
            while cursor.valid() {
                collected.push((
                    String::from_utf8(cursor.key().to_vec()).unwrap(),
                    String::from_utf8(cursor.value().to_vec()).unwrap(),
                ));
                cursor.next();
            }
            let expect: Vec<_> = ENTRIES
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            assert_eq!(collected, expect, "restart interval {}", interval);
            assert!(cursor.eof());
            assert!(cursor.status().is_ok());
        }
    }

    #[test]
    fn test_empty_block() {
        let block = build_block(&[], 16);
        assert_eq!(block.num_restarts(), 1);
        let mut cursor = BlockCursor::new(block.clone(), BytewiseComparator::default());
        cursor.seek_to_first();
        assert!(cursor.eof());
        cursor.seek_to_last();
        assert!(cursor.eof());
        cursor.seek(b"a");
        assert!(cursor.eof());
    }

    #[test]
    fn test_single_entry_block() {
        let block = build_block(&[("a", "1")], 16);
        let mut cursor = BlockCursor::new(block.clone(), BytewiseComparator::default());
        cursor.seek(b"a");
        assert_eq!(cursor.current(), Some((&b"a"[..], &b"1"[..])));
        cursor.seek(b"b");
        assert!(cursor.eof());
    }

    #[test]
    fn test_seek() {
        let block = build_block(ENTRIES, 2);
        let mut cursor = BlockCursor::new(block.clone(), BytewiseComparator::default());

        // Exact hit.
        cursor.seek(b"duck");
        assert_eq!(cursor.key(), b"duck");
        assert_eq!(cursor.value(), b"v3");

        // Between keys: lands on the next greater entry.
        cursor.seek(b"do");
        assert_eq!(cursor.key(), b"dock");

        // Before the first key.
        cursor.seek(b"a");
        assert_eq!(cursor.key(), b"deck");

        // Past the last key.
        cursor.seek(b"zebra");
        assert!(cursor.eof());
    }

    #[test]
    fn test_seek_to_last() {
        for interval in [1, 2, 16] {
            let block = build_block(ENTRIES, interval);
            let mut cursor = BlockCursor::new(block.clone(), BytewiseComparator::default());
            cursor.seek_to_last();
            assert_eq!(cursor.key(), b"dust");
            assert_eq!(cursor.value(), b"v5");
            cursor.next();
            assert!(cursor.eof());
        }
    }

    #[test]
    fn test_value_view_outlives_advance() {
        let block = build_block(ENTRIES, 2);
        let mut cursor = BlockCursor::new(block.clone(), BytewiseComparator::default());
        cursor.seek_to_first();
        let view = cursor.value_view();
        while cursor.valid() {
            cursor.next();
        }
        assert_eq!(view.as_ref(), b"v1");
    }

    /// Reconstructing every key from (shared, non_shared) deltas yields the
    /// original keys, and every restart entry stores its key in full.
    #[test]
    fn test_prefix_reconstruction_and_restart_invariant() {
        let mut builder = BlockBuilder::new(2, BytewiseComparator::default());
        for (k, v) in ENTRIES {
            builder.add(k.as_bytes(), v.as_bytes());
        }
        let data = builder.finish().to_vec();

        let num_restarts = decode_fixed_32(&data[data.len() - 4..]) as usize;
        let restarts_offset = data.len() - 4 - num_restarts * 4;
        let restart_offsets: Vec<u32> = (0..num_restarts)
            .map(|i| decode_fixed_32(&data[restarts_offset + i * 4..]))
            .collect();
        assert!(restart_offsets.windows(2).all(|w| w[0] < w[1]));

        let mut offset = 0usize;
        let mut prev_key: Vec<u8> = vec![];
        let mut decoded = vec![];
        while offset < restarts_offset {
            let entry_offset = offset;
            let (shared, n) = VarintU32::read(&data[offset..]).unwrap();
            offset += n;
            let (non_shared, n) = VarintU32::read(&data[offset..]).unwrap();
            offset += n;
            let (value_len, n) = VarintU32::read(&data[offset..]).unwrap();
            offset += n;
            if restart_offsets.contains(&(entry_offset as u32)) {
                assert_eq!(shared, 0, "restart entry must store the full key");
            }
            let mut key = prev_key[..shared as usize].to_vec();
            key.extend_from_slice(&data[offset..offset + non_shared as usize]);
            offset += non_shared as usize + value_len as usize;
            decoded.push(key.clone());
            prev_key = key;
        }
        let expect: Vec<Vec<u8>> = ENTRIES.iter().map(|(k, _)| k.as_bytes().to_vec()).collect();
        assert_eq!(decoded, expect);
    }

    #[test]
    fn test_corrupt_restart_directory() {
        // Restart count claims more entries than the block can hold.
        let mut data = vec![];
        put_fixed_32(&mut data, 1000);
        assert!(matches!(
            Block::new(Bytes::from(data)),
            Err(Error::Corruption(_))
        ));

        // Non-increasing restart offsets.
        let mut data = vec![];
        put_fixed_32(&mut data, 5);
        put_fixed_32(&mut data, 5);
        put_fixed_32(&mut data, 2);
        assert!(matches!(
            Block::new(Bytes::from(data)),
            Err(Error::Corruption(_))
        ));

        // Too short to hold anything.
        assert!(matches!(
            Block::new(Bytes::from(vec![0u8; 3])),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    #[should_panic]
    fn test_next_past_end_panics() {
        let block = build_block(&[("a", "1")], 16);
        let mut cursor = BlockCursor::new(block.clone(), BytewiseComparator::default());
        cursor.seek_to_first();
        cursor.next();
        cursor.next();
    }

    #[test]
    #[should_panic]
    fn test_builder_rejects_unordered_keys() {
        let mut builder = BlockBuilder::new(16, BytewiseComparator::default());
        builder.add(b"b", b"");
        builder.add(b"a", b"");
    }
}
