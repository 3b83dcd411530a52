use std::cmp::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::try_join_all;

use crate::iterator::Cursor;
use crate::opt::ReadOptions;
use crate::sstable::block::BlockCursor;
use crate::sstable::format::BlockHandle;
use crate::sstable::Sstable;
use crate::storage::RandomAccessFile;
use crate::util::comparator::Comparator;
use crate::IResult;

impl<F: RandomAccessFile> Sstable<F> {
    /// Creates a positionable cursor over this table. The cursor keeps the
    /// table (and, transitively, its current block) alive.
    pub fn cursor<C: Comparator>(
        self: Arc<Self>,
        cmp: C,
        options: ReadOptions,
    ) -> SstableCursor<F, C> {
        SstableCursor::new(self, cmp, options)
    }
}

/// Chains a cursor over the index block with a cursor over the data block
/// it currently points at. Data blocks are obtained through the block
/// cache; a block found corrupt mid-iteration poisons this cursor and is
/// dropped from the cache, leaving the table itself usable.
pub struct SstableCursor<F: RandomAccessFile, C: Comparator> {
    table: Arc<Sstable<F>>,
    cmp: C,
    options: ReadOptions,
    index_cursor: BlockCursor<C>,
    data_cursor: Option<BlockCursor<C>>,
    // File offset of the block behind `data_cursor`, for cache eviction.
    data_block_offset: u64,
}

impl<F: RandomAccessFile, C: Comparator> SstableCursor<F, C> {
    pub fn new(table: Arc<Sstable<F>>, cmp: C, options: ReadOptions) -> Self {
        let index_cursor = BlockCursor::new(table.index_block().clone(), cmp.clone());
        SstableCursor {
            table,
            cmp,
            options,
            index_cursor,
            data_cursor: None,
            data_block_offset: 0,
        }
    }

    /// Opens the data block the index cursor currently points at and hangs
    /// a fresh (unpositioned) cursor over it.
    async fn advance_to_data_block(&mut self) -> IResult<()> {
        debug_assert!(self.index_cursor.valid());
        let (handle, _) = BlockHandle::decode_from(self.index_cursor.value())?;
        let block = self.table.read_data_block(&handle, self.options).await?;
        self.data_cursor = Some(BlockCursor::new(block, self.cmp.clone()));
        self.data_block_offset = handle.offset();
        Ok(())
    }

    fn index_status(&mut self) -> IResult<()> {
        if let Err(e) = self.index_cursor.status() {
            self.table.evict_block(self.table.index_offset());
            self.data_cursor = None;
            return Err(e);
        }
        Ok(())
    }

    fn data_status(&mut self) -> IResult<()> {
        if let Some(data_cursor) = self.data_cursor.as_mut() {
            if let Err(e) = data_cursor.status() {
                self.table.evict_block(self.data_block_offset);
                self.data_cursor = None;
                return Err(e);
            }
        }
        Ok(())
    }

    /// While the data cursor sits past the end of its block, move to the
    /// first entry of the next one. A seek can land this way when the
    /// target falls between the last key of a block and its index
    /// separator.
    async fn skip_exhausted_blocks_forward(&mut self) -> IResult<()> {
        while self.data_cursor.as_ref().is_some_and(|d| !d.valid()) {
            if !self.index_cursor.valid() {
                self.data_cursor = None;
                return Ok(());
            }
            self.index_cursor.next();
            self.index_status()?;
            if !self.index_cursor.valid() {
                self.data_cursor = None;
                return Ok(());
            }
            self.advance_to_data_block().await?;
            if let Some(d) = self.data_cursor.as_mut() {
                d.seek_to_first();
            }
            self.data_status()?;
        }
        Ok(())
    }

    pub async fn seek_to_first(&mut self) -> IResult<()> {
        self.index_cursor.seek_to_first();
        self.index_status()?;
        if !self.index_cursor.valid() {
            self.data_cursor = None;
            return Ok(());
        }
        self.advance_to_data_block().await?;
        if let Some(d) = self.data_cursor.as_mut() {
            d.seek_to_first();
        }
        self.data_status()?;
        self.skip_exhausted_blocks_forward().await
    }

    pub async fn seek_to_last(&mut self) -> IResult<()> {
        self.index_cursor.seek_to_last();
        self.index_status()?;
        if !self.index_cursor.valid() {
            self.data_cursor = None;
            return Ok(());
        }
        self.advance_to_data_block().await?;
        if let Some(d) = self.data_cursor.as_mut() {
            d.seek_to_last();
        }
        self.data_status()
    }

    /// Positions at the first entry with key >= `target`, or at eof if no
    /// such entry exists.
    pub async fn seek(&mut self, target: &[u8]) -> IResult<()> {
        self.index_cursor.seek(target);
        self.index_status()?;
        if !self.index_cursor.valid() {
            self.data_cursor = None;
            return Ok(());
        }
        self.advance_to_data_block().await?;
        if let Some(d) = self.data_cursor.as_mut() {
            d.seek(target);
        }
        self.data_status()?;
        self.skip_exhausted_blocks_forward().await
    }

    /// Advances one entry, crossing into the next data block when the
    /// current one is exhausted.
    pub async fn next(&mut self) -> IResult<()> {
        let data_cursor = self
            .data_cursor
            .as_mut()
            .expect("[SstableCursor] next called on an unpositioned cursor");
        data_cursor.next();
        self.data_status()?;
        self.skip_exhausted_blocks_forward().await
    }

    pub fn eof(&self) -> bool {
        !self.index_cursor.valid() && self.data_cursor.as_ref().map_or(true, |d| !d.valid())
    }

    pub fn current(&self) -> Option<(&[u8], &[u8])> {
        self.data_cursor.as_ref().and_then(|d| d.current())
    }

    /// A refcounted view of the current value, valid for as long as the
    /// backing block stays referenced.
    pub fn value_view(&self) -> Option<Bytes> {
        self.data_cursor
            .as_ref()
            .filter(|d| d.valid())
            .map(|d| d.value_view())
    }
}

/// Fan-out merge over several table cursors emitting the globally smallest
/// current key. Positioning calls run against all sub-cursors concurrently;
/// the minimum is recomputed once after they settle.
///
/// Ties between sub-cursors break toward the lowest position in the
/// constructor argument list, so callers should list newer tables first to
/// get newest-wins ordering. `next` advances only the sub-cursor whose
/// entry was last returned: a key present in several tables is emitted once
/// per table, newest first.
pub struct CombinedCursor<F: RandomAccessFile, C: Comparator> {
    cmp: C,
    subs: Vec<SstableCursor<F, C>>,
    current: Option<usize>,
}

impl<F: RandomAccessFile, C: Comparator> CombinedCursor<F, C> {
    pub fn new(subs: Vec<SstableCursor<F, C>>, cmp: C) -> Self {
        CombinedCursor {
            cmp,
            subs,
            current: None,
        }
    }

    pub async fn seek_to_first(&mut self) -> IResult<()> {
        try_join_all(self.subs.iter_mut().map(|sub| sub.seek_to_first())).await?;
        self.find_smallest();
        Ok(())
    }

    pub async fn seek_to_last(&mut self) -> IResult<()> {
        try_join_all(self.subs.iter_mut().map(|sub| sub.seek_to_last())).await?;
        self.find_largest();
        Ok(())
    }

    pub async fn seek(&mut self, target: &[u8]) -> IResult<()> {
        try_join_all(self.subs.iter_mut().map(|sub| sub.seek(target))).await?;
        self.find_smallest();
        Ok(())
    }

    /// Advances the sub-cursor whose entry was last returned, then
    /// recomputes the minimum.
    pub async fn next(&mut self) -> IResult<()> {
        let i = self
            .current
            .expect("[CombinedCursor] next called on an unpositioned cursor");
        self.subs[i].next().await?;
        self.find_smallest();
        Ok(())
    }

    pub fn eof(&self) -> bool {
        self.subs.iter().all(|sub| sub.eof())
    }

    pub fn current(&self) -> Option<(&[u8], &[u8])> {
        self.current.and_then(|i| self.subs[i].current())
    }

    pub fn value_view(&self) -> Option<Bytes> {
        self.current.and_then(|i| self.subs[i].value_view())
    }

    fn find_smallest(&mut self) {
        self.current = self.pick(Ordering::Less);
    }

    fn find_largest(&mut self) {
        self.current = self.pick(Ordering::Greater);
    }

    fn pick(&self, prefer: Ordering) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, sub) in self.subs.iter().enumerate() {
            let Some((key, _)) = sub.current() else {
                continue;
            };
            match best {
                None => best = Some(i),
                Some(b) => {
                    let best_key = self.subs[b].current().unwrap().0;
                    // Strict comparison keeps the earliest sub-cursor on a
                    // tie.
                    if self.cmp.compare(key, best_key) == prefer {
                        best = Some(i);
                    }
                }
            }
        }
        best
    }
}
