//! Read-through cache mapping file offsets to block descriptors.
//!
//! Finding the block containing a file offset normally means walking the
//! file's reverse chain from its tail, one flash header per block. The
//! cache keeps, per recently-used inode, an ordered run of block
//! descriptors covering one contiguous range of file offsets, so repeated
//! reads and length queries resolve without re-walking.

use alloc::collections::VecDeque;

use crate::area::Area;
use crate::block::block_from_parts;
use crate::errors::{FsError, FsResult};
use crate::flash::FlashDriver;
use crate::fs::FsCore;
use crate::hash::{HashIndex, ObjectId};

/// Borrowed read-only context for resolving blocks while the cache itself
/// is mutably borrowed.
pub(crate) struct FlashView<'a> {
    pub(crate) hash: &'a HashIndex,
    pub(crate) areas: &'a [Area],
    pub(crate) flash: &'a dyn FlashDriver,
}

/// One cached block descriptor.
///
/// Locations are deliberately not cached; they are re-resolved through the
/// index at use time so that garbage collection moving a record cannot
/// leave a stale pointer behind here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CacheBlock {
    pub(crate) block_id: ObjectId,

    /// File offset of the block's first payload byte.
    pub(crate) file_offset: u32,

    pub(crate) data_len: u16,
    pub(crate) prev: Option<ObjectId>,
}

/// Cached view of one file inode.
pub(crate) struct CacheInode {
    pub(crate) inode_id: ObjectId,
    pub(crate) file_size: u32,

    /// Ascending by `file_offset` and gap-free: each descriptor starts where
    /// its predecessor ends.
    pub(crate) blocks: VecDeque<CacheBlock>,
}

impl CacheInode {
    /// The contiguous file range currently covered, `(start, end)`; `(0, 0)`
    /// when nothing is cached.
    fn range(&self) -> (u32, u32) {
        match (self.blocks.front(), self.blocks.back()) {
            (Some(first), Some(last)) => (
                first.file_offset,
                last.file_offset + u32::from(last.data_len),
            ),
            _ => (0, 0),
        }
    }
}

/// LRU cache of [`CacheInode`]s sharing one block-descriptor budget.
pub(crate) struct BlockCache {
    /// Most recently used at the front.
    inodes: VecDeque<CacheInode>,
    max_inodes: usize,
    max_blocks: usize,
    block_count: usize,
}

impl BlockCache {
    pub(crate) fn new(max_inodes: usize, max_blocks: usize) -> Self {
        Self {
            inodes: VecDeque::new(),
            max_inodes: usize::max(max_inodes, 1),
            max_blocks: usize::max(max_blocks, 1),
            block_count: 0,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.inodes.clear();
        self.block_count = 0;
    }

    /// Drops the cached view of one inode, if present.
    pub(crate) fn delete(&mut self, inode_id: ObjectId) {
        if let Some(pos) = self.inodes.iter().position(|ci| ci.inode_id == inode_id) {
            let removed = self.inodes.remove(pos).unwrap();
            self.block_count -= removed.blocks.len();
        }
    }

    /// Makes `inode_id` the most recently used cached inode, populating its
    /// size from the chain on first contact. Returns its file size.
    pub(crate) fn ensure(&mut self, view: &FlashView<'_>, inode_id: ObjectId) -> FsResult<u32> {
        if let Some(pos) = self.inodes.iter().position(|ci| ci.inode_id == inode_id) {
            let ci = self.inodes.remove(pos).unwrap();
            let size = ci.file_size;
            self.inodes.push_front(ci);
            return Ok(size);
        }

        // Compute the file length the hard way, once.
        let mut file_size = 0_u32;
        let mut cursor = view.hash.inode(inode_id)?.last_block();
        while let Some(block_id) = cursor {
            let block = block_from_parts(view.hash, view.areas, view.flash, block_id)?;
            file_size += u32::from(block.data_len);
            cursor = block.prev;
        }

        if self.inodes.len() >= self.max_inodes {
            // Evict the least recently used inode outright.
            if let Some(evicted) = self.inodes.pop_back() {
                self.block_count -= evicted.blocks.len();
            }
        }

        self.inodes.push_front(CacheInode {
            inode_id,
            file_size,
            blocks: VecDeque::new(),
        });

        Ok(file_size)
    }

    /// Frees the block list of the least-recently-used cached inode other
    /// than the one at `keep`, to make room in the shared block budget.
    fn collect_blocks(&mut self, keep: usize) {
        for pos in (0..self.inodes.len()).rev() {
            if pos == keep {
                continue;
            }
            if !self.inodes[pos].blocks.is_empty() {
                self.block_count -= self.inodes[pos].blocks.len();
                self.inodes[pos].blocks.clear();
                return;
            }
        }
    }

    fn note_block_added(&mut self, current: usize) {
        if self.block_count >= self.max_blocks {
            self.collect_blocks(current);
        }
        self.block_count += 1;
    }

    /// Finds the block containing `offset` within the file, caching every
    /// block the walk touches between the existing cached range and the
    /// target.
    pub(crate) fn seek(
        &mut self,
        view: &FlashView<'_>,
        inode_id: ObjectId,
        offset: u32,
    ) -> FsResult<CacheBlock> {
        self.ensure(view, inode_id)?;

        let (cache_start, cache_end) = self.inodes[0].range();
        let file_size = self.inodes[0].file_size;

        // Empty files have no block to find.
        if file_size == 0 {
            return Err(FsError::NotFound);
        }
        if offset >= file_size {
            return Err(FsError::Range);
        }

        if cache_end != 0 && offset < cache_start {
            // Before the cached range: walk backward from its first block,
            // prepending every predecessor until the target is covered.
            let mut cursor = self.inodes[0].blocks.front().unwrap().prev;
            let mut block_end = cache_start;

            loop {
                let block_id = cursor.ok_or(FsError::Corrupt)?;
                let block = block_from_parts(view.hash, view.areas, view.flash, block_id)?;
                let block_start = block_end - u32::from(block.data_len);

                let cached = CacheBlock {
                    block_id,
                    file_offset: block_start,
                    data_len: block.data_len,
                    prev: block.prev,
                };
                self.note_block_added(0);
                self.inodes[0].blocks.push_front(cached);

                if block_start <= offset {
                    return Ok(cached);
                }

                cursor = block.prev;
                block_end = block_start;
            }
        }

        if offset < cache_end {
            // Inside the cached range: scan the list backward.
            let ci = &self.inodes[0];
            for cached in ci.blocks.iter().rev() {
                if cached.file_offset <= offset {
                    return Ok(*cached);
                }
            }
            return Err(FsError::Corrupt);
        }

        // Beyond the cached range: walk the file backward from its tail.
        let mut cursor = view.hash.inode(inode_id)?.last_block();
        let mut block_end = file_size;

        loop {
            let block_id = cursor.ok_or(FsError::Corrupt)?;
            let block = block_from_parts(view.hash, view.areas, view.flash, block_id)?;
            let block_start = block_end - u32::from(block.data_len);

            if block_start <= offset {
                let cached = CacheBlock {
                    block_id,
                    file_offset: block_start,
                    data_len: block.data_len,
                    prev: block.prev,
                };

                // Append if this block directly follows the cached range;
                // anything else would leave a gap, so start over with this
                // single block instead.
                let adjacent = self.inodes[0]
                    .blocks
                    .back()
                    .map(|last| Some(last.block_id) == block.prev)
                    .unwrap_or(false);
                if !adjacent {
                    self.block_count -= self.inodes[0].blocks.len();
                    self.inodes[0].blocks.clear();
                }

                self.note_block_added(0);
                self.inodes[0].blocks.push_back(cached);

                return Ok(cached);
            }

            cursor = block.prev;
            block_end = block_start;
        }
    }
}

impl FsCore {
    /// Current length of a file, answered from the cache when warm.
    pub(crate) fn inode_data_len(&mut self, inode_id: ObjectId) -> FsResult<u32> {
        let FsCore {
            cache,
            hash,
            areas,
            flash,
            ..
        } = self;

        cache.ensure(
            &FlashView {
                hash,
                areas,
                flash: flash.as_ref(),
            },
            inode_id,
        )
    }

    /// Finds (and caches) the block containing `offset` of the given file.
    pub(crate) fn cache_seek(&mut self, inode_id: ObjectId, offset: u32) -> FsResult<CacheBlock> {
        let FsCore {
            cache,
            hash,
            areas,
            flash,
            ..
        } = self;

        cache.seek(
            &FlashView {
                hash,
                areas,
                flash: flash.as_ref(),
            },
            inode_id,
            offset,
        )
    }
}
