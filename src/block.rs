//! Data block views and chain traversal.
//!
//! The index keeps only a compact entry per block; everything else (owner,
//! sequence number, payload length) lives in the on-flash header and is
//! materialized on demand into a [`Block`] view. A file's blocks form a
//! reverse-linked chain: the inode references the newest block, each block
//! references its predecessor.

use bytemuck::pod_read_unaligned;

use crate::area::Area;
use crate::disk::{DiskBlock, BLOCK_MAGIC, MAGIC_ERASED};
use crate::errors::{CanFail, FsError, FsResult};
use crate::flash::FlashDriver;
use crate::fs::FsCore;
use crate::hash::{BlockEntry, FlashLoc, HashIndex, ObjectId};

/// Fully-populated view of one data block.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Block {
    pub(crate) id: ObjectId,
    pub(crate) loc: FlashLoc,
    pub(crate) seq: u32,
    pub(crate) inode_id: ObjectId,
    pub(crate) prev: Option<ObjectId>,
    pub(crate) data_len: u16,
}

impl Block {
    /// Total on-flash footprint of the record, header included.
    pub(crate) fn disk_size(&self) -> u32 {
        DiskBlock::SIZE as u32 + u32::from(self.data_len)
    }
}

/// Reads and magic-checks a block header from an area log.
pub(crate) fn block_read_disk(
    flash: &dyn FlashDriver,
    area: &Area,
    area_offset: u32,
) -> FsResult<DiskBlock> {
    let mut raw = [0_u8; DiskBlock::SIZE];
    area.read(flash, area_offset, &mut raw)?;

    let disk_block: DiskBlock = pod_read_unaligned(&raw);
    if disk_block.magic == MAGIC_ERASED {
        return Err(FsError::Empty);
    }
    if disk_block.magic != BLOCK_MAGIC {
        return Err(FsError::Unexpected);
    }

    Ok(disk_block)
}

/// Materializes the full view of an indexed block from its on-flash header.
pub(crate) fn block_from_parts(
    hash: &HashIndex,
    areas: &[Area],
    flash: &dyn FlashDriver,
    id: ObjectId,
) -> FsResult<Block> {
    let entry = hash.block(id)?;
    let area = &areas[entry.loc.area_idx() as usize];
    let disk_block = block_read_disk(flash, area, entry.loc.offset())?;

    Ok(Block {
        id,
        loc: entry.loc,
        seq: disk_block.seq,
        inode_id: ObjectId::from_raw(disk_block.inode_id).ok_or(FsError::Corrupt)?,
        prev: entry.prev,
        data_len: disk_block.data_len,
    })
}

impl FsCore {
    pub(crate) fn block_from_id(&self, id: ObjectId) -> FsResult<Block> {
        block_from_parts(&self.hash, &self.areas, self.flash.as_ref(), id)
    }

    /// Reads `buf.len()` payload bytes starting `offset` bytes into the
    /// block's data.
    pub(crate) fn block_read_data(
        &self,
        loc: FlashLoc,
        offset: u16,
        buf: &mut [u8],
    ) -> CanFail<FsError> {
        let area = &self.areas[loc.area_idx() as usize];
        area.read(
            self.flash.as_ref(),
            loc.offset() + DiskBlock::SIZE as u32 + u32::from(offset),
            buf,
        )
    }

    /// Removes a block entry from the RAM representation, rewiring the
    /// owner's last-block reference if it pointed here.
    ///
    /// The record itself stays on flash; garbage collection reclaims it once
    /// no entry references it.
    pub(crate) fn block_delete_from_ram(&mut self, id: ObjectId) -> CanFail<FsError> {
        let entry = *self.hash.block(id)?;
        let block = self.block_from_id(id)?;

        if let Ok(owner) = self.hash.inode_mut(block.inode_id) {
            if owner.last_block() == Some(id) {
                owner.set_last_block(entry.prev);
            }
        }

        self.hash.remove(id);

        Ok(())
    }

    /// Walks a file's chain from its newest block toward its first,
    /// materializing each block. The callback returns `false` to stop early.
    pub(crate) fn chain_walk(
        &self,
        file_id: ObjectId,
        mut visit: impl FnMut(&Block) -> FsResult<bool>,
    ) -> CanFail<FsError> {
        let mut cursor = self.hash.inode(file_id)?.last_block();

        while let Some(id) = cursor {
            let block = self.block_from_id(id)?;
            if !visit(&block)? {
                return Ok(());
            }

            cursor = block.prev;
        }

        Ok(())
    }

    /// Collects a file's chain in forward (file-offset) order.
    pub(crate) fn chain_forward(&self, file_id: ObjectId) -> FsResult<alloc::vec::Vec<Block>> {
        let mut blocks = alloc::vec::Vec::new();

        self.chain_walk(file_id, |block| {
            blocks.push(*block);
            Ok(true)
        })?;

        blocks.reverse();
        Ok(blocks)
    }

    /// Inserts a freshly-written block into the index and links it into its
    /// owner's chain.
    pub(crate) fn block_install(
        &mut self,
        id: ObjectId,
        loc: FlashLoc,
        prev: Option<ObjectId>,
        inode_id: ObjectId,
        was_last: bool,
    ) -> CanFail<FsError> {
        self.hash.insert(crate::hash::HashEntry::Block(BlockEntry {
            id,
            loc,
            prev,
        }));

        if was_last {
            self.hash.inode_mut(inode_id)?.set_last_block(Some(id));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::errors::FsError;
    use crate::fs::Access;
    use crate::testutil::{new_formatted_fs, read_back, write_new_file};

    #[test]
    fn chain_forward_orders_blocks_by_file_offset() {
        let fs = new_formatted_fs();
        let file_id = write_new_file(&fs, "/chain.bin", &[b"first...", b"second..", b"third..."]);

        let core = fs.core();
        let blocks = core.chain_forward(file_id).unwrap();

        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].prev, None);
        assert_eq!(blocks[1].prev, Some(blocks[0].id));
        assert_eq!(blocks[2].prev, Some(blocks[1].id));
        assert!(blocks.iter().all(|b| b.inode_id == file_id));
    }

    #[test]
    fn block_payloads_are_readable_in_place() {
        let fs = new_formatted_fs();
        let file_id = write_new_file(&fs, "/payload.bin", &[b"abcdefgh"]);

        let core = fs.core();
        let blocks = core.chain_forward(file_id).unwrap();
        let mut buf = [0_u8; 4];
        core.block_read_data(blocks[0].loc, 2, &mut buf).unwrap();

        assert_eq!(&buf, b"cdef");
    }

    #[test]
    fn deleting_the_tail_block_rewires_the_owner() {
        let fs = new_formatted_fs();
        let file_id = write_new_file(&fs, "/tail.bin", &[b"one.", b"two."]);

        let mut core = fs.core();
        let blocks = core.chain_forward(file_id).unwrap();

        core.block_delete_from_ram(blocks[1].id).unwrap();
        assert_eq!(
            core.hash.inode(file_id).unwrap().last_block(),
            Some(blocks[0].id)
        );

        core.block_delete_from_ram(blocks[0].id).unwrap();
        assert_eq!(core.hash.inode(file_id).unwrap().last_block(), None);
        assert_eq!(
            core.block_delete_from_ram(blocks[0].id),
            Err(FsError::NotFound)
        );
    }

    #[test]
    fn unreferenced_records_stay_on_flash_until_collected() {
        let fs = new_formatted_fs();
        write_new_file(&fs, "/a.txt", &[b"payload!"]);

        // Overwrite drops the old record from RAM but not from flash; the
        // content observed through the index must already be the new one.
        {
            let mut f = fs.open("/a.txt", Access::WRITE).unwrap();
            fs.write(&mut f, b"PAYLOAD?").unwrap();
            fs.close(f).unwrap();
        }

        assert_eq!(read_back(&fs, "/a.txt"), b"PAYLOAD?");
    }
}
