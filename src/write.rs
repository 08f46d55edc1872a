//! The write engine.
//!
//! A write is applied as a sequence of block records, each superseding at
//! most one existing block. Overwriting part of a block rewrites that block
//! under its own id with a bumped sequence number, merging the untouched
//! leading and trailing payload bytes around the new data; bytes past the
//! end of the file are appended as fresh blocks. Keeping one superseded
//! block per record keeps every surviving `prev` reference valid on flash,
//! which is what makes a half-finished write recoverable: the old record
//! simply wins until the new one is complete.

use alloc::vec::Vec;

use crate::block::Block;
use crate::disk::{DiskBlock, BLOCK_MAGIC};
use crate::errors::{CanFail, FsError, FsResult};
use crate::file::{Access, FzFile};
use crate::fs::FsCore;
use crate::hash::{FlashLoc, ObjectId};

/// Where a chunk lands within the file's existing chain.
enum WriteSite {
    /// The offset falls inside an existing block.
    Overwrite {
        block: Block,
        /// Offset of the write within the block's payload.
        block_offset: u32,
    },

    /// The offset is exactly the end of the file.
    Append { last: Option<ObjectId> },
}

impl FsCore {
    /// Writes `data` through `file` at its current position (or at the end
    /// of the file for append handles), advancing the handle past the
    /// written bytes.
    pub(crate) fn file_write(&mut self, file: &mut FzFile, data: &[u8]) -> CanFail<FsError> {
        if !file.access.contains(Access::WRITE) {
            return Err(FsError::ReadOnly);
        }

        // The append flag forces all writes to the end of the file,
        // regardless of seek position.
        let start_offset = if file.access.contains(Access::APPEND) {
            self.inode_data_len(file.inode_id)?
        } else {
            file.offset
        };

        let mut written = 0_u32;
        while (written as usize) < data.len() {
            let consumed =
                self.write_chunk(file.inode_id, start_offset + written, &data[written as usize..])?;
            written += consumed;
        }

        self.cache.delete(file.inode_id);

        // A write always leaves the handle one byte past the written data.
        file.offset = start_offset + data.len() as u32;

        Ok(())
    }

    /// Emits one block record covering a prefix of `data` at `file_offset`.
    /// Returns the number of data bytes the record consumed.
    fn write_chunk(&mut self, file_id: ObjectId, file_offset: u32, data: &[u8]) -> FsResult<u32> {
        // Reserve before touching the chain: reservation may trigger a
        // garbage collection cycle, which relocates and coalesces blocks.
        // The tuning floor guarantees no block's payload exceeds the bound,
        // so this is a safe worst case for whatever record gets emitted.
        let (area_idx, record_offset) =
            self.reserve_space(DiskBlock::SIZE as u32 + u32::from(self.block_max_data_sz))?;

        let site = self.write_seek(file_id, file_offset)?;

        match site {
            WriteSite::Append { last } => {
                let chunk = u32::min(data.len() as u32, u32::from(self.block_max_data_sz));

                let id = self.hash.alloc_block_id()?;
                let mut disk_block = DiskBlock {
                    magic: BLOCK_MAGIC,
                    id: id.raw(),
                    seq: 0,
                    prev_id: ObjectId::to_raw(last),
                    inode_id: file_id.raw(),
                    data_len: chunk as u16,
                    flags: 0,
                    crc16: 0,
                };
                disk_block.crc_fill(&data[..chunk as usize]);

                self.write_record(area_idx, record_offset, &disk_block, &data[..chunk as usize])?;
                self.block_install(
                    id,
                    FlashLoc::new(area_idx as u8, record_offset),
                    last,
                    file_id,
                    true,
                )?;

                Ok(chunk)
            }
            WriteSite::Overwrite {
                block,
                block_offset,
            } => {
                let chunk = u32::min(
                    data.len() as u32,
                    u32::from(block.data_len) - block_offset,
                );

                // Rebuild the full payload: untouched leading bytes, the new
                // data, untouched trailing bytes.
                let mut payload = Vec::new();
                payload
                    .try_reserve(usize::from(block.data_len))
                    .map_err(|_| FsError::NoMem)?;
                payload.resize(usize::from(block.data_len), 0);

                if block_offset > 0 {
                    self.block_read_data(block.loc, 0, &mut payload[..block_offset as usize])?;
                }
                payload[block_offset as usize..(block_offset + chunk) as usize]
                    .copy_from_slice(&data[..chunk as usize]);

                let tail_start = block_offset + chunk;
                if tail_start < u32::from(block.data_len) {
                    self.block_read_data(
                        block.loc,
                        tail_start as u16,
                        &mut payload[tail_start as usize..],
                    )?;
                }

                let mut disk_block = DiskBlock {
                    magic: BLOCK_MAGIC,
                    id: block.id.raw(),
                    seq: block.seq + 1,
                    prev_id: ObjectId::to_raw(block.prev),
                    inode_id: file_id.raw(),
                    data_len: block.data_len,
                    flags: 0,
                    crc16: 0,
                };
                disk_block.crc_fill(&payload);

                let was_last = self.hash.inode(file_id)?.last_block() == Some(block.id);

                self.write_record(area_idx, record_offset, &disk_block, &payload)?;
                self.block_delete_from_ram(block.id)?;
                self.block_install(
                    block.id,
                    FlashLoc::new(area_idx as u8, record_offset),
                    block.prev,
                    file_id,
                    was_last,
                )?;

                Ok(chunk)
            }
        }
    }

    /// Locates `file_offset` within the file's chain.
    fn write_seek(&self, file_id: ObjectId, file_offset: u32) -> FsResult<WriteSite> {
        let blocks = self.chain_forward(file_id)?;

        let mut block_start = 0_u32;
        for block in &blocks {
            let block_end = block_start + u32::from(block.data_len);
            if file_offset < block_end {
                return Ok(WriteSite::Overwrite {
                    block: *block,
                    block_offset: file_offset - block_start,
                });
            }
            block_start = block_end;
        }

        if file_offset != block_start {
            return Err(FsError::Range);
        }

        Ok(WriteSite::Append {
            last: blocks.last().map(|b| b.id),
        })
    }

    fn write_record(
        &mut self,
        area_idx: usize,
        offset: u32,
        disk_block: &DiskBlock,
        payload: &[u8],
    ) -> CanFail<FsError> {
        let area = &mut self.areas[area_idx];
        area.write(self.flash.as_mut(), offset, bytemuck::bytes_of(disk_block))?;
        if !payload.is_empty() {
            area.write(self.flash.as_mut(), offset + DiskBlock::SIZE as u32, payload)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    use crate::errors::FsError;
    use crate::fs::Access;
    use crate::testutil::{block_count, new_formatted_fs, read_back, write_new_file};

    #[test]
    fn overwrite_within_one_block() {
        let fs = new_formatted_fs();
        write_new_file(&fs, "/myfile.txt", &[b"abcdefgh"]);

        let mut f = fs.open("/myfile.txt", Access::WRITE).unwrap();
        fs.seek(&mut f, 3).unwrap();
        fs.write(&mut f, b"12").unwrap();
        fs.close(f).unwrap();

        assert_eq!(read_back(&fs, "/myfile.txt"), b"abc12fgh");
        assert_eq!(block_count(&fs, "/myfile.txt"), 1);
    }

    #[test]
    fn overwrite_spanning_two_blocks() {
        let fs = new_formatted_fs();
        write_new_file(&fs, "/span.txt", &[b"abcdefgh", b"ijklmnop"]);

        let mut f = fs.open("/span.txt", Access::WRITE).unwrap();
        fs.seek(&mut f, 7).unwrap();
        fs.write(&mut f, b"123").unwrap();
        fs.close(f).unwrap();

        assert_eq!(read_back(&fs, "/span.txt"), b"abcdefg123klmnop");

        let mut f = fs.open("/span.txt", Access::READ).unwrap();
        assert_eq!(fs.file_len(&f).unwrap(), 16);
        fs.close(f).unwrap();
    }

    #[test]
    fn chunking_splits_at_the_block_size_bound() {
        let fs = new_formatted_fs();
        let max = usize::from(fs.core().block_max_data_sz);

        let exact = alloc::vec![0x5A_u8; max];
        write_new_file(&fs, "/exact.bin", &[&exact]);
        assert_eq!(block_count(&fs, "/exact.bin"), 1);

        let over = alloc::vec![0xA5_u8; max + 1];
        write_new_file(&fs, "/over.bin", &[&over]);
        assert_eq!(block_count(&fs, "/over.bin"), 2);

        assert_eq!(read_back(&fs, "/over.bin"), over);
    }

    #[test]
    fn append_handle_ignores_seek_position() {
        let fs = new_formatted_fs();
        write_new_file(&fs, "/log.txt", &[b"first,"]);

        let mut f = fs
            .open("/log.txt", Access::WRITE | Access::APPEND)
            .unwrap();
        fs.seek(&mut f, 0).unwrap();
        fs.write(&mut f, b"second").unwrap();
        assert_eq!(fs.getpos(&f), 12);
        fs.close(f).unwrap();

        assert_eq!(read_back(&fs, "/log.txt"), b"first,second");
    }

    #[test]
    fn write_without_write_access_is_rejected() {
        let fs = new_formatted_fs();
        write_new_file(&fs, "/ro.txt", &[b"readonly"]);

        let mut f = fs.open("/ro.txt", Access::READ).unwrap();
        assert_eq!(fs.write(&mut f, b"nope"), Err(FsError::ReadOnly));
        fs.close(f).unwrap();
    }

    #[test]
    fn extension_past_the_end_of_a_partial_block() {
        let fs = new_formatted_fs();
        write_new_file(&fs, "/ext.bin", &[b"12345"]);

        let mut f = fs.open("/ext.bin", Access::WRITE).unwrap();
        fs.seek(&mut f, 3).unwrap();
        fs.write(&mut f, b"ABCDEFGHIJ").unwrap();
        fs.close(f).unwrap();

        assert_eq!(read_back(&fs, "/ext.bin"), b"123ABCDEFGHIJ");
    }

    #[test]
    fn randomized_overwrites_match_a_shadow_buffer() {
        let fs = new_formatted_fs();
        let mut rng = SmallRng::seed_from_u64(0x5EED);

        let mut shadow = alloc::vec![0_u8; 600];
        rng.fill(shadow.as_mut_slice());
        write_new_file(&fs, "/shadow.bin", &[&shadow]);

        for _ in 0..40 {
            let off = rng.gen_range(0..shadow.len() as u32);
            let len = rng.gen_range(1..=96_usize);
            let mut patch = alloc::vec![0_u8; len];
            rng.fill(patch.as_mut_slice());

            let mut f = fs
                .open("/shadow.bin", Access::READ | Access::WRITE)
                .unwrap();
            fs.seek(&mut f, off).unwrap();
            fs.write(&mut f, &patch).unwrap();
            fs.close(f).unwrap();

            let end = usize::min(off as usize + len, shadow.len());
            let covered = end - off as usize;
            shadow[off as usize..end].copy_from_slice(&patch[..covered]);
            if covered < len {
                shadow.extend_from_slice(&patch[covered..]);
            }

            assert_eq!(read_back(&fs, "/shadow.bin"), shadow);
        }
    }
}
