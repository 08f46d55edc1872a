//! Mount-time reconstruction of the RAM representation from the flash logs.
//!
//! Detection walks every area's log record by record, replaying creations,
//! renames and deletions through the same superseding rules the runtime
//! uses. Objects may be encountered in any order, so placeholders (dummy
//! inodes) stand in for parents and owners until their records show up. A
//! final sweep evicts everything the replayed log says is dead, migrates
//! the children of inodes that never materialized into `/lost+found/`, and
//! truncates file chains at the first corrupt block.

use alloc::vec::Vec;
use bytemuck::pod_read_unaligned;
use hashbrown::HashSet;

use crate::area::{find_corrupt_scratch, validate_descs, Area, AreaDesc};
use crate::block::block_read_disk;
use crate::disk::{DiskArea, DiskBlock, DiskInode, InodeFlags, BLOCK_MAGIC, INODE_MAGIC, MAGIC_ERASED};
use crate::errors::{CanFail, FsError};
use crate::fs::FsCore;
use crate::hash::{BlockEntry, FlashLoc, HashEntry, InodeEntry, ObjectId, NAME_PREFIX_LEN};
use crate::inode::inode_read_disk;
use crate::{error, info};

impl FsCore {
    /// Searches the given areas for a file system and rebuilds the index
    /// from whatever valid state they hold.
    pub(crate) fn restore_full(&mut self, descs: &[AreaDesc]) -> CanFail<FsError> {
        validate_descs(descs)?;
        self.reset_ram();

        let mut largest_payload = 0_u16;

        for desc in descs {
            let mut raw = [0_u8; DiskArea::SIZE];
            self.flash.read(desc.offset, &mut raw)?;
            let disk_area: DiskArea = pod_read_unaligned(&raw);

            if !disk_area.magic_is_set() {
                info!("fzfs", "area at {:#x} is unformatted, skipping", desc.offset);
                continue;
            }
            if disk_area.is_scratch() && self.scratch_idx.is_some() {
                // Only one scratch area is permitted; ignore impostors.
                error!("fzfs", "duplicate scratch area at {:#x} ignored", desc.offset);
                continue;
            }

            let area_idx = self.areas.len();
            let is_scratch = disk_area.is_scratch();
            self.areas.push(Area {
                offset: desc.offset,
                length: desc.length,
                cur: if is_scratch {
                    DiskArea::ID_OFFSET as u32
                } else {
                    DiskArea::SIZE as u32
                },
                gc_seq: disk_area.gc_seq,
                id: disk_area.id,
            });

            if is_scratch {
                self.scratch_idx = Some(area_idx);
            } else {
                self.restore_area_contents(area_idx, &mut largest_payload)?;
            }
        }

        if self.scratch_idx.is_none() {
            // The system may have died in the middle of a garbage
            // collection cycle; look for the half-written destination.
            self.restore_corrupt_scratch(&mut largest_payload)?;
        }
        self.validate_scratch()?;

        self.ensure_lost_found()?;
        self.restore_sweep()?;
        self.validate_root()?;

        self.set_max_block_data_sz(largest_payload);

        info!(
            "fzfs",
            "mounted: {} areas, {} objects, block_max_data_sz = {}",
            self.areas.len(),
            self.hash.len(),
            self.block_max_data_sz
        );

        Ok(())
    }

    /// Replays one area's log into the index.
    ///
    /// The scan stops at the erased end-of-log marker, at a truncated
    /// record, or at an unrecognized magic. Individual records that fail
    /// validation are skipped; corruption of one object must not take the
    /// rest of the area down with it.
    fn restore_area_contents(
        &mut self,
        area_idx: usize,
        largest_payload: &mut u16,
    ) -> CanFail<FsError> {
        let area_len = self.areas[area_idx].length;
        let mut offset = DiskArea::SIZE as u32;

        loop {
            if offset + 4 > area_len {
                break;
            }

            let mut magic_raw = [0_u8; 4];
            self.areas[area_idx].read(self.flash.as_ref(), offset, &mut magic_raw)?;
            let magic = u32::from_le_bytes(magic_raw);

            let record_size = match magic {
                MAGIC_ERASED => break,
                INODE_MAGIC => {
                    if offset + DiskInode::SIZE as u32 > area_len {
                        break;
                    }
                    let disk_inode =
                        inode_read_disk(self.flash.as_ref(), &self.areas[area_idx], offset)?;
                    let size = DiskInode::SIZE as u32 + u32::from(disk_inode.filename_len);
                    if offset + size > area_len {
                        break;
                    }

                    if let Err(e) = self.restore_inode(&disk_inode, area_idx, offset) {
                        error!(
                            "fzfs",
                            "skipping inode record at area {} offset {:#x}: {}", area_idx, offset, e
                        );
                    }
                    size
                }
                BLOCK_MAGIC => {
                    if offset + DiskBlock::SIZE as u32 > area_len {
                        break;
                    }
                    let disk_block =
                        block_read_disk(self.flash.as_ref(), &self.areas[area_idx], offset)?;
                    let size = DiskBlock::SIZE as u32 + u32::from(disk_block.data_len);
                    if offset + size > area_len {
                        break;
                    }

                    if let Err(e) =
                        self.restore_block(&disk_block, area_idx, offset, largest_payload)
                    {
                        error!(
                            "fzfs",
                            "skipping block record at area {} offset {:#x}: {}", area_idx, offset, e
                        );
                    }
                    size
                }
                _ => {
                    error!(
                        "fzfs",
                        "unrecognized magic {:#010x} at area {} offset {:#x}, ending scan",
                        magic,
                        area_idx,
                        offset
                    );
                    break;
                }
            };

            offset += record_size;
        }

        self.areas[area_idx].cur = offset;

        Ok(())
    }

    fn restore_dummy_inode(&mut self, id: ObjectId) {
        if !self.hash.contains(id) {
            self.hash
                .insert(HashEntry::Inode(InodeEntry::new_dummy(id)));
        }
    }

    /// Replays one inode record, applying the superseding rules: a dummy is
    /// always replaced, otherwise the strictly greater sequence number
    /// wins, and an equal sequence number is a corruption signal.
    fn restore_inode(
        &mut self,
        disk_inode: &DiskInode,
        area_idx: usize,
        offset: u32,
    ) -> CanFail<FsError> {
        disk_inode.crc_validate(self.flash.as_ref(), &self.areas[area_idx], offset)?;

        let id = ObjectId::from_raw(disk_inode.id).ok_or(FsError::Corrupt)?;
        if !id.is_inode() || id.is_dir() != disk_inode.flags.contains(InodeFlags::DIRECTORY) {
            return Err(FsError::Corrupt);
        }
        self.hash.note_restored_id(id);

        let loc = FlashLoc::new(area_idx as u8, offset);

        if self.hash.contains(id) {
            let old_is_dummy = self.hash.inode(id)?.is_dummy();
            if !old_is_dummy {
                let old_seq = self.inode_from_id(id)?.seq;
                if old_seq == disk_inode.seq {
                    // A duplicate of a previously-read record; this should
                    // never happen on an intact image.
                    return Err(FsError::Corrupt);
                }
                if old_seq > disk_inode.seq {
                    return Ok(());
                }

                // The new record supersedes: sever the old parent link, the
                // record carries the current one.
                self.inode_remove_child(id)?;
            }
        } else {
            self.restore_dummy_inode(id);
        }

        let mut prefix = [0_u8; NAME_PREFIX_LEN];
        let cached = usize::min(usize::from(disk_inode.filename_len), NAME_PREFIX_LEN);
        if cached > 0 {
            self.areas[area_idx].read(
                self.flash.as_ref(),
                offset + DiskInode::SIZE as u32,
                &mut prefix[..cached],
            )?;
        }

        let entry = self.hash.inode_mut(id)?;
        entry.loc = Some(loc);
        entry.refcnt = 1;
        entry.name_len = disk_inode.filename_len;
        entry.name_prefix = prefix;

        if let Some(parent_id) = ObjectId::from_raw(disk_inode.parent_id) {
            self.restore_dummy_inode(parent_id);
            self.inode_add_child(parent_id, id)?;
        }

        if id == ObjectId::ROOT && disk_inode.is_root() {
            self.root_dir = Some(id);
        }

        Ok(())
    }

    /// Replays one block record, tracking the owner's newest block through
    /// the `prev` linkage as records stream by in log order.
    fn restore_block(
        &mut self,
        disk_block: &DiskBlock,
        area_idx: usize,
        offset: u32,
        largest_payload: &mut u16,
    ) -> CanFail<FsError> {
        disk_block.crc_validate(self.flash.as_ref(), &self.areas[area_idx], offset)?;

        let id = ObjectId::from_raw(disk_block.id).ok_or(FsError::Corrupt)?;
        let inode_id = ObjectId::from_raw(disk_block.inode_id).ok_or(FsError::Corrupt)?;
        if !id.is_block() || !inode_id.is_file() {
            return Err(FsError::Corrupt);
        }
        self.hash.note_restored_id(id);

        let prev = ObjectId::from_raw(disk_block.prev_id);
        let loc = FlashLoc::new(area_idx as u8, offset);

        if self.hash.contains(id) {
            // A non-block entry under a block id means the image lies about
            // its id ranges.
            self.hash.block(id)?;

            let old_seq = self.block_from_id(id)?.seq;
            if old_seq == disk_block.seq {
                return Err(FsError::Corrupt);
            }
            if old_seq > disk_block.seq {
                return Ok(());
            }

            self.block_delete_from_ram(id)?;
        }

        self.restore_dummy_inode(inode_id);
        self.hash.insert(HashEntry::Block(BlockEntry { id, loc, prev }));

        let owner = self.hash.inode_mut(inode_id)?;
        if owner.last_block().is_none() || owner.last_block() == prev {
            owner.set_last_block(Some(id));
        }

        if disk_block.data_len > *largest_payload {
            *largest_payload = disk_block.data_len;
        }

        Ok(())
    }

    /// Repairs the aftermath of a garbage collection cycle that died after
    /// the scratch handoff but before the victim's erase: two live areas
    /// share an id, and the one with less data is the half-written
    /// destination.
    fn restore_corrupt_scratch(&mut self, largest_payload: &mut u16) -> CanFail<FsError> {
        let (good_idx, bad_idx) =
            find_corrupt_scratch(&self.areas).map_err(|_| FsError::Corrupt)?;

        info!(
            "fzfs",
            "interrupted gc: area {} is authoritative, reverting area {} to scratch",
            good_idx,
            bad_idx
        );

        // Invalidate every object resident in the aborted destination:
        // blocks leave the index, inodes fall back to dummies until the
        // authoritative area resolves them again.
        let ids: Vec<ObjectId> = self.hash.ids().collect();
        for id in ids {
            let in_bad_area = match self.hash.find(id) {
                Some(HashEntry::Block(block)) => usize::from(block.loc.area_idx()) == bad_idx,
                Some(HashEntry::Inode(inode)) => inode
                    .loc
                    .map(|loc| usize::from(loc.area_idx()) == bad_idx)
                    .unwrap_or(false),
                None => false,
            };
            if !in_bad_area {
                continue;
            }

            if id.is_block() {
                self.block_delete_from_ram(id)?;
            } else {
                let entry = self.hash.inode_mut(id)?;
                entry.loc = None;
                entry.refcnt = 0;
            }
        }

        // Re-replay the authoritative area to resolve the invalidated
        // objects, then hand the bad area back to the collector.
        self.restore_area_contents(good_idx, largest_payload)?;
        self.format_area(bad_idx, true)?;
        self.scratch_idx = Some(bad_idx);

        Ok(())
    }

    fn ensure_lost_found(&mut self) -> CanFail<FsError> {
        if self.root_dir.is_none() {
            return Err(FsError::Corrupt);
        }

        let id = match self.path_new_dir(b"/lost+found") {
            Ok(id) => id,
            Err(FsError::Exists) => self.path_find_existing(b"/lost+found")?,
            Err(e) => return Err(e),
        };
        self.lost_found = Some(id);

        Ok(())
    }

    /// Moves every child of a dummy directory into `/lost+found/<id>/`.
    fn migrate_orphans(&mut self, dir_id: ObjectId) -> CanFail<FsError> {
        let sub_path = alloc::format!("/lost+found/{}", dir_id.raw());
        let sub = match self.path_new_dir(sub_path.as_bytes()) {
            Ok(id) => id,
            Err(FsError::Exists) => self.path_find_existing(sub_path.as_bytes())?,
            Err(e) => return Err(e),
        };

        info!(
            "fzfs",
            "migrating children of missing directory {} to {}", dir_id, sub_path.as_str()
        );

        loop {
            let Some(&child) = self.hash.inode(dir_id)?.children().first() else {
                break;
            };

            let child_name = self.inode_read_name(child)?;
            self.inode_remove_child(child)?;
            self.inode_rename(child, Some(sub), &child_name)?;
            self.inode_add_child(sub, child)?;
        }

        Ok(())
    }

    /// Post-replay cleanup: dummy directories surrender their children to
    /// `/lost+found/`, dead and dummy inodes leave RAM with their blocks,
    /// file chains are CRC-checked and truncated at the first corruption,
    /// and block entries no chain references are dropped.
    fn restore_sweep(&mut self) -> CanFail<FsError> {
        let ids: Vec<ObjectId> = self.hash.ids().filter(|id| id.is_inode()).collect();

        for id in ids {
            let Ok(entry) = self.hash.inode(id) else {
                // Already removed alongside an earlier subtree.
                continue;
            };

            if id.is_dir() && entry.is_dummy() && !entry.children().is_empty() {
                self.migrate_orphans(id)?;
            }

            let entry = self.hash.inode(id)?;
            let mut delete = entry.is_dummy();
            if !delete && id != ObjectId::ROOT && entry.parent.is_none() {
                delete = true;
            }

            if delete {
                self.inode_remove_child(id)?;
                self.inode_delete_from_ram(id)?;
                continue;
            }

            if id.is_file() {
                self.sweep_validate_chain(id)?;
            }
        }

        // Superseded records bypassed by newer `prev` links can leave block
        // entries no chain reaches; drop them so the collector never has to
        // chase them.
        let mut reachable: HashSet<ObjectId> = HashSet::new();
        let file_ids: Vec<ObjectId> = self.hash.ids().filter(|id| id.is_file()).collect();
        for file_id in file_ids {
            let mut cursor = self.hash.inode(file_id)?.last_block();
            while let Some(block_id) = cursor {
                if !reachable.insert(block_id) {
                    break;
                }
                cursor = self.hash.block(block_id).ok().and_then(|b| b.prev);
            }
        }

        let block_ids: Vec<ObjectId> = self.hash.ids().filter(|id| id.is_block()).collect();
        for block_id in block_ids {
            if !reachable.contains(&block_id) {
                self.hash.remove(block_id);
            }
        }

        Ok(())
    }

    /// CRC-walks a file's chain from its tail. On the first bad or missing
    /// block, the chain is truncated: the bad block and everything newer
    /// are dropped, and the bad block's predecessor (when known) becomes
    /// the file's tail.
    fn sweep_validate_chain(&mut self, file_id: ObjectId) -> CanFail<FsError> {
        let mut cursor = self.hash.inode(file_id)?.last_block();
        let mut walked: Vec<ObjectId> = Vec::new();

        while let Some(block_id) = cursor {
            let Ok(entry) = self.hash.block(block_id) else {
                walked.push(block_id);
                self.sweep_truncate_chain(file_id, &walked, None)?;
                return Ok(());
            };
            let entry = *entry;

            let area = &self.areas[usize::from(entry.loc.area_idx())];
            let valid = match block_read_disk(self.flash.as_ref(), area, entry.loc.offset()) {
                Ok(disk_block) => {
                    disk_block.id == block_id.raw()
                        && disk_block
                            .crc_validate(self.flash.as_ref(), area, entry.loc.offset())
                            .is_ok()
                }
                Err(_) => false,
            };

            walked.push(block_id);
            if !valid {
                self.sweep_truncate_chain(file_id, &walked, entry.prev)?;
                return Ok(());
            }

            cursor = entry.prev;
        }

        Ok(())
    }

    fn sweep_truncate_chain(
        &mut self,
        file_id: ObjectId,
        drop: &[ObjectId],
        new_last: Option<ObjectId>,
    ) -> CanFail<FsError> {
        error!(
            "fzfs",
            "file {} has a corrupt block chain, truncating {} blocks",
            file_id,
            drop.len()
        );

        for &block_id in drop {
            self.hash.remove(block_id);
        }

        let new_last = new_last.filter(|&id| self.hash.block(id).is_ok());
        self.hash.inode_mut(file_id)?.set_last_block(new_last);

        Ok(())
    }
}
