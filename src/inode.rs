//! Inode subsystem: metadata records, directory membership, reference
//! counting and unlink.
//!
//! Directories own an ordered child list; files own a reverse block chain.
//! Filenames live on flash with the inode record; only a short prefix is
//! cached in RAM, so comparisons against long names stream the remainder
//! from flash in bounded chunks.

use alloc::vec::Vec;
use bytemuck::{bytes_of, pod_read_unaligned};
use core::cmp::Ordering;

use crate::area::Area;
use crate::disk::{DiskInode, InodeFlags, INODE_MAGIC, MAGIC_ERASED};
use crate::errors::{CanFail, FsError, FsResult};
use crate::flash::FlashDriver;
use crate::fs::FsCore;
use crate::hash::{FlashLoc, HashEntry, InodeEntry, InodeState, ObjectId, NAME_PREFIX_LEN};

/// Buffer size used when comparing flash-resident filename bytes.
const NAME_CHUNK_SZ: usize = 64;

/// Fully-populated view of one inode record.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Inode {
    pub(crate) id: ObjectId,
    pub(crate) seq: u32,
    pub(crate) parent: Option<ObjectId>,
    pub(crate) flags: InodeFlags,
    pub(crate) filename_len: u8,
}

/// Reads and magic-checks an inode header from an area log.
pub(crate) fn inode_read_disk(
    flash: &dyn FlashDriver,
    area: &Area,
    area_offset: u32,
) -> FsResult<DiskInode> {
    let mut raw = [0_u8; DiskInode::SIZE];
    area.read(flash, area_offset, &mut raw)?;

    let disk_inode: DiskInode = pod_read_unaligned(&raw);
    if disk_inode.magic == MAGIC_ERASED {
        return Err(FsError::Empty);
    }
    if disk_inode.magic != INODE_MAGIC {
        return Err(FsError::Unexpected);
    }

    Ok(disk_inode)
}

/// Refreshes an entry's RAM-cached name length and prefix.
pub(crate) fn set_name_cache(entry: &mut InodeEntry, name: &[u8]) {
    entry.name_len = name.len() as u8;
    entry.name_prefix = [0; NAME_PREFIX_LEN];

    let cached = usize::min(name.len(), NAME_PREFIX_LEN);
    entry.name_prefix[..cached].copy_from_slice(&name[..cached]);
}

impl FsCore {
    /// Materializes the full view of an indexed inode from its on-flash
    /// record. Dummies synthesize an empty view.
    pub(crate) fn inode_from_id(&self, id: ObjectId) -> FsResult<Inode> {
        let entry = self.hash.inode(id)?;

        let Some(loc) = entry.loc else {
            let flags = if id.is_dir() {
                InodeFlags::DIRECTORY
            } else {
                InodeFlags::EMPTY
            };

            return Ok(Inode {
                id,
                seq: 0,
                parent: entry.parent,
                flags,
                filename_len: 0,
            });
        };

        let area = &self.areas[loc.area_idx() as usize];
        let disk_inode = inode_read_disk(self.flash.as_ref(), area, loc.offset())?;

        Ok(Inode {
            id,
            seq: disk_inode.seq,
            parent: entry.parent,
            flags: disk_inode.flags,
            filename_len: disk_inode.filename_len,
        })
    }

    /// Writes an inode record and its filename to a reserved log position.
    pub(crate) fn inode_write_disk(
        &mut self,
        disk_inode: &mut DiskInode,
        name: &[u8],
    ) -> FsResult<FlashLoc> {
        debug_assert_eq!(name.len(), usize::from(disk_inode.filename_len));

        disk_inode.crc_fill(name);

        let (area_idx, offset) =
            self.reserve_space(DiskInode::SIZE as u32 + name.len() as u32)?;

        let area = &mut self.areas[area_idx];
        area.write(self.flash.as_mut(), offset, bytes_of(disk_inode))?;
        if !name.is_empty() {
            area.write(self.flash.as_mut(), offset + DiskInode::SIZE as u32, name)?;
        }

        Ok(FlashLoc::new(area_idx as u8, offset))
    }

    /// Reads an inode's full filename from flash.
    pub(crate) fn inode_read_name(&self, id: ObjectId) -> FsResult<Vec<u8>> {
        let entry = self.hash.inode(id)?;
        let len = usize::from(entry.name_len);

        let Some(loc) = entry.loc else {
            return Ok(Vec::new());
        };

        let mut name = alloc::vec![0_u8; len];
        if len > 0 {
            let area = &self.areas[loc.area_idx() as usize];
            area.read(
                self.flash.as_ref(),
                loc.offset() + DiskInode::SIZE as u32,
                &mut name,
            )?;
        }

        Ok(name)
    }

    /// Compares an inode's filename against `name`: byte order over the
    /// shared prefix, length as the tiebreak.
    ///
    /// The RAM-cached prefix settles short names without touching flash;
    /// longer names stream the remainder from the record's trailer.
    pub(crate) fn inode_filename_cmp(&self, id: ObjectId, name: &[u8]) -> FsResult<Ordering> {
        let entry = self.hash.inode(id)?;
        let own_len = usize::from(entry.name_len);
        let shared = usize::min(own_len, name.len());

        let cached = usize::min(shared, NAME_PREFIX_LEN);
        match entry.name_prefix[..cached].cmp(&name[..cached]) {
            Ordering::Equal => {}
            other => return Ok(other),
        }

        if shared > NAME_PREFIX_LEN {
            let loc = entry.loc.ok_or(FsError::Corrupt)?;
            let area = &self.areas[loc.area_idx() as usize];
            let mut buf = [0_u8; NAME_CHUNK_SZ];
            let mut off = NAME_PREFIX_LEN;

            while off < shared {
                let chunk_len = usize::min(shared - off, NAME_CHUNK_SZ);
                area.read(
                    self.flash.as_ref(),
                    loc.offset() + DiskInode::SIZE as u32 + off as u32,
                    &mut buf[..chunk_len],
                )?;

                match buf[..chunk_len].cmp(&name[off..off + chunk_len]) {
                    Ordering::Equal => {}
                    other => return Ok(other),
                }

                off += chunk_len;
            }
        }

        Ok(own_len.cmp(&name.len()))
    }

    /// Inserts `child_id` into `parent_id`'s child list, preserving the
    /// strict ascending (bytes, length) order.
    ///
    /// Records already carrying equal names may coexist transiently while
    /// restore replays a log; user-facing creation rejects duplicates at the
    /// path layer before ever reaching this point.
    pub(crate) fn inode_add_child(
        &mut self,
        parent_id: ObjectId,
        child_id: ObjectId,
    ) -> CanFail<FsError> {
        let child_name = self.inode_read_name(child_id)?;

        let siblings: Vec<ObjectId> = self.hash.inode(parent_id)?.children().to_vec();
        let mut pos = siblings.len();
        for (i, sibling) in siblings.iter().enumerate() {
            if self.inode_filename_cmp(*sibling, &child_name)? == Ordering::Greater {
                pos = i;
                break;
            }
        }

        self.hash.inode_mut(parent_id)?.children_mut()?.insert(pos, child_id);
        self.hash.inode_mut(child_id)?.parent = Some(parent_id);

        Ok(())
    }

    /// Unlinks `child_id` from its parent's child list, if it has one.
    pub(crate) fn inode_remove_child(&mut self, child_id: ObjectId) -> CanFail<FsError> {
        let Some(parent_id) = self.hash.inode(child_id)?.parent else {
            return Ok(());
        };

        if let Ok(parent) = self.hash.inode_mut(parent_id) {
            if let Ok(children) = parent.children_mut() {
                children.retain(|&id| id != child_id);
            }
        }
        self.hash.inode_mut(child_id)?.parent = None;

        Ok(())
    }

    /// Creates a new file or directory inode: fresh id, record on flash,
    /// entry in the index, sorted insertion under `parent`.
    pub(crate) fn file_new(
        &mut self,
        parent: Option<ObjectId>,
        name: &[u8],
        is_dir: bool,
    ) -> FsResult<ObjectId> {
        if name.len() > 255 {
            return Err(FsError::Invalid);
        }

        let id = if is_dir {
            self.hash.alloc_dir_id()?
        } else {
            self.hash.alloc_file_id()?
        };

        let flags = if is_dir {
            InodeFlags::DIRECTORY
        } else {
            InodeFlags::EMPTY
        };

        let mut disk_inode = DiskInode {
            magic: INODE_MAGIC,
            id: id.raw(),
            seq: 0,
            parent_id: ObjectId::to_raw(parent),
            flags,
            reserved: 0xFF,
            filename_len: name.len() as u8,
            crc16: 0,
        };
        let loc = self.inode_write_disk(&mut disk_inode, name)?;

        let state = if is_dir {
            InodeState::Dir {
                children: Vec::new(),
            }
        } else {
            InodeState::File { last_block: None }
        };

        let mut entry = InodeEntry {
            id,
            loc: Some(loc),
            parent: None,
            refcnt: 1,
            name_len: 0,
            name_prefix: [0; NAME_PREFIX_LEN],
            state,
        };
        set_name_cache(&mut entry, name);
        self.hash.insert(HashEntry::Inode(entry));

        if let Some(parent_id) = parent {
            self.inode_add_child(parent_id, id)?;
        }

        Ok(id)
    }

    /// Writes a superseding record that marks the inode deleted: sequence
    /// bumped, no parent, empty filename.
    pub(crate) fn inode_delete_from_disk(&mut self, id: ObjectId) -> CanFail<FsError> {
        let inode = self.inode_from_id(id)?;

        let mut disk_inode = DiskInode {
            magic: INODE_MAGIC,
            id: id.raw(),
            seq: inode.seq + 1,
            parent_id: ObjectId::NONE_RAW,
            flags: inode.flags | InodeFlags::DELETED,
            reserved: 0xFF,
            filename_len: 0,
            crc16: 0,
        };
        let loc = self.inode_write_disk(&mut disk_inode, b"")?;

        // The entry must track the newest record: garbage collection copies
        // whatever the entry points at, and only the delete record keeps the
        // inode dead across a remount.
        let entry = self.hash.inode_mut(id)?;
        entry.loc = Some(loc);
        set_name_cache(entry, b"");

        Ok(())
    }

    /// Writes a superseding record that renames and/or reparents the inode,
    /// then retargets the entry at it. Sibling-list surgery is the caller's
    /// responsibility.
    pub(crate) fn inode_rename(
        &mut self,
        id: ObjectId,
        new_parent: Option<ObjectId>,
        name: &[u8],
    ) -> CanFail<FsError> {
        if name.len() > 255 {
            return Err(FsError::Invalid);
        }

        let inode = self.inode_from_id(id)?;

        let mut disk_inode = DiskInode {
            magic: INODE_MAGIC,
            id: id.raw(),
            seq: inode.seq + 1,
            parent_id: ObjectId::to_raw(new_parent),
            flags: inode.flags,
            reserved: 0xFF,
            filename_len: name.len() as u8,
            crc16: 0,
        };
        let loc = self.inode_write_disk(&mut disk_inode, name)?;

        let entry = self.hash.inode_mut(id)?;
        entry.loc = Some(loc);
        set_name_cache(entry, name);

        Ok(())
    }

    /// Drops one reference; at zero the inode and its subtree leave the RAM
    /// representation.
    pub(crate) fn inode_dec_refcnt(&mut self, id: ObjectId) -> CanFail<FsError> {
        let refcnt = {
            let entry = self.hash.inode_mut(id)?;
            debug_assert!(entry.refcnt > 0);
            entry.refcnt -= 1;
            entry.refcnt
        };

        if refcnt == 0 {
            self.inode_remove_child(id)?;
            self.inode_delete_from_ram(id)?;
        }

        Ok(())
    }

    /// Removes an inode and every descendant that holds no other reference
    /// from the RAM representation.
    ///
    /// Directories are processed through an explicit queue rather than
    /// recursion; the namespace depth is caller-controlled and must not be
    /// able to exhaust the stack.
    pub(crate) fn inode_delete_from_ram(&mut self, id: ObjectId) -> CanFail<FsError> {
        let mut queue = alloc::vec![id];

        while let Some(cur) = queue.pop() {
            let Some(HashEntry::Inode(entry)) = self.hash.remove(cur) else {
                continue;
            };
            self.cache.delete(cur);

            match entry.state {
                InodeState::File { last_block } => {
                    let mut cursor = last_block;
                    while let Some(block_id) = cursor {
                        cursor = match self.hash.block(block_id) {
                            Ok(block) => block.prev,
                            Err(_) => None,
                        };
                        self.hash.remove(block_id);
                    }
                }
                InodeState::Dir { children } => {
                    for child_id in children {
                        let Ok(child) = self.hash.inode_mut(child_id) else {
                            continue;
                        };

                        child.parent = None;
                        if child.refcnt > 0 {
                            child.refcnt -= 1;
                        }
                        if child.refcnt == 0 {
                            queue.push(child_id);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Unlinks the inode at the namespace level: one delete record for the
    /// inode itself, then the RAM subtree is unreferenced. Descendants need
    /// no records of their own; restore sweeps anything whose parent chain
    /// is dead.
    ///
    /// A file that still has open handles stays resident (and fully usable)
    /// until the last handle closes.
    pub(crate) fn inode_unlink(&mut self, id: ObjectId) -> CanFail<FsError> {
        if id == ObjectId::ROOT {
            return Err(FsError::Invalid);
        }

        self.inode_delete_from_disk(id)?;
        self.inode_remove_child(id)?;
        self.cache.delete(id);

        let refcnt = {
            let entry = self.hash.inode_mut(id)?;
            debug_assert!(entry.refcnt > 0);
            entry.refcnt -= 1;
            entry.refcnt
        };
        if refcnt == 0 {
            self.inode_delete_from_ram(id)?;
        }

        Ok(())
    }

}
