//! Shared fixtures for the test suite: a shareable NOR flash double, the
//! standard area layout, and invariant checks run after interesting
//! operations.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::Ordering;

use crate::area::AreaDesc;
use crate::errors::{CanFail, FsError};
use crate::flash::{FlashDriver, MemFlash};
use crate::fs::{Access, FzFs};
use crate::hash::{HashEntry, ObjectId};

pub(crate) type FlashHandle = Arc<spin::Mutex<MemFlash>>;

/// A cloneable handle over one [`MemFlash`], letting tests keep access to
/// the raw image (for corruption surgery and remounts) while the file
/// system owns its driver box.
pub(crate) struct SharedFlash(pub(crate) FlashHandle);

impl FlashDriver for SharedFlash {
    fn read(&self, offset: u32, buf: &mut [u8]) -> CanFail<FsError> {
        self.0.lock().read(offset, buf)
    }

    fn write(&mut self, offset: u32, buf: &[u8]) -> CanFail<FsError> {
        self.0.lock().write(offset, buf)
    }

    fn erase(&mut self, offset: u32, len: u32) -> CanFail<FsError> {
        self.0.lock().erase(offset, len)
    }
}

pub(crate) fn shared_flash(size: usize) -> (SharedFlash, FlashHandle) {
    let handle = Arc::new(spin::Mutex::new(MemFlash::new(size)));
    (SharedFlash(handle.clone()), handle)
}

/// The 4 x 16K layout most tests run on.
pub(crate) fn standard_areas() -> [AreaDesc; 4] {
    [
        AreaDesc {
            offset: 0x0000,
            length: 0x4000,
        },
        AreaDesc {
            offset: 0x4000,
            length: 0x4000,
        },
        AreaDesc {
            offset: 0x8000,
            length: 0x4000,
        },
        AreaDesc {
            offset: 0xC000,
            length: 0x4000,
        },
    ]
}

pub(crate) fn new_formatted_fs() -> FzFs {
    let fs = FzFs::new(Box::new(MemFlash::new(0x10000)));
    fs.format(&standard_areas()).unwrap();
    fs
}

/// Tears the instance down and mounts the same flash again via detection.
pub(crate) fn remount(fs: FzFs) -> FzFs {
    let flash = fs.into_flash();
    let fs = FzFs::new(flash);
    fs.detect(&standard_areas()).unwrap();
    fs
}

/// Creates `path` and appends each chunk with a separate write call, so a
/// file with `chunks.len()` blocks comes back. Returns the file's object
/// id.
pub(crate) fn write_new_file(fs: &FzFs, path: &str, chunks: &[&[u8]]) -> ObjectId {
    let mut f = fs.open(path, Access::WRITE | Access::APPEND).unwrap();
    for chunk in chunks {
        fs.write(&mut f, chunk).unwrap();
    }
    fs.close(f).unwrap();

    fs.core().path_find_existing(path.as_bytes()).unwrap()
}

/// Reads a file's entire contents.
pub(crate) fn read_back(fs: &FzFs, path: &str) -> Vec<u8> {
    let mut f = fs.open(path, Access::READ).unwrap();
    let len = fs.file_len(&f).unwrap() as usize;

    let mut data = alloc::vec![0_u8; len];
    let mut done = 0;
    while done < len {
        let n = fs.read(&mut f, &mut data[done..]).unwrap();
        assert!(n > 0, "unexpected zero-length read");
        done += n;
    }
    fs.close(f).unwrap();

    data
}

/// Number of blocks in a file's chain.
pub(crate) fn block_count(fs: &FzFs, path: &str) -> usize {
    let core = fs.core();
    let id = core.path_find_existing(path.as_bytes()).unwrap();
    core.chain_forward(id).unwrap().len()
}

/// Structural invariants that must hold after any entry point.
pub(crate) fn check_invariants(fs: &FzFs) {
    let core = fs.core();

    // One scratch area, at least as large as every live area.
    let scratch_idx = core.scratch_idx.expect("no scratch area");
    let scratch_len = core.areas[scratch_idx].length;
    for area in &core.areas {
        assert!(area.length <= scratch_len, "scratch area is not the largest");
        assert!(area.cur <= area.length, "area cursor ran past its end");
    }

    let ids: Vec<ObjectId> = core.hash.ids().collect();
    for &id in &ids {
        match core.hash.find(id).unwrap() {
            HashEntry::Inode(entry) => {
                // Every record pointed at by the index must validate.
                if let Some(loc) = entry.loc {
                    let area = &core.areas[usize::from(loc.area_idx())];
                    let disk_inode =
                        crate::inode::inode_read_disk(core.flash.as_ref(), area, loc.offset())
                            .expect("unreadable inode record");
                    disk_inode
                        .crc_validate(core.flash.as_ref(), area, loc.offset())
                        .expect("inode record fails its CRC");
                    assert_eq!({ disk_inode.id }, id.raw());
                }

                // Children sorted strictly ascending, each pointing back.
                let children = entry.children();
                for pair in children.windows(2) {
                    let b_name = core.inode_read_name(pair[1]).unwrap();
                    assert_eq!(
                        core.inode_filename_cmp(pair[0], &b_name).unwrap(),
                        Ordering::Less,
                        "child list out of order under {id}"
                    );
                }
                for &child in children {
                    assert_eq!(
                        core.hash.inode(child).unwrap().parent,
                        Some(id),
                        "child {child} does not point back at {id}"
                    );
                }

                // Parent chains terminate at the root without cycles.
                let mut seen = Vec::new();
                let mut cursor = entry.parent;
                while let Some(parent_id) = cursor {
                    assert!(!seen.contains(&parent_id), "parent cycle at {parent_id}");
                    seen.push(parent_id);
                    cursor = core.hash.inode(parent_id).unwrap().parent;
                }
                if entry.parent.is_some() {
                    assert_eq!(seen.last(), Some(&ObjectId::ROOT));
                }

                // File chains visit each block exactly once and end at a
                // block with no predecessor.
                if id.is_file() {
                    let mut visited = Vec::new();
                    let mut cursor = entry.last_block();
                    while let Some(block_id) = cursor {
                        assert!(
                            !visited.contains(&block_id),
                            "block {block_id} appears twice in {id}'s chain"
                        );
                        visited.push(block_id);
                        cursor = core.hash.block(block_id).unwrap().prev;
                    }
                }
            }
            HashEntry::Block(entry) => {
                let area = &core.areas[usize::from(entry.loc.area_idx())];
                let disk_block =
                    crate::block::block_read_disk(core.flash.as_ref(), area, entry.loc.offset())
                        .expect("unreadable block record");
                disk_block
                    .crc_validate(core.flash.as_ref(), area, entry.loc.offset())
                    .expect("block record fails its CRC");
                assert_eq!({ disk_block.id }, id.raw());
            }
        }
    }
}
