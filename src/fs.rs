//! File-system instance and public entry points.
//!
//! All mutable state (area array, object index, id allocators, cache) lives
//! in one [`FsCore`] value. The public [`FzFs`] wrapper owns the core behind
//! a coarse mutex: every entry point locks on entry and releases on every
//! exit path, serializing callers exactly as the on-flash log format
//! requires. Re-entrant calls from within the core are impossible by
//! construction.

use alloc::boxed::Box;
use alloc::vec::Vec;

use spin::Mutex;

use crate::area::Area;
pub use crate::area::AreaDesc;
use crate::cache::BlockCache;
use crate::config::FsConfig;
use crate::disk::{DiskArea, DiskBlock};
use crate::errors::{CanFail, FsError, FsResult};
pub use crate::file::{Access, FzFile};
use crate::flash::FlashDriver;
use crate::hash::{HashIndex, ObjectId};

/// Hard ceiling for a block's payload size.
pub(crate) const BLOCK_MAX_DATA_SZ_MAX: u16 = 2048;

/// The complete mutable state of one mounted file system.
pub(crate) struct FsCore {
    pub(crate) flash: Box<dyn FlashDriver + Send>,
    pub(crate) areas: Vec<Area>,
    pub(crate) scratch_idx: Option<usize>,
    pub(crate) hash: HashIndex,
    pub(crate) root_dir: Option<ObjectId>,
    pub(crate) lost_found: Option<ObjectId>,
    pub(crate) block_max_data_sz: u16,
    pub(crate) cache: BlockCache,
    pub(crate) config: FsConfig,
}

impl FsCore {
    pub(crate) fn new(flash: Box<dyn FlashDriver + Send>, config: FsConfig) -> Self {
        Self {
            flash,
            areas: Vec::new(),
            scratch_idx: None,
            hash: HashIndex::new(config.hash_capacity),
            root_dir: None,
            lost_found: None,
            block_max_data_sz: u16::min(config.block_max_data_sz, BLOCK_MAX_DATA_SZ_MAX),
            cache: BlockCache::new(config.cache_inode_count, config.cache_block_count),
            config,
        }
    }

    /// Whether a file system has been formatted or detected.
    pub(crate) fn ready(&self) -> bool {
        self.root_dir.is_some()
    }

    /// Drops every piece of RAM state, leaving the instance unready.
    pub(crate) fn reset_ram(&mut self) {
        self.areas.clear();
        self.scratch_idx = None;
        self.hash.reset();
        self.root_dir = None;
        self.lost_found = None;
        self.cache.clear();
        self.block_max_data_sz = u16::min(self.config.block_max_data_sz, BLOCK_MAX_DATA_SZ_MAX);
    }

    /// Finds a non-scratch area with `size` free bytes, garbage collecting
    /// if none has room. Returns `(area_idx, offset)` of the reservation.
    pub(crate) fn reserve_space(&mut self, size: u32) -> FsResult<(usize, u32)> {
        for (i, area) in self.areas.iter().enumerate() {
            if Some(i) == self.scratch_idx {
                continue;
            }
            if area.free_space() >= size {
                return Ok((i, area.cur));
            }
        }

        let area_idx = self.gc_until(size)?;
        Ok((area_idx, self.areas[area_idx].cur))
    }

    /// The scratch area must exist and be at least as large as every live
    /// area, or copy-forward collection could overflow it.
    pub(crate) fn validate_scratch(&self) -> CanFail<FsError> {
        let Some(scratch_idx) = self.scratch_idx else {
            return Err(FsError::Corrupt);
        };

        let scratch_len = self.areas[scratch_idx].length;
        if self.areas.iter().any(|a| a.length > scratch_len) {
            return Err(FsError::Corrupt);
        }

        Ok(())
    }

    pub(crate) fn validate_root(&self) -> CanFail<FsError> {
        if self.root_dir.is_none() {
            return Err(FsError::Corrupt);
        }

        Ok(())
    }

    /// Sets the effective block payload bound from the area geometry: the
    /// smallest area must be able to hold two maximal blocks. `floor` is the
    /// largest payload already resident on flash; the bound never drops
    /// below it.
    pub(crate) fn set_max_block_data_sz(&mut self, floor: u16) {
        let smallest = self
            .areas
            .iter()
            .map(|a| a.length)
            .min()
            .unwrap_or(u32::from(BLOCK_MAX_DATA_SZ_MAX));

        let half = ((smallest - DiskArea::SIZE as u32) / 2).saturating_sub(DiskBlock::SIZE as u32);
        let target = u16::min(self.config.block_max_data_sz, BLOCK_MAX_DATA_SZ_MAX);

        let mut bound = if half < u32::from(target) {
            half as u16
        } else {
            target
        };
        if bound < floor {
            bound = floor;
        }

        self.block_max_data_sz = bound;
    }
}

/// A flash-resident log-structured file system.
///
/// Construct one over a [`FlashDriver`], then either [`format`](Self::format)
/// a fresh file system or [`detect`](Self::detect) an existing one. Every
/// operation serializes on an internal mutex; handles returned by
/// [`open`](Self::open) stay valid until passed to [`close`](Self::close),
/// even across an `unlink` of their path.
pub struct FzFs {
    core: Mutex<FsCore>,
}

impl FzFs {
    /// Creates an unmounted instance with default configuration.
    pub fn new(flash: Box<dyn FlashDriver + Send>) -> Self {
        Self::with_config(flash, FsConfig::default())
    }

    pub fn with_config(flash: Box<dyn FlashDriver + Send>, config: FsConfig) -> Self {
        Self {
            core: Mutex::new(FsCore::new(flash, config)),
        }
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> spin::MutexGuard<'_, FsCore> {
        self.core.lock()
    }

    /// Tears the instance down, handing the flash driver back to the
    /// caller. Any state not yet on flash is lost, exactly as a power cut
    /// would lose it.
    pub fn into_flash(self) -> Box<dyn FlashDriver + Send> {
        self.core.into_inner().flash
    }

    /// Erases the given areas and initializes an empty file system on them.
    pub fn format(&self, descs: &[AreaDesc]) -> CanFail<FsError> {
        let mut core = self.core.lock();

        let rc = core.format_full(descs);
        if rc.is_err() {
            core.reset_ram();
        }
        rc
    }

    /// Searches the given areas for an existing file system and reconstructs
    /// the in-memory state from it, repairing the effects of interrupted
    /// garbage collection on the way.
    pub fn detect(&self, descs: &[AreaDesc]) -> CanFail<FsError> {
        let mut core = self.core.lock();

        let rc = core.restore_full(descs);
        if rc.is_err() {
            core.reset_ram();
        }
        rc
    }

    /// Whether a file system is present, either via format or detection.
    pub fn ready(&self) -> bool {
        self.core.lock().ready()
    }

    /// Opens a file. See [`Access`] for the flag combinations.
    pub fn open(&self, path: &str, access: Access) -> FsResult<FzFile> {
        let mut core = self.core.lock();

        if !core.ready() {
            return Err(FsError::Uninit);
        }
        core.file_open(path.as_bytes(), access)
    }

    /// Closes a handle; if the file was unlinked and this was the last
    /// handle, the file's storage becomes collectable.
    pub fn close(&self, file: FzFile) -> CanFail<FsError> {
        self.core.lock().file_close(file)
    }

    /// Reads at the handle's position. Short reads at end-of-file succeed
    /// with the actual byte count.
    pub fn read(&self, file: &mut FzFile, buf: &mut [u8]) -> FsResult<usize> {
        let mut core = self.core.lock();

        if !core.ready() {
            return Err(FsError::Uninit);
        }
        core.file_read(file, buf)
    }

    /// Writes at the handle's position (or at end-of-file for append
    /// handles) and advances it past the written bytes.
    pub fn write(&self, file: &mut FzFile, data: &[u8]) -> CanFail<FsError> {
        let mut core = self.core.lock();

        if !core.ready() {
            return Err(FsError::Uninit);
        }
        core.file_write(file, data)
    }

    /// Repositions the handle; offsets beyond end-of-file are `Range`
    /// errors.
    pub fn seek(&self, file: &mut FzFile, offset: u32) -> CanFail<FsError> {
        self.core.lock().file_seek(file, offset)
    }

    /// Current read/write position of a handle.
    pub fn getpos(&self, file: &FzFile) -> u32 {
        file.offset
    }

    /// Current length of the open file, in bytes.
    pub fn file_len(&self, file: &FzFile) -> FsResult<u32> {
        self.core.lock().inode_data_len(file.inode_id)
    }

    /// Unlinks a file or directory (recursively). Open handles keep
    /// unlinked files alive until closed.
    pub fn unlink(&self, path: &str) -> CanFail<FsError> {
        let mut core = self.core.lock();

        if !core.ready() {
            return Err(FsError::Uninit);
        }
        core.path_unlink(path.as_bytes())
    }

    /// Renames and/or moves a file or directory. An existing destination of
    /// the same kind is clobbered.
    pub fn rename(&self, from: &str, to: &str) -> CanFail<FsError> {
        let mut core = self.core.lock();

        if !core.ready() {
            return Err(FsError::Uninit);
        }
        core.path_rename(from.as_bytes(), to.as_bytes())
    }

    /// Creates a directory; every intermediate directory must already
    /// exist.
    pub fn mkdir(&self, path: &str) -> CanFail<FsError> {
        let mut core = self.core.lock();

        if !core.ready() {
            return Err(FsError::Uninit);
        }
        core.path_new_dir(path.as_bytes()).map(|_| ())
    }

    /// Runs one garbage-collection cycle unconditionally.
    pub fn force_gc(&self) -> CanFail<FsError> {
        let mut core = self.core.lock();

        if !core.ready() {
            return Err(FsError::Uninit);
        }
        core.gc().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::{Access, AreaDesc};
    use crate::errors::FsError;
    use crate::flash::MemFlash;
    use crate::testutil::{
        check_invariants, new_formatted_fs, read_back, remount, standard_areas, write_new_file,
    };

    #[test]
    fn operations_before_mount_report_uninitialized() {
        let fs = super::FzFs::new(alloc::boxed::Box::new(MemFlash::new(0x10000)));

        assert!(!fs.ready());
        assert_eq!(fs.open("/x", Access::READ).unwrap_err(), FsError::Uninit);
        assert_eq!(fs.mkdir("/x"), Err(FsError::Uninit));
        assert_eq!(fs.unlink("/x"), Err(FsError::Uninit));
    }

    #[test]
    fn format_then_detect_yields_an_empty_file_system() {
        let fs = new_formatted_fs();
        let fs = remount(fs);

        assert!(fs.ready());

        let core = fs.core();
        let root = core.hash.inode(crate::hash::ObjectId::ROOT).unwrap();
        assert_eq!(root.children().len(), 1);
        assert_eq!(
            core.inode_read_name(root.children()[0]).unwrap(),
            b"lost+found"
        );
    }

    #[test]
    fn content_survives_a_remount() {
        let fs = new_formatted_fs();
        fs.mkdir("/docs").unwrap();
        write_new_file(&fs, "/docs/readme.txt", &[b"written before remount"]);

        let fs = remount(fs);

        assert_eq!(read_back(&fs, "/docs/readme.txt"), b"written before remount");
        check_invariants(&fs);
    }

    #[test]
    fn detect_on_blank_flash_is_corrupt_and_leaves_the_fs_unready() {
        let fs = super::FzFs::new(alloc::boxed::Box::new(MemFlash::new(0x10000)));

        assert_eq!(fs.detect(&standard_areas()), Err(FsError::Corrupt));
        assert!(!fs.ready());
    }

    #[test]
    fn degenerate_area_layouts_are_rejected() {
        let fs = super::FzFs::new(alloc::boxed::Box::new(MemFlash::new(0x10000)));

        assert_eq!(fs.format(&[]), Err(FsError::Invalid));
        assert_eq!(
            fs.format(&[AreaDesc {
                offset: 0,
                length: 8
            }]),
            Err(FsError::Invalid)
        );
    }

    #[test]
    fn many_small_files_round_trip_across_gc_and_remount() {
        let fs = new_formatted_fs();

        for i in 0..24_u32 {
            let path = alloc::format!("/file-{i:02}");
            let body = alloc::format!("contents of file number {i}");
            write_new_file(&fs, &path, &[body.as_bytes()]);
        }
        fs.force_gc().unwrap();

        let fs = remount(fs);
        for i in 0..24_u32 {
            let path = alloc::format!("/file-{i:02}");
            let body = alloc::format!("contents of file number {i}");
            assert_eq!(read_back(&fs, &path), body.as_bytes());
        }
        check_invariants(&fs);
    }
}
