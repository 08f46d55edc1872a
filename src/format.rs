//! Area formatting and the scratch handoff primitive.

use bytemuck::bytes_of;

use crate::area::{validate_descs, Area, AreaDesc};
use crate::disk::{DiskArea, AREA_ID_NONE};
use crate::errors::{CanFail, FsError};
use crate::info;

impl crate::fs::FsCore {
    /// Erases an area and writes its header.
    ///
    /// A scratch header is written without its trailing id field, leaving
    /// those bytes erased; the id can then be programmed in place later
    /// without another erase cycle.
    pub(crate) fn format_area(&mut self, area_idx: usize, as_scratch: bool) -> CanFail<FsError> {
        let area = &mut self.areas[area_idx];

        self.flash.erase(area.offset, area.length)?;
        area.cur = 0;
        if as_scratch {
            area.id = AREA_ID_NONE;
        }

        let disk_area = area.to_disk();
        let raw = bytes_of(&disk_area);
        let write_len = if as_scratch {
            DiskArea::ID_OFFSET
        } else {
            DiskArea::SIZE
        };

        area.write(self.flash.as_mut(), 0, &raw[..write_len])
    }

    /// Converts the scratch area into a live area carrying `id`.
    ///
    /// Only the two id bytes are programmed; this is the atomic handoff
    /// point of a garbage-collection cycle. If the area turns out not to be
    /// scratch on flash (a previous cycle died between steps), it is
    /// reformatted outright.
    pub(crate) fn format_from_scratch_area(
        &mut self,
        area_idx: usize,
        id: u16,
    ) -> CanFail<FsError> {
        let mut raw = [0_u8; DiskArea::SIZE];
        self.areas[area_idx].read(self.flash.as_ref(), 0, &mut raw)?;
        let disk_area: DiskArea = bytemuck::pod_read_unaligned(&raw);

        if disk_area.is_scratch() {
            let area = &mut self.areas[area_idx];
            area.id = id;
            area.write(
                self.flash.as_mut(),
                DiskArea::ID_OFFSET as u32,
                &id.to_le_bytes(),
            )?;
        } else {
            self.areas[area_idx].id = id;
            self.format_area(area_idx, false)?;
        }

        Ok(())
    }

    /// Erases every area and initializes a fresh, empty file system.
    pub(crate) fn format_full(&mut self, descs: &[AreaDesc]) -> CanFail<FsError> {
        validate_descs(descs)?;

        self.reset_ram();

        // The largest area is reserved as the initial scratch area; garbage
        // collection keeps the invariant that scratch can absorb any live
        // area's contents.
        let mut scratch_idx = 0;
        for (i, desc) in descs.iter().enumerate() {
            if desc.length > descs[scratch_idx].length {
                scratch_idx = i;
            }
        }

        self.areas = descs
            .iter()
            .enumerate()
            .map(|(i, desc)| Area {
                offset: desc.offset,
                length: desc.length,
                cur: 0,
                gc_seq: 0,
                id: i as u16,
            })
            .collect();

        for i in 0..self.areas.len() {
            self.format_area(i, i == scratch_idx)?;
        }
        self.scratch_idx = Some(scratch_idx);
        self.validate_scratch()?;

        let root = self.file_new(None, b"", true)?;
        debug_assert_eq!(root, crate::hash::ObjectId::ROOT);
        self.root_dir = Some(root);

        let lost_found = self.path_new_dir(b"/lost+found")?;
        self.lost_found = Some(lost_found);

        self.validate_root()?;
        self.set_max_block_data_sz(0);

        info!(
            "fzfs",
            "formatted {} areas, scratch = {}, block_max_data_sz = {}",
            self.areas.len(),
            scratch_idx,
            self.block_max_data_sz
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::disk::{DiskArea, AREA_ID_NONE};
    use crate::hash::ObjectId;
    use crate::testutil::{new_formatted_fs, standard_areas};

    #[test]
    fn format_creates_root_and_lost_found_only() {
        let fs = new_formatted_fs();
        let core = fs.core();

        let root = core.hash.inode(ObjectId::ROOT).unwrap();
        assert_eq!(root.children().len(), 1);
        assert_eq!(
            core.inode_read_name(root.children()[0]).unwrap(),
            b"lost+found"
        );
        assert!(core.root_dir.is_some());
        assert!(core.lost_found.is_some());
    }

    #[test]
    fn scratch_header_leaves_the_id_erased() {
        let fs = new_formatted_fs();
        let core = fs.core();

        let scratch_idx = core.scratch_idx.unwrap();
        let scratch = &core.areas[scratch_idx];
        assert_eq!(scratch.id, AREA_ID_NONE);
        assert_eq!(scratch.cur, DiskArea::ID_OFFSET as u32);

        let mut id_bytes = [0_u8; 2];
        scratch
            .read(
                core.flash.as_ref(),
                DiskArea::ID_OFFSET as u32,
                &mut id_bytes,
            )
            .unwrap();
        assert_eq!(id_bytes, [0xFF, 0xFF]);
    }

    #[test]
    fn live_areas_carry_distinct_ids() {
        let fs = new_formatted_fs();
        let core = fs.core();

        let mut ids: alloc::vec::Vec<u16> = core
            .areas
            .iter()
            .filter(|a| !a.is_scratch())
            .map(|a| a.id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), standard_areas().len() - 1);
    }

    #[test]
    fn handoff_programs_only_the_id_bytes() {
        let fs = new_formatted_fs();
        let mut core = fs.core();

        let scratch_idx = core.scratch_idx.unwrap();
        core.format_from_scratch_area(scratch_idx, 0x0042).unwrap();

        let area = &core.areas[scratch_idx];
        assert_eq!(area.id, 0x0042);
        assert_eq!(area.cur, DiskArea::SIZE as u32);

        let mut raw = [0_u8; DiskArea::SIZE];
        area.read(core.flash.as_ref(), 0, &mut raw).unwrap();
        let disk_area: DiskArea = bytemuck::pod_read_unaligned(&raw);
        assert_eq!(disk_area.id, 0x0042);
        assert!(!disk_area.is_scratch());
    }
}
