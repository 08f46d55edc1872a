//! Flash area bookkeeping.
//!
//! An area is a contiguous, erase-granular flash region holding one
//! append-only object log behind its header. The RAM representation tracks
//! the append cursor `cur`: everything before it has been written, everything
//! after it is still erased.

use crate::disk::{DiskArea, AREA_ID_NONE};
use crate::errors::{CanFail, FsError};
use crate::flash::FlashDriver;
use crate::hash::FlashLoc;

/// Buffer size used when copying bytes between areas.
const COPY_CHUNK_SZ: usize = 128;

/// Caller-supplied description of one flash region handed to format/detect.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AreaDesc {
    /// Absolute byte offset of the region on the flash device.
    pub offset: u32,

    /// Region length, in bytes.
    pub length: u32,
}

/// RAM representation of one flash area.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Area {
    pub(crate) offset: u32,
    pub(crate) length: u32,

    /// Next free byte; write offsets must be monotonic per area.
    pub(crate) cur: u32,

    /// Incremented each time the area becomes scratch; wraps at 256.
    pub(crate) gc_seq: u8,

    /// Area identity; [`AREA_ID_NONE`] for the scratch area.
    pub(crate) id: u16,
}

impl Area {
    pub(crate) fn is_scratch(&self) -> bool {
        self.id == AREA_ID_NONE
    }

    pub(crate) fn free_space(&self) -> u32 {
        self.length - self.cur
    }

    /// Space available to objects when no free byte has been consumed yet.
    pub(crate) fn object_capacity(&self) -> u32 {
        self.length - DiskArea::SIZE as u32
    }

    pub(crate) fn to_disk(&self) -> DiskArea {
        DiskArea::new(self.length, self.gc_seq, self.id)
    }

    /// Reads `buf.len()` bytes at the area-relative `offset`.
    pub(crate) fn read(
        &self,
        flash: &dyn FlashDriver,
        offset: u32,
        buf: &mut [u8],
    ) -> CanFail<FsError> {
        let len = buf.len() as u32;
        if offset + len > self.length {
            return Err(FsError::Range);
        }

        flash.read(self.offset + offset, buf)
    }

    /// Programs `buf.len()` bytes at the area-relative `offset` and advances
    /// the append cursor past them.
    ///
    /// Offsets must never move backwards; the log is append-only and the
    /// cursor is the committed frontier.
    pub(crate) fn write(
        &mut self,
        flash: &mut dyn FlashDriver,
        offset: u32,
        buf: &[u8],
    ) -> CanFail<FsError> {
        debug_assert!(offset >= self.cur);

        let len = buf.len() as u32;
        if offset + len > self.length {
            return Err(FsError::Range);
        }

        flash.write(self.offset + offset, buf)?;
        self.cur = offset + len;

        Ok(())
    }
}

/// Mutably borrows two distinct areas out of the array.
pub(crate) fn two_areas(areas: &mut [Area], a: usize, b: usize) -> (&mut Area, &mut Area) {
    debug_assert!(a != b);

    if a < b {
        let (lo, hi) = areas.split_at_mut(b);
        (&mut lo[a], &mut hi[0])
    } else {
        let (lo, hi) = areas.split_at_mut(a);
        (&mut hi[0], &mut lo[b])
    }
}

/// Copies `len` bytes from one area's log into another's, in bounded chunks.
pub(crate) fn copy_between(
    flash: &mut dyn FlashDriver,
    areas: &mut [Area],
    from_idx: usize,
    mut from_offset: u32,
    to_idx: usize,
    mut to_offset: u32,
    mut len: u32,
) -> CanFail<FsError> {
    let mut buf = [0_u8; COPY_CHUNK_SZ];

    while len > 0 {
        let chunk_len = u32::min(len, COPY_CHUNK_SZ as u32);

        let (from, to) = two_areas(areas, from_idx, to_idx);
        from.read(flash, from_offset, &mut buf[..chunk_len as usize])?;
        to.write(flash, to_offset, &buf[..chunk_len as usize])?;

        from_offset += chunk_len;
        to_offset += chunk_len;
        len -= chunk_len;
    }

    Ok(())
}

/// Validates a caller-supplied area layout.
///
/// The 24-bit offset field of a packed flash location bounds the usable area
/// length, and the area index must fit the location's one-byte field.
pub(crate) fn validate_descs(descs: &[AreaDesc]) -> CanFail<FsError> {
    if descs.is_empty() || descs.len() > 255 {
        return Err(FsError::Invalid);
    }

    for desc in descs {
        if desc.length <= DiskArea::SIZE as u32 || desc.length > FlashLoc::MAX_OFFSET + 1 {
            return Err(FsError::Invalid);
        }
    }

    Ok(())
}

/// Searches for the two live areas left behind by a crashed garbage
/// collection cycle.
///
/// An interrupted cycle leaves two areas sharing one id: the source, and the
/// half-written destination that had been the scratch area. The one with
/// fewer bytes written is the destination and should be reverted to scratch.
/// Returns `(good_idx, bad_idx)`.
pub(crate) fn find_corrupt_scratch(areas: &[Area]) -> Result<(usize, usize), FsError> {
    for i in 0..areas.len() {
        for j in i + 1..areas.len() {
            if areas[i].id != areas[j].id {
                continue;
            }

            if areas[i].cur < areas[j].cur {
                return Ok((j, i));
            }
            return Ok((i, j));
        }
    }

    Err(FsError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::{copy_between, find_corrupt_scratch, two_areas, Area, AreaDesc};
    use crate::disk::AREA_ID_NONE;
    use crate::errors::FsError;
    use crate::flash::MemFlash;

    fn area(offset: u32, length: u32, cur: u32, id: u16) -> Area {
        Area {
            offset,
            length,
            cur,
            gc_seq: 0,
            id,
        }
    }

    #[test]
    fn write_advances_cursor_and_checks_bounds() {
        let mut flash = MemFlash::new(0x100);
        let mut a = area(0, 0x100, 24, 0);

        a.write(&mut flash, 24, b"abcd").unwrap();
        assert_eq!(a.cur, 28);
        assert_eq!(a.free_space(), 0x100 - 28);

        assert_eq!(a.write(&mut flash, 0xFE, b"abcd"), Err(FsError::Range));
    }

    #[test]
    fn copy_between_moves_bytes_across_areas() {
        let mut flash = MemFlash::new(0x400);
        let mut areas = [area(0, 0x200, 24, 0), area(0x200, 0x200, 24, AREA_ID_NONE)];

        areas[0].write(&mut flash, 24, &[0xAB; 300]).unwrap();
        copy_between(&mut flash, &mut areas, 0, 24, 1, 24, 300).unwrap();

        let mut buf = [0; 300];
        areas[1].read(&flash, 24, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAB));
        assert_eq!(areas[1].cur, 324);
    }

    #[test]
    fn two_areas_borrows_in_either_order() {
        let mut areas = [area(0, 64, 24, 0), area(64, 64, 24, 1)];

        let (x, y) = two_areas(&mut areas, 1, 0);
        assert_eq!(x.id, 1);
        assert_eq!(y.id, 0);
    }

    #[test]
    fn corrupt_scratch_pair_picks_shorter_destination() {
        let areas = [area(0, 64, 50, 7), area(64, 64, 30, 7), area(128, 64, 40, 2)];

        let (good, bad) = find_corrupt_scratch(&areas).unwrap();
        assert_eq!((good, bad), (0, 1));

        let clean = [area(0, 64, 50, 0), area(64, 64, 30, 1)];
        assert_eq!(find_corrupt_scratch(&clean), Err(FsError::NotFound));
    }

    #[test]
    fn desc_validation_rejects_degenerate_layouts() {
        assert!(super::validate_descs(&[]).is_err());
        assert!(super::validate_descs(&[AreaDesc {
            offset: 0,
            length: 16
        }])
        .is_err());
        assert!(super::validate_descs(&[AreaDesc {
            offset: 0,
            length: 0x4000
        }])
        .is_ok());
    }
}
