//! On-disk record formats.
//!
//! Three record types live in the flash logs: area headers, inodes and data
//! blocks. All three are fixed little-endian layouts mapped onto packed
//! [`Pod`] structs so they can be cast to and from raw flash bytes without a
//! field-by-field codec. Inode and block records are followed by their
//! variable trailer (filename, payload), which is covered by the record's
//! CRC together with the header.

use bytemuck::{bytes_of, Pod, Zeroable};

use crate::area::Area;
use crate::crc::{crc16_ccitt, crc16_flash};
use crate::errors::{CanFail, FsError};
use crate::flash::FlashDriver;

/// Area header magic; four words so that a truncated header write is never
/// mistaken for a valid one.
pub(crate) const AREA_MAGIC: [u32; 4] = [0xB98A_31E2, 0x7FB0_428C, 0xACE0_8253, 0xB185_FC8E];

pub(crate) const INODE_MAGIC: u32 = 0x925F_8BC0;
pub(crate) const BLOCK_MAGIC: u32 = 0x53BA_23B9;

/// Magic word value read from erased flash: the end-of-log marker.
pub(crate) const MAGIC_ERASED: u32 = 0xFFFF_FFFF;

/// Current on-disk format version.
pub(crate) const DISK_VERSION: u8 = 0;

/// Area id carried by the scratch area.
pub(crate) const AREA_ID_NONE: u16 = 0xFFFF;

/// Flags persisted in an inode record.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(transparent)]
pub(crate) struct InodeFlags(u16);

impl InodeFlags {
    pub(crate) const EMPTY: Self = Self(0);

    /// The inode has been deleted; restore discards it.
    pub(crate) const DELETED: Self = Self(0x0001);

    /// The inode is a directory rather than a file.
    pub(crate) const DIRECTORY: Self = Self(0x0002);

    pub(crate) fn contains(self, flag: InodeFlags) -> bool {
        self.0 & flag.0 != 0
    }
}

impl core::ops::BitOr for InodeFlags {
    type Output = InodeFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        InodeFlags(self.0 | rhs.0)
    }
}

/// On-disk representation of an area header, the first bytes of every area.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct DiskArea {
    pub(crate) magic: [u32; 4],

    /// Total size of the area, in bytes.
    pub(crate) length: u32,

    /// On-disk format version.
    pub(crate) version: u8,

    /// Garbage collection count; wraps at 256.
    pub(crate) gc_seq: u8,

    /// Area identity; [`AREA_ID_NONE`] marks the scratch area.
    pub(crate) id: u16,
}

impl DiskArea {
    pub(crate) const SIZE: usize = 24;

    /// Byte offset of the `id` field within the header.
    ///
    /// A scratch area's header is written without its trailing id, leaving
    /// those two bytes erased (`0xFFFF` == [`AREA_ID_NONE`]). Converting the
    /// scratch area into a live one later programs just the id in place,
    /// which is the atomic handoff point of a garbage-collection cycle.
    pub(crate) const ID_OFFSET: usize = 22;

    pub(crate) fn new(length: u32, gc_seq: u8, id: u16) -> Self {
        Self {
            magic: AREA_MAGIC,
            length,
            version: DISK_VERSION,
            gc_seq,
            id,
        }
    }

    pub(crate) fn magic_is_set(&self) -> bool {
        self.magic == AREA_MAGIC
    }

    pub(crate) fn is_scratch(&self) -> bool {
        self.magic_is_set() && self.id == AREA_ID_NONE
    }
}

/// On-disk representation of an inode (file or directory).
///
/// Followed on flash by `filename_len` bytes of filename.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub(crate) struct DiskInode {
    pub(crate) magic: u32,

    /// Unique object id; encodes the inode kind in its range.
    pub(crate) id: u32,

    /// Sequence number; among records sharing an id, greater supersedes.
    pub(crate) seq: u32,

    /// Object id of the parent directory, or the none sentinel for the root
    /// directory and for delete records.
    pub(crate) parent_id: u32,

    pub(crate) flags: InodeFlags,
    pub(crate) reserved: u8,
    pub(crate) filename_len: u8,

    /// CRC-16/CCITT over the header up to this field, then the filename.
    pub(crate) crc16: u16,
}

impl DiskInode {
    pub(crate) const SIZE: usize = 22;

    /// Bytes of the header covered by the CRC.
    const CRC_COVERED: usize = 20;

    fn crc_header(&self) -> u16 {
        crc16_ccitt(0, &bytes_of(self)[..Self::CRC_COVERED])
    }

    /// Computes and stores the record CRC. `filename` must be the exact
    /// trailer that will be written after the header.
    pub(crate) fn crc_fill(&mut self, filename: &[u8]) {
        self.crc16 = crc16_ccitt(self.crc_header(), filename);
    }

    /// Validates the record CRC against the flash-resident trailer.
    pub(crate) fn crc_validate(
        &self,
        flash: &dyn FlashDriver,
        area: &Area,
        area_offset: u32,
    ) -> CanFail<FsError> {
        let crc = crc16_flash(
            self.crc_header(),
            flash,
            area,
            area_offset + Self::SIZE as u32,
            u32::from(self.filename_len),
        )?;

        if crc != self.crc16 {
            return Err(FsError::Corrupt);
        }

        Ok(())
    }

    /// Whether this record describes the root directory: no parent, directory
    /// flag, not deleted, empty filename.
    pub(crate) fn is_root(&self) -> bool {
        self.parent_id == crate::hash::ObjectId::NONE_RAW
            && self.flags.contains(InodeFlags::DIRECTORY)
            && !self.flags.contains(InodeFlags::DELETED)
            && self.filename_len == 0
    }
}

/// On-disk representation of a data block.
///
/// Followed on flash by `data_len` bytes of payload.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub(crate) struct DiskBlock {
    pub(crate) magic: u32,

    /// Unique object id, in the block id range.
    pub(crate) id: u32,

    /// Sequence number; among records sharing an id, greater supersedes.
    pub(crate) seq: u32,

    /// Object id of the predecessor block in the same file, or the none
    /// sentinel for a file's first block.
    pub(crate) prev_id: u32,

    /// Object id of the owning file inode.
    pub(crate) inode_id: u32,

    /// Payload length, in bytes.
    pub(crate) data_len: u16,

    pub(crate) flags: u16,

    /// CRC-16/CCITT over the header up to this field, then the payload.
    pub(crate) crc16: u16,
}

impl DiskBlock {
    pub(crate) const SIZE: usize = 26;

    /// Bytes of the header covered by the CRC.
    const CRC_COVERED: usize = 24;

    fn crc_header(&self) -> u16 {
        crc16_ccitt(0, &bytes_of(self)[..Self::CRC_COVERED])
    }

    /// Computes and stores the record CRC. `data` must be the exact payload
    /// that will be written after the header.
    pub(crate) fn crc_fill(&mut self, data: &[u8]) {
        self.crc16 = crc16_ccitt(self.crc_header(), data);
    }

    /// Validates the record CRC against the flash-resident payload.
    pub(crate) fn crc_validate(
        &self,
        flash: &dyn FlashDriver,
        area: &Area,
        area_offset: u32,
    ) -> CanFail<FsError> {
        let crc = crc16_flash(
            self.crc_header(),
            flash,
            area,
            area_offset + Self::SIZE as u32,
            u32::from(self.data_len),
        )?;

        if crc != self.crc16 {
            return Err(FsError::Corrupt);
        }

        Ok(())
    }

    /// Total on-flash footprint of the record, header included.
    pub(crate) fn disk_size(&self) -> u32 {
        Self::SIZE as u32 + u32::from(self.data_len)
    }
}

#[cfg(test)]
mod tests {
    use super::{DiskArea, DiskBlock, DiskInode, InodeFlags, AREA_ID_NONE};
    use bytemuck::{bytes_of, pod_read_unaligned};

    #[test]
    fn record_sizes_are_byte_exact() {
        assert_eq!(core::mem::size_of::<DiskArea>(), DiskArea::SIZE);
        assert_eq!(core::mem::size_of::<DiskInode>(), DiskInode::SIZE);
        assert_eq!(core::mem::size_of::<DiskBlock>(), DiskBlock::SIZE);
    }

    #[test]
    fn area_id_lands_at_its_documented_offset() {
        let area = DiskArea::new(0x4000, 3, 0x0102);
        let raw = bytes_of(&area);

        assert_eq!(
            u16::from_le_bytes([raw[DiskArea::ID_OFFSET], raw[DiskArea::ID_OFFSET + 1]]),
            0x0102
        );
    }

    #[test]
    fn scratch_is_magic_plus_erased_id() {
        let mut area = DiskArea::new(0x4000, 0, AREA_ID_NONE);
        assert!(area.is_scratch());

        area.id = 7;
        assert!(!area.is_scratch());

        area.magic[2] = 0;
        area.id = AREA_ID_NONE;
        assert!(!area.is_scratch());
    }

    #[test]
    fn inode_round_trips_through_raw_bytes() {
        let mut inode = DiskInode {
            magic: super::INODE_MAGIC,
            id: 0x1000_0004,
            seq: 9,
            parent_id: 0,
            flags: InodeFlags::EMPTY,
            reserved: 0xFF,
            filename_len: 5,
            crc16: 0,
        };
        inode.crc_fill(b"tango");

        let raw = bytes_of(&inode).to_vec();
        let back: DiskInode = pod_read_unaligned(&raw);

        assert_eq!({ back.id }, 0x1000_0004);
        assert_eq!({ back.seq }, 9);
        assert_eq!({ back.filename_len }, 5);
        assert_eq!({ back.crc16 }, { inode.crc16 });
    }

    #[test]
    fn crc_differs_when_trailer_differs() {
        let mut a = DiskBlock {
            magic: super::BLOCK_MAGIC,
            id: 0x8000_0000,
            seq: 0,
            prev_id: 0xFFFF_FFFF,
            inode_id: 0x1000_0000,
            data_len: 4,
            flags: 0,
            crc16: 0,
        };
        let mut b = a;

        a.crc_fill(b"abcd");
        b.crc_fill(b"abce");

        assert_ne!({ a.crc16 }, { b.crc16 });
    }

    #[test]
    fn root_recognition() {
        let mut root = DiskInode {
            magic: super::INODE_MAGIC,
            id: 0,
            seq: 0,
            parent_id: 0xFFFF_FFFF,
            flags: InodeFlags::DIRECTORY,
            reserved: 0xFF,
            filename_len: 0,
            crc16: 0,
        };
        assert!(root.is_root());

        root.flags = InodeFlags::DIRECTORY | InodeFlags::DELETED;
        assert!(!root.is_root());
    }
}
