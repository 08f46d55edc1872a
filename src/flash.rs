//! Flash driver contract consumed by the file-system core.
//!
//! The core addresses the device through absolute byte offsets; the area
//! manager is responsible for adding area base offsets before calling in
//! here. The contract mirrors NOR flash behavior: reads have no alignment
//! requirement, writes may only clear bits (1 -> 0), and erases return an
//! entire range to the all-ones state.

use alloc::vec;
use alloc::vec::Vec;

use crate::errors::{CanFail, FsError};

/// Low-level flash access used by the core.
///
/// Implementations map the three primitives onto the actual device. All
/// operations are synchronous; a failure must leave previously-committed
/// bytes intact (the core never relies on partially-written records, it
/// relies on CRC rejection of them at mount time).
pub trait FlashDriver {
    /// Reads `buf.len()` bytes starting at the absolute offset `offset`.
    fn read(&self, offset: u32, buf: &mut [u8]) -> CanFail<FsError>;

    /// Programs `buf.len()` bytes starting at the absolute offset `offset`.
    ///
    /// Bits may only transition from 1 to 0. Repeated writes to the same
    /// location with compatible bit patterns must succeed.
    fn write(&mut self, offset: u32, buf: &[u8]) -> CanFail<FsError>;

    /// Erases `len` bytes starting at `offset`, leaving all bits set.
    ///
    /// The erase unit is implementation-defined but must cover whole areas
    /// as configured at format time.
    fn erase(&mut self, offset: u32, len: u32) -> CanFail<FsError>;
}

/// RAM-backed NOR flash simulation.
///
/// Faithful to the bit-clearing write model: programming ANDs the new bytes
/// into the array, so a write that tries to flip a 0 back to 1 silently
/// leaves the 0 in place, exactly as a real NOR part would. Used by the test
/// suite and useful for host-side tooling that manipulates file-system
/// images.
pub struct MemFlash {
    data: Vec<u8>,
}

impl MemFlash {
    /// Creates a fully-erased device of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0xFF; size],
        }
    }

    /// Total device size, in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Direct access to the raw image.
    pub fn image(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access to the raw image, bypassing NOR write semantics.
    ///
    /// Intended for tests that simulate external corruption or partial
    /// garbage-collection crashes.
    pub fn image_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn check_range(&self, offset: u32, len: usize) -> CanFail<FsError> {
        let end = offset as usize + len;
        if end > self.data.len() {
            return Err(FsError::Range);
        }

        Ok(())
    }
}

impl FlashDriver for MemFlash {
    fn read(&self, offset: u32, buf: &mut [u8]) -> CanFail<FsError> {
        self.check_range(offset, buf.len())?;
        buf.copy_from_slice(&self.data[offset as usize..offset as usize + buf.len()]);

        Ok(())
    }

    fn write(&mut self, offset: u32, buf: &[u8]) -> CanFail<FsError> {
        self.check_range(offset, buf.len())?;
        for (dst, src) in self.data[offset as usize..].iter_mut().zip(buf) {
            *dst &= src;
        }

        Ok(())
    }

    fn erase(&mut self, offset: u32, len: u32) -> CanFail<FsError> {
        self.check_range(offset, len as usize)?;
        self.data[offset as usize..(offset + len) as usize].fill(0xFF);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{FlashDriver, MemFlash};
    use crate::errors::FsError;

    #[test]
    fn writes_only_clear_bits() {
        let mut flash = MemFlash::new(16);

        flash.write(0, &[0x0F]).unwrap();
        flash.write(0, &[0xF0]).unwrap();

        let mut byte = [0xFF];
        flash.read(0, &mut byte).unwrap();
        assert_eq!(byte[0], 0x00);
    }

    #[test]
    fn erase_restores_all_ones() {
        let mut flash = MemFlash::new(32);

        flash.write(4, &[0; 8]).unwrap();
        flash.erase(0, 32).unwrap();

        let mut buf = [0; 32];
        flash.read(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let mut flash = MemFlash::new(8);

        assert_eq!(flash.write(6, &[0, 0, 0]), Err(FsError::Range));
        assert_eq!(flash.erase(0, 9), Err(FsError::Range));

        let mut buf = [0; 2];
        assert_eq!(flash.read(7, &mut buf), Err(FsError::Range));
    }
}
