//! Open-file handles and the open/close/seek/read paths.

use crate::errors::{CanFail, FsError, FsResult};
use crate::fs::FsCore;
use crate::hash::ObjectId;

/// Access flags controlling what an open handle may do.
///
/// The classic `fopen` mode strings map onto combinations of these:
///
/// | mode  | flags                               |
/// |-------|-------------------------------------|
/// | `r`   | `READ`                              |
/// | `r+`  | `READ \| WRITE`                     |
/// | `w`   | `WRITE \| TRUNCATE`                 |
/// | `w+`  | `READ \| WRITE \| TRUNCATE`         |
/// | `a`   | `WRITE \| APPEND`                   |
/// | `a+`  | `READ \| WRITE \| APPEND`           |
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(transparent)]
pub struct Access(u8);

impl Access {
    pub const READ: Self = Self(0x01);
    pub const WRITE: Self = Self(0x02);

    /// Every write lands at the end of the file; implies `WRITE`.
    pub const APPEND: Self = Self(0x04);

    /// Replace any existing file with a fresh zero-length one.
    pub const TRUNCATE: Self = Self(0x08);

    pub fn contains(self, flags: Access) -> bool {
        self.0 & flags.0 != 0
    }
}

impl core::ops::BitOr for Access {
    type Output = Access;

    fn bitor(self, rhs: Self) -> Self::Output {
        Access(self.0 | rhs.0)
    }
}

/// An open file handle.
///
/// Handles are plain values; dropping one without passing it back to
/// [`crate::FzFs::close`] leaks the underlying reference until the next
/// mount.
#[derive(Debug)]
pub struct FzFile {
    pub(crate) inode_id: ObjectId,
    pub(crate) offset: u32,
    pub(crate) access: Access,
}

impl FsCore {
    pub(crate) fn file_open(&mut self, path: &[u8], access: Access) -> FsResult<FzFile> {
        if !access.contains(Access::READ) && !access.contains(Access::WRITE) {
            return Err(FsError::Invalid);
        }
        if access.contains(Access::APPEND) && !access.contains(Access::WRITE) {
            return Err(FsError::Invalid);
        }
        if access.contains(Access::TRUNCATE) && !access.contains(Access::WRITE) {
            return Err(FsError::Invalid);
        }
        if access.contains(Access::APPEND) && access.contains(Access::TRUNCATE) {
            return Err(FsError::Invalid);
        }

        let lookup = self.path_find(path)?;
        let parent = lookup.parent;
        let leaf_reached = lookup.leaf_reached;
        let name = lookup.leaf;

        let inode_id = match lookup.inode {
            None => {
                // Only a write handle may create the missing leaf, and every
                // intermediate directory must already exist.
                if !leaf_reached || !access.contains(Access::WRITE) {
                    return Err(FsError::NotFound);
                }
                let parent = parent.ok_or(FsError::NotFound)?;
                if name.is_empty() {
                    return Err(FsError::Invalid);
                }

                self.file_new(Some(parent), name, false)?
            }
            Some(found) => {
                if found.is_dir() {
                    return Err(FsError::Invalid);
                }

                if access.contains(Access::TRUNCATE) {
                    // Truncation is a fresh file under the old name; the old
                    // inode's records become garbage for the collector.
                    self.inode_unlink(found)?;
                    let parent = parent.ok_or(FsError::NotFound)?;
                    self.file_new(Some(parent), name, false)?
                } else {
                    found
                }
            }
        };

        let offset = if access.contains(Access::APPEND) {
            self.inode_data_len(inode_id)?
        } else {
            0
        };

        self.hash.inode_mut(inode_id)?.refcnt += 1;

        Ok(FzFile {
            inode_id,
            offset,
            access,
        })
    }

    pub(crate) fn file_close(&mut self, file: FzFile) -> CanFail<FsError> {
        self.inode_dec_refcnt(file.inode_id)
    }

    pub(crate) fn file_seek(&mut self, file: &mut FzFile, offset: u32) -> CanFail<FsError> {
        if offset > self.inode_data_len(file.inode_id)? {
            return Err(FsError::Range);
        }

        file.offset = offset;
        Ok(())
    }

    /// Reads up to `buf.len()` bytes at the handle's position. Reads past
    /// the end of the file are short, not errors.
    pub(crate) fn file_read(&mut self, file: &mut FzFile, buf: &mut [u8]) -> FsResult<usize> {
        if !file.access.contains(Access::READ) {
            return Err(FsError::Invalid);
        }

        let size = self.inode_data_len(file.inode_id)?;
        if file.offset >= size || buf.is_empty() {
            return Ok(0);
        }

        let read_len = usize::min(buf.len(), (size - file.offset) as usize);
        let mut done = 0_usize;

        while done < read_len {
            let pos = file.offset + done as u32;
            let cached = self.cache_seek(file.inode_id, pos)?;

            let in_block = pos - cached.file_offset;
            let n = usize::min(
                read_len - done,
                (u32::from(cached.data_len) - in_block) as usize,
            );

            let loc = self.hash.block(cached.block_id)?.loc;
            self.block_read_data(loc, in_block as u16, &mut buf[done..done + n])?;

            done += n;
        }

        file.offset += read_len as u32;
        Ok(read_len)
    }
}

#[cfg(test)]
mod tests {
    use crate::errors::FsError;
    use crate::fs::Access;
    use crate::testutil::{new_formatted_fs, read_back, write_new_file};

    #[test]
    fn create_then_read_back() {
        let fs = new_formatted_fs();

        let mut f = fs
            .open("/myfile.txt", Access::WRITE | Access::APPEND)
            .unwrap();
        fs.write(&mut f, b"abcdefgh").unwrap();
        fs.close(f).unwrap();

        let mut f = fs.open("/myfile.txt", Access::READ).unwrap();
        let mut buf = [0_u8; 8];
        assert_eq!(fs.read(&mut f, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"abcdefgh");
        assert_eq!(fs.file_len(&f).unwrap(), 8);
        fs.close(f).unwrap();
    }

    #[test]
    fn read_only_open_of_missing_file_fails() {
        let fs = new_formatted_fs();
        assert_eq!(fs.open("/nope.txt", Access::READ).unwrap_err(), FsError::NotFound);
    }

    #[test]
    fn write_open_creates_but_needs_the_parent() {
        let fs = new_formatted_fs();

        let f = fs.open("/made.txt", Access::WRITE).unwrap();
        fs.close(f).unwrap();
        assert_eq!(read_back(&fs, "/made.txt"), b"");

        assert_eq!(
            fs.open("/no-dir/made.txt", Access::WRITE).unwrap_err(),
            FsError::NotFound
        );
    }

    #[test]
    fn reads_past_eof_are_short() {
        let fs = new_formatted_fs();
        write_new_file(&fs, "/short.txt", &[b"12345"]);

        let mut f = fs.open("/short.txt", Access::READ).unwrap();
        fs.seek(&mut f, 3).unwrap();

        let mut buf = [0_u8; 16];
        assert_eq!(fs.read(&mut f, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"45");
        assert_eq!(fs.read(&mut f, &mut buf).unwrap(), 0);
        fs.close(f).unwrap();
    }

    #[test]
    fn seek_past_eof_is_a_range_error() {
        let fs = new_formatted_fs();
        write_new_file(&fs, "/five.txt", &[b"12345"]);

        let mut f = fs.open("/five.txt", Access::READ).unwrap();
        assert_eq!(fs.seek(&mut f, 6), Err(FsError::Range));
        fs.seek(&mut f, 5).unwrap();
        fs.close(f).unwrap();
    }

    #[test]
    fn truncate_replaces_the_file() {
        let fs = new_formatted_fs();
        write_new_file(&fs, "/t.txt", &[b"old contents"]);

        let mut f = fs
            .open("/t.txt", Access::WRITE | Access::TRUNCATE)
            .unwrap();
        assert_eq!(fs.file_len(&f).unwrap(), 0);
        fs.write(&mut f, b"new").unwrap();
        fs.close(f).unwrap();

        assert_eq!(read_back(&fs, "/t.txt"), b"new");
    }

    #[test]
    fn conflicting_access_flags_are_invalid() {
        let fs = new_formatted_fs();

        assert_eq!(
            fs.open("/x", Access::APPEND | Access::TRUNCATE | Access::WRITE)
                .unwrap_err(),
            FsError::Invalid
        );
        assert_eq!(fs.open("/x", Access::APPEND).unwrap_err(), FsError::Invalid);
        assert_eq!(fs.open("/x", Access::TRUNCATE).unwrap_err(), FsError::Invalid);
        assert_eq!(fs.open("/x", Access::default()).unwrap_err(), FsError::Invalid);
    }

    #[test]
    fn unlinked_file_stays_usable_through_open_handle() {
        let fs = new_formatted_fs();

        let mut f = fs.open("/a", Access::WRITE | Access::TRUNCATE).unwrap();
        fs.write(&mut f, b"0").unwrap();
        fs.close(f).unwrap();

        let mut handle = fs.open("/a", Access::READ | Access::WRITE).unwrap();
        fs.unlink("/a").unwrap();

        assert_eq!(fs.open("/a", Access::READ).unwrap_err(), FsError::NotFound);

        fs.write(&mut handle, b"00").unwrap();
        fs.seek(&mut handle, 0).unwrap();
        let mut buf = [0_u8; 4];
        assert_eq!(fs.read(&mut handle, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"00");
        fs.close(handle).unwrap();
    }

    #[test]
    fn directories_cannot_be_opened_as_files() {
        let fs = new_formatted_fs();
        fs.mkdir("/d").unwrap();

        assert_eq!(fs.open("/d", Access::READ).unwrap_err(), FsError::Invalid);
    }
}
