//! Error types shared across the file system core.
//!
//! Lower layers return the most specific kind they can observe; higher layers
//! translate only when a lower kind would be misleading to the caller.

use core::fmt::{Debug, Display, Formatter};

/// `BaseError` is a common trait implemented by every error type defined in
/// `fzfs`.
///
/// It is dependent on the [`Debug`] trait, which makes sense as we are dealing
/// with errors.
pub trait BaseError: Debug {}

/// `CanFail` is a return type for functions that are allowed to fail, and
/// don't need to return anything.
pub type CanFail<E> = Result<(), E>;

/// Standard result alias for file-system operations.
pub type FsResult<T> = Result<T, FsError>;

/// `FsError` defines the error kinds raised by the file-system core.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FsError {
    /// On-flash state failed validation (bad CRC, conflicting records).
    Corrupt,

    /// The flash driver reported a failure.
    Flash,

    /// An offset or length fell outside the addressable range.
    Range,

    /// Invalid argument.
    Invalid,

    /// An allocation could not be satisfied.
    NoMem,

    /// The requested object does not exist.
    NotFound,

    /// An erased (all-ones) word was read where a record was expected.
    Empty,

    /// Every area has been collected and none can accommodate the request.
    Full,

    /// A record's magic did not match any known object type.
    Unexpected,

    /// Failure reported by the host environment.
    Os,

    /// The target path already exists.
    Exists,

    /// The file handle does not permit writing.
    ReadOnly,

    /// No file system has been formatted or detected yet.
    Uninit,
}

impl BaseError for FsError {}

impl Display for FsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            FsError::Corrupt => "corrupt on-flash state",
            FsError::Flash => "flash driver failure",
            FsError::Range => "offset out of range",
            FsError::Invalid => "invalid argument",
            FsError::NoMem => "out of memory",
            FsError::NotFound => "no such file or directory",
            FsError::Empty => "erased flash where a record was expected",
            FsError::Full => "file system full",
            FsError::Unexpected => "unrecognized record magic",
            FsError::Os => "host environment failure",
            FsError::Exists => "file or directory already exists",
            FsError::ReadOnly => "handle not opened for writing",
            FsError::Uninit => "file system not initialized",
        };

        f.write_str(msg)
    }
}
