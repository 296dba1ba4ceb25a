//! Error types for the VFS server.
//!
//! Every operation answers its caller with exactly one terminal status. Errors
//! produced by backend filesystems travel through unchanged, either as one of
//! the typed variants below or as a raw [`VfsError::Backend`] errno.

use thiserror::Error;

/// Result type alias using [`VfsError`].
pub type Result<T> = std::result::Result<T, VfsError>;

/// VFS error taxonomy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VfsError {
    /// Path component, node or descriptor does not exist.
    #[error("not found")]
    NotFound,

    /// A path component used as a directory is not one.
    #[error("not a directory")]
    NotADirectory,

    /// A directory was used where a file is required.
    #[error("is a directory")]
    IsADirectory,

    /// Exclusive create collided with an existing entry.
    #[error("already exists")]
    AlreadyExists,

    /// The root filesystem is already mounted.
    #[error("root filesystem already mounted")]
    AlreadyMounted,

    /// Outstanding references prevent the operation.
    #[error("resource busy")]
    Busy,

    /// Malformed flags, degenerate paths or a bad seek whence.
    #[error("invalid argument")]
    InvalidArgument,

    /// Link or rename across filesystem instances.
    #[error("cross-device link")]
    CrossDevice,

    /// Directory still has entries.
    #[error("directory not empty")]
    NotEmpty,

    /// Offset arithmetic would leave the position range.
    #[error("value too large")]
    Overflow,

    /// Allocation failure.
    #[error("out of memory")]
    OutOfMemory,

    /// Descriptor is not open.
    #[error("bad file descriptor")]
    BadDescriptor,

    /// Descriptor table is full.
    #[error("too many open files")]
    TooManyOpenFiles,

    /// Path, option blob or filesystem name exceeds its limit.
    #[error("name too long")]
    NameTooLong,

    /// Request not supported by the backend.
    #[error("operation not supported")]
    NotSupported,

    /// The backend's channel has hung up.
    #[error("backend disconnected")]
    Disconnected,

    /// A backend answered with a reply that does not match the request.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Raw status propagated from a backend.
    #[error("backend error {0}")]
    Backend(i32),
}

impl VfsError {
    /// Convert to a libc error code for clients speaking errno.
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            VfsError::NotFound => libc::ENOENT,
            VfsError::NotADirectory => libc::ENOTDIR,
            VfsError::IsADirectory => libc::EISDIR,
            VfsError::AlreadyExists => libc::EEXIST,
            VfsError::AlreadyMounted | VfsError::Busy => libc::EBUSY,
            VfsError::InvalidArgument => libc::EINVAL,
            VfsError::CrossDevice => libc::EXDEV,
            VfsError::NotEmpty => libc::ENOTEMPTY,
            VfsError::Overflow => libc::EOVERFLOW,
            VfsError::OutOfMemory => libc::ENOMEM,
            VfsError::BadDescriptor => libc::EBADF,
            VfsError::TooManyOpenFiles => libc::EMFILE,
            VfsError::NameTooLong => libc::ENAMETOOLONG,
            VfsError::NotSupported => libc::ENOTSUP,
            VfsError::Disconnected => libc::EPIPE,
            VfsError::Protocol(_) => libc::EPROTO,
            VfsError::Backend(errno) => *errno,
        }
    }

    /// Build an error from an errno answered by a backend.
    ///
    /// Known codes map back onto their typed variant so callers can match on
    /// them; anything else is kept verbatim.
    pub fn from_errno(errno: libc::c_int) -> Self {
        match errno {
            libc::ENOENT => VfsError::NotFound,
            libc::ENOTDIR => VfsError::NotADirectory,
            libc::EISDIR => VfsError::IsADirectory,
            libc::EEXIST => VfsError::AlreadyExists,
            libc::EBUSY => VfsError::Busy,
            libc::EINVAL => VfsError::InvalidArgument,
            libc::EXDEV => VfsError::CrossDevice,
            libc::ENOTEMPTY => VfsError::NotEmpty,
            libc::EOVERFLOW => VfsError::Overflow,
            libc::ENOMEM => VfsError::OutOfMemory,
            libc::EBADF => VfsError::BadDescriptor,
            libc::EMFILE => VfsError::TooManyOpenFiles,
            libc::ENAMETOOLONG => VfsError::NameTooLong,
            libc::ENOTSUP => VfsError::NotSupported,
            libc::EPIPE => VfsError::Disconnected,
            other => VfsError::Backend(other),
        }
    }
}
