//! Server limits and defaults.

/// Descriptor slots per client
pub const MAX_OPEN_FILES: usize = 128;
/// Longest accepted path, in bytes
pub const MAX_PATH_LEN: usize = 64 * 1024;
/// Longest accepted mount options blob, in bytes
pub const MAX_MNTOPTS_LEN: usize = 256;
/// Longest accepted filesystem name, in bytes
pub const FS_NAME_MAXLEN: usize = 16;

/// Positions reported back to clients are clamped to the signed offset range
pub const OFF64_MAX: u64 = i64::MAX as u64;

/// First handle given to a registered backend; 0 never names one
pub const FIRST_FS_HANDLE: u32 = 1;

/// Index of the root node in the in-memory backend
pub const MEMFS_ROOT_INDEX: u64 = 0;

/// Default depth of a session's request queue
pub const SESSION_QUEUE: usize = 64;

/// Largest file the in-memory backend will hold, in bytes
pub const MEMFS_MAX_FILE_SIZE: usize = 64 * 1024 * 1024;
