//! Data path: read, write, seek, truncate, sync and fstat on descriptors.
//!
//! Locks are always taken in the order namespace, content, file cursor and
//! released in reverse. The content lock is shared for reads and for writes
//! to filesystems that both allow concurrent reads and writes and never
//! change a node's size on write; every other write takes it exclusively.

use super::constants::OFF64_MAX;
use super::error::{Result, VfsError};
use super::file::{Client, Fd};
use super::proto::NodeStat;
use log::debug;
use tokio::sync::{RwLockReadGuard, RwLockWriteGuard};

/// Origin of a seek offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// From the start of the file
    Set,
    /// From the current position
    Cur,
    /// From the end of the file
    End,
}

impl TryFrom<i32> for Whence {
    type Error = VfsError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            libc::SEEK_SET => Ok(Whence::Set),
            libc::SEEK_CUR => Ok(Whence::Cur),
            libc::SEEK_END => Ok(Whence::End),
            _ => Err(VfsError::InvalidArgument),
        }
    }
}

enum ContentGuard<'a> {
    Shared(RwLockReadGuard<'a, u64>),
    Exclusive(RwLockWriteGuard<'a, u64>),
}

impl ContentGuard<'_> {
    fn size(&self) -> u64 {
        match self {
            ContentGuard::Shared(size) => **size,
            ContentGuard::Exclusive(size) => **size,
        }
    }
}

enum Io<'a> {
    Read(usize),
    Write(&'a [u8]),
}

enum Transferred {
    Read(Vec<u8>),
    Written(usize),
}

/// Applies a signed offset to `base`, refusing to wrap.
fn offset_from(base: u64, offset: i64) -> Result<u64> {
    if offset >= 0 {
        base.checked_add(offset as u64).ok_or(VfsError::Overflow)
    } else {
        base.checked_sub(offset.unsigned_abs())
            .ok_or(VfsError::Overflow)
    }
}

impl Client {
    /// Reads up to `len` bytes at the cursor and advances it.
    ///
    /// On a directory the cursor counts entries: each read answers the name
    /// of the entry at the cursor, and an empty answer means the end.
    pub async fn read(&self, fd: Fd, len: usize) -> Result<Vec<u8>> {
        match self.transfer(fd, Io::Read(len)).await? {
            Transferred::Read(data) => Ok(data),
            Transferred::Written(_) => Err(VfsError::Protocol("read answered a write".into())),
        }
    }

    /// Writes `data` at the cursor, or at the end for append-mode files,
    /// and answers the number of bytes the backend accepted.
    pub async fn write(&self, fd: Fd, data: &[u8]) -> Result<usize> {
        match self.transfer(fd, Io::Write(data)).await? {
            Transferred::Written(bytes) => Ok(bytes),
            Transferred::Read(_) => Err(VfsError::Protocol("write answered a read".into())),
        }
    }

    async fn transfer(&self, fd: Fd, io: Io<'_>) -> Result<Transferred> {
        let file = self.file(fd)?;
        let node = &file.node;
        let writing = matches!(io, Io::Write(_));
        if writing && node.is_directory() {
            return Err(VfsError::IsADirectory);
        }

        let t = node.triplet();
        let shared_writes = self.vfs.registry.info(t.fs_handle)?.shared_writes();
        let backend = self.vfs.registry.client(t.fs_handle)?;

        // Directory contents are namespace structure
        let _ns = if node.is_directory() {
            Some(self.vfs.namespace.read().await)
        } else {
            None
        };
        let mut content = if !writing || shared_writes {
            ContentGuard::Shared(node.contents().read().await)
        } else {
            ContentGuard::Exclusive(node.contents().write().await)
        };
        let mut state = file.state.lock().await;

        if writing && file.append {
            state.pos = content.size();
        }

        let (outcome, advance) = match io {
            Io::Read(len) => {
                let (data, bytes) = backend.read(t.device, t.index, state.pos, len).await?;
                (Transferred::Read(data), bytes)
            }
            Io::Write(data) => {
                let (bytes, size) = backend.write(t.device, t.index, state.pos, data).await?;
                if let ContentGuard::Exclusive(cached) = &mut content {
                    **cached = size;
                }
                (Transferred::Written(bytes), bytes)
            }
        };
        state.pos = state.pos.saturating_add(advance as u64);
        Ok(outcome)
    }

    /// Moves the cursor and answers the new position.
    ///
    /// # Arguments
    /// * `fd` - Open descriptor
    /// * `offset` - Signed distance from `whence`
    /// * `whence` - Origin of the offset
    ///
    /// # Returns
    /// * `Ok(u64)` - New position, clamped to the signed offset range
    /// * `Err(VfsError::Overflow)` if the position would wrap in either direction
    /// * `Err(VfsError::InvalidArgument)` for a negative `Whence::Set` offset
    pub async fn seek(&self, fd: Fd, offset: i64, whence: Whence) -> Result<u64> {
        let file = self.file(fd)?;

        let pos = match whence {
            Whence::Set => {
                let pos = u64::try_from(offset).map_err(|_| VfsError::InvalidArgument)?;
                file.state.lock().await.pos = pos;
                pos
            }
            Whence::Cur => {
                let mut state = file.state.lock().await;
                state.pos = offset_from(state.pos, offset)?;
                state.pos
            }
            Whence::End => {
                let size = file.node.contents().read().await;
                let mut state = file.state.lock().await;
                state.pos = offset_from(*size, offset)?;
                state.pos
            }
        };

        Ok(pos.min(OFF64_MAX))
    }

    /// Sets the size of the file behind `fd`.
    pub async fn truncate(&self, fd: Fd, size: u64) -> Result<()> {
        let file = self.file(fd)?;
        let t = file.triplet();
        let backend = self.vfs.registry.client(t.fs_handle)?;

        let mut cached = file.node.contents().write().await;
        let _state = file.state.lock().await;
        backend.truncate(t.device, t.index, size).await?;
        *cached = size;
        debug!("Truncated {} to {}", t, size);
        Ok(())
    }

    /// Asks the backend to flush the file behind `fd`.
    pub async fn sync(&self, fd: Fd) -> Result<()> {
        let file = self.file(fd)?;
        let t = file.triplet();
        let _state = file.state.lock().await;
        self.vfs
            .registry
            .client(t.fs_handle)?
            .sync(t.device, t.index)
            .await
    }

    /// Attributes of the file behind `fd`.
    pub async fn fstat(&self, fd: Fd) -> Result<NodeStat> {
        let file = self.file(fd)?;
        let _state = file.state.lock().await;
        self.vfs.stat_node(file.triplet(), true).await
    }
}
