//! Open files and per-client descriptor tables.
//!
//! An [`OpenFile`] owns one reference to its node plus the cursor state.
//! Descriptors are indices into a client's [`FileTable`]; `dup` makes two
//! descriptors share one `OpenFile`, so they also share its cursor.

use super::error::{Result, VfsError};
use super::node::{LookupResult, NodeRef, Triplet};
use super::proto::{LookupFlags, OpenFlags};
use super::vfs::Vfs;
use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

/// File descriptor.
pub type Fd = usize;

/// Cursor state guarded by the per-file mutex.
#[derive(Debug, Default)]
pub(crate) struct FileState {
    pub(crate) pos: u64,
}

/// Per-open state shared by every descriptor naming it.
#[derive(Debug)]
pub struct OpenFile {
    pub(crate) node: NodeRef,
    pub(crate) append: bool,
    pub(crate) state: AsyncMutex<FileState>,
}

impl OpenFile {
    fn new(node: NodeRef, append: bool) -> Self {
        Self {
            node,
            append,
            state: AsyncMutex::new(FileState::default()),
        }
    }

    /// Identity of the open node.
    pub fn triplet(&self) -> Triplet {
        self.node.triplet()
    }

    /// Whether writes always go to the end of the file.
    pub fn is_append(&self) -> bool {
        self.append
    }

    /// Current cursor position.
    pub async fn position(&self) -> u64 {
        self.state.lock().await.pos
    }
}

/// Fixed-size table of descriptor slots.
pub struct FileTable {
    slots: Mutex<Vec<Option<Arc<OpenFile>>>>,
}

impl FileTable {
    /// Creates a table with `capacity` free slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; capacity]),
        }
    }

    /// Installs `file` in the lowest free slot, or the highest with `highest`.
    pub fn alloc(&self, file: Arc<OpenFile>, highest: bool) -> Result<Fd> {
        let mut slots = self.slots.lock();
        let free = if highest {
            slots.iter().rposition(Option::is_none)
        } else {
            slots.iter().position(Option::is_none)
        };
        let fd = free.ok_or(VfsError::TooManyOpenFiles)?;
        slots[fd] = Some(file);
        Ok(fd)
    }

    /// The open file behind `fd`.
    pub fn get(&self, fd: Fd) -> Option<Arc<OpenFile>> {
        self.slots.lock().get(fd).and_then(Clone::clone)
    }

    /// Empties slot `fd` and hands back what it held.
    pub fn free(&self, fd: Fd) -> Result<Arc<OpenFile>> {
        self.slots
            .lock()
            .get_mut(fd)
            .and_then(Option::take)
            .ok_or(VfsError::BadDescriptor)
    }

    /// Points `fd` at `file`, handing back whatever it pointed at before.
    pub fn replace(&self, fd: Fd, file: Arc<OpenFile>) -> Result<Option<Arc<OpenFile>>> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(fd).ok_or(VfsError::BadDescriptor)?;
        Ok(slot.replace(file))
    }

    /// Number of descriptors in use.
    pub fn open_count(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }
}

/// One client of the server with its own descriptor table.
#[derive(Clone)]
pub struct Client {
    pub(crate) vfs: Arc<Vfs>,
    files: Arc<FileTable>,
    id: Uuid,
}

impl Client {
    /// Creates a client with an empty descriptor table.
    pub fn new(vfs: Arc<Vfs>) -> Self {
        let files = Arc::new(FileTable::new(vfs.config().max_open_files));
        Self {
            vfs,
            files,
            id: Uuid::new_v4(),
        }
    }

    /// Identifier used in log messages.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The server this client talks to.
    pub fn vfs(&self) -> &Arc<Vfs> {
        &self.vfs
    }

    /// Number of open descriptors.
    pub fn open_count(&self) -> usize {
        self.files.open_count()
    }

    pub(crate) fn file(&self, fd: Fd) -> Result<Arc<OpenFile>> {
        self.files.get(fd).ok_or(VfsError::NotFound)
    }

    /// Opens `path` and returns a new descriptor.
    ///
    /// # Arguments
    /// * `path` - Absolute path to open
    /// * `lflags` - Exactly one of FILE or DIRECTORY
    /// * `oflags` - Creation, truncation, append and descriptor placement
    ///
    /// # Returns
    /// * `Ok(Fd)` - The allocated descriptor
    /// * `Err(VfsError::InvalidArgument)` for malformed lookup flags
    pub async fn open(&self, path: &str, lflags: LookupFlags, oflags: OpenFlags) -> Result<Fd> {
        let kinds = lflags & (LookupFlags::FILE | LookupFlags::DIRECTORY);
        let reserved = LookupFlags::OPEN
            | LookupFlags::ROOT
            | LookupFlags::MP
            | LookupFlags::UNLINK
            | LookupFlags::LINK;
        if kinds.bits().count_ones() != 1 || lflags.intersects(reserved) {
            return Err(VfsError::InvalidArgument);
        }

        let mut flags = lflags | LookupFlags::OPEN;
        if oflags.contains(OpenFlags::CREATE) {
            flags |= LookupFlags::CREATE;
        }
        if oflags.contains(OpenFlags::EXCLUSIVE) {
            flags |= LookupFlags::EXCLUSIVE;
        }

        // Creation changes the namespace; plain opens only read it
        let node = if flags.contains(LookupFlags::CREATE) {
            let ns = self.vfs.namespace.write().await;
            let res = self.vfs.lookup(&ns, path, flags, None).await?;
            self.vfs.nodes.get(&res)
        } else {
            let ns = self.vfs.namespace.read().await;
            let res = self.vfs.lookup(&ns, path, flags, None).await?;
            self.vfs.nodes.get(&res)
        };

        let fd = self.install(node, oflags).await?;
        debug!("Client {} opened {} as {}", self.id, path, fd);
        Ok(fd)
    }

    /// Opens a node named by its triplet.
    pub async fn open_node(&self, triplet: Triplet, oflags: OpenFlags) -> Result<Fd> {
        let ns = self.vfs.namespace.read().await;
        let info = self
            .vfs
            .registry
            .client(triplet.fs_handle)?
            .open_node(triplet.device, triplet.index)
            .await?;
        let node = self.vfs.nodes.get(&LookupResult {
            triplet,
            size: info.size,
            link_count: info.link_count,
            kind: info.kind,
        });
        drop(ns);

        let fd = self.install(node, oflags).await?;
        debug!("Client {} opened {} as {}", self.id, triplet, fd);
        Ok(fd)
    }

    async fn install(&self, node: NodeRef, oflags: OpenFlags) -> Result<Fd> {
        if oflags.contains(OpenFlags::TRUNCATE) {
            let mut size = node.contents().write().await;
            if *size != 0 {
                let t = node.triplet();
                self.vfs
                    .registry
                    .client(t.fs_handle)?
                    .truncate(t.device, t.index, 0)
                    .await?;
                *size = 0;
            }
        }

        let file = Arc::new(OpenFile::new(node, oflags.contains(OpenFlags::APPEND)));
        self.files.alloc(file, oflags.contains(OpenFlags::DESC))
    }

    /// Closes `fd`.
    pub async fn close(&self, fd: Fd) -> Result<()> {
        let file = self.files.free(fd)?;
        drop(file);
        debug!("Client {} closed {}", self.id, fd);
        self.vfs.reap_orphans().await;
        Ok(())
    }

    /// Makes `new` name the same open file as `old`, closing `new` first if
    /// it was open.
    pub async fn dup(&self, old: Fd, new: Fd) -> Result<Fd> {
        if old == new {
            return Ok(new);
        }
        let file = self.files.get(old).ok_or(VfsError::BadDescriptor)?;

        let replaced = {
            let _state = file.state.lock().await;
            self.files.replace(new, file.clone())?
        };
        drop(replaced);
        debug!("Client {} duplicated {} as {}", self.id, old, new);
        self.vfs.reap_orphans().await;
        Ok(new)
    }
}
