//! Request/response protocol spoken with backend filesystems.
//!
//! Backends are separate servers reached only through [`FsEndpoint::call`].
//! 64-bit positions and sizes travel as two 32-bit halves (low, high) to stay
//! compatible with the narrow native argument width of the transport.

use super::error::{Result, VfsError};
use super::node::{DeviceId, FsHandle, NodeIndex, NodeKind, Triplet};
use async_trait::async_trait;
use bitflags::bitflags;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Low-order 32 bits of a 64-bit value.
pub fn lower32(value: u64) -> u32 {
    value as u32
}

/// High-order 32 bits of a 64-bit value.
pub fn upper32(value: u64) -> u32 {
    (value >> 32) as u32
}

/// Reassembles a 64-bit value from its halves.
pub fn merge_loup32(lo: u32, hi: u32) -> u64 {
    (u64::from(hi) << 32) | u64::from(lo)
}

bitflags! {
    /// Modes for path resolution.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct LookupFlags: u32 {
        /// Result must be a file
        const FILE = 1 << 0;
        /// Result must be a directory
        const DIRECTORY = 1 << 1;
        /// Result must be the root of a mounted filesystem
        const ROOT = 1 << 2;
        /// Stop at a mount point instead of crossing into the mounted filesystem
        const MP = 1 << 3;
        /// Create the last component if missing
        const CREATE = 1 << 4;
        /// With CREATE, fail if the last component exists
        const EXCLUSIVE = 1 << 5;
        /// Remove the last component's directory entry
        const UNLINK = 1 << 6;
        /// Add a directory entry for an existing node
        const LINK = 1 << 7;
        /// The node is being opened
        const OPEN = 1 << 8;
    }
}

bitflags! {
    /// Flags accepted by open.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct OpenFlags: u32 {
        /// Create the file if missing
        const CREATE = 1 << 0;
        /// With CREATE, fail if the file exists
        const EXCLUSIVE = 1 << 1;
        /// Truncate to zero length
        const TRUNCATE = 1 << 2;
        /// Every write goes to the end of the file
        const APPEND = 1 << 3;
        /// Allocate the highest free descriptor
        const DESC = 1 << 4;
    }
}

/// Node metadata as answered by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Index within the instance
    pub index: NodeIndex,
    /// Size in bytes
    pub size: u64,
    /// Number of directory entries naming the node
    pub link_count: u32,
    /// File or directory
    pub kind: NodeKind,
}

/// Backend answer to a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupReply {
    /// The path resolved inside this filesystem.
    Found(NodeInfo),
    /// Resolution reached a mount point after `consumed` components; the rest
    /// continues at the root of the mounted filesystem.
    Crossed {
        /// Components resolved by this backend, mount point included
        consumed: usize,
        /// Filesystem mounted at the crossing
        fs_handle: FsHandle,
        /// Its device
        device: DeviceId,
    },
}

/// Attributes answered by STAT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStat {
    /// Identity of the node
    pub triplet: Triplet,
    /// File or directory
    pub kind: NodeKind,
    /// Size in bytes
    pub size: u64,
    /// Number of directory entries naming the node
    pub link_count: u32,
    /// Whether the stat was issued through an open descriptor
    pub is_open: bool,
}

/// Communication channel handed to a mount point owner so it can talk to the
/// filesystem mounted over it.
#[derive(Clone)]
pub struct MounteeChannel(pub Endpoint);

impl fmt::Debug for MounteeChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MounteeChannel")
    }
}

/// Requests sent to a backend filesystem.
#[derive(Debug, Clone)]
pub enum FsRequest {
    /// The backend's device is being mounted as the root filesystem.
    Mounted {
        /// Device to serve
        device: DeviceId,
        /// Mount options blob
        options: String,
    },
    /// Mount another filesystem over one of this backend's directories.
    Mount {
        /// Device of the mount point
        mp_device: DeviceId,
        /// Index of the mount point
        mp_index: NodeIndex,
        /// Filesystem being mounted
        mountee_fs: FsHandle,
        /// Device being mounted
        mountee_device: DeviceId,
        /// Mount options blob
        options: String,
        /// Cloned channel to the mountee
        mountee: MounteeChannel,
    },
    /// Undo a MOUNT at the given mount point.
    Unmount {
        /// Device of the mount point
        device: DeviceId,
        /// Index of the mount point
        index: NodeIndex,
    },
    /// The root filesystem on `device` is being unmounted.
    Unmounted {
        /// Device being released
        device: DeviceId,
    },
    /// Resolve `path` starting at `start` (the instance root when `None`).
    Lookup {
        /// Device of the instance
        device: DeviceId,
        /// Directory to start at
        start: Option<NodeIndex>,
        /// Remaining path components
        path: Vec<String>,
        /// Resolution mode
        flags: LookupFlags,
        /// Node to link when `flags` contains LINK
        link: Option<NodeIndex>,
    },
    /// Confirm a node named by triplet and answer its metadata.
    OpenNode {
        /// Device of the instance
        device: DeviceId,
        /// Node index
        index: NodeIndex,
    },
    /// Read up to `len` bytes at the given position.
    Read {
        /// Device of the instance
        device: DeviceId,
        /// Node index
        index: NodeIndex,
        /// Position, low half
        pos_lo: u32,
        /// Position, high half
        pos_hi: u32,
        /// Maximum number of bytes
        len: usize,
    },
    /// Write `data` at the given position.
    Write {
        /// Device of the instance
        device: DeviceId,
        /// Node index
        index: NodeIndex,
        /// Position, low half
        pos_lo: u32,
        /// Position, high half
        pos_hi: u32,
        /// Bytes to write
        data: Vec<u8>,
    },
    /// Set the node's size.
    Truncate {
        /// Device of the instance
        device: DeviceId,
        /// Node index
        index: NodeIndex,
        /// New size, low half
        size_lo: u32,
        /// New size, high half
        size_hi: u32,
    },
    /// Answer the node's attributes.
    Stat {
        /// Device of the instance
        device: DeviceId,
        /// Node index
        index: NodeIndex,
        /// Whether issued through an open descriptor
        is_open: bool,
    },
    /// Flush the node to stable storage.
    Sync {
        /// Device of the instance
        device: DeviceId,
        /// Node index
        index: NodeIndex,
    },
    /// The node has no names and no references left.
    Destroy {
        /// Device of the instance
        device: DeviceId,
        /// Node index
        index: NodeIndex,
    },
}

impl FsRequest {
    /// Short verb name, for logging.
    pub fn verb(&self) -> &'static str {
        match self {
            FsRequest::Mounted { .. } => "MOUNTED",
            FsRequest::Mount { .. } => "MOUNT",
            FsRequest::Unmount { .. } => "UNMOUNT",
            FsRequest::Unmounted { .. } => "UNMOUNTED",
            FsRequest::Lookup { .. } => "LOOKUP",
            FsRequest::OpenNode { .. } => "OPEN_NODE",
            FsRequest::Read { .. } => "READ",
            FsRequest::Write { .. } => "WRITE",
            FsRequest::Truncate { .. } => "TRUNCATE",
            FsRequest::Stat { .. } => "STAT",
            FsRequest::Sync { .. } => "SYNC",
            FsRequest::Destroy { .. } => "DESTROY",
        }
    }
}

/// Successful answers from a backend filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsReply {
    /// Root of a freshly mounted instance.
    Mounted {
        /// Root node index
        index: NodeIndex,
        /// Root size, low half
        size_lo: u32,
        /// Root size, high half
        size_hi: u32,
        /// Root link count
        link_count: u32,
    },
    /// Lookup answer.
    Lookup(LookupReply),
    /// Node metadata.
    Node(NodeInfo),
    /// Data read; `bytes` is how far the position advances.
    Read {
        /// Bytes transferred to the caller
        data: Vec<u8>,
        /// Position advance
        bytes: usize,
    },
    /// Bytes written and the resulting size.
    Written {
        /// Bytes accepted
        bytes: usize,
        /// New size, low half
        size_lo: u32,
        /// New size, high half
        size_hi: u32,
    },
    /// Attributes.
    Stat(NodeStat),
    /// Request completed with nothing to report.
    Done,
}

/// Capability to talk to one backend filesystem.
#[async_trait]
pub trait FsEndpoint: Send + Sync {
    /// Sends a request and awaits its answer.
    async fn call(&self, request: FsRequest) -> Result<FsReply>;
}

/// Shared endpoint handle.
pub type Endpoint = Arc<dyn FsEndpoint>;

fn unexpected(verb: &str, reply: FsReply) -> VfsError {
    VfsError::Protocol(format!("unexpected reply to {}: {:?}", verb, reply))
}

/// Typed request helpers over an [`Endpoint`].
#[derive(Clone)]
pub struct FsClient {
    endpoint: Endpoint,
}

impl FsClient {
    /// Wraps an endpoint.
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    /// The underlying endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn call(&self, request: FsRequest) -> Result<FsReply> {
        let verb = request.verb();
        let result = self.endpoint.call(request).await;
        if let Err(e) = &result {
            debug!("{} failed: {}", verb, e);
        }
        result
    }

    /// MOUNTED: returns the root node of the instance.
    pub async fn mounted(&self, device: DeviceId, options: &str) -> Result<NodeInfo> {
        let request = FsRequest::Mounted {
            device,
            options: options.to_string(),
        };
        match self.call(request).await? {
            FsReply::Mounted {
                index,
                size_lo,
                size_hi,
                link_count,
            } => Ok(NodeInfo {
                index,
                size: merge_loup32(size_lo, size_hi),
                link_count,
                kind: NodeKind::Directory,
            }),
            other => Err(unexpected("MOUNTED", other)),
        }
    }

    /// MOUNT: returns the root node of the mounted instance.
    pub async fn mount(
        &self,
        mount_point: Triplet,
        mountee_fs: FsHandle,
        mountee_device: DeviceId,
        options: &str,
        mountee: Endpoint,
    ) -> Result<NodeInfo> {
        let request = FsRequest::Mount {
            mp_device: mount_point.device,
            mp_index: mount_point.index,
            mountee_fs,
            mountee_device,
            options: options.to_string(),
            mountee: MounteeChannel(mountee),
        };
        match self.call(request).await? {
            FsReply::Mounted {
                index,
                size_lo,
                size_hi,
                link_count,
            } => Ok(NodeInfo {
                index,
                size: merge_loup32(size_lo, size_hi),
                link_count,
                kind: NodeKind::Directory,
            }),
            other => Err(unexpected("MOUNT", other)),
        }
    }

    /// UNMOUNT at a mount point.
    pub async fn unmount(&self, device: DeviceId, index: NodeIndex) -> Result<()> {
        self.expect_done("UNMOUNT", FsRequest::Unmount { device, index })
            .await
    }

    /// UNMOUNTED for a root instance.
    pub async fn unmounted(&self, device: DeviceId) -> Result<()> {
        self.expect_done("UNMOUNTED", FsRequest::Unmounted { device })
            .await
    }

    /// LOOKUP of the remaining components.
    pub async fn lookup(
        &self,
        device: DeviceId,
        start: Option<NodeIndex>,
        path: &[&str],
        flags: LookupFlags,
        link: Option<NodeIndex>,
    ) -> Result<LookupReply> {
        let request = FsRequest::Lookup {
            device,
            start,
            path: path.iter().map(|c| c.to_string()).collect(),
            flags,
            link,
        };
        match self.call(request).await? {
            FsReply::Lookup(reply) => Ok(reply),
            other => Err(unexpected("LOOKUP", other)),
        }
    }

    /// OPEN_NODE for a node named by triplet.
    pub async fn open_node(&self, device: DeviceId, index: NodeIndex) -> Result<NodeInfo> {
        match self.call(FsRequest::OpenNode { device, index }).await? {
            FsReply::Node(info) => Ok(info),
            other => Err(unexpected("OPEN_NODE", other)),
        }
    }

    /// READ; answers the data and the position advance.
    pub async fn read(
        &self,
        device: DeviceId,
        index: NodeIndex,
        pos: u64,
        len: usize,
    ) -> Result<(Vec<u8>, usize)> {
        let request = FsRequest::Read {
            device,
            index,
            pos_lo: lower32(pos),
            pos_hi: upper32(pos),
            len,
        };
        match self.call(request).await? {
            FsReply::Read { data, bytes } => Ok((data, bytes)),
            other => Err(unexpected("READ", other)),
        }
    }

    /// WRITE; answers the bytes accepted and the new size.
    pub async fn write(
        &self,
        device: DeviceId,
        index: NodeIndex,
        pos: u64,
        data: &[u8],
    ) -> Result<(usize, u64)> {
        let request = FsRequest::Write {
            device,
            index,
            pos_lo: lower32(pos),
            pos_hi: upper32(pos),
            data: data.to_vec(),
        };
        match self.call(request).await? {
            FsReply::Written {
                bytes,
                size_lo,
                size_hi,
            } => Ok((bytes, merge_loup32(size_lo, size_hi))),
            other => Err(unexpected("WRITE", other)),
        }
    }

    /// TRUNCATE to `size`.
    pub async fn truncate(&self, device: DeviceId, index: NodeIndex, size: u64) -> Result<()> {
        let request = FsRequest::Truncate {
            device,
            index,
            size_lo: lower32(size),
            size_hi: upper32(size),
        };
        self.expect_done("TRUNCATE", request).await
    }

    /// STAT.
    pub async fn stat(&self, device: DeviceId, index: NodeIndex, is_open: bool) -> Result<NodeStat> {
        let request = FsRequest::Stat {
            device,
            index,
            is_open,
        };
        match self.call(request).await? {
            FsReply::Stat(stat) => Ok(stat),
            other => Err(unexpected("STAT", other)),
        }
    }

    /// SYNC.
    pub async fn sync(&self, device: DeviceId, index: NodeIndex) -> Result<()> {
        self.expect_done("SYNC", FsRequest::Sync { device, index })
            .await
    }

    /// DESTROY.
    pub async fn destroy(&self, device: DeviceId, index: NodeIndex) -> Result<()> {
        self.expect_done("DESTROY", FsRequest::Destroy { device, index })
            .await
    }

    async fn expect_done(&self, verb: &str, request: FsRequest) -> Result<()> {
        match self.call(request).await? {
            FsReply::Done => Ok(()),
            other => Err(unexpected(verb, other)),
        }
    }
}

type Envelope = (FsRequest, oneshot::Sender<Result<FsReply>>);

/// Endpoint that reaches its backend through a channel, the way a separate
/// server process is reached.
///
/// Every request is served in its own task, so a slow request does not hold
/// up others sent over the same channel.
#[derive(Clone)]
pub struct ChannelEndpoint {
    tx: mpsc::Sender<Envelope>,
}

impl ChannelEndpoint {
    /// Spawns a server task answering requests with `backend`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(backend: Endpoint, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Envelope>(capacity.max(1));

        tokio::spawn(async move {
            while let Some((request, reply_tx)) = rx.recv().await {
                let backend = backend.clone();
                tokio::spawn(async move {
                    let reply = backend.call(request).await;
                    if reply_tx.send(reply).is_err() {
                        error!("Requester went away before the reply was sent");
                    }
                });
            }
            debug!("Backend channel closed");
        });

        Self { tx }
    }
}

#[async_trait]
impl FsEndpoint for ChannelEndpoint {
    async fn call(&self, request: FsRequest) -> Result<FsReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((request, reply_tx))
            .await
            .map_err(|_| VfsError::Disconnected)?;
        reply_rx.await.map_err(|_| VfsError::Disconnected)?
    }
}
