//! Client sessions.
//!
//! A [`Session`] is the message loop behind one client: requests arrive over
//! a bounded channel, each is served in its own task against the client's
//! descriptor table, and the answer goes back through a oneshot reply. A slow
//! backend therefore only holds up the requests that actually wait on it.

use super::error::{Result, VfsError};
use super::file::{Client, Fd};
use super::node::{DeviceId, Triplet};
use super::proto::{LookupFlags, NodeStat, OpenFlags};
use super::rdwr::Whence;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

/// Operations a client can ask of the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Mount a registered filesystem
    Mount {
        /// Where to mount
        mountpoint: String,
        /// Registered filesystem name
        fs: String,
        /// Device to mount
        device: DeviceId,
        /// Mount options blob
        options: String,
        /// Wait for `fs` to register instead of failing
        blocking: bool,
    },
    /// Unmount whatever is mounted at a path
    Unmount {
        /// Mount point
        mountpoint: String,
    },
    /// Open a path
    Open {
        /// Path to open
        path: String,
        /// FILE or DIRECTORY
        lflags: LookupFlags,
        /// Open flags
        oflags: OpenFlags,
    },
    /// Open a node by identity
    OpenNode {
        /// Node to open
        triplet: Triplet,
        /// Open flags
        oflags: OpenFlags,
    },
    /// Close a descriptor
    Close {
        /// Descriptor
        fd: Fd,
    },
    /// Make `new` name the open file behind `old`
    Dup {
        /// Source descriptor
        old: Fd,
        /// Target descriptor
        new: Fd,
    },
    /// Read at the cursor
    Read {
        /// Descriptor
        fd: Fd,
        /// Maximum number of bytes
        len: usize,
    },
    /// Write at the cursor
    Write {
        /// Descriptor
        fd: Fd,
        /// Bytes to write
        data: Vec<u8>,
    },
    /// Move the cursor
    Seek {
        /// Descriptor
        fd: Fd,
        /// Signed offset
        offset: i64,
        /// `SEEK_SET`, `SEEK_CUR` or `SEEK_END`
        whence: i32,
    },
    /// Set a file's size
    Truncate {
        /// Descriptor
        fd: Fd,
        /// New size
        size: u64,
    },
    /// Flush a file
    Sync {
        /// Descriptor
        fd: Fd,
    },
    /// Attributes of an open file
    Fstat {
        /// Descriptor
        fd: Fd,
    },
    /// Attributes of a path
    Stat {
        /// Path
        path: String,
    },
    /// Create a directory
    Mkdir {
        /// Path
        path: String,
    },
    /// Remove a directory entry
    Unlink {
        /// Path
        path: String,
        /// DIRECTORY to insist on a directory
        lflags: LookupFlags,
    },
    /// Rename a directory entry
    Rename {
        /// Existing path
        old: String,
        /// New path
        new: String,
    },
}

/// Successful answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Nothing to report
    Done,
    /// A descriptor
    Fd(Fd),
    /// Bytes read
    Data(Vec<u8>),
    /// Number of bytes written
    Bytes(usize),
    /// Cursor position
    Offset(u64),
    /// Attributes
    Stat(NodeStat),
}

/// Serves one request on behalf of `client`.
pub async fn dispatch(client: &Client, request: Request) -> Result<Response> {
    let vfs = client.vfs();
    match request {
        Request::Mount {
            mountpoint,
            fs,
            device,
            options,
            blocking,
        } => vfs
            .mount(&mountpoint, &fs, device, &options, blocking)
            .await
            .map(|_| Response::Done),
        Request::Unmount { mountpoint } => vfs.unmount(&mountpoint).await.map(|_| Response::Done),
        Request::Open {
            path,
            lflags,
            oflags,
        } => client.open(&path, lflags, oflags).await.map(Response::Fd),
        Request::OpenNode { triplet, oflags } => {
            client.open_node(triplet, oflags).await.map(Response::Fd)
        }
        Request::Close { fd } => client.close(fd).await.map(|_| Response::Done),
        Request::Dup { old, new } => client.dup(old, new).await.map(Response::Fd),
        Request::Read { fd, len } => client.read(fd, len).await.map(Response::Data),
        Request::Write { fd, data } => client.write(fd, &data).await.map(Response::Bytes),
        Request::Seek { fd, offset, whence } => {
            let whence = Whence::try_from(whence)?;
            client.seek(fd, offset, whence).await.map(Response::Offset)
        }
        Request::Truncate { fd, size } => client.truncate(fd, size).await.map(|_| Response::Done),
        Request::Sync { fd } => client.sync(fd).await.map(|_| Response::Done),
        Request::Fstat { fd } => client.fstat(fd).await.map(Response::Stat),
        Request::Stat { path } => vfs.stat(&path).await.map(Response::Stat),
        Request::Mkdir { path } => vfs.mkdir(&path).await.map(|_| Response::Done),
        Request::Unlink { path, lflags } => vfs.unlink(&path, lflags).await.map(|_| Response::Done),
        Request::Rename { old, new } => vfs.rename(&old, &new).await.map(|_| Response::Done),
    }
}

type Envelope = (Request, oneshot::Sender<Result<Response>>);

/// Message loop serving one client.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use vfsd::{Client, LookupFlags, OpenFlags, Request, Session, Vfs};
///
/// # async fn demo() -> anyhow::Result<()> {
/// let vfs = Arc::new(Vfs::default());
/// let session = Session::start(Client::new(vfs), 16);
///
/// let reply = session
///     .call(Request::Open {
///         path: "/hello".into(),
///         lflags: LookupFlags::FILE,
///         oflags: OpenFlags::CREATE,
///     })
///     .await;
/// println!("{:?}", reply);
///
/// session.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct Session {
    id: Uuid,
    tx: mpsc::Sender<Envelope>,
    handle: JoinHandle<()>,
}

impl Session {
    /// Starts the message loop for `client`.
    ///
    /// # Arguments
    /// * `client` - Client whose descriptor table requests act on
    /// * `capacity` - Number of requests that may queue before senders wait
    pub fn start(client: Client, capacity: usize) -> Self {
        let id = client.id();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(Self::run_message_handler(client, rx));
        info!("Session {} started", id);
        Self { id, tx, handle }
    }

    /// Session identifier; the same as its client's.
    pub fn id(&self) -> Uuid {
        self.id
    }

    async fn run_message_handler(client: Client, mut rx: mpsc::Receiver<Envelope>) {
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                message = rx.recv() => {
                    let Some((request, reply_tx)) = message else {
                        break;
                    };
                    debug!("Session {} processing {:?}", client.id(), request);
                    let client = client.clone();
                    tasks.spawn(async move {
                        let reply = dispatch(&client, request).await;
                        if reply_tx.send(reply).is_err() {
                            debug!("Session {} caller went away", client.id());
                        }
                    });
                }
                Some(done) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = done {
                        error!("Session {} request task failed: {}", client.id(), e);
                    }
                }
            }
        }

        // Let requests already accepted finish
        while let Some(done) = tasks.join_next().await {
            if let Err(e) = done {
                error!("Session {} request task failed: {}", client.id(), e);
            }
        }
        info!("Session {} stopped", client.id());
    }

    /// Sends a request and waits for its answer.
    pub async fn call(&self, request: Request) -> Result<Response> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((request, reply_tx))
            .await
            .map_err(|_| VfsError::Disconnected)?;
        reply_rx.await.map_err(|_| VfsError::Disconnected)?
    }

    /// Stops accepting requests and waits for the ones in flight.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        info!("Shutting down session {}", self.id);
        drop(self.tx);
        self.handle
            .await
            .map_err(|e| anyhow::anyhow!("Failed to join session {}: {}", self.id, e))
    }
}
