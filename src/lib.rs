#![doc(html_root_url = "https://docs.rs/vfsd/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

//! vfsd: the namespace and consistency layer of a virtual file system server
//!
//! The server sits between clients and any number of backend filesystems. It
//! owns the global namespace, caches one node per file identity, keeps open
//! files and cursors for each client, and forwards data requests to the
//! backend owning the node.
//!
//! ## Features
//!
//! - Mounting filesystems at `/` and over directories of other filesystems
//! - Path resolution across mount points
//! - Reference-counted node cache with automatic release
//! - Per-client descriptor tables with `dup` and append mode
//! - Rename with rollback of a half-done link
//! - An in-memory backend filesystem
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vfsd::{Client, FsInfo, LookupFlags, MemFs, OpenFlags, Vfs, Whence};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let vfs = Arc::new(Vfs::default());
//! vfs.register_fs(FsInfo::new("tmpfs"), Arc::new(MemFs::new()))?;
//! vfs.mount("/", "tmpfs", 1, "", false).await?;
//!
//! let client = Client::new(vfs.clone());
//! let fd = client.open("/hello", LookupFlags::FILE, OpenFlags::CREATE).await?;
//! client.write(fd, b"hello").await?;
//! client.seek(fd, 0, Whence::Set).await?;
//! assert_eq!(client.read(fd, 5).await?, b"hello");
//! client.close(fd).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Lock order
//!
//! Namespace lock, then node table, then a node's content lock, then an open
//! file's cursor mutex. No operation acquires them in any other order.

pub mod modules;

pub use modules::config::VfsConfig;
pub use modules::error::{Result, VfsError};
pub use modules::file::{Client, Fd};
pub use modules::filesystem::MemFs;
pub use modules::node::{NodeKind, Triplet};
pub use modules::proto::{ChannelEndpoint, Endpoint, FsEndpoint, LookupFlags, NodeStat, OpenFlags};
pub use modules::rdwr::Whence;
pub use modules::registry::FsInfo;
pub use modules::session::{Request, Response, Session};
pub use modules::vfs::Vfs;
