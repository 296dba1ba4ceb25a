//! The process-wide VFS context.
//!
//! [`Vfs`] owns the namespace lock, the node cache and the filesystem
//! registry. Every operation receives it explicitly instead of reaching for
//! global state, so independent instances never interfere with each other.

use super::config::VfsConfig;
use super::error::Result;
use super::namespace::{MountRoot, NamespaceState};
use super::node::{FsHandle, NodeCache, Triplet};
use super::proto::{Endpoint, LookupFlags, NodeStat};
use super::registry::{FsInfo, FsRegistry};
use log::{debug, info, warn};
use tokio::sync::RwLock;

/// Shared state of one VFS server.
pub struct Vfs {
    pub(crate) namespace: RwLock<NamespaceState>,
    pub(crate) nodes: NodeCache,
    pub(crate) registry: FsRegistry,
    pub(crate) config: VfsConfig,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new(VfsConfig::default())
    }
}

impl Vfs {
    /// Creates a server with nothing registered and nothing mounted.
    pub fn new(config: VfsConfig) -> Self {
        Self {
            namespace: RwLock::new(NamespaceState::default()),
            nodes: NodeCache::new(),
            registry: FsRegistry::new(),
            config,
        }
    }

    /// Configuration the server was built with.
    pub fn config(&self) -> &VfsConfig {
        &self.config
    }

    /// The node cache.
    pub fn nodes(&self) -> &NodeCache {
        &self.nodes
    }

    /// The filesystem registry.
    pub fn registry(&self) -> &FsRegistry {
        &self.registry
    }

    /// Registers a backend filesystem; see [`FsRegistry::register`].
    pub fn register_fs(&self, info: FsInfo, endpoint: Endpoint) -> Result<FsHandle> {
        self.registry.register(info, endpoint)
    }

    /// The mount root record, if `/` is mounted.
    pub async fn mount_root(&self) -> Option<MountRoot> {
        self.namespace.read().await.root()
    }

    /// Creates a directory.
    pub async fn mkdir(&self, path: &str) -> Result<()> {
        let ns = self.namespace.write().await;
        let flags = LookupFlags::DIRECTORY | LookupFlags::CREATE | LookupFlags::EXCLUSIVE;
        self.lookup(&ns, path, flags, None).await?;
        debug!("Created directory {}", path);
        Ok(())
    }

    /// Removes the directory entry at `path`.
    ///
    /// Only the DIRECTORY bit of `flags` is honoured. The node is interned
    /// and released again so that it is destroyed once nothing references it.
    pub async fn unlink(&self, path: &str, flags: LookupFlags) -> Result<()> {
        let result = self.unlink_entry(path, flags).await;
        self.reap_orphans().await;
        result
    }

    async fn unlink_entry(&self, path: &str, flags: LookupFlags) -> Result<()> {
        let flags = flags & LookupFlags::DIRECTORY;
        let ns = self.namespace.write().await;
        let res = self
            .lookup(&ns, path, flags | LookupFlags::UNLINK, None)
            .await?;

        let node = self.nodes.get(&res);
        node.adjust_link_count(-1);
        drop(ns);
        info!("Unlinked {} -> {}", path, res.triplet);
        drop(node);
        Ok(())
    }

    /// Attributes of the node at `path`.
    pub async fn stat(&self, path: &str) -> Result<NodeStat> {
        let ns = self.namespace.read().await;
        let res = self.lookup(&ns, path, LookupFlags::empty(), None).await?;
        let node = self.nodes.get(&res);
        drop(ns);

        let stat = self.stat_node(node.triplet(), false).await;
        drop(node);
        self.reap_orphans().await;
        stat
    }

    /// STAT of a node the caller holds a reference to.
    pub(crate) async fn stat_node(&self, triplet: Triplet, is_open: bool) -> Result<NodeStat> {
        let mut stat = self
            .registry
            .client(triplet.fs_handle)?
            .stat(triplet.device, triplet.index, is_open)
            .await?;
        // Backends answer only the parts of the identity they know
        stat.triplet = triplet;
        Ok(stat)
    }

    /// Sends DESTROY for every node released with no links left.
    pub(crate) async fn reap_orphans(&self) {
        for triplet in self.nodes.take_orphans() {
            // Opened again by triplet since its last release
            if self.nodes.contains(&triplet) {
                debug!("Not destroying {}: referenced again", triplet);
                continue;
            }
            let client = match self.registry.client(triplet.fs_handle) {
                Ok(client) => client,
                Err(e) => {
                    warn!("Cannot destroy {}: {}", triplet, e);
                    continue;
                }
            };
            match client.destroy(triplet.device, triplet.index).await {
                Ok(()) => debug!("Destroyed {}", triplet),
                Err(e) => warn!("Backend failed to destroy {}: {}", triplet, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::error::VfsError;
    use crate::modules::node::{LookupResult, NodeKind};
    use crate::modules::proto::OpenFlags;
    use crate::modules::testing::Fixture;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_mkdir_and_stat() -> anyhow::Result<()> {
        let fx = Fixture::with_root().await?;
        fx.vfs.mkdir("/docs").await?;

        let stat = fx.vfs.stat("/docs").await?;
        assert_eq!(stat.kind, NodeKind::Directory);
        assert_eq!(stat.triplet.fs_handle, fx.tmpfs);
        assert!(!stat.is_open);

        assert_eq!(fx.vfs.mkdir("/docs").await, Err(VfsError::AlreadyExists));
        assert_eq!(fx.vfs.mkdir("/nope/docs").await, Err(VfsError::NotFound));
        Ok(())
    }

    #[tokio::test]
    async fn test_stat_leaves_no_references_behind() -> anyhow::Result<()> {
        let fx = Fixture::with_root().await?;
        fx.vfs.mkdir("/a").await?;
        let stat = fx.vfs.stat("/a").await?;

        assert_eq!(fx.vfs.nodes().refcount(&stat.triplet), 0);
        assert!(!fx.vfs.nodes().contains(&stat.triplet));
        Ok(())
    }

    #[tokio::test]
    async fn test_unlink_destroys_unreferenced_node() -> anyhow::Result<()> {
        let fx = Fixture::with_root().await?;
        fx.vfs.mkdir("/gone").await?;
        let before = fx.tmpfs_backend.node_count(1);

        assert_ok!(fx.vfs.unlink("/gone", LookupFlags::DIRECTORY).await);
        assert_eq!(fx.tmpfs_backend.node_count(1), before - 1);
        assert_err!(fx.vfs.stat("/gone").await);
        Ok(())
    }

    #[tokio::test]
    async fn test_unlink_of_non_empty_directory_fails() -> anyhow::Result<()> {
        let fx = Fixture::with_root().await?;
        fx.vfs.mkdir("/full").await?;
        fx.vfs.mkdir("/full/inner").await?;

        assert_eq!(
            fx.vfs.unlink("/full", LookupFlags::empty()).await,
            Err(VfsError::NotEmpty)
        );
        assert_ok!(fx.vfs.stat("/full/inner").await);
        Ok(())
    }

    #[tokio::test]
    async fn test_unlink_sanitizes_flags() -> anyhow::Result<()> {
        let fx = Fixture::with_root().await?;
        fx.vfs.mkdir("/d").await?;

        // CREATE and friends are stripped; only the unlink happens
        let flags = LookupFlags::DIRECTORY | LookupFlags::CREATE | LookupFlags::EXCLUSIVE;
        fx.vfs.unlink("/d", flags).await?;
        assert_eq!(fx.vfs.stat("/d").await, Err(VfsError::NotFound));
        Ok(())
    }

    #[tokio::test]
    async fn test_reinterned_orphan_is_not_destroyed() -> anyhow::Result<()> {
        let fx = Fixture::with_root().await?;
        let fd = fx.client.open("/f", LookupFlags::FILE, OpenFlags::CREATE).await?;
        let triplet = fx.client.file(fd)?.triplet();
        fx.client.close(fd).await?;

        let unlinked = LookupResult {
            triplet,
            size: 0,
            link_count: 0,
            kind: NodeKind::File,
        };
        // Released with no links, then opened again by triplet before reaping
        drop(fx.vfs.nodes().get(&unlinked));
        let reopened = fx.vfs.nodes().get(&unlinked);

        fx.vfs.reap_orphans().await;
        assert_eq!(fx.tmpfs_faults.count("DESTROY"), 0);
        assert!(fx.vfs.nodes().contains(&triplet));

        drop(reopened);
        fx.vfs.reap_orphans().await;
        assert_eq!(fx.tmpfs_faults.count("DESTROY"), 1);
        Ok(())
    }
}
