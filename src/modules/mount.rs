//! Mounting and unmounting filesystems into the namespace.
//!
//! The namespace starts with nothing at `/`. The first mount of `/` installs
//! the mount root record; further mounts graft a filesystem's root over a
//! directory of an already mounted filesystem. Every mount pins its root node
//! (and its mount point, if any) until the matching unmount, and unmount only
//! succeeds while nobody else references the mounted filesystem.

use super::constants::{FS_NAME_MAXLEN, MAX_MNTOPTS_LEN, MAX_PATH_LEN};
use super::error::{Result, VfsError};
use super::namespace::{canonify, MountPin, MountRoot};
use super::node::{DeviceId, FsHandle, LookupResult, NodeKind, Triplet};
use super::proto::LookupFlags;
use super::vfs::Vfs;
use log::{debug, info};

impl Vfs {
    /// Mounts device `device` of the filesystem named `fs_name` at `mountpoint`.
    ///
    /// When no filesystem of that name is registered the call fails with
    /// [`VfsError::NotFound`], or waits for it to register if `blocking` is set.
    pub async fn mount(
        &self,
        mountpoint: &str,
        fs_name: &str,
        device: DeviceId,
        options: &str,
        blocking: bool,
    ) -> Result<()> {
        if mountpoint.len() > MAX_PATH_LEN
            || options.len() > MAX_MNTOPTS_LEN
            || fs_name.len() > FS_NAME_MAXLEN
        {
            return Err(VfsError::NameTooLong);
        }

        let fs_handle = match self.registry.handle_of(fs_name) {
            Some(handle) => handle,
            None if blocking => {
                debug!("Waiting for filesystem {} to register", fs_name);
                self.registry.wait_for(fs_name).await
            }
            None => return Err(VfsError::NotFound),
        };

        self.mount_handle(mountpoint, fs_handle, device, options)
            .await
    }

    /// Mounts `(fs_handle, device)` at `mountpoint`.
    pub async fn mount_handle(
        &self,
        mountpoint: &str,
        fs_handle: FsHandle,
        device: DeviceId,
        options: &str,
    ) -> Result<()> {
        let mountpoint = canonify(mountpoint)?;
        let mut ns = self.namespace.write().await;

        if mountpoint == "/" && ns.root.is_some() {
            return Err(VfsError::AlreadyMounted);
        }
        if ns.is_mounted(fs_handle, device) {
            return Err(VfsError::Busy);
        }

        if ns.root.is_none() {
            if mountpoint != "/" {
                // Nothing can be resolved before the root filesystem exists
                return Err(VfsError::NotFound);
            }

            let info = self
                .registry
                .client(fs_handle)?
                .mounted(device, options)
                .await?;
            let root = self.nodes.get(&LookupResult {
                triplet: Triplet::new(fs_handle, device, info.index),
                size: info.size,
                link_count: info.link_count,
                kind: NodeKind::Directory,
            });

            ns.root = Some(MountRoot { fs_handle, device });
            ns.pins.insert(
                (fs_handle, device),
                MountPin {
                    root,
                    mountpoint: None,
                },
            );
            info!("Mounted ({}, {}) at /", fs_handle, device);
            return Ok(());
        }

        let mp_res = self.lookup(&ns, &mountpoint, LookupFlags::MP, None).await?;
        // Held for the mount's lifetime so the directory cannot be removed
        let mp_node = self.nodes.get(&mp_res);

        let mountee = self.registry.endpoint(fs_handle)?;
        let owner = self.registry.client(mp_node.triplet().fs_handle)?;
        let info = owner
            .mount(mp_node.triplet(), fs_handle, device, options, mountee)
            .await?;

        let root = self.nodes.get(&LookupResult {
            triplet: Triplet::new(fs_handle, device, info.index),
            size: info.size,
            link_count: info.link_count,
            kind: NodeKind::Directory,
        });
        ns.pins.insert(
            (fs_handle, device),
            MountPin {
                root,
                mountpoint: Some(mp_node),
            },
        );
        info!("Mounted ({}, {}) at {}", fs_handle, device, mountpoint);
        Ok(())
    }

    /// Unmounts the filesystem mounted at `mountpoint`.
    ///
    /// Fails with [`VfsError::Busy`] while anything besides the mount itself
    /// references a node of the mounted filesystem.
    pub async fn unmount(&self, mountpoint: &str) -> Result<()> {
        let result = self.unmount_locked(mountpoint).await;
        self.reap_orphans().await;
        result
    }

    async fn unmount_locked(&self, mountpoint: &str) -> Result<()> {
        let mountpoint = canonify(mountpoint)?;
        let mut ns = self.namespace.write().await;

        let mr_res = self
            .lookup(&ns, &mountpoint, LookupFlags::ROOT, None)
            .await?;
        let mr_node = self.nodes.get(&mr_res);
        let mounted = mr_node.triplet();

        // One reference from the lookup above, one from the mount itself
        let refs = self
            .nodes
            .sum_of_references(mounted.fs_handle, mounted.device);
        if refs != 2 {
            debug!(
                "Cannot unmount {}: {} references to ({}, {})",
                mountpoint, refs, mounted.fs_handle, mounted.device
            );
            return Err(VfsError::Busy);
        }

        let mp_node = if mountpoint == "/" {
            self.registry
                .client(mounted.fs_handle)?
                .unmounted(mounted.device)
                .await?;
            ns.root = None;
            None
        } else {
            let mp_res = self.lookup(&ns, &mountpoint, LookupFlags::MP, None).await?;
            let mp_node = self.nodes.get(&mp_res);
            let mp = mp_node.triplet();
            self.registry
                .client(mp.fs_handle)?
                .unmount(mp.device, mp.index)
                .await?;
            Some(mp_node)
        };

        // The mounted root is unreachable by any path now
        if let Some(pin) = ns.pins.remove(&(mounted.fs_handle, mounted.device)) {
            self.nodes.forget(pin.root);
            drop(pin.mountpoint);
        }
        drop(mr_node);
        drop(mp_node);

        info!(
            "Unmounted ({}, {}) from {}",
            mounted.fs_handle, mounted.device, mountpoint
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::proto::{FsRequest, OpenFlags};
    use crate::modules::testing::Fixture;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_mount_root_then_unmount_leaves_nothing() -> anyhow::Result<()> {
        let fx = Fixture::new();
        fx.vfs.mount("/", "tmpfs", 1, "", false).await?;

        let root = fx
            .vfs
            .mount_root()
            .await
            .ok_or_else(|| anyhow::anyhow!("no root"))?;
        assert_eq!(root, MountRoot { fs_handle: fx.tmpfs, device: 1 });
        let root_triplet = Triplet::new(fx.tmpfs, 1, 0);
        assert_eq!(fx.vfs.nodes().refcount(&root_triplet), 1);

        fx.vfs.unmount("/").await?;
        assert_eq!(fx.vfs.mount_root().await, None);
        assert!(!fx.vfs.nodes().contains(&root_triplet));
        assert!(fx.vfs.nodes().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_mount_before_root_requires_slash() {
        let fx = Fixture::new();
        assert_eq!(
            fx.vfs.mount("/mnt", "tmpfs", 1, "", false).await,
            Err(VfsError::NotFound)
        );
        assert_eq!(fx.vfs.mount_root().await, None);
    }

    #[tokio::test]
    async fn test_second_root_mount_is_rejected() -> anyhow::Result<()> {
        let fx = Fixture::with_root().await?;
        assert_eq!(
            fx.vfs.mount("/", "scratch", 9, "", false).await,
            Err(VfsError::AlreadyMounted)
        );
        // The instance already serving `/` gets the same answer
        assert_eq!(
            fx.vfs.mount("/", "tmpfs", 1, "", false).await,
            Err(VfsError::AlreadyMounted)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_filesystem_name() -> anyhow::Result<()> {
        let fx = Fixture::with_root().await?;
        fx.vfs.mkdir("/mnt").await?;
        assert_eq!(
            fx.vfs.mount("/mnt", "ext9", 2, "", false).await,
            Err(VfsError::NotFound)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_mount_pins_mountpoint_until_unmount() -> anyhow::Result<()> {
        let fx = Fixture::with_root().await?;
        fx.vfs.mkdir("/mnt").await?;
        let mp = fx.vfs.stat("/mnt").await?.triplet;
        fx.vfs.mount("/mnt", "scratch", 2, "", false).await?;

        assert_eq!(fx.vfs.nodes().refcount(&mp), 1);
        // The pinned directory cannot go away underneath the mount
        assert_eq!(
            fx.vfs.unlink("/mnt", LookupFlags::DIRECTORY).await,
            Err(VfsError::Busy)
        );

        fx.vfs.unmount("/mnt").await?;
        assert_eq!(fx.vfs.nodes().refcount(&mp), 0);
        assert!(!fx.vfs.nodes().contains(&Triplet::new(fx.scratch, 2, 0)));
        assert!(!fx.scratch_backend.has_device(2));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_mount_releases_mountpoint() -> anyhow::Result<()> {
        let fx = Fixture::with_root().await?;
        fx.vfs.mkdir("/mnt").await?;
        let mp = fx.vfs.stat("/mnt").await?.triplet;
        fx.fail_tmpfs(
            |req| matches!(req, FsRequest::Mount { .. }),
            VfsError::Backend(libc::EIO),
        );

        assert_eq!(
            fx.vfs.mount("/mnt", "scratch", 2, "", false).await,
            Err(VfsError::Backend(libc::EIO))
        );
        assert_eq!(fx.vfs.nodes().refcount(&mp), 0);
        assert!(!fx.scratch_backend.has_device(2));
        assert!(!fx.vfs.namespace.read().await.is_mounted(fx.scratch, 2));
        Ok(())
    }

    #[tokio::test]
    async fn test_same_instance_cannot_be_mounted_twice() -> anyhow::Result<()> {
        let fx = Fixture::with_root().await?;
        fx.vfs.mkdir("/a").await?;
        fx.vfs.mkdir("/b").await?;
        fx.vfs.mount("/a", "scratch", 2, "", false).await?;
        assert_eq!(
            fx.vfs.mount("/b", "scratch", 2, "", false).await,
            Err(VfsError::Busy)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_unmount_busy_while_file_open() -> anyhow::Result<()> {
        let fx = Fixture::with_root().await?;
        fx.vfs.mkdir("/mnt").await?;
        fx.vfs.mount("/mnt", "scratch", 2, "", false).await?;

        let fd = fx
            .client
            .open("/mnt/log", LookupFlags::FILE, OpenFlags::CREATE)
            .await?;
        assert_eq!(fx.vfs.unmount("/mnt").await, Err(VfsError::Busy));
        assert_eq!(fx.vfs.unmount("/").await, Err(VfsError::Busy));

        fx.client.close(fd).await?;
        assert_ok!(fx.vfs.unmount("/mnt").await);
        Ok(())
    }

    #[tokio::test]
    async fn test_unmount_of_plain_directory_is_rejected() -> anyhow::Result<()> {
        let fx = Fixture::with_root().await?;
        fx.vfs.mkdir("/plain").await?;
        assert_eq!(fx.vfs.unmount("/plain").await, Err(VfsError::InvalidArgument));
        Ok(())
    }

    #[tokio::test]
    async fn test_blocking_mount_waits_for_registration() -> anyhow::Result<()> {
        let fx = Fixture::with_root().await?;
        fx.vfs.mkdir("/late").await?;

        let vfs = fx.vfs.clone();
        let pending =
            tokio::spawn(async move { vfs.mount("/late", "latefs", 5, "", true).await });
        tokio::task::yield_now().await;

        fx.register_memfs("latefs")?;
        tokio::time::timeout(std::time::Duration::from_secs(5), pending).await???;
        assert_ok!(fx.vfs.stat("/late").await);
        Ok(())
    }

    #[tokio::test]
    async fn test_root_unmount_failure_keeps_root() -> anyhow::Result<()> {
        let fx = Fixture::with_root().await?;
        fx.fail_tmpfs(
            |req| matches!(req, FsRequest::Unmounted { .. }),
            VfsError::Backend(libc::EIO),
        );

        assert_eq!(fx.vfs.unmount("/").await, Err(VfsError::Backend(libc::EIO)));
        assert!(fx.vfs.mount_root().await.is_some());
        assert_eq!(fx.vfs.nodes().refcount(&Triplet::new(fx.tmpfs, 1, 0)), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_options_length_limit() -> anyhow::Result<()> {
        let fx = Fixture::new();
        let options = "o".repeat(MAX_MNTOPTS_LEN + 1);
        assert_eq!(
            fx.vfs.mount("/", "tmpfs", 1, &options, false).await,
            Err(VfsError::NameTooLong)
        );
        Ok(())
    }
}
