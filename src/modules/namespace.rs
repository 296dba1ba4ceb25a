//! Namespace state and path resolution.
//!
//! [`NamespaceState`] is what the namespace lock protects: the mount root
//! record and the pins held by active mounts. Anything that can change which
//! triplet a path resolves to takes the lock exclusively; resolution alone
//! takes it shared. The resolver only needs a `&NamespaceState`, so callers
//! holding either guard can resolve.

use super::constants::MAX_PATH_LEN;
use super::error::{Result, VfsError};
use super::node::{DeviceId, FsHandle, LookupResult, NodeIndex, NodeRef, Triplet};
use super::proto::{LookupFlags, LookupReply};
use super::vfs::Vfs;
use log::debug;
use std::collections::HashMap;

/// Filesystem instance backing `/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountRoot {
    /// Root filesystem handle
    pub fs_handle: FsHandle,
    /// Root filesystem device
    pub device: DeviceId,
}

/// References an active mount keeps alive until it is unmounted.
#[derive(Debug)]
pub(crate) struct MountPin {
    /// Root node of the mounted instance
    pub(crate) root: NodeRef,
    /// Directory mounted over; `None` for `/`
    pub(crate) mountpoint: Option<NodeRef>,
}

/// State guarded by the namespace lock.
#[derive(Debug, Default)]
pub struct NamespaceState {
    pub(crate) root: Option<MountRoot>,
    pub(crate) pins: HashMap<(FsHandle, DeviceId), MountPin>,
}

impl NamespaceState {
    /// The mount root record, if `/` is mounted.
    pub fn root(&self) -> Option<MountRoot> {
        self.root
    }

    /// Number of active mounts, `/` included.
    pub fn mount_count(&self) -> usize {
        self.pins.len()
    }

    /// Whether the instance `(fs_handle, device)` is mounted somewhere.
    pub fn is_mounted(&self, fs_handle: FsHandle, device: DeviceId) -> bool {
        self.pins.contains_key(&(fs_handle, device))
    }
}

/// Canonicalizes an absolute path.
///
/// Repeated slashes and `.` components are dropped, `..` removes the previous
/// component (and stays at `/` when there is none) and trailing slashes are
/// removed. The result is `/` or `/a/b` form.
pub fn canonify(path: &str) -> Result<String> {
    if !path.starts_with('/') {
        return Err(VfsError::InvalidArgument);
    }
    if path.len() > MAX_PATH_LEN {
        return Err(VfsError::NameTooLong);
    }

    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }

    Ok(format!("/{}", parts.join("/")))
}

/// Parent directory of a canonical path; `/` is its own parent.
pub fn parent_of(canonical: &str) -> &str {
    match canonical.rfind('/') {
        Some(0) | None => "/",
        Some(pos) => &canonical[..pos],
    }
}

/// Splits a canonical path into its components.
pub(crate) fn components(canonical: &str) -> Vec<&str> {
    canonical.split('/').filter(|c| !c.is_empty()).collect()
}

impl Vfs {
    /// Resolves `path` to a triplet and its metadata.
    ///
    /// Components inside one filesystem are resolved by a single LOOKUP to
    /// that filesystem. When a backend reports a mount crossing, resolution
    /// continues at the root of the mounted filesystem with the remaining
    /// components. UNLINK and LINK side effects happen inside the backend as
    /// part of the same request.
    pub(crate) async fn lookup(
        &self,
        ns: &NamespaceState,
        path: &str,
        flags: LookupFlags,
        link: Option<NodeIndex>,
    ) -> Result<LookupResult> {
        let canonical = canonify(path)?;
        let root = ns.root.ok_or(VfsError::NotFound)?;
        let all = components(&canonical);

        let mut fs_handle = root.fs_handle;
        let mut device = root.device;
        let mut start = None;
        let mut rest: &[&str] = &all;

        loop {
            let client = self.registry.client(fs_handle)?;
            match client.lookup(device, start, rest, flags, link).await? {
                LookupReply::Found(info) => {
                    return Ok(LookupResult {
                        triplet: Triplet::new(fs_handle, device, info.index),
                        size: info.size,
                        link_count: info.link_count,
                        kind: info.kind,
                    });
                }
                LookupReply::Crossed {
                    consumed,
                    fs_handle: next_fs,
                    device: next_device,
                } => {
                    if consumed == 0 || consumed > rest.len() {
                        return Err(VfsError::Protocol(format!(
                            "lookup crossing consumed {} of {} components",
                            consumed,
                            rest.len()
                        )));
                    }
                    debug!(
                        "Lookup of {} crossed into ({}, {}) after {:?}",
                        canonical,
                        next_fs,
                        next_device,
                        &rest[..consumed]
                    );
                    rest = &rest[consumed..];
                    fs_handle = next_fs;
                    device = next_device;
                    start = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::node::NodeKind;
    use crate::modules::testing::Fixture;

    #[test]
    fn test_canonify() -> anyhow::Result<()> {
        assert_eq!(canonify("/")?, "/");
        assert_eq!(canonify("//a///b/")?, "/a/b");
        assert_eq!(canonify("/a/./b/../c")?, "/a/c");
        assert_eq!(canonify("/../..")?, "/");
        assert_eq!(canonify("relative/path"), Err(VfsError::InvalidArgument));
        assert_eq!(canonify(""), Err(VfsError::InvalidArgument));
        Ok(())
    }

    #[test]
    fn test_canonify_is_idempotent() -> anyhow::Result<()> {
        for path in ["/a//b/./c/..", "/x/../../y/", "/.", "/a/b/c"] {
            let once = canonify(path)?;
            assert_eq!(canonify(&once)?, once);
        }
        Ok(())
    }

    #[test]
    fn test_parent_of() {
        assert_eq!(parent_of("/"), "/");
        assert_eq!(parent_of("/a"), "/");
        assert_eq!(parent_of("/a/b/c"), "/a/b");
    }

    #[tokio::test]
    async fn test_lookup_without_root_is_not_found() {
        let vfs = Vfs::default();
        let ns = vfs.namespace.read().await;
        let err = vfs
            .lookup(&ns, "/a", LookupFlags::empty(), None)
            .await
            .unwrap_err();
        assert_eq!(err, VfsError::NotFound);
    }

    #[tokio::test]
    async fn test_lookup_crosses_into_mounted_filesystem() -> anyhow::Result<()> {
        let fx = Fixture::with_root().await?;
        fx.vfs.mkdir("/mnt").await?;
        fx.vfs.mount("/mnt", "scratch", 2, "", false).await?;
        fx.vfs.mkdir("/mnt/deep").await?;

        let ns = fx.vfs.namespace.read().await;
        let deep = fx
            .vfs
            .lookup(&ns, "/mnt/deep", LookupFlags::DIRECTORY, None)
            .await?;
        assert_eq!(deep.triplet.fs_handle, fx.scratch);
        assert_eq!(deep.triplet.device, 2);
        assert_eq!(deep.kind, NodeKind::Directory);

        let mounted_root = fx.vfs.lookup(&ns, "/mnt", LookupFlags::empty(), None).await?;
        assert_eq!(mounted_root.triplet.fs_handle, fx.scratch);

        let mount_point = fx.vfs.lookup(&ns, "/mnt", LookupFlags::MP, None).await?;
        assert_eq!(mount_point.triplet.fs_handle, fx.tmpfs);
        Ok(())
    }

    #[tokio::test]
    async fn test_lookup_kind_checks() -> anyhow::Result<()> {
        let fx = Fixture::with_root().await?;
        fx.vfs.mkdir("/dir").await?;
        let ns = fx.vfs.namespace.read().await;

        assert_eq!(
            fx.vfs.lookup(&ns, "/dir", LookupFlags::FILE, None).await,
            Err(VfsError::IsADirectory)
        );
        assert_eq!(
            fx.vfs.lookup(&ns, "/dir/missing", LookupFlags::empty(), None).await,
            Err(VfsError::NotFound)
        );
        assert_eq!(
            fx.vfs.lookup(&ns, "/dir", LookupFlags::ROOT, None).await,
            Err(VfsError::InvalidArgument)
        );
        Ok(())
    }
}
