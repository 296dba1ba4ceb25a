//! In-memory backend filesystem.
//!
//! [`MemFs`] answers the backend protocol entirely from memory. Each mounted
//! device is an independent instance with its own node table whose root is
//! [`MEMFS_ROOT_INDEX`]. Directories it owns can serve as mount points for
//! other filesystems: the mount record lives on the directory node, and
//! lookups that walk through it answer with a crossing instead of descending.

use super::constants::{MEMFS_MAX_FILE_SIZE, MEMFS_ROOT_INDEX};
use super::error::{Result, VfsError};
use super::node::{DeviceId, FsHandle, NodeIndex, NodeKind, Triplet};
use super::proto::{
    lower32, merge_loup32, upper32, Endpoint, FsClient, FsEndpoint, FsReply, FsRequest,
    LookupFlags, LookupReply, MounteeChannel, NodeInfo, NodeStat,
};
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

#[derive(Clone)]
struct MountedFs {
    fs_handle: FsHandle,
    device: DeviceId,
    endpoint: Endpoint,
}

struct MemNode {
    kind: NodeKind,
    data: Vec<u8>,
    children: BTreeMap<String, NodeIndex>,
    link_count: u32,
    mounted: Option<MountedFs>,
}

impl MemNode {
    fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            data: Vec::new(),
            children: BTreeMap::new(),
            link_count: 0,
            mounted: None,
        }
    }

    fn size(&self) -> u64 {
        match self.kind {
            NodeKind::File => self.data.len() as u64,
            NodeKind::Directory => self.children.len() as u64,
        }
    }

    fn info(&self, index: NodeIndex) -> NodeInfo {
        NodeInfo {
            index,
            size: self.size(),
            link_count: self.link_count,
            kind: self.kind,
        }
    }
}

struct Instance {
    nodes: HashMap<NodeIndex, MemNode>,
    next_index: NodeIndex,
}

impl Instance {
    fn new() -> Self {
        let mut root = MemNode::new(NodeKind::Directory);
        root.link_count = 1;
        let mut nodes = HashMap::new();
        nodes.insert(MEMFS_ROOT_INDEX, root);
        Self {
            nodes,
            next_index: MEMFS_ROOT_INDEX + 1,
        }
    }

    fn node(&self, index: NodeIndex) -> Result<&MemNode> {
        self.nodes.get(&index).ok_or(VfsError::NotFound)
    }

    fn node_mut(&mut self, index: NodeIndex) -> Result<&mut MemNode> {
        self.nodes.get_mut(&index).ok_or(VfsError::NotFound)
    }

    fn allocate(&mut self, kind: NodeKind) -> NodeIndex {
        let index = self.next_index;
        self.next_index += 1;
        self.nodes.insert(index, MemNode::new(kind));
        index
    }

    fn lookup(
        &mut self,
        start: Option<NodeIndex>,
        path: &[String],
        flags: LookupFlags,
        link: Option<NodeIndex>,
    ) -> Result<LookupReply> {
        let mut cur = start.unwrap_or(MEMFS_ROOT_INDEX);
        self.node(cur)?;

        let (last, walk) = match path.split_last() {
            Some(split) => split,
            None => {
                // The path names the start node itself
                if flags.contains(LookupFlags::UNLINK) {
                    return Err(VfsError::Busy);
                }
                if flags.contains(LookupFlags::LINK)
                    || flags.contains(LookupFlags::CREATE | LookupFlags::EXCLUSIVE)
                {
                    return Err(VfsError::AlreadyExists);
                }
                return self.found(cur, flags);
            }
        };

        for (i, name) in walk.iter().enumerate() {
            let dir = self.node(cur)?;
            if dir.kind != NodeKind::Directory {
                return Err(VfsError::NotADirectory);
            }
            let child = *dir.children.get(name).ok_or(VfsError::NotFound)?;
            if let Some(mounted) = &self.node(child)?.mounted {
                return Ok(crossing(i + 1, mounted));
            }
            cur = child;
        }

        let consumed = path.len();
        let parent = cur;
        let dir = self.node(parent)?;
        if dir.kind != NodeKind::Directory {
            return Err(VfsError::NotADirectory);
        }
        let existing = dir.children.get(last).copied();

        if flags.contains(LookupFlags::UNLINK) {
            let index = existing.ok_or(VfsError::NotFound)?;
            return self.unlink(parent, last, index, flags);
        }

        if flags.contains(LookupFlags::LINK) {
            let index = link.ok_or(VfsError::InvalidArgument)?;
            if existing.is_some() {
                return Err(VfsError::AlreadyExists);
            }
            let target = self.node_mut(index)?;
            target.link_count += 1;
            let info = target.info(index);
            self.node_mut(parent)?.children.insert(last.clone(), index);
            return Ok(LookupReply::Found(info));
        }

        match existing {
            Some(index) => {
                if flags.contains(LookupFlags::CREATE | LookupFlags::EXCLUSIVE) {
                    return Err(VfsError::AlreadyExists);
                }
                if let Some(mounted) = &self.node(index)?.mounted {
                    if !flags.contains(LookupFlags::MP) {
                        return Ok(crossing(consumed, mounted));
                    }
                }
                self.found(index, flags)
            }
            None if flags.contains(LookupFlags::CREATE) => {
                let kind = if flags.contains(LookupFlags::DIRECTORY) {
                    NodeKind::Directory
                } else {
                    NodeKind::File
                };
                let index = self.allocate(kind);
                let node = self.node_mut(index)?;
                node.link_count = 1;
                let info = node.info(index);
                self.node_mut(parent)?.children.insert(last.clone(), index);
                Ok(LookupReply::Found(info))
            }
            None => Err(VfsError::NotFound),
        }
    }

    fn found(&self, index: NodeIndex, flags: LookupFlags) -> Result<LookupReply> {
        let node = self.node(index)?;
        if flags.contains(LookupFlags::ROOT) && index != MEMFS_ROOT_INDEX {
            return Err(VfsError::InvalidArgument);
        }
        check_kind(node.kind, flags)?;
        Ok(LookupReply::Found(node.info(index)))
    }

    fn unlink(
        &mut self,
        parent: NodeIndex,
        name: &str,
        index: NodeIndex,
        flags: LookupFlags,
    ) -> Result<LookupReply> {
        let target = self.node_mut(index)?;
        if target.mounted.is_some() {
            return Err(VfsError::Busy);
        }
        check_kind(target.kind, flags)?;
        if target.kind == NodeKind::Directory
            && target.link_count <= 1
            && !target.children.is_empty()
        {
            return Err(VfsError::NotEmpty);
        }

        // The reply carries the count from before the removal
        let info = target.info(index);
        target.link_count = target.link_count.saturating_sub(1);
        self.node_mut(parent)?.children.remove(name);
        Ok(LookupReply::Found(info))
    }

    fn has_mountpoints(&self) -> bool {
        self.nodes.values().any(|n| n.mounted.is_some())
    }
}

fn check_kind(kind: NodeKind, flags: LookupFlags) -> Result<()> {
    match kind {
        NodeKind::Directory if flags.contains(LookupFlags::FILE) => Err(VfsError::IsADirectory),
        NodeKind::File if flags.contains(LookupFlags::DIRECTORY) => Err(VfsError::NotADirectory),
        _ => Ok(()),
    }
}

fn crossing(consumed: usize, mounted: &MountedFs) -> LookupReply {
    LookupReply::Crossed {
        consumed,
        fs_handle: mounted.fs_handle,
        device: mounted.device,
    }
}

fn mounted_reply(info: NodeInfo) -> FsReply {
    FsReply::Mounted {
        index: info.index,
        size_lo: lower32(info.size),
        size_hi: upper32(info.size),
        link_count: info.link_count,
    }
}

/// Backend filesystem keeping every instance in memory.
#[derive(Default)]
pub struct MemFs {
    devices: Mutex<HashMap<DeviceId, Instance>>,
}

impl MemFs {
    /// Creates a backend with no devices mounted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `device` is currently mounted somewhere.
    pub fn has_device(&self, device: DeviceId) -> bool {
        self.devices.lock().contains_key(&device)
    }

    /// Number of live nodes on `device`, root included.
    pub fn node_count(&self, device: DeviceId) -> usize {
        self.devices
            .lock()
            .get(&device)
            .map_or(0, |inst| inst.nodes.len())
    }

    fn with_instance<T>(
        &self,
        device: DeviceId,
        f: impl FnOnce(&mut Instance) -> Result<T>,
    ) -> Result<T> {
        let mut devices = self.devices.lock();
        let inst = devices.get_mut(&device).ok_or(VfsError::NotFound)?;
        f(inst)
    }

    fn mounted(&self, device: DeviceId) -> Result<FsReply> {
        let mut devices = self.devices.lock();
        if devices.contains_key(&device) {
            return Err(VfsError::Busy);
        }
        let inst = Instance::new();
        let info = inst.node(MEMFS_ROOT_INDEX)?.info(MEMFS_ROOT_INDEX);
        devices.insert(device, inst);
        debug!("memfs: serving device {}", device);
        Ok(mounted_reply(info))
    }

    fn unmounted(&self, device: DeviceId) -> Result<FsReply> {
        let mut devices = self.devices.lock();
        let inst = devices.get(&device).ok_or(VfsError::NotFound)?;
        if inst.has_mountpoints() {
            return Err(VfsError::Busy);
        }
        devices.remove(&device);
        debug!("memfs: released device {}", device);
        Ok(FsReply::Done)
    }

    async fn mount(
        &self,
        mp_device: DeviceId,
        mp_index: NodeIndex,
        mountee_fs: FsHandle,
        mountee_device: DeviceId,
        options: String,
        mountee: MounteeChannel,
    ) -> Result<FsReply> {
        self.with_instance(mp_device, |inst| {
            let mp = inst.node(mp_index)?;
            if mp.kind != NodeKind::Directory {
                return Err(VfsError::NotADirectory);
            }
            if mp.mounted.is_some() {
                return Err(VfsError::Busy);
            }
            Ok(())
        })?;

        let MounteeChannel(endpoint) = mountee;
        let mountee_client = FsClient::new(endpoint.clone());
        let root = mountee_client.mounted(mountee_device, &options).await?;

        let recorded = self.with_instance(mp_device, |inst| {
            let mp = inst.node_mut(mp_index)?;
            if mp.mounted.is_some() {
                return Err(VfsError::Busy);
            }
            mp.mounted = Some(MountedFs {
                fs_handle: mountee_fs,
                device: mountee_device,
                endpoint,
            });
            Ok(())
        });
        if let Err(e) = recorded {
            // Lost a race for the mount point; hand the device back
            if let Err(undo) = mountee_client.unmounted(mountee_device).await {
                debug!("memfs: could not release device {}: {}", mountee_device, undo);
            }
            return Err(e);
        }

        debug!(
            "memfs: ({}, {}) mounted over node {} of device {}",
            mountee_fs, mountee_device, mp_index, mp_device
        );
        Ok(mounted_reply(root))
    }

    async fn unmount(&self, device: DeviceId, index: NodeIndex) -> Result<FsReply> {
        let mounted = self.with_instance(device, |inst| {
            inst.node_mut(index)?
                .mounted
                .take()
                .ok_or(VfsError::InvalidArgument)
        })?;

        let result = FsClient::new(mounted.endpoint.clone())
            .unmounted(mounted.device)
            .await;
        if let Err(e) = result {
            // The mountee refused; the mount stays in place
            self.with_instance(device, |inst| {
                inst.node_mut(index)?.mounted = Some(mounted);
                Ok(())
            })?;
            return Err(e);
        }
        Ok(FsReply::Done)
    }

    fn read(&self, device: DeviceId, index: NodeIndex, pos: u64, len: usize) -> Result<FsReply> {
        self.with_instance(device, |inst| {
            let node = inst.node(index)?;
            let reply = match node.kind {
                NodeKind::Directory => match node.children.keys().nth(pos as usize) {
                    Some(name) => FsReply::Read {
                        data: name.as_bytes().to_vec(),
                        bytes: 1,
                    },
                    None => FsReply::Read {
                        data: Vec::new(),
                        bytes: 0,
                    },
                },
                NodeKind::File => {
                    let size = node.data.len();
                    let start = usize::try_from(pos).unwrap_or(usize::MAX).min(size);
                    let end = start.saturating_add(len).min(size);
                    FsReply::Read {
                        data: node.data[start..end].to_vec(),
                        bytes: end - start,
                    }
                }
            };
            Ok(reply)
        })
    }

    fn write(&self, device: DeviceId, index: NodeIndex, pos: u64, data: &[u8]) -> Result<FsReply> {
        self.with_instance(device, |inst| {
            let node = inst.node_mut(index)?;
            if node.kind == NodeKind::Directory {
                return Err(VfsError::IsADirectory);
            }
            let start = usize::try_from(pos).map_err(|_| VfsError::Overflow)?;
            let end = start.checked_add(data.len()).ok_or(VfsError::Overflow)?;
            if end > MEMFS_MAX_FILE_SIZE {
                return Err(VfsError::Backend(libc::EFBIG));
            }
            if node.data.len() < end {
                node.data.resize(end, 0);
            }
            node.data[start..end].copy_from_slice(data);

            let size = node.size();
            Ok(FsReply::Written {
                bytes: data.len(),
                size_lo: lower32(size),
                size_hi: upper32(size),
            })
        })
    }

    fn truncate(&self, device: DeviceId, index: NodeIndex, size: u64) -> Result<FsReply> {
        self.with_instance(device, |inst| {
            let node = inst.node_mut(index)?;
            if node.kind == NodeKind::Directory {
                return Err(VfsError::IsADirectory);
            }
            let size = usize::try_from(size).map_err(|_| VfsError::Overflow)?;
            if size > MEMFS_MAX_FILE_SIZE {
                return Err(VfsError::Backend(libc::EFBIG));
            }
            node.data.resize(size, 0);
            Ok(FsReply::Done)
        })
    }

    fn destroy(&self, device: DeviceId, index: NodeIndex) -> Result<FsReply> {
        self.with_instance(device, |inst| {
            if inst.node(index)?.link_count > 0 {
                return Err(VfsError::Busy);
            }
            inst.nodes.remove(&index);
            debug!("memfs: destroyed node {} of device {}", index, device);
            Ok(FsReply::Done)
        })
    }
}

#[async_trait]
impl FsEndpoint for MemFs {
    async fn call(&self, request: FsRequest) -> Result<FsReply> {
        match request {
            FsRequest::Mounted { device, .. } => self.mounted(device),
            FsRequest::Mount {
                mp_device,
                mp_index,
                mountee_fs,
                mountee_device,
                options,
                mountee,
            } => {
                self.mount(
                    mp_device,
                    mp_index,
                    mountee_fs,
                    mountee_device,
                    options,
                    mountee,
                )
                .await
            }
            FsRequest::Unmount { device, index } => self.unmount(device, index).await,
            FsRequest::Unmounted { device } => self.unmounted(device),
            FsRequest::Lookup {
                device,
                start,
                path,
                flags,
                link,
            } => self
                .with_instance(device, |inst| inst.lookup(start, &path, flags, link))
                .map(FsReply::Lookup),
            FsRequest::OpenNode { device, index } => self.with_instance(device, |inst| {
                Ok(FsReply::Node(inst.node(index)?.info(index)))
            }),
            FsRequest::Read {
                device,
                index,
                pos_lo,
                pos_hi,
                len,
            } => self.read(device, index, merge_loup32(pos_lo, pos_hi), len),
            FsRequest::Write {
                device,
                index,
                pos_lo,
                pos_hi,
                data,
            } => self.write(device, index, merge_loup32(pos_lo, pos_hi), &data),
            FsRequest::Truncate {
                device,
                index,
                size_lo,
                size_hi,
            } => self.truncate(device, index, merge_loup32(size_lo, size_hi)),
            FsRequest::Stat {
                device,
                index,
                is_open,
            } => self.with_instance(device, |inst| {
                let node = inst.node(index)?;
                // The server fills in the filesystem handle; a backend only
                // knows its own device and index
                Ok(FsReply::Stat(NodeStat {
                    triplet: Triplet::new(0, device, index),
                    kind: node.kind,
                    size: node.size(),
                    link_count: node.link_count,
                    is_open,
                }))
            }),
            FsRequest::Sync { device, index } => self.with_instance(device, |inst| {
                inst.node(index)?;
                Ok(FsReply::Done)
            }),
            FsRequest::Destroy { device, index } => self.destroy(device, index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn path(components: &[&str]) -> Vec<String> {
        components.iter().map(|c| c.to_string()).collect()
    }

    fn mounted_fs() -> anyhow::Result<MemFs> {
        let fs = MemFs::new();
        fs.mounted(1)?;
        Ok(fs)
    }

    fn found(reply: LookupReply) -> anyhow::Result<NodeInfo> {
        match reply {
            LookupReply::Found(info) => Ok(info),
            other => Err(anyhow::anyhow!("expected a node, got {:?}", other)),
        }
    }

    #[test]
    fn test_create_and_resolve() -> anyhow::Result<()> {
        let fs = mounted_fs()?;
        let create = LookupFlags::DIRECTORY | LookupFlags::CREATE | LookupFlags::EXCLUSIVE;

        let dir = found(fs.with_instance(1, |i| i.lookup(None, &path(&["d"]), create, None))?)?;
        assert_eq!(dir.kind, NodeKind::Directory);
        assert_eq!(dir.link_count, 1);

        let file = found(fs.with_instance(1, |i| {
            i.lookup(None, &path(&["d", "f"]), LookupFlags::CREATE, None)
        })?)?;
        assert_eq!(file.kind, NodeKind::File);

        // Start at the directory instead of the root
        let again = found(fs.with_instance(1, |i| {
            i.lookup(Some(dir.index), &path(&["f"]), LookupFlags::FILE, None)
        })?)?;
        assert_eq!(again.index, file.index);

        assert_eq!(
            fs.with_instance(1, |i| i.lookup(None, &path(&["d"]), create, None)),
            Err(VfsError::AlreadyExists)
        );
        let through_file = path(&["d", "f", "x"]);
        assert_eq!(
            fs.with_instance(1, |i| i.lookup(None, &through_file, LookupFlags::empty(), None)),
            Err(VfsError::NotADirectory)
        );
        assert_eq!(fs.node_count(1), 3);
        Ok(())
    }

    #[test]
    fn test_unlink_answers_previous_link_count() -> anyhow::Result<()> {
        let fs = mounted_fs()?;
        let file = found(fs.with_instance(1, |i| {
            i.lookup(None, &path(&["f"]), LookupFlags::CREATE, None)
        })?)?;
        found(fs.with_instance(1, |i| {
            i.lookup(None, &path(&["g"]), LookupFlags::LINK, Some(file.index))
        })?)?;

        let first = found(fs.with_instance(1, |i| {
            i.lookup(None, &path(&["f"]), LookupFlags::UNLINK, None)
        })?)?;
        assert_eq!(first.link_count, 2);
        let second = found(fs.with_instance(1, |i| {
            i.lookup(None, &path(&["g"]), LookupFlags::UNLINK, None)
        })?)?;
        assert_eq!(second.link_count, 1);

        // Unlinked but not destroyed until asked to
        assert_eq!(fs.node_count(1), 2);
        assert_eq!(fs.destroy(1, file.index)?, FsReply::Done);
        assert_eq!(fs.node_count(1), 1);
        Ok(())
    }

    #[test]
    fn test_destroy_refuses_linked_node() -> anyhow::Result<()> {
        let fs = mounted_fs()?;
        let file = found(fs.with_instance(1, |i| {
            i.lookup(None, &path(&["f"]), LookupFlags::CREATE, None)
        })?)?;
        assert_eq!(fs.destroy(1, file.index), Err(VfsError::Busy));
        Ok(())
    }

    #[tokio::test]
    async fn test_read_write_and_directory_entries() -> anyhow::Result<()> {
        let fs: Arc<MemFs> = Arc::new(MemFs::new());
        let client = FsClient::new(fs.clone());
        client.mounted(7, "").await?;

        for name in ["b", "a"] {
            client
                .lookup(7, None, &[name], LookupFlags::CREATE, None)
                .await?;
        }
        let file = found(client.lookup(7, None, &["a"], LookupFlags::FILE, None).await?)?;

        let (bytes, size) = client.write(7, file.index, 4, b"xy").await?;
        assert_eq!((bytes, size), (2, 6));
        let (data, read) = client.read(7, file.index, 0, 100).await?;
        assert_eq!(data, b"\0\0\0\0xy");
        assert_eq!(read, 6);

        let (first, step) = client.read(7, MEMFS_ROOT_INDEX, 0, 64).await?;
        assert_eq!((first.as_slice(), step), (&b"a"[..], 1));
        let (second, _) = client.read(7, MEMFS_ROOT_INDEX, 1, 64).await?;
        assert_eq!(second, b"b");
        let (end, step) = client.read(7, MEMFS_ROOT_INDEX, 2, 64).await?;
        assert!(end.is_empty());
        assert_eq!(step, 0);

        assert_eq!(
            client.write(7, MEMFS_ROOT_INDEX, 0, b"x").await,
            Err(VfsError::IsADirectory)
        );
        client.truncate(7, file.index, 1).await?;
        assert_eq!(client.stat(7, file.index, false).await?.size, 1);

        let too_big = MEMFS_MAX_FILE_SIZE as u64 + 1;
        assert_eq!(
            client.truncate(7, file.index, too_big).await,
            Err(VfsError::Backend(libc::EFBIG))
        );
        assert_eq!(
            client.write(7, file.index, too_big, b"x").await,
            Err(VfsError::Backend(libc::EFBIG))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_mount_crossing_and_unmount() -> anyhow::Result<()> {
        let owner: Arc<MemFs> = Arc::new(MemFs::new());
        let mountee: Arc<MemFs> = Arc::new(MemFs::new());
        let client = FsClient::new(owner.clone());
        client.mounted(1, "").await?;

        let mp = found(
            client
                .lookup(1, None, &["mnt"], LookupFlags::DIRECTORY | LookupFlags::CREATE, None)
                .await?,
        )?;
        let root = client
            .mount(Triplet::new(1, 1, mp.index), 2, 9, "", mountee.clone())
            .await?;
        assert_eq!(root.index, MEMFS_ROOT_INDEX);
        assert!(mountee.has_device(9));

        let reply = client
            .lookup(1, None, &["mnt", "x"], LookupFlags::empty(), None)
            .await?;
        assert_eq!(
            reply,
            LookupReply::Crossed {
                consumed: 1,
                fs_handle: 2,
                device: 9
            }
        );
        let at_mp = found(client.lookup(1, None, &["mnt"], LookupFlags::MP, None).await?)?;
        assert_eq!(at_mp.index, mp.index);

        // Mounted-over directories and devices with mounts cannot go away
        assert_eq!(
            client.lookup(1, None, &["mnt"], LookupFlags::UNLINK, None).await,
            Err(VfsError::Busy)
        );
        assert_eq!(client.unmounted(1).await, Err(VfsError::Busy));

        client.unmount(1, mp.index).await?;
        assert!(!mountee.has_device(9));
        assert_eq!(
            client.unmount(1, mp.index).await,
            Err(VfsError::InvalidArgument)
        );
        client.unmounted(1).await?;
        assert!(!owner.has_device(1));
        Ok(())
    }

    #[tokio::test]
    async fn test_mount_over_file_is_rejected() -> anyhow::Result<()> {
        let owner: Arc<MemFs> = Arc::new(MemFs::new());
        let client = FsClient::new(owner.clone());
        client.mounted(1, "").await?;
        let file = found(client.lookup(1, None, &["f"], LookupFlags::CREATE, None).await?)?;

        let result = client
            .mount(Triplet::new(1, 1, file.index), 2, 9, "", Arc::new(MemFs::new()))
            .await;
        assert_eq!(result, Err(VfsError::NotADirectory));
        Ok(())
    }

    #[test]
    fn test_double_mount_of_device() -> anyhow::Result<()> {
        let fs = MemFs::new();
        fs.mounted(3)?;
        assert_eq!(fs.mounted(3), Err(VfsError::Busy));
        Ok(())
    }
}
