//! Node identity and the shared node cache.
//!
//! Every file or directory known to the server is identified by a [`Triplet`]
//! and cached at most once as a [`Node`]. Callers never touch reference counts
//! directly: [`NodeCache::get`] hands out a [`NodeRef`], cloning it adds a
//! reference and dropping it releases one, so every exit path of every
//! operation releases exactly what it acquired.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Handle of a registered backend filesystem.
pub type FsHandle = u32;
/// Device a filesystem instance lives on.
pub type DeviceId = u64;
/// Index of a node inside one filesystem instance.
pub type NodeIndex = u64;

/// Global identity of a file or directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Triplet {
    /// Backend filesystem owning the node
    pub fs_handle: FsHandle,
    /// Device of the filesystem instance
    pub device: DeviceId,
    /// Index within the instance
    pub index: NodeIndex,
}

impl Triplet {
    /// Creates a triplet from its parts.
    pub fn new(fs_handle: FsHandle, device: DeviceId, index: NodeIndex) -> Self {
        Self {
            fs_handle,
            device,
            index,
        }
    }

    /// Whether the node lives on the given filesystem instance.
    pub fn same_instance(&self, other: &Triplet) -> bool {
        self.fs_handle == other.fs_handle && self.device == other.device
    }
}

impl fmt::Display for Triplet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.fs_handle, self.device, self.index)
    }
}

/// Kind of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Regular file
    File,
    /// Directory
    Directory,
}

/// Outcome of a successful path resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupResult {
    /// Identity of the resolved node
    pub triplet: Triplet,
    /// Size in bytes as reported by the backend
    pub size: u64,
    /// Number of directory entries naming the node
    pub link_count: u32,
    /// File or directory
    pub kind: NodeKind,
}

/// Cached metadata for one triplet.
///
/// The content lock guards the cached size and serializes data access to the
/// node. Link counts live in the cache table, under the node-table lock.
pub struct Node {
    triplet: Triplet,
    kind: NodeKind,
    contents: RwLock<u64>,
}

impl Node {
    /// Identity of the node.
    pub fn triplet(&self) -> Triplet {
        self.triplet
    }

    /// File or directory.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Whether the node is a directory.
    pub fn is_directory(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    /// Content lock; the guarded value is the cached size.
    pub fn contents(&self) -> &RwLock<u64> {
        &self.contents
    }

    /// Samples the cached size under a shared content lock.
    pub async fn size(&self) -> u64 {
        *self.contents.read().await
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("triplet", &self.triplet)
            .field("kind", &self.kind)
            .finish()
    }
}

struct Slot {
    node: Arc<Node>,
    refcnt: usize,
    link_count: u32,
}

#[derive(Default)]
struct Table {
    slots: HashMap<Triplet, Slot>,
    // Released with no links left; waiting for their backend to destroy them
    orphans: Vec<Triplet>,
}

impl Table {
    fn slot_of(&mut self, node: &Arc<Node>) -> Option<&mut Slot> {
        self.slots
            .get_mut(&node.triplet)
            .filter(|slot| Arc::ptr_eq(&slot.node, node))
    }
}

/// Process-wide cache of nodes, keyed by triplet.
#[derive(Clone, Default)]
pub struct NodeCache {
    table: Arc<Mutex<Table>>,
}

impl NodeCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a reference to the node for `res`, inserting it if absent.
    pub fn get(&self, res: &LookupResult) -> NodeRef {
        let mut table = self.table.lock();
        let slot = table.slots.entry(res.triplet).or_insert_with(|| Slot {
            node: Arc::new(Node {
                triplet: res.triplet,
                kind: res.kind,
                contents: RwLock::new(res.size),
            }),
            refcnt: 0,
            link_count: res.link_count,
        });
        slot.refcnt += 1;

        NodeRef {
            node: slot.node.clone(),
            table: self.table.clone(),
        }
    }

    /// Evicts a node known to be unreachable by any path.
    ///
    /// The entry is removed regardless of its reference count; references
    /// still outstanding become inert and release nothing when dropped.
    pub fn forget(&self, node: NodeRef) {
        {
            let mut table = self.table.lock();
            if table.slot_of(&node.node).is_some() {
                table.slots.remove(&node.node.triplet);
            }
        }
        drop(node);
    }

    /// Total references held on nodes of one filesystem instance.
    pub fn sum_of_references(&self, fs_handle: FsHandle, device: DeviceId) -> usize {
        let table = self.table.lock();
        table
            .slots
            .iter()
            .filter(|(t, _)| t.fs_handle == fs_handle && t.device == device)
            .map(|(_, slot)| slot.refcnt)
            .sum()
    }

    /// References currently held on `triplet`, zero when not cached.
    pub fn refcount(&self, triplet: &Triplet) -> usize {
        self.table
            .lock()
            .slots
            .get(triplet)
            .map_or(0, |slot| slot.refcnt)
    }

    /// Whether a node for `triplet` is cached.
    pub fn contains(&self, triplet: &Triplet) -> bool {
        self.table.lock().slots.contains_key(triplet)
    }

    /// Number of cached nodes.
    pub fn len(&self) -> usize {
        self.table.lock().slots.len()
    }

    /// Whether the cache holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains the triplets released with a zero link count.
    pub(crate) fn take_orphans(&self) -> Vec<Triplet> {
        std::mem::take(&mut self.table.lock().orphans)
    }
}

/// Counted reference to a cached [`Node`].
///
/// Cloning adds a reference, dropping releases it. A node whose last
/// reference goes away leaves the cache.
pub struct NodeRef {
    node: Arc<Node>,
    table: Arc<Mutex<Table>>,
}

impl NodeRef {
    /// Cached link count.
    pub fn link_count(&self) -> u32 {
        let mut table = self.table.lock();
        table.slot_of(&self.node).map_or(0, |slot| slot.link_count)
    }

    /// Adjusts the cached link count under the node-table lock.
    pub fn adjust_link_count(&self, delta: i32) {
        let mut table = self.table.lock();
        if let Some(slot) = table.slot_of(&self.node) {
            slot.link_count = slot.link_count.saturating_add_signed(delta);
        }
    }

    /// Whether two references point at the same cached node.
    pub fn ptr_eq(a: &NodeRef, b: &NodeRef) -> bool {
        Arc::ptr_eq(&a.node, &b.node)
    }
}

impl Deref for NodeRef {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.node
    }
}

impl Clone for NodeRef {
    fn clone(&self) -> Self {
        let mut table = self.table.lock();
        if let Some(slot) = table.slot_of(&self.node) {
            slot.refcnt += 1;
        }
        Self {
            node: self.node.clone(),
            table: self.table.clone(),
        }
    }
}

impl Drop for NodeRef {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        let Some(slot) = table.slot_of(&self.node) else {
            return;
        };
        slot.refcnt -= 1;
        if slot.refcnt > 0 {
            return;
        }
        let unlinked = slot.link_count == 0;
        table.slots.remove(&self.node.triplet);
        if unlinked {
            table.orphans.push(self.node.triplet);
        }
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodeRef").field(&self.node.triplet).finish()
    }
}
