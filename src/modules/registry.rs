//! Registry of backend filesystems known to the server.

use super::constants::{FIRST_FS_HANDLE, FS_NAME_MAXLEN};
use super::error::{Result, VfsError};
use super::node::FsHandle;
use super::proto::{Endpoint, FsClient};
use log::info;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// What a backend advertises about itself when it registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsInfo {
    /// Filesystem name used by mount requests
    pub name: String,
    /// Reads and writes may run concurrently on one node
    #[serde(default)]
    pub concurrent_read_write: bool,
    /// Writes never change a node's size
    #[serde(default)]
    pub write_retains_size: bool,
}

impl FsInfo {
    /// Info with both capability flags cleared.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrent_read_write: false,
            write_retains_size: false,
        }
    }

    /// Whether writes may share the content lock with readers.
    pub fn shared_writes(&self) -> bool {
        self.concurrent_read_write && self.write_retains_size
    }
}

struct Registered {
    handle: FsHandle,
    info: FsInfo,
    endpoint: Endpoint,
}

#[derive(Default)]
struct Entries {
    list: Vec<Registered>,
    next_handle: FsHandle,
}

/// Name → handle → endpoint table of registered filesystems.
pub struct FsRegistry {
    entries: Mutex<Entries>,
    registered: Notify,
}

impl Default for FsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FsRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Entries {
                list: Vec::new(),
                next_handle: FIRST_FS_HANDLE,
            }),
            registered: Notify::new(),
        }
    }

    /// Registers a backend and assigns it a handle.
    pub fn register(&self, info: FsInfo, endpoint: Endpoint) -> Result<FsHandle> {
        if info.name.is_empty() {
            return Err(VfsError::InvalidArgument);
        }
        if info.name.len() > FS_NAME_MAXLEN {
            return Err(VfsError::NameTooLong);
        }

        let handle = {
            let mut entries = self.entries.lock();
            if entries.list.iter().any(|r| r.info.name == info.name) {
                return Err(VfsError::AlreadyExists);
            }
            let handle = entries.next_handle;
            entries.next_handle += 1;
            info!(
                "Registered filesystem {} as handle {} (concurrent_read_write: {}, write_retains_size: {})",
                info.name, handle, info.concurrent_read_write, info.write_retains_size
            );
            entries.list.push(Registered {
                handle,
                info,
                endpoint,
            });
            handle
        };

        self.registered.notify_waiters();
        Ok(handle)
    }

    /// Handle of the filesystem registered under `name`.
    pub fn handle_of(&self, name: &str) -> Option<FsHandle> {
        self.entries
            .lock()
            .list
            .iter()
            .find(|r| r.info.name == name)
            .map(|r| r.handle)
    }

    /// Waits until a filesystem named `name` is registered.
    pub async fn wait_for(&self, name: &str) -> FsHandle {
        loop {
            let notified = self.registered.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(handle) = self.handle_of(name) {
                return handle;
            }
            notified.await;
        }
    }

    /// Capabilities advertised by `handle`.
    pub fn info(&self, handle: FsHandle) -> Result<FsInfo> {
        self.entries
            .lock()
            .list
            .iter()
            .find(|r| r.handle == handle)
            .map(|r| r.info.clone())
            .ok_or(VfsError::NotFound)
    }

    /// Endpoint of `handle`.
    pub fn endpoint(&self, handle: FsHandle) -> Result<Endpoint> {
        self.entries
            .lock()
            .list
            .iter()
            .find(|r| r.handle == handle)
            .map(|r| r.endpoint.clone())
            .ok_or(VfsError::NotFound)
    }

    /// Typed client for `handle`.
    pub fn client(&self, handle: FsHandle) -> Result<FsClient> {
        self.endpoint(handle).map(FsClient::new)
    }

    /// Names of all registered filesystems, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.entries
            .lock()
            .list
            .iter()
            .map(|r| r.info.name.clone())
            .collect()
    }
}
