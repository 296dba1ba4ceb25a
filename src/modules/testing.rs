//! Shared fixtures for unit tests.

use super::config::VfsConfig;
use super::error::{Result, VfsError};
use super::file::Client;
use super::filesystem::MemFs;
use super::node::FsHandle;
use super::proto::{FsEndpoint, FsReply, FsRequest};
use super::registry::FsInfo;
use super::vfs::Vfs;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

type Matcher = Box<dyn Fn(&FsRequest) -> bool + Send + Sync>;

/// Endpoint wrapper that records every verb it forwards and fails requests
/// matching an installed fault.
pub(crate) struct FaultyEndpoint {
    inner: Arc<MemFs>,
    fault: Mutex<Option<(Matcher, VfsError)>>,
    verbs: Mutex<Vec<&'static str>>,
}

impl FaultyEndpoint {
    pub(crate) fn new(inner: Arc<MemFs>) -> Self {
        Self {
            inner,
            fault: Mutex::new(None),
            verbs: Mutex::new(Vec::new()),
        }
    }

    /// Number of forwarded requests with the given verb.
    pub(crate) fn count(&self, verb: &str) -> usize {
        self.verbs.lock().iter().filter(|v| **v == verb).count()
    }
}

#[async_trait]
impl FsEndpoint for FaultyEndpoint {
    async fn call(&self, request: FsRequest) -> Result<FsReply> {
        let injected = {
            let fault = self.fault.lock();
            fault
                .as_ref()
                .filter(|(matches, _)| matches(&request))
                .map(|(_, error)| error.clone())
        };
        if let Some(error) = injected {
            return Err(error);
        }
        self.verbs.lock().push(request.verb());
        self.inner.call(request).await
    }
}

/// A server with two in-memory filesystems registered, `tmpfs` and
/// `scratch`, and one client.
pub(crate) struct Fixture {
    pub(crate) vfs: Arc<Vfs>,
    pub(crate) client: Client,
    pub(crate) tmpfs: FsHandle,
    pub(crate) scratch: FsHandle,
    pub(crate) tmpfs_backend: Arc<MemFs>,
    pub(crate) scratch_backend: Arc<MemFs>,
    pub(crate) tmpfs_faults: Arc<FaultyEndpoint>,
}

impl Fixture {
    /// Registered but nothing mounted.
    pub(crate) fn new() -> Self {
        Self::build(VfsConfig::default(), FsInfo::new("tmpfs"))
    }

    /// `tmpfs` device 1 mounted at `/`.
    pub(crate) async fn with_root() -> anyhow::Result<Self> {
        Self::mounted(VfsConfig::default(), FsInfo::new("tmpfs")).await
    }

    pub(crate) async fn with_config(config: VfsConfig) -> anyhow::Result<Self> {
        Self::mounted(config, FsInfo::new("tmpfs")).await
    }

    pub(crate) async fn with_tmpfs_info(info: FsInfo) -> anyhow::Result<Self> {
        Self::mounted(VfsConfig::default(), info).await
    }

    async fn mounted(config: VfsConfig, info: FsInfo) -> anyhow::Result<Self> {
        let fx = Self::build(config, info);
        fx.vfs.mount("/", "tmpfs", 1, "", false).await?;
        Ok(fx)
    }

    fn build(config: VfsConfig, tmpfs_info: FsInfo) -> Self {
        let vfs = Arc::new(Vfs::new(config));

        let tmpfs_backend = Arc::new(MemFs::new());
        let tmpfs_faults = Arc::new(FaultyEndpoint::new(tmpfs_backend.clone()));
        let tmpfs = vfs
            .register_fs(tmpfs_info, tmpfs_faults.clone())
            .expect("register tmpfs");

        let scratch_backend = Arc::new(MemFs::new());
        let scratch = vfs
            .register_fs(FsInfo::new("scratch"), scratch_backend.clone())
            .expect("register scratch");

        let client = Client::new(vfs.clone());
        Self {
            vfs,
            client,
            tmpfs,
            scratch,
            tmpfs_backend,
            scratch_backend,
            tmpfs_faults,
        }
    }

    /// Registers another in-memory filesystem under `name`.
    pub(crate) fn register_memfs(&self, name: &str) -> Result<FsHandle> {
        self.vfs
            .register_fs(FsInfo::new(name), Arc::new(MemFs::new()))
    }

    /// Makes `tmpfs` fail every request `matches` accepts with `error`.
    pub(crate) fn fail_tmpfs(
        &self,
        matches: impl Fn(&FsRequest) -> bool + Send + Sync + 'static,
        error: VfsError,
    ) {
        *self.tmpfs_faults.fault.lock() = Some((Box::new(matches), error));
    }

    pub(crate) fn clear_faults(&self) {
        *self.tmpfs_faults.fault.lock() = None;
    }
}
