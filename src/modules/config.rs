//! Server configuration.
//!
//! Configuration is a JSON document. Every field has a default, so an empty
//! object is a valid configuration that registers nothing and mounts nothing.

use super::constants::{MAX_OPEN_FILES, SESSION_QUEUE};
use super::registry::FsInfo;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Filesystem to mount at `/` on startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootMount {
    /// Name of a registered filesystem
    pub fs: String,
    /// Device to mount
    #[serde(default)]
    pub device: u64,
    /// Mount options blob
    #[serde(default)]
    pub options: String,
}

/// Configuration of one VFS server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VfsConfig {
    /// Size of each client's descriptor table
    pub max_open_files: usize,
    /// Depth of the request queues between clients, server and backends
    pub session_queue: usize,
    /// In-memory filesystems registered at startup
    pub filesystems: Vec<FsInfo>,
    /// Root mount performed at startup
    pub root: Option<RootMount>,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            max_open_files: MAX_OPEN_FILES,
            session_queue: SESSION_QUEUE,
            filesystems: Vec::new(),
            root: None,
        }
    }
}

impl VfsConfig {
    /// Loads and validates a configuration file.
    ///
    /// # Arguments
    /// * `path` - JSON file to read
    ///
    /// # Returns
    /// * `Ok(VfsConfig)` on success
    /// * `Err` if the file cannot be read, parsed or fails validation
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: VfsConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_open_files == 0 {
            bail!("max_open_files must be at least 1");
        }
        if self.session_queue == 0 {
            bail!("session_queue must be at least 1");
        }

        let mut seen = HashSet::new();
        for fs in &self.filesystems {
            if !seen.insert(fs.name.as_str()) {
                bail!("filesystem {} configured twice", fs.name);
            }
        }

        if let Some(root) = &self.root {
            if !seen.contains(root.fs.as_str()) {
                bail!("root filesystem {} is not configured", root.fs);
            }
        }
        Ok(())
    }
}
