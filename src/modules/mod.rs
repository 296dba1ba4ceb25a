//! Core server modules.
//!
//! This module provides the main components of the server:
//!
//! - `constants`: Limits and default values
//! - `error`: Error type and errno mapping
//! - `node`: Triplets, nodes and the node cache
//! - `proto`: Backend request/response protocol
//! - `registry`: Registered backend filesystems
//! - `namespace`: Namespace state and path resolution
//! - `vfs`: The server context and path operations
//! - `mount`: Mounting and unmounting
//! - `rename`: Renaming directory entries
//! - `file`: Open files and descriptor tables
//! - `rdwr`: Reading, writing and seeking
//! - `session`: Per-client request loop
//! - `filesystem`: In-memory backend filesystem
//! - `config`: Server configuration

pub mod config;
pub mod constants;
pub mod error;
pub mod file;
pub mod filesystem;
pub mod mount;
/// Namespace state and path resolution.
pub mod namespace;
pub mod node;
pub mod proto;
pub mod rdwr;
pub mod registry;
pub mod rename;
pub mod session;
pub mod vfs;

#[cfg(test)]
mod testing;
