//! Renaming directory entries.
//!
//! A rename is carried out as link-then-unlink under the exclusive namespace
//! lock: any entry already at the new path is unlinked, the new path is linked
//! to the old node, and finally the old entry is unlinked. When that last step
//! fails, the new link is taken back out so the node is not left with two
//! names.

use super::error::{Result, VfsError};
use super::namespace::{canonify, parent_of};
use super::proto::LookupFlags;
use super::vfs::Vfs;
use log::{info, warn};

/// Whether renaming `old` to `new` would move a directory under itself or
/// name the same entry twice. Both paths must be canonical.
fn is_degenerate(old: &str, new: &str) -> bool {
    match new.strip_prefix(old) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || old == "/",
        None => false,
    }
}

impl Vfs {
    /// Renames `old` to `new`, replacing whatever `new` named before.
    ///
    /// # Arguments
    /// * `old` - Existing path
    /// * `new` - Path the node should be reachable under afterwards
    ///
    /// # Returns
    /// * `Ok(())` on success
    /// * `Err(VfsError::InvalidArgument)` if `new` is `old` or lies below it
    /// * `Err(VfsError::CrossDevice)` if the paths are on different instances
    /// * `Err(VfsError::NotEmpty)` if `new` exists and cannot be unlinked
    pub async fn rename(&self, old: &str, new: &str) -> Result<()> {
        let result = self.rename_locked(old, new).await;
        self.reap_orphans().await;
        result
    }

    async fn rename_locked(&self, old: &str, new: &str) -> Result<()> {
        let old = canonify(old).map_err(|_| VfsError::InvalidArgument)?;
        let new = canonify(new).map_err(|_| VfsError::InvalidArgument)?;
        if is_degenerate(&old, &new) {
            return Err(VfsError::InvalidArgument);
        }

        let ns = self.namespace.write().await;

        let old_res = self.lookup(&ns, &old, LookupFlags::empty(), None).await?;
        let old_node = self.nodes.get(&old_res);

        let parent = self
            .lookup(&ns, parent_of(&new), LookupFlags::empty(), None)
            .await?;
        if !parent.triplet.same_instance(&old_node.triplet()) {
            return Err(VfsError::CrossDevice);
        }

        // Held until the end so a replaced node is released with everything else
        let replaced = match self.lookup(&ns, &new, LookupFlags::UNLINK, None).await {
            Ok(res) => {
                let node = self.nodes.get(&res);
                node.adjust_link_count(-1);
                Some(node)
            }
            Err(VfsError::NotFound) => None,
            Err(_) => return Err(VfsError::NotEmpty),
        };

        self.lookup(&ns, &new, LookupFlags::LINK, Some(old_res.triplet.index))
            .await?;
        old_node.adjust_link_count(1);

        if let Err(e) = self.lookup(&ns, &old, LookupFlags::UNLINK, None).await {
            warn!("Rename of {} failed after linking {}: {}", old, new, e);
            match self.lookup(&ns, &new, LookupFlags::UNLINK, None).await {
                Ok(_) => old_node.adjust_link_count(-1),
                Err(undo) => warn!("Could not take back link {}: {}", new, undo),
            }
            return Err(e);
        }
        old_node.adjust_link_count(-1);

        drop(ns);
        info!("Renamed {} to {}", old, new);
        drop(replaced);
        drop(old_node);
        Ok(())
    }
}
