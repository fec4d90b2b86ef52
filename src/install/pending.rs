//! Markers for swaps whose state commit has not happened yet.
//!
//! A marker is written before a staged tree is swapped into place and
//! removed once the state record names it. It identifies the staged tree
//! by device and inode, which the rename keeps, so recovery can tell a
//! completed swap from a target that still holds the previous tree.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::fsutil::{sha256_hex, write_atomic};
use crate::resolver::ResolvedArtifact;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TreeId {
    dev: u64,
    ino: u64,
}

impl TreeId {
    #[cfg(unix)]
    pub(crate) fn of(path: &Path) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        fs::symlink_metadata(path).ok().map(|md| Self {
            dev: md.dev(),
            ino: md.ino(),
        })
    }

    // No stable identity: markers are never adopted, only discarded.
    #[cfg(not(unix))]
    pub(crate) fn of(_path: &Path) -> Option<Self> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PendingInstall {
    pub artifact: ResolvedArtifact,
    /// Workspace-relative cache entry the tree was built from.
    pub cache_path: PathBuf,
    pub tree: Option<TreeId>,
}

impl PendingInstall {
    /// True when `target` is the tree this marker was written for.
    pub(crate) fn is_live(&self, target: &Path) -> bool {
        self.tree.is_some() && TreeId::of(target) == self.tree
    }
}

pub(crate) fn marker_path(pending_dir: &Path, entry: &ResolvedArtifact) -> PathBuf {
    let key = sha256_hex(entry.target.to_string_lossy().as_bytes());
    pending_dir.join(format!("{}-{}.json", entry.name, &key[..16]))
}

pub(crate) fn write(path: &Path, marker: &PendingInstall, tmp_dir: &Path) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(marker).context("Failed to serialize install marker")?;
    write_atomic(path, &bytes, tmp_dir)
}

/// Every marker in `pending_dir`. Unreadable markers are removed.
pub(crate) fn load_all(pending_dir: &Path) -> Result<Vec<(PathBuf, PendingInstall)>> {
    let entries = match fs::read_dir(pending_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", pending_dir.display()))
        }
    };

    let mut out = Vec::new();
    for ent in entries {
        let path = ent?.path();
        let parsed = fs::read(&path)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| Ok(serde_json::from_slice::<PendingInstall>(&bytes)?));
        match parsed {
            Ok(marker) => out.push((path, marker)),
            Err(e) => {
                log::warn!(
                    "[bootstrap:recover] discarding unreadable marker {}: {e:#}",
                    path.display()
                );
                clear(&path);
            }
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

pub(crate) fn clear(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("[bootstrap:install] cannot remove {}: {e}", path.display()),
    }
}
