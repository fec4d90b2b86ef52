//! Fixed on-disk layout of a bootstrapped workspace.
//!
//! Downstream build tooling locates the state and configuration records
//! through these paths without re-running bootstrap or configure:
//!
//! ```text
//! <workspace>/
//!     bootstrap.toml            manifest (default location)
//!     .bootstrap/
//!         state.json            WorkspaceState record
//!         config.json           BuildConfig record
//!         cache/                fetched artifacts (content-addressed)
//!         staging/              in-progress materializations
//!         pending/              markers for swaps not yet recorded
//!         locks/                per-name and per-cache-key locks
//!         tmp/                  scratch files renamed into place
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default manifest file name at the workspace root.
pub const MANIFEST_FILE: &str = "bootstrap.toml";

/// Directory holding all bootstrap bookkeeping.
pub const STATE_DIR: &str = ".bootstrap";

/// State record, relative to the workspace root.
pub const STATE_FILE: &str = ".bootstrap/state.json";

/// Configuration record, relative to the workspace root.
pub const CONFIG_FILE: &str = ".bootstrap/config.json";

#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_file(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.state_dir().join("cache")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.state_dir().join("staging")
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.state_dir().join("pending")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir().join("locks")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.state_dir().join("tmp")
    }

    /// Absolute path of a manifest target (already validated as relative).
    pub fn target_path(&self, target: &Path) -> PathBuf {
        self.root.join(target)
    }

    /// Create the bookkeeping directories if they are missing.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.cache_dir(),
            self.staging_dir(),
            self.pending_dir(),
            self.locks_dir(),
            self.tmp_dir(),
        ] {
            fs::create_dir_all(&dir)
                .map_err(|e| Error::io(format!("creating {}", dir.display()), e))?;
        }
        Ok(())
    }
}
