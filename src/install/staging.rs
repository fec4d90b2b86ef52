//! Staging area, swap into place, and crash recovery.
//!
//! A target is only ever replaced by two renames:
//!
//! ```text
//! target          -> target.bootstrap-old     (only if target exists)
//! staging/<tmp>   -> target
//! remove target.bootstrap-old
//! ```
//!
//! A crash between the renames leaves `target.bootstrap-old` without a
//! `target`; [`recover`] renames it back so the workspace returns to its
//! pre-install state. A crash after the second rename leaves both, and the
//! leftover backup is discarded.

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use crate::fsutil::{path_exists, remove_path, rename_into_place};

const BACKUP_SUFFIX: &str = ".bootstrap-old";

pub(crate) fn backup_path(target: &Path) -> PathBuf {
    let mut name = OsString::from(target.as_os_str());
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Replace `target` with the fully materialized `staged` tree.
pub(crate) fn swap_into_place(staged: &Path, target: &Path) -> Result<()> {
    let backup = backup_path(target);
    if path_exists(&backup) {
        remove_path(&backup)?;
    }

    let had_previous = path_exists(target);
    if had_previous {
        fs::rename(target, &backup).with_context(|| {
            format!("Failed to move {} aside to {}", target.display(), backup.display())
        })?;
    }

    if let Err(e) = rename_into_place(staged, target) {
        if had_previous {
            let _ = fs::rename(&backup, target);
        }
        return Err(e);
    }

    if had_previous {
        if let Err(e) = remove_path(&backup) {
            // The new tree is already live; the backup is collected on the next start.
            log::warn!("[bootstrap:install] {e:#}");
        }
    }
    Ok(())
}

/// What start-up recovery changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Targets restored from an interrupted swap.
    pub restored: Vec<PathBuf>,
    /// Leftover backups discarded after a completed swap.
    pub discarded: Vec<PathBuf>,
    /// Orphaned staging directories removed.
    pub staging_cleared: usize,
    /// Targets swapped in before a crash and recorded during recovery.
    pub adopted: Vec<PathBuf>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.restored.is_empty()
            && self.discarded.is_empty()
            && self.staging_cleared == 0
            && self.adopted.is_empty()
    }
}

/// Undo the effects of an interrupted run.
///
/// `targets` are absolute target paths (planned and recorded).
pub(crate) fn recover<'a>(
    staging_dir: &Path,
    targets: impl IntoIterator<Item = &'a Path>,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    if staging_dir.is_dir() {
        for ent in fs::read_dir(staging_dir)
            .with_context(|| format!("Failed to read {}", staging_dir.display()))?
        {
            let ent = ent?;
            remove_path(&ent.path())?;
            report.staging_cleared += 1;
        }
    }

    for target in targets {
        let backup = backup_path(target);
        if !path_exists(&backup) {
            continue;
        }
        if path_exists(target) {
            remove_path(&backup)?;
            report.discarded.push(target.to_path_buf());
        } else {
            fs::rename(&backup, target).with_context(|| {
                format!("Failed to restore {} from {}", target.display(), backup.display())
            })?;
            report.restored.push(target.to_path_buf());
        }
    }

    Ok(report)
}
