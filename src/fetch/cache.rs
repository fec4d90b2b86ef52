//! Cache garbage collection.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::layout::WorkspaceLayout;
use crate::state::WorkspaceState;

use super::sidecar_path;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub removed_files: usize,
    pub removed_bytes: u64,
}

/// Remove cache files that no state record references.
///
/// Sidecars of referenced entries are kept. Empty directories left behind
/// are pruned.
pub fn gc(layout: &WorkspaceLayout, state: &WorkspaceState) -> Result<GcReport> {
    let cache_root = layout.cache_dir();
    let mut report = GcReport::default();
    if !cache_root.exists() {
        return Ok(report);
    }

    let mut keep: BTreeSet<PathBuf> = BTreeSet::new();
    for rec in state.artifacts.values() {
        for rel in &rec.cache_paths {
            let abs = layout.root().join(rel);
            keep.insert(sidecar_path(&abs));
            keep.insert(abs);
        }
    }

    for ent in WalkDir::new(&cache_root).into_iter().filter_map(|e| e.ok()) {
        if !ent.file_type().is_file() || keep.contains(ent.path()) {
            continue;
        }
        let size = ent.metadata().map(|m| m.len()).unwrap_or(0);
        fs::remove_file(ent.path()).map_err(|e| {
            Error::io(
                format!("removing unreferenced cache file {}", ent.path().display()),
                e,
            )
        })?;
        log::debug!("[bootstrap:gc] removed {}", ent.path().display());
        report.removed_files += 1;
        report.removed_bytes += size;
    }

    // Deepest first so parents empty out before they are visited.
    for ent in WalkDir::new(&cache_root)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if ent.file_type().is_dir() {
            let _ = fs::remove_dir(ent.path());
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InstalledArtifact;
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use time::OffsetDateTime;

    #[test]
    fn removes_only_unreferenced_entries() {
        let tmp = TempDir::new().unwrap();
        let layout = WorkspaceLayout::new(tmp.path());
        layout.ensure().unwrap();

        let kept = layout.cache_dir().join("named/boot-1.0.0/abcd/boot.bin");
        let dropped = layout.cache_dir().join("named/old-0.1.0/ef01/old.bin");
        for p in [&kept, &dropped] {
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(p, b"12345").unwrap();
        }
        fs::write(sidecar_path(&kept), b"sha").unwrap();

        let mut artifacts = BTreeMap::new();
        artifacts.insert(
            "boot".to_string(),
            InstalledArtifact {
                version: "1.0.0".into(),
                targets: [PathBuf::from("boot")].into_iter().collect(),
                sha256: None,
                cache_paths: [PathBuf::from(".bootstrap/cache/named/boot-1.0.0/abcd/boot.bin")]
                    .into_iter()
                    .collect(),
                installed_at: OffsetDateTime::now_utc(),
            },
        );
        let state = WorkspaceState {
            schema: crate::state::STATE_SCHEMA,
            artifacts,
        };

        let report = gc(&layout, &state).unwrap();
        assert_eq!(report.removed_files, 1);
        assert_eq!(report.removed_bytes, 5);
        assert!(kept.exists());
        assert!(sidecar_path(&kept).exists());
        assert!(!dropped.exists());
        assert!(!layout.cache_dir().join("named/old-0.1.0").exists());
    }
}
