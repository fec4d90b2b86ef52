//! On-disk record of what is installed where.
//!
//! `.bootstrap/state.json` maps artifact name to installed version, target
//! paths and install time. It is rewritten atomically after every
//! committed install, so it never names a target that is still being
//! materialized.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use time::OffsetDateTime;

use crate::error::{Error, Result};
use crate::fsutil::{path_exists, write_atomic};
use crate::layout::WorkspaceLayout;
use crate::resolver::{InstallPlan, ResolvedArtifact};

pub const STATE_SCHEMA: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledArtifact {
    pub version: String,
    /// Workspace-relative target paths holding this version.
    pub targets: BTreeSet<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Workspace-relative cache entries the targets were built from.
    #[serde(default)]
    pub cache_paths: BTreeSet<PathBuf>,
    #[serde(with = "time::serde::rfc3339")]
    pub installed_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceState {
    pub schema: u32,
    #[serde(default)]
    pub artifacts: BTreeMap<String, InstalledArtifact>,
}

impl Default for WorkspaceState {
    fn default() -> Self {
        Self {
            schema: STATE_SCHEMA,
            artifacts: BTreeMap::new(),
        }
    }
}

impl WorkspaceState {
    /// Load the record; a missing file is an empty state.
    pub fn load(layout: &WorkspaceLayout) -> Result<Self> {
        let path = layout.state_file();
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(Error::io(format!("reading {}", path.display()), e)),
        };
        let state: Self = serde_json::from_slice(&bytes).map_err(|e| Error::StateInconsistency {
            divergences: vec![format!(
                "{} is not a valid state record ({e})",
                path.display()
            )],
        })?;
        if state.schema != STATE_SCHEMA {
            return Err(Error::StateInconsistency {
                divergences: vec![format!(
                    "{} has schema {} (expected {STATE_SCHEMA})",
                    path.display(),
                    state.schema
                )],
            });
        }
        Ok(state)
    }

    pub fn save(&self, layout: &WorkspaceLayout) -> Result<()> {
        let path = layout.state_file();
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::io("serializing state", io::Error::other(e)))?;
        write_atomic(&path, &bytes, &layout.tmp_dir()).map_err(|e| {
            Error::io(
                format!("writing {}", path.display()),
                io::Error::other(format!("{e:#}")),
            )
        })
    }

    /// True when `entry` is recorded at its exact version for its target.
    pub fn records(&self, entry: &ResolvedArtifact) -> bool {
        self.artifacts.get(&entry.name).is_some_and(|rec| {
            rec.version == entry.version
                && rec.sha256 == entry.sha256
                && rec.targets.contains(&entry.target)
        })
    }

    /// Record a committed install of `entry`.
    ///
    /// Targets already recorded for the same version are kept; a different
    /// version replaces the record.
    pub fn record(&mut self, entry: &ResolvedArtifact, cache_path: Option<PathBuf>) {
        let now = OffsetDateTime::now_utc();
        let rec = self
            .artifacts
            .entry(entry.name.clone())
            .or_insert_with(|| InstalledArtifact {
                version: entry.version.clone(),
                targets: BTreeSet::new(),
                sha256: entry.sha256.clone(),
                cache_paths: BTreeSet::new(),
                installed_at: now,
            });
        if rec.version != entry.version || rec.sha256 != entry.sha256 {
            *rec = InstalledArtifact {
                version: entry.version.clone(),
                targets: BTreeSet::new(),
                sha256: entry.sha256.clone(),
                cache_paths: BTreeSet::new(),
                installed_at: now,
            };
        }
        rec.targets.insert(entry.target.clone());
        rec.cache_paths.extend(cache_path);
        rec.installed_at = now;
    }

    /// Drop `target` from `name`'s record, removing the record when empty.
    pub fn forget_target(&mut self, name: &str, target: &Path) {
        if let Some(rec) = self.artifacts.get_mut(name) {
            rec.targets.remove(target);
            if rec.targets.is_empty() {
                self.artifacts.remove(name);
            }
        }
    }
}

/// One disagreement between the record and the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Divergence {
    /// Recorded as installed, but the target path is gone.
    MissingTarget { name: String, target: PathBuf },
    /// Present on disk at a planned target, but not recorded.
    Untracked { name: String, target: PathBuf },
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Divergence::MissingTarget { name, target } => write!(
                f,
                "'{name}' is recorded at {} but the path does not exist",
                target.display()
            ),
            Divergence::Untracked { name, target } => write!(
                f,
                "{} exists but no install of '{name}' is recorded there",
                target.display()
            ),
        }
    }
}

/// Compare the record against the filesystem for `plan`.
pub fn check_consistency(
    state: &WorkspaceState,
    plan: &InstallPlan,
    layout: &WorkspaceLayout,
) -> Vec<Divergence> {
    let mut out = Vec::new();
    for (name, rec) in &state.artifacts {
        for target in &rec.targets {
            if !path_exists(&layout.target_path(target)) {
                out.push(Divergence::MissingTarget {
                    name: name.clone(),
                    target: target.clone(),
                });
            }
        }
    }
    for entry in plan.entries() {
        let recorded = state
            .artifacts
            .get(&entry.name)
            .is_some_and(|rec| rec.targets.contains(&entry.target));
        if !recorded && path_exists(&layout.target_path(&entry.target)) {
            out.push(Divergence::Untracked {
                name: entry.name.clone(),
                target: entry.target.clone(),
            });
        }
    }
    out
}

/// Single serialized writer for the state record.
///
/// Every commit mutates the in-memory state and persists it before the lock
/// is released, so concurrent installers never interleave partial updates.
pub struct StateWriter<'a> {
    layout: &'a WorkspaceLayout,
    state: Mutex<WorkspaceState>,
}

impl<'a> StateWriter<'a> {
    pub fn new(layout: &'a WorkspaceLayout, state: WorkspaceState) -> Self {
        Self {
            layout,
            state: Mutex::new(state),
        }
    }

    fn guard(&self) -> MutexGuard<'_, WorkspaceState> {
        // A panicking installer cannot leave a half-applied update: commits
        // only mutate after the filesystem swap succeeded.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn read<R>(&self, f: impl FnOnce(&WorkspaceState) -> R) -> R {
        f(&self.guard())
    }

    /// Apply `update` and persist. On write failure the in-memory state is
    /// rolled back so it keeps matching the file.
    pub fn commit(&self, update: impl FnOnce(&mut WorkspaceState)) -> Result<()> {
        let mut state = self.guard();
        let before = state.clone();
        update(&mut state);
        if *state == before {
            return Ok(());
        }
        if let Err(e) = state.save(self.layout) {
            *state = before;
            return Err(e);
        }
        Ok(())
    }

    pub fn into_inner(self) -> WorkspaceState {
        self.state
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ArtifactFormat;
    use tempfile::TempDir;

    fn entry(name: &str, version: &str, target: &str) -> ResolvedArtifact {
        ResolvedArtifact {
            name: name.into(),
            version: version.into(),
            source: format!("file:///{name}"),
            target: PathBuf::from(target),
            format: ArtifactFormat::File,
            sha256: None,
            cache_path: PathBuf::from("/cache").join(name),
            file_name: name.into(),
            requires: vec![],
        }
    }

    #[test]
    fn missing_record_loads_as_empty() {
        let tmp = TempDir::new().unwrap();
        let layout = WorkspaceLayout::new(tmp.path());
        let state = WorkspaceState::load(&layout).unwrap();
        assert_eq!(state, WorkspaceState::default());
    }

    #[test]
    fn save_then_load_keeps_rfc3339_timestamps() {
        let tmp = TempDir::new().unwrap();
        let layout = WorkspaceLayout::new(tmp.path());
        let mut state = WorkspaceState::default();
        state.record(&entry("bootloader", "1.2.0", "boot"), None);
        state.save(&layout).unwrap();

        let text = fs::read_to_string(layout.state_file()).unwrap();
        let raw: serde_json::Value = serde_json::from_str(&text).unwrap();
        let stamp = raw["artifacts"]["bootloader"]["installed_at"].as_str().unwrap();
        assert!(stamp.contains('T') && stamp.ends_with('Z'), "{stamp}");

        assert_eq!(WorkspaceState::load(&layout).unwrap(), state);
    }

    #[test]
    fn new_version_replaces_old_targets() {
        let mut state = WorkspaceState::default();
        state.record(&entry("lib", "1.0.0", "a"), None);
        state.record(&entry("lib", "1.0.0", "b"), None);
        assert_eq!(state.artifacts["lib"].targets.len(), 2);

        state.record(&entry("lib", "2.0.0", "a"), None);
        let rec = &state.artifacts["lib"];
        assert_eq!(rec.version, "2.0.0");
        assert_eq!(rec.targets.len(), 1);
        assert!(!state.records(&entry("lib", "2.0.0", "b")));
        assert!(state.records(&entry("lib", "2.0.0", "a")));
    }

    #[test]
    fn forget_last_target_drops_record() {
        let mut state = WorkspaceState::default();
        state.record(&entry("lib", "1.0.0", "a"), None);
        state.forget_target("lib", Path::new("a"));
        assert!(state.artifacts.is_empty());
    }

    #[test]
    fn wrong_schema_is_reported() {
        let tmp = TempDir::new().unwrap();
        let layout = WorkspaceLayout::new(tmp.path());
        fs::create_dir_all(layout.state_dir()).unwrap();
        fs::write(layout.state_file(), br#"{"schema": 9, "artifacts": {}}"#).unwrap();
        assert!(matches!(
            WorkspaceState::load(&layout),
            Err(Error::StateInconsistency { .. })
        ));
    }

    #[test]
    fn writer_commits_are_persisted_immediately() {
        let tmp = TempDir::new().unwrap();
        let layout = WorkspaceLayout::new(tmp.path());
        let writer = StateWriter::new(&layout, WorkspaceState::default());
        writer
            .commit(|s| s.record(&entry("bootloader", "1.2.0", "boot"), None))
            .unwrap();
        let on_disk = WorkspaceState::load(&layout).unwrap();
        assert!(on_disk.artifacts.contains_key("bootloader"));
        assert_eq!(writer.into_inner(), on_disk);
    }

    #[test]
    fn noop_commit_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let layout = WorkspaceLayout::new(tmp.path());
        let writer = StateWriter::new(&layout, WorkspaceState::default());
        writer.commit(|_| {}).unwrap();
        assert!(!layout.state_file().exists());
    }
}
