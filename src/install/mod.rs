//! Tree installer: materializes each plan entry at its target path.
//!
//! Per entry:
//! 1. skip when the state record already names this version at this
//!    target and the path exists (nothing is written, not even a lock);
//! 2. take the per-name lock so other processes cannot race the swap;
//! 3. get the verified cache entry from the fetcher;
//! 4. unpack into `.bootstrap/staging/<tmp>`, write a pending marker and
//!    swap into place;
//! 5. commit the state record and drop the marker.
//!
//! A failure at steps 3-4 removes the staging directory and leaves both
//! the target and the record as they were. A crash between the swap and
//! the commit leaves the marker, and [`Installer::recover`] records the
//! swapped-in tree on the next run. Entries are scheduled along
//! the plan's dependency edges; a failed entry blocks its dependents only.

pub(crate) mod pending;
mod staging;

pub use staging::RecoveryReport;

use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::fsutil::{lock_exclusive, path_exists, remove_path, tmp_name, unpack};
use crate::layout::WorkspaceLayout;
use crate::resolver::{InstallPlan, ResolvedArtifact};
use crate::scheduler::{self, TaskStatus};
use crate::state::{StateWriter, WorkspaceState};

use pending::{PendingInstall, TreeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    AlreadyInstalled,
    InstalledNow,
}

/// Result of one install pass. `state` is the record after the pass.
#[derive(Debug)]
pub struct InstallReport {
    pub installed: Vec<ResolvedArtifact>,
    pub skipped: Vec<ResolvedArtifact>,
    pub failed: Vec<(ResolvedArtifact, Error)>,
    /// Not attempted because a dependency failed.
    pub blocked: Vec<ResolvedArtifact>,
    /// Not attempted because of cancellation.
    pub cancelled: Vec<ResolvedArtifact>,
    pub state: WorkspaceState,
}

impl InstallReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty() && self.cancelled.is_empty()
    }
}

pub struct Installer<'a> {
    layout: &'a WorkspaceLayout,
    fetcher: &'a Fetcher,
    force: bool,
}

impl<'a> Installer<'a> {
    pub fn new(layout: &'a WorkspaceLayout, fetcher: &'a Fetcher) -> Self {
        Self {
            layout,
            fetcher,
            force: false,
        }
    }

    /// Reinstall even when the record says the entry is current.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Apply `plan` on top of `state` with up to `workers` parallel installs.
    pub fn install(
        &self,
        plan: &InstallPlan,
        state: WorkspaceState,
        workers: usize,
        cancel: &CancelToken,
    ) -> InstallReport {
        let writer = StateWriter::new(self.layout, state);
        let entries = plan.entries();
        let statuses = scheduler::run(&plan.dependency_edges(), workers, cancel, |i| {
            self.install_one(&entries[i], &writer)
        });

        let mut report = InstallReport {
            installed: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            blocked: Vec::new(),
            cancelled: Vec::new(),
            state: WorkspaceState::default(),
        };
        for (entry, status) in entries.iter().cloned().zip(statuses) {
            match status {
                TaskStatus::Done(InstallOutcome::InstalledNow) => report.installed.push(entry),
                TaskStatus::Done(InstallOutcome::AlreadyInstalled) => report.skipped.push(entry),
                TaskStatus::Failed(e) => {
                    log::error!("[bootstrap:install] {}: {e}", entry.name);
                    report.failed.push((entry, e));
                }
                TaskStatus::Blocked => {
                    log::warn!(
                        "[bootstrap:install] {} not attempted: a dependency failed",
                        entry.name
                    );
                    report.blocked.push(entry);
                }
                TaskStatus::Cancelled => report.cancelled.push(entry),
            }
        }
        report.state = writer.into_inner();
        report
    }

    /// Install a single entry through `writer`.
    pub fn install_one(
        &self,
        entry: &ResolvedArtifact,
        writer: &StateWriter,
    ) -> Result<InstallOutcome> {
        let target = self.layout.target_path(&entry.target);
        if !self.force && self.is_current(entry, &target, writer) {
            log::debug!(
                "[bootstrap:install] {}@{} already at {}",
                entry.name,
                entry.version,
                entry.target.display()
            );
            return Ok(InstallOutcome::AlreadyInstalled);
        }

        let lock_path = self
            .layout
            .locks_dir()
            .join("install")
            .join(format!("{}.lock", entry.name));
        let _lock = lock_exclusive(&lock_path).map_err(|e| install_error(entry, e))?;

        // Another process may have finished this entry while we waited.
        if !self.force && self.is_current(entry, &target, writer) {
            return Ok(InstallOutcome::AlreadyInstalled);
        }

        let cached = self
            .fetcher
            .fetch(&entry.source, &entry.cache_path, entry.sha256.as_deref())?;

        let cache_rel = relative_to(self.layout.root(), &cached.path);
        let staged = self.layout.staging_dir().join(tmp_name(&entry.name));
        let marker = pending::marker_path(&self.layout.pending_dir(), entry);
        let materialized = unpack(entry.format, &cached.path, &staged, &entry.file_name)
            .and_then(|()| {
                let pending = PendingInstall {
                    artifact: entry.clone(),
                    cache_path: cache_rel.clone(),
                    tree: TreeId::of(&staged),
                };
                pending::write(&marker, &pending, &self.layout.tmp_dir())
            })
            .and_then(|()| staging::swap_into_place(&staged, &target))
            .with_context(|| format!("materializing {}@{}", entry.name, entry.version));
        if let Err(e) = materialized {
            if path_exists(&staged) {
                let _ = remove_path(&staged);
            }
            pending::clear(&marker);
            return Err(install_error(entry, e));
        }

        // On failure the marker stays, so the next recovery records the tree.
        writer.commit(|state| state.record(entry, Some(cache_rel)))?;
        pending::clear(&marker);

        log::info!(
            "[bootstrap:install] {}@{} -> {}",
            entry.name,
            entry.version,
            entry.target.display()
        );
        Ok(InstallOutcome::InstalledNow)
    }

    fn is_current(&self, entry: &ResolvedArtifact, target: &Path, writer: &StateWriter) -> bool {
        writer.read(|state| state.records(entry)) && path_exists(target)
    }

    /// Restore or discard leftovers from an interrupted run.
    ///
    /// Swaps that completed before a crash but were never committed are
    /// recorded in `state`, which is saved before their markers go away.
    pub fn recover(
        &self,
        plan: &InstallPlan,
        state: &mut WorkspaceState,
    ) -> Result<RecoveryReport> {
        let pending_dir = self.layout.pending_dir();
        let recovery_error = |e: anyhow::Error| Error::Install {
            artifact: "(recovery)".to_string(),
            target: self.layout.state_dir(),
            source: e,
        };
        let markers = pending::load_all(&pending_dir).map_err(recovery_error)?;

        let mut targets: Vec<PathBuf> = plan
            .entries()
            .iter()
            .map(|e| self.layout.target_path(&e.target))
            .collect();
        for rec in state.artifacts.values() {
            targets.extend(rec.targets.iter().map(|t| self.layout.target_path(t)));
        }
        targets.extend(
            markers
                .iter()
                .map(|(_, m)| self.layout.target_path(&m.artifact.target)),
        );
        targets.sort();
        targets.dedup();

        let staging_dir = self.layout.staging_dir();
        let mut report = staging::recover(&staging_dir, targets.iter().map(PathBuf::as_path))
            .map_err(recovery_error)?;

        for (_, marker) in &markers {
            let target = self.layout.target_path(&marker.artifact.target);
            if marker.is_live(&target) && !state.records(&marker.artifact) {
                state.record(&marker.artifact, Some(marker.cache_path.clone()));
                log::warn!(
                    "[bootstrap:recover] recorded {}@{} at {} from an interrupted install",
                    marker.artifact.name,
                    marker.artifact.version,
                    marker.artifact.target.display()
                );
                report.adopted.push(target);
            }
        }
        if !report.adopted.is_empty() {
            state.save(self.layout)?;
        }
        for (path, _) in &markers {
            pending::clear(path);
        }

        for t in &report.restored {
            log::warn!(
                "[bootstrap:recover] restored {} from an interrupted install",
                t.display()
            );
        }
        if report.staging_cleared > 0 {
            log::info!(
                "[bootstrap:recover] cleared {} orphaned staging dir(s)",
                report.staging_cleared
            );
        }
        Ok(report)
    }
}

fn install_error(entry: &ResolvedArtifact, source: anyhow::Error) -> Error {
    Error::Install {
        artifact: entry.name.clone(),
        target: entry.target.clone(),
        source,
    }
}

fn relative_to(root: &Path, path: &Path) -> PathBuf {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Create the directories the installer writes into.
pub fn prepare(layout: &WorkspaceLayout) -> Result<()> {
    layout.ensure()?;
    fs::create_dir_all(layout.locks_dir().join("install"))
        .map_err(|e| Error::io("creating install lock dir", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::testutil::CountingTransport;
    use crate::fetch::RetryPolicy;
    use crate::fsutil::testutil::write_tar_zst;
    use crate::manifest::Manifest;
    use crate::resolver::resolve;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;
    use walkdir::WalkDir;

    struct Fixture {
        _tmp: TempDir,
        layout: WorkspaceLayout,
        upstream: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let layout = WorkspaceLayout::new(tmp.path().join("ws"));
        prepare(&layout).unwrap();
        let upstream = tmp.path().join("upstream");
        fs::create_dir_all(&upstream).unwrap();
        write_tar_zst(
            &upstream.join("toolchain-3.1.0.tar.zst"),
            &[("bin/cc", b"cc"), ("lib/libc.a", b"libc")],
        );
        fs::write(upstream.join("BOOTX64.EFI"), b"efi").unwrap();
        Fixture {
            _tmp: tmp,
            layout,
            upstream,
        }
    }

    fn plan(fx: &Fixture) -> InstallPlan {
        let text = format!(
            r#"
[[artifact]]
name = "bootloader"
source = "file://{up}/BOOTX64.EFI"
version = "8.0.0"
target = "bootloader"
format = "file"

[[artifact]]
name = "toolchain"
source = "file://{up}/toolchain-{{version}}.tar.zst"
version = ">=3.0, <4.0"
target = "toolchain"
requires = ["bootloader"]

[[release]]
name = "toolchain"
version = "3.1.0"
"#,
            up = fx.upstream.display()
        );
        let m = Manifest::from_toml_str(&text, Path::new("bootstrap.toml")).unwrap();
        resolve(&m.artifacts, &m.releases, &fx.layout.cache_dir()).unwrap()
    }

    fn fetcher(layout: &WorkspaceLayout) -> (Fetcher, Arc<AtomicU32>) {
        let (transport, calls) = CountingTransport::new();
        let policy = RetryPolicy {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        };
        (Fetcher::new(layout, Box::new(transport), policy), calls)
    }

    fn mtimes(root: &Path) -> Vec<(PathBuf, SystemTime)> {
        WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .map(|e| e.unwrap())
            .map(|e| (e.path().to_path_buf(), e.metadata().unwrap().modified().unwrap()))
            .collect()
    }

    #[test]
    fn installs_plan_and_records_state() {
        let fx = fixture();
        let plan = plan(&fx);
        let (fetcher, _) = fetcher(&fx.layout);
        let installer = Installer::new(&fx.layout, &fetcher);

        let report = installer.install(&plan, WorkspaceState::default(), 2, &CancelToken::new());

        assert!(report.is_complete(), "{:?}", report.failed);
        assert_eq!(report.installed.len(), 2);
        let ws = fx.layout.root();
        assert_eq!(fs::read(ws.join("bootloader/BOOTX64.EFI")).unwrap(), b"efi");
        assert_eq!(fs::read(ws.join("toolchain/bin/cc")).unwrap(), b"cc");

        let on_disk = WorkspaceState::load(&fx.layout).unwrap();
        assert_eq!(on_disk, report.state);
        assert_eq!(on_disk.artifacts["toolchain"].version, "3.1.0");
        assert_eq!(fs::read_dir(fx.layout.staging_dir()).unwrap().count(), 0);
    }

    #[test]
    fn rerun_with_unchanged_plan_writes_nothing() {
        let fx = fixture();
        let plan = plan(&fx);
        let (fetcher, calls) = fetcher(&fx.layout);
        let installer = Installer::new(&fx.layout, &fetcher);
        let first = installer.install(&plan, WorkspaceState::default(), 2, &CancelToken::new());
        assert!(first.is_complete());
        let fetched = calls.load(Ordering::SeqCst);

        let before = mtimes(fx.layout.root());
        let second = installer.install(&plan, first.state, 2, &CancelToken::new());
        let after = mtimes(fx.layout.root());

        assert_eq!(second.skipped.len(), 2);
        assert!(second.installed.is_empty());
        assert_eq!(before, after);
        assert_eq!(calls.load(Ordering::SeqCst), fetched);
    }

    #[test]
    fn failed_materialization_leaves_target_and_state_untouched() {
        let fx = fixture();
        // Corrupt archive: unpacking fails after the fetch succeeded.
        fs::write(fx.upstream.join("toolchain-3.1.0.tar.zst"), b"not zstd").unwrap();
        let plan = plan(&fx);
        let (fetcher, _) = fetcher(&fx.layout);
        let installer = Installer::new(&fx.layout, &fetcher);

        let report = installer.install(&plan, WorkspaceState::default(), 1, &CancelToken::new());

        assert_eq!(report.installed.len(), 1, "bootloader still installs");
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.failed[0].1, Error::Install { .. }));
        assert!(!fx.layout.root().join("toolchain").exists());
        assert!(!report.state.artifacts.contains_key("toolchain"));
        assert_eq!(fs::read_dir(fx.layout.staging_dir()).unwrap().count(), 0);
    }

    #[test]
    fn failed_dependency_blocks_dependents() {
        let fx = fixture();
        fs::remove_file(fx.upstream.join("BOOTX64.EFI")).unwrap();
        let plan = plan(&fx);
        let (fetcher, _) = fetcher(&fx.layout);
        let installer = Installer::new(&fx.layout, &fetcher);

        let report = installer.install(&plan, WorkspaceState::default(), 2, &CancelToken::new());

        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.failed[0].1, Error::Fetch { .. }));
        assert_eq!(report.blocked.len(), 1);
        assert_eq!(report.blocked[0].name, "toolchain");
    }

    #[test]
    fn interrupted_install_recovers_to_previous_tree() {
        let fx = fixture();
        let plan = plan(&fx);
        let (fetcher, _) = fetcher(&fx.layout);
        let installer = Installer::new(&fx.layout, &fetcher);
        let first = installer.install(&plan, WorkspaceState::default(), 1, &CancelToken::new());
        assert!(first.is_complete());

        // Simulate a crash mid-swap of the toolchain: previous tree moved
        // aside, half-extracted staging left behind, no new tree in place.
        let target = fx.layout.root().join("toolchain");
        fs::rename(&target, staging::backup_path(&target)).unwrap();
        let half = fx.layout.staging_dir().join("toolchain-crashed");
        fs::create_dir_all(half.join("bin")).unwrap();

        let mut state = first.state;
        let report = installer.recover(&plan, &mut state).unwrap();
        assert_eq!(report.restored, vec![target.clone()]);
        assert!(report.adopted.is_empty());
        assert_eq!(fs::read(target.join("bin/cc")).unwrap(), b"cc");
        assert_eq!(fs::read_dir(fx.layout.staging_dir()).unwrap().count(), 0);

        let rerun = installer.install(&plan, state, 1, &CancelToken::new());
        assert_eq!(rerun.skipped.len(), 2);
    }

    #[test]
    fn committed_install_leaves_no_marker() {
        let fx = fixture();
        let plan = plan(&fx);
        let (fetcher, _) = fetcher(&fx.layout);
        let report = Installer::new(&fx.layout, &fetcher).install(
            &plan,
            WorkspaceState::default(),
            2,
            &CancelToken::new(),
        );
        assert!(report.is_complete());
        assert_eq!(fs::read_dir(fx.layout.pending_dir()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn swap_without_commit_is_recorded_on_recovery() {
        let fx = fixture();
        let plan = plan(&fx);
        let (fetcher, calls) = fetcher(&fx.layout);
        let installer = Installer::new(&fx.layout, &fetcher);
        let first = installer.install(&plan, WorkspaceState::default(), 1, &CancelToken::new());
        assert!(first.is_complete());

        // Crash after the toolchain swap, before its record was written.
        let entry = plan.entries()[1].clone();
        assert_eq!(entry.name, "toolchain");
        let target = fx.layout.target_path(&entry.target);
        let mut state = first.state;
        state.forget_target(&entry.name, &entry.target);
        state.save(&fx.layout).unwrap();
        let marker = PendingInstall {
            cache_path: relative_to(fx.layout.root(), &entry.cache_path),
            tree: TreeId::of(&target),
            artifact: entry.clone(),
        };
        let marker_path = pending::marker_path(&fx.layout.pending_dir(), &entry);
        pending::write(&marker_path, &marker, &fx.layout.tmp_dir()).unwrap();

        let report = installer.recover(&plan, &mut state).unwrap();

        assert_eq!(report.adopted, vec![target]);
        assert!(state.records(&entry));
        assert_eq!(WorkspaceState::load(&fx.layout).unwrap(), state);
        assert!(!marker_path.exists());

        let fetched = calls.load(Ordering::SeqCst);
        let rerun = installer.install(&plan, state, 2, &CancelToken::new());
        assert_eq!(rerun.skipped.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), fetched);
    }

    #[test]
    fn marker_for_a_swap_that_never_happened_is_discarded() {
        let fx = fixture();
        let plan = plan(&fx);
        let (fetcher, _) = fetcher(&fx.layout);
        let installer = Installer::new(&fx.layout, &fetcher);

        // Crash after the marker was written, before the swap: the staged
        // tree is still in staging and the target does not exist.
        let entry = plan.entries()[0].clone();
        let staged = fx.layout.staging_dir().join("bootloader-crashed");
        fs::create_dir_all(&staged).unwrap();
        let marker = PendingInstall {
            cache_path: relative_to(fx.layout.root(), &entry.cache_path),
            tree: TreeId::of(&staged),
            artifact: entry.clone(),
        };
        let marker_path = pending::marker_path(&fx.layout.pending_dir(), &entry);
        pending::write(&marker_path, &marker, &fx.layout.tmp_dir()).unwrap();

        let mut state = WorkspaceState::default();
        let report = installer.recover(&plan, &mut state).unwrap();

        assert!(report.adopted.is_empty());
        assert_eq!(report.staging_cleared, 1);
        assert!(state.artifacts.is_empty());
        assert!(!fx.layout.target_path(&entry.target).exists());
        assert!(!marker_path.exists());
        assert!(!fx.layout.state_file().exists());
    }

    #[test]
    fn one_name_at_two_targets_installs_serially_under_one_version() {
        let fx = fixture();
        let text = format!(
            r#"
[[artifact]]
name = "toolchain"
source = "file://{up}/toolchain-{{version}}.tar.zst"
version = ">=3.0"
target = "host/toolchain"

[[artifact]]
name = "toolchain"
source = "file://{up}/toolchain-{{version}}.tar.zst"
version = "<4.0"
target = "cross/toolchain"

[[release]]
name = "toolchain"
version = "3.1.0"
"#,
            up = fx.upstream.display()
        );
        let m = Manifest::from_toml_str(&text, Path::new("bootstrap.toml")).unwrap();
        let plan = resolve(&m.artifacts, &m.releases, &fx.layout.cache_dir()).unwrap();
        assert_eq!(plan.dependency_edges(), vec![vec![], vec![0]]);

        let (fetcher, calls) = fetcher(&fx.layout);
        let report = Installer::new(&fx.layout, &fetcher).install(
            &plan,
            WorkspaceState::default(),
            4,
            &CancelToken::new(),
        );

        assert!(report.is_complete(), "{:?}", report.failed);
        assert_eq!(report.installed.len(), 2);
        let rec = &report.state.artifacts["toolchain"];
        assert_eq!(rec.version, "3.1.0");
        assert_eq!(
            rec.targets,
            [PathBuf::from("cross/toolchain"), PathBuf::from("host/toolchain")]
                .into_iter()
                .collect::<std::collections::BTreeSet<_>>()
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1, "shared cache entry is fetched once");
        let root = fx.layout.root();
        assert_eq!(fs::read(root.join("host/toolchain/bin/cc")).unwrap(), b"cc");
        assert_eq!(fs::read(root.join("cross/toolchain/bin/cc")).unwrap(), b"cc");
    }

    #[test]
    fn force_reinstalls_current_entries() {
        let fx = fixture();
        let plan = plan(&fx);
        let (fetcher, _) = fetcher(&fx.layout);
        let first = Installer::new(&fx.layout, &fetcher).install(
            &plan,
            WorkspaceState::default(),
            1,
            &CancelToken::new(),
        );
        fs::write(fx.layout.root().join("toolchain/extra"), b"x").unwrap();

        let forced = Installer::new(&fx.layout, &fetcher).force(true).install(
            &plan,
            first.state,
            1,
            &CancelToken::new(),
        );
        assert_eq!(forced.installed.len(), 2);
        assert!(!fx.layout.root().join("toolchain/extra").exists());
    }
}
