//! Bootstrap orchestrator.
//!
//! Drives one bootstrap run through a strictly forward state machine:
//!
//! ```text
//! Uninitialized -> ManifestLoaded -> Resolved -> Fetching -> Installed
//!               -> [Configured] -> Ready
//! ```
//!
//! A failure halts the run at the stage it happened in. Nothing already
//! committed is rolled back: every stage re-checks the state record and
//! configuration before acting, so re-running resumes with only the
//! remaining work.

use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::cancel::CancelToken;
use crate::configure::{self, BuildConfig, ConfigOptions};
use crate::error::{Error, Result};
use crate::fetch::{self, DefaultTransport, FetchOutcome, Fetcher, GcReport, RetryPolicy, Transport};
use crate::fsutil::{lock_exclusive, path_exists};
use crate::install::{self, InstallReport, Installer, RecoveryReport};
use crate::layout::WorkspaceLayout;
use crate::manifest::Manifest;
use crate::preflight;
use crate::resolver::{resolve, InstallPlan, ResolvedArtifact};
use crate::scheduler::{self, TaskStatus};
use crate::state::{check_consistency, Divergence, WorkspaceState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Uninitialized,
    ManifestLoaded,
    Resolved,
    Fetching,
    Installed,
    Configured,
    Ready,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Uninitialized => "uninitialized",
            Stage::ManifestLoaded => "manifest-loaded",
            Stage::Resolved => "resolved",
            Stage::Fetching => "fetching",
            Stage::Installed => "installed",
            Stage::Configured => "configured",
            Stage::Ready => "ready",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    /// Manifest path; defaults to `bootstrap.toml` at the workspace root.
    pub manifest: Option<PathBuf>,
    /// Bypass cache and installed-skip checks, and repair divergent state.
    pub force: bool,
    /// Write the default configuration when none exists.
    pub configure: bool,
    pub skip_preflight: bool,
    /// Overrides `[install].workers`.
    pub workers: Option<usize>,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            manifest: None,
            force: false,
            configure: true,
            skip_preflight: false,
            workers: None,
        }
    }
}

#[derive(Debug)]
pub struct BootstrapReport {
    pub stage: Stage,
    pub plan: InstallPlan,
    pub recovery: RecoveryReport,
    pub downloaded: usize,
    pub cache_hits: usize,
    pub install: InstallReport,
    /// Path of the configuration written by this run, if any.
    pub configured: Option<PathBuf>,
}

pub struct Orchestrator {
    layout: WorkspaceLayout,
    transport: Option<Box<dyn Transport>>,
    cancel: CancelToken,
    stage: Stage,
}

impl Orchestrator {
    pub fn new(layout: WorkspaceLayout) -> Self {
        Self {
            layout,
            transport: None,
            cancel: CancelToken::new(),
            stage: Stage::Uninitialized,
        }
    }

    /// Replace the default http/file transport.
    pub fn with_transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Last stage reached; after a failure, the stage the run halted at.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn advance(&mut self, next: Stage) {
        debug_assert!(next > self.stage, "stage {} -> {next} is not forward", self.stage);
        self.stage = next;
        log::debug!("[bootstrap] stage: {next}");
    }

    fn check_cancel(&self, during: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled {
                stage: during.to_string(),
            });
        }
        Ok(())
    }

    pub fn run(&mut self, opts: &BootstrapOptions) -> Result<BootstrapReport> {
        let layout = self.layout.clone();

        let manifest_path = opts
            .manifest
            .clone()
            .unwrap_or_else(|| layout.manifest_file());
        let manifest = Manifest::load(&manifest_path)?;
        log::info!(
            "[bootstrap] manifest {} ({} artifact(s))",
            manifest_path.display(),
            manifest.artifacts.len()
        );
        self.advance(Stage::ManifestLoaded);

        if opts.skip_preflight {
            log::warn!("[bootstrap:preflight] skipped");
        } else {
            preflight::check_required_tools(&manifest.install.host_tools)?;
        }

        let plan = resolve(&manifest.artifacts, &manifest.releases, &layout.cache_dir())?;
        for e in plan.entries() {
            log::info!(
                "[bootstrap:resolve] {}@{} -> {}",
                e.name,
                e.version,
                e.target.display()
            );
        }
        self.advance(Stage::Resolved);
        self.check_cancel("resolve")?;

        install::prepare(&layout)?;
        // One bootstrap (or gc) per workspace: recovery clears staging and
        // the state writer owns the record for the whole run.
        let _workspace_lock = lock_exclusive(&layout.locks_dir().join("workspace.lock"))
            .map_err(|e| lock_error("workspace", e))?;

        let transport: Box<dyn Transport> = match self.transport.take() {
            Some(t) => t,
            None => Box::new(DefaultTransport::new(manifest.fetch.timeout)),
        };
        let fetcher = Fetcher::new(&layout, transport, RetryPolicy::from(&manifest.fetch))
            .with_cancel(self.cancel.clone());
        let installer = Installer::new(&layout, &fetcher).force(opts.force);

        let mut state = WorkspaceState::load(&layout)?;
        let recovery = installer.recover(&plan, &mut state)?;
        reconcile(&layout, &plan, &mut state, opts.force)?;
        self.advance(Stage::Fetching);

        let workers = opts.workers.unwrap_or(manifest.install.workers).max(1);
        let (downloaded, cache_hits) =
            self.fetch_stage(&fetcher, &plan, &state, opts.force, workers)?;
        self.check_cancel("fetch")?;

        let mut install = installer.install(&plan, state, workers, &self.cancel);
        if !install.failed.is_empty() {
            // Independent artifacts were still installed and recorded.
            let (_, err) = install.failed.swap_remove(0);
            return Err(err);
        }
        if !install.cancelled.is_empty() {
            return Err(Error::Cancelled {
                stage: format!(
                    "install ({} artifact(s) not installed)",
                    install.cancelled.len()
                ),
            });
        }
        self.advance(Stage::Installed);

        let mut configured = None;
        if opts.configure {
            if configure::load(&layout)?.is_none() {
                let config = configure::generate(&ConfigOptions::default())?;
                match configure::persist(&config, &layout, false) {
                    Ok(path) => configured = Some(path),
                    Err(Error::ConfigExists(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            self.advance(Stage::Configured);
        }

        self.advance(Stage::Ready);
        log::info!(
            "[bootstrap] ready: {} installed, {} up to date",
            install.installed.len(),
            install.skipped.len()
        );

        Ok(BootstrapReport {
            stage: self.stage,
            plan,
            recovery,
            downloaded,
            cache_hits,
            install,
            configured,
        })
    }

    /// Fill the cache for every entry that will be installed.
    ///
    /// Fetches only write the content-addressed cache, so they run without
    /// ordering; dependency order is enforced by the install stage.
    fn fetch_stage(
        &self,
        fetcher: &Fetcher,
        plan: &InstallPlan,
        state: &WorkspaceState,
        force: bool,
        workers: usize,
    ) -> Result<(usize, usize)> {
        let mut seen = BTreeSet::new();
        let pending: Vec<&ResolvedArtifact> = plan
            .entries()
            .iter()
            .filter(|e| {
                force || !(state.records(e) && path_exists(&self.layout.target_path(&e.target)))
            })
            .filter(|e| seen.insert(e.cache_path.clone()))
            .collect();

        let deps = vec![Vec::new(); pending.len()];
        let statuses = scheduler::run(&deps, workers, &self.cancel, |i| {
            let e = pending[i];
            if force {
                fetcher.refetch(&e.source, &e.cache_path, e.sha256.as_deref())
            } else {
                fetcher.fetch(&e.source, &e.cache_path, e.sha256.as_deref())
            }
        });

        let (mut downloaded, mut hits) = (0, 0);
        let mut first_error = None;
        for (entry, status) in pending.iter().zip(statuses) {
            match status {
                TaskStatus::Done(c) => match c.outcome {
                    FetchOutcome::CacheHit => hits += 1,
                    FetchOutcome::Downloaded { .. } => downloaded += 1,
                },
                TaskStatus::Failed(e) => {
                    log::error!("[bootstrap:fetch] {}: {e}", entry.name);
                    first_error.get_or_insert(e);
                }
                TaskStatus::Blocked | TaskStatus::Cancelled => {}
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        Ok((downloaded, hits))
    }
}

/// Enforce that the record and the filesystem agree before any write.
fn reconcile(
    layout: &WorkspaceLayout,
    plan: &InstallPlan,
    state: &mut WorkspaceState,
    force: bool,
) -> Result<()> {
    let divergences = check_consistency(state, plan, layout);
    if divergences.is_empty() {
        return Ok(());
    }
    if !force {
        return Err(Error::StateInconsistency {
            divergences: divergences.iter().map(ToString::to_string).collect(),
        });
    }

    for d in &divergences {
        log::warn!("[bootstrap:state] {d}; repairing (--force)");
        if let Divergence::MissingTarget { name, target } = d {
            state.forget_target(name, target);
        }
    }
    state.save(layout)
}

fn lock_error(what: &str, e: anyhow::Error) -> Error {
    Error::io(
        format!("locking {what}"),
        io::Error::other(format!("{e:#}")),
    )
}

/// What `status` prints.
#[derive(Debug)]
pub struct WorkspaceStatus {
    pub state: WorkspaceState,
    pub config: Option<BuildConfig>,
    /// Recorded targets that no longer exist.
    pub missing_targets: Vec<PathBuf>,
}

pub fn status(layout: &WorkspaceLayout) -> Result<WorkspaceStatus> {
    let state = WorkspaceState::load(layout)?;
    let config = configure::load(layout)?;
    let missing_targets = state
        .artifacts
        .values()
        .flat_map(|rec| rec.targets.iter())
        .filter(|t| !path_exists(&layout.target_path(t)))
        .cloned()
        .collect();
    Ok(WorkspaceStatus {
        state,
        config,
        missing_targets,
    })
}

/// Remove cache entries no state record references.
///
/// Waits for a running bootstrap to finish.
pub fn collect_garbage(layout: &WorkspaceLayout) -> Result<GcReport> {
    let _lock = lock_exclusive(&layout.locks_dir().join("workspace.lock"))
        .map_err(|e| lock_error("workspace", e))?;
    let state = WorkspaceState::load(layout)?;
    let report = fetch::gc(layout, &state)?;
    log::info!(
        "[bootstrap:gc] removed {} file(s), {} bytes",
        report.removed_files,
        report.removed_bytes
    );
    Ok(report)
}
