//! Bootstrap and configure a multi-repository OS build workspace.
//!
//! This crate prepares a workspace for a separate build driver. It never
//! compiles anything:
//!
//! - **Manifest** - declarative list of required artifacts (`bootstrap.toml`)
//! - **Resolver** - constraint intersection into a deterministic install plan
//! - **Fetcher** - verified, content-addressed download cache with bounded retry
//! - **Installer** - staged, atomically swapped materialization per target path
//! - **Configure** - build configuration validated against a capability table
//! - **Orchestrator** - forward-only state machine tying the above together
//!
//! # Architecture
//!
//! ```text
//! bootstrap.toml
//!     │
//!     ├── manifest::Manifest        parse + validate
//!     ├── resolver::resolve         -> InstallPlan (pure)
//!     ├── fetch::Fetcher            -> .bootstrap/cache/
//!     ├── install::Installer        -> <workspace>/<target>
//!     │       └── state::StateWriter -> .bootstrap/state.json
//!     └── configure::persist        -> .bootstrap/config.json
//!
//! orchestrator::Orchestrator drives the chain;
//! scheduler::run fans fetches and installs out to a worker pool.
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use tree_bootstrap::{BootstrapOptions, Orchestrator, WorkspaceLayout};
//!
//! let mut orch = Orchestrator::new(WorkspaceLayout::new("."));
//! let report = orch.run(&BootstrapOptions::default())?;
//! println!("{} artifact(s) installed", report.install.installed.len());
//! ```

pub mod cancel;
pub mod configure;
pub mod error;
pub mod fetch;
mod fsutil;
pub mod install;
pub mod layout;
pub mod manifest;
pub mod orchestrator;
pub mod preflight;
pub mod resolver;
pub mod scheduler;
pub mod state;

pub use cancel::CancelToken;
pub use configure::{BuildConfig, ConfigOptions};
pub use error::{Error, Result};
pub use layout::WorkspaceLayout;
pub use manifest::Manifest;
pub use orchestrator::{BootstrapOptions, BootstrapReport, Orchestrator, Stage};
pub use resolver::{resolve, InstallPlan, ResolvedArtifact};
pub use state::WorkspaceState;
