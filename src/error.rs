//! Error taxonomy shared by every bootstrap stage.
//!
//! Each variant names the artifact, field or path involved and tells the
//! operator what to do next. [`Error::exit_code`] maps a failure to the
//! stage-specific process exit code so calling scripts can branch.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exit code when the manifest is missing or malformed.
pub const EXIT_MANIFEST: u8 = 10;
/// Exit code for unsatisfiable constraints or dependency cycles.
pub const EXIT_RESOLUTION: u8 = 11;
/// Exit code for transport failures and digest mismatches.
pub const EXIT_FETCH: u8 = 12;
/// Exit code for materialization failures.
pub const EXIT_INSTALL: u8 = 13;
/// Exit code when the state record disagrees with the filesystem.
pub const EXIT_STATE: u8 = 14;
/// Exit code when required host tools are missing.
pub const EXIT_HOST_TOOLS: u8 = 15;
/// Exit code for rejected configuration options.
pub const EXIT_CONFIG: u8 = 20;
/// Exit code after a user-initiated abort.
pub const EXIT_CANCELLED: u8 = 130;

#[derive(Debug, Error)]
pub enum Error {
    #[error("manifest {}: {message}; fix the manifest entry and re-run", .path.display())]
    Manifest { path: PathBuf, message: String },

    #[error("cannot resolve '{name}': {message}")]
    Resolution { name: String, message: String },

    #[error(
        "integrity check failed for {uri} after {attempts} attempt(s)\n  \
         expected: {expected}\n  actual:   {actual}\n\
         verify the sha256 in the manifest against the upstream release"
    )]
    Integrity {
        uri: String,
        expected: String,
        actual: String,
        attempts: u32,
    },

    #[error("fetching {uri} failed after {attempts} attempt(s): {message}")]
    Fetch {
        uri: String,
        attempts: u32,
        message: String,
    },

    #[error(
        "installing '{artifact}' into {} failed: {source:#}\n\
         workspace state was left unchanged for '{artifact}'; re-run bootstrap to retry",
        .target.display()
    )]
    Install {
        artifact: String,
        target: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid configuration option `{field}`: {message}")]
    Config { field: String, message: String },

    #[error("configuration exists at {}; pass --overwrite to replace it", .0.display())]
    ConfigExists(PathBuf),

    #[error(
        "workspace state disagrees with the filesystem:\n{}\n\
         re-run with --force to reinstall the affected artifacts",
        .divergences.iter().map(|d| format!("  {d}")).collect::<Vec<_>>().join("\n")
    )]
    StateInconsistency { divergences: Vec<String> },

    #[error("missing required host tools:\n{0}")]
    MissingHostTools(String),

    #[error("cancelled during {stage}; completed work was committed, re-run to resume")]
    Cancelled { stage: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn resolution(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Resolution {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Process exit code for the stage this error belongs to.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Manifest { .. } => EXIT_MANIFEST,
            Error::Resolution { .. } => EXIT_RESOLUTION,
            Error::Integrity { .. } | Error::Fetch { .. } => EXIT_FETCH,
            Error::Install { .. } => EXIT_INSTALL,
            Error::StateInconsistency { .. } => EXIT_STATE,
            Error::MissingHostTools(_) => EXIT_HOST_TOOLS,
            Error::Config { .. } | Error::ConfigExists(_) => EXIT_CONFIG,
            Error::Cancelled { .. } => EXIT_CANCELLED,
            Error::Io { .. } => 1,
        }
    }
}
