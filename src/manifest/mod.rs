//! Declarative manifest of required artifacts.
//!
//! The manifest is a TOML file (default `bootstrap.toml` at the workspace
//! root) listing `[[artifact]]` entries, an optional `[[release]]` catalog of
//! known versions, and optional `[fetch]` / `[install]` tuning tables.
//! Every table rejects unknown keys; each violation names the offending entry.

mod constraint;

pub use constraint::{compare_versions, VersionConstraint};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::fsutil::is_hex_64;
use crate::layout::{MANIFEST_FILE, STATE_DIR};

/// How a fetched artifact is materialized at its target path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactFormat {
    /// A single file placed inside the target directory.
    File,
    /// An uncompressed tar archive unpacked into the target directory.
    Tar,
    /// A zstd-compressed tar archive unpacked into the target directory.
    TarZst,
}

impl ArtifactFormat {
    /// Infer the format from the source file name.
    pub fn from_source(source: &str) -> Self {
        let lower = source.to_ascii_lowercase();
        if lower.ends_with(".tar.zst") || lower.ends_with(".tzst") {
            Self::TarZst
        } else if lower.ends_with(".tar") {
            Self::Tar
        } else {
            Self::File
        }
    }
}

/// One required artifact, immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSpec {
    pub name: String,
    /// Source URI; `{version}` and `{name}` are substituted at resolution.
    pub source: String,
    pub version: VersionConstraint,
    /// Path relative to the workspace root.
    pub target: PathBuf,
    pub format: ArtifactFormat,
    pub sha256: Option<String>,
    /// Names of artifacts that must be installed first.
    pub requires: Vec<String>,
}

/// A known release of an artifact, used to resolve ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub name: String,
    pub version: String,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSettings {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub timeout: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(4),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSettings {
    pub workers: usize,
    /// `(command, package)` pairs checked by preflight.
    pub host_tools: Vec<(String, String)>,
}

/// Host tools a fresh workspace needs when the manifest does not say.
pub const DEFAULT_HOST_TOOLS: &[(&str, &str)] =
    &[("xorriso", "xorriso"), ("nasm", "nasm"), ("clang", "clang")];

impl Default for InstallSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            host_tools: DEFAULT_HOST_TOOLS
                .iter()
                .map(|(c, p)| (c.to_string(), p.to_string()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Manifest {
    pub path: PathBuf,
    pub artifacts: Vec<ArtifactSpec>,
    pub releases: Vec<Release>,
    pub fetch: FetchSettings,
    pub install: InstallSettings,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestToml {
    #[serde(default)]
    fetch: Option<FetchToml>,
    #[serde(default)]
    install: Option<InstallToml>,
    #[serde(default)]
    artifact: Vec<ArtifactToml>,
    #[serde(default)]
    release: Vec<ReleaseToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FetchToml {
    max_attempts: Option<u32>,
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InstallToml {
    workers: Option<usize>,
    host_tools: Option<Vec<(String, String)>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ArtifactToml {
    name: String,
    source: String,
    version: String,
    target: String,
    format: Option<ArtifactFormat>,
    sha256: Option<String>,
    #[serde(default)]
    requires: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReleaseToml {
    name: String,
    version: String,
    sha256: Option<String>,
}

impl Manifest {
    /// Load and validate the manifest at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::Manifest {
            path: path.to_path_buf(),
            message: format!("cannot read manifest: {e}"),
        })?;
        Self::from_toml_str(&text, path)
    }

    /// Parse and validate manifest text; `path` is used for error messages.
    pub fn from_toml_str(text: &str, path: &Path) -> Result<Self> {
        let fail = |message: String| Error::Manifest {
            path: path.to_path_buf(),
            message,
        };

        let parsed: ManifestToml =
            toml::from_str(text).map_err(|e| fail(format!("parse error: {e}")))?;

        if parsed.artifact.is_empty() {
            return Err(fail("no [[artifact]] entries declared".to_string()));
        }

        let fetch = parse_fetch(parsed.fetch).map_err(fail)?;
        let install = parse_install(parsed.install).map_err(fail)?;

        let mut artifacts = Vec::with_capacity(parsed.artifact.len());
        for (index, raw) in parsed.artifact.into_iter().enumerate() {
            let label = format!("artifact #{} ('{}')", index + 1, raw.name);
            let spec = parse_artifact(raw).map_err(|m| fail(format!("{label}: {m}")))?;
            artifacts.push(spec);
        }
        validate_targets(&artifacts).map_err(fail)?;
        validate_requires(&artifacts).map_err(fail)?;

        let mut releases = Vec::with_capacity(parsed.release.len());
        let mut seen = BTreeSet::new();
        for (index, raw) in parsed.release.into_iter().enumerate() {
            let label = format!("release #{} ('{}')", index + 1, raw.name);
            validate_name(&raw.name).map_err(|m| fail(format!("{label}: {m}")))?;
            let version = raw.version.trim().to_string();
            if version.is_empty() {
                return Err(fail(format!("{label}: version must not be empty")));
            }
            if !seen.insert((raw.name.clone(), version.clone())) {
                return Err(fail(format!(
                    "{label}: duplicate release {}@{}",
                    raw.name, version
                )));
            }
            let sha256 = raw
                .sha256
                .map(|s| normalize_digest(&s))
                .transpose()
                .map_err(|m| fail(format!("{label}: {m}")))?;
            if !artifacts.iter().any(|a| a.name == raw.name) {
                log::warn!("[manifest] {label} does not match any artifact and is ignored");
            }
            releases.push(Release {
                name: raw.name,
                version,
                sha256,
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            artifacts,
            releases,
            fetch,
            install,
        })
    }
}

fn parse_fetch(raw: Option<FetchToml>) -> std::result::Result<FetchSettings, String> {
    let mut settings = FetchSettings::default();
    let Some(raw) = raw else {
        return Ok(settings);
    };
    if let Some(n) = raw.max_attempts {
        if n == 0 {
            return Err("[fetch].max_attempts must be >= 1".to_string());
        }
        settings.max_attempts = n;
    }
    if let Some(ms) = raw.initial_backoff_ms {
        settings.initial_backoff = Duration::from_millis(ms);
    }
    if let Some(ms) = raw.max_backoff_ms {
        settings.max_backoff = Duration::from_millis(ms);
    }
    if settings.max_backoff < settings.initial_backoff {
        return Err("[fetch].max_backoff_ms must be >= initial_backoff_ms".to_string());
    }
    if let Some(secs) = raw.timeout_secs {
        if secs == 0 {
            return Err("[fetch].timeout_secs must be >= 1".to_string());
        }
        settings.timeout = Duration::from_secs(secs);
    }
    Ok(settings)
}

fn parse_install(raw: Option<InstallToml>) -> std::result::Result<InstallSettings, String> {
    let mut settings = InstallSettings::default();
    let Some(raw) = raw else {
        return Ok(settings);
    };
    if let Some(workers) = raw.workers {
        if workers == 0 {
            return Err("[install].workers must be >= 1".to_string());
        }
        settings.workers = workers;
    }
    if let Some(tools) = raw.host_tools {
        for (cmd, _) in &tools {
            if cmd.trim().is_empty() {
                return Err("[install].host_tools entries need a command name".to_string());
            }
        }
        settings.host_tools = tools;
    }
    Ok(settings)
}

fn parse_artifact(raw: ArtifactToml) -> std::result::Result<ArtifactSpec, String> {
    validate_name(&raw.name)?;

    let source = raw.source.trim().to_string();
    if source.is_empty() {
        return Err("source must not be empty".to_string());
    }

    let version = VersionConstraint::parse(&raw.version)?;
    let target = parse_relative_path(&raw.target, "target")?;
    let format = raw
        .format
        .unwrap_or_else(|| ArtifactFormat::from_source(&source));
    let sha256 = raw.sha256.as_deref().map(normalize_digest).transpose()?;

    let mut requires = Vec::with_capacity(raw.requires.len());
    for dep in raw.requires {
        validate_name(&dep).map_err(|m| format!("requires: {m}"))?;
        if !requires.contains(&dep) {
            requires.push(dep);
        }
    }

    Ok(ArtifactSpec {
        name: raw.name,
        source,
        version,
        target,
        format,
        sha256,
        requires,
    })
}

fn validate_name(name: &str) -> std::result::Result<(), String> {
    let mut chars = name.chars();
    let valid_first = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !valid_first || !valid_rest || name.contains("..") {
        return Err(format!(
            "invalid name '{name}' (expected [A-Za-z0-9][A-Za-z0-9._-]*)"
        ));
    }
    Ok(())
}

fn normalize_digest(raw: &str) -> std::result::Result<String, String> {
    let digest = raw.trim().to_ascii_lowercase();
    if !is_hex_64(&digest) {
        return Err(format!("sha256 '{raw}' is not 64 hex characters"));
    }
    Ok(digest)
}

fn parse_relative_path(raw: &str, field: &str) -> std::result::Result<PathBuf, String> {
    let candidate = Path::new(raw.trim());
    if candidate.as_os_str().is_empty() {
        return Err(format!("{field} must not be empty"));
    }
    if candidate.is_absolute() {
        return Err(format!("{field} must be relative, got absolute path '{raw}'"));
    }
    let mut clean = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(format!(
                    "{field} contains invalid traversal/root component in '{raw}'"
                ));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(format!("{field} must name a path below the workspace root"));
    }
    if clean.starts_with(STATE_DIR) {
        return Err(format!("{field} must not point into {STATE_DIR}/"));
    }
    if clean == Path::new(MANIFEST_FILE) {
        return Err(format!("{field} must not replace the manifest {MANIFEST_FILE}"));
    }
    Ok(clean)
}

fn validate_targets(artifacts: &[ArtifactSpec]) -> std::result::Result<(), String> {
    for (i, a) in artifacts.iter().enumerate() {
        for b in &artifacts[i + 1..] {
            if a.target == b.target {
                return Err(format!(
                    "artifacts '{}' and '{}' share target '{}'",
                    a.name,
                    b.name,
                    a.target.display()
                ));
            }
            if a.target.starts_with(&b.target) || b.target.starts_with(&a.target) {
                return Err(format!(
                    "targets '{}' ({}) and '{}' ({}) are nested",
                    a.target.display(),
                    a.name,
                    b.target.display(),
                    b.name
                ));
            }
        }
    }
    Ok(())
}

fn validate_requires(artifacts: &[ArtifactSpec]) -> std::result::Result<(), String> {
    let names: BTreeSet<&str> = artifacts.iter().map(|a| a.name.as_str()).collect();
    for spec in artifacts {
        for dep in &spec.requires {
            if !names.contains(dep.as_str()) {
                return Err(format!(
                    "artifact '{}' requires unknown artifact '{}'",
                    spec.name, dep
                ));
            }
        }
    }
    Ok(())
}

/// Group specs by logical name, preserving first-appearance order.
pub fn group_by_name(specs: &[ArtifactSpec]) -> Vec<(String, Vec<&ArtifactSpec>)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: BTreeMap<String, Vec<&ArtifactSpec>> = BTreeMap::new();
    for spec in specs {
        groups
            .entry(spec.name.clone())
            .or_insert_with(|| {
                order.push(spec.name.clone());
                Vec::new()
            })
            .push(spec);
    }
    order
        .into_iter()
        .map(|name| {
            let members = groups.remove(&name).unwrap_or_default();
            (name, members)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[fetch]
max_attempts = 2
initial_backoff_ms = 0
max_backoff_ms = 0

[install]
workers = 2
host_tools = [["sh", "coreutils"]]

[[artifact]]
name = "bootloader"
source = "https://example.org/bootloader-{version}.tar.zst"
version = "1.2.0"
target = "bootloader"

[[artifact]]
name = "toolchain"
source = "https://example.org/toolchain-{version}.tar"
version = ">=3.0, <4.0"
target = "toolchain"
requires = ["bootloader"]

[[release]]
name = "toolchain"
version = "3.4.1"
"#;

    fn load(text: &str) -> Result<Manifest> {
        Manifest::from_toml_str(text, Path::new("bootstrap.toml"))
    }

    fn manifest_message(err: Error) -> String {
        match err {
            Error::Manifest { message, .. } => message,
            other => panic!("expected manifest error, got {other}"),
        }
    }

    #[test]
    fn parses_sample_manifest() {
        let m = load(SAMPLE).unwrap();
        assert_eq!(m.artifacts.len(), 2);
        assert_eq!(m.fetch.max_attempts, 2);
        assert_eq!(m.install.workers, 2);
        assert_eq!(m.install.host_tools, vec![("sh".into(), "coreutils".into())]);

        let boot = &m.artifacts[0];
        assert_eq!(boot.format, ArtifactFormat::TarZst);
        assert!(!boot.version.is_range());

        let tc = &m.artifacts[1];
        assert_eq!(tc.format, ArtifactFormat::Tar);
        assert!(tc.version.is_range());
        assert_eq!(tc.requires, vec!["bootloader".to_string()]);
        assert_eq!(m.releases.len(), 1);
    }

    #[test]
    fn defaults_apply_without_tuning_tables() {
        let m = load(
            r#"
[[artifact]]
name = "x"
source = "file:///tmp/x"
version = "1.0.0"
target = "x"
"#,
        )
        .unwrap();
        assert_eq!(m.fetch, FetchSettings::default());
        assert_eq!(m.install.workers, 4);
        assert_eq!(m.artifacts[0].format, ArtifactFormat::File);
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = load(
            r#"
[[artifact]]
name = "x"
source = "file:///tmp/x"
version = "1.0.0"
target = "x"
colour = "blue"
"#,
        )
        .unwrap_err();
        assert!(manifest_message(err).contains("colour"));
    }

    #[test]
    fn rejects_escaping_target_and_names_entry() {
        let err = load(
            r#"
[[artifact]]
name = "evil"
source = "file:///tmp/x"
version = "1.0.0"
target = "../outside"
"#,
        )
        .unwrap_err();
        let msg = manifest_message(err);
        assert!(msg.contains("artifact #1 ('evil')"), "{msg}");
        assert!(msg.contains("traversal"), "{msg}");
    }

    #[test]
    fn rejects_targets_inside_bookkeeping_dir() {
        let err = load(
            r#"
[[artifact]]
name = "x"
source = "file:///tmp/x"
version = "1.0.0"
target = ".bootstrap/cache"
"#,
        )
        .unwrap_err();
        assert!(manifest_message(err).contains(".bootstrap"));
    }

    #[test]
    fn rejects_manifest_as_target() {
        for target in ["bootstrap.toml", "./bootstrap.toml"] {
            let err = load(&format!(
                r#"
[[artifact]]
name = "x"
source = "file:///tmp/x"
version = "1.0.0"
target = "{target}"
"#
            ))
            .unwrap_err();
            assert!(manifest_message(err).contains("manifest"), "{target}");
        }
    }

    #[test]
    fn rejects_bad_digest() {
        let err = load(
            r#"
[[artifact]]
name = "x"
source = "file:///tmp/x"
version = "1.0.0"
target = "x"
sha256 = "abc"
"#,
        )
        .unwrap_err();
        assert!(manifest_message(err).contains("64 hex"));
    }

    #[test]
    fn rejects_nested_targets() {
        let err = load(
            r#"
[[artifact]]
name = "a"
source = "file:///tmp/a"
version = "1.0.0"
target = "src"

[[artifact]]
name = "b"
source = "file:///tmp/b"
version = "1.0.0"
target = "src/b"
"#,
        )
        .unwrap_err();
        assert!(manifest_message(err).contains("nested"));
    }

    #[test]
    fn rejects_unknown_requirement() {
        let err = load(
            r#"
[[artifact]]
name = "a"
source = "file:///tmp/a"
version = "1.0.0"
target = "a"
requires = ["ghost"]
"#,
        )
        .unwrap_err();
        assert!(manifest_message(err).contains("ghost"));
    }

    #[test]
    fn rejects_empty_manifest() {
        assert!(load("").is_err());
    }

    #[test]
    fn missing_file_is_a_manifest_error() {
        let err = Manifest::load(Path::new("/definitely/not/here/bootstrap.toml")).unwrap_err();
        assert!(matches!(err, Error::Manifest { .. }));
    }

    #[test]
    fn groups_preserve_first_appearance() {
        let m = load(
            r#"
[[artifact]]
name = "b"
source = "file:///tmp/b"
version = "1.0.0"
target = "b1"

[[artifact]]
name = "a"
source = "file:///tmp/a"
version = "1.0.0"
target = "a"

[[artifact]]
name = "b"
source = "file:///tmp/b"
version = ">=1.0"
target = "b2"
"#,
        )
        .unwrap();
        let groups = group_by_name(&m.artifacts);
        let names: Vec<&str> = groups.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(groups[0].1.len(), 2);
    }
}
