use std::cmp::Ordering;
use std::fmt;

use semver::{Version, VersionReq};

/// Version constraint declared by one manifest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionConstraint {
    /// Full semantic version pin, e.g. `1.2.0`.
    Exact(Version),
    /// Opaque release tag, e.g. `v8.x-binary`. Matches only itself.
    Tag(String),
    /// Semantic range, e.g. `>=3.0, <4.0`.
    Range(VersionReq),
}

impl VersionConstraint {
    /// Classify and parse a raw constraint string.
    ///
    /// A full semantic version is a pin, anything carrying a comparison
    /// operator, wildcard or comma is a range, and the rest is a tag.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("version constraint must not be empty".to_string());
        }
        if let Ok(v) = Version::parse(raw) {
            return Ok(Self::Exact(v));
        }
        if raw.contains(&['<', '>', '=', '~', '^', '*', ','][..]) {
            return VersionReq::parse(raw)
                .map(Self::Range)
                .map_err(|e| format!("invalid version range '{raw}': {e}"));
        }
        if raw.chars().any(|c| c.is_whitespace() || c == '/' || c == '\\') {
            return Err(format!(
                "version tag '{raw}' must not contain whitespace or path separators"
            ));
        }
        Ok(Self::Tag(raw.to_string()))
    }

    pub fn is_range(&self) -> bool {
        matches!(self, Self::Range(_))
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(v) => write!(f, "={v}"),
            Self::Tag(t) => write!(f, "tag {t}"),
            Self::Range(r) => write!(f, "{r}"),
        }
    }
}

/// Total order over version strings used to pick the highest candidate.
///
/// Semantic versions compare by semver precedence and sort above
/// non-semantic strings; non-semantic strings compare lexicographically.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (Version::parse(a), Version::parse(b)) {
        (Ok(va), Ok(vb)) => va.cmp(&vb).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Greater,
        (Err(_), Ok(_)) => Ordering::Less,
        (Err(_), Err(_)) => a.cmp(b),
    }
}
