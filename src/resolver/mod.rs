//! Dependency resolution: manifest specs to a concrete, ordered install plan.
//!
//! Resolution is pure. It reads only the specs and the release catalog, so
//! the same manifest always produces the same [`InstallPlan`]:
//!
//! 1. group specs by logical name;
//! 2. intersect each group's constraints and pick the highest satisfying
//!    version (an empty intersection is an error, never a fallback);
//! 3. reconcile declared digests for the chosen version;
//! 4. order names topologically along `requires` edges, ties broken by
//!    manifest order.

use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::fsutil::sha256_hex;
use crate::manifest::{
    compare_versions, group_by_name, ArtifactFormat, ArtifactSpec, Release, VersionConstraint,
};

/// One manifest artifact bound to a concrete version and cache location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedArtifact {
    pub name: String,
    pub version: String,
    /// Source URI with `{version}` / `{name}` substituted.
    pub source: String,
    pub target: PathBuf,
    pub format: ArtifactFormat,
    pub sha256: Option<String>,
    /// Where the fetcher stores the artifact.
    pub cache_path: PathBuf,
    /// File name used when the artifact is a single file.
    pub file_name: String,
    pub requires: Vec<String>,
}

/// Ordered, read-only install plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    entries: Vec<ResolvedArtifact>,
}

impl InstallPlan {
    pub fn entries(&self) -> &[ResolvedArtifact] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// For each entry, the indices of entries that must complete first.
    ///
    /// Edges come from `requires`; entries sharing a name are additionally
    /// chained in plan order so their installs never overlap.
    pub fn dependency_edges(&self) -> Vec<Vec<usize>> {
        let mut by_name: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (i, entry) in self.entries.iter().enumerate() {
            by_name.entry(entry.name.as_str()).or_default().push(i);
        }

        self.entries
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let mut deps = BTreeSet::new();
                for req in &entry.requires {
                    if let Some(indices) = by_name.get(req.as_str()) {
                        deps.extend(indices.iter().copied().filter(|j| *j < i));
                    }
                }
                if let Some(prev) = by_name
                    .get(entry.name.as_str())
                    .and_then(|same| same.iter().copied().filter(|j| *j < i).max())
                {
                    deps.insert(prev);
                }
                deps.into_iter().collect()
            })
            .collect()
    }
}

/// Resolve `specs` against the `releases` catalog.
///
/// `cache_dir` only determines the cache paths recorded in the plan; nothing
/// is read from or written to it.
pub fn resolve(
    specs: &[ArtifactSpec],
    releases: &[Release],
    cache_dir: &Path,
) -> Result<InstallPlan> {
    let groups = group_by_name(specs);

    let mut chosen: BTreeMap<String, Choice> = BTreeMap::new();
    for (name, members) in &groups {
        let catalog: Vec<&Release> = releases.iter().filter(|r| &r.name == name).collect();
        let choice = select_version(name, members, &catalog)?;
        log::debug!("[resolve] {name} -> {}", choice.version);
        chosen.insert(name.clone(), choice);
    }

    let order = topological_order(&groups)?;

    let mut entries = Vec::with_capacity(specs.len());
    for name in order {
        let Some((_, members)) = groups.iter().find(|(n, _)| *n == name) else {
            continue;
        };
        let Some(choice) = chosen.get(&name) else {
            continue;
        };
        for spec in members {
            entries.push(bind(spec, choice, cache_dir));
        }
    }

    Ok(InstallPlan { entries })
}

#[derive(Debug, Clone)]
struct Choice {
    version: String,
    sha256: Option<String>,
}

fn describe(spec: &ArtifactSpec) -> String {
    format!("{} (target '{}')", spec.version, spec.target.display())
}

fn select_version(name: &str, members: &[&ArtifactSpec], catalog: &[&Release]) -> Result<Choice> {
    let mut pins: Vec<(&ArtifactSpec, String)> = Vec::new();
    let mut ranges = Vec::new();
    for &spec in members {
        match &spec.version {
            VersionConstraint::Exact(v) => pins.push((spec, v.to_string())),
            VersionConstraint::Tag(t) => pins.push((spec, t.clone())),
            VersionConstraint::Range(req) => ranges.push((spec, req)),
        }
    }

    let distinct: BTreeSet<&str> = pins.iter().map(|(_, v)| v.as_str()).collect();
    if distinct.len() > 1 {
        let listed = pins
            .iter()
            .map(|(spec, _)| describe(spec))
            .collect::<Vec<_>>()
            .join(" vs ");
        return Err(Error::resolution(
            name,
            format!("conflicting pins {listed}; align the manifest entries on one version"),
        ));
    }

    let (version, release) = if let Some((pin_spec, pinned)) = pins.first() {
        match &pin_spec.version {
            VersionConstraint::Exact(v) => {
                for (spec, req) in &ranges {
                    if !req.matches(v) {
                        return Err(Error::resolution(
                            name,
                            format!(
                                "pin {} does not satisfy {}; the constraints do not intersect",
                                describe(pin_spec),
                                describe(spec)
                            ),
                        ));
                    }
                }
            }
            _ => {
                if let Some((spec, _)) = ranges.first() {
                    return Err(Error::resolution(
                        name,
                        format!(
                            "tag {} cannot satisfy semantic range {}",
                            describe(pin_spec),
                            describe(spec)
                        ),
                    ));
                }
            }
        }
        let release = catalog
            .iter()
            .copied()
            .find(|r| same_version(&r.version, pinned));
        (pinned.clone(), release)
    } else {
        let mut candidates: Vec<&Release> = catalog
            .iter()
            .copied()
            .filter(|r| match Version::parse(&r.version) {
                Ok(v) => ranges.iter().all(|(_, req)| req.matches(&v)),
                Err(_) => false,
            })
            .collect();
        candidates.sort_by(|a, b| compare_versions(&a.version, &b.version));
        let Some(best) = candidates.last().copied() else {
            let wanted = ranges
                .iter()
                .map(|(spec, _)| describe(spec))
                .collect::<Vec<_>>()
                .join(" and ");
            let mut known: Vec<&str> = catalog.iter().map(|r| r.version.as_str()).collect();
            known.sort_by(|a, b| compare_versions(a, b));
            let known = if known.is_empty() {
                "none".to_string()
            } else {
                known.join(", ")
            };
            return Err(Error::resolution(
                name,
                format!(
                    "no release satisfies {wanted}; known releases: {known}. \
                     Add a matching [[release]] entry or widen the constraint"
                ),
            ));
        };
        (best.version.clone(), Some(best))
    };

    let sha256 = reconcile_digest(name, &version, members, release)?;
    Ok(Choice { version, sha256 })
}

fn same_version(a: &str, b: &str) -> bool {
    match (Version::parse(a), Version::parse(b)) {
        (Ok(va), Ok(vb)) => va == vb,
        _ => a == b,
    }
}

fn reconcile_digest(
    name: &str,
    version: &str,
    members: &[&ArtifactSpec],
    release: Option<&Release>,
) -> Result<Option<String>> {
    let mut declared: Vec<(String, &str)> = Vec::new();
    if let Some(sha) = release.and_then(|r| r.sha256.as_deref()) {
        declared.push((format!("release {version}"), sha));
    }
    for spec in members {
        if let Some(sha) = spec.sha256.as_deref() {
            declared.push((format!("target '{}'", spec.target.display()), sha));
        }
    }

    let Some((_, first)) = declared.first() else {
        return Ok(None);
    };
    if let Some((origin, other)) = declared.iter().find(|(_, sha)| sha != first) {
        return Err(Error::resolution(
            name,
            format!(
                "conflicting sha256 for {name}@{version}: \
                 {} declares {first}, {origin} declares {other}",
                declared[0].0
            ),
        ));
    }
    Ok(Some(first.to_string()))
}

/// Kahn's algorithm over names; ready names are taken in manifest order.
fn topological_order(groups: &[(String, Vec<&ArtifactSpec>)]) -> Result<Vec<String>> {
    let index: BTreeMap<&str, usize> = groups
        .iter()
        .enumerate()
        .map(|(i, (n, _))| (n.as_str(), i))
        .collect();

    let mut deps: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); groups.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); groups.len()];
    for (i, (name, members)) in groups.iter().enumerate() {
        for spec in members {
            for req in &spec.requires {
                let Some(&j) = index.get(req.as_str()) else {
                    return Err(Error::resolution(
                        name.clone(),
                        format!("requires unknown artifact '{req}'"),
                    ));
                };
                if deps[i].insert(j) {
                    dependents[j].push(i);
                }
            }
        }
    }

    let mut remaining: Vec<usize> = deps.iter().map(BTreeSet::len).collect();
    let mut ready: BTreeSet<usize> = (0..groups.len()).filter(|i| remaining[*i] == 0).collect();
    let mut order = Vec::with_capacity(groups.len());

    while let Some(i) = ready.pop_first() {
        order.push(groups[i].0.clone());
        for &d in &dependents[i] {
            remaining[d] -= 1;
            if remaining[d] == 0 {
                ready.insert(d);
            }
        }
    }

    if order.len() < groups.len() {
        let cycle = find_cycle(&deps, &remaining);
        let path = cycle
            .iter()
            .map(|i| groups[*i].0.as_str())
            .collect::<Vec<_>>()
            .join(" -> ");
        let first = cycle
            .first()
            .map(|i| groups[*i].0.clone())
            .unwrap_or_default();
        return Err(Error::resolution(
            first,
            format!("dependency cycle {path}; remove one of the `requires` edges"),
        ));
    }

    Ok(order)
}

/// Every unprocessed node still waits on an unprocessed dependency, so
/// following those edges must revisit a node.
fn find_cycle(deps: &[BTreeSet<usize>], remaining: &[usize]) -> Vec<usize> {
    let Some(start) = (0..deps.len()).find(|i| remaining[*i] > 0) else {
        return Vec::new();
    };
    let mut path = vec![start];
    let mut current = start;
    loop {
        let Some(next) = deps[current].iter().copied().find(|d| remaining[*d] > 0) else {
            return path;
        };
        if let Some(pos) = path.iter().position(|p| *p == next) {
            let mut cycle = path.split_off(pos);
            cycle.push(next);
            return cycle;
        }
        path.push(next);
        current = next;
    }
}

fn bind(spec: &ArtifactSpec, choice: &Choice, cache_dir: &Path) -> ResolvedArtifact {
    let source = spec
        .source
        .replace("{version}", &choice.version)
        .replace("{name}", &spec.name);
    let file_name = file_name_of(&source);
    let cache_path = match &choice.sha256 {
        Some(sha) => cache_dir.join("sha256").join(&sha[..2]).join(sha),
        None => cache_dir
            .join("named")
            .join(format!("{}-{}", spec.name, sanitize(&choice.version)))
            .join(&sha256_hex(source.as_bytes())[..16])
            .join(&file_name),
    };

    ResolvedArtifact {
        name: spec.name.clone(),
        version: choice.version.clone(),
        source,
        target: spec.target.clone(),
        format: spec.format,
        sha256: choice.sha256.clone(),
        cache_path,
        file_name,
        requires: spec.requires.clone(),
    }
}

fn file_name_of(source: &str) -> String {
    let trimmed = source
        .split(&['?', '#'][..])
        .next()
        .unwrap_or(source)
        .trim_end_matches('/');
    let last = trimmed.rsplit('/').next().unwrap_or("");
    let clean = sanitize(last);
    if clean.is_empty() || clean.chars().all(|c| c == '.') {
        "artifact".to_string()
    } else {
        clean
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
