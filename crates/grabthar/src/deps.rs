//! `package-lock.json` graph helpers: flattening, version diffs and
//! dependent lookup for dependency testing, plus the flat-lockfile check.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::LockfileError;

/// The lockfile subset the dependency checks read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageLock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, LockedDependency>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedDependency {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub dev: bool,
    #[serde(default)]
    pub requires: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<BTreeMap<String, LockedDependency>>,
}

impl PackageLock {
    pub fn from_json(source_name: &str, body: &str) -> Result<Self, LockfileError> {
        serde_json::from_str(body).map_err(|e| LockfileError::Malformed {
            source_name: source_name.to_string(),
            message: e.to_string(),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read lockfile {}", path.display()))?;
        Ok(Self::from_json(&path.display().to_string(), &body)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionChange {
    pub existing: String,
    pub candidate: String,
}

/// Result of comparing two lockfiles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyReport {
    pub changes: BTreeMap<String, VersionChange>,
    /// Modules of the existing lockfile that require a changed dependency.
    pub dependents: BTreeMap<String, BTreeSet<String>>,
}

/// Name to locked version for every non-dev dependency.
pub fn flatten(lock: &PackageLock) -> BTreeMap<String, String> {
    lock.dependencies
        .iter()
        .filter(|(_, dep)| !dep.dev)
        .map(|(name, dep)| (name.clone(), dep.version.clone()))
        .collect()
}

/// Dependencies present in both lockfiles whose version changed.
pub fn diff(existing: &PackageLock, candidate: &PackageLock) -> BTreeMap<String, VersionChange> {
    let existing = flatten(existing);
    flatten(candidate)
        .into_iter()
        .filter_map(|(name, candidate)| {
            let old = existing.get(&name)?;
            (!old.is_empty() && *old != candidate).then(|| {
                let change = VersionChange {
                    existing: old.clone(),
                    candidate,
                };
                (name, change)
            })
        })
        .collect()
}

/// Modules whose `requires` names any of `changed`, with the names they require.
pub fn find_dependents<'a>(
    lock: &PackageLock,
    changed: impl IntoIterator<Item = &'a str>,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut dependents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for dependency in changed {
        for (module, locked) in &lock.dependencies {
            if locked.requires.contains_key(dependency) {
                dependents
                    .entry(module.clone())
                    .or_default()
                    .insert(dependency.to_string());
            }
        }
    }
    dependents
}

pub fn dependency_report(existing: &PackageLock, candidate: &PackageLock) -> DependencyReport {
    if existing == candidate {
        return DependencyReport::default();
    }
    let changes = diff(existing, candidate);
    let dependents = find_dependents(existing, changes.keys().map(String::as_str));
    DependencyReport {
        changes,
        dependents,
    }
}

/// Fail on the first non-dev dependency that still nests its own dependencies.
pub fn ensure_flat(lock: &PackageLock) -> Result<(), LockfileError> {
    for (name, dep) in &lock.dependencies {
        if dep.dev {
            continue;
        }
        if let Some(nested) = &dep.dependencies {
            return Err(LockfileError::Unflattened {
                name: name.clone(),
                nested: nested.keys().cloned().collect(),
            });
        }
    }
    Ok(())
}
