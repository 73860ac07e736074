//! Version selection: which versions of a package stay in the mirror.
//!
//! A root package keeps every dist-tag target plus the newest
//! `versions_to_keep` stable releases. A dependency keeps whatever its
//! parent's retained versions declare for it, independent of its own tags.

use anyhow::Result;
use semver::Version;

use crate::error::ConfigurationError;
use crate::registry::RegistryClient;
use crate::types::{MirrorOptions, PackageInfo};

/// Versions of `name` to retain for one pass, in retention order.
///
/// With `parent` set, retention is driven by the parent's retained versions.
pub fn select_versions_to_keep(
    client: &RegistryClient,
    name: &str,
    opts: &MirrorOptions,
    parent: Option<&str>,
) -> Result<Vec<String>> {
    let scope = parent.unwrap_or(name);
    let info = client.fetch_info(scope, None)?;
    let active = client.fetch_distinct_dist_tag_versions(scope)?;
    let kept = retained_versions(&info, &active, opts.versions_to_keep)?;

    Ok(match parent {
        None => kept,
        Some(_) => dependency_requirements(&info, &kept, name),
    })
}

/// `active` (the distinct dist-tag targets of `info`) followed by the newest
/// `versions_to_keep` stable, non-active versions.
pub fn retained_versions(
    info: &PackageInfo,
    active: &[String],
    versions_to_keep: usize,
) -> Result<Vec<String>, ConfigurationError> {
    for (tag, version) in &info.dist_tags {
        if !info.versions.contains_key(version) {
            return Err(ConfigurationError::DanglingDistTag {
                name: info.name.clone(),
                tag: tag.clone(),
                version: version.clone(),
            });
        }
    }

    let mut kept = active.to_vec();
    let historical = historical_candidates(info, &kept, versions_to_keep);
    kept.extend(historical);
    Ok(kept)
}

/// Newest-first stable versions that are not already active.
///
/// Unparseable version strings are skipped rather than treated as errors.
pub fn historical_candidates(info: &PackageInfo, active: &[String], count: usize) -> Vec<String> {
    let mut candidates: Vec<(Version, &String)> = info
        .versions
        .keys()
        .filter(|v| !active.contains(v))
        .filter_map(|raw| {
            Version::parse(raw)
                .ok()
                .filter(|parsed| parsed.pre.is_empty())
                .map(|parsed| (parsed, raw))
        })
        .collect();

    candidates.sort_by(|a, b| b.0.cmp(&a.0));
    candidates
        .into_iter()
        .take(count)
        .map(|(_, raw)| raw.clone())
        .collect()
}

/// Requirement strings for `dependency` declared by `parent_versions`,
/// de-duplicated in parent order. Conflicting requirements are all kept.
pub fn dependency_requirements(
    parent: &PackageInfo,
    parent_versions: &[String],
    dependency: &str,
) -> Vec<String> {
    let mut requirements: Vec<String> = Vec::new();
    for version in parent_versions {
        let declared = parent
            .versions
            .get(version)
            .and_then(|record| record.dependencies.get(dependency));
        if let Some(requirement) = declared {
            if !requirements.contains(requirement) {
                requirements.push(requirement.clone());
            }
        }
    }
    requirements
}
