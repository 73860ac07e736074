use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::retry::RetryStrategyConfig;

/// Registry metadata for one package name, pruned to what mirroring and
/// dependency testing need. Also the on-disk shape of `info.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub name: String,
    #[serde(rename = "dist-tags", default)]
    pub dist_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub versions: BTreeMap<String, VersionRecord>,
}

impl PackageInfo {
    /// Dist-tag targets with duplicates removed, in tag-name order.
    pub fn distinct_dist_tag_versions(&self) -> Vec<String> {
        let mut seen = Vec::with_capacity(self.dist_tags.len());
        for version in self.dist_tags.values() {
            if !seen.contains(version) {
                seen.push(version.clone());
            }
        }
        seen
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub dist: Dist,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<Repository>,
    #[serde(rename = "gitHead", default, skip_serializing_if = "Option::is_none")]
    pub git_head: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dist {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tarball: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Everything one mirroring run needs, resolved from config file, CLI flags
/// and the local package manifest.
#[derive(Debug, Clone)]
pub struct MirrorOptions {
    /// Root package to mirror.
    pub module: String,
    /// Release version of the root package; names the versioned subtree.
    pub release_version: String,
    /// Registry base URL, e.g. `https://registry.npmjs.org`.
    pub registry: String,
    /// CDN base URL that mirrored tarball URLs are rewritten onto.
    pub cdn: String,
    /// CDN namespace (path prefix under the CDN base).
    pub namespace: String,
    /// Local directory holding all mirror trees.
    pub mirror_root: PathBuf,
    pub info_file: String,
    pub tarball_folder: String,
    /// Also mirror the declared dependencies of each retained root version.
    pub recursive: bool,
    /// Number of historical non-prerelease versions kept besides dist-tag targets.
    pub versions_to_keep: usize,
    /// Dist-tag the root package must carry.
    pub dist_tag: Option<String>,
    /// Also write the unversioned legacy tree.
    pub legacy_overwrite: bool,
}

/// HTTP knobs for the registry client.
#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub timeout: Duration,
    pub retry: RetryStrategyConfig,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry: RetryStrategyConfig::default(),
        }
    }
}

/// One (package, version) pair that must exist in a mirror tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleTarget {
    pub name: String,
    pub version: String,
    /// Set for dependencies; retention then follows the parent's retained versions.
    pub parent: Option<String>,
    /// Namespace used in rewritten URLs, e.g. `fake-namespace/23.44.3`.
    pub cdn_namespace: String,
    /// Directory this pass writes into, e.g. `cdn/23.44.3`.
    pub cdn_folder: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleReceipt {
    pub name: String,
    pub version: String,
    pub parent: Option<String>,
    pub cdn_folder: PathBuf,
    pub retained: Vec<String>,
    pub pruned: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorReceipt {
    pub module: String,
    pub release_version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Versioned subtrees removed before generation.
    pub removed_subtrees: Vec<String>,
    pub modules: Vec<ModuleReceipt>,
}

pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
}
