//! npm-style registry client.
//!
//! Fetches packuments from `{registry}/{name}`, normalizes them into
//! [`PackageInfo`], and caches one result per package name for the lifetime
//! of the client. Concurrent lookups of the same name share a single request.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::error::RegistryError;
use crate::mirror::{is_safe_package_name, is_safe_version};
use crate::retry::{RetryStrategyConfig, retry_with_backoff};
use crate::types::{Dist, HttpOptions, PackageInfo, Repository, VersionRecord};

/// Default registry used when none is configured.
pub const NPM_REGISTRY: &str = "https://registry.npmjs.org";

/// Default user agent for registry requests
pub const USER_AGENT: &str = concat!("grabthar/", env!("CARGO_PKG_VERSION"));

type CachedInfo = Result<Arc<PackageInfo>, RegistryError>;

#[derive(Debug, Default)]
struct InfoCache {
    slots: Mutex<HashMap<String, Arc<OnceLock<CachedInfo>>>>,
}

impl InfoCache {
    fn slot(&self, name: &str) -> Arc<OnceLock<CachedInfo>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(name.to_string()).or_default())
    }

    fn clear(&self) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[derive(Debug, Clone)]
pub struct RegistryClient {
    base_url: String,
    http: Client,
    retry: RetryStrategyConfig,
    cache: Arc<InfoCache>,
}

impl RegistryClient {
    pub fn new(base_url: &str, options: &HttpOptions) -> Result<Self> {
        let http = Client::builder()
            .timeout(options.timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            retry: options.retry.clone(),
            cache: Arc::default(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Forget every cached packument. Clones of this client share the cache.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Number of package names looked up since the last reset.
    pub fn cached_packages(&self) -> usize {
        self.cache.len()
    }

    /// Fetch (or reuse) the normalized registry info for `name`.
    ///
    /// When `expected_dist_tag` is given, the package must carry that tag.
    pub fn fetch_info(&self, name: &str, expected_dist_tag: Option<&str>) -> Result<Arc<PackageInfo>> {
        let slot = self.cache.slot(name);
        let info = slot.get_or_init(|| self.fetch_uncached(name)).clone()?;

        if let Some(tag) = expected_dist_tag {
            if !info.dist_tags.contains_key(tag) {
                return Err(RegistryError::MissingDistTag {
                    name: name.to_string(),
                    tag: tag.to_string(),
                }
                .into());
            }
        }

        Ok(info)
    }

    /// De-duplicated dist-tag targets of `name`.
    pub fn fetch_distinct_dist_tag_versions(&self, name: &str) -> Result<Vec<String>> {
        Ok(self.fetch_info(name, None)?.distinct_dist_tag_versions())
    }

    /// Fail unless `tag` on `name` points at `expected_version`.
    pub fn verify_dist_tag(&self, name: &str, tag: &str, expected_version: &str) -> Result<()> {
        let info = self.fetch_info(name, Some(tag))?;
        let actual = info.dist_tags.get(tag).cloned().unwrap_or_default();
        if actual != expected_version {
            return Err(RegistryError::DistTagMismatch {
                name: name.to_string(),
                tag: tag.to_string(),
                expected: expected_version.to_string(),
                actual,
            }
            .into());
        }
        Ok(())
    }

    /// Download `url` to `dir/file_name`.
    ///
    /// The body is staged in a temp file next to `dir` and renamed into place,
    /// so readers of `dir` never see a partially written archive.
    pub fn download_tarball(&self, url: &str, dir: &Path, file_name: &str) -> Result<PathBuf> {
        let bytes = self.get_bytes(url)?;
        let target = dir.join(file_name);
        let staging = dir.parent().unwrap_or(dir);

        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create tarball dir {}", dir.display()))?;
        let mut tmp = NamedTempFile::new_in(staging)
            .with_context(|| format!("failed to create temp file in {}", staging.display()))?;
        tmp.write_all(&bytes)
            .with_context(|| format!("failed to write tarball for {url}"))?;
        tmp.persist(&target)
            .map_err(|e| e.error)
            .with_context(|| format!("failed to move tarball into {}", target.display()))?;

        Ok(target)
    }

    fn fetch_uncached(&self, name: &str) -> CachedInfo {
        let url = format!("{}/{}", self.base_url, name);
        let body = self.get_bytes(&url)?;
        parse_packument(name, &body).map(Arc::new)
    }

    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, RegistryError> {
        retry_with_backoff(&self.retry, is_transient, |_attempt| {
            let transport = |e: reqwest::Error| RegistryError::Transport {
                url: url.to_string(),
                message: e.to_string(),
            };

            let resp = self.http.get(url).send().map_err(transport)?;
            let status = resp.status();
            if !status.is_success() {
                return Err(RegistryError::Status {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }
            resp.bytes().map(|b| b.to_vec()).map_err(transport)
        })
    }
}

fn is_transient(err: &RegistryError) -> bool {
    match err {
        RegistryError::Transport { .. } => true,
        RegistryError::Status { status, .. } => *status == 429 || *status >= 500,
        _ => false,
    }
}

#[derive(Debug, Deserialize)]
struct RawPackument {
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "dist-tags", default)]
    dist_tags: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    versions: Option<BTreeMap<String, RawVersion>>,
}

#[derive(Debug, Deserialize)]
struct RawVersion {
    #[serde(default)]
    dependencies: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    dist: Option<RawDist>,
    #[serde(default)]
    repository: Option<Value>,
    #[serde(rename = "gitHead", default)]
    git_head: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDist {
    #[serde(default)]
    tarball: Option<String>,
}

/// Normalize a raw packument body into [`PackageInfo`].
pub fn parse_packument(name: &str, body: &[u8]) -> Result<PackageInfo, RegistryError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(RegistryError::NoBody {
            name: name.to_string(),
        });
    }

    let raw: Option<RawPackument> =
        serde_json::from_slice(body).map_err(|e| RegistryError::Malformed {
            name: name.to_string(),
            message: e.to_string(),
        })?;
    let raw = raw.ok_or_else(|| RegistryError::NoBody {
        name: name.to_string(),
    })?;
    let versions = raw.versions.ok_or_else(|| RegistryError::NoVersions {
        name: name.to_string(),
    })?;

    let dist_tags = raw
        .dist_tags
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(tag, version)| match version {
            Value::String(v) => Some((tag, v)),
            _ => None,
        })
        .collect();

    // Version keys and dependency names become paths in the mirror.
    let versions = versions
        .into_iter()
        .filter(|(version, _)| is_safe_version(version))
        .map(|(version, raw)| (version, normalize_version(raw)))
        .collect();

    Ok(PackageInfo {
        name: raw.name.unwrap_or_else(|| name.to_string()),
        dist_tags,
        versions,
    })
}

fn normalize_version(raw: RawVersion) -> VersionRecord {
    let dependencies = raw
        .dependencies
        .unwrap_or_default()
        .into_iter()
        .filter(|(dep, _)| is_safe_package_name(dep))
        .map(|(dep, requirement)| (dep, coerce_requirement(requirement)))
        .collect();

    let repository = match raw.repository {
        Some(Value::String(url)) => Some(Repository { url: Some(url) }),
        Some(Value::Object(map)) => Some(Repository {
            url: map.get("url").and_then(Value::as_str).map(str::to_string),
        }),
        _ => None,
    };

    VersionRecord {
        dependencies,
        dist: Dist {
            tarball: raw.dist.and_then(|d| d.tarball),
        },
        repository,
        git_head: raw.git_head,
    }
}

fn coerce_requirement(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;
    use crate::test_support::{PackageFixture, TestRegistry, test_client};

    #[test]
    fn client_trims_trailing_slash() {
        let client = RegistryClient::new("https://registry.example/", &HttpOptions::default())
            .expect("client");
        assert_eq!(client.base_url(), "https://registry.example");
    }

    #[test]
    fn user_agent_includes_version() {
        assert!(USER_AGENT.starts_with("grabthar/"));
        assert!(USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn parse_keeps_only_mirroring_fields() {
        let body = br#"{
            "name": "demo",
            "readme": "long text",
            "time": {"1.0.0": "2020-01-01T00:00:00Z"},
            "dist-tags": {"latest": "1.0.0", "weird": 3},
            "versions": {
                "1.0.0": {
                    "name": "demo",
                    "dependencies": {"left-pad": "1.3.0", "odd": 2},
                    "dist": {"tarball": "https://r.example/demo/-/demo-1.0.0.tgz", "shasum": "abc"},
                    "repository": {"type": "git", "url": "git://github.com/demo/demo.git"},
                    "gitHead": "deadbeef",
                    "scripts": {"test": "jest"}
                },
                "0.9.0": {
                    "dependencies": null,
                    "repository": "github:demo/demo"
                }
            }
        }"#;

        let info = parse_packument("demo", body).expect("parse");
        assert_eq!(info.name, "demo");
        assert_eq!(info.dist_tags.len(), 1);
        assert_eq!(info.dist_tags["latest"], "1.0.0");

        let v1 = &info.versions["1.0.0"];
        assert_eq!(v1.dependencies["left-pad"], "1.3.0");
        assert_eq!(v1.dependencies["odd"], "2");
        assert_eq!(
            v1.dist.tarball.as_deref(),
            Some("https://r.example/demo/-/demo-1.0.0.tgz")
        );
        assert_eq!(
            v1.repository.as_ref().and_then(|r| r.url.as_deref()),
            Some("git://github.com/demo/demo.git")
        );
        assert_eq!(v1.git_head.as_deref(), Some("deadbeef"));

        let v0 = &info.versions["0.9.0"];
        assert!(v0.dependencies.is_empty());
        assert_eq!(v0.dist.tarball, None);
        assert_eq!(
            v0.repository.as_ref().and_then(|r| r.url.as_deref()),
            Some("github:demo/demo")
        );
    }

    #[test]
    fn parse_rejects_missing_body_and_versions() {
        assert_eq!(
            parse_packument("demo", b"  ").unwrap_err(),
            RegistryError::NoBody {
                name: "demo".to_string()
            }
        );
        assert_eq!(
            parse_packument("demo", b"null").unwrap_err(),
            RegistryError::NoBody {
                name: "demo".to_string()
            }
        );
        assert_eq!(
            parse_packument("demo", br#"{"name":"demo","dist-tags":{}}"#).unwrap_err(),
            RegistryError::NoVersions {
                name: "demo".to_string()
            }
        );
        assert!(matches!(
            parse_packument("demo", b"{not json").unwrap_err(),
            RegistryError::Malformed { .. }
        ));
    }

    #[test]
    fn parse_drops_versions_and_dependencies_that_are_not_path_safe() {
        let body = br#"{
            "name": "demo",
            "dist-tags": {"latest": "1.0.0"},
            "versions": {
                "1.0.0": {"dependencies": {"ok": "1.0.0", "@scope/ok": "2.0.0", "../../up": "1.0.0", "a/b/c": "1.0.0"}},
                "../../../../escaped": {"dist": {"tarball": "https://r.example/x.tgz"}},
                "1.0.0\\..\\evil": {},
                "2.0.0/sub": {}
            }
        }"#;

        let info = parse_packument("demo", body).expect("parse");
        assert_eq!(info.versions.keys().collect::<Vec<_>>(), vec!["1.0.0"]);
        assert_eq!(
            info.versions["1.0.0"].dependencies.keys().collect::<Vec<_>>(),
            vec!["@scope/ok", "ok"]
        );
    }

    #[test]
    fn parse_falls_back_to_requested_name() {
        let info = parse_packument("demo", br#"{"versions":{}}"#).expect("parse");
        assert_eq!(info.name, "demo");
        assert!(info.dist_tags.is_empty());
    }

    #[test]
    fn fetch_info_requires_expected_dist_tag() {
        let registry = TestRegistry::spawn();
        registry.serve("demo", &PackageFixture::new("demo", "1.0.0"));
        let client = test_client(&registry);

        let info = client.fetch_info("demo", Some("latest")).expect("latest present");
        assert_eq!(info.dist_tags["latest"], "1.0.0");

        let err = client
            .fetch_info("demo", Some("active-production"))
            .expect_err("tag missing");
        assert_eq!(
            err.downcast_ref::<RegistryError>(),
            Some(&RegistryError::MissingDistTag {
                name: "demo".to_string(),
                tag: "active-production".to_string(),
            })
        );
        assert_eq!(registry.hits_for("/demo"), 1);
    }

    #[test]
    fn fetch_info_reports_http_status() {
        let registry = TestRegistry::spawn();
        let client = test_client(&registry);

        let err = client.fetch_info("missing", None).expect_err("404");
        assert!(matches!(
            err.downcast_ref::<RegistryError>(),
            Some(RegistryError::Status { status: 404, .. })
        ));
    }

    #[test]
    fn server_errors_are_retried() {
        let registry = TestRegistry::spawn();
        registry.serve_status("flaky", 503);
        let client = test_client(&registry);

        let err = client.fetch_info("flaky", None).expect_err("503");
        assert!(matches!(
            err.downcast_ref::<RegistryError>(),
            Some(RegistryError::Status { status: 503, .. })
        ));
        assert_eq!(registry.hits_for("/flaky"), 3);
    }

    #[test]
    fn concurrent_fetches_share_one_request() {
        let registry = TestRegistry::spawn();
        registry.serve("demo", &PackageFixture::new("demo", "1.0.0"));
        let client = test_client(&registry);

        thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| client.fetch_info("demo", None).map(|i| i.name.clone())))
                .collect();
            for handle in handles {
                assert_eq!(handle.join().expect("join").expect("fetch"), "demo");
            }
        });

        assert_eq!(registry.hits_for("/demo"), 1);
        assert_eq!(client.cached_packages(), 1);
    }

    #[test]
    fn clear_cache_forces_refetch() {
        let registry = TestRegistry::spawn();
        registry.serve("demo", &PackageFixture::new("demo", "1.0.0"));
        let client = test_client(&registry);

        client.fetch_info("demo", None).expect("first");
        client.clear_cache();
        assert_eq!(client.cached_packages(), 0);

        registry.serve("demo", &PackageFixture::new("demo", "2.0.0"));
        let info = client.fetch_info("demo", None).expect("second");
        assert_eq!(info.dist_tags["latest"], "2.0.0");
        assert_eq!(registry.hits_for("/demo"), 2);
    }

    #[test]
    fn distinct_dist_tag_versions_dedupe() {
        let registry = TestRegistry::spawn();
        registry.serve(
            "demo",
            &PackageFixture::new("demo", "2.0.0")
                .tag("active-production", "1.0.0")
                .tag("active-test", "2.0.0")
                .version("1.0.0"),
        );
        let client = test_client(&registry);

        let versions = client.fetch_distinct_dist_tag_versions("demo").expect("tags");
        assert_eq!(versions, vec!["1.0.0", "2.0.0"]);
    }

    #[test]
    fn verify_dist_tag_detects_mismatch() {
        let registry = TestRegistry::spawn();
        registry.serve("demo", &PackageFixture::new("demo", "2.0.0").version("1.0.0"));
        let client = test_client(&registry);

        client.verify_dist_tag("demo", "latest", "2.0.0").expect("matches");
        let err = client
            .verify_dist_tag("demo", "latest", "1.0.0")
            .expect_err("mismatch");
        assert!(matches!(
            err.downcast_ref::<RegistryError>(),
            Some(RegistryError::DistTagMismatch { actual, .. }) if actual == "2.0.0"
        ));
    }

    #[test]
    fn download_tarball_writes_named_file() {
        let registry = TestRegistry::spawn();
        let client = test_client(&registry);
        let td = tempdir().expect("tempdir");
        let dir = td.path().join("demo").join("tarballs");

        let url = format!("{}/tarballs/demo/1.0.0.tgz", registry.base_url);
        let path = client
            .download_tarball(&url, &dir, "1.0.0.tgz")
            .expect("download");

        assert_eq!(path, dir.join("1.0.0.tgz"));
        assert_eq!(fs::read_to_string(&path).expect("read"), "tarball info");
        let leftovers: Vec<_> = fs::read_dir(td.path().join("demo"))
            .expect("read dir")
            .map(|e| e.expect("entry").file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("tarballs")]);
    }

    #[test]
    fn custom_timeout_is_accepted() {
        let options = HttpOptions {
            timeout: Duration::from_secs(5),
            ..HttpOptions::default()
        };
        assert!(RegistryClient::new(NPM_REGISTRY, &options).is_ok());
    }
}
