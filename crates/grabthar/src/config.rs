//! Configuration file support (`.grabthar.toml`) and option resolution.
//!
//! Effective mirror options come from, in order of precedence: CLI flags,
//! the config file, the project's `package.json` / `.nodeops`, built-in
//! defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::registry::NPM_REGISTRY;
use crate::retry::{RetryPolicy, RetryStrategyConfig, RetryStrategyType};
use crate::types::{HttpOptions, MirrorOptions, deserialize_duration, serialize_duration};

pub const CONFIG_FILE_NAME: &str = ".grabthar.toml";
pub const DEFAULT_CDN: &str = "https://www.mycdn.com";
pub const DEFAULT_DIST_TAG: &str = "latest";

/// `[mirror]` section. Unset values fall through to project files and defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorConfig {
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub registry: Option<String>,
    #[serde(default)]
    pub cdn: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub mirror_root: Option<PathBuf>,
    #[serde(default)]
    pub info_file: Option<String>,
    #[serde(default)]
    pub tarball_folder: Option<String>,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub versions_to_keep: Option<usize>,
    /// Dist-tag the root package must carry; empty disables the check.
    #[serde(default)]
    pub dist_tag: Option<String>,
    #[serde(default)]
    pub legacy_overwrite: bool,
}

/// `[http]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Per-request timeout for registry and tarball requests
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_http_timeout")]
    pub timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: default_http_timeout(),
        }
    }
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

/// `[process]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Upper bound for each networked git or npm invocation
    /// (`git push`, `npm view`, `npm dist-tag add`)
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_process_timeout")]
    pub timeout: Duration,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            timeout: default_process_timeout(),
        }
    }
}

fn default_process_timeout() -> Duration {
    Duration::from_secs(300)
}

/// `[retry]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retry policy preset: default, aggressive, none, or custom
    #[serde(default)]
    pub policy: RetryPolicy,

    /// Max attempts per request (used when policy is custom)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_base_delay")]
    pub base_delay: Duration,

    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_max_delay")]
    pub max_delay: Duration,

    /// Strategy type: immediate, exponential, linear, constant
    #[serde(default)]
    pub strategy: RetryStrategyType,

    /// Jitter factor for randomized delays (0.0 = no jitter, 1.0 = full jitter)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::Default,
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            strategy: RetryStrategyType::Exponential,
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// Strategy actually used: the preset, or the explicit fields for `custom`.
    pub fn effective(&self) -> RetryStrategyConfig {
        if self.policy != RetryPolicy::Custom {
            return self.policy.to_config();
        }
        RetryStrategyConfig {
            strategy: self.strategy,
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            jitter: self.jitter,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_jitter() -> f64 {
    0.5
}

/// Configuration loaded from `.grabthar.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrabtharConfig {
    #[serde(default)]
    pub mirror: MirrorConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub process: ProcessConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

/// CLI overrides for merging with config file values.
///
/// `Option` fields mean "user did not pass this flag" when `None`.
/// `bool` fields mean "user explicitly enabled this" when `true`.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub module: Option<String>,
    pub registry: Option<String>,
    pub cdn: Option<String>,
    pub namespace: Option<String>,
    pub mirror_root: Option<PathBuf>,
    pub info_file: Option<String>,
    pub tarball_folder: Option<String>,
    pub recursive: bool,
    pub versions_to_keep: Option<usize>,
    pub dist_tag: Option<String>,
    pub legacy_overwrite: bool,
    pub release_version: Option<String>,
}

/// The parts of `package.json` used as fallbacks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PackageManifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// The parts of `.nodeops` used as fallbacks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NodeOps {
    #[serde(default)]
    pub web: Option<NodeOpsWeb>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NodeOpsWeb {
    #[serde(rename = "staticNamespace", default)]
    pub static_namespace: Option<String>,
}

/// Project files found next to the invocation; either may be absent.
#[derive(Debug, Clone, Default)]
pub struct ProjectFiles {
    pub package: Option<PackageManifest>,
    pub nodeops: Option<NodeOps>,
}

impl ProjectFiles {
    pub fn load(package_path: &Path, nodeops_path: &Path) -> Result<Self> {
        Ok(Self {
            package: read_json_if_exists(package_path)?,
            nodeops: read_json_if_exists(nodeops_path)?,
        })
    }

    pub fn package_name(&self) -> Option<&str> {
        self.package.as_ref()?.name.as_deref()
    }

    pub fn package_version(&self) -> Option<&str> {
        self.package.as_ref()?.version.as_deref()
    }

    pub fn static_namespace(&self) -> Option<&str> {
        self.nodeops.as_ref()?.web.as_ref()?.static_namespace.as_deref()
    }
}

fn read_json_if_exists<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value = serde_json::from_str(&content).map_err(|e| ConfigurationError::InvalidFile {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(Some(value))
}

impl GrabtharConfig {
    /// Load `.grabthar.toml` from `dir`. Returns `Ok(None)` if no config file exists.
    pub fn load_from_dir(dir: &Path) -> Result<Option<Self>> {
        let config_path = dir.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            return Ok(None);
        }
        Self::load_from_file(&config_path).map(Some)
    }

    /// Load configuration from a specific file path
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: GrabtharConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.http.timeout.is_zero() {
            bail!("http.timeout must be greater than 0");
        }

        if self.process.timeout.is_zero() {
            bail!("process.timeout must be greater than 0");
        }

        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be greater than 0");
        }

        if self.retry.max_delay < self.retry.base_delay {
            bail!("retry.max_delay must be greater than or equal to retry.base_delay");
        }

        if self.retry.jitter < 0.0 || self.retry.jitter > 1.0 {
            bail!("retry.jitter must be between 0.0 and 1.0");
        }

        if let Some(cdn) = &self.mirror.cdn {
            if !(cdn.starts_with("http://") || cdn.starts_with("https://")) {
                bail!("mirror.cdn must be an http(s) URL");
            }
        }

        Ok(())
    }

    /// Resolve [`MirrorOptions`] from CLI flags, this file and project files,
    /// then check that every required value is present.
    pub fn build_mirror_options(
        &self,
        cli: CliOverrides,
        project: &ProjectFiles,
    ) -> Result<MirrorOptions, ConfigurationError> {
        let file = &self.mirror;

        let dist_tag = cli
            .dist_tag
            .or_else(|| file.dist_tag.clone())
            .unwrap_or_else(|| DEFAULT_DIST_TAG.to_string());

        let opts = MirrorOptions {
            module: cli
                .module
                .or_else(|| file.module.clone())
                .or_else(|| project.package_name().map(str::to_string))
                .unwrap_or_default(),
            release_version: cli
                .release_version
                .or_else(|| project.package_version().map(str::to_string))
                .unwrap_or_default(),
            registry: cli
                .registry
                .or_else(|| file.registry.clone())
                .unwrap_or_else(|| NPM_REGISTRY.to_string()),
            cdn: cli
                .cdn
                .or_else(|| file.cdn.clone())
                .unwrap_or_else(|| DEFAULT_CDN.to_string()),
            namespace: cli
                .namespace
                .or_else(|| file.namespace.clone())
                .or_else(|| project.static_namespace().map(str::to_string))
                .unwrap_or_default(),
            mirror_root: cli
                .mirror_root
                .or_else(|| file.mirror_root.clone())
                .unwrap_or_else(|| PathBuf::from("cdn")),
            info_file: cli
                .info_file
                .or_else(|| file.info_file.clone())
                .unwrap_or_else(|| "info.json".to_string()),
            tarball_folder: cli
                .tarball_folder
                .or_else(|| file.tarball_folder.clone())
                .unwrap_or_else(|| "tarballs".to_string()),
            recursive: cli.recursive || file.recursive,
            versions_to_keep: cli
                .versions_to_keep
                .or(file.versions_to_keep)
                .unwrap_or(0),
            dist_tag: (!dist_tag.is_empty()).then_some(dist_tag),
            legacy_overwrite: cli.legacy_overwrite || file.legacy_overwrite,
        };

        validate_mirror_options(&opts)?;
        Ok(opts)
    }

    pub fn build_http_options(&self, timeout: Option<Duration>) -> HttpOptions {
        HttpOptions {
            timeout: timeout.unwrap_or(self.http.timeout),
            retry: self.retry.effective(),
        }
    }

    /// Generate a default configuration file content as TOML string
    pub fn default_toml_template() -> String {
        r#"# grabthar configuration file
# Place next to package.json as .grabthar.toml

[mirror]
# Registry to mirror from
registry = "https://registry.npmjs.org"
# CDN base URL that mirrored tarball URLs point at
cdn = "https://www.mycdn.com"
# CDN namespace (defaults to web.staticNamespace from .nodeops)
# namespace = "my-app"
# Local directory holding the mirror trees
mirror_root = "cdn"
info_file = "info.json"
tarball_folder = "tarballs"
# Also mirror each retained version's dependencies
recursive = false
# Historical stable versions kept besides dist-tag targets
versions_to_keep = 0
# Dist-tag the root package must carry ("" disables the check)
dist_tag = "latest"
# Also write the unversioned legacy tree
legacy_overwrite = false

[http]
# Timeout for each registry or tarball request
timeout = "30s"

[process]
# Timeout for git push, npm view and npm dist-tag add
timeout = "5m"

[retry]
# Retry policy: default, aggressive, none, or custom
policy = "default"
# The settings below apply when policy is custom
max_attempts = 3
base_delay = "500ms"
max_delay = "5s"
# Strategy type: immediate, exponential, linear, constant
strategy = "exponential"
# Jitter factor for randomized delays (0.0 = no jitter, 1.0 = full jitter)
jitter = 0.5
"#
        .to_string()
    }
}

/// Required values must be present, and the release version must be semver
/// since it names the versioned subtree.
pub fn validate_mirror_options(opts: &MirrorOptions) -> Result<(), ConfigurationError> {
    if opts.module.trim().is_empty() {
        return Err(ConfigurationError::MissingModule);
    }
    if opts.namespace.trim_matches('/').is_empty() {
        return Err(ConfigurationError::MissingNamespace);
    }
    if opts.cdn.trim().is_empty() {
        return Err(ConfigurationError::MissingCdn);
    }
    if opts.release_version.is_empty() {
        return Err(ConfigurationError::MissingReleaseVersion);
    }
    if Version::parse(&opts.release_version).is_err() {
        return Err(ConfigurationError::InvalidReleaseVersion(
            opts.release_version.clone(),
        ));
    }
    if opts.info_file.is_empty() || opts.tarball_folder.is_empty() {
        return Err(ConfigurationError::Invalid(
            "info file and tarball folder names cannot be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn project(name: &str, version: &str, namespace: Option<&str>) -> ProjectFiles {
        ProjectFiles {
            package: Some(PackageManifest {
                name: Some(name.to_string()),
                version: Some(version.to_string()),
            }),
            nodeops: namespace.map(|ns| NodeOps {
                web: Some(NodeOpsWeb {
                    static_namespace: Some(ns.to_string()),
                }),
            }),
        }
    }

    #[test]
    fn test_default_config() {
        let config = GrabtharConfig::default();
        assert_eq!(config.http.timeout, Duration::from_secs(30));
        assert_eq!(config.process.timeout, Duration::from_secs(300));
        assert_eq!(config.retry.policy, RetryPolicy::Default);
        assert!(!config.mirror.recursive);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_invalid_retry() {
        let mut config = GrabtharConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = GrabtharConfig::default();
        config.retry.base_delay = Duration::from_secs(10);
        config.retry.max_delay = Duration::from_secs(1);
        assert!(config.validate().is_err());

        let mut config = GrabtharConfig::default();
        config.retry.jitter = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_cdn_and_timeout() {
        let mut config = GrabtharConfig::default();
        config.mirror.cdn = Some("ftp://cdn.example".to_string());
        assert!(config.validate().is_err());

        let mut config = GrabtharConfig::default();
        config.http.timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = GrabtharConfig::default();
        config.process.timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml_config() {
        let toml = r#"
[mirror]
cdn = "https://cdn.example"
namespace = "checkout"
recursive = true
versions_to_keep = 2
legacy_overwrite = true

[http]
timeout = "10s"

[process]
timeout = "90s"

[retry]
policy = "custom"
strategy = "linear"
max_attempts = 4
base_delay = "1s"
max_delay = "3s"
jitter = 0.0
"#;

        let config: GrabtharConfig = toml::from_str(toml).expect("parse");
        assert_eq!(config.mirror.cdn.as_deref(), Some("https://cdn.example"));
        assert!(config.mirror.recursive);
        assert_eq!(config.mirror.versions_to_keep, Some(2));
        assert_eq!(config.http.timeout, Duration::from_secs(10));
        assert_eq!(config.process.timeout, Duration::from_secs(90));

        let retry = config.retry.effective();
        assert_eq!(retry.strategy, RetryStrategyType::Linear);
        assert_eq!(retry.max_attempts, 4);
        assert_eq!(retry.base_delay, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_preset_policy_ignores_explicit_fields() {
        let toml = r#"
[retry]
policy = "none"
max_attempts = 9
"#;
        let config: GrabtharConfig = toml::from_str(toml).expect("parse");
        assert_eq!(config.retry.effective().max_attempts, 1);
    }

    #[test]
    fn test_default_template_parses_and_validates() {
        let config: GrabtharConfig =
            toml::from_str(&GrabtharConfig::default_toml_template()).expect("template");
        assert!(config.validate().is_ok());
        assert_eq!(config.mirror.dist_tag.as_deref(), Some("latest"));
        assert_eq!(config.process.timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_load_from_dir() {
        let td = tempdir().expect("tempdir");
        assert!(GrabtharConfig::load_from_dir(td.path()).expect("load").is_none());

        fs::write(
            td.path().join(CONFIG_FILE_NAME),
            "[mirror]\nnamespace = \"checkout\"\n",
        )
        .expect("write");
        let config = GrabtharConfig::load_from_dir(td.path())
            .expect("load")
            .expect("present");
        assert_eq!(config.mirror.namespace.as_deref(), Some("checkout"));

        fs::write(td.path().join(CONFIG_FILE_NAME), "[mirror\n").expect("write");
        let err = GrabtharConfig::load_from_dir(td.path()).expect_err("bad toml");
        assert!(format!("{err:#}").contains("Failed to parse config file"));
    }

    #[test]
    fn project_files_supply_fallbacks() {
        let config = GrabtharConfig::default();
        let opts = config
            .build_mirror_options(
                CliOverrides::default(),
                &project("@org/release-package", "23.44.3", Some("fake-namespace")),
            )
            .expect("options");

        assert_eq!(opts.module, "@org/release-package");
        assert_eq!(opts.release_version, "23.44.3");
        assert_eq!(opts.namespace, "fake-namespace");
        assert_eq!(opts.registry, NPM_REGISTRY);
        assert_eq!(opts.cdn, DEFAULT_CDN);
        assert_eq!(opts.mirror_root, PathBuf::from("cdn"));
        assert_eq!(opts.info_file, "info.json");
        assert_eq!(opts.tarball_folder, "tarballs");
        assert_eq!(opts.versions_to_keep, 0);
        assert_eq!(opts.dist_tag.as_deref(), Some("latest"));
        assert!(!opts.recursive);
    }

    #[test]
    fn cli_overrides_file_overrides_project() {
        let mut config = GrabtharConfig::default();
        config.mirror.namespace = Some("from-file".to_string());
        config.mirror.versions_to_keep = Some(3);
        config.mirror.recursive = true;
        config.mirror.dist_tag = Some(String::new());

        let cli = CliOverrides {
            namespace: Some("from-cli".to_string()),
            release_version: Some("1.2.3".to_string()),
            ..CliOverrides::default()
        };
        let opts = config
            .build_mirror_options(cli, &project("pkg", "9.9.9", Some("from-nodeops")))
            .expect("options");

        assert_eq!(opts.namespace, "from-cli");
        assert_eq!(opts.release_version, "1.2.3");
        assert_eq!(opts.versions_to_keep, 3);
        assert!(opts.recursive);
        assert_eq!(opts.dist_tag, None);
    }

    #[test]
    fn missing_values_are_configuration_errors() {
        let config = GrabtharConfig::default();

        let err = config
            .build_mirror_options(CliOverrides::default(), &ProjectFiles::default())
            .expect_err("no module");
        assert_eq!(err, ConfigurationError::MissingModule);

        let err = config
            .build_mirror_options(CliOverrides::default(), &project("pkg", "1.0.0", None))
            .expect_err("no namespace");
        assert_eq!(err, ConfigurationError::MissingNamespace);

        let cli = CliOverrides {
            release_version: Some("next".to_string()),
            ..CliOverrides::default()
        };
        let err = config
            .build_mirror_options(cli, &project("pkg", "1.0.0", Some("ns")))
            .expect_err("bad version");
        assert_eq!(err, ConfigurationError::InvalidReleaseVersion("next".to_string()));
    }

    #[test]
    fn http_options_take_cli_timeout() {
        let config = GrabtharConfig::default();
        let http = config.build_http_options(Some(Duration::from_secs(3)));
        assert_eq!(http.timeout, Duration::from_secs(3));
        assert_eq!(http.retry, RetryStrategyConfig::default());
        assert_eq!(config.build_http_options(None).timeout, Duration::from_secs(30));
    }

    #[test]
    fn project_files_load_from_disk() {
        let td = tempdir().expect("tempdir");
        let package = td.path().join("package.json");
        let nodeops = td.path().join(".nodeops");

        let files = ProjectFiles::load(&package, &nodeops).expect("absent files");
        assert!(files.package.is_none() && files.nodeops.is_none());

        fs::write(&package, r#"{"name":"@org/app","version":"2.0.0","scripts":{}}"#).expect("write");
        fs::write(&nodeops, r#"{"web":{"staticNamespace":"org-app"}}"#).expect("write");
        let files = ProjectFiles::load(&package, &nodeops).expect("load");
        assert_eq!(files.package_name(), Some("@org/app"));
        assert_eq!(files.package_version(), Some("2.0.0"));
        assert_eq!(files.static_namespace(), Some("org-app"));

        fs::write(&nodeops, "{").expect("write");
        let err = ProjectFiles::load(&package, &nodeops).expect_err("bad json");
        assert!(matches!(
            err.downcast_ref::<ConfigurationError>(),
            Some(ConfigurationError::InvalidFile { .. })
        ));
    }
}
