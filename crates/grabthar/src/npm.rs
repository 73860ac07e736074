//! npm CLI collaborator: environment dist-tag activation.

use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{Result, bail};

use crate::engine::Reporter;
use crate::error::ConfigurationError;
use crate::process::{run_checked, run_command_with_env};
use crate::registry::RegistryClient;

/// Environments a release can be activated in, in activation order.
pub const ENVIRONMENTS: [&str; 5] = ["test", "local", "stage", "sandbox", "production"];

pub const ACTIVE_TAG_PREFIX: &str = "active";

/// Parse a comma-separated environment list; `None` selects every environment.
pub fn parse_environments(raw: Option<&str>) -> Result<Vec<String>, ConfigurationError> {
    let Some(raw) = raw else {
        return Ok(ENVIRONMENTS.iter().map(|e| e.to_string()).collect());
    };

    raw.split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(|e| {
            if ENVIRONMENTS.contains(&e) {
                Ok(e.to_string())
            } else {
                Err(ConfigurationError::InvalidEnvironment(e.to_string()))
            }
        })
        .collect()
}

pub fn active_tag(environment: &str) -> String {
    format!("{ACTIVE_TAG_PREFIX}-{environment}")
}

/// How `npm dist-tag add` authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NpmAuth {
    /// Passed through to npm as `NPM_TOKEN`.
    Token(String),
    /// One-time password appended as `--otp`.
    Otp(String),
}

impl NpmAuth {
    /// A non-empty token wins over an OTP.
    pub fn resolve(token: Option<String>, otp: Option<String>) -> Result<Self> {
        match (token.filter(|t| !t.is_empty()), otp) {
            (Some(token), _) => Ok(Self::Token(token)),
            (None, Some(otp)) if !otp.is_empty() => Ok(Self::Otp(otp)),
            _ => bail!("NPM_TOKEN is not set; pass --otp with a two-factor code"),
        }
    }

    pub fn from_env(otp: Option<String>) -> Result<Self> {
        Self::resolve(env::var("NPM_TOKEN").ok(), otp)
    }
}

pub fn dist_tag_add_args(module: &str, version: &str, tag: &str, auth: &NpmAuth) -> Vec<String> {
    let mut args = vec![
        "dist-tag".to_string(),
        "add".to_string(),
        format!("{module}@{version}"),
        tag.to_string(),
    ];
    if let NpmAuth::Otp(code) = auth {
        args.push(format!("--otp={code}"));
    }
    args
}

/// Latest published version of `module` according to npm.
pub fn view_version(repo_root: &Path, module: &str, timeout: Option<Duration>) -> Result<String> {
    run_checked(&npm_program(), &["view", module, "version"], repo_root, timeout)
}

/// Point `active-<env>` at `module@version` for each environment, then
/// confirm every tag against the registry. Each npm call is killed after
/// `timeout`.
#[allow(clippy::too_many_arguments)]
pub fn activate(
    client: &RegistryClient,
    repo_root: &Path,
    module: &str,
    version: &str,
    environments: &[String],
    auth: &NpmAuth,
    timeout: Option<Duration>,
    reporter: &mut dyn Reporter,
) -> Result<Vec<String>> {
    activate_with(
        &npm_program(),
        client,
        repo_root,
        module,
        version,
        environments,
        auth,
        timeout,
        reporter,
    )
}

#[allow(clippy::too_many_arguments)]
fn activate_with(
    program: &str,
    client: &RegistryClient,
    repo_root: &Path,
    module: &str,
    version: &str,
    environments: &[String],
    auth: &NpmAuth,
    timeout: Option<Duration>,
    reporter: &mut dyn Reporter,
) -> Result<Vec<String>> {
    let envs: Vec<(&str, &str)> = match auth {
        NpmAuth::Token(token) => vec![("NPM_TOKEN", token.as_str())],
        NpmAuth::Otp(_) => Vec::new(),
    };

    let mut tags = Vec::with_capacity(environments.len());
    for environment in environments {
        let tag = active_tag(environment);
        let args = dist_tag_add_args(module, version, &tag, auth);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        reporter.info(&format!("npm dist-tag add {module}@{version} {tag}"));

        let out = run_command_with_env(program, &args, repo_root, &envs, timeout)?;
        if !out.success() {
            bail!(
                "npm dist-tag add {module}@{version} {tag} failed (exit {}): {}",
                out.exit_code,
                out.stderr.trim()
            );
        }
        tags.push(tag);
    }

    // Tags just moved; never verify against a cached packument.
    client.clear_cache();
    for tag in &tags {
        client.verify_dist_tag(module, tag, version)?;
        reporter.info(&format!("verified {module} {tag} -> {version}"));
    }
    Ok(tags)
}

fn npm_program() -> String {
    env::var("GRABTHAR_NPM_BIN").unwrap_or_else(|_| "npm".to_string())
}
