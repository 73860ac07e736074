//! Mirror synchronizer: one (package, version) into one mirror tree.
//!
//! Layout under a CDN folder:
//!
//! ```text
//! <cdn folder>/<sanitized name>/info.json
//! <cdn folder>/<sanitized name>/tarballs/<version><ext>
//! ```
//!
//! Every call reconciles the whole package: tarballs and manifest entries
//! outside the retention set are removed, and only versions whose tarball
//! is on disk get a CDN URL.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use tempfile::NamedTempFile;

use crate::engine::Reporter;
use crate::error::{MissingVersionError, RegistryError};
use crate::registry::RegistryClient;
use crate::retention::select_versions_to_keep;
use crate::types::{MirrorOptions, ModuleReceipt, ModuleTarget, PackageInfo, VersionRecord};

/// Path-safe package name: `@org/pkg` becomes `org/pkg`.
pub fn sanitize_name(name: &str) -> &str {
    name.strip_prefix('@').unwrap_or(name)
}

/// A version string usable as one file name inside a tarball folder.
pub fn is_safe_version(version: &str) -> bool {
    !version.is_empty() && !version.contains(['/', '\\']) && !version.contains("..")
}

/// A package name whose sanitized form stays below the CDN folder
/// (`name` or `scope/name`).
pub fn is_safe_package_name(name: &str) -> bool {
    let sanitized = sanitize_name(name);
    let segments: Vec<&str> = sanitized.split('/').collect();
    !sanitized.contains('\\')
        && segments.len() <= 2
        && segments
            .iter()
            .all(|s| !s.is_empty() && *s != "." && *s != "..")
}

/// Extension of the archive a tarball URL points at, dot included.
pub fn tarball_extension(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let file = path.rsplit('/').next().unwrap_or(path);
    match file.rfind('.') {
        Some(idx) if idx > 0 && !file[idx..].contains('\\') => &file[idx..],
        _ => "",
    }
}

pub fn tarball_file_name(version: &str, extension: &str) -> String {
    format!("{version}{extension}")
}

/// On-disk locations for one package inside one CDN folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleLayout {
    pub sanitized_name: String,
    pub module_dir: PathBuf,
    pub tarball_dir: PathBuf,
    pub info_path: PathBuf,
}

impl ModuleLayout {
    pub fn new(cdn_folder: &Path, name: &str, opts: &MirrorOptions) -> Self {
        let sanitized_name = sanitize_name(name).to_string();
        let module_dir = cdn_folder.join(&sanitized_name);
        Self {
            tarball_dir: module_dir.join(&opts.tarball_folder),
            info_path: module_dir.join(&opts.info_file),
            module_dir,
            sanitized_name,
        }
    }
}

/// `{cdn}/{namespace}/{sanitized}/{tarball folder}/{file}`
pub fn cdn_tarball_url(
    opts: &MirrorOptions,
    cdn_namespace: &str,
    sanitized_name: &str,
    file_name: &str,
) -> String {
    format!(
        "{}/{}/{}/{}/{}",
        opts.cdn.trim_end_matches('/'),
        cdn_namespace.trim_matches('/'),
        sanitized_name,
        opts.tarball_folder,
        file_name
    )
}

/// Make `target` present in its mirror tree and reconcile the package's
/// tarballs and `info.json` against its retention set.
pub fn sync_module(
    client: &RegistryClient,
    target: &ModuleTarget,
    opts: &MirrorOptions,
    reporter: &mut dyn Reporter,
) -> Result<ModuleReceipt> {
    let unsafe_value = if !is_safe_package_name(&target.name) {
        Some(&target.name)
    } else if !is_safe_version(&target.version) {
        Some(&target.version)
    } else {
        None
    };
    if let Some(value) = unsafe_value {
        return Err(RegistryError::UnsafePath {
            name: target.name.clone(),
            value: value.clone(),
        }
        .into());
    }

    let info = client.fetch_info(&target.name, None)?;
    let record = info
        .versions
        .get(&target.version)
        .ok_or_else(|| MissingVersionError::Version {
            name: target.name.clone(),
            version: target.version.clone(),
        })?;
    let tarball = record
        .dist
        .tarball
        .as_deref()
        .ok_or_else(|| MissingVersionError::Tarball {
            name: target.name.clone(),
            version: target.version.clone(),
        })?;
    let extension = tarball_extension(tarball).to_string();

    let layout = ModuleLayout::new(&target.cdn_folder, &target.name, opts);
    fs::create_dir_all(&layout.tarball_dir)
        .with_context(|| format!("failed to create {}", layout.tarball_dir.display()))?;

    reporter.info(&format!("SYNC {}@{} from {tarball}", target.name, target.version));
    client
        .download_tarball(
            tarball,
            &layout.tarball_dir,
            &tarball_file_name(&target.version, &extension),
        )
        .with_context(|| format!("failed to mirror {}@{}", target.name, target.version))?;

    let retained = select_versions_to_keep(client, &target.name, opts, target.parent.as_deref())?;
    let file_name_for = |version: &str, record: &VersionRecord| {
        let ext = record
            .dist
            .tarball
            .as_deref()
            .map(tarball_extension)
            .unwrap_or(&extension);
        tarball_file_name(version, ext)
    };

    let mut manifest = PackageInfo::clone(&info);
    let mut pruned = Vec::new();
    manifest.versions.retain(|version, _| {
        let keep = retained.contains(version);
        if !keep {
            pruned.push(version.clone());
        }
        keep
    });

    let expected_files: BTreeSet<String> = manifest
        .versions
        .iter()
        .map(|(version, record)| file_name_for(version, record))
        .collect();
    for removed in prune_tarballs(&layout.tarball_dir, &expected_files)? {
        reporter.info(&format!("{}: pruned {removed}", target.name));
    }

    for (version, record) in manifest.versions.iter_mut() {
        let file_name = file_name_for(version, record);
        if layout.tarball_dir.join(&file_name).is_file() {
            record.dist.tarball = Some(cdn_tarball_url(
                opts,
                &target.cdn_namespace,
                &layout.sanitized_name,
                &file_name,
            ));
        }
    }

    write_manifest(&layout.info_path, &manifest)?;
    reporter.info(&format!("wrote {}", layout.info_path.display()));

    Ok(ModuleReceipt {
        name: target.name.clone(),
        version: target.version.clone(),
        parent: target.parent.clone(),
        cdn_folder: target.cdn_folder.clone(),
        retained,
        pruned,
    })
}

/// Delete every file in `tarball_dir` not named in `expected`.
fn prune_tarballs(tarball_dir: &Path, expected: &BTreeSet<String>) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    let entries = fs::read_dir(tarball_dir)
        .with_context(|| format!("failed to read {}", tarball_dir.display()))?;

    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read {}", tarball_dir.display()))?;
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if expected.contains(&file_name) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => removed.push(file_name),
            // Another sync of the same package got there first.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to remove {}", entry.path().display()));
            }
        }
    }

    removed.sort();
    Ok(removed)
}

/// Serialize with four-space indentation and replace `path` atomically.
pub fn write_manifest(path: &Path, manifest: &PackageInfo) -> Result<()> {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"    "));
    manifest
        .serialize(&mut ser)
        .context("failed to serialize info manifest")?;

    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    tmp.write_all(&buf)
        .with_context(|| format!("failed to write {}", path.display()))?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
