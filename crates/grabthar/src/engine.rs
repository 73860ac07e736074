//! Mirror generation lifecycle.
//!
//! One run cleans stale versioned subtrees, mirrors every retained root
//! version into `{mirror_root}/{release_version}` and, when asked, repeats
//! the whole pass into the bare mirror root for legacy consumers. Registry
//! metadata is read through one [`RegistryClient`] cache for the whole run.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use semver::Version;

use crate::mirror::sync_module;
use crate::registry::RegistryClient;
use crate::retention::select_versions_to_keep;
use crate::types::{MirrorOptions, MirrorReceipt, ModuleReceipt, ModuleTarget};

pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Info,
    Warn,
    Error,
}

/// Holds a worker thread's messages until they can be replayed in order.
#[derive(Debug, Default)]
struct BufferedReporter {
    messages: Vec<(Level, String)>,
}

impl BufferedReporter {
    fn replay(self, reporter: &mut dyn Reporter) {
        for (level, msg) in self.messages {
            match level {
                Level::Info => reporter.info(&msg),
                Level::Warn => reporter.warn(&msg),
                Level::Error => reporter.error(&msg),
            }
        }
    }
}

impl Reporter for BufferedReporter {
    fn info(&mut self, msg: &str) {
        self.messages.push((Level::Info, msg.to_string()));
    }

    fn warn(&mut self, msg: &str) {
        self.messages.push((Level::Warn, msg.to_string()));
    }

    fn error(&mut self, msg: &str) {
        self.messages.push((Level::Error, msg.to_string()));
    }
}

/// Where one pass writes and which namespace its rewritten URLs carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorPass {
    pub cdn_folder: PathBuf,
    pub cdn_namespace: String,
}

impl MirrorPass {
    pub fn versioned(opts: &MirrorOptions) -> Self {
        Self {
            cdn_folder: opts.mirror_root.join(&opts.release_version),
            cdn_namespace: format!(
                "{}/{}",
                opts.namespace.trim_end_matches('/'),
                opts.release_version
            ),
        }
    }

    pub fn legacy(opts: &MirrorOptions) -> Self {
        Self {
            cdn_folder: opts.mirror_root.clone(),
            cdn_namespace: opts.namespace.trim_end_matches('/').to_string(),
        }
    }

    fn target(&self, name: &str, version: &str, parent: Option<&str>) -> ModuleTarget {
        ModuleTarget {
            name: name.to_string(),
            version: version.to_string(),
            parent: parent.map(str::to_string),
            cdn_namespace: self.cdn_namespace.clone(),
            cdn_folder: self.cdn_folder.clone(),
        }
    }
}

/// Create `mirror_root` if needed and delete its direct entries whose names
/// are semver versions. Everything else is left alone.
pub fn clean_versioned_subtrees(mirror_root: &Path) -> Result<Vec<String>> {
    if !mirror_root.exists() {
        fs::create_dir_all(mirror_root)
            .with_context(|| format!("failed to create {}", mirror_root.display()))?;
        return Ok(Vec::new());
    }

    let mut removed = Vec::new();
    let entries = fs::read_dir(mirror_root)
        .with_context(|| format!("failed to read {}", mirror_root.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read {}", mirror_root.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if Version::parse(&name).is_err() {
            continue;
        }

        let path = entry.path();
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        }
        .with_context(|| format!("failed to remove {}", path.display()))?;
        removed.push(name);
    }

    removed.sort();
    Ok(removed)
}

/// Sync one root version and, with `recursive`, each dependency it declares.
pub fn sync_recursive(
    client: &RegistryClient,
    name: &str,
    version: &str,
    pass: &MirrorPass,
    opts: &MirrorOptions,
    reporter: &mut dyn Reporter,
) -> Result<Vec<ModuleReceipt>> {
    let root = sync_module(client, &pass.target(name, version, None), opts, reporter)?;
    let mut receipts = vec![root];
    if !opts.recursive {
        return Ok(receipts);
    }

    let info = client.fetch_info(name, None)?;
    let dependencies = info
        .versions
        .get(version)
        .map(|record| record.dependencies.clone())
        .unwrap_or_default();
    receipts.extend(sync_dependencies(
        client,
        name,
        &dependencies,
        pass,
        opts,
        reporter,
    )?);
    Ok(receipts)
}

/// Mirror every dependency on its own thread. All of them run to
/// completion; the first failure in dependency-name order is returned.
fn sync_dependencies(
    client: &RegistryClient,
    parent: &str,
    dependencies: &BTreeMap<String, String>,
    pass: &MirrorPass,
    opts: &MirrorOptions,
    reporter: &mut dyn Reporter,
) -> Result<Vec<ModuleReceipt>> {
    let outcomes: Vec<(Result<ModuleReceipt>, BufferedReporter)> = thread::scope(|scope| {
        let handles: Vec<_> = dependencies
            .iter()
            .map(|(dependency, requirement)| {
                let target = pass.target(dependency, requirement, Some(parent));
                scope.spawn(move || {
                    let mut buffer = BufferedReporter::default();
                    let result = sync_module(client, &target, opts, &mut buffer);
                    (result, buffer)
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    (
                        Err(anyhow!("mirror worker for a dependency of {parent} panicked")),
                        BufferedReporter::default(),
                    )
                })
            })
            .collect()
    });

    let mut receipts = Vec::with_capacity(outcomes.len());
    let mut first_error = None;
    for (result, buffer) in outcomes {
        buffer.replay(reporter);
        match result {
            Ok(receipt) => receipts.push(receipt),
            Err(err) => {
                reporter.error(&format!("{err:#}"));
                first_error.get_or_insert(err);
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(receipts),
    }
}

/// Mirror each retained version of the root package into `pass`.
pub fn run_pass(
    client: &RegistryClient,
    pass: &MirrorPass,
    opts: &MirrorOptions,
    reporter: &mut dyn Reporter,
) -> Result<Vec<ModuleReceipt>> {
    let versions = select_versions_to_keep(client, &opts.module, opts, None)?;
    reporter.info(&format!(
        "mirroring {} version(s) of {} into {}",
        versions.len(),
        opts.module,
        pass.cdn_folder.display()
    ));

    let mut receipts = Vec::new();
    for version in &versions {
        receipts.extend(sync_recursive(
            client,
            &opts.module,
            version,
            pass,
            opts,
            reporter,
        )?);
    }
    Ok(receipts)
}

/// Full generation run: tag check, cleanup, versioned pass, legacy pass.
pub fn generate_mirror(
    client: &RegistryClient,
    opts: &MirrorOptions,
    reporter: &mut dyn Reporter,
) -> Result<MirrorReceipt> {
    let started_at = Utc::now();

    if let Some(tag) = opts.dist_tag.as_deref() {
        client.fetch_info(&opts.module, Some(tag))?;
    }

    let removed_subtrees = clean_versioned_subtrees(&opts.mirror_root)?;
    for removed in &removed_subtrees {
        reporter.info(&format!("removed stale mirror subtree {removed}"));
    }

    let mut modules = run_pass(client, &MirrorPass::versioned(opts), opts, reporter)?;
    if opts.legacy_overwrite {
        reporter.info("writing legacy mirror tree");
        modules.extend(run_pass(client, &MirrorPass::legacy(opts), opts, reporter)?);
    }

    Ok(MirrorReceipt {
        module: opts.module.clone(),
        release_version: opts.release_version.clone(),
        started_at,
        finished_at: Utc::now(),
        removed_subtrees,
        modules,
    })
}
