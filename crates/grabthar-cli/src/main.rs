use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use grabthar::config::{CONFIG_FILE_NAME, CliOverrides, GrabtharConfig, ProjectFiles};
use grabthar::deps::{self, DependencyReport, PackageLock};
use grabthar::engine::{self, Reporter};
use grabthar::error::ConfigurationError;
use grabthar::registry::{NPM_REGISTRY, RegistryClient};
use grabthar::types::MirrorReceipt;
use grabthar::{git, npm};

const PACKAGE_LOCK: &str = "package-lock.json";

#[derive(Parser, Debug)]
#[command(name = "grabthar", version)]
#[command(about = "Release tooling for npm packages: registry checks, dist-tag activation and CDN mirroring")]
struct Cli {
    /// Path to the config file (default: .grabthar.toml in the current directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Package to operate on (default: name from package.json)
    #[arg(long, global = true)]
    module: Option<String>,

    /// Registry base URL (default: https://registry.npmjs.org)
    #[arg(long, global = true)]
    registry: Option<String>,

    /// Path to package.json
    #[arg(long, global = true, default_value = "package.json")]
    package: PathBuf,

    /// Path to .nodeops
    #[arg(long, global = true, default_value = ".nodeops")]
    nodeops: PathBuf,

    /// Per-request HTTP timeout (e.g. 30s, 2m)
    #[arg(long, global = true)]
    timeout: Option<String>,

    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    /// Print per-package detail.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Mirror the package's retained tarballs into the CDN folder and commit it.
    Cdnify(CdnifyArgs),
    /// Require a clean working tree that matches its upstream branch.
    ValidateGit,
    /// Require a lockfile without nested runtime dependencies.
    ValidateFlat {
        #[arg(long, default_value = PACKAGE_LOCK)]
        lockfile: PathBuf,
    },
    /// Check that a dist-tag on the registry points at a version.
    VerifyPublish {
        #[arg(long)]
        version: String,
        #[arg(long)]
        dist_tag: String,
    },
    /// Point active-<env> dist-tags at a version, verify them, then cdnify.
    Activate {
        /// Version to activate (default: latest version per npm)
        #[arg(long)]
        version: Option<String>,
        /// Comma-separated environments (default: all)
        #[arg(long)]
        envs: Option<String>,
        /// npm two-factor code, used when NPM_TOKEN is not set
        #[arg(long)]
        otp: Option<String>,
        /// Skip the clean-tree and upstream checks.
        #[arg(long)]
        skip_git_check: bool,
        /// Stop after the dist-tags are verified.
        #[arg(long)]
        no_cdnify: bool,
        #[command(flatten)]
        cdnify: CdnifyArgs,
    },
    /// Show dependency version changes between two lockfiles and who depends on them.
    DependencyDiff {
        /// Existing lockfile (default: package-lock.json as committed on the current branch)
        #[arg(long)]
        existing: Option<PathBuf>,
        #[arg(long, default_value = PACKAGE_LOCK)]
        candidate: PathBuf,
    },
    /// Write a default .grabthar.toml.
    InitConfig {
        #[arg(long, default_value = CONFIG_FILE_NAME)]
        output: PathBuf,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Parse and validate the config file.
    CheckConfig,
}

#[derive(Args, Debug)]
struct CdnifyArgs {
    /// CDN base URL (default: https://www.mycdn.com)
    #[arg(long)]
    cdn: Option<String>,

    /// CDN namespace (default: web.staticNamespace from .nodeops)
    #[arg(long)]
    namespace: Option<String>,

    /// Local mirror directory (default: cdn)
    #[arg(long)]
    mirror_root: Option<PathBuf>,

    #[arg(long)]
    info_file: Option<String>,

    #[arg(long)]
    tarball_folder: Option<String>,

    /// Also mirror each retained version's dependencies.
    #[arg(long)]
    recursive: bool,

    /// Historical stable versions kept besides dist-tag targets.
    #[arg(long)]
    versions_to_keep: Option<usize>,

    /// Dist-tag the package must carry (default: latest; "" disables the check)
    #[arg(long)]
    dist_tag: Option<String>,

    /// Also write the unversioned legacy tree.
    #[arg(long)]
    legacy_overwrite_cdn: bool,

    /// Release version naming the versioned subtree (default: version from package.json)
    #[arg(long)]
    release_version: Option<String>,

    /// Generate only; leave the mirror uncommitted.
    #[arg(long, conflicts_with = "commit_only")]
    no_commit: bool,

    /// Skip generation and commit the existing mirror.
    #[arg(long)]
    commit_only: bool,
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cwd = env::current_dir().context("failed to resolve current directory")?;
    let mut reporter = CliReporter;

    match &cli.cmd {
        Commands::Cdnify(args) => run_cdnify(&cli, args, &cwd, &mut reporter),
        Commands::ValidateGit => {
            git::ensure_git_clean(&cwd)?;
            git::ensure_upstream_in_sync(&cwd)?;
            println!("git: clean and in sync with {}", git::UPSTREAM);
            Ok(())
        }
        Commands::ValidateFlat { lockfile } => run_validate_flat(lockfile),
        Commands::VerifyPublish { version, dist_tag } => {
            let config = load_config(&cli, &cwd)?;
            let module = resolve_module(&cli, &config)?;
            let client = registry_client(&cli, &config)?;
            client.verify_dist_tag(&module, dist_tag, version)?;
            println!("{module}@{version}: {dist_tag} ok");
            Ok(())
        }
        Commands::Activate {
            version,
            envs,
            otp,
            skip_git_check,
            no_cdnify,
            cdnify,
        } => {
            if !skip_git_check {
                git::ensure_git_clean(&cwd)?;
                git::ensure_upstream_in_sync(&cwd)?;
            }
            let config = load_config(&cli, &cwd)?;
            let module = resolve_module(&cli, &config)?;
            let environments = npm::parse_environments(envs.as_deref())?;
            let auth = npm::NpmAuth::from_env(otp.clone())?;
            let timeout = Some(config.process.timeout);
            let version = match version {
                Some(v) => v.clone(),
                None => npm::view_version(&cwd, &module, timeout)?,
            };
            let client = registry_client(&cli, &config)?;
            let tags = npm::activate(
                &client,
                &cwd,
                &module,
                &version,
                &environments,
                &auth,
                timeout,
                &mut reporter,
            )?;
            for tag in tags {
                println!("{module}@{version}: {tag}");
            }
            if *no_cdnify {
                return Ok(());
            }
            run_cdnify(&cli, cdnify, &cwd, &mut reporter)
        }
        Commands::DependencyDiff {
            existing,
            candidate,
        } => {
            let existing = match existing {
                Some(path) => PackageLock::load(path)?,
                None => {
                    let body = git::show_committed_file(&cwd, PACKAGE_LOCK)?;
                    PackageLock::from_json(&format!("committed {PACKAGE_LOCK}"), &body)?
                }
            };
            let candidate = PackageLock::load(candidate)?;
            let report = deps::dependency_report(&existing, &candidate);
            print_dependency_report(&report, cli.json)
        }
        Commands::InitConfig { output, force } => {
            if output.exists() && !force {
                bail!("{} already exists; pass --force to overwrite", output.display());
            }
            fs::write(output, GrabtharConfig::default_toml_template())
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("wrote {}", output.display());
            Ok(())
        }
        Commands::CheckConfig => {
            let config = load_config(&cli, &cwd)?;
            config.validate()?;
            println!("config: ok");
            Ok(())
        }
    }
}

fn run_cdnify(cli: &Cli, args: &CdnifyArgs, cwd: &Path, reporter: &mut dyn Reporter) -> Result<()> {
    let config = load_config(cli, cwd)?;
    config.validate()?;

    let mirror_root = args
        .mirror_root
        .clone()
        .or_else(|| config.mirror.mirror_root.clone())
        .unwrap_or_else(|| PathBuf::from("cdn"));

    if !args.commit_only {
        let project = ProjectFiles::load(&cli.package, &cli.nodeops)?;
        let overrides = CliOverrides {
            module: cli.module.clone(),
            registry: cli.registry.clone(),
            cdn: args.cdn.clone(),
            namespace: args.namespace.clone(),
            mirror_root: Some(mirror_root.clone()),
            info_file: args.info_file.clone(),
            tarball_folder: args.tarball_folder.clone(),
            recursive: args.recursive,
            versions_to_keep: args.versions_to_keep,
            dist_tag: args.dist_tag.clone(),
            legacy_overwrite: args.legacy_overwrite_cdn,
            release_version: args.release_version.clone(),
        };
        let opts = config.build_mirror_options(overrides, &project)?;
        let http = config.build_http_options(parse_timeout(cli)?);
        let client = RegistryClient::new(&opts.registry, &http)?;

        let receipt = engine::generate_mirror(&client, &opts, reporter)?;
        print_mirror_receipt(&receipt, cli.json, cli.verbose)?;
    }

    if !args.no_commit {
        if git::commit_mirror(cwd, &mirror_root, Some(config.process.timeout))? {
            reporter.info(&format!("committed and pushed {}", mirror_root.display()));
        } else {
            reporter.info("mirror unchanged; nothing to commit");
        }
    }

    Ok(())
}

fn run_validate_flat(lockfile: &Path) -> Result<()> {
    if !lockfile.exists() {
        println!("{}: not found, nothing to check", lockfile.display());
        return Ok(());
    }
    let lock = PackageLock::load(lockfile)?;
    deps::ensure_flat(&lock)?;
    println!("{}: flat", lockfile.display());
    Ok(())
}

fn load_config(cli: &Cli, cwd: &Path) -> Result<GrabtharConfig> {
    match &cli.config {
        Some(path) => GrabtharConfig::load_from_file(path),
        None => Ok(GrabtharConfig::load_from_dir(cwd)?.unwrap_or_default()),
    }
}

fn resolve_module(cli: &Cli, config: &GrabtharConfig) -> Result<String> {
    if let Some(module) = cli.module.clone().or_else(|| config.mirror.module.clone()) {
        return Ok(module);
    }
    let project = ProjectFiles::load(&cli.package, &cli.nodeops)?;
    match project.package_name() {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        _ => Err(ConfigurationError::MissingModule.into()),
    }
}

fn registry_client(cli: &Cli, config: &GrabtharConfig) -> Result<RegistryClient> {
    let registry = cli
        .registry
        .clone()
        .or_else(|| config.mirror.registry.clone())
        .unwrap_or_else(|| NPM_REGISTRY.to_string());
    RegistryClient::new(&registry, &config.build_http_options(parse_timeout(cli)?))
}

fn parse_timeout(cli: &Cli) -> Result<Option<Duration>> {
    cli.timeout.as_deref().map(parse_duration).transpose()
}

fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s).with_context(|| format!("invalid duration: {s}"))
}

fn print_mirror_receipt(receipt: &MirrorReceipt, json: bool, verbose: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(receipt)?);
        return Ok(());
    }

    let elapsed = (receipt.finished_at - receipt.started_at)
        .to_std()
        .unwrap_or_default();
    println!("module: {}", receipt.module);
    println!("release_version: {}", receipt.release_version);
    for removed in &receipt.removed_subtrees {
        println!("removed: {removed}");
    }
    println!(
        "synced: {} ({})",
        receipt.modules.len(),
        humantime::format_duration(Duration::from_millis(elapsed.as_millis() as u64))
    );

    if verbose {
        for m in &receipt.modules {
            let parent = m
                .parent
                .as_deref()
                .map(|p| format!(" (via {p})"))
                .unwrap_or_default();
            println!(
                "{}@{}{parent} -> {}: kept [{}], pruned [{}]",
                m.name,
                m.version,
                m.cdn_folder.display(),
                m.retained.join(", "),
                m.pruned.join(", ")
            );
        }
    }
    Ok(())
}

fn print_dependency_report(report: &DependencyReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    if report.changes.is_empty() {
        println!("no dependency version changes");
        return Ok(());
    }

    println!("changed:");
    for (name, change) in &report.changes {
        println!("- {name}: {} -> {}", change.existing, change.candidate);
    }
    println!("dependents:");
    for (module, requires) in &report.dependents {
        let requires: Vec<&str> = requires.iter().map(String::as_str).collect();
        println!("- {module} (requires {})", requires.join(", "));
    }
    Ok(())
}
