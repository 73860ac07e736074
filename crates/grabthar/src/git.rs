use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::process::{run_checked, run_command_with_timeout};

pub const UPSTREAM: &str = "origin";
pub const MIRROR_COMMIT_MESSAGE: &str = "Generate CDN packages";

/// How the local branch relates to its upstream counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    InSync,
    Behind,
    Ahead,
    Diverged,
}

/// Classify from the local head, the upstream head and their merge base.
pub fn classify_upstream(local: &str, remote: &str, base: &str) -> UpstreamState {
    if local == remote {
        UpstreamState::InSync
    } else if local == base {
        UpstreamState::Behind
    } else if remote == base {
        UpstreamState::Ahead
    } else {
        UpstreamState::Diverged
    }
}

pub fn is_git_clean(repo_root: &Path) -> Result<bool> {
    is_git_clean_with(&git_program(), repo_root)
}

pub fn ensure_git_clean(repo_root: &Path) -> Result<()> {
    if !is_git_clean(repo_root)? {
        bail!("cannot continue with unstaged or uncommitted changes");
    }
    Ok(())
}

pub fn upstream_state(repo_root: &Path) -> Result<UpstreamState> {
    upstream_state_with(&git_program(), repo_root)
}

pub fn ensure_upstream_in_sync(repo_root: &Path) -> Result<()> {
    match upstream_state(repo_root)? {
        UpstreamState::InSync => Ok(()),
        UpstreamState::Behind => bail!("local repo behind upstream repo"),
        UpstreamState::Ahead => bail!("local repo ahead of upstream repo"),
        UpstreamState::Diverged => bail!("local repo diverged from upstream repo"),
    }
}

/// Stage, commit and push `mirror_root`. Returns `false` without touching
/// the repository when the mirror has no changes. The push is killed after
/// `push_timeout`.
pub fn commit_mirror(
    repo_root: &Path,
    mirror_root: &Path,
    push_timeout: Option<Duration>,
) -> Result<bool> {
    commit_mirror_with(&git_program(), repo_root, mirror_root, push_timeout)
}

/// Contents of `file` as committed on the current branch.
pub fn show_committed_file(repo_root: &Path, file: &str) -> Result<String> {
    show_committed_file_with(&git_program(), repo_root, file)
}

fn is_git_clean_with(program: &str, repo_root: &Path) -> Result<bool> {
    let out = run_command_with_timeout(program, &["status", "--porcelain"], repo_root, None)
        .context("failed to execute git status; is git installed?")?;

    if !out.success() {
        bail!("git status failed: {}", out.stderr.trim());
    }

    Ok(out.stdout.trim().is_empty())
}

fn current_branch_with(program: &str, repo_root: &Path) -> Result<String> {
    let branch = run_checked(program, &["rev-parse", "--abbrev-ref", "HEAD"], repo_root, None)?;
    if branch == "HEAD" {
        bail!("detached HEAD has no upstream branch");
    }
    Ok(branch)
}

fn upstream_state_with(program: &str, repo_root: &Path) -> Result<UpstreamState> {
    let branch = current_branch_with(program, repo_root)?;
    let remote_ref = format!("{UPSTREAM}/{branch}");

    let local = run_checked(program, &["rev-parse", "HEAD"], repo_root, None)?;
    let remote = run_checked(program, &["rev-parse", &remote_ref], repo_root, None)?;
    let base = run_checked(program, &["merge-base", "HEAD", &remote_ref], repo_root, None)?;

    Ok(classify_upstream(&local, &remote, &base))
}

fn commit_mirror_with(
    program: &str,
    repo_root: &Path,
    mirror_root: &Path,
    push_timeout: Option<Duration>,
) -> Result<bool> {
    let path = mirror_root.to_string_lossy();
    let status = run_checked(program, &["status", "--porcelain", "--", &path], repo_root, None)?;
    if status.is_empty() {
        return Ok(false);
    }

    run_checked(program, &["add", "--", &path], repo_root, None)?;
    run_checked(program, &["commit", "-m", MIRROR_COMMIT_MESSAGE], repo_root, None)?;
    run_checked(program, &["push"], repo_root, push_timeout)?;
    Ok(true)
}

fn show_committed_file_with(program: &str, repo_root: &Path, file: &str) -> Result<String> {
    let branch = current_branch_with(program, repo_root)?;
    let out = run_command_with_timeout(
        program,
        &["show", &format!("{branch}:{file}")],
        repo_root,
        None,
    )?;
    if !out.success() {
        bail!("git show {branch}:{file} failed: {}", out.stderr.trim());
    }
    Ok(out.stdout)
}

fn git_program() -> String {
    env::var("GRABTHAR_GIT_BIN").unwrap_or_else(|_| "git".to_string())
}
