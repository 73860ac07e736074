//! Child process execution for the git and npm collaborators.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

pub fn run_command_with_timeout(
    program: &str,
    args: &[&str],
    working_dir: &Path,
    timeout: Option<Duration>,
) -> Result<CommandOutput> {
    run_command_with_env(program, args, working_dir, &[], timeout)
}

/// Like [`run_command_with_timeout`], with extra environment variables for the child.
pub fn run_command_with_env(
    program: &str,
    args: &[&str],
    working_dir: &Path,
    envs: &[(&str, &str)],
    timeout: Option<Duration>,
) -> Result<CommandOutput> {
    let start = Instant::now();
    let mut command = Command::new(program);
    command.args(args).current_dir(working_dir);
    for (key, value) in envs {
        command.env(key, value);
    }

    let (exit_code, stdout, stderr, timed_out) = if let Some(timeout_dur) = timeout {
        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))?;

        let deadline = Instant::now() + timeout_dur;
        loop {
            match child.try_wait().context("failed to poll command")? {
                Some(status) => {
                    let (stdout, stderr) = drain(&mut child);
                    break (status.code().unwrap_or(-1), stdout, stderr, false);
                }
                None if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    let (stdout, mut stderr) = drain(&mut child);
                    stderr.push_str(&format!(
                        "\ncommand timed out after {}",
                        humantime::format_duration(timeout_dur)
                    ));
                    break (-1, stdout, stderr, true);
                }
                None => std::thread::sleep(Duration::from_millis(100)),
            }
        }
    } else {
        let output = command
            .output()
            .with_context(|| format!("failed to execute {program}"))?;

        (
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
            false,
        )
    };

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
        timed_out,
        duration: start.elapsed(),
    })
}

fn drain(child: &mut Child) -> (String, String) {
    let mut stdout_bytes = Vec::new();
    let mut stderr_bytes = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_end(&mut stdout_bytes);
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_end(&mut stderr_bytes);
    }
    (
        String::from_utf8_lossy(&stdout_bytes).to_string(),
        String::from_utf8_lossy(&stderr_bytes).to_string(),
    )
}

/// Run to completion and return trimmed stdout, failing with the child's
/// stderr (or stdout) when it exits non-zero or outlives `timeout`.
pub fn run_checked(
    program: &str,
    args: &[&str],
    working_dir: &Path,
    timeout: Option<Duration>,
) -> Result<String> {
    let out = run_command_with_timeout(program, args, working_dir, timeout)?;
    if !out.success() {
        let detail = if out.stderr.trim().is_empty() {
            out.stdout.trim()
        } else {
            out.stderr.trim()
        };
        bail!(
            "{program} {} failed (exit {}): {detail}",
            args.join(" "),
            out.exit_code
        );
    }
    Ok(out.stdout.trim().to_string())
}
