//! Stage runner: one full cycle of patch application and test execution
//! inside a single disposable container.
//!
//! Every stage persists a log, whatever the outcome, so a run stays
//! auditable from disk alone.
use crate::docker::DockerCli;
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::Path;
use std::time::{Duration, Instant};

/// A patch queued for delivery and application, in order.
pub struct PatchStep<'a> {
    /// Human label used in logs and statuses ("test_patch", "fix_patch").
    pub name: &'a str,
    pub contents: &'a str,
    /// Absolute destination inside the container.
    pub dest: &'a str,
}

/// Everything a stage needs besides the container itself.
pub struct StageSpec<'a> {
    /// Log heading, e.g. "Stage 1: Test with only test_patch".
    pub label: &'a str,
    pub image: &'a str,
    pub test_files: &'a [String],
    pub patches: &'a [PatchStep<'a>],
    pub timeout: Duration,
    pub log_path: &'a Path,
    /// Clock covering the full stage (container start included), owned by
    /// the caller.
    pub started: Instant,
}

/// Captured result of a completed test execution. Never mutated after
/// creation.
#[derive(Debug)]
pub struct StageOutcome {
    pub exit_code: i32,
    pub output: String,
    pub elapsed: Duration,
    pub passed: bool,
}

/// How a stage ended. Apply failures and timeouts are terminal for the
/// instance; the caller maps them onto stage-specific statuses.
#[derive(Debug)]
pub enum StageRun {
    Completed(StageOutcome),
    ApplyFailed { patch_name: String, output: String },
    TimedOut,
}

/// Build the pytest invocation for the extracted test files.
pub fn build_test_command(test_files: &[String]) -> String {
    format!("cd /testbed && pytest -rA {} -v", test_files.join(" "))
}

/// Apply the stage's patches in order, then run the tests under the stage
/// timeout. The stage log is written on every path; an apply failure aborts
/// the stage before any test runs.
pub fn run_stage(docker: &DockerCli, container: &str, spec: &StageSpec<'_>) -> Result<StageRun> {
    for patch in spec.patches {
        docker
            .put_archive(container, patch.dest, patch.contents)
            .with_context(|| format!("deliver {} to {container}", patch.name))?;
        let apply = docker.exec(container, &format!("cd /testbed && git apply {}", patch.dest))?;
        if apply.exit_code != 0 {
            let output = apply.output_text();
            write_log(
                spec.log_path,
                &format!("=== Failed to apply {} ===\n{output}", patch.name),
            )?;
            return Ok(StageRun::ApplyFailed {
                patch_name: patch.name.to_string(),
                output,
            });
        }
    }

    let test_cmd = build_test_command(spec.test_files);
    let exec = docker.exec_bounded(container, &test_cmd, spec.timeout)?;

    if exec.timed_out {
        // No output is available for the hung run; the log records the
        // bound that was exceeded instead.
        let mut log = stage_header(spec, &test_cmd);
        let _ = writeln!(log, "=== TIMEOUT ===");
        let _ = writeln!(
            log,
            "Test execution exceeded timeout of {} seconds",
            spec.timeout.as_secs()
        );
        write_log(spec.log_path, &log)?;
        return Ok(StageRun::TimedOut);
    }

    let outcome = StageOutcome {
        exit_code: exec.exit_code,
        output: exec.output_text(),
        elapsed: spec.started.elapsed(),
        passed: exec.exit_code == 0,
    };

    let mut log = stage_header(spec, &test_cmd);
    let _ = writeln!(log, "=== Test Output ===");
    log.push_str(&outcome.output);
    let _ = write!(log, "\n\n=== Exit Code ===\n{}\n", outcome.exit_code);
    let _ = write!(
        log,
        "\n=== Test Time ===\n{:.2} seconds\n",
        outcome.elapsed.as_secs_f64()
    );
    let _ = write!(log, "\n=== All Passed ===\n{}\n", outcome.passed);
    write_log(spec.log_path, &log)?;

    Ok(StageRun::Completed(outcome))
}

/// Log for a stage that failed before patches were applied (pytest
/// bootstrap failure).
pub fn write_bootstrap_failure_log(log_path: &Path, label: &str, message: &str) -> Result<()> {
    write_log(log_path, &format!("=== {label} ===\n{message}"))
}

fn stage_header(spec: &StageSpec<'_>, test_cmd: &str) -> String {
    let mut log = String::new();
    let _ = writeln!(log, "=== {} ===\n", spec.label);
    let _ = writeln!(log, "=== Image ===\n{}\n", spec.image);
    let _ = writeln!(log, "=== Test Files ===");
    for file in spec.test_files {
        let _ = writeln!(log, "  - {file}");
    }
    let _ = writeln!(log, "\n=== Test Command ===");
    let _ = writeln!(log, "{test_cmd}\n");
    log
}

fn write_log(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    std::fs::write(path, contents).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
