//! Per-instance evaluator: input validation, the two-stage protocol, and
//! container lifecycle ownership.
//!
//! Stage 1 applies only the test patch against the pristine image (the tests
//! are expected to fail); stage 2 applies fix then test patch in a brand-new
//! container from the same image. At most one container exists per instance
//! at any time: stage 1's container is fully removed before stage 2's is
//! created, so stage 2 observes nothing beyond the image baseline.
use crate::docker::{DockerCli, PYTEST_INSTALL_TIMEOUT};
use crate::instance::{self, INSTANCE_JSON};
use crate::patch;
use crate::report::{EvaluationResult, StatusKind};
use crate::stage::{self, PatchStep, StageRun, StageSpec};
use crate::util::truncate_string;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Cap on raw tool output quoted inside result messages; full output lives
/// in the stage logs.
const MAX_MESSAGE_BYTES: usize = 8192;

const TEST_PATCH_DEST: &str = "/tmp/test.patch";
const FIX_PATCH_DEST: &str = "/tmp/fix.patch";
const LOGS_DIR: &str = "evaluation_logs";

/// Run parameters shared by every instance of one evaluation run.
#[derive(Debug, Clone)]
pub struct EvalConfig {
    pub output_dir: PathBuf,
    pub namespace: String,
    pub arch: String,
    pub tag: String,
    pub timeout: Duration,
    pub install_pytest: bool,
}

/// Derive the instance's classification from the two stage outcomes.
///
/// `f2p_pass` implies `env_pass`, never the reverse: a genuine fix turns a
/// previously-failing check into a passing one, while a fix that merely
/// preserves an already-passing check is only evidence that the environment
/// works.
pub fn classify(stage1_passed: bool, stage2_passed: bool) -> (StatusKind, bool, bool) {
    let env_pass = stage2_passed;
    let f2p_pass = !stage1_passed && stage2_passed;
    let status = if f2p_pass {
        StatusKind::F2pPassed
    } else if env_pass {
        StatusKind::EnvPassed
    } else {
        StatusKind::Failed
    };
    (status, env_pass, f2p_pass)
}

/// Evaluate one instance end-to-end. Never returns an error: anything
/// unanticipated is logged to `error.log` and folded into an `error` result
/// so one instance can never abort the batch.
pub fn evaluate_instance(
    docker: &DockerCli,
    config: &EvalConfig,
    instance_id: &str,
) -> EvaluationResult {
    match evaluate_inner(docker, config, instance_id) {
        Ok(result) => result,
        Err(err) => {
            let message = format!("Unexpected error: {err:#}");
            tracing::warn!(instance = instance_id, "{message}");
            let mut result = EvaluationResult::terminal(
                instance_id,
                StatusKind::Error,
                truncate_string(&message, MAX_MESSAGE_BYTES),
            );
            result.error_log =
                write_error_log(&config.output_dir.join(instance_id), instance_id, &message);
            result
        }
    }
}

fn evaluate_inner(
    docker: &DockerCli,
    config: &EvalConfig,
    instance_id: &str,
) -> Result<EvaluationResult> {
    let mut result =
        EvaluationResult::terminal(instance_id, StatusKind::Failed, String::new());

    let instance_dir = config.output_dir.join(instance_id);
    if !instance_dir.exists() {
        result.status = StatusKind::NoInstanceDir;
        result.message = "Instance directory does not exist".to_string();
        return Ok(result);
    }
    if !instance_dir.join(INSTANCE_JSON).exists() {
        result.status = StatusKind::NoInstanceJson;
        result.message = format!("{INSTANCE_JSON} not found");
        return Ok(result);
    }

    let descriptor = instance::load_descriptor(&instance_dir)?;
    if descriptor.test_patch.is_empty() {
        result.status = StatusKind::NoTestPatch;
        result.message = "test_patch is empty".to_string();
        return Ok(result);
    }

    let test_files = patch::extract_test_files(&descriptor.test_patch);
    if test_files.is_empty() {
        result.status = StatusKind::NoTestFiles;
        result.message = "No test files found in test_patch".to_string();
        return Ok(result);
    }

    let image = instance::image_name(instance_id, &config.namespace, &config.arch, &config.tag);
    result.image_name = Some(image.clone());
    // Fail fast on a missing image; no container is allocated for it.
    if !docker.image_exists(&image)? {
        result.status = StatusKind::NoImage;
        result.message = format!("Docker image not found: {image}");
        return Ok(result);
    }

    let logs_dir = instance_dir.join(LOGS_DIR);
    std::fs::create_dir_all(&logs_dir)
        .with_context(|| format!("create {}", logs_dir.display()))?;
    let test_only_log = logs_dir.join("test_only.log");
    let both_patches_log = logs_dir.join("both_patches.log");

    let container = instance::container_name(instance_id, chrono::Utc::now().timestamp());
    let mut guard = ContainerGuard::new(docker);

    // Stage 1: test patch only, against the pristine image.
    let stage1_started = Instant::now();
    docker.start_container(&container, &image)?;
    guard.arm(&container);

    if config.install_pytest {
        let bootstrap = docker.ensure_pytest(&container, PYTEST_INSTALL_TIMEOUT)?;
        if !bootstrap.ok {
            stage::write_bootstrap_failure_log(
                &test_only_log,
                "Failed to install pytest",
                &bootstrap.message,
            )?;
            result.status = StatusKind::PytestInstallFailed;
            result.message = format!("Failed to install pytest: {}", bootstrap.message);
            return Ok(result);
        }
    }

    let stage1_patches = [PatchStep {
        name: "test_patch",
        contents: &descriptor.test_patch,
        dest: TEST_PATCH_DEST,
    }];
    let stage1 = stage::run_stage(
        docker,
        &container,
        &StageSpec {
            label: "Stage 1: Test with only test_patch",
            image: &image,
            test_files: &test_files,
            patches: &stage1_patches,
            timeout: config.timeout,
            log_path: &test_only_log,
            started: stage1_started,
        },
    )?;
    result.test_only_log = Some(test_only_log.display().to_string());

    let stage1_outcome = match stage1 {
        StageRun::Completed(outcome) => outcome,
        StageRun::ApplyFailed { output, .. } => {
            result.status = StatusKind::TestPatchApplyFailed;
            result.message = truncate_string(
                &format!("Failed to apply test_patch: {output}"),
                MAX_MESSAGE_BYTES,
            );
            return Ok(result);
        }
        StageRun::TimedOut => {
            result.status = StatusKind::TestOnlyTimeout;
            result.message = format!(
                "Stage 1 test execution timed out after {}s",
                config.timeout.as_secs()
            );
            return Ok(result);
        }
    };
    result.test_only_time = stage1_outcome.elapsed.as_secs_f64();
    result.test_only_passed = stage1_outcome.passed;

    // Isolation boundary: stage 1's container is gone before stage 2's
    // exists.
    guard.teardown()?;

    // Stage 2: fix patch then test patch, in a fresh container.
    let stage2_started = Instant::now();
    docker.start_container(&container, &image)?;
    guard.arm(&container);

    if config.install_pytest {
        let bootstrap = docker.ensure_pytest(&container, PYTEST_INSTALL_TIMEOUT)?;
        if !bootstrap.ok {
            stage::write_bootstrap_failure_log(
                &both_patches_log,
                "Failed to install pytest (stage 2)",
                &bootstrap.message,
            )?;
            result.status = StatusKind::PytestInstallFailedStage2;
            result.message =
                format!("Failed to install pytest in stage 2: {}", bootstrap.message);
            return Ok(result);
        }
    }

    let stage2_patches = [
        PatchStep {
            name: "fix_patch",
            contents: &descriptor.fix_patch,
            dest: FIX_PATCH_DEST,
        },
        PatchStep {
            name: "test_patch (stage 2)",
            contents: &descriptor.test_patch,
            dest: TEST_PATCH_DEST,
        },
    ];
    let stage2 = stage::run_stage(
        docker,
        &container,
        &StageSpec {
            label: "Stage 2: Test with both fix_patch and test_patch",
            image: &image,
            test_files: &test_files,
            patches: &stage2_patches,
            timeout: config.timeout,
            log_path: &both_patches_log,
            started: stage2_started,
        },
    )?;
    result.both_patches_log = Some(both_patches_log.display().to_string());

    let stage2_outcome = match stage2 {
        StageRun::Completed(outcome) => outcome,
        StageRun::ApplyFailed { patch_name, output } => {
            if patch_name == "fix_patch" {
                result.status = StatusKind::FixPatchApplyFailed;
                result.message = truncate_string(
                    &format!("Failed to apply fix_patch: {output}"),
                    MAX_MESSAGE_BYTES,
                );
            } else {
                result.status = StatusKind::TestPatchApplyFailedStage2;
                result.message = truncate_string(
                    &format!("Failed to apply test_patch in stage 2: {output}"),
                    MAX_MESSAGE_BYTES,
                );
            }
            return Ok(result);
        }
        StageRun::TimedOut => {
            result.status = StatusKind::BothPatchesTimeout;
            result.message = format!(
                "Stage 2 test execution timed out after {}s",
                config.timeout.as_secs()
            );
            return Ok(result);
        }
    };
    result.both_patches_time = stage2_outcome.elapsed.as_secs_f64();
    result.both_patches_passed = stage2_outcome.passed;

    let (status, env_pass, f2p_pass) =
        classify(stage1_outcome.passed, stage2_outcome.passed);
    result.status = status;
    result.env_pass = env_pass;
    result.f2p_pass = f2p_pass;
    result.message = match status {
        StatusKind::F2pPassed => "F2P passed: test_only failed, both_patches passed".to_string(),
        StatusKind::EnvPassed => {
            "Env passed: both_patches passed (but test_only also passed)".to_string()
        }
        _ => "Both_patches stage failed".to_string(),
    };

    // The result is classified; cleanup failures from here on are logged
    // and swallowed by the guard's drop path instead of replacing it.
    drop(guard);
    Ok(result)
}

fn write_error_log(instance_dir: &Path, instance_id: &str, message: &str) -> Option<String> {
    if !instance_dir.exists() {
        return None;
    }
    let logs_dir = instance_dir.join(LOGS_DIR);
    if std::fs::create_dir_all(&logs_dir).is_err() {
        return None;
    }
    let error_log = logs_dir.join("error.log");
    let contents = format!(
        "=== Unexpected Error ===\nError: {message}\nInstance: {instance_id}\nTimestamp: {}\n",
        chrono::Utc::now().to_rfc3339()
    );
    match std::fs::write(&error_log, contents) {
        Ok(()) => Some(error_log.display().to_string()),
        Err(_) => None,
    }
}

/// Scoped ownership of the instance's live container, if any.
///
/// `teardown` is the orderly between-stage path and propagates failures,
/// since stage 2's isolation depends on it; `Drop` covers error paths and
/// the post-classification cleanup, and swallows cleanup errors so they
/// cannot mask the primary result.
struct ContainerGuard<'a> {
    docker: &'a DockerCli,
    name: Option<String>,
}

impl<'a> ContainerGuard<'a> {
    fn new(docker: &'a DockerCli) -> Self {
        ContainerGuard { docker, name: None }
    }

    fn arm(&mut self, name: &str) {
        self.name = Some(name.to_string());
    }

    fn teardown(&mut self) -> Result<()> {
        if let Some(name) = self.name.take() {
            let stopped = self.docker.stop_container(&name);
            let removed = self.docker.remove_container(&name);
            stopped?;
            removed?;
        }
        Ok(())
    }
}

impl Drop for ContainerGuard<'_> {
    fn drop(&mut self) {
        if let Some(name) = self.name.take() {
            if self.docker.stop_container(&name).is_err() {
                tracing::debug!(container = name.as_str(), "container stop failed in cleanup");
            }
            if self.docker.remove_container(&name).is_err() {
                tracing::debug!(
                    container = name.as_str(),
                    "container removal failed in cleanup"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_config(output_dir: &Path) -> EvalConfig {
        EvalConfig {
            output_dir: output_dir.to_path_buf(),
            namespace: "starryzhang".to_string(),
            arch: "x86_64".to_string(),
            tag: "latest".to_string(),
            timeout: Duration::from_secs(600),
            install_pytest: false,
        }
    }

    fn unreachable_docker() -> DockerCli {
        // Validation failures must return before any client call; a bogus
        // program path proves no container work happened.
        DockerCli::with_program(PathBuf::from("/nonexistent/docker"))
    }

    #[test]
    fn classification_truth_table() {
        // (stage1.passed, stage2.passed) -> (status, env_pass, f2p_pass)
        assert_eq!(
            classify(false, true),
            (StatusKind::F2pPassed, true, true)
        );
        assert_eq!(classify(true, true), (StatusKind::EnvPassed, true, false));
        assert_eq!(classify(false, false), (StatusKind::Failed, false, false));
        assert_eq!(classify(true, false), (StatusKind::Failed, false, false));
    }

    #[test]
    fn f2p_implies_env() {
        for stage1 in [false, true] {
            for stage2 in [false, true] {
                let (_, env_pass, f2p_pass) = classify(stage1, stage2);
                assert!(!f2p_pass || env_pass);
            }
        }
    }

    #[test]
    fn missing_instance_dir_is_terminal() {
        let root = tempfile::tempdir().expect("create temp dir");
        let result =
            evaluate_instance(&unreachable_docker(), &test_config(root.path()), "ghost");
        assert_eq!(result.status, StatusKind::NoInstanceDir);
        assert_eq!(result.test_only_time, 0.0);
        assert_eq!(result.both_patches_time, 0.0);
    }

    #[test]
    fn missing_descriptor_is_terminal() {
        let root = tempfile::tempdir().expect("create temp dir");
        std::fs::create_dir_all(root.path().join("inst")).expect("create instance dir");
        let result =
            evaluate_instance(&unreachable_docker(), &test_config(root.path()), "inst");
        assert_eq!(result.status, StatusKind::NoInstanceJson);
    }

    #[test]
    fn empty_test_patch_is_terminal() {
        let root = tempfile::tempdir().expect("create temp dir");
        let dir = root.path().join("inst");
        std::fs::create_dir_all(&dir).expect("create instance dir");
        std::fs::write(
            dir.join(INSTANCE_JSON),
            r#"{"patch":"diff","test_patch":""}"#,
        )
        .expect("write descriptor");
        let result =
            evaluate_instance(&unreachable_docker(), &test_config(root.path()), "inst");
        assert_eq!(result.status, StatusKind::NoTestPatch);
    }

    #[test]
    fn patch_without_test_files_is_terminal() {
        let root = tempfile::tempdir().expect("create temp dir");
        let dir = root.path().join("inst");
        std::fs::create_dir_all(&dir).expect("create instance dir");
        std::fs::write(
            dir.join(INSTANCE_JSON),
            r#"{"patch":"","test_patch":"diff --git a/src/lib.py b/src/lib.py\n"}"#,
        )
        .expect("write descriptor");
        let result =
            evaluate_instance(&unreachable_docker(), &test_config(root.path()), "inst");
        assert_eq!(result.status, StatusKind::NoTestFiles);
        assert!(result.image_name.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn final_cleanup_failure_keeps_the_classification() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().expect("create temp dir");
        let dir = root.path().join("inst");
        std::fs::create_dir_all(&dir).expect("create instance dir");
        std::fs::write(
            dir.join(INSTANCE_JSON),
            r#"{"patch":"diff --git a/src/core.py b/src/core.py\n","test_patch":"diff --git a/tests/test_ok.py b/tests/test_ok.py\n"}"#,
        )
        .expect("write descriptor");

        // Fake client: the second `stop` (the post-classification one)
        // fails, every other subcommand succeeds.
        let script = root.path().join("docker");
        std::fs::write(
            &script,
            concat!(
                "#!/bin/sh\n",
                "case \"$1\" in\n",
                "  cp) cat > /dev/null; exit 0 ;;\n",
                "  stop)\n",
                "    count_file=\"$(dirname \"$0\")/stop_count\"\n",
                "    count=$(( $(cat \"$count_file\" 2>/dev/null || echo 0) + 1 ))\n",
                "    printf '%s' \"$count\" > \"$count_file\"\n",
                "    [ \"$count\" -ge 2 ] && exit 1\n",
                "    exit 0 ;;\n",
                "esac\n",
                "exit 0\n",
            ),
        )
        .expect("write fake client");
        let mut perms = std::fs::metadata(&script)
            .expect("stat fake client")
            .permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).expect("mark fake client executable");

        let result = evaluate_instance(
            &DockerCli::with_program(script),
            &test_config(root.path()),
            "inst",
        );
        // Both stages passed, so the instance is env_passed; the failed
        // final stop must not turn that into an error.
        assert_eq!(result.status, StatusKind::EnvPassed);
        assert!(result.env_pass);
        assert!(!result.f2p_pass);
        assert!(result.test_only_passed);
        assert!(result.both_patches_passed);
        assert!(result.error_log.is_none());
    }

    #[test]
    fn malformed_descriptor_becomes_error_with_log() {
        let root = tempfile::tempdir().expect("create temp dir");
        let dir = root.path().join("inst");
        std::fs::create_dir_all(&dir).expect("create instance dir");
        std::fs::write(dir.join(INSTANCE_JSON), "not json").expect("write descriptor");
        let result =
            evaluate_instance(&unreachable_docker(), &test_config(root.path()), "inst");
        assert_eq!(result.status, StatusKind::Error);
        let error_log = result.error_log.expect("error log path");
        let contents = std::fs::read_to_string(error_log).expect("read error log");
        assert!(contents.contains("=== Unexpected Error ==="));
        assert!(contents.contains("Instance: inst"));
    }
}
