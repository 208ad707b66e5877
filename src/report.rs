//! Result and report schema types.
//!
//! These types mirror the JSON artifacts the evaluator produces so downstream
//! reporting can stay schema-driven. Wire names are stable snake_case strings.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Terminal status of one evaluated instance.
///
/// Every status is terminal: an instance is classified exactly once and never
/// retried within a run.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    F2pPassed,
    EnvPassed,
    Failed,
    NoInstanceDir,
    NoInstanceJson,
    NoTestPatch,
    NoTestFiles,
    NoImage,
    PytestInstallFailed,
    PytestInstallFailedStage2,
    TestPatchApplyFailed,
    TestPatchApplyFailedStage2,
    FixPatchApplyFailed,
    TestOnlyTimeout,
    BothPatchesTimeout,
    Error,
}

impl StatusKind {
    /// Return the stable string identifier used in JSON artifacts.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::F2pPassed => "f2p_passed",
            StatusKind::EnvPassed => "env_passed",
            StatusKind::Failed => "failed",
            StatusKind::NoInstanceDir => "no_instance_dir",
            StatusKind::NoInstanceJson => "no_instance_json",
            StatusKind::NoTestPatch => "no_test_patch",
            StatusKind::NoTestFiles => "no_test_files",
            StatusKind::NoImage => "no_image",
            StatusKind::PytestInstallFailed => "pytest_install_failed",
            StatusKind::PytestInstallFailedStage2 => "pytest_install_failed_stage2",
            StatusKind::TestPatchApplyFailed => "test_patch_apply_failed",
            StatusKind::TestPatchApplyFailedStage2 => "test_patch_apply_failed_stage2",
            StatusKind::FixPatchApplyFailed => "fix_patch_apply_failed",
            StatusKind::TestOnlyTimeout => "test_only_timeout",
            StatusKind::BothPatchesTimeout => "both_patches_timeout",
            StatusKind::Error => "error",
        }
    }

    /// True for the two statuses that count as a passing instance.
    pub fn is_pass(&self) -> bool {
        matches!(self, StatusKind::F2pPassed | StatusKind::EnvPassed)
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-instance evaluation record. Written to the aggregate report exactly
/// once and never updated afterward.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EvaluationResult {
    pub instance_id: String,
    pub status: StatusKind,
    pub env_pass: bool,
    pub f2p_pass: bool,
    pub message: String,
    pub test_only_time: f64,
    pub both_patches_time: f64,
    pub test_only_passed: bool,
    pub both_patches_passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_only_log: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub both_patches_log: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_log: Option<String>,
    pub timestamp: String,
}

impl EvaluationResult {
    /// A result that terminated before or outside the two-stage protocol.
    pub fn terminal(instance_id: &str, status: StatusKind, message: String) -> Self {
        EvaluationResult {
            instance_id: instance_id.to_string(),
            status,
            env_pass: false,
            f2p_pass: false,
            message,
            test_only_time: 0.0,
            both_patches_time: 0.0,
            test_only_passed: false,
            both_patches_passed: false,
            image_name: None,
            test_only_log: None,
            both_patches_log: None,
            error_log: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Aggregate statistics over all evaluated instances.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Statistics {
    pub total: usize,
    pub f2p_passed: usize,
    pub env_passed: usize,
    pub failed: usize,
    pub f2p_pass_rate: String,
    pub env_pass_rate: String,
    /// Count of every non-pass status observed, keyed by wire name.
    pub failure_breakdown: BTreeMap<String, usize>,
}

impl Statistics {
    pub fn from_details(details: &[EvaluationResult]) -> Self {
        let total = details.len();
        let f2p_passed = details
            .iter()
            .filter(|result| result.status == StatusKind::F2pPassed)
            .count();
        let env_passed = details
            .iter()
            .filter(|result| result.status == StatusKind::EnvPassed)
            .count();
        let failed = total - f2p_passed - env_passed;

        let mut failure_breakdown = BTreeMap::new();
        for result in details {
            if !result.status.is_pass() {
                *failure_breakdown
                    .entry(result.status.as_str().to_string())
                    .or_insert(0) += 1;
            }
        }

        Statistics {
            total,
            f2p_passed,
            env_passed,
            failed,
            f2p_pass_rate: rate(f2p_passed, total),
            env_pass_rate: rate(env_passed, total),
            failure_breakdown,
        }
    }
}

fn rate(count: usize, total: usize) -> String {
    if total == 0 {
        return "0%".to_string();
    }
    format!("{:.2}%", count as f64 / total as f64 * 100.0)
}

/// One aggregate report per run, persisted after all instances complete.
#[derive(Debug, Deserialize, Serialize)]
pub struct AggregateReport {
    pub timestamp: String,
    pub output_dir: String,
    pub namespace: String,
    pub arch: String,
    pub tag: String,
    pub elapsed_seconds: f64,
    pub statistics: Statistics,
    pub details: Vec<EvaluationResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with_status(status: StatusKind) -> EvaluationResult {
        EvaluationResult::terminal("inst", status, String::new())
    }

    #[test]
    fn wire_names_are_stable() {
        assert_eq!(StatusKind::F2pPassed.as_str(), "f2p_passed");
        assert_eq!(
            StatusKind::PytestInstallFailedStage2.as_str(),
            "pytest_install_failed_stage2"
        );
        for status in [
            StatusKind::F2pPassed,
            StatusKind::EnvPassed,
            StatusKind::Failed,
            StatusKind::NoInstanceDir,
            StatusKind::NoInstanceJson,
            StatusKind::NoTestPatch,
            StatusKind::NoTestFiles,
            StatusKind::NoImage,
            StatusKind::PytestInstallFailed,
            StatusKind::PytestInstallFailedStage2,
            StatusKind::TestPatchApplyFailed,
            StatusKind::TestPatchApplyFailedStage2,
            StatusKind::FixPatchApplyFailed,
            StatusKind::TestOnlyTimeout,
            StatusKind::BothPatchesTimeout,
            StatusKind::Error,
        ] {
            let encoded = serde_json::to_string(&status).expect("serialize status");
            assert_eq!(encoded, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn only_f2p_and_env_count_as_pass() {
        assert!(StatusKind::F2pPassed.is_pass());
        assert!(StatusKind::EnvPassed.is_pass());
        assert!(!StatusKind::Failed.is_pass());
        assert!(!StatusKind::NoImage.is_pass());
        assert!(!StatusKind::Error.is_pass());
    }

    #[test]
    fn statistics_count_and_rate() {
        let details = vec![
            result_with_status(StatusKind::F2pPassed),
            result_with_status(StatusKind::F2pPassed),
            result_with_status(StatusKind::EnvPassed),
            result_with_status(StatusKind::NoImage),
        ];
        let stats = Statistics::from_details(&details);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.f2p_passed, 2);
        assert_eq!(stats.env_passed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.f2p_pass_rate, "50.00%");
        assert_eq!(stats.env_pass_rate, "25.00%");
        assert_eq!(stats.failure_breakdown.get("no_image"), Some(&1));
        assert_eq!(stats.failure_breakdown.get("error"), None);
    }

    #[test]
    fn empty_run_has_zero_rates() {
        let stats = Statistics::from_details(&[]);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.f2p_pass_rate, "0%");
        assert_eq!(stats.env_pass_rate, "0%");
        assert!(stats.failure_breakdown.is_empty());
    }
}
