//! CLI argument parsing for the evaluator.
//!
//! The CLI is intentionally thin: every run parameter arrives here and the
//! evaluator itself stays stateless between runs.
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Root CLI entrypoint for the differential patch evaluator.
#[derive(Parser, Debug)]
#[command(
    name = "peval",
    version,
    about = "Evaluate fix/test patch pairs against pre-built container images",
    after_help = "Examples:\n  peval --output-dir ./batch\n  peval --output-dir ./batch --instances org__repo-101 org__repo-202\n  peval --output-dir ./batch --parallel 8 --timeout 900 --install-pytest"
)]
pub struct RootArgs {
    /// Output directory containing one subdirectory per instance
    #[arg(long, value_name = "DIR")]
    pub output_dir: PathBuf,

    /// Specific instance IDs to evaluate (default: every subdirectory with
    /// an instance.json)
    #[arg(long, value_name = "ID", num_args = 0..)]
    pub instances: Vec<String>,

    /// Number of parallel workers
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub parallel: usize,

    /// Per-stage test timeout in seconds
    #[arg(long, value_name = "SECS", default_value_t = 600)]
    pub timeout: u64,

    /// Maximum number of instances to evaluate
    #[arg(long, value_name = "N")]
    pub max_instances: Option<usize>,

    /// Install pytest in containers before running tests
    #[arg(long)]
    pub install_pytest: bool,

    /// Image registry namespace
    #[arg(long, value_name = "NS", default_value = "starryzhang")]
    pub namespace: String,

    /// Image architecture
    #[arg(long, value_enum, default_value_t = Arch::X8664)]
    pub arch: Arch,

    /// Image tag
    #[arg(long, value_name = "TAG", default_value = "latest")]
    pub tag: String,
}

/// Architectures the evaluation images are published for.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    #[value(name = "x86_64")]
    X8664,
    #[value(name = "arm64")]
    Arm64,
}

impl Arch {
    /// Return the string form used in image references.
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X8664 => "x86_64",
            Arch::Arm64 => "arm64",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_run_parameters() {
        let args = RootArgs::parse_from(["peval", "--output-dir", "/tmp/batch"]);
        assert_eq!(args.parallel, 1);
        assert_eq!(args.timeout, 600);
        assert_eq!(args.namespace, "starryzhang");
        assert_eq!(args.arch, Arch::X8664);
        assert_eq!(args.tag, "latest");
        assert!(!args.install_pytest);
        assert!(args.instances.is_empty());
        assert!(args.max_instances.is_none());
    }

    #[test]
    fn arch_values_round_trip() {
        let args = RootArgs::parse_from([
            "peval",
            "--output-dir",
            "/tmp/batch",
            "--arch",
            "arm64",
        ]);
        assert_eq!(args.arch.as_str(), "arm64");
    }

    #[test]
    fn instance_filter_accepts_multiple_ids() {
        let args = RootArgs::parse_from([
            "peval",
            "--output-dir",
            "/tmp/batch",
            "--instances",
            "a__b-1",
            "c__d-2",
        ]);
        assert_eq!(args.instances, vec!["a__b-1", "c__d-2"]);
    }
}
