//! Run orchestration: fan the instance evaluator out over the instance set,
//! fold results, persist the aggregate report.
//!
//! Workers never share mutable state; each returns its result by value over
//! a channel and only the coordinating thread touches the aggregate. Results
//! are recorded in completion order.
use crate::cli::RootArgs;
use crate::docker::DockerCli;
use crate::evaluate::{evaluate_instance, EvalConfig};
use crate::instance;
use crate::report::{AggregateReport, EvaluationResult, Statistics, StatusKind};
use anyhow::{anyhow, Context, Result};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Execute a full evaluation run. Returns the process exit code: 0 iff
/// every evaluated instance reached `f2p_passed` or `env_passed`.
pub fn run(args: &RootArgs) -> Result<i32> {
    let output_dir = args
        .output_dir
        .canonicalize()
        .with_context(|| format!("resolve output dir {}", args.output_dir.display()))?;

    let docker = DockerCli::locate()?;
    let config = EvalConfig {
        output_dir: output_dir.clone(),
        namespace: args.namespace.clone(),
        arch: args.arch.as_str().to_string(),
        tag: args.tag.clone(),
        timeout: Duration::from_secs(args.timeout),
        install_pytest: args.install_pytest,
    };

    let instances =
        instance::resolve_instances(&output_dir, &args.instances, args.max_instances)?;
    tracing::info!(
        total = instances.len(),
        parallel = args.parallel,
        timeout_secs = args.timeout,
        namespace = config.namespace.as_str(),
        arch = config.arch.as_str(),
        tag = config.tag.as_str(),
        "starting evaluation run"
    );

    let started = Instant::now();
    let details = if args.parallel > 1 {
        run_parallel(&docker, &config, &instances, args.parallel)
    } else {
        run_sequential(&docker, &config, &instances)
    };
    let elapsed = started.elapsed();

    let statistics = Statistics::from_details(&details);
    let report = AggregateReport {
        timestamp: chrono::Utc::now().to_rfc3339(),
        output_dir: output_dir.display().to_string(),
        namespace: config.namespace.clone(),
        arch: config.arch.clone(),
        tag: config.tag.clone(),
        elapsed_seconds: elapsed.as_secs_f64(),
        statistics,
        details,
    };
    let report_path = report_path(&output_dir)?;
    write_report(&report_path, &report)?;
    print_summary(&report, elapsed, &report_path);

    let all_passed = report
        .details
        .iter()
        .all(|result| result.status.is_pass());
    Ok(if all_passed { 0 } else { 1 })
}

fn run_sequential(
    docker: &DockerCli,
    config: &EvalConfig,
    instances: &[String],
) -> Vec<EvaluationResult> {
    let total = instances.len();
    let mut details = Vec::with_capacity(total);
    for (index, instance_id) in instances.iter().enumerate() {
        tracing::info!(instance = instance_id.as_str(), "evaluating");
        let result = evaluate_instance(docker, config, instance_id);
        print_progress(index + 1, total, &result);
        details.push(result);
    }
    details
}

fn run_parallel(
    docker: &DockerCli,
    config: &EvalConfig,
    instances: &[String],
    workers: usize,
) -> Vec<EvaluationResult> {
    let total = instances.len();
    let queue: Arc<Mutex<VecDeque<String>>> =
        Arc::new(Mutex::new(instances.iter().cloned().collect()));
    let (sender, receiver) = mpsc::channel::<EvaluationResult>();

    std::thread::scope(|scope| {
        for _ in 0..workers.min(total.max(1)) {
            let queue = Arc::clone(&queue);
            let sender = sender.clone();
            let docker = docker.clone();
            let config = config.clone();
            scope.spawn(move || loop {
                let Some(instance_id) = next_job(&queue) else {
                    break;
                };
                tracing::info!(instance = instance_id.as_str(), "evaluating");
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    evaluate_instance(&docker, &config, &instance_id)
                }))
                .unwrap_or_else(|_| {
                    EvaluationResult::terminal(
                        &instance_id,
                        StatusKind::Error,
                        "worker panicked during evaluation".to_string(),
                    )
                });
                // A closed channel means the coordinator is gone; stop
                // pulling work.
                if sender.send(result).is_err() {
                    break;
                }
            });
        }
        drop(sender);

        let mut details = Vec::with_capacity(total);
        while let Ok(result) = receiver.recv() {
            print_progress(details.len() + 1, total, &result);
            details.push(result);
        }
        details
    })
}

fn next_job(queue: &Mutex<VecDeque<String>>) -> Option<String> {
    match queue.lock() {
        Ok(mut queue) => queue.pop_front(),
        // A poisoned queue means another worker panicked mid-pop; stop
        // drawing work rather than guess at its state.
        Err(_) => None,
    }
}

fn print_progress(completed: usize, total: usize, result: &EvaluationResult) {
    let symbol = if result.f2p_pass {
        "\u{2713} F2P"
    } else if result.env_pass {
        "\u{2713} ENV"
    } else {
        "\u{2717}"
    };
    println!(
        "[{completed}/{total}] {symbol} {}: {}",
        result.instance_id, result.status
    );
}

fn report_path(output_dir: &Path) -> Result<PathBuf> {
    let dir_name = output_dir
        .file_name()
        .ok_or_else(|| anyhow!("output dir has no name: {}", output_dir.display()))?
        .to_string_lossy()
        .to_string();
    let parent = output_dir
        .parent()
        .ok_or_else(|| anyhow!("output dir has no parent: {}", output_dir.display()))?;
    Ok(parent.join(format!("evaluation_results_{dir_name}.json")))
}

fn write_report(path: &Path, report: &AggregateReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("serialize aggregate report")?;
    std::fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

fn print_summary(report: &AggregateReport, elapsed: Duration, report_path: &Path) {
    let stats = &report.statistics;
    println!();
    println!("{}", "=".repeat(80));
    println!("EVALUATION SUMMARY");
    println!("{}", "=".repeat(80));
    println!("Total instances:     {}", stats.total);
    println!(
        "F2P Passed:          {} ({})",
        stats.f2p_passed, stats.f2p_pass_rate
    );
    println!(
        "Env Passed:          {} ({})",
        stats.env_passed, stats.env_pass_rate
    );
    println!("Failed:              {}", stats.failed);
    if !stats.failure_breakdown.is_empty() {
        println!();
        println!("Failure breakdown:");
        for (status, count) in &stats.failure_breakdown {
            println!("  - {status}: {count}");
        }
    }
    println!();
    println!("Elapsed time:        {:.2} seconds", elapsed.as_secs_f64());
    if stats.total > 0 {
        println!(
            "Average per instance: {:.2} seconds",
            elapsed.as_secs_f64() / stats.total as f64
        );
    }
    println!();
    println!("Detailed results saved to: {}", report_path.display());
    println!("{}", "=".repeat(80));
}
