//! Bounded command execution.
//!
//! The container client has no native cancellation, so the bound here limits
//! the caller's wait, not the callee's execution: the command runs on a
//! helper thread and the caller waits on a channel with a timeout. When the
//! bound expires the helper thread (and the in-container process behind it)
//! may keep running; removing the container is the only mechanism that
//! reliably terminates it, so a timed-out stage leaks resources until its
//! container is torn down.
use anyhow::{Context, Result};
use std::process::Command;
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Outcome of one bounded command execution. Never mutated after creation.
#[derive(Debug)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub output: Vec<u8>,
    pub elapsed: Duration,
    pub timed_out: bool,
}

impl ExecOutcome {
    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output).to_string()
    }
}

/// Run `command`, waiting at most `timeout` for it to finish.
///
/// On completion the outcome carries the exit code and combined
/// stdout/stderr bytes. On overrun the outcome has `timed_out` set, exit
/// code -1 and no output; the abandoned process is not killed here.
pub fn run_with_timeout(mut command: Command, timeout: Duration) -> Result<ExecOutcome> {
    let started = Instant::now();
    let (sender, receiver) = mpsc::channel();

    std::thread::spawn(move || {
        let result = command.output();
        // The receiver is gone when the caller already timed out; nothing
        // left to report in that case.
        let _ = sender.send(result);
    });

    match receiver.recv_timeout(timeout) {
        Ok(result) => {
            let output = result.context("spawn command")?;
            let mut combined = output.stdout;
            combined.extend_from_slice(&output.stderr);
            Ok(ExecOutcome {
                exit_code: output.status.code().unwrap_or(-1),
                output: combined,
                elapsed: started.elapsed(),
                timed_out: false,
            })
        }
        Err(mpsc::RecvTimeoutError::Timeout) => Ok(ExecOutcome {
            exit_code: -1,
            output: Vec::new(),
            elapsed: started.elapsed(),
            timed_out: true,
        }),
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            anyhow::bail!("command thread exited without reporting a result")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    #[test]
    fn captures_exit_code_and_combined_output() {
        let outcome =
            run_with_timeout(shell("echo out; echo err >&2; exit 3"), Duration::from_secs(10))
                .expect("run command");
        assert!(!outcome.timed_out);
        assert_eq!(outcome.exit_code, 3);
        let text = outcome.output_text();
        assert!(text.contains("out"));
        assert!(text.contains("err"));
    }

    #[test]
    fn reports_timeout_within_the_bound() {
        let bound = Duration::from_millis(150);
        let started = Instant::now();
        let outcome = run_with_timeout(shell("sleep 30"), bound).expect("run command");
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, -1);
        assert!(outcome.output.is_empty());
        // Generous epsilon; the point is that the caller did not wait for
        // the full sleep.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn fast_command_finishes_before_the_bound() {
        let outcome =
            run_with_timeout(shell("true"), Duration::from_secs(10)).expect("run command");
        assert!(!outcome.timed_out);
        assert_eq!(outcome.exit_code, 0);
    }
}
