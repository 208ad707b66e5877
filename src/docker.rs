//! Thin wrapper over the `docker` CLI client.
//!
//! The evaluator never builds images; it looks them up, runs disposable
//! containers from them, and execs inside those containers. All host/daemon
//! traffic goes through the client binary, located once at startup and
//! shared read-only across workers.
use crate::exec::{run_with_timeout, ExecOutcome};
use anyhow::{anyhow, Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

/// Checkout directory baked into every evaluation image.
pub const TESTBED: &str = "/testbed";

/// Bound for the optional pytest bootstrap, independent of the stage timeout.
pub const PYTEST_INSTALL_TIMEOUT: Duration = Duration::from_secs(300);

const PYTEST_CHECK_CMD: &str =
    "python -m pytest --version 2>/dev/null || python3 -m pytest --version 2>/dev/null";
const PYTEST_INSTALL_CMD: &str = "pip install pytest 2>&1 || pip3 install pytest 2>&1";

/// Outcome of the idempotent pytest bootstrap. Expected failures land here
/// as `ok == false` rather than as errors, so the caller can map them onto
/// the install-failed statuses.
#[derive(Debug)]
pub struct PytestBootstrap {
    pub ok: bool,
    pub message: String,
}

/// Handle to the container engine's CLI client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: PathBuf,
}

impl DockerCli {
    /// Locate the client binary on PATH. A missing client is a startup
    /// error; per-instance statuses never cover it.
    pub fn locate() -> Result<Self> {
        let program = which::which("docker").context("locate docker client on PATH")?;
        Ok(DockerCli { program })
    }

    #[cfg(test)]
    pub fn with_program(program: PathBuf) -> Self {
        DockerCli { program }
    }

    fn command(&self) -> Command {
        Command::new(&self.program)
    }

    /// True when the image is present locally.
    pub fn image_exists(&self, image: &str) -> Result<bool> {
        let output = self
            .command()
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .context("run docker image inspect")?;
        Ok(output.success())
    }

    /// Start a detached container that idles until removed.
    pub fn start_container(&self, name: &str, image: &str) -> Result<()> {
        tracing::debug!(container = name, image, "starting container");
        let output = self
            .command()
            .args(["run", "-d", "--name", name, image, "tail", "-f", "/dev/null"])
            .output()
            .context("run docker run")?;
        if !output.status.success() {
            return Err(anyhow!(
                "docker run failed for {image}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        // Give the container a moment to settle before the first exec.
        std::thread::sleep(Duration::from_secs(1));
        Ok(())
    }

    fn exec_command(&self, container: &str, script: &str) -> Command {
        let mut command = self.command();
        command.args(["exec", "-w", TESTBED, container, "bash", "-c", script]);
        command
    }

    /// Exec a shell script in the container, waiting for it to finish.
    pub fn exec(&self, container: &str, script: &str) -> Result<ExecOutcome> {
        let output = self
            .exec_command(container, script)
            .output()
            .context("run docker exec")?;
        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        Ok(ExecOutcome {
            exit_code: output.status.code().unwrap_or(-1),
            output: combined,
            elapsed: Duration::ZERO,
            timed_out: false,
        })
    }

    /// Exec a shell script with a wall-clock bound. On overrun the
    /// in-container process keeps running until the container is removed.
    pub fn exec_bounded(
        &self,
        container: &str,
        script: &str,
        timeout: Duration,
    ) -> Result<ExecOutcome> {
        run_with_timeout(self.exec_command(container, script), timeout)
    }

    /// Write `contents` into the container at `dest_path`.
    ///
    /// The text travels as a tar archive through the engine's filesystem
    /// upload interface (`docker cp -` reading from stdin), never as a shell
    /// argument, so arbitrarily large patches cannot hit argument-length
    /// limits.
    pub fn put_archive(&self, container: &str, dest_path: &str, contents: &str) -> Result<()> {
        let dest = Path::new(dest_path);
        let entry_name = dest
            .file_name()
            .ok_or_else(|| anyhow!("destination {dest_path} has no file name"))?
            .to_string_lossy()
            .to_string();
        let dest_dir = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_string_lossy().to_string(),
            _ => "/".to_string(),
        };
        let archive = crate::patch::archive_bytes(&entry_name, contents)?;

        let mut child = self
            .command()
            .args(["cp", "-", &format!("{container}:{dest_dir}")])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawn docker cp")?;
        {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("docker cp stdin unavailable"))?;
            stdin
                .write_all(&archive)
                .context("stream archive to docker cp")?;
        }
        let output = child.wait_with_output().context("wait for docker cp")?;
        if !output.status.success() {
            return Err(anyhow!(
                "failed to write {dest_path} into {container}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }

    /// Stop the container, giving it a short grace period.
    pub fn stop_container(&self, name: &str) -> Result<()> {
        let status = self
            .command()
            .args(["stop", "-t", "5", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .context("run docker stop")?;
        if !status.success() {
            return Err(anyhow!("docker stop failed for {name}"));
        }
        Ok(())
    }

    /// Remove the container, forcing if it is still running.
    pub fn remove_container(&self, name: &str) -> Result<()> {
        let status = self
            .command()
            .args(["rm", "-f", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .context("run docker rm")?;
        if !status.success() {
            return Err(anyhow!("docker rm failed for {name}"));
        }
        Ok(())
    }

    /// Check-then-install pytest in the container. Idempotent: a second call
    /// on an already-provisioned container reports "already installed" and
    /// performs no work.
    pub fn ensure_pytest(&self, container: &str, timeout: Duration) -> Result<PytestBootstrap> {
        let check = self.exec(container, PYTEST_CHECK_CMD)?;
        if check.exit_code == 0 {
            return Ok(PytestBootstrap {
                ok: true,
                message: format!("pytest already installed: {}", check.output_text().trim()),
            });
        }

        let install = self.exec_bounded(container, PYTEST_INSTALL_CMD, timeout)?;
        if install.timed_out {
            return Ok(PytestBootstrap {
                ok: false,
                message: format!(
                    "pytest installation timed out after {}s",
                    timeout.as_secs()
                ),
            });
        }
        if install.exit_code != 0 {
            let output = install.output_text();
            let output = if output.is_empty() {
                "No output".to_string()
            } else {
                output
            };
            return Ok(PytestBootstrap {
                ok: false,
                message: format!("pytest installation failed: {output}"),
            });
        }

        let verify = self.exec(container, PYTEST_CHECK_CMD)?;
        if verify.exit_code == 0 {
            Ok(PytestBootstrap {
                ok: true,
                message: format!(
                    "pytest installed successfully: {}",
                    verify.output_text().trim()
                ),
            })
        } else {
            Ok(PytestBootstrap {
                ok: false,
                message: "pytest installation verification failed".to_string(),
            })
        }
    }
}
