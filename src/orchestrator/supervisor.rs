//! Time-bounded child processes whose whole process group is reclaimed.

use crate::process::{signal_process_group, GroupSignal, ProcessGroupGuard};
use crate::util::tail_chars;
use anyhow::{Context, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::process::Command;

pub const STDOUT_FILE: &str = "stdout.txt";
pub const STDERR_FILE: &str = "stderr.txt";

const DEFAULT_GRACE: Duration = Duration::from_secs(10);

/// Runs one child at a time under a hard wall-clock limit.
///
/// On timeout the child's process group gets SIGTERM, then SIGKILL once the
/// grace period is over. The group is killed again after any exit so
/// stragglers left behind by the child do not outlive it.
#[derive(Debug, Clone, Copy)]
pub struct Supervisor {
    timeout: Duration,
    grace: Duration,
}

#[derive(Debug)]
pub struct SupervisedRun {
    /// `None` when the child had to be killed.
    pub status: Option<ExitStatus>,
    pub timed_out: bool,
    pub elapsed: Duration,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

impl SupervisedRun {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.map(|s| s.success()).unwrap_or(false)
    }

    /// Last `max_chars` of the captured stderr; empty if unreadable.
    pub fn stderr_tail(&self, max_chars: usize) -> String {
        std::fs::read(&self.stderr_path)
            .map(|bytes| tail_chars(&String::from_utf8_lossy(&bytes), max_chars))
            .unwrap_or_default()
    }

    /// One-line explanation of why the child did not succeed.
    pub fn failure_reason(&self) -> String {
        if self.timed_out {
            format!("timed out after {:.0}s", self.elapsed.as_secs_f64())
        } else {
            match self.status.and_then(|s| s.code()) {
                Some(code) => format!("exited with status {}", code),
                None => "terminated by signal".to_string(),
            }
        }
    }
}

impl Supervisor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Spawn `command`, capturing its output into `log_dir`, and wait for it.
    pub async fn run(&self, mut command: Command, log_dir: &Path) -> Result<SupervisedRun> {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create {}", log_dir.display()))?;
        let stdout_path = log_dir.join(STDOUT_FILE);
        let stderr_path = log_dir.join(STDERR_FILE);
        let stdout = File::create(&stdout_path)
            .with_context(|| format!("Failed to create {}", stdout_path.display()))?;
        let stderr = File::create(&stderr_path)
            .with_context(|| format!("Failed to create {}", stderr_path.display()))?;

        #[cfg(unix)]
        command.process_group(0);
        command
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        let started = Instant::now();
        let mut child = command.spawn().context("Failed to spawn child process")?;
        let group = child.id().map(ProcessGroupGuard::new);
        let pid = group.as_ref().map(ProcessGroupGuard::pid);

        let (status, timed_out) = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => (Some(status.context("Failed to wait for child")?), false),
            Err(_) => {
                tracing::warn!(
                    pid = ?pid,
                    timeout_secs = self.timeout.as_secs(),
                    "child timed out; terminating its process group"
                );
                if let Some(pid) = pid {
                    signal_process_group(pid, GroupSignal::Terminate);
                }
                if tokio::time::timeout(self.grace, child.wait()).await.is_err() {
                    tracing::warn!(pid = ?pid, "child ignored SIGTERM; killing");
                    if let Some(pid) = pid {
                        signal_process_group(pid, GroupSignal::Kill);
                    }
                    let _ = child.wait().await;
                }
                (None, true)
            }
        };
        drop(group);

        Ok(SupervisedRun {
            status,
            timed_out,
            elapsed: started.elapsed(),
            stdout_path,
            stderr_path,
        })
    }
}
