//! Benchmark sweeps: every detection file against one generator profile.
//!
//! Each cell runs `patchbench-task` as a supervised child, turns its result
//! document into a [`BenchmarkResult`], optionally keeps the better of the
//! new and the stored result, and finally appends every row to the
//! profile's report.

pub mod supervisor;

use crate::detection::TaskMetadata;
use crate::git_ops;
use crate::lock::KeyedLocks;
use crate::outcome::{OutcomeKind, SeverityOrder};
use crate::report::{BenchmarkReport, BenchmarkResult, TaskResultDocument, CELL_RESULT_FILE};
use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use supervisor::Supervisor;
use tokio::process::Command;
use walkdir::WalkDir;

const STDERR_TAIL_CHARS: usize = 4_000;

#[derive(Debug, Clone)]
pub struct BenchmarkSettings {
    /// argv prefix that starts the child host, e.g. `["patchbench-task"]`.
    pub task_command: Vec<String>,
    pub config_path: Option<PathBuf>,
    pub reports_dir: PathBuf,
    pub cache_dir: PathBuf,
    /// Per-cell wall-clock limit handed to the child.
    pub timeout: Duration,
    /// Extra time past `timeout` before the child is killed, so it can
    /// finish writing its result.
    pub child_slack: Duration,
    /// Grace period between SIGTERM and SIGKILL.
    pub grace: Duration,
    pub cost_limit: f64,
    pub jobs: usize,
    pub keep_best: bool,
    pub early_exit_on_sound: bool,
    pub no_cache: bool,
}

impl BenchmarkSettings {
    pub fn new(task_command: Vec<String>, reports_dir: PathBuf, cache_dir: PathBuf) -> Self {
        Self {
            task_command,
            config_path: None,
            reports_dir,
            cache_dir,
            timeout: Duration::from_secs(60 * 60),
            child_slack: Duration::from_secs(60),
            grace: Duration::from_secs(10),
            cost_limit: 5.0,
            jobs: 1,
            keep_best: false,
            early_exit_on_sound: false,
            no_cache: false,
        }
    }
}

/// One (profile, detection file) pair.
#[derive(Debug, Clone)]
pub struct Cell {
    pub profile: String,
    pub detection_file: PathBuf,
    pub task_id: String,
    pub source_dir: PathBuf,
}

impl Cell {
    /// Resolve the task directory and checkout owning `detection_file`.
    pub fn from_detection_file(profile: &str, detection_file: &Path) -> Result<Self> {
        let task_dir = TaskMetadata::task_dir_for(detection_file).with_context(|| {
            format!("{} has no task directory", detection_file.display())
        })?;
        let metadata = TaskMetadata::load(&task_dir)?;
        Ok(Self {
            profile: profile.to_string(),
            detection_file: detection_file.to_path_buf(),
            task_id: metadata.task_id.clone(),
            source_dir: metadata.source_path(&task_dir),
        })
    }

    /// Detection file stem; names the cell's report directory.
    pub fn cpv_name(&self) -> String {
        cpv_name(&self.detection_file)
    }
}

fn cpv_name(detection_file: &Path) -> String {
    detection_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string())
}

/// Whether a new result should replace the stored one. Ties favour the new
/// run so its timing and cost figures are refreshed.
pub fn should_replace(order: &SeverityOrder, stored: OutcomeKind, new: OutcomeKind) -> bool {
    !order.is_worse(new, stored)
}

pub struct Orchestrator {
    settings: BenchmarkSettings,
    order: SeverityOrder,
    sweep_id: String,
    checkout_locks: KeyedLocks<PathBuf>,
}

impl Orchestrator {
    pub fn new(settings: BenchmarkSettings, order: SeverityOrder) -> Self {
        Self {
            settings,
            order,
            sweep_id: uuid::Uuid::new_v4().to_string(),
            checkout_locks: KeyedLocks::new(),
        }
    }

    pub fn sweep_id(&self) -> &str {
        &self.sweep_id
    }

    pub fn report_path(&self, profile: &str) -> PathBuf {
        self.settings.reports_dir.join(format!("{}.json", profile))
    }

    fn cell_dir(&self, cell: &Cell, suffix: &str) -> PathBuf {
        self.settings
            .reports_dir
            .join(&cell.profile)
            .join(format!("{}{}", cell.cpv_name(), suffix))
    }

    /// Run every detection file for `profile` and append the rows to its report.
    pub async fn run_profile(
        &self,
        profile: &str,
        detection_files: &[PathBuf],
    ) -> Result<BenchmarkReport> {
        let cells: Vec<(&PathBuf, Result<Cell>)> = detection_files
            .iter()
            .map(|file| (file, Cell::from_detection_file(profile, file)))
            .collect();
        tracing::info!(
            profile,
            cells = cells.len(),
            jobs = self.settings.jobs,
            sweep = %self.sweep_id,
            "starting sweep"
        );

        let results: Vec<BenchmarkResult> = stream::iter(cells.iter())
            .map(|(file, cell)| async move {
                match cell {
                    Ok(cell) => self.run_cell(cell).await,
                    Err(err) => {
                        tracing::error!(
                            file = %file.display(),
                            error = %format!("{:#}", err),
                            "cannot resolve task"
                        );
                        BenchmarkResult::failure(
                            &cpv_name(file),
                            format!("{:#}", err),
                            Duration::ZERO,
                            &self.sweep_id,
                        )
                    }
                }
            })
            .buffered(self.settings.jobs.max(1))
            .collect()
            .await;

        let path = self.report_path(profile);
        let app_name = profile.to_string();
        let report = tokio::task::spawn_blocking(move || {
            BenchmarkReport::append_to(&path, &app_name, results)
        })
        .await
        .context("report task failed")??;
        tracing::info!(profile, results = report.results.len(), "report updated");
        Ok(report)
    }

    /// Run one cell. Always yields a result.
    pub async fn run_cell(&self, cell: &Cell) -> BenchmarkResult {
        let name = cell.cpv_name();
        let dest = self.cell_dir(cell, "");
        let stored = if self.settings.keep_best {
            BenchmarkResult::load(&dest.join(CELL_RESULT_FILE)).ok()
        } else {
            None
        };

        if let Some(stored) = &stored {
            if self.settings.early_exit_on_sound && stored.variant == OutcomeKind::Sound {
                tracing::info!(cell = %name, "stored result is sound; skipping");
                return stored.clone();
            }
        }

        let output_dir = if stored.is_some() {
            self.cell_dir(cell, "_tmp")
        } else {
            dest.clone()
        };
        let started = Instant::now();
        let result = match self.execute(cell, &output_dir).await {
            Ok(result) => result,
            Err(err) => BenchmarkResult::failure(
                &name,
                format!("{:#}", err),
                started.elapsed(),
                &self.sweep_id,
            ),
        };
        if let Err(err) = result.save(&output_dir.join(CELL_RESULT_FILE)) {
            tracing::error!(cell = %name, error = %format!("{:#}", err), "could not store result");
        }

        let Some(stored) = stored else {
            return result;
        };
        let kept = if should_replace(&self.order, stored.variant, result.variant) {
            tracing::info!(cell = %name, new = %result.variant, old = %stored.variant, "replacing stored result");
            match promote(&output_dir, &dest) {
                Ok(()) => result,
                Err(err) => {
                    tracing::error!(cell = %name, error = %format!("{:#}", err), "promotion failed");
                    stored
                }
            }
        } else {
            tracing::info!(cell = %name, new = %result.variant, old = %stored.variant, "keeping stored result");
            stored
        };
        if output_dir.exists() {
            if let Err(err) = fs::remove_dir_all(&output_dir) {
                tracing::warn!(dir = %output_dir.display(), error = %err, "could not remove scratch run");
            }
        }
        kept
    }

    async fn execute(&self, cell: &Cell, output_dir: &Path) -> Result<BenchmarkResult> {
        let name = cell.cpv_name();
        if output_dir.exists() {
            fs::remove_dir_all(output_dir)
                .with_context(|| format!("Failed to clear {}", output_dir.display()))?;
        }
        fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;

        let _checkout = self.checkout_locks.lock(&cell.source_dir).await;
        restore_checkout(&cell.source_dir).await;
        let cache_dir = self.settings.cache_dir.join(&cell.task_id);
        if self.settings.no_cache {
            remove_dir_if_exists(&cache_dir);
        }
        fs::create_dir_all(&cache_dir)
            .with_context(|| format!("Failed to create {}", cache_dir.display()))?;

        let started = Instant::now();
        let supervisor = Supervisor::new(self.settings.timeout + self.settings.child_slack)
            .with_grace(self.settings.grace);
        let run = supervisor
            .run(self.child_command(cell, output_dir, &cache_dir)?, output_dir)
            .await;

        if self.settings.no_cache {
            remove_dir_if_exists(&cache_dir);
        }
        restore_checkout(&cell.source_dir).await;

        let run = run?;
        let elapsed = started.elapsed();
        if !run.success() {
            let message = format!(
                "{}\n{}",
                run.failure_reason(),
                run.stderr_tail(STDERR_TAIL_CHARS)
            );
            tracing::warn!(cell = %name, reason = %run.failure_reason(), "child failed");
            return Ok(BenchmarkResult::failure(
                &name,
                message.trim_end().to_string(),
                elapsed,
                &self.sweep_id,
            ));
        }

        match TaskResultDocument::load(output_dir) {
            Ok(document) => {
                tracing::info!(
                    cell = %name,
                    variant = %document.variant,
                    elapsed_secs = elapsed.as_secs(),
                    cost = document.llm_cost,
                    "cell finished"
                );
                Ok(BenchmarkResult::from_document(&name, &document, elapsed, &self.sweep_id))
            }
            Err(err) => Ok(BenchmarkResult::failure(
                &name,
                format!(
                    "{:#}\n{}",
                    err,
                    run.stderr_tail(STDERR_TAIL_CHARS)
                )
                .trim_end()
                .to_string(),
                elapsed,
                &self.sweep_id,
            )),
        }
    }

    fn child_command(&self, cell: &Cell, output_dir: &Path, cache_dir: &Path) -> Result<Command> {
        let (program, prefix) = self
            .settings
            .task_command
            .split_first()
            .context("task command is empty")?;
        let mut command = Command::new(program);
        command
            .args(prefix)
            .arg("--source-dir")
            .arg(&cell.source_dir)
            .arg("--detection-file")
            .arg(&cell.detection_file)
            .arg("--output-dir")
            .arg(output_dir)
            .arg("--timeout")
            .arg(self.settings.timeout.as_secs().to_string())
            .arg("--cost-limit")
            .arg(self.settings.cost_limit.to_string())
            .arg("--generator")
            .arg(&cell.profile)
            .arg("--cache-dir")
            .arg(cache_dir);
        if let Some(config) = &self.settings.config_path {
            command.arg("--config").arg(config);
        }
        Ok(command)
    }
}

async fn restore_checkout(source_dir: &Path) {
    let dir = source_dir.to_path_buf();
    let restored = tokio::task::spawn_blocking(move || git_ops::restore_clean(&dir)).await;
    match restored {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(
            dir = %source_dir.display(),
            error = %format!("{:#}", err),
            "could not restore checkout"
        ),
        Err(err) => tracing::warn!(error = %err, "restore task failed"),
    }
}

fn remove_dir_if_exists(dir: &Path) {
    if dir.exists() {
        if let Err(err) = fs::remove_dir_all(dir) {
            tracing::warn!(dir = %dir.display(), error = %err, "could not remove cache directory");
        }
    }
}

/// Replace `dest` with a copy of `src`.
fn promote(src: &Path, dest: &Path) -> Result<()> {
    if dest.exists() {
        fs::remove_dir_all(dest).with_context(|| format!("Failed to remove {}", dest.display()))?;
    }
    copy_tree(src, dest)
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(src)?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}
