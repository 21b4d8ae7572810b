//! Result documents exchanged between the child and the orchestrator, and
//! the append-only per-profile benchmark report.

use crate::lock::FileLock;
use crate::outcome::{Diff, Outcome, OutcomeKind};
use crate::repair::{StopReason, Task};
use crate::usage::Usage;
use crate::util::write_atomic;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Written by the child into its output directory.
pub const TASK_RESULT_FILE: &str = "task_result.json";
/// Written by the orchestrator into each cell directory.
pub const CELL_RESULT_FILE: &str = "result.json";

const REPORT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// What a `patchbench-task` run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResultDocument {
    pub variant: OutcomeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub llm_cost: f64,
    #[serde(default)]
    pub attempts: usize,
    #[serde(default)]
    pub stop_reason: Option<StopReason>,
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl TaskResultDocument {
    pub fn from_task(task: &Task, elapsed: Duration) -> Self {
        let outcome = task.final_outcome();
        let usage = task.usage();
        Self {
            variant: outcome.kind(),
            diff: outcome.diff().map(Diff::to_text),
            error: outcome.error().map(str::to_string),
            usage,
            llm_cost: usage.total_cost(),
            attempts: task.attempts().len(),
            stop_reason: task.stop_reason(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// The task could not run at all, e.g. its environment failed to build.
    pub fn failure(error: String, elapsed: Duration) -> Self {
        Self {
            variant: OutcomeKind::UnknownError,
            diff: None,
            error: Some(error),
            usage: Usage::zero(),
            llm_cost: 0.0,
            attempts: 0,
            stop_reason: None,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Rebuild the outcome this document describes.
    pub fn outcome(&self) -> Outcome {
        match (self.variant, &self.diff) {
            (OutcomeKind::UnknownError, _) => Outcome::UnknownError {
                error: self.error.clone().unwrap_or_default(),
            },
            (OutcomeKind::NoPatch, _) | (_, None) => Outcome::NoPatch,
            (kind, Some(diff)) => Outcome::with_diff(kind, Diff::from(diff.as_str())),
        }
    }

    /// Write `task_result.json`, plus `final-<variant>.diff` when there is a diff.
    pub fn write(&self, output_dir: &Path) -> Result<()> {
        fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;
        if let Some(diff) = &self.diff {
            let name = format!("final-{}.diff", self.variant);
            write_atomic(&output_dir.join(name), diff)?;
        }
        let path = output_dir.join(TASK_RESULT_FILE);
        write_atomic(&path, &serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn load(output_dir: &Path) -> Result<Self> {
        let path = output_dir.join(TASK_RESULT_FILE);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid {}", path.display()))
    }
}

/// One cell's final row in a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub cpv_name: String,
    pub variant: OutcomeKind,
    #[serde(default)]
    pub message: String,
    /// Seconds.
    pub elapsed_time: f64,
    #[serde(default)]
    pub llm_cost: f64,
    #[serde(default)]
    pub sweep_id: String,
    pub finished_at: DateTime<Utc>,
}

impl BenchmarkResult {
    pub fn from_document(
        cpv_name: &str,
        document: &TaskResultDocument,
        elapsed: Duration,
        sweep_id: &str,
    ) -> Self {
        let message = match (&document.error, document.stop_reason) {
            (Some(error), _) => error.clone(),
            (None, Some(reason)) => format!(
                "{} after {} attempt(s)",
                serde_json::to_value(reason)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default(),
                document.attempts
            ),
            (None, None) => String::new(),
        };
        Self {
            cpv_name: cpv_name.to_string(),
            variant: document.variant,
            message,
            elapsed_time: elapsed.as_secs_f64(),
            llm_cost: document.llm_cost,
            sweep_id: sweep_id.to_string(),
            finished_at: Utc::now(),
        }
    }

    /// A cell that produced no usable result document.
    pub fn failure(cpv_name: &str, message: String, elapsed: Duration, sweep_id: &str) -> Self {
        Self {
            cpv_name: cpv_name.to_string(),
            variant: OutcomeKind::UnknownError,
            message,
            elapsed_time: elapsed.as_secs_f64(),
            llm_cost: 0.0,
            sweep_id: sweep_id.to_string(),
            finished_at: Utc::now(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, &serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))
    }
}

/// All results of one generator profile across every sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub app_name: String,
    #[serde(default)]
    pub results: Vec<BenchmarkResult>,
    /// `[variant, count]` pairs over every row.
    #[serde(default)]
    pub statistics: Vec<(OutcomeKind, usize)>,
    pub updated_at: DateTime<Utc>,
}

impl BenchmarkReport {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            results: Vec::new(),
            statistics: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let report = serde_json::from_str(&content)
            .with_context(|| format!("Invalid report {}", path.display()))?;
        Ok(Some(report))
    }

    /// Add rows after the existing ones and recompute the statistics.
    pub fn append(&mut self, rows: impl IntoIterator<Item = BenchmarkResult>) {
        self.results.extend(rows);
        self.statistics = OutcomeKind::all()
            .into_iter()
            .map(|kind| {
                let count = self.results.iter().filter(|r| r.variant == kind).count();
                (kind, count)
            })
            .filter(|(_, count)| *count > 0)
            .collect();
        self.updated_at = Utc::now();
    }

    pub fn count(&self, kind: OutcomeKind) -> usize {
        self.statistics
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }

    pub fn total_cost(&self) -> f64 {
        self.results.iter().map(|r| r.llm_cost).sum()
    }

    /// Append `rows` to the report at `path`, creating it when missing.
    ///
    /// Holds a lock on the report's directory so concurrent sweeps of the
    /// same profile do not lose rows.
    pub fn append_to(path: &Path, app_name: &str, rows: Vec<BenchmarkResult>) -> Result<Self> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let _lock = FileLock::acquire(dir, REPORT_LOCK_TIMEOUT)?;
        let mut report = Self::load(path)?.unwrap_or_else(|| Self::new(app_name));
        report.append(rows);
        write_atomic(path, &serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        Ok(report)
    }

    /// Human-readable per-variant summary.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "{}: {} result(s), ${:.4} total\n",
            self.app_name,
            self.results.len(),
            self.total_cost()
        );
        for (kind, count) in &self.statistics {
            out.push_str(&format!("  {:<24} {}\n", kind, count));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, variant: OutcomeKind, cost: f64) -> BenchmarkResult {
        BenchmarkResult {
            cpv_name: name.to_string(),
            variant,
            message: String::new(),
            elapsed_time: 1.5,
            llm_cost: cost,
            sweep_id: "s1".to_string(),
            finished_at: Utc::now(),
        }
    }

    fn document(variant: OutcomeKind, diff: Option<&str>) -> TaskResultDocument {
        TaskResultDocument {
            variant,
            diff: diff.map(str::to_string),
            error: None,
            usage: Usage::new(10, 5, 0.25),
            llm_cost: 0.25,
            attempts: 2,
            stop_reason: Some(StopReason::AttemptsExhausted),
            elapsed_ms: 1200,
        }
    }

    #[test]
    fn sweeps_accumulate_without_touching_old_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports/agent.json");

        let first = BenchmarkReport::append_to(
            &path,
            "agent",
            vec![row("cpv-1", OutcomeKind::Sound, 0.5), row("cpv-2", OutcomeKind::Wrong, 0.25)],
        )
        .unwrap();
        let original = first.results.clone();

        let second =
            BenchmarkReport::append_to(&path, "agent", vec![row("cpv-1", OutcomeKind::Sound, 1.0)])
                .unwrap();
        assert_eq!(second.results.len(), 3);
        assert_eq!(&second.results[..2], &original[..]);
        assert_eq!(second.count(OutcomeKind::Sound), 2);
        assert_eq!(second.count(OutcomeKind::Wrong), 1);
        assert_eq!(second.count(OutcomeKind::NoPatch), 0);
        assert!((second.total_cost() - 1.75).abs() < 1e-9);

        let stored = BenchmarkReport::load(&path).unwrap().unwrap();
        assert_eq!(stored, second);
    }

    #[test]
    fn statistics_serialize_as_pairs() {
        let mut report = BenchmarkReport::new("agent");
        report.append(vec![row("cpv-1", OutcomeKind::NoPatch, 0.0)]);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["statistics"], serde_json::json!([["no_patch", 1]]));
        assert!(report.summary().contains("no_patch"));
    }

    #[test]
    fn missing_report_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(BenchmarkReport::load(&dir.path().join("none.json")).unwrap().is_none());
    }

    #[test]
    fn task_result_writes_final_diff() {
        let dir = tempfile::tempdir().unwrap();
        let doc = document(OutcomeKind::Wrong, Some("--- a/x\n+++ b/x\n"));
        doc.write(dir.path()).unwrap();

        assert!(dir.path().join("final-wrong.diff").exists());
        let loaded = TaskResultDocument::load(dir.path()).unwrap();
        assert_eq!(loaded, doc);
        assert_eq!(loaded.outcome().kind(), OutcomeKind::Wrong);
        assert_eq!(loaded.outcome().diff().unwrap().to_text(), "--- a/x\n+++ b/x\n");
    }

    #[test]
    fn unknown_error_document_keeps_its_message() {
        let mut doc = document(OutcomeKind::UnknownError, None);
        doc.error = Some("sandbox died".to_string());
        assert_eq!(
            doc.outcome(),
            Outcome::UnknownError {
                error: "sandbox died".to_string()
            }
        );
        let result = BenchmarkResult::from_document("cpv-3", &doc, Duration::from_secs(2), "s1");
        assert_eq!(result.variant, OutcomeKind::UnknownError);
        assert_eq!(result.message, "sandbox died");
    }

    #[test]
    fn result_message_names_the_stop_reason() {
        let doc = document(OutcomeKind::Wrong, Some("d"));
        let result = BenchmarkResult::from_document("cpv-1", &doc, Duration::from_secs(3), "s9");
        assert_eq!(result.message, "attempts_exhausted after 2 attempt(s)");
        assert_eq!(result.elapsed_time, 3.0);
        assert_eq!(result.llm_cost, 0.25);
        assert_eq!(result.sweep_id, "s9");
    }
}
