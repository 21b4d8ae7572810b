//! The per-task repair loop.
//!
//! A task moves `Pending -> Generating -> Evaluating -> (Retrying | Done)`.
//! Each pass asks the generator for a diff, has the sandbox classify it, and
//! either stops or retries with every failed diff so far fed back into the
//! prompt. The reported outcome is the best over all attempts.

pub mod prompt;

use crate::detection::{bug_class_from_crash_log, Detection};
use crate::generator::{GenerationRequest, Generator, GeneratorError};
use crate::outcome::{Diff, Outcome, OutcomeKind, SeverityOrder};
use crate::sandbox::{Sandbox, SandboxHandle};
use crate::usage::Usage;
use crate::util::write_atomic;
use prompt::{render_prompt, Feedback};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairState {
    Pending,
    Generating,
    Evaluating,
    Retrying,
    Done,
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Sound,
    AttemptsExhausted,
    /// The generator returned an empty diff.
    EmptyDiff,
    BudgetExhausted,
    Aborted,
    Deadline,
    /// The sandbox failed or timed out while classifying.
    EvaluationError,
    /// The test harness failed; retrying would not tell us more.
    HarnessFailure,
    /// The checkout could not be restored.
    InfrastructureFailure,
}

/// One generation + evaluation cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based, strictly increasing within a task.
    pub sequence: usize,
    pub prompt: String,
    pub diff: Option<Diff>,
    pub outcome: Outcome,
    pub usage: Usage,
    pub elapsed_ms: u64,
}

/// One vulnerability to repair and everything the loop learned about it.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub detection: Detection,
    pub bug_class: Option<String>,
    pub crash_log: Option<String>,
    attempts: Vec<Attempt>,
    spent: Usage,
    state: RepairState,
    final_outcome: Option<Outcome>,
    stop_reason: Option<StopReason>,
}

impl Task {
    pub fn new(detection: Detection) -> Self {
        Self {
            id: detection.vulnerability_identifier.clone(),
            bug_class: detection.bug_class.clone(),
            detection,
            crash_log: None,
            attempts: Vec::new(),
            spent: Usage::zero(),
            state: RepairState::Pending,
            final_outcome: None,
            stop_reason: None,
        }
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn state(&self) -> RepairState {
        self.state
    }

    /// Selected outcome; `NoPatch` until the loop has finished.
    pub fn final_outcome(&self) -> &Outcome {
        self.final_outcome.as_ref().unwrap_or(&Outcome::NoPatch)
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    /// Usage of every generation that returned, including one whose
    /// attempt was cut off before it was recorded.
    pub fn usage(&self) -> Usage {
        self.spent
    }

    fn transition(&mut self, next: RepairState) {
        tracing::debug!(task = %self.id, from = ?self.state, to = ?next, "state");
        self.state = next;
    }

    /// Report the best outcome over the attempts so far and stop.
    ///
    /// Also used when the loop was cancelled mid-attempt.
    pub fn settle(&mut self, order: &SeverityOrder, reason: StopReason) {
        let best = order
            .select_best(self.attempts.iter().map(|a| &a.outcome))
            .cloned()
            .unwrap_or(Outcome::NoPatch);
        self.finish(best, reason);
    }

    fn finish(&mut self, outcome: Outcome, reason: StopReason) {
        self.final_outcome = Some(outcome);
        self.stop_reason = Some(reason);
        self.transition(RepairState::Done);
    }
}

/// External cancellation flag, checked between attempts.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct RepairConfig {
    pub max_iterations: usize,
    pub generation_timeout: Duration,
    pub evaluation_timeout: Duration,
    pub max_feedback_chars: Option<usize>,
    /// No new attempt starts after this instant.
    pub deadline: Option<Instant>,
    /// Where `iter_<n>/prompt.txt` and `iter_<n>/diff.txt` go.
    pub artifact_dir: Option<PathBuf>,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            generation_timeout: Duration::from_secs(900),
            evaluation_timeout: Duration::from_secs(1800),
            max_feedback_chars: None,
            deadline: None,
            artifact_dir: None,
        }
    }
}

enum Generated {
    Diff(Diff, Usage),
    Empty(Usage),
    Failed(String),
    BudgetExhausted,
}

pub struct RepairLoop<'a> {
    generator: &'a dyn Generator,
    sandbox: &'a dyn Sandbox,
    order: &'a SeverityOrder,
    config: RepairConfig,
    abort: AbortSignal,
}

impl<'a> RepairLoop<'a> {
    pub fn new(
        generator: &'a dyn Generator,
        sandbox: &'a dyn Sandbox,
        order: &'a SeverityOrder,
        config: RepairConfig,
    ) -> Self {
        Self {
            generator,
            sandbox,
            order,
            config,
            abort: AbortSignal::new(),
        }
    }

    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    /// Drive `task` to completion. Always leaves a final outcome on the task.
    pub async fn run(&self, task: &mut Task, handle: &SandboxHandle) {
        if task.crash_log.is_none() {
            self.gather_evidence(task, handle).await;
        }

        let max_iterations = self.config.max_iterations.max(1);
        let mut feedback = Feedback::new(self.config.max_feedback_chars);
        task.transition(RepairState::Generating);

        let reason = loop {
            if self.abort.is_aborted() {
                break StopReason::Aborted;
            }
            if self.config.deadline.is_some_and(|d| Instant::now() >= d) {
                break StopReason::Deadline;
            }

            let sequence = task.attempts.len() + 1;
            let started = Instant::now();
            let prompt = render_prompt(
                task.bug_class.as_deref(),
                task.crash_log.as_deref(),
                &feedback,
            );
            let attempt_dir = self
                .config
                .artifact_dir
                .as_ref()
                .map(|dir| dir.join(format!("iter_{}", sequence)));
            if let Some(dir) = &attempt_dir {
                if let Err(err) = std::fs::create_dir_all(dir) {
                    tracing::warn!(error = %err, "could not create attempt directory");
                }
            }

            if let Err(err) = self.sandbox.restore_clean(handle).await {
                task.finish(unknown_error(&err), StopReason::InfrastructureFailure);
                return;
            }
            let generated = self.generate(&prompt, handle, attempt_dir.as_deref()).await;
            if let Err(err) = self.sandbox.restore_clean(handle).await {
                task.finish(unknown_error(&err), StopReason::InfrastructureFailure);
                return;
            }

            let (diff, usage, empty) = match generated {
                Generated::BudgetExhausted => break StopReason::BudgetExhausted,
                Generated::Failed(message) => {
                    tracing::warn!(
                        task = %task.id,
                        attempt = sequence,
                        error = %message,
                        "generation failed"
                    );
                    (None, Usage::zero(), false)
                }
                Generated::Empty(usage) => (None, usage, true),
                Generated::Diff(diff, usage) => (Some(diff), usage, false),
            };
            task.spent += usage;

            // Some((final outcome, reason)) when the task cannot continue.
            let mut fatal: Option<(Outcome, StopReason)> = None;
            let outcome = match &diff {
                None => Outcome::NoPatch,
                Some(diff) => {
                    task.transition(RepairState::Evaluating);
                    let evaluated = tokio::time::timeout(
                        self.config.evaluation_timeout,
                        self.sandbox.classify(handle, diff, &task.detection),
                    )
                    .await;
                    let outcome = match evaluated {
                        Ok(Ok(outcome)) => outcome,
                        Ok(Err(err)) => Outcome::UnknownError {
                            error: format!("{:#}", err),
                        },
                        Err(_) => Outcome::UnknownError {
                            error: format!(
                                "evaluation timed out after {}s",
                                self.config.evaluation_timeout.as_secs()
                            ),
                        },
                    };
                    if let Some(error) = outcome.error() {
                        tracing::error!(task = %task.id, attempt = sequence, %error, "evaluation failed");
                        fatal = Some((outcome.clone(), StopReason::EvaluationError));
                    }
                    if let Err(err) = self.sandbox.restore_clean(handle).await {
                        fatal.get_or_insert((unknown_error(&err), StopReason::InfrastructureFailure));
                    }
                    outcome
                }
            };

            store_attempt_files(attempt_dir.as_deref(), &prompt, diff.as_ref());
            tracing::info!(
                task = %task.id,
                attempt = sequence,
                variant = %outcome.kind(),
                tokens = usage.total_tokens(),
                "attempt finished"
            );

            let kind = outcome.kind();
            let terminal = outcome.is_terminal(sequence >= max_iterations);
            if let Some(diff) = &diff {
                if kind.is_retryable_failure() {
                    feedback.push(diff);
                }
            }
            task.attempts.push(Attempt {
                sequence,
                prompt,
                diff,
                outcome,
                usage,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });

            if let Some((outcome, reason)) = fatal {
                task.finish(outcome, reason);
                return;
            }
            if empty {
                break StopReason::EmptyDiff;
            }
            if kind == OutcomeKind::InternalTestsFailure {
                break StopReason::HarnessFailure;
            }
            if terminal {
                break if kind == OutcomeKind::Sound {
                    StopReason::Sound
                } else {
                    StopReason::AttemptsExhausted
                };
            }
            task.transition(RepairState::Retrying);
            task.transition(RepairState::Generating);
        };

        task.settle(self.order, reason);
        tracing::info!(
            task = %task.id,
            attempts = task.attempts.len(),
            variant = %task.final_outcome().kind(),
            reason = ?reason,
            "repair finished"
        );
    }

    /// Run until done or until `interrupt` resolves with the reason to
    /// report. An interrupted task drops its running attempt, has its
    /// checkout restored and settles on the best attempt so far.
    pub async fn run_until<F>(&self, task: &mut Task, handle: &SandboxHandle, interrupt: F)
    where
        F: Future<Output = StopReason>,
    {
        let interrupted = tokio::select! {
            _ = self.run(task, handle) => None,
            reason = interrupt => Some(reason),
        };
        let Some(reason) = interrupted else {
            return;
        };
        if task.state() == RepairState::Done {
            return;
        }
        tracing::warn!(task = %task.id, reason = ?reason, "running attempt cancelled");
        if let Err(err) = self.sandbox.restore_clean(handle).await {
            tracing::warn!(error = %format!("{:#}", err), "could not restore checkout");
        }
        task.settle(self.order, reason);
    }

    async fn generate(
        &self,
        prompt: &str,
        handle: &SandboxHandle,
        artifact_dir: Option<&Path>,
    ) -> Generated {
        let request = GenerationRequest {
            prompt,
            checkout: &handle.source_dir,
            artifact_dir,
        };
        let timeout = self.config.generation_timeout;
        match tokio::time::timeout(timeout, self.generator.generate(&request)).await {
            Err(_) => Generated::Failed(GeneratorError::TimedOut(timeout).to_string()),
            Ok(Err(GeneratorError::BudgetExceeded {
                spent_usd,
                ceiling_usd,
            })) => {
                tracing::info!(spent_usd, ceiling_usd, "generation budget exhausted");
                Generated::BudgetExhausted
            }
            Ok(Err(err)) => Generated::Failed(format!("{:#}", err)),
            Ok(Ok(generation)) => {
                let usage = generation.usage.unwrap_or_default();
                if generation.is_empty() {
                    Generated::Empty(usage)
                } else {
                    let bytes = generation.diff.unwrap_or_default();
                    Generated::Diff(Diff::new(bytes), usage)
                }
            }
        }
    }

    /// Reproduce the crash on the unpatched build for prompt evidence.
    async fn gather_evidence(&self, task: &mut Task, handle: &SandboxHandle) {
        let reproduced = tokio::time::timeout(
            self.config.evaluation_timeout,
            self.sandbox.reproduce(handle, &task.detection),
        )
        .await;
        match reproduced {
            Ok(Ok(Some(log))) => {
                if task.bug_class.is_none() {
                    task.bug_class = bug_class_from_crash_log(&log);
                }
                task.crash_log = Some(log);
            }
            Ok(Ok(None)) => tracing::warn!(task = %task.id, "PoV did not reproduce"),
            Ok(Err(err)) => tracing::warn!(
                task = %task.id,
                error = %format!("{:#}", err),
                "crash reproduction failed"
            ),
            Err(_) => tracing::warn!(task = %task.id, "crash reproduction timed out"),
        }
    }
}

fn unknown_error(err: &anyhow::Error) -> Outcome {
    tracing::error!(error = %format!("{:#}", err), "checkout restore failed");
    Outcome::UnknownError {
        error: format!("{:#}", err),
    }
}

fn store_attempt_files(dir: Option<&Path>, prompt: &str, diff: Option<&Diff>) {
    let Some(dir) = dir else {
        return;
    };
    let diff_text = diff.map(Diff::to_text).unwrap_or_default();
    for (name, content) in [("prompt.txt", prompt), ("diff.txt", diff_text.as_str())] {
        if let Err(err) = write_atomic(&dir.join(name), content) {
            tracing::warn!(file = name, error = %err, "could not store attempt file");
        }
    }
}
