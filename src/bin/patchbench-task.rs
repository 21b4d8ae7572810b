//! Child host for one benchmark cell.
//!
//! Repairs a single detection and writes `task_result.json` into the output
//! directory. Exits 0 whenever a result was written, whatever its variant.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use patchbench::budget::{BudgetGovernor, BudgetedGenerator};
use patchbench::config::{default_cache_dir, Config, DEFAULT_CONFIG_FILE};
use patchbench::detection::Detection;
use patchbench::environment::{BuildVariant, EnvironmentKey, EnvironmentPool};
use patchbench::logging;
use patchbench::repair::{AbortSignal, RepairLoop, StopReason, Task};
use patchbench::report::TaskResultDocument;
use patchbench::sandbox::{Sandbox, ScriptSandbox};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Time past the deadline for the running attempt before it is cut off.
const FINISH_GRACE: Duration = Duration::from_secs(30);
/// Time between a shutdown signal and cancelling the running attempt.
const ABORT_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    name = "patchbench-task",
    about = "Repair one vulnerability and write its result document",
    version
)]
struct Args {
    /// Source checkout of the target project
    #[arg(long)]
    source_dir: PathBuf,
    /// Detection file (TOML) describing the vulnerability
    #[arg(long)]
    detection_file: PathBuf,
    /// Where task_result.json and per-attempt files go
    #[arg(long)]
    output_dir: PathBuf,
    /// Wall-clock limit in seconds; no attempt starts after it
    #[arg(long, default_value_t = 3600)]
    timeout: u64,
    /// Generation cost ceiling in USD
    #[arg(long, default_value_t = 5.0)]
    cost_limit: f64,
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Generator profile from the config
    #[arg(long)]
    generator: String,
    /// Environment cache root
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    let started = Instant::now();
    let document = run(&args, started).await?;
    document.write(&args.output_dir)?;
    tracing::info!(
        variant = %document.variant,
        attempts = document.attempts,
        cost = document.llm_cost,
        "result written"
    );
    Ok(())
}

async fn run(args: &Args, started: Instant) -> Result<TaskResultDocument> {
    let config = Config::load(&args.config)?;
    let profile = config.profile(&args.generator)?;
    let detection = Detection::load(&args.detection_file)?;
    let sandbox: Arc<dyn Sandbox> = Arc::new(ScriptSandbox::new(config.sandbox()?.clone())?);
    let generator = BudgetedGenerator::new(
        profile.build()?,
        Arc::new(BudgetGovernor::new(args.cost_limit, profile.blocking_budget)),
    );
    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("Failed to create {}", args.output_dir.display()))?;

    let cache_dir = args.cache_dir.clone().unwrap_or_else(default_cache_dir);
    let pool = EnvironmentPool::new(cache_dir, sandbox.clone());
    let key = EnvironmentKey::new(
        detection.project_name.clone(),
        detection.mode.clone(),
        BuildVariant::Clean,
    );
    let lease = match pool.acquire(&key, &args.source_dir).await {
        Ok(lease) => lease,
        Err(err) => {
            tracing::error!(key = %key, error = %format!("{:#}", err), "environment unavailable");
            return Ok(TaskResultDocument::failure(
                format!("environment build failed: {:#}", err),
                started.elapsed(),
            ));
        }
    };

    let limit = Duration::from_secs(args.timeout);
    let repair_config = profile.repair_config(Some(args.output_dir.clone()), Some(started + limit));
    let abort = AbortSignal::new();
    let repair = RepairLoop::new(
        &generator,
        sandbox.as_ref(),
        &config.severity_order,
        repair_config,
    )
    .with_abort(abort.clone());

    let mut task = Task::new(detection);
    tracing::info!(task = %task.id, generator = %profile.name, key = %key, "repair started");
    let deadline = (limit + FINISH_GRACE).saturating_sub(started.elapsed());
    let interrupt = async {
        tokio::select! {
            _ = tokio::time::sleep(deadline) => StopReason::Deadline,
            _ = shutdown(abort.clone()) => StopReason::Aborted,
        }
    };
    repair.run_until(&mut task, lease.handle(), interrupt).await;
    tracing::info!(
        task = %task.id,
        spent = task.usage().total_cost(),
        metered = generator.governor().total().total_cost(),
        "generation cost"
    );
    Ok(TaskResultDocument::from_task(&task, started.elapsed()))
}

/// Resolves `ABORT_GRACE` after SIGTERM or Ctrl-C, having set `abort` so the
/// loop stops at the next attempt boundary in the meantime.
async fn shutdown(abort: AbortSignal) {
    wait_for_signal().await;
    tracing::warn!("shutdown requested; stopping after the current attempt");
    abort.abort();
    tokio::time::sleep(ABORT_GRACE).await;
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut term) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = term.recv() => {}
                _ = ctrl_c() => {}
            }
            return;
        }
    }
    ctrl_c().await;
}

/// Ctrl-C, or never when it cannot be listened for.
async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
