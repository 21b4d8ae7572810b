use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use patchbench::config::{default_cache_dir, Config, DEFAULT_CONFIG_FILE};
use patchbench::detection::ChallengeMode;
use patchbench::environment::{BuildVariant, EnvironmentKey, EnvironmentPool};
use patchbench::logging;
use patchbench::orchestrator::{BenchmarkSettings, Orchestrator};
use patchbench::report::BenchmarkReport;
use patchbench::sandbox::ScriptSandbox;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const TASK_BINARY: &str = "patchbench-task";

#[derive(Parser, Debug)]
#[command(
    name = "patchbench",
    about = "Benchmark patch generators against known vulnerabilities",
    version
)]
struct Cli {
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every detection file against the selected generator profiles
    Run(RunArgs),
    /// Pre-build environment variants for a checkout
    BuildEnv(BuildEnvArgs),
    /// Print per-variant counts of stored reports
    Summarize(SummarizeArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(required = true)]
    detection_files: Vec<PathBuf>,
    /// Generator profile; repeat for several (default: all configured)
    #[arg(short, long = "generator")]
    generators: Vec<String>,
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    #[arg(long, default_value = "reports")]
    reports_dir: PathBuf,
    /// Per-cell timeout in seconds
    #[arg(long, default_value_t = 3600)]
    timeout: u64,
    /// Per-cell generation cost ceiling in USD
    #[arg(long, default_value_t = 5.0)]
    cost_limit: f64,
    /// Replace a stored cell result only when the new one is not worse
    #[arg(long)]
    keep_best: bool,
    /// Skip cells whose stored result is sound (needs --keep-best)
    #[arg(long, requires = "keep_best")]
    early_exit_on_sound: bool,
    /// Remove each task's environment cache before and after its cell
    #[arg(long)]
    no_cache: bool,
    /// Cells run concurrently
    #[arg(short, long, default_value_t = 1)]
    jobs: usize,
    /// Child host executable (default: next to this binary)
    #[arg(long)]
    task_binary: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct BuildEnvArgs {
    project_name: String,
    source_dir: PathBuf,
    /// `full` or `delta`
    #[arg(long, default_value = "full")]
    mode: String,
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    /// Variants to build (default: all)
    #[arg(long = "variant")]
    variants: Vec<BuildVariant>,
}

#[derive(Args, Debug)]
struct SummarizeArgs {
    #[arg(required = true)]
    reports: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match cli.command {
        Commands::Run(args) => run(&cli.config, args).await,
        Commands::BuildEnv(args) => build_env(&cli.config, args).await,
        Commands::Summarize(args) => summarize(args),
    }
}

async fn run(config_path: &Path, args: RunArgs) -> Result<()> {
    let config = Config::load(config_path)?;
    let profiles: Vec<String> = if args.generators.is_empty() {
        config.generators.iter().map(|p| p.name.clone()).collect()
    } else {
        for name in &args.generators {
            config.profile(name)?;
        }
        args.generators.clone()
    };
    if profiles.is_empty() {
        bail!("no generator profiles configured in {}", config_path.display());
    }

    let task_binary = match args.task_binary {
        Some(path) => path,
        None => sibling_binary(TASK_BINARY)?,
    };
    let mut settings = BenchmarkSettings::new(
        vec![task_binary.display().to_string()],
        args.reports_dir,
        args.cache_dir.unwrap_or_else(default_cache_dir),
    );
    settings.config_path = Some(
        config_path
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", config_path.display()))?,
    );
    settings.timeout = Duration::from_secs(args.timeout);
    settings.cost_limit = args.cost_limit;
    settings.jobs = args.jobs.max(1);
    settings.keep_best = args.keep_best;
    settings.early_exit_on_sound = args.early_exit_on_sound;
    settings.no_cache = args.no_cache;

    let orchestrator = Orchestrator::new(settings, config.severity_order.clone());
    for profile in &profiles {
        let report = orchestrator
            .run_profile(profile, &args.detection_files)
            .await
            .with_context(|| format!("Sweep for '{}' failed", profile))?;
        print!("{}", report.summary());
    }
    Ok(())
}

async fn build_env(config_path: &Path, args: BuildEnvArgs) -> Result<()> {
    let config = Config::load(config_path)?;
    let sandbox = Arc::new(ScriptSandbox::new(config.sandbox()?.clone())?);
    let source = args
        .source_dir
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", args.source_dir.display()))?;
    let mode = ChallengeMode::from_checkout(&source, &args.mode)?;
    let pool = EnvironmentPool::new(args.cache_dir.unwrap_or_else(default_cache_dir), sandbox);

    let variants = if args.variants.is_empty() {
        BuildVariant::all().to_vec()
    } else {
        args.variants
    };
    for variant in variants {
        let key = EnvironmentKey::new(args.project_name.clone(), mode.clone(), variant);
        let lease = pool.acquire(&key, &source).await?;
        println!(
            "{} {} {}",
            key,
            if lease.freshly_built() { "built" } else { "cached" },
            lease.handle().artifact_dir.display()
        );
    }
    Ok(())
}

fn summarize(args: SummarizeArgs) -> Result<()> {
    for path in &args.reports {
        let report = BenchmarkReport::load(path)?
            .ok_or_else(|| anyhow!("{} does not exist", path.display()))?;
        print!("{}", report.summary());
    }
    Ok(())
}

fn sibling_binary(name: &str) -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Failed to locate the running executable")?;
    Ok(exe.with_file_name(format!("{}{}", name, std::env::consts::EXE_SUFFIX)))
}
