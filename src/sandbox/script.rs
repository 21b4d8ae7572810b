use super::{Sandbox, SandboxHandle};
use crate::detection::Detection;
use crate::environment::EnvironmentKey;
use crate::git_ops;
use crate::outcome::{Diff, Outcome, OutcomeKind};
use crate::util::{run_command_async, CommandRunResult};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUILD_OUT_DIR: &str = "out";
const PATCHED_OUT_DIR: &str = "patched";
const LOG_TAIL_CHARS: usize = 8_000;

fn default_command_timeout_secs() -> u64 {
    1800
}

/// Commands making up a script sandbox. Each is an argv list run in the
/// source checkout with `SOURCE_DIR`, `OUT_DIR`, `BUILD_VARIANT`,
/// `PROJECT_NAME` and `GIT_REF` set; reproduction also gets `POV_PATH`,
/// `HARNESS_NAME` and `SANITIZER_NAME`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSandboxConfig {
    pub build_command: Vec<String>,
    #[serde(default)]
    pub reproduce_command: Option<Vec<String>>,
    #[serde(default)]
    pub test_command: Option<Vec<String>>,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl ScriptSandboxConfig {
    pub fn validate(&self) -> Result<()> {
        let commands = [
            ("build_command", Some(&self.build_command)),
            ("reproduce_command", self.reproduce_command.as_ref()),
            ("test_command", self.test_command.as_ref()),
        ];
        for (name, argv) in commands {
            if let Some(argv) = argv {
                if argv.first().map(|p| p.trim().is_empty()).unwrap_or(true) {
                    return Err(anyhow!("sandbox {} must not be empty", name));
                }
            }
        }
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("sandbox command_timeout_secs must be positive"));
        }
        Ok(())
    }
}

/// Sandbox driven by user-supplied build, reproduce and test commands.
///
/// Classification order: the diff must apply and build (else
/// `Uncompilable`), every PoV must stop crashing (else `Vulnerable`), and the
/// test command must pass (else `Wrong`). Without PoVs or a reproduce command
/// the patch can only be `Compilable`.
#[derive(Debug, Clone)]
pub struct ScriptSandbox {
    config: ScriptSandboxConfig,
}

struct Pov {
    path: PathBuf,
    harness: String,
    sanitizer: String,
}

impl ScriptSandbox {
    pub fn new(config: ScriptSandboxConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.command_timeout_secs)
    }

    async fn run(
        &self,
        argv: &[String],
        key: &EnvironmentKey,
        source_dir: &Path,
        out_dir: &Path,
        extra_env: &[(&str, &str)],
    ) -> Result<CommandRunResult> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("empty sandbox command"))?;
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .current_dir(source_dir)
            .env("SOURCE_DIR", source_dir)
            .env("OUT_DIR", out_dir)
            .env("BUILD_VARIANT", key.variant.as_str())
            .env("PROJECT_NAME", &key.project)
            .env("GIT_REF", key.mode.target_ref());
        for (k, v) in extra_env {
            cmd.env(k, v);
        }
        run_command_async(&mut cmd, None, self.timeout())
            .await
            .map_err(|e| anyhow!("{}: {}", program, e))
    }

    fn write_povs(detection: &Detection, out_dir: &Path) -> Result<Vec<Pov>> {
        let mut povs = Vec::with_capacity(detection.blobs.len());
        for (index, blob) in detection.blobs.iter().enumerate() {
            let path = out_dir.join(format!("pov-{}.bin", index));
            std::fs::write(&path, blob.decode()?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            povs.push(Pov {
                path,
                harness: blob.harness_name.clone(),
                sanitizer: blob.sanitizer_name.clone(),
            });
        }
        Ok(povs)
    }

    /// Crash log of the first PoV that still crashes the build in `out_dir`.
    async fn first_crash(
        &self,
        handle: &SandboxHandle,
        detection: &Detection,
        out_dir: &Path,
    ) -> Result<Option<String>> {
        let Some(reproduce) = &self.config.reproduce_command else {
            return Ok(None);
        };
        for pov in Self::write_povs(detection, out_dir)? {
            let pov_path = pov.path.to_string_lossy().into_owned();
            let result = self
                .run(
                    reproduce,
                    &handle.key,
                    &handle.source_dir,
                    out_dir,
                    &[
                        ("POV_PATH", pov_path.as_str()),
                        ("HARNESS_NAME", pov.harness.as_str()),
                        ("SANITIZER_NAME", pov.sanitizer.as_str()),
                    ],
                )
                .await?;
            if !result.success() {
                tracing::debug!(
                    harness = %pov.harness,
                    timed_out = result.timed_out,
                    "PoV crashed"
                );
                return Ok(Some(result.output_tail(LOG_TAIL_CHARS)));
            }
        }
        Ok(None)
    }
}

fn fresh_dir(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_dir_all(path)
            .with_context(|| format!("Failed to clear {}", path.display()))?;
    }
    std::fs::create_dir_all(path).with_context(|| format!("Failed to create {}", path.display()))
}

#[async_trait]
impl Sandbox for ScriptSandbox {
    async fn build_variant(
        &self,
        key: &EnvironmentKey,
        source_dir: &Path,
        artifact_dir: &Path,
    ) -> Result<SandboxHandle> {
        let head = git_ops::resolve_commit(source_dir, "HEAD")?;
        if !head.eq_ignore_ascii_case(key.mode.target_ref()) {
            return Err(anyhow!(
                "{} is at {} but {} needs {}",
                source_dir.display(),
                head,
                key,
                key.mode.target_ref()
            ));
        }

        let out_dir = artifact_dir.join(BUILD_OUT_DIR);
        fresh_dir(&out_dir)?;
        let result = self
            .run(&self.config.build_command, key, source_dir, &out_dir, &[])
            .await?;
        if !result.success() {
            return Err(anyhow!(
                "build of {} failed{}:\n{}",
                key,
                if result.timed_out { " (timed out)" } else { "" },
                result.output_tail(LOG_TAIL_CHARS)
            ));
        }
        Ok(SandboxHandle {
            key: key.clone(),
            artifact_dir: artifact_dir.to_path_buf(),
            source_dir: source_dir.to_path_buf(),
        })
    }

    async fn classify(
        &self,
        handle: &SandboxHandle,
        diff: &Diff,
        detection: &Detection,
    ) -> Result<Outcome> {
        let source = handle.source_dir.clone();
        let bytes = diff.as_bytes().to_vec();
        let applied = tokio::task::spawn_blocking(move || git_ops::apply_patch(&source, &bytes))
            .await
            .map_err(|e| anyhow!("apply task failed: {}", e))?;
        if let Err(err) = applied {
            tracing::debug!(error = %format!("{:#}", err), "patch does not apply");
            return Ok(Outcome::with_diff(OutcomeKind::Uncompilable, diff.clone()));
        }

        let out_dir = handle.artifact_dir.join(PATCHED_OUT_DIR);
        fresh_dir(&out_dir)?;
        let build = self
            .run(
                &self.config.build_command,
                &handle.key,
                &handle.source_dir,
                &out_dir,
                &[],
            )
            .await?;
        if !build.success() {
            tracing::debug!(timed_out = build.timed_out, "patched build failed");
            return Ok(Outcome::with_diff(OutcomeKind::Uncompilable, diff.clone()));
        }

        if detection.blobs.is_empty() || self.config.reproduce_command.is_none() {
            return Ok(Outcome::with_diff(OutcomeKind::Compilable, diff.clone()));
        }
        if self.first_crash(handle, detection, &out_dir).await?.is_some() {
            return Ok(Outcome::with_diff(OutcomeKind::Vulnerable, diff.clone()));
        }

        let Some(tests) = &self.config.test_command else {
            return Ok(Outcome::with_diff(OutcomeKind::Sound, diff.clone()));
        };
        let kind = match self
            .run(tests, &handle.key, &handle.source_dir, &out_dir, &[])
            .await
        {
            Ok(result) if result.timed_out => OutcomeKind::InternalTestsFailure,
            Ok(result) if result.success() => OutcomeKind::Sound,
            Ok(_) => OutcomeKind::Wrong,
            Err(err) => {
                tracing::warn!(error = %err, "test harness failed to start");
                OutcomeKind::InternalTestsFailure
            }
        };
        Ok(Outcome::with_diff(kind, diff.clone()))
    }

    async fn reproduce(
        &self,
        handle: &SandboxHandle,
        detection: &Detection,
    ) -> Result<Option<String>> {
        let out_dir = handle.artifact_dir.join(BUILD_OUT_DIR);
        std::fs::create_dir_all(&out_dir)
            .with_context(|| format!("Failed to create {}", out_dir.display()))?;
        self.first_crash(handle, detection, &out_dir).await
    }
}
