//! Build-and-reproduce sandboxes.
//!
//! The sandbox is a black box that can build a project variant, classify a
//! candidate diff against a vulnerability, and reproduce the original crash.
//! [`script::ScriptSandbox`] implements it with configured commands.

pub mod script;

use crate::detection::Detection;
use crate::environment::EnvironmentKey;
use crate::git_ops;
use crate::outcome::{Diff, Outcome};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use script::{ScriptSandbox, ScriptSandboxConfig};

/// A built, ready-to-use sandbox instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxHandle {
    pub key: EnvironmentKey,
    /// Cached build output for this key.
    pub artifact_dir: PathBuf,
    /// Mutable source checkout the sandbox builds from.
    pub source_dir: PathBuf,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Build `key`'s variant from `source_dir` into `artifact_dir`.
    async fn build_variant(
        &self,
        key: &EnvironmentKey,
        source_dir: &Path,
        artifact_dir: &Path,
    ) -> anyhow::Result<SandboxHandle>;

    /// Apply `diff`, rebuild and test it. Errors mean the sandbox itself
    /// failed, not the patch.
    async fn classify(
        &self,
        handle: &SandboxHandle,
        diff: &Diff,
        detection: &Detection,
    ) -> anyhow::Result<Outcome>;

    /// Run the PoV against the unpatched build; the crash log if it crashes.
    async fn reproduce(
        &self,
        handle: &SandboxHandle,
        detection: &Detection,
    ) -> anyhow::Result<Option<String>>;

    /// Drop every uncommitted change in the handle's checkout.
    async fn restore_clean(&self, handle: &SandboxHandle) -> anyhow::Result<()> {
        let source = handle.source_dir.clone();
        tokio::task::spawn_blocking(move || git_ops::restore_clean(&source))
            .await
            .map_err(|e| anyhow::anyhow!("restore task failed: {}", e))?
    }
}
