//! Benchmark configuration, read from `patchbench.toml`.
//!
//! Holds the severity order, the generator profiles and the sandbox
//! commands. Secrets never live here: the HTTP generator reads its key from
//! `OPENROUTER_API_KEY`.

use crate::generator::{AgentCommandGenerator, Generator, OpenRouterGenerator};
use crate::outcome::SeverityOrder;
use crate::repair::RepairConfig;
use crate::sandbox::ScriptSandboxConfig;
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub const DEFAULT_CONFIG_FILE: &str = "patchbench.toml";

fn default_max_iterations() -> usize {
    3
}

fn default_blocking_budget() -> bool {
    true
}

fn default_generation_timeout_secs() -> u64 {
    900
}

fn default_evaluation_timeout_secs() -> u64 {
    1800
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Best first. Only ranked variants; infrastructure failures never rank.
    #[serde(default)]
    pub severity_order: SeverityOrder,
    #[serde(default, rename = "generator")]
    pub generators: Vec<GeneratorProfile>,
    #[serde(default)]
    pub sandbox: Option<ScriptSandboxConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratorKind {
    OpenRouter,
    AgentCommand,
}

/// One generator configuration; each profile gets its own report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneratorProfile {
    pub name: String,
    pub kind: GeneratorKind,
    #[serde(default)]
    pub model: Option<String>,
    /// argv of the agent (`agent_command` only).
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_blocking_budget")]
    pub blocking_budget: bool,
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,
    #[serde(default = "default_evaluation_timeout_secs")]
    pub evaluation_timeout_secs: u64,
    #[serde(default)]
    pub max_feedback_chars: Option<usize>,
    #[serde(default)]
    pub api_base: Option<String>,
}

impl GeneratorProfile {
    fn validate(&self) -> Result<()> {
        let valid_name = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid_name {
            bail!(
                "generator name '{}' may only contain letters, digits, '-' and '_'",
                self.name
            );
        }
        if self.max_iterations == 0 {
            bail!("generator '{}': max_iterations must be at least 1", self.name);
        }
        if self.generation_timeout_secs == 0 || self.evaluation_timeout_secs == 0 {
            bail!("generator '{}': timeouts must be positive", self.name);
        }
        match self.kind {
            GeneratorKind::OpenRouter => {
                if self.model.as_deref().map(str::trim).unwrap_or("").is_empty() {
                    bail!("generator '{}': open_router needs a model", self.name);
                }
            }
            GeneratorKind::AgentCommand => {
                if self.command.first().map(|c| c.trim().is_empty()).unwrap_or(true) {
                    bail!("generator '{}': agent_command needs a command", self.name);
                }
            }
        }
        if let Some(base) = &self.api_base {
            let parsed = url::Url::parse(base)
                .with_context(|| format!("generator '{}': invalid api_base", self.name))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                bail!(
                    "generator '{}': api_base must be http(s), got '{}'",
                    self.name,
                    parsed.scheme()
                );
            }
        }
        Ok(())
    }

    /// Loop settings for this profile.
    pub fn repair_config(
        &self,
        artifact_dir: Option<PathBuf>,
        deadline: Option<Instant>,
    ) -> RepairConfig {
        RepairConfig {
            max_iterations: self.max_iterations,
            generation_timeout: Duration::from_secs(self.generation_timeout_secs),
            evaluation_timeout: Duration::from_secs(self.evaluation_timeout_secs),
            max_feedback_chars: self.max_feedback_chars,
            deadline,
            artifact_dir,
        }
    }

    /// Instantiate the generator this profile describes.
    pub fn build(&self) -> Result<Box<dyn Generator>> {
        match self.kind {
            GeneratorKind::OpenRouter => {
                let model = self
                    .model
                    .as_deref()
                    .ok_or_else(|| anyhow!("generator '{}' has no model", self.name))?;
                let generator =
                    OpenRouterGenerator::from_env(&self.name, model, self.api_base.as_deref())?;
                Ok(Box::new(generator))
            }
            GeneratorKind::AgentCommand => {
                let generator = AgentCommandGenerator::new(
                    self.name.clone(),
                    self.command.clone(),
                    self.model.clone(),
                    Duration::from_secs(self.generation_timeout_secs),
                )?;
                Ok(Box::new(generator))
            }
        }
    }
}

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for profile in &self.generators {
            profile.validate()?;
            if !seen.insert(profile.name.as_str()) {
                bail!("duplicate generator profile '{}'", profile.name);
            }
        }
        if let Some(sandbox) = &self.sandbox {
            sandbox.validate()?;
        }
        Ok(())
    }

    pub fn profile(&self, name: &str) -> Result<&GeneratorProfile> {
        self.generators
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| {
                let known: Vec<&str> = self.generators.iter().map(|p| p.name.as_str()).collect();
                anyhow!(
                    "unknown generator profile '{}' (configured: {})",
                    name,
                    if known.is_empty() {
                        "none".to_string()
                    } else {
                        known.join(", ")
                    }
                )
            })
    }

    pub fn sandbox(&self) -> Result<&ScriptSandboxConfig> {
        self.sandbox
            .as_ref()
            .ok_or_else(|| anyhow!("config has no [sandbox] section"))
    }
}

/// `<user cache dir>/patchbench`, or `.cache/patchbench` when there is none.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("patchbench")
}
