//! Cached sandbox environments.

mod pool;

pub use pool::{EnvironmentLease, EnvironmentPool, MARKER_FILE};

use crate::detection::ChallengeMode;
use crate::util::{hash_str, sanitize_component};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Flavour of a sandbox build. Variants never satisfy each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildVariant {
    /// Minimal build for applying and compiling patches.
    Clean,
    /// Symbols and instrumentation for deeper diagnosis.
    Debug,
    /// Execution tracing for fault localization.
    CallTrace,
}

impl BuildVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildVariant::Clean => "CLEAN",
            BuildVariant::Debug => "DEBUG",
            BuildVariant::CallTrace => "CALL_TRACE",
        }
    }

    pub fn all() -> [BuildVariant; 3] {
        [BuildVariant::Clean, BuildVariant::Debug, BuildVariant::CallTrace]
    }
}

impl fmt::Display for BuildVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BuildVariant::all()
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown build variant '{}'", s))
    }
}

/// Identity of a cached environment: project, challenge revisions, variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentKey {
    pub project: String,
    pub mode: ChallengeMode,
    pub variant: BuildVariant,
}

impl EnvironmentKey {
    pub fn new(project: impl Into<String>, mode: ChallengeMode, variant: BuildVariant) -> Self {
        Self {
            project: project.into(),
            mode,
            variant,
        }
    }

    /// Cache location relative to the pool root:
    /// `<project>-<revision hash>/<VARIANT>`.
    pub fn relative_path(&self) -> PathBuf {
        let revisions = format!(
            "{}\0{}\0{}\0{}",
            self.project,
            self.mode.kind(),
            self.mode.base_ref(),
            self.mode.delta_ref().unwrap_or("")
        );
        PathBuf::from(format!(
            "{}-{}",
            sanitize_component(&self.project),
            hash_str(&revisions)
        ))
        .join(self.variant.as_str())
    }
}

impl fmt::Display for EnvironmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.mode, self.variant)
    }
}
