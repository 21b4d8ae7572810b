//! Patch generators.
//!
//! A generator turns a repair prompt into a candidate diff against the
//! checkout it is handed. Two adapters ship with the crate: an HTTP chat
//! completion client ([`open_router`]) and an external coding agent driven
//! through its stdin ([`agent`]).

pub mod agent;
pub mod open_router;

use crate::usage::Usage;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

pub use agent::AgentCommandGenerator;
pub use open_router::OpenRouterGenerator;

/// Input to a single generation call.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub prompt: &'a str,
    /// Source checkout the diff must apply to.
    pub checkout: &'a Path,
    /// Directory for per-attempt scratch output, when the caller keeps one.
    pub artifact_dir: Option<&'a Path>,
}

/// What a generator produced. Either field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generation {
    pub diff: Option<Vec<u8>>,
    pub usage: Option<Usage>,
}

impl Generation {
    /// True when there is no diff or it contains only whitespace.
    pub fn is_empty(&self) -> bool {
        self.diff
            .as_deref()
            .map(|d| d.iter().all(|b| b.is_ascii_whitespace()))
            .unwrap_or(true)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    /// The cost ceiling was already reached before the call.
    #[error("generation budget exceeded: ${spent_usd:.4} spent of ${ceiling_usd:.4}")]
    BudgetExceeded { spent_usd: f64, ceiling_usd: f64 },
    #[error("generation timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl GeneratorError {
    pub fn is_budget_exceeded(&self) -> bool {
        matches!(self, GeneratorError::BudgetExceeded { .. })
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Profile name used in logs.
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest<'_>)
        -> Result<Generation, GeneratorError>;
}

#[async_trait]
impl<G: Generator + ?Sized> Generator for Box<G> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn generate(
        &self,
        request: &GenerationRequest<'_>,
    ) -> Result<Generation, GeneratorError> {
        (**self).generate(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_diff_counts_as_empty() {
        assert!(Generation::default().is_empty());
        let blank = Generation {
            diff: Some(b" \n\t".to_vec()),
            usage: None,
        };
        assert!(blank.is_empty());
        let real = Generation {
            diff: Some(b"--- a/x\n+++ b/x\n".to_vec()),
            usage: None,
        };
        assert!(!real.is_empty());
    }

    #[test]
    fn budget_error_is_distinguishable() {
        let budget = GeneratorError::BudgetExceeded {
            spent_usd: 2.0,
            ceiling_usd: 1.0,
        };
        assert!(budget.is_budget_exceeded());
        assert!(budget.to_string().contains("budget exceeded"));
        let failed = GeneratorError::from(anyhow::anyhow!("model error"));
        assert!(!failed.is_budget_exceeded());
        assert_eq!(failed.to_string(), "model error");
    }
}
