//! Generation cost accounting.
//!
//! [`BudgetGovernor`] owns the cumulative [`Usage`] of one task.
//! [`BudgetedGenerator`] wraps any [`Generator`] so that every call is checked
//! against the governor before it starts and recorded after it returns.

use crate::generator::{Generation, GenerationRequest, Generator, GeneratorError};
use crate::usage::{usd_to_micros, Usage};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Ledger {
    total: Usage,
    last: Option<Usage>,
}

/// Tracks cumulative generation cost against a ceiling.
#[derive(Debug)]
pub struct BudgetGovernor {
    ceiling_micros: u64,
    blocking: bool,
    ledger: Mutex<Ledger>,
}

impl BudgetGovernor {
    /// `ceiling_usd` is the cost at which the budget counts as exhausted.
    /// In blocking mode, calls made after that point fail before they start.
    pub fn new(ceiling_usd: f64, blocking: bool) -> Self {
        Self {
            ceiling_micros: usd_to_micros(ceiling_usd),
            blocking,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        // A poisoned ledger still holds valid totals.
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn ceiling_usd(&self) -> f64 {
        self.ceiling_micros as f64 / 1_000_000.0
    }

    pub fn is_exhausted(&self) -> bool {
        self.ledger().total.cost_micros >= self.ceiling_micros
    }

    /// Add `delta` to the running total. Missing usage counts as zero.
    pub fn record_usage(&self, delta: Option<Usage>) {
        let delta = delta.unwrap_or_default();
        let mut ledger = self.ledger();
        ledger.total += delta;
        ledger.last = Some(delta);
    }

    pub fn total(&self) -> Usage {
        self.ledger().total
    }

    /// Usage of the most recent recorded call.
    pub fn last_delta(&self) -> Option<Usage> {
        self.ledger().last
    }

    /// Fail fast when blocking and the ceiling has been reached.
    pub fn preflight(&self) -> Result<(), GeneratorError> {
        if !self.blocking {
            return Ok(());
        }
        let spent = self.ledger().total;
        if spent.cost_micros >= self.ceiling_micros {
            return Err(GeneratorError::BudgetExceeded {
                spent_usd: spent.total_cost(),
                ceiling_usd: self.ceiling_usd(),
            });
        }
        Ok(())
    }
}

/// A [`Generator`] whose calls are metered by a [`BudgetGovernor`].
pub struct BudgetedGenerator<G> {
    inner: G,
    governor: Arc<BudgetGovernor>,
}

impl<G: Generator> BudgetedGenerator<G> {
    pub fn new(inner: G, governor: Arc<BudgetGovernor>) -> Self {
        Self { inner, governor }
    }

    pub fn governor(&self) -> &Arc<BudgetGovernor> {
        &self.governor
    }
}

#[async_trait]
impl<G: Generator> Generator for BudgetedGenerator<G> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn generate(
        &self,
        request: &GenerationRequest<'_>,
    ) -> Result<Generation, GeneratorError> {
        self.governor.preflight()?;
        let generation = self.inner.generate(request).await?;
        self.governor.record_usage(generation.usage);
        if self.governor.is_exhausted() {
            tracing::info!(
                generator = self.inner.name(),
                spent = self.governor.total().total_cost(),
                ceiling = self.governor.ceiling_usd(),
                "generation budget reached"
            );
        }
        Ok(generation)
    }
}
