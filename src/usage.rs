use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

const MICROS_PER_USD: f64 = 1_000_000.0;

/// Accumulated generation cost.
///
/// Cost is held in integer micro-dollars so that merging is exactly
/// associative and commutative; [`Usage::total_cost`] converts back to USD.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub cost_micros: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64, cost_usd: f64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            cost_micros: usd_to_micros(cost_usd),
        }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn total_cost(&self) -> f64 {
        self.cost_micros as f64 / MICROS_PER_USD
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }

    pub fn merge(self, other: Usage) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens.saturating_add(other.prompt_tokens),
            completion_tokens: self.completion_tokens.saturating_add(other.completion_tokens),
            cost_micros: self.cost_micros.saturating_add(other.cost_micros),
        }
    }
}

impl Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        self.merge(rhs)
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Usage) {
        *self = self.merge(rhs);
    }
}

impl std::iter::Sum for Usage {
    fn sum<I: Iterator<Item = Usage>>(iter: I) -> Self {
        iter.fold(Usage::zero(), Usage::merge)
    }
}

/// Convert a USD amount to micro-dollars; negative or non-finite values are 0.
pub fn usd_to_micros(cost_usd: f64) -> u64 {
    if !cost_usd.is_finite() || cost_usd <= 0.0 {
        return 0;
    }
    (cost_usd * MICROS_PER_USD).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<Usage> {
        vec![
            Usage::new(100, 20, 0.0031),
            Usage::new(7, 0, 0.1),
            Usage::new(0, 900, 1.2345),
            Usage::zero(),
            Usage::new(u64::MAX / 4, 3, 0.000_001),
        ]
    }

    #[test]
    fn merge_is_associative() {
        let s = samples();
        for a in &s {
            for b in &s {
                for c in &s {
                    assert_eq!((*a + *b) + *c, *a + (*b + *c));
                }
            }
        }
    }

    #[test]
    fn merge_is_commutative() {
        let s = samples();
        for a in &s {
            for b in &s {
                assert_eq!(*a + *b, *b + *a);
            }
        }
    }

    #[test]
    fn zero_is_identity() {
        for a in samples() {
            assert_eq!(a + Usage::zero(), a);
            assert_eq!(Usage::zero() + a, a);
        }
    }

    #[test]
    fn merge_sums_every_field() {
        let merged = Usage::new(10, 5, 0.25) + Usage::new(1, 2, 0.5);
        assert_eq!(merged.prompt_tokens, 11);
        assert_eq!(merged.completion_tokens, 7);
        assert_eq!(merged.total_tokens(), 18);
        assert!((merged.total_cost() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn invalid_costs_clamp_to_zero() {
        assert_eq!(usd_to_micros(-1.0), 0);
        assert_eq!(usd_to_micros(f64::NAN), 0);
        assert_eq!(usd_to_micros(0.0000004), 0);
        assert_eq!(usd_to_micros(2.5), 2_500_000);
    }

    #[test]
    fn sum_over_iterator() {
        let total: Usage = samples().into_iter().take(3).sum();
        assert_eq!(total.prompt_tokens, 107);
    }
}
