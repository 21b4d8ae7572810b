//! Patch evaluation outcomes and the policy used to pick the best one.
//!
//! A candidate diff is classified into exactly one [`Outcome`]. Within a task
//! several attempts may produce several outcomes; [`SeverityOrder`] is the
//! fixed total order used to choose among them. `InternalTestsFailure` and
//! `UnknownError` never enter that order: they describe infrastructure
//! trouble rather than patch quality and are reported separately.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Raw bytes of a candidate diff. Serialized as (lossy) UTF-8 text.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Diff(Vec<u8>);

impl Diff {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl fmt::Debug for Diff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Diff({} bytes)", self.0.len())
    }
}

impl From<&str> for Diff {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl Serialize for Diff {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_text())
    }
}

impl<'de> Deserialize<'de> for Diff {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(Self(text.into_bytes()))
    }
}

/// The variant tag of an [`Outcome`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    NoPatch,
    Uncompilable,
    Compilable,
    Vulnerable,
    Wrong,
    InternalTestsFailure,
    Sound,
    UnknownError,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::NoPatch => "no_patch",
            OutcomeKind::Uncompilable => "uncompilable",
            OutcomeKind::Compilable => "compilable",
            OutcomeKind::Vulnerable => "vulnerable",
            OutcomeKind::Wrong => "wrong",
            OutcomeKind::InternalTestsFailure => "internal_tests_failure",
            OutcomeKind::Sound => "sound",
            OutcomeKind::UnknownError => "unknown_error",
        }
    }

    pub fn all() -> [OutcomeKind; 8] {
        [
            OutcomeKind::Sound,
            OutcomeKind::Compilable,
            OutcomeKind::Uncompilable,
            OutcomeKind::Vulnerable,
            OutcomeKind::Wrong,
            OutcomeKind::NoPatch,
            OutcomeKind::InternalTestsFailure,
            OutcomeKind::UnknownError,
        ]
    }

    /// Failures of the evaluation infrastructure rather than of the patch.
    pub fn is_comparable(&self) -> bool {
        !matches!(
            self,
            OutcomeKind::InternalTestsFailure | OutcomeKind::UnknownError
        )
    }

    /// Patch was evaluated and rejected; its diff feeds the next prompt.
    pub fn is_retryable_failure(&self) -> bool {
        matches!(
            self,
            OutcomeKind::Vulnerable
                | OutcomeKind::Compilable
                | OutcomeKind::Uncompilable
                | OutcomeKind::Wrong
        )
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutcomeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OutcomeKind::all()
            .into_iter()
            .find(|kind| kind.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| format!("Unknown outcome variant '{}'", s))
    }
}

/// Result of evaluating one candidate diff. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum Outcome {
    /// The generator produced nothing.
    NoPatch,
    /// The patch fails to apply or build.
    Uncompilable { diff: Diff },
    /// Builds, but removal of the vulnerability is unproven.
    Compilable { diff: Diff },
    /// Builds, but the PoV still reproduces.
    Vulnerable { diff: Diff },
    /// Vulnerability gone, but regression tests fail.
    Wrong { diff: Diff },
    /// The test harness itself failed.
    InternalTestsFailure { diff: Diff },
    /// Builds, vulnerability removed, regression tests pass.
    Sound { diff: Diff },
    /// Uncaught failure during evaluation.
    UnknownError { error: String },
}

impl Outcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::NoPatch => OutcomeKind::NoPatch,
            Outcome::Uncompilable { .. } => OutcomeKind::Uncompilable,
            Outcome::Compilable { .. } => OutcomeKind::Compilable,
            Outcome::Vulnerable { .. } => OutcomeKind::Vulnerable,
            Outcome::Wrong { .. } => OutcomeKind::Wrong,
            Outcome::InternalTestsFailure { .. } => OutcomeKind::InternalTestsFailure,
            Outcome::Sound { .. } => OutcomeKind::Sound,
            Outcome::UnknownError { .. } => OutcomeKind::UnknownError,
        }
    }

    /// Build a diff-carrying outcome of the given kind.
    ///
    /// `NoPatch` ignores the diff; `UnknownError` records a generic message.
    pub fn with_diff(kind: OutcomeKind, diff: Diff) -> Self {
        match kind {
            OutcomeKind::NoPatch => Outcome::NoPatch,
            OutcomeKind::Uncompilable => Outcome::Uncompilable { diff },
            OutcomeKind::Compilable => Outcome::Compilable { diff },
            OutcomeKind::Vulnerable => Outcome::Vulnerable { diff },
            OutcomeKind::Wrong => Outcome::Wrong { diff },
            OutcomeKind::InternalTestsFailure => Outcome::InternalTestsFailure { diff },
            OutcomeKind::Sound => Outcome::Sound { diff },
            OutcomeKind::UnknownError => Outcome::UnknownError {
                error: "evaluation failed".to_string(),
            },
        }
    }

    pub fn diff(&self) -> Option<&Diff> {
        match self {
            Outcome::Uncompilable { diff }
            | Outcome::Compilable { diff }
            | Outcome::Vulnerable { diff }
            | Outcome::Wrong { diff }
            | Outcome::InternalTestsFailure { diff }
            | Outcome::Sound { diff } => Some(diff),
            Outcome::NoPatch | Outcome::UnknownError { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Outcome::UnknownError { error } => Some(error),
            _ => None,
        }
    }

    pub fn is_sound(&self) -> bool {
        matches!(self, Outcome::Sound { .. })
    }

    /// Whether the repair loop should stop after this outcome.
    pub fn is_terminal(&self, attempts_exhausted: bool) -> bool {
        self.is_sound() || attempts_exhausted
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OutcomeError {
    #[error("cannot select the best outcome of an empty sequence")]
    Empty,
    #[error("invalid severity order: {0}")]
    InvalidOrder(String),
}

/// Best-to-worst ranking of the comparable outcome variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<OutcomeKind>", into = "Vec<OutcomeKind>")]
pub struct SeverityOrder {
    ranking: Vec<OutcomeKind>,
}

impl Default for SeverityOrder {
    fn default() -> Self {
        Self {
            ranking: vec![
                OutcomeKind::Sound,
                OutcomeKind::Compilable,
                OutcomeKind::Uncompilable,
                OutcomeKind::Vulnerable,
                OutcomeKind::Wrong,
                OutcomeKind::NoPatch,
            ],
        }
    }
}

impl TryFrom<Vec<OutcomeKind>> for SeverityOrder {
    type Error = OutcomeError;

    fn try_from(ranking: Vec<OutcomeKind>) -> Result<Self, Self::Error> {
        Self::new(ranking)
    }
}

impl From<SeverityOrder> for Vec<OutcomeKind> {
    fn from(order: SeverityOrder) -> Self {
        order.ranking
    }
}

impl SeverityOrder {
    /// Validate a custom ranking: every comparable variant exactly once.
    pub fn new(ranking: Vec<OutcomeKind>) -> Result<Self, OutcomeError> {
        for kind in &ranking {
            if !kind.is_comparable() {
                return Err(OutcomeError::InvalidOrder(format!(
                    "'{}' is not a comparable outcome",
                    kind
                )));
            }
        }
        for kind in OutcomeKind::all().into_iter().filter(|k| k.is_comparable()) {
            let count = ranking.iter().filter(|k| **k == kind).count();
            if count != 1 {
                return Err(OutcomeError::InvalidOrder(format!(
                    "'{}' must appear exactly once (found {})",
                    kind, count
                )));
            }
        }
        Ok(Self { ranking })
    }

    pub fn ranking(&self) -> &[OutcomeKind] {
        &self.ranking
    }

    /// Position from the bottom; higher is better. `None` for failures.
    pub fn score(&self, kind: OutcomeKind) -> Option<usize> {
        self.ranking
            .iter()
            .position(|k| *k == kind)
            .map(|pos| self.ranking.len() - pos)
    }

    /// Compare two outcome kinds; non-comparable kinds sort below all others.
    pub fn compare(&self, a: OutcomeKind, b: OutcomeKind) -> Ordering {
        match (self.score(a), self.score(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        }
    }

    pub fn is_worse(&self, candidate: OutcomeKind, baseline: OutcomeKind) -> bool {
        self.compare(candidate, baseline) == Ordering::Less
    }

    /// Pick the best outcome of one task.
    ///
    /// Ties keep the earliest outcome. If nothing is comparable, the first
    /// infrastructure failure is returned.
    pub fn select_best<'a, I>(&self, outcomes: I) -> Result<&'a Outcome, OutcomeError>
    where
        I: IntoIterator<Item = &'a Outcome>,
    {
        let mut best: Option<(&Outcome, usize)> = None;
        let mut first_failure: Option<&Outcome> = None;
        for outcome in outcomes {
            match self.score(outcome.kind()) {
                Some(score) => {
                    if best.map(|(_, s)| score > s).unwrap_or(true) {
                        best = Some((outcome, score));
                    }
                }
                None => {
                    first_failure.get_or_insert(outcome);
                }
            }
        }
        best.map(|(outcome, _)| outcome)
            .or(first_failure)
            .ok_or(OutcomeError::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diff(text: &str) -> Diff {
        Diff::from(text)
    }

    #[test]
    fn default_order_matches_policy() {
        let order = SeverityOrder::default();
        let expected = [
            OutcomeKind::Sound,
            OutcomeKind::Compilable,
            OutcomeKind::Uncompilable,
            OutcomeKind::Vulnerable,
            OutcomeKind::Wrong,
            OutcomeKind::NoPatch,
        ];
        for pair in expected.windows(2) {
            assert_eq!(order.compare(pair[0], pair[1]), Ordering::Greater);
        }
    }

    #[test]
    fn select_best_returns_maximum() {
        let order = SeverityOrder::default();
        let outcomes = vec![
            Outcome::Wrong { diff: diff("a") },
            Outcome::Compilable { diff: diff("b") },
            Outcome::Vulnerable { diff: diff("c") },
            Outcome::NoPatch,
        ];
        let best = order.select_best(&outcomes).unwrap();
        assert_eq!(best, &Outcome::Compilable { diff: diff("b") });
    }

    #[test]
    fn select_best_is_idempotent_on_singleton() {
        let order = SeverityOrder::default();
        for kind in OutcomeKind::all() {
            let single = vec![Outcome::with_diff(kind, diff("x"))];
            let best = order.select_best(&single).unwrap().clone();
            assert_eq!(best, single[0]);
            let again = vec![best.clone()];
            assert_eq!(order.select_best(&again).unwrap(), &best);
        }
    }

    #[test]
    fn select_best_prefers_earliest_on_ties() {
        let order = SeverityOrder::default();
        let outcomes = vec![
            Outcome::Wrong { diff: diff("first") },
            Outcome::Wrong { diff: diff("second") },
        ];
        assert_eq!(
            order.select_best(&outcomes).unwrap().diff(),
            Some(&diff("first"))
        );
    }

    #[test]
    fn select_best_rejects_empty() {
        let order = SeverityOrder::default();
        let outcomes: Vec<Outcome> = Vec::new();
        assert_eq!(order.select_best(&outcomes), Err(OutcomeError::Empty));
    }

    #[test]
    fn failures_do_not_outrank_patch_outcomes() {
        let order = SeverityOrder::default();
        let outcomes = vec![
            Outcome::UnknownError {
                error: "boom".to_string(),
            },
            Outcome::NoPatch,
            Outcome::InternalTestsFailure { diff: diff("t") },
        ];
        assert_eq!(order.select_best(&outcomes).unwrap(), &Outcome::NoPatch);

        let only_failures = vec![
            Outcome::InternalTestsFailure { diff: diff("t") },
            Outcome::UnknownError {
                error: "boom".to_string(),
            },
        ];
        assert_eq!(
            order.select_best(&only_failures).unwrap().kind(),
            OutcomeKind::InternalTestsFailure
        );
    }

    #[test]
    fn is_terminal_only_for_sound_or_exhausted() {
        assert!(Outcome::Sound { diff: diff("a") }.is_terminal(false));
        assert!(!Outcome::Wrong { diff: diff("a") }.is_terminal(false));
        assert!(Outcome::Wrong { diff: diff("a") }.is_terminal(true));
        assert!(!Outcome::NoPatch.is_terminal(false));
    }

    #[test]
    fn custom_order_must_cover_every_ranked_variant() {
        let missing = SeverityOrder::new(vec![OutcomeKind::Sound, OutcomeKind::Wrong]);
        assert!(matches!(missing, Err(OutcomeError::InvalidOrder(_))));

        let with_failure = SeverityOrder::new(vec![
            OutcomeKind::Sound,
            OutcomeKind::Vulnerable,
            OutcomeKind::Compilable,
            OutcomeKind::Uncompilable,
            OutcomeKind::Wrong,
            OutcomeKind::NoPatch,
            OutcomeKind::UnknownError,
        ]);
        assert!(matches!(with_failure, Err(OutcomeError::InvalidOrder(_))));

        let reordered = SeverityOrder::new(vec![
            OutcomeKind::Sound,
            OutcomeKind::Vulnerable,
            OutcomeKind::Compilable,
            OutcomeKind::Uncompilable,
            OutcomeKind::Wrong,
            OutcomeKind::NoPatch,
        ])
        .unwrap();
        assert!(reordered.is_worse(OutcomeKind::Compilable, OutcomeKind::Vulnerable));
    }

    #[test]
    fn outcome_serializes_with_variant_tag() {
        let outcome = Outcome::Vulnerable {
            diff: diff("--- a\n+++ b\n"),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["variant"], "vulnerable");
        assert_eq!(json["diff"], "--- a\n+++ b\n");

        let parsed: Outcome = serde_json::from_str(r#"{"variant":"no_patch"}"#).unwrap();
        assert_eq!(parsed, Outcome::NoPatch);
    }

    #[test]
    fn severity_order_deserializes_from_list() {
        let order: SeverityOrder = serde_json::from_str(
            r#"["sound","compilable","uncompilable","vulnerable","wrong","no_patch"]"#,
        )
        .unwrap();
        assert_eq!(order, SeverityOrder::default());
        assert!(serde_json::from_str::<SeverityOrder>(r#"["sound"]"#).is_err());
    }

    #[test]
    fn outcome_kind_parses_from_str() {
        assert_eq!("sound".parse::<OutcomeKind>(), Ok(OutcomeKind::Sound));
        assert_eq!(
            "INTERNAL_TESTS_FAILURE".parse::<OutcomeKind>(),
            Ok(OutcomeKind::InternalTestsFailure)
        );
        assert!("wrong_format".parse::<OutcomeKind>().is_err());
    }
}
