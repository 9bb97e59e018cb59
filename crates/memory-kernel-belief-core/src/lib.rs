//! Deterministic belief-model merge and decay engine.
//!
//! The core owns every state transition of a scope's belief model:
//! - [`merge::merge_proposal`] folds a validated proposal into the persisted model.
//! - [`decay::apply_decay`] demotes retracted and expired items into `stale_items`.
//! - [`consent::apply_consent`] applies explicit user consent operations.
//! - [`schema::SchemaGate`] guards every document before it is trusted or written.
//!
//! Nothing in this crate touches the write path on disk; callers persist the
//! returned models after they pass the schema gate.

use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::{Iso8601, Rfc3339};
use time::{Date, Duration, OffsetDateTime, PrimitiveDateTime, UtcOffset};

pub mod confidence;
pub mod consent;
pub mod decay;
pub mod diff;
pub mod evidence;
pub mod merge;
pub mod model;
pub mod normalize;
pub mod render;
pub mod ruleset;
pub mod schema;

pub use confidence::{recency_days, score_confidence};
pub use consent::{apply_consent, ConsentOp, ConsentReport, ForgetTarget};
pub use decay::{apply_decay, dedupe_stale, retire_retracted, DecayReport};
pub use diff::{diff_models, DiffEntry, ModelDiff};
pub use evidence::{locate_quote, verify_evidence, LineRange};
pub use merge::{merge_proposal, MergeOptions, MergeReport};
pub use model::{
    Belief, BeliefModel, DoNotStoreRule, Evidence, Proposal, ProposalItems, ProposedItem, Section,
    Status,
};
pub use render::render_summary;
pub use ruleset::BeliefRuleset;
pub use schema::{DocumentKind, SchemaGate};

/// Confidence pinned on confirmed facts unless a proposal overrides it.
pub const FACT_CONFIDENCE: f64 = 0.99;

/// Confidence backfilled on persisted items that predate the field.
pub const DEFAULT_CONFIDENCE: f64 = 0.20;

/// Expiry assigned to promoted facts that have no inherited expiry.
pub const FAR_FUTURE_EXPIRY: &str = "9999-12-31T00:00:00+00:00";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum BeliefError {
    #[error("schema violation in {label} at {path}: {message}")]
    SchemaViolation {
        label: String,
        path: String,
        message: String,
    },
    #[error("evidence violation: {0}")]
    EvidenceViolation(String),
    #[error("identity violation: {0}")]
    IdentityViolation(String),
    #[error("scope mismatch: expected {expected}, got {actual}")]
    ScopeMismatch { expected: String, actual: String },
    #[error("input missing: {0}")]
    InputMissing(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for BeliefError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Source of the evaluation instant for one invocation.
pub trait Clock {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        truncate_to_seconds(OffsetDateTime::now_utc())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FixedClock(pub OffsetDateTime);

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        self.0
    }
}

/// A persisted timestamp, kept verbatim so unknown formats survive a rewrite.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(transparent)]
pub struct Timestamp(String);

impl Timestamp {
    /// Formats an instant as RFC3339 UTC with whole seconds.
    ///
    /// # Errors
    /// Returns [`BeliefError::Serialization`] when the instant cannot be
    /// represented as RFC3339.
    pub fn from_datetime(value: OffsetDateTime) -> Result<Self, BeliefError> {
        format_rfc3339(value).map(Self)
    }

    #[must_use]
    pub fn far_future() -> Self {
        Self(FAR_FUTURE_EXPIRY.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    #[must_use]
    pub fn parse(&self) -> Option<OffsetDateTime> {
        parse_timestamp(&self.0)
    }

    /// Chronological ordering where parseable instants sort after
    /// unparseable ones and unparseable pairs fall back to string order.
    #[must_use]
    pub fn cmp_chronological(&self, other: &Self) -> Ordering {
        match (self.parse(), other.parse()) {
            (Some(left), Some(right)) => left.cmp(&right),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Timestamp {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Timestamp {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Best-effort timestamp parsing: RFC3339, ISO 8601 with offset, then naive
/// ISO 8601 date-time or date assumed to be UTC.
#[must_use]
pub fn parse_timestamp(value: &str) -> Option<OffsetDateTime> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(parsed) = OffsetDateTime::parse(trimmed, &Rfc3339) {
        return Some(parsed);
    }
    if let Ok(parsed) = OffsetDateTime::parse(trimmed, &Iso8601::DEFAULT) {
        return Some(parsed);
    }
    if let Ok(parsed) = PrimitiveDateTime::parse(trimmed, &Iso8601::DEFAULT) {
        return Some(parsed.assume_utc());
    }

    Date::parse(trimmed, &Iso8601::DEFAULT)
        .ok()
        .map(|date| date.midnight().assume_utc())
}

/// Parses an RFC3339 timestamp supplied by an operator (for example a pinned
/// clock value).
///
/// # Errors
/// Returns [`BeliefError::Configuration`] when parsing fails.
pub fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, BeliefError> {
    OffsetDateTime::parse(value.trim(), &Rfc3339)
        .map(truncate_to_seconds)
        .map_err(|err| BeliefError::Configuration(format!("invalid RFC3339 timestamp {value}: {err}")))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`BeliefError::Serialization`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, BeliefError> {
    truncate_to_seconds(value)
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|err| {
            BeliefError::Serialization(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn truncate_to_seconds(value: OffsetDateTime) -> OffsetDateTime {
    value - Duration::nanoseconds(i64::from(value.nanosecond()))
}

#[must_use]
pub fn days_between(earlier: OffsetDateTime, later: OffsetDateTime) -> f64 {
    if later <= earlier {
        return 0.0;
    }

    (later - earlier).as_seconds_f64() / Duration::DAY.as_seconds_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn formats_whole_seconds_in_utc() {
        let instant = must_ok(OffsetDateTime::parse(
            "2026-02-22T01:30:00.750+01:00",
            &Rfc3339,
        ));
        assert_eq!(must_ok(format_rfc3339(instant)), "2026-02-22T00:30:00Z");
    }

    #[test]
    fn parses_offset_naive_and_date_only_values() {
        assert!(parse_timestamp("2026-02-22T00:00:00+01:00").is_some());
        assert!(parse_timestamp("2026-02-22T00:00:00").is_some());
        assert!(parse_timestamp("2026-02-22").is_some());
        assert!(parse_timestamp("now").is_none());
        assert!(parse_timestamp("").is_none());
    }

    #[test]
    fn chronological_order_ignores_offset_spelling() {
        let utc = Timestamp::from("2026-02-22T00:30:00Z");
        let plus_one = Timestamp::from("2026-02-22T01:00:00+01:00");
        // Lexically "2026-02-22T01" > "2026-02-22T00", chronologically earlier.
        assert_eq!(plus_one.cmp_chronological(&utc), Ordering::Less);
        assert_eq!(Timestamp::from("t").cmp_chronological(&utc), Ordering::Less);
    }

    #[test]
    fn far_future_expiry_is_parseable() {
        assert!(Timestamp::far_future().parse().is_some());
    }

    #[test]
    fn days_between_is_zero_for_future_instants() {
        let earlier = must_ok(parse_rfc3339("2026-02-01T00:00:00Z"));
        let later = must_ok(parse_rfc3339("2026-02-08T00:00:00Z"));
        assert!((days_between(earlier, later) - 7.0).abs() < 1e-9);
        assert!(days_between(later, earlier).abs() < f64::EPSILON);
    }
}
