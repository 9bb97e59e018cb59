//! Per-item timestamp, TTL, status and confidence resolution.

use serde_json::{Map, Value};
use time::{Duration, OffsetDateTime};

use crate::confidence::score_confidence;
use crate::model::{Belief, ProposedItem, Section, Status, RESERVED_ITEM_KEYS};
use crate::ruleset::BeliefRuleset;
use crate::{BeliefError, Timestamp};

const SECONDS_PER_DAY: i64 = 86_400;

/// Resolves a proposed item that was explicitly refreshed by a proposal.
///
/// `prior_first_seen` is the persisted item's `first_seen`, which always
/// outranks whatever the proposal claims.
///
/// # Errors
/// Returns [`BeliefError::Configuration`] when the resolved expiry is not
/// representable, and [`BeliefError::Serialization`] when a timestamp cannot
/// be formatted.
pub fn normalize_refreshed(
    section: Section,
    proposed: ProposedItem,
    prior_first_seen: Option<&Timestamp>,
    now: OffsetDateTime,
    ruleset: &BeliefRuleset,
) -> Result<Belief, BeliefError> {
    let now_ts = Timestamp::from_datetime(now)?;
    let ttl_days = ruleset.resolve_ttl_days(section, proposed.ttl_days);
    let expires = ttl_days
        .checked_mul(SECONDS_PER_DAY)
        .map(Duration::seconds)
        .and_then(|ttl| now.checked_add(ttl))
        .ok_or_else(|| {
            BeliefError::Configuration(format!(
                "ttl_days {ttl_days} for {} {} overflows the calendar",
                section.as_str(),
                proposed.id
            ))
        })?;

    let first_seen = prior_first_seen
        .filter(|value| !value.is_empty())
        .cloned()
        .or_else(|| proposed.first_seen.clone().filter(|value| !value.is_empty()))
        .unwrap_or_else(|| now_ts.clone());

    let (confidence, last_confirmed) = if section.is_fact() {
        let confidence = proposed
            .confidence
            .map_or(ruleset.fact_confidence, |value| ruleset.clamp_confidence(value));
        let last_confirmed = proposed
            .last_confirmed
            .clone()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| now_ts.clone());
        (confidence, Some(last_confirmed))
    } else {
        let confidence = score_confidence(
            &proposed.evidence,
            proposed.user_confirmed,
            proposed.conflicts,
            now,
            ruleset,
        );
        (confidence, None)
    };

    Ok(Belief {
        id: proposed.id,
        statement: proposed.statement,
        fact: proposed.fact,
        value: proposed.value,
        domain: proposed.domain,
        why: proposed.why,
        confirm: proposed.confirm,
        confidence,
        first_seen,
        last_seen: now_ts,
        last_confirmed,
        expires_at: Timestamp::from_datetime(expires)?,
        status: proposed.status.unwrap_or_default(),
        evidence: proposed.evidence,
        extra: strip_reserved(proposed.extra),
    })
}

/// Resolves a persisted item the proposal did not mention.
///
/// Timestamps, status and confidence are kept as persisted; only fields a
/// persisted item must carry are backfilled, so the TTL is never extended.
#[must_use]
pub fn normalize_carried(section: Section, mut item: Belief, now: &Timestamp) -> Belief {
    if item.first_seen.is_empty() {
        item.first_seen = now.clone();
    }
    if item.last_seen.is_empty() {
        item.last_seen = now.clone();
    }
    if item.expires_at.is_empty() {
        item.expires_at = if section.is_fact() {
            Timestamp::far_future()
        } else {
            now.clone()
        };
    }
    if section.is_fact() && item.last_confirmed.as_ref().map_or(true, Timestamp::is_empty) {
        item.last_confirmed = Some(item.last_seen.clone());
    }
    item.extra = strip_reserved(item.extra);
    item
}

/// Demotes an item into the stale audit trail.
#[must_use]
pub fn into_stale(mut item: Belief, status: Status, confidence_cap: Option<f64>) -> Belief {
    item.status = status;
    if let Some(cap) = confidence_cap {
        item.confidence = item.confidence.min(cap);
    }
    item
}

fn strip_reserved(mut extra: Map<String, Value>) -> Map<String, Value> {
    for key in RESERVED_ITEM_KEYS {
        extra.remove(key);
    }
    extra
}
