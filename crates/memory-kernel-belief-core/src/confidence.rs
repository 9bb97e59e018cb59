use time::OffsetDateTime;

use crate::model::Evidence;
use crate::ruleset::BeliefRuleset;

/// Age in days of the newest parseable evidence timestamp, or `None` when no
/// entry carries one.
#[must_use]
pub fn recency_days(evidence: &[Evidence], now: OffsetDateTime) -> Option<f64> {
    evidence
        .iter()
        .filter_map(|entry| entry.ts.as_ref().and_then(crate::Timestamp::parse))
        .max()
        .map(|newest| crate::days_between(newest, now))
}

/// Scores a non-fact item from its citations and transient flags.
///
/// The result is always inside the ruleset's confidence bounds.
#[must_use]
pub fn score_confidence(
    evidence: &[Evidence],
    user_confirmed: bool,
    conflicts: bool,
    now: OffsetDateTime,
    ruleset: &BeliefRuleset,
) -> f64 {
    let sources = u32::try_from(evidence.len()).unwrap_or(u32::MAX);
    let counted = sources.min(ruleset.max_counted_sources);

    let mut score = ruleset.base_confidence + ruleset.per_source_weight * f64::from(counted);
    if let Some(days) = recency_days(evidence, now) {
        score += ruleset.recency_weight * (-days / ruleset.recency_scale_days).exp();
    }
    if sources >= ruleset.agreement_min_sources {
        score += ruleset.agreement_bonus;
    }
    if user_confirmed {
        score += ruleset.user_confirmed_bonus;
    }
    if conflicts {
        score -= ruleset.conflict_penalty;
    }

    ruleset.clamp_confidence(score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{parse_rfc3339, Timestamp};
    use proptest::prelude::*;
    use serde_json::Map;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn now() -> OffsetDateTime {
        must_ok(parse_rfc3339("2026-02-22T00:00:00Z"))
    }

    fn cite(ts: Option<&str>) -> Evidence {
        Evidence {
            path: "notes.md".to_string(),
            lines: "L1-L1".to_string(),
            quote: "q".to_string(),
            ts: ts.map(Timestamp::from),
            extra: Map::new(),
        }
    }

    fn close(left: f64, right: f64) -> bool {
        (left - right).abs() < 1e-9
    }

    #[test]
    fn single_fresh_source() {
        let score = score_confidence(
            &[cite(Some("2026-02-22T00:00:00Z"))],
            false,
            false,
            now(),
            &BeliefRuleset::v1(),
        );
        assert!(close(score, 0.57), "score {score}");
    }

    #[test]
    fn two_fresh_sources_earn_agreement_bonus() {
        let evidence = [
            cite(Some("2026-02-22T00:00:00Z")),
            cite(Some("2026-02-21T00:00:00Z")),
        ];
        let score = score_confidence(&evidence, false, false, now(), &BeliefRuleset::v1());
        assert!(close(score, 0.84), "score {score}");
    }

    #[test]
    fn week_old_source_decays_recency() {
        let score = score_confidence(
            &[cite(Some("2026-02-15T00:00:00Z"))],
            false,
            false,
            now(),
            &BeliefRuleset::v1(),
        );
        let expected = 0.32 + 0.25 * (-1.0_f64).exp();
        assert!(close(score, expected), "score {score}");
    }

    #[test]
    fn unparseable_timestamps_contribute_no_recency() {
        let score = score_confidence(
            &[cite(Some("yesterday")), cite(None)],
            false,
            false,
            now(),
            &BeliefRuleset::v1(),
        );
        assert!(close(score, 0.59), "score {score}");
        assert_eq!(recency_days(&[cite(Some("yesterday"))], now()), None);
    }

    #[test]
    fn conflicts_without_evidence_clamp_to_floor() {
        let score = score_confidence(&[], false, true, now(), &BeliefRuleset::v1());
        assert!(close(score, 0.05), "score {score}");
    }

    #[test]
    fn user_confirmation_clamps_to_ceiling() {
        let evidence = [
            cite(Some("2026-02-22T00:00:00Z")),
            cite(Some("2026-02-22T00:00:00Z")),
            cite(Some("2026-02-22T00:00:00Z")),
        ];
        let score = score_confidence(&evidence, true, false, now(), &BeliefRuleset::v1());
        assert!(close(score, 0.99), "score {score}");
    }

    proptest! {
        #[test]
        fn score_stays_within_bounds(
            sources in 0usize..12,
            age_days in 0i64..400,
            user_confirmed in any::<bool>(),
            conflicts in any::<bool>(),
        ) {
            let ts = must_ok(crate::format_rfc3339(now() - time::Duration::days(age_days)));
            let evidence: Vec<Evidence> = (0..sources).map(|_| cite(Some(ts.as_str()))).collect();
            let score = score_confidence(&evidence, user_confirmed, conflicts, now(), &BeliefRuleset::v1());
            prop_assert!((0.05..=0.99).contains(&score));
        }
    }
}
