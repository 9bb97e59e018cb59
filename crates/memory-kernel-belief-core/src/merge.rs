use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::decay::{apply_decay, DecayReport};
use crate::evidence::verify_evidence;
use crate::model::{Belief, BeliefModel, Proposal, ProposedItem, Section, Status};
use crate::normalize::{normalize_carried, normalize_refreshed};
use crate::ruleset::BeliefRuleset;
use crate::{BeliefError, Timestamp};

#[derive(Debug, Clone, Copy)]
pub struct MergeOptions<'a> {
    pub workspace: &'a Path,
    pub verify_sources: bool,
    pub ruleset: &'a BeliefRuleset,
    pub now: OffsetDateTime,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct MergeReport {
    pub refreshed: usize,
    pub carried: usize,
    pub suppressed: usize,
    pub blocked_by_retraction: Vec<String>,
    pub decay: DecayReport,
}

enum Candidate {
    Refreshed {
        item: ProposedItem,
        prior_first_seen: Option<Timestamp>,
    },
    Carried(Belief),
}

impl Candidate {
    fn text(&self) -> &str {
        match self {
            Self::Refreshed { item, .. } => item.text(),
            Self::Carried(item) => item.text(),
        }
    }

    fn id(&self) -> &str {
        match self {
            Self::Refreshed { item, .. } => &item.id,
            Self::Carried(item) => &item.id,
        }
    }

    fn evidence(&self) -> &[crate::model::Evidence] {
        match self {
            Self::Refreshed { item, .. } => &item.evidence,
            Self::Carried(item) => &item.evidence,
        }
    }
}

/// Folds a validated proposal into a persisted model.
///
/// Proposed items are authoritative for the ids they name; persisted items
/// the proposal omits are carried forward without extending their TTL.
/// Text matching a do-not-store rule is dropped before verification, and
/// every surviving citation is verified unless `verify_sources` is off. The
/// decay pass runs last. The input model is never modified.
///
/// # Errors
/// Returns [`BeliefError::ScopeMismatch`] when the scopes differ,
/// [`BeliefError::EvidenceViolation`] for the first citation that fails, and
/// normalization errors for unrepresentable timestamps.
pub fn merge_proposal(
    model: &BeliefModel,
    proposal: &Proposal,
    options: &MergeOptions<'_>,
) -> Result<(BeliefModel, MergeReport), BeliefError> {
    if proposal.scope != model.scope {
        return Err(BeliefError::ScopeMismatch {
            expected: model.scope.clone(),
            actual: proposal.scope.clone(),
        });
    }

    let now_ts = Timestamp::from_datetime(options.now)?;
    let retracted_ids: BTreeSet<&str> = model
        .stale_items
        .iter()
        .filter(|item| item.status == Status::Retracted)
        .map(|item| item.id.as_str())
        .collect();

    let mut merged = model.clone();
    let mut report = MergeReport::default();

    for section in Section::MUTABLE {
        let current = model.section(section);
        let mut candidates = Vec::new();

        let mut proposed_ids = BTreeSet::new();
        for item in dedupe_proposed(proposal.items.section(section)) {
            if item.id.is_empty() {
                continue;
            }
            if retracted_ids.contains(item.id.as_str()) {
                report.blocked_by_retraction.push(item.id.clone());
                continue;
            }
            proposed_ids.insert(item.id.clone());

            let existing = current.iter().find(|prior| prior.id == item.id);
            let mut item = item;
            if item.domain.as_deref().map_or(true, str::is_empty) {
                if let Some(domain) = existing.and_then(|prior| prior.domain.clone()) {
                    item.domain = Some(domain);
                }
            }
            candidates.push(Candidate::Refreshed {
                item,
                prior_first_seen: existing.map(|prior| prior.first_seen.clone()),
            });
        }

        candidates.extend(
            current
                .iter()
                .filter(|item| !item.id.is_empty() && !proposed_ids.contains(&item.id))
                .cloned()
                .map(Candidate::Carried),
        );

        let mut processed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if model.suppressing_rule(candidate.text()).is_some() {
                report.suppressed += 1;
                continue;
            }
            if options.verify_sources {
                verify_evidence(candidate.evidence(), options.workspace).map_err(|err| {
                    match err {
                        BeliefError::EvidenceViolation(message) => BeliefError::EvidenceViolation(
                            format!("{} {}: {message}", section.as_str(), candidate.id()),
                        ),
                        other => other,
                    }
                })?;
            }

            processed.push(match candidate {
                Candidate::Refreshed {
                    item,
                    prior_first_seen,
                } => {
                    report.refreshed += 1;
                    normalize_refreshed(
                        section,
                        item,
                        prior_first_seen.as_ref(),
                        options.now,
                        options.ruleset,
                    )?
                }
                Candidate::Carried(item) => {
                    report.carried += 1;
                    normalize_carried(section, item, &now_ts)
                }
            });
        }

        *merged.section_mut(section) = processed;
    }

    report.decay = apply_decay(&mut merged, options.now, options.ruleset);
    merged.updated_at = now_ts;
    Ok((merged, report))
}

/// Collapses repeated ids: a later entry replaces the earlier one in place.
fn dedupe_proposed(items: &[ProposedItem]) -> Vec<ProposedItem> {
    let mut positions: HashMap<&str, usize> = HashMap::new();
    let mut out: Vec<ProposedItem> = Vec::with_capacity(items.len());
    for item in items {
        if let Some(&index) = positions.get(item.id.as_str()) {
            out[index] = item.clone();
        } else {
            positions.insert(item.id.as_str(), out.len());
            out.push(item.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_rfc3339;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_err<T, E>(result: Result<T, E>) -> E {
        match result {
            Ok(_) => panic!("expected Err(..), got Ok"),
            Err(err) => err,
        }
    }

    const NOTES: &str = "# 2026-02-21\nThis contains SECRET content.\nJD prefers concise communication.\nUses UTC everywhere.\n";

    fn workspace() -> TempDir {
        let dir = must_ok(TempDir::new());
        must_ok(std::fs::create_dir_all(dir.path().join("memory")));
        must_ok(std::fs::write(dir.path().join("memory/2026-02-21.md"), NOTES));
        dir
    }

    fn now() -> OffsetDateTime {
        must_ok(parse_rfc3339("2026-02-22T00:00:00Z"))
    }

    fn cite(lines: &str, quote: &str) -> Value {
        json!({"path": "memory/2026-02-21.md", "lines": lines, "quote": quote, "ts": "2026-02-21T00:00:00Z"})
    }

    fn proposal(items: Value) -> Proposal {
        must_ok(serde_json::from_value(json!({
            "scope": "user-profile/preferences",
            "generatedAt": "2026-02-22T00:00:00Z",
            "items": items
        })))
    }

    fn model(raw: Value) -> BeliefModel {
        let mut base = json!({
            "scope": "user-profile/preferences",
            "updatedAt": "2026-02-01T00:00:00Z",
            "meta": {},
            "confirmed_facts": [],
            "hypotheses": [],
            "stale_items": [],
            "open_loops": [],
            "candidate_moves": [],
            "do_not_store": []
        });
        if let (Some(base), Some(extra)) = (base.as_object_mut(), raw.as_object()) {
            for (key, value) in extra {
                base.insert(key.clone(), value.clone());
            }
        }
        must_ok(serde_json::from_value(base))
    }

    fn merge(
        model: &BeliefModel,
        proposal: &Proposal,
        ws: &TempDir,
    ) -> Result<(BeliefModel, MergeReport), BeliefError> {
        let ruleset = BeliefRuleset::v1();
        merge_proposal(
            model,
            proposal,
            &MergeOptions {
                workspace: ws.path(),
                verify_sources: true,
                ruleset: &ruleset,
                now: now(),
            },
        )
    }

    #[test]
    fn do_not_store_suppresses_matching_hypothesis() {
        let ws = workspace();
        let prior = model(json!({
            "do_not_store": [{"pattern": "secret", "created_at": "2026-02-01T00:00:00Z"}]
        }));
        let incoming = proposal(json!({
            "confirmed_facts": [],
            "hypotheses": [{
                "id": "h-secret",
                "statement": "This contains SECRET content.",
                "evidence": [cite("L2-L2", "SECRET content")]
            }],
            "open_loops": [],
            "candidate_moves": []
        }));

        let (merged, report) = must_ok(merge(&prior, &incoming, &ws));

        assert!(merged.hypotheses.is_empty());
        assert!(merged.stale_items.is_empty());
        assert_eq!(report.suppressed, 1);
        let written = must_ok(serde_json::to_string(&merged));
        assert!(!written.to_lowercase().contains("secret content"));
    }

    #[test]
    fn omitted_expired_hypothesis_moves_to_stale() {
        let ws = workspace();
        let prior = model(json!({
            "hypotheses": [{
                "id": "h-exp",
                "statement": "JD prefers concise communication.",
                "confidence": 0.7,
                "first_seen": "2026-01-01T00:00:00Z",
                "last_seen": "2026-01-01T00:00:00Z",
                "expires_at": "2026-01-22T00:00:00Z",
                "status": "active",
                "evidence": [cite("L3-L3", "prefers concise")]
            }]
        }));
        let incoming = proposal(json!({
            "confirmed_facts": [], "hypotheses": [], "open_loops": [], "candidate_moves": []
        }));

        let (merged, report) = must_ok(merge(&prior, &incoming, &ws));

        assert!(merged.hypotheses.is_empty());
        assert_eq!(merged.stale_items.len(), 1);
        assert_eq!(merged.stale_items[0].id, "h-exp");
        assert_eq!(merged.stale_items[0].status, Status::Stale);
        assert!(merged.stale_items[0].confidence <= 0.35);
        assert_eq!(report.decay.expired, vec!["h-exp".to_string()]);
        assert_eq!(prior.hypotheses.len(), 1);
    }

    #[test]
    fn merging_the_same_proposal_twice_keeps_every_item() {
        let ws = workspace();
        let incoming = proposal(json!({
            "confirmed_facts": [{
                "id": "f-utc",
                "fact": "Timezone",
                "value": "UTC",
                "evidence": [cite("L4-L4", "UTC everywhere")]
            }],
            "hypotheses": [{
                "id": "h1",
                "statement": "JD prefers concise communication.",
                "domain": "communication",
                "evidence": [cite("L3-L3", "prefers concise")]
            }],
            "open_loops": [{
                "id": "o1",
                "statement": "Follow up on timezone.",
                "evidence": [cite("L4-L4", "UTC")]
            }],
            "candidate_moves": []
        }));

        let (first, _) = must_ok(merge(&model(json!({})), &incoming, &ws));
        let (second, report) = must_ok(merge(&first, &incoming, &ws));

        for section in Section::MUTABLE {
            assert_eq!(
                first.section(section).len(),
                second.section(section).len(),
                "{} changed size",
                section.as_str()
            );
            let ids: BTreeSet<&str> = second.section(section).iter().map(|item| item.id.as_str()).collect();
            assert_eq!(ids.len(), second.section(section).len());
        }
        assert_eq!(report.refreshed, 3);
        assert_eq!(second.hypotheses[0].first_seen, first.hypotheses[0].first_seen);
    }

    #[test]
    fn refresh_backfills_domain_and_keeps_first_seen() {
        let ws = workspace();
        let prior = model(json!({
            "hypotheses": [{
                "id": "h1",
                "statement": "JD prefers concise communication.",
                "domain": "communication",
                "confidence": 0.5,
                "first_seen": "2026-01-05T00:00:00Z",
                "last_seen": "2026-01-05T00:00:00Z",
                "expires_at": "2026-03-05T00:00:00Z",
                "status": "active",
                "evidence": [cite("L3-L3", "prefers concise")]
            }]
        }));
        let incoming = proposal(json!({
            "confirmed_facts": [],
            "hypotheses": [{
                "id": "h1",
                "statement": "JD prefers concise communication.",
                "ttl_days": 10,
                "evidence": [cite("L3-L3", "prefers concise")]
            }],
            "open_loops": [],
            "candidate_moves": []
        }));

        let (merged, _) = must_ok(merge(&prior, &incoming, &ws));
        let refreshed = &merged.hypotheses[0];
        assert_eq!(refreshed.domain.as_deref(), Some("communication"));
        assert_eq!(refreshed.first_seen.as_str(), "2026-01-05T00:00:00Z");
        assert_eq!(refreshed.last_seen.as_str(), "2026-02-22T00:00:00Z");
        assert_eq!(refreshed.expires_at.as_str(), "2026-03-04T00:00:00Z");
    }

    #[test]
    fn carried_item_is_not_extended() {
        let ws = workspace();
        let prior = model(json!({
            "open_loops": [{
                "id": "o1",
                "statement": "Follow up on timezone.",
                "confidence": 0.5,
                "first_seen": "2026-02-10T00:00:00Z",
                "last_seen": "2026-02-10T00:00:00Z",
                "expires_at": "2026-02-24T00:00:00Z",
                "status": "active",
                "evidence": [cite("L4-L4", "UTC")]
            }]
        }));
        let incoming = proposal(json!({
            "confirmed_facts": [], "hypotheses": [], "open_loops": [], "candidate_moves": []
        }));

        let (merged, report) = must_ok(merge(&prior, &incoming, &ws));
        assert_eq!(merged.open_loops, prior.open_loops);
        assert_eq!(report.carried, 1);
    }

    #[test]
    fn bad_citation_fails_the_whole_merge() {
        let ws = workspace();
        let incoming = proposal(json!({
            "confirmed_facts": [],
            "hypotheses": [{
                "id": "h1",
                "statement": "JD prefers concise communication.",
                "evidence": [cite("L1-L1", "prefers concise")]
            }],
            "open_loops": [],
            "candidate_moves": []
        }));

        let err = must_err(merge(&model(json!({})), &incoming, &ws));
        match err {
            BeliefError::EvidenceViolation(message) => assert!(message.contains("hypotheses h1")),
            other => panic!("expected evidence violation, got {other}"),
        }
    }

    #[test]
    fn scope_mismatch_is_rejected() {
        let ws = workspace();
        let mut incoming = proposal(json!({
            "confirmed_facts": [], "hypotheses": [], "open_loops": [], "candidate_moves": []
        }));
        incoming.scope = "repos".to_string();

        let err = must_err(merge(&model(json!({})), &incoming, &ws));
        assert!(matches!(err, BeliefError::ScopeMismatch { .. }));
    }

    #[test]
    fn retracted_ids_are_not_resurrected() {
        let ws = workspace();
        let prior = model(json!({
            "stale_items": [{
                "id": "h1",
                "statement": "JD prefers concise communication.",
                "confidence": 0.5,
                "last_seen": "2026-02-01T00:00:00Z",
                "expires_at": "2026-02-20T00:00:00Z",
                "status": "retracted",
                "evidence": []
            }]
        }));
        let incoming = proposal(json!({
            "confirmed_facts": [],
            "hypotheses": [{
                "id": "h1",
                "statement": "JD prefers concise communication.",
                "evidence": [cite("L3-L3", "prefers concise")]
            }],
            "open_loops": [],
            "candidate_moves": []
        }));

        let (merged, report) = must_ok(merge(&prior, &incoming, &ws));
        assert!(merged.hypotheses.is_empty());
        assert_eq!(report.blocked_by_retraction, vec!["h1".to_string()]);
    }

    #[test]
    fn duplicate_proposed_ids_keep_the_later_entry() {
        let ws = workspace();
        let incoming = proposal(json!({
            "confirmed_facts": [],
            "hypotheses": [
                {"id": "h1", "statement": "first", "evidence": [cite("L3-L3", "concise")]},
                {"id": "h2", "statement": "other", "evidence": [cite("L4-L4", "UTC")]},
                {"id": "h1", "statement": "second", "evidence": [cite("L3-L3", "concise")]}
            ],
            "open_loops": [],
            "candidate_moves": []
        }));

        let (merged, _) = must_ok(merge(&model(json!({})), &incoming, &ws));
        let texts: Vec<&str> = merged.hypotheses.iter().map(Belief::text).collect();
        assert_eq!(texts, vec!["second", "other"]);
    }

    #[test]
    fn proposal_tagged_retracted_goes_straight_to_stale() {
        let ws = workspace();
        let incoming = proposal(json!({
            "confirmed_facts": [],
            "hypotheses": [],
            "open_loops": [],
            "candidate_moves": [{
                "id": "m1",
                "statement": "Switch to UTC.",
                "status": "retracted",
                "evidence": [cite("L4-L4", "UTC")]
            }]
        }));

        let (merged, report) = must_ok(merge(&model(json!({})), &incoming, &ws));
        assert!(merged.candidate_moves.is_empty());
        assert_eq!(merged.stale_items[0].status, Status::Retracted);
        assert_eq!(report.decay.retracted, vec!["m1".to_string()]);
    }
}
