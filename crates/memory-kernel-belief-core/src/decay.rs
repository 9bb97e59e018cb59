use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::model::{Belief, BeliefModel, Section, Status};
use crate::normalize::into_stale;
use crate::ruleset::BeliefRuleset;

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct DecayReport {
    pub retracted: Vec<String>,
    pub expired: Vec<String>,
    pub stale_total: usize,
}

/// Moves retracted and expired items into `stale_items`.
///
/// Retracted items leave every active section, confirmed facts included.
/// Expiry only demotes hypotheses, open loops and candidate moves; an item
/// whose `expires_at` does not parse never expires.
pub fn apply_decay(
    model: &mut BeliefModel,
    now: OffsetDateTime,
    ruleset: &BeliefRuleset,
) -> DecayReport {
    let mut report = DecayReport {
        retracted: sweep_retracted(model),
        ..DecayReport::default()
    };

    for section in Section::DECAYING {
        let (expired, kept): (Vec<Belief>, Vec<Belief>) =
            std::mem::take(model.section_mut(section))
                .into_iter()
                .partition(|item| is_expired(item, now));
        *model.section_mut(section) = kept;

        for item in expired {
            report.expired.push(item.id.clone());
            model.stale_items.push(into_stale(
                item,
                Status::Stale,
                Some(ruleset.stale_confidence_cap),
            ));
        }
    }

    dedupe_stale(&mut model.stale_items);
    report.stale_total = model.stale_items.len();
    report
}

/// Moves retracted items out of every active section and dedupes the stale
/// trail. Returns the ids that moved.
pub fn retire_retracted(model: &mut BeliefModel) -> Vec<String> {
    let moved = sweep_retracted(model);
    dedupe_stale(&mut model.stale_items);
    moved
}

/// Keeps one stale entry per id: the one with the later `last_seen`.
///
/// Ties keep the entry appended later, since it records the newer
/// transition. Surviving entries stay at the position of the id's first
/// occurrence.
pub fn dedupe_stale(items: &mut Vec<Belief>) {
    let mut kept: Vec<Belief> = Vec::with_capacity(items.len());
    for item in std::mem::take(items) {
        match kept.iter_mut().find(|existing| existing.id == item.id) {
            Some(existing) => {
                if item.last_seen.cmp_chronological(&existing.last_seen).is_ge() {
                    *existing = item;
                }
            }
            None => kept.push(item),
        }
    }
    *items = kept;
}

fn sweep_retracted(model: &mut BeliefModel) -> Vec<String> {
    let mut moved = Vec::new();
    for section in Section::MUTABLE {
        let (retracted, kept): (Vec<Belief>, Vec<Belief>) =
            std::mem::take(model.section_mut(section))
                .into_iter()
                .partition(Belief::is_retracted);
        *model.section_mut(section) = kept;

        for item in retracted {
            moved.push(item.id.clone());
            model
                .stale_items
                .push(into_stale(item, Status::Retracted, None));
        }
    }
    moved
}

fn is_expired(item: &Belief, now: OffsetDateTime) -> bool {
    item.expires_at.parse().is_some_and(|expires| now > expires)
}
