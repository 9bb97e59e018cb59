use serde::{Deserialize, Serialize};

use crate::model::{Belief, BeliefModel, Section, Status};

/// Sections indexed by the diff, later ones overriding earlier ones so an
/// active item outranks its own history entry.
const DIFF_ORDER: [Section; 5] = [
    Section::StaleItems,
    Section::ConfirmedFacts,
    Section::Hypotheses,
    Section::OpenLoops,
    Section::CandidateMoves,
];

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DiffEntry {
    pub id: String,
    pub section: Section,
    pub text: String,
}

impl DiffEntry {
    fn from_item(section: Section, item: &Belief) -> Self {
        let text = item.text();
        Self {
            id: item.id.clone(),
            section,
            text: if text.is_empty() {
                item.id.clone()
            } else {
                text.to_string()
            },
        }
    }
}

/// A bounded change summary between two snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ModelDiff {
    pub added: Vec<DiffEntry>,
    pub updated: Vec<DiffEntry>,
    pub retracted: Vec<DiffEntry>,
    pub added_total: usize,
    pub updated_total: usize,
    pub retracted_total: usize,
}

impl ModelDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added_total == 0 && self.updated_total == 0 && self.retracted_total == 0
    }

    /// Renders `+`, `~` and `-` bullet lines, or a single
    /// `(no material changes)` line.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        if self.is_empty() {
            return vec!["(no material changes)".to_string()];
        }

        let added = self.added.iter().map(|entry| format!("+ {}", entry.text));
        let updated = self.updated.iter().map(|entry| format!("~ {}", entry.text));
        let retracted = self.retracted.iter().map(|entry| format!("- {}", entry.text));
        added.chain(updated).chain(retracted).collect()
    }
}

/// Classifies every id as added, updated or retracted between `prev` and
/// `cur`, keeping at most `cap` entries per category.
///
/// An id missing from `cur` entirely counts as retracted.
#[must_use]
pub fn diff_models(prev: &BeliefModel, cur: &BeliefModel, cap: usize) -> ModelDiff {
    let before = index(prev);
    let after = index(cur);
    let mut diff = ModelDiff::default();

    for (id, (section, item)) in &after {
        let entry = || DiffEntry::from_item(*section, item);
        match lookup(&before, id) {
            None => push_capped(&mut diff.added, &mut diff.added_total, entry(), cap),
            Some(prior) if item.status == Status::Retracted && prior.status != Status::Retracted => {
                push_capped(&mut diff.retracted, &mut diff.retracted_total, entry(), cap);
            }
            Some(prior) if materially_changed(prior, item) => {
                push_capped(&mut diff.updated, &mut diff.updated_total, entry(), cap);
            }
            Some(_) => {}
        }
    }

    for (id, (section, item)) in &before {
        if lookup(&after, id).is_none() {
            push_capped(
                &mut diff.retracted,
                &mut diff.retracted_total,
                DiffEntry::from_item(*section, item),
                cap,
            );
        }
    }

    diff
}

type Index<'a> = Vec<(&'a str, (Section, &'a Belief))>;

fn index(model: &BeliefModel) -> Index<'_> {
    let mut out: Index<'_> = Vec::new();
    for section in DIFF_ORDER {
        for item in model.section(section) {
            if item.id.is_empty() {
                continue;
            }
            match out.iter_mut().find(|(id, _)| *id == item.id) {
                Some(slot) => slot.1 = (section, item),
                None => out.push((item.id.as_str(), (section, item))),
            }
        }
    }
    out
}

fn lookup<'a>(index: &Index<'a>, id: &str) -> Option<&'a Belief> {
    index
        .iter()
        .find(|(candidate, _)| *candidate == id)
        .map(|(_, (_, item))| *item)
}

fn materially_changed(prior: &Belief, item: &Belief) -> bool {
    prior.text() != item.text()
        || prior.value != item.value
        || (prior.confidence - item.confidence).abs() > f64::EPSILON
        || prior.status != item.status
        || prior.expires_at != item.expires_at
}

fn push_capped(entries: &mut Vec<DiffEntry>, total: &mut usize, entry: DiffEntry, cap: usize) {
    *total += 1;
    if entries.len() < cap {
        entries.push(entry);
    }
}
