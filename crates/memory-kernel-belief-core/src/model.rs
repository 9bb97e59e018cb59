use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Timestamp;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Active,
    Stale,
    Retracted,
}

impl Status {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Stale => "stale",
            Self::Retracted => "retracted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "stale" => Some(Self::Stale),
            "retracted" => Some(Self::Retracted),
            _ => None,
        }
    }
}

/// Model sections. `(section, id)` is the composite key inside the merge;
/// consent lookups scan sections in [`Section::LOOKUP_ORDER`] and take the
/// first id match.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    ConfirmedFacts,
    Hypotheses,
    OpenLoops,
    CandidateMoves,
    StaleItems,
}

impl Section {
    /// Sections a proposal may write to.
    pub const MUTABLE: [Self; 4] = [
        Self::ConfirmedFacts,
        Self::Hypotheses,
        Self::OpenLoops,
        Self::CandidateMoves,
    ];

    /// Sections subject to expiry-driven demotion.
    pub const DECAYING: [Self; 3] = [Self::Hypotheses, Self::OpenLoops, Self::CandidateMoves];

    /// Consent lookup order. `stale_items` precedes open loops and candidate
    /// moves, so when a re-proposed loop or move still has a history entry
    /// under the same id, an id lookup hits the history entry and leaves the
    /// active copy untouched.
    pub const LOOKUP_ORDER: [Self; 5] = [
        Self::Hypotheses,
        Self::StaleItems,
        Self::OpenLoops,
        Self::CandidateMoves,
        Self::ConfirmedFacts,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfirmedFacts => "confirmed_facts",
            Self::Hypotheses => "hypotheses",
            Self::OpenLoops => "open_loops",
            Self::CandidateMoves => "candidate_moves",
            Self::StaleItems => "stale_items",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "confirmed_facts" => Some(Self::ConfirmedFacts),
            "hypotheses" => Some(Self::Hypotheses),
            "open_loops" => Some(Self::OpenLoops),
            "candidate_moves" => Some(Self::CandidateMoves),
            "stale_items" => Some(Self::StaleItems),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_fact(self) -> bool {
        matches!(self, Self::ConfirmedFacts)
    }
}

/// A citation into a workspace file: `lines` is `L<start>-L<end>`, 1-based and
/// inclusive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Evidence {
    pub path: String,
    pub lines: String,
    pub quote: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<Timestamp>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Keys owned by the typed item fields. They are never carried through the
/// open extension map, so a rewrite cannot emit a key twice.
pub const RESERVED_ITEM_KEYS: [&str; 19] = [
    "id",
    "statement",
    "fact",
    "value",
    "domain",
    "why",
    "confirm",
    "confidence",
    "first_seen",
    "last_seen",
    "last_confirmed",
    "expires_at",
    "status",
    "evidence",
    "ttl_days",
    "user_confirmed",
    "conflicts",
    "_refreshed",
    "_keep_first_seen",
];

fn default_confidence() -> f64 {
    crate::DEFAULT_CONFIDENCE
}

/// A persisted item in any section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Belief {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub why: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm: Option<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub first_seen: Timestamp,
    #[serde(default)]
    pub last_seen: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_confirmed: Option<Timestamp>,
    #[serde(default)]
    pub expires_at: Timestamp,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Belief {
    /// Statement text, falling back to fact text.
    #[must_use]
    pub fn text(&self) -> &str {
        item_text(self.statement.as_deref(), self.fact.as_deref())
    }

    #[must_use]
    pub fn is_retracted(&self) -> bool {
        self.status == Status::Retracted
    }

    #[must_use]
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

/// An item as it arrives in a proposal. `ttl_days`, `user_confirmed` and
/// `conflicts` are merge-time inputs and never reach the persisted form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProposedItem {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub why: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm: Option<String>,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_days: Option<i64>,
    #[serde(default)]
    pub user_confirmed: bool,
    #[serde(default)]
    pub conflicts: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_confirmed: Option<Timestamp>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProposedItem {
    #[must_use]
    pub fn text(&self) -> &str {
        item_text(self.statement.as_deref(), self.fact.as_deref())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProposalItems {
    #[serde(default)]
    pub confirmed_facts: Vec<ProposedItem>,
    #[serde(default)]
    pub hypotheses: Vec<ProposedItem>,
    #[serde(default)]
    pub open_loops: Vec<ProposedItem>,
    #[serde(default)]
    pub candidate_moves: Vec<ProposedItem>,
}

impl ProposalItems {
    #[must_use]
    pub fn section(&self, section: Section) -> &[ProposedItem] {
        match section {
            Section::ConfirmedFacts => &self.confirmed_facts,
            Section::Hypotheses => &self.hypotheses,
            Section::OpenLoops => &self.open_loops,
            Section::CandidateMoves => &self.candidate_moves,
            Section::StaleItems => &[],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Proposal {
    pub scope: String,
    #[serde(rename = "generatedAt")]
    pub generated_at: Timestamp,
    pub items: ProposalItems,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DoNotStoreRule {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default)]
    pub created_at: Timestamp,
}

impl DoNotStoreRule {
    /// Case-insensitive substring match; an empty pattern matches nothing.
    #[must_use]
    pub fn matches(&self, text: &str) -> bool {
        let pattern = self.pattern.to_lowercase();
        !pattern.is_empty() && text.to_lowercase().contains(&pattern)
    }
}

/// One scope's persisted belief store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BeliefModel {
    pub scope: String,
    #[serde(rename = "updatedAt", default)]
    pub updated_at: Timestamp,
    #[serde(default)]
    pub meta: Map<String, Value>,
    #[serde(default)]
    pub confirmed_facts: Vec<Belief>,
    #[serde(default)]
    pub hypotheses: Vec<Belief>,
    #[serde(default)]
    pub stale_items: Vec<Belief>,
    #[serde(default)]
    pub open_loops: Vec<Belief>,
    #[serde(default)]
    pub candidate_moves: Vec<Belief>,
    #[serde(default)]
    pub do_not_store: Vec<DoNotStoreRule>,
}

impl BeliefModel {
    #[must_use]
    pub fn skeleton(scope: &str, updated_at: Timestamp) -> Self {
        Self {
            scope: scope.to_string(),
            updated_at,
            meta: Map::new(),
            confirmed_facts: Vec::new(),
            hypotheses: Vec::new(),
            stale_items: Vec::new(),
            open_loops: Vec::new(),
            candidate_moves: Vec::new(),
            do_not_store: Vec::new(),
        }
    }

    #[must_use]
    pub fn section(&self, section: Section) -> &[Belief] {
        match section {
            Section::ConfirmedFacts => &self.confirmed_facts,
            Section::Hypotheses => &self.hypotheses,
            Section::OpenLoops => &self.open_loops,
            Section::CandidateMoves => &self.candidate_moves,
            Section::StaleItems => &self.stale_items,
        }
    }

    pub fn section_mut(&mut self, section: Section) -> &mut Vec<Belief> {
        match section {
            Section::ConfirmedFacts => &mut self.confirmed_facts,
            Section::Hypotheses => &mut self.hypotheses,
            Section::OpenLoops => &mut self.open_loops,
            Section::CandidateMoves => &mut self.candidate_moves,
            Section::StaleItems => &mut self.stale_items,
        }
    }

    /// First id match across sections in [`Section::LOOKUP_ORDER`].
    #[must_use]
    pub fn find(&self, id: &str) -> Option<(Section, &Belief)> {
        Section::LOOKUP_ORDER.into_iter().find_map(|section| {
            self.section(section)
                .iter()
                .find(|item| item.id == id)
                .map(|item| (section, item))
        })
    }

    #[must_use]
    pub fn suppressing_rule(&self, text: &str) -> Option<&DoNotStoreRule> {
        self.do_not_store.iter().find(|rule| rule.matches(text))
    }

    #[must_use]
    pub fn active_len(&self) -> usize {
        Section::MUTABLE
            .into_iter()
            .map(|section| self.section(section).len())
            .sum()
    }
}

fn item_text<'a>(statement: Option<&'a str>, fact: Option<&'a str>) -> &'a str {
    statement
        .filter(|value| !value.is_empty())
        .or(fact)
        .unwrap_or_default()
}
