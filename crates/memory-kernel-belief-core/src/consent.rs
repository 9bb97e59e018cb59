use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::decay::retire_retracted;
use crate::model::{Belief, BeliefModel, DoNotStoreRule, Section, Status};
use crate::{BeliefError, Timestamp, FACT_CONFIDENCE};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ForgetTarget {
    Id(String),
    Match(String),
}

/// An explicit user consent operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsentOp {
    DontStore {
        pattern: String,
        domain: Option<String>,
        note: Option<String>,
    },
    Forget(ForgetTarget),
    Confirm {
        id: String,
        fact: Option<String>,
        value: Option<Value>,
    },
    Deny {
        id: String,
    },
}

impl ConsentOp {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DontStore { .. } => "dont-store",
            Self::Forget(_) => "forget",
            Self::Confirm { .. } => "confirm",
            Self::Deny { .. } => "deny",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConsentReport {
    pub operation: String,
    pub affected: Vec<String>,
    pub retired: Vec<String>,
}

/// Applies a consent operation to a copy of `model`.
///
/// Deny and forget mark their targets retracted; confirm promotes a non-fact
/// item into `confirmed_facts`; dont-store appends a suppression rule. After
/// every operation retracted items leave the active sections for
/// `stale_items`. The input model is never modified, so a failed operation
/// leaves nothing to roll back.
///
/// # Errors
/// Returns [`BeliefError::InputMissing`] for an empty pattern, match or id,
/// and [`BeliefError::IdentityViolation`] when no item matches.
pub fn apply_consent(
    model: &BeliefModel,
    op: &ConsentOp,
    now: OffsetDateTime,
) -> Result<(BeliefModel, ConsentReport), BeliefError> {
    let now_ts = Timestamp::from_datetime(now)?;
    let mut out = model.clone();

    let affected = match op {
        ConsentOp::DontStore {
            pattern,
            domain,
            note,
        } => {
            if pattern.trim().is_empty() {
                return Err(BeliefError::InputMissing(
                    "dont-store requires a pattern".to_string(),
                ));
            }
            out.do_not_store.push(DoNotStoreRule {
                pattern: pattern.clone(),
                domain: domain.clone().filter(|value| !value.is_empty()),
                note: note.clone().filter(|value| !value.is_empty()),
                created_at: now_ts.clone(),
            });
            vec![pattern.clone()]
        }
        ConsentOp::Deny { id } | ConsentOp::Forget(ForgetTarget::Id(id)) => {
            retract_by_id(&mut out, id, op.as_str())?;
            vec![id.clone()]
        }
        ConsentOp::Forget(ForgetTarget::Match(needle)) => retract_matching(&mut out, needle)?,
        ConsentOp::Confirm { id, fact, value } => {
            confirm(&mut out, id, fact.as_deref(), value.clone(), &now_ts)?;
            vec![id.clone()]
        }
    };

    let retired = retire_retracted(&mut out);
    out.updated_at = now_ts;

    Ok((
        out,
        ConsentReport {
            operation: op.as_str().to_string(),
            affected,
            retired,
        },
    ))
}

fn require_id(id: &str, operation: &str) -> Result<(), BeliefError> {
    if id.trim().is_empty() {
        return Err(BeliefError::InputMissing(format!(
            "{operation} requires an id"
        )));
    }
    Ok(())
}

/// Retracts the first id match in [`Section::LOOKUP_ORDER`]. Only that copy
/// changes; a same-id entry in a later section stays as it is.
fn retract_by_id(model: &mut BeliefModel, id: &str, operation: &str) -> Result<(), BeliefError> {
    require_id(id, operation)?;
    let section = model
        .find(id)
        .map(|(section, _)| section)
        .ok_or_else(|| BeliefError::IdentityViolation(format!("id not found: {id}")))?;

    if let Some(item) = model
        .section_mut(section)
        .iter_mut()
        .find(|item| item.id == id)
    {
        item.status = Status::Retracted;
    }
    Ok(())
}

fn retract_matching(model: &mut BeliefModel, needle: &str) -> Result<Vec<String>, BeliefError> {
    if needle.trim().is_empty() {
        return Err(BeliefError::InputMissing(
            "forget requires an id or a match".to_string(),
        ));
    }
    let needle = needle.to_lowercase();

    let mut hits = Vec::new();
    for section in Section::LOOKUP_ORDER {
        for item in model.section_mut(section).iter_mut() {
            if item.text().to_lowercase().contains(&needle) {
                item.status = Status::Retracted;
                hits.push(item.id.clone());
            }
        }
    }

    if hits.is_empty() {
        return Err(BeliefError::IdentityViolation(format!(
            "no matches for: {needle}"
        )));
    }
    Ok(hits)
}

fn confirm(
    model: &mut BeliefModel,
    id: &str,
    fact: Option<&str>,
    value: Option<Value>,
    now: &Timestamp,
) -> Result<(), BeliefError> {
    require_id(id, "confirm")?;
    let source = Section::LOOKUP_ORDER
        .into_iter()
        .filter(|section| !section.is_fact())
        .find_map(|section| model.section(section).iter().find(|item| item.id == id))
        .cloned()
        .ok_or_else(|| BeliefError::IdentityViolation(format!("id not found: {id}")))?;

    let fact_text = fact
        .filter(|value| !value.trim().is_empty())
        .or(source.statement.as_deref().filter(|value| !value.is_empty()))
        .or(source.fact.as_deref().filter(|value| !value.is_empty()))
        .map(str::to_string)
        .ok_or_else(|| {
            BeliefError::InputMissing(format!("confirm {id} requires a fact or statement"))
        })?;

    for section in Section::LOOKUP_ORDER {
        if !section.is_fact() {
            model.section_mut(section).retain(|item| item.id != id);
        }
    }

    let promoted = Belief {
        id: id.to_string(),
        statement: None,
        fact: Some(fact_text),
        value,
        domain: Some(source.domain.unwrap_or_default()),
        why: None,
        confirm: None,
        confidence: FACT_CONFIDENCE,
        first_seen: non_empty(source.first_seen).unwrap_or_else(|| now.clone()),
        last_seen: now.clone(),
        last_confirmed: Some(now.clone()),
        expires_at: non_empty(source.expires_at).unwrap_or_else(Timestamp::far_future),
        status: Status::Active,
        evidence: source.evidence,
        extra: Map::new(),
    };

    match model.confirmed_facts.iter_mut().find(|item| item.id == id) {
        Some(existing) => *existing = promoted,
        None => model.confirmed_facts.push(promoted),
    }
    Ok(())
}

fn non_empty(value: Timestamp) -> Option<Timestamp> {
    (!value.is_empty()).then_some(value)
}
