//! Bounded, sectioned text summary of a persisted model.

use serde_json::Value;
use time::OffsetDateTime;

use crate::diff::diff_models;
use crate::model::{Belief, BeliefModel};
use crate::ruleset::BeliefRuleset;
use crate::{format_rfc3339, BeliefError};

const NONE: &str = "- (none)";

/// Renders the snapshot a user sees when asking what is assumed about them.
///
/// Retracted items never appear outside the change summary. `prev` drives
/// the "what changed" section; without it the snapshot counts as initial.
///
/// # Errors
/// Returns [`BeliefError::Serialization`] when `now` cannot be formatted.
pub fn render_summary(
    model: &BeliefModel,
    prev: Option<&BeliefModel>,
    now: OffsetDateTime,
    ruleset: &BeliefRuleset,
) -> Result<String, BeliefError> {
    let mut lines = vec![
        format!("Assumptions snapshot for {}", non_blank(&model.scope, "(unknown)")),
        format!("Generated: {}", format_rfc3339(now)?),
    ];

    lines.push(String::new());
    lines.push(format!(
        "1) Confirmed facts (max {})",
        ruleset.render_fact_cap
    ));
    let facts = newest_first(visible(&model.confirmed_facts), ruleset.render_fact_cap);
    push_or_none(
        &mut lines,
        facts.iter().map(|item| {
            let fact = item
                .fact
                .as_deref()
                .filter(|value| !value.is_empty())
                .or(item.statement.as_deref())
                .unwrap_or("(fact)");
            let last_confirmed = item
                .last_confirmed
                .as_ref()
                .filter(|value| !value.is_empty())
                .unwrap_or(&item.last_seen);
            format!(
                "- {fact} · {} · last confirmed: {} · {}",
                value_text(item.value.as_ref()),
                non_blank(last_confirmed.as_str(), "?"),
                source(item)
            )
        }),
    );

    lines.push(String::new());
    lines.push(format!(
        "2) Top hypotheses (max {})",
        ruleset.render_hypothesis_cap
    ));
    let mut hypotheses = visible(&model.hypotheses);
    hypotheses.sort_by(|left, right| right.confidence.total_cmp(&left.confidence));
    hypotheses.truncate(ruleset.render_hypothesis_cap);
    push_or_none(
        &mut lines,
        hypotheses.iter().map(|item| {
            let mut line = format!(
                "- {} · confidence: {}%",
                non_blank(item.text(), "(no statement)"),
                percent(item.confidence)
            );
            if let Some(why) = item.why.as_deref().filter(|value| !value.is_empty()) {
                line.push_str(" · why: ");
                line.push_str(why);
            }
            if let Some(confirm) = item.confirm.as_deref().filter(|value| !value.is_empty()) {
                line.push_str(" · confirm/deny: ");
                line.push_str(confirm);
            }
            line.push_str(&format!(
                " · expires: {} · {}",
                non_blank(item.expires_at.as_str(), "?"),
                source(item)
            ));
            line
        }),
    );

    lines.push(String::new());
    lines.push(format!(
        "3) Stale assumptions (max {})",
        ruleset.render_stale_cap
    ));
    let stale = newest_first(visible(&model.stale_items), ruleset.render_stale_cap);
    push_or_none(
        &mut lines,
        stale.iter().map(|item| {
            format!(
                "- {} · why stale: {} · action: {} · {}",
                non_blank(item.text(), "(no statement)"),
                item.extra_str("stale_why").unwrap_or("expired/old evidence"),
                item.extra_str("proposed_action").unwrap_or("refresh/drop"),
                source(item)
            )
        }),
    );

    lines.push(String::new());
    lines.push("4) Do-not-store protections (active)".to_string());
    push_or_none(
        &mut lines,
        model
            .do_not_store
            .iter()
            .take(ruleset.render_do_not_store_cap)
            .map(|rule| format!("- {}", rule.pattern)),
    );

    lines.push(String::new());
    lines.push("5) What changed since last snapshot".to_string());
    match prev {
        None => lines.push("- + added initial snapshot".to_string()),
        Some(prev) => lines.extend(
            diff_models(prev, model, ruleset.render_diff_cap)
                .lines()
                .into_iter()
                .map(|line| format!("- {line}")),
        ),
    }

    lines.push(String::new());
    lines.push("6) Control shortcuts".to_string());
    lines.push("- forget <x> · don't store <x> · confirm <x> · deny <x>".to_string());

    let mut out = lines.join("\n");
    out.push('\n');
    Ok(out)
}

fn visible(items: &[Belief]) -> Vec<&Belief> {
    items.iter().filter(|item| !item.is_retracted()).collect()
}

fn newest_first(mut items: Vec<&Belief>, cap: usize) -> Vec<&Belief> {
    items.sort_by(|left, right| right.last_seen.cmp_chronological(&left.last_seen));
    items.truncate(cap);
    items
}

fn push_or_none(lines: &mut Vec<String>, rendered: impl Iterator<Item = String>) {
    let before = lines.len();
    lines.extend(rendered);
    if lines.len() == before {
        lines.push(NONE.to_string());
    }
}

fn source(item: &Belief) -> String {
    let Some(first) = item.evidence.first() else {
        return "Source: (missing)".to_string();
    };
    let recency = first
        .extra
        .get("recency")
        .filter(|value| !value.is_null())
        .map(|value| format!(" ({}d ago)", value_text(Some(value))))
        .unwrap_or_default();
    format!(
        "Source: {}#{}{recency}",
        non_blank(&first.path, "?"),
        non_blank(&first.lines, "?")
    )
}

fn value_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

fn percent(confidence: f64) -> String {
    format!("{:.0}", (confidence * 100.0).round().max(0.0))
}

fn non_blank<'a>(value: &'a str, placeholder: &'a str) -> &'a str {
    if value.trim().is_empty() {
        placeholder
    } else {
        value
    }
}
