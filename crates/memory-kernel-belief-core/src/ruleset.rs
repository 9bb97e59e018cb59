use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::Section;
use crate::BeliefError;

/// Every tunable of the merge, decay, scoring and rendering passes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BeliefRuleset {
    pub ruleset_version: u32,
    pub fact_ttl_days: i64,
    pub hypothesis_ttl_days: i64,
    pub open_loop_ttl_days: i64,
    pub candidate_move_ttl_days: i64,
    pub fact_confidence: f64,
    pub confidence_floor: f64,
    pub confidence_ceiling: f64,
    pub base_confidence: f64,
    pub per_source_weight: f64,
    pub max_counted_sources: u32,
    pub recency_weight: f64,
    pub recency_scale_days: f64,
    pub agreement_bonus: f64,
    pub agreement_min_sources: u32,
    pub user_confirmed_bonus: f64,
    pub conflict_penalty: f64,
    pub stale_confidence_cap: f64,
    pub diff_cap: usize,
    pub render_fact_cap: usize,
    pub render_hypothesis_cap: usize,
    pub render_stale_cap: usize,
    pub render_do_not_store_cap: usize,
    pub render_diff_cap: usize,
}

impl Default for BeliefRuleset {
    fn default() -> Self {
        Self::v1()
    }
}

impl BeliefRuleset {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            ruleset_version: 1,
            fact_ttl_days: 365,
            hypothesis_ttl_days: 21,
            open_loop_ttl_days: 14,
            candidate_move_ttl_days: 7,
            fact_confidence: crate::FACT_CONFIDENCE,
            confidence_floor: 0.05,
            confidence_ceiling: 0.99,
            base_confidence: crate::DEFAULT_CONFIDENCE,
            per_source_weight: 0.12,
            max_counted_sources: 5,
            recency_weight: 0.25,
            recency_scale_days: 7.0,
            agreement_bonus: 0.15,
            agreement_min_sources: 2,
            user_confirmed_bonus: 0.20,
            conflict_penalty: 0.25,
            stale_confidence_cap: 0.35,
            diff_cap: 10,
            render_fact_cap: 5,
            render_hypothesis_cap: 5,
            render_stale_cap: 3,
            render_do_not_store_cap: 10,
            render_diff_cap: 5,
        }
    }

    /// Validates ruleset bounds.
    ///
    /// # Errors
    /// Returns [`BeliefError::Configuration`] when one or more fields are
    /// outside allowed bounds.
    pub fn validate(&self) -> Result<(), BeliefError> {
        if self.ruleset_version == 0 {
            return Err(BeliefError::Configuration(
                "ruleset_version MUST be >= 1".to_string(),
            ));
        }

        for (name, value) in [
            ("fact_ttl_days", self.fact_ttl_days),
            ("hypothesis_ttl_days", self.hypothesis_ttl_days),
            ("open_loop_ttl_days", self.open_loop_ttl_days),
            ("candidate_move_ttl_days", self.candidate_move_ttl_days),
        ] {
            if value < 1 {
                return Err(BeliefError::Configuration(format!(
                    "{name} MUST be >= 1"
                )));
            }
        }

        for (name, value) in [
            ("fact_confidence", self.fact_confidence),
            ("confidence_floor", self.confidence_floor),
            ("confidence_ceiling", self.confidence_ceiling),
            ("base_confidence", self.base_confidence),
            ("per_source_weight", self.per_source_weight),
            ("recency_weight", self.recency_weight),
            ("agreement_bonus", self.agreement_bonus),
            ("user_confirmed_bonus", self.user_confirmed_bonus),
            ("conflict_penalty", self.conflict_penalty),
            ("stale_confidence_cap", self.stale_confidence_cap),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(BeliefError::Configuration(format!(
                    "{name} MUST be in [0.0, 1.0]"
                )));
            }
        }

        if self.confidence_floor > self.confidence_ceiling {
            return Err(BeliefError::Configuration(
                "confidence_floor cannot exceed confidence_ceiling".to_string(),
            ));
        }

        if !(self.recency_scale_days.is_finite() && self.recency_scale_days > 0.0) {
            return Err(BeliefError::Configuration(
                "recency_scale_days MUST be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a ruleset from JSON.
    ///
    /// # Errors
    /// Returns [`BeliefError::Configuration`] when JSON decoding fails
    /// or decoded values violate ruleset constraints.
    pub fn from_json(value: &Value) -> Result<Self, BeliefError> {
        let ruleset: Self = serde_json::from_value(value.clone()).map_err(|err| {
            BeliefError::Configuration(format!("invalid ruleset JSON payload: {err}"))
        })?;
        ruleset.validate()?;
        Ok(ruleset)
    }

    #[must_use]
    pub fn default_ttl_days(&self, section: Section) -> i64 {
        match section {
            Section::ConfirmedFacts => self.fact_ttl_days,
            Section::Hypotheses => self.hypothesis_ttl_days,
            Section::OpenLoops => self.open_loop_ttl_days,
            Section::CandidateMoves | Section::StaleItems => self.candidate_move_ttl_days,
        }
    }

    /// Resolves a proposed ttl: zero or absent falls back to the section
    /// default, and the result is never below one day.
    #[must_use]
    pub fn resolve_ttl_days(&self, section: Section, proposed: Option<i64>) -> i64 {
        match proposed {
            Some(days) if days != 0 => days.max(1),
            _ => self.default_ttl_days(section).max(1),
        }
    }

    #[must_use]
    pub fn clamp_confidence(&self, value: f64) -> f64 {
        if value.is_nan() {
            return self.confidence_floor;
        }
        value.clamp(self.confidence_floor, self.confidence_ceiling)
    }
}
