//! Two-phase nightly rollout across scopes.
//!
//! Phase 1 stages a proposal, builds it into a scratch copy of the live model,
//! and records a diff. Phase 2 additionally rebuilds against the live model,
//! unless the disable marker exists. A failing scope never touches its live
//! model; the other scopes still run.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::{
    build_model_at, diff_files, read_json, write_lines, write_text_atomic, BuildRequest,
    StoreContext, INITIAL_SNAPSHOT_LINE,
};

pub const NIGHTLY_CONTRACT_VERSION: &str = "belief_nightly.v1";
pub const RUNS_DIR: &str = "tmp/beliefs/runs";
pub const MODELS_DIR: &str = "memory/internal/beliefs";
pub const DISABLED_MARKER: &str = ".disabled";
pub const DEFAULT_SCOPES: &str = "user-profile/preferences,openclaw-runtime/ops,repos";
pub const PHASE_ENV: &str = "MK_BELIEF_PHASE";

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RolloutPhase {
    DryRun,
    Apply,
}

impl RolloutPhase {
    /// # Errors
    /// Returns an error for anything other than 1 or 2.
    pub fn from_number(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::DryRun),
            2 => Ok(Self::Apply),
            other => bail!("rollout phase must be 1 or 2, got {other}"),
        }
    }

    #[must_use]
    pub fn as_number(self) -> u8 {
        match self {
            Self::DryRun => 1,
            Self::Apply => 2,
        }
    }

    /// Explicit flag first, then the environment value, then phase 1.
    ///
    /// # Errors
    /// Returns an error when the chosen value is not a valid phase.
    pub fn resolve(flag: Option<u8>, env: Option<&str>) -> Result<Self> {
        if let Some(value) = flag {
            return Self::from_number(value);
        }
        match env.map(str::trim).filter(|value| !value.is_empty()) {
            Some(raw) => {
                let value: u8 = raw
                    .parse()
                    .with_context(|| format!("invalid {PHASE_ENV} value: {raw}"))?;
                Self::from_number(value)
            }
            None => Ok(Self::DryRun),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NightlyConfig {
    pub workspace: PathBuf,
    pub phase: RolloutPhase,
    pub scopes: Vec<String>,
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ScopeStatus {
    DryRun,
    Applied,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScopeOutcome {
    pub scope: String,
    pub status: ScopeStatus,
    pub run_dir: String,
    pub diff: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NightlyReport {
    pub contract_version: &'static str,
    pub run_id: String,
    pub phase: u8,
    pub apply_allowed: bool,
    pub scopes: Vec<ScopeOutcome>,
}

impl NightlyReport {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.scopes
            .iter()
            .all(|outcome| outcome.status != ScopeStatus::Failed)
    }
}

/// Splits a comma-separated scope list, dropping blanks.
#[must_use]
pub fn parse_scopes(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|scope| !scope.is_empty())
        .map(str::to_string)
        .collect()
}

/// `YYYYMMDD-HHMMSS` for the evaluation instant.
///
/// # Errors
/// Returns an error when the instant cannot be formatted.
pub fn default_run_id(now: OffsetDateTime) -> Result<String> {
    now.format(format_description!(
        "[year][month][day]-[hour][minute][second]"
    ))
    .context("failed to format run id")
}

/// Runs every scope and reports each outcome.
///
/// Per-scope failures are recorded in the scope's `error.log` and in the
/// report; only problems that prevent any scope from running are returned as
/// errors.
///
/// # Errors
/// Returns an error when the workspace is not accessible or the run id is not
/// a single path segment.
pub fn run_nightly(ctx: &StoreContext, config: &NightlyConfig) -> Result<NightlyReport> {
    let now = ctx.now();
    let workspace = config
        .workspace
        .canonicalize()
        .with_context(|| format!("workspace not accessible: {}", config.workspace.display()))?;

    let run_id = match &config.run_id {
        Some(run_id) => run_id.clone(),
        None => default_run_id(now)?,
    };
    if !is_single_segment(&run_id) {
        bail!("run id must be a single path segment: {run_id}");
    }

    let runs_root = workspace.join(RUNS_DIR).join(&run_id);
    let models_root = workspace.join(MODELS_DIR);
    let apply_allowed =
        config.phase == RolloutPhase::Apply && !models_root.join(DISABLED_MARKER).exists();

    let mut outcomes = Vec::with_capacity(config.scopes.len());
    for scope in &config.scopes {
        let scope_dir = runs_root.join(scope);
        let result = run_scope(
            ctx,
            &workspace,
            &models_root,
            &scope_dir,
            scope,
            apply_allowed,
            now,
        );
        let outcome = match result {
            Ok((status, diff)) => {
                tracing::info!(scope = %scope, run_id = %run_id, status = ?status, "nightly scope finished");
                ScopeOutcome {
                    scope: scope.clone(),
                    status,
                    run_dir: scope_dir.display().to_string(),
                    diff,
                    error: None,
                }
            }
            Err(err) => {
                let message = format!("{err:#}");
                tracing::warn!(scope = %scope, run_id = %run_id, error = %message, "nightly scope failed closed");
                ScopeOutcome {
                    scope: scope.clone(),
                    status: ScopeStatus::Failed,
                    run_dir: scope_dir.display().to_string(),
                    diff: Vec::new(),
                    error: Some(message),
                }
            }
        };
        outcomes.push(outcome);
    }

    Ok(NightlyReport {
        contract_version: NIGHTLY_CONTRACT_VERSION,
        run_id,
        phase: config.phase.as_number(),
        apply_allowed,
        scopes: outcomes,
    })
}

fn run_scope(
    ctx: &StoreContext,
    workspace: &Path,
    models_root: &Path,
    scope_dir: &Path,
    scope: &str,
    apply_allowed: bool,
    now: OffsetDateTime,
) -> Result<(ScopeStatus, Vec<String>)> {
    if !is_relative_scope(scope) {
        bail!("scope must be a relative path without '..': {scope}");
    }

    let error_log = scope_dir.join("error.log");
    write_text_atomic(&error_log, "")?;

    let result = stage_scope(ctx, workspace, models_root, scope_dir, scope, apply_allowed, now);
    if let Err(err) = &result {
        write_text_atomic(&error_log, &format!("ERROR: {err:#}\n"))?;
    }
    result
}

fn stage_scope(
    ctx: &StoreContext,
    workspace: &Path,
    models_root: &Path,
    scope_dir: &Path,
    scope: &str,
    apply_allowed: bool,
    now: OffsetDateTime,
) -> Result<(ScopeStatus, Vec<String>)> {
    let proposal_path = scope_dir.join("proposal.json");
    let pre_path = scope_dir.join("model.pre.json");
    let tmp_path = scope_dir.join("model.tmp.json");
    let post_path = scope_dir.join("model.post.json");
    let model_path = models_root.join(scope).join("model.json");

    let Some(raw) = read_json(&proposal_path)? else {
        return Err(anyhow!("proposal.json missing for scope {scope}"));
    };
    ctx.gate
        .check_proposal(&raw, &format!("proposal ({})", proposal_path.display()))
        .context("proposal schema invalid")?;

    let has_prior = model_path.exists();
    if has_prior {
        fs::copy(&model_path, &pre_path).with_context(|| {
            format!("failed to copy {} to {}", model_path.display(), pre_path.display())
        })?;
    }

    // The dry run merges into a copy of the live model so its diff matches
    // what the apply step would write.
    if tmp_path.exists() {
        fs::remove_file(&tmp_path)
            .with_context(|| format!("failed to clear {}", tmp_path.display()))?;
    }
    if has_prior {
        fs::copy(&pre_path, &tmp_path).with_context(|| {
            format!("failed to seed {} from {}", tmp_path.display(), pre_path.display())
        })?;
    }

    let request = BuildRequest {
        scope: scope.to_string(),
        workspace: workspace.to_path_buf(),
        model_path: tmp_path.clone(),
        proposal_path: proposal_path.clone(),
        snapshot_out: None,
        diff_out: None,
        verify_sources: true,
    };
    build_model_at(ctx, &request, now).context("build failed (dry-run)")?;

    let diff = if has_prior {
        diff_files(&pre_path, &tmp_path, ctx.ruleset.diff_cap)?.lines()
    } else {
        vec![INITIAL_SNAPSHOT_LINE.to_string()]
    };
    write_lines(&scope_dir.join("diff.txt"), &diff)?;

    if !apply_allowed {
        return Ok((ScopeStatus::DryRun, diff));
    }

    let apply = BuildRequest {
        model_path,
        snapshot_out: Some(post_path),
        ..request
    };
    build_model_at(ctx, &apply, now).context("build failed (apply)")?;
    Ok((ScopeStatus::Applied, diff))
}

fn is_relative_scope(scope: &str) -> bool {
    let path = Path::new(scope);
    !scope.trim().is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

fn is_single_segment(value: &str) -> bool {
    let mut components = Path::new(value).components();
    matches!(components.next(), Some(Component::Normal(_))) && components.next().is_none()
}
