//! JSON-file persistence for belief models.
//!
//! Every write goes through the schema gate and lands with a write-then-rename,
//! so readers see either the previous document or the new one. There is no
//! cross-process locking: concurrent writers to one model resolve by
//! last-writer-wins at the final rename.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use memory_kernel_belief_core::{
    apply_consent, diff_models, merge_proposal, BeliefError, BeliefModel, BeliefRuleset, Clock,
    ConsentOp, ConsentReport, MergeOptions, MergeReport, ModelDiff, SchemaGate, SystemClock,
    Timestamp,
};
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

pub mod nightly;

pub const BUILD_CONTRACT_VERSION: &str = "belief_build.v1";
pub const CONSENT_CONTRACT_VERSION: &str = "belief_consent.v1";
pub const INITIAL_SNAPSHOT_LINE: &str = "+ added initial snapshot";

/// Shared collaborators for one invocation.
pub struct StoreContext {
    pub gate: SchemaGate,
    pub ruleset: BeliefRuleset,
    pub clock: Box<dyn Clock>,
}

impl std::fmt::Debug for StoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreContext")
            .field("gate", &self.gate)
            .field("ruleset", &self.ruleset)
            .finish_non_exhaustive()
    }
}

impl StoreContext {
    #[must_use]
    pub fn new(gate: SchemaGate, ruleset: BeliefRuleset, clock: Box<dyn Clock>) -> Self {
        Self {
            gate,
            ruleset,
            clock,
        }
    }

    /// Embedded schemas, the v1 ruleset and the system clock.
    ///
    /// # Errors
    /// Returns an error when the embedded schemas fail to compile.
    pub fn builtin() -> Result<Self> {
        Ok(Self::new(
            SchemaGate::builtin()?,
            BeliefRuleset::v1(),
            Box::new(SystemClock),
        ))
    }

    #[must_use]
    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }
}

/// Reads a JSON document. A missing file, an empty file, or an empty object
/// all read as `None`.
///
/// # Errors
/// Returns an error when the file exists but cannot be read or parsed.
pub fn read_json(path: &Path) -> Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    if body.trim().is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(&body)
        .with_context(|| format!("failed to parse JSON from {}", path.display()))?;
    match &value {
        Value::Null => Ok(None),
        Value::Object(map) if map.is_empty() => Ok(None),
        _ => Ok(Some(value)),
    }
}

/// Writes `value` as pretty JSON through a sibling temporary file and an
/// atomic rename.
///
/// # Errors
/// Returns an error when the parent directory cannot be created or the
/// temporary file cannot be written or persisted.
pub fn write_json_atomic(path: &Path, value: &Value) -> Result<()> {
    let mut body = serde_json::to_string_pretty(value)?;
    body.push('\n');
    write_text_atomic(path, &body)
}

/// Writes text through a sibling temporary file and an atomic rename.
///
/// # Errors
/// Returns an error when any filesystem step fails.
pub fn write_text_atomic(path: &Path, body: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .with_context(|| format!("failed to create directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut staged = tempfile::Builder::new()
        .prefix(&format!(".{file_name}."))
        .suffix(".tmp")
        .tempfile_in(&parent)
        .with_context(|| format!("failed to stage temporary file in {}", parent.display()))?;
    staged
        .write_all(body.as_bytes())
        .with_context(|| format!("failed to write staged copy of {}", path.display()))?;
    staged
        .as_file()
        .sync_all()
        .with_context(|| format!("failed to flush staged copy of {}", path.display()))?;
    staged
        .persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// One scope's model document on disk.
#[derive(Debug, Clone)]
pub struct JsonModelStore {
    path: PathBuf,
}

impl JsonModelStore {
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the model if one exists.
    ///
    /// # Errors
    /// Returns an error when the document exists but cannot be read or
    /// decoded.
    pub fn load(&self) -> Result<Option<BeliefModel>> {
        let Some(document) = read_json(&self.path)? else {
            return Ok(None);
        };
        let model = serde_json::from_value(document)
            .map_err(BeliefError::from)
            .with_context(|| format!("failed to decode model {}", self.path.display()))?;
        Ok(Some(model))
    }

    /// Loads the model, failing when it is missing or empty.
    ///
    /// # Errors
    /// Returns [`BeliefError::InputMissing`] for a missing document and
    /// decode errors otherwise.
    pub fn load_required(&self) -> Result<BeliefModel> {
        match self.load()? {
            Some(model) => Ok(model),
            None => Err(BeliefError::InputMissing(format!(
                "model not found or empty: {}",
                self.path.display()
            ))
            .into()),
        }
    }

    /// Validates the model and writes it atomically. Returns the persisted
    /// document.
    ///
    /// # Errors
    /// Returns [`BeliefError::SchemaViolation`] without touching the file
    /// when the model is invalid, and I/O errors from the write.
    pub fn save(&self, gate: &SchemaGate, model: &BeliefModel) -> Result<Value> {
        let label = format!("model ({})", self.path.display());
        let document = gate.check_model(model, &label)?;
        write_json_atomic(&self.path, &document)?;
        Ok(document)
    }
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub scope: String,
    pub workspace: PathBuf,
    pub model_path: PathBuf,
    pub proposal_path: PathBuf,
    pub snapshot_out: Option<PathBuf>,
    pub diff_out: Option<PathBuf>,
    pub verify_sources: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub contract_version: &'static str,
    pub scope: String,
    pub model_path: String,
    pub updated_at: Timestamp,
    pub created: bool,
    pub merge: MergeReport,
    pub diff: Vec<String>,
}

/// Merges a proposal file into the model file for `scope`.
///
/// Nothing is written unless the proposal passes the schema gate, every
/// citation verifies, and the merged model passes the schema gate.
///
/// # Errors
/// Returns [`BeliefError::InputMissing`] for a missing proposal,
/// [`BeliefError::ScopeMismatch`] when the proposal targets another scope,
/// and schema, evidence or I/O errors from the pipeline.
pub fn build_model(ctx: &StoreContext, request: &BuildRequest) -> Result<BuildReport> {
    build_model_at(ctx, request, ctx.now())
}

/// [`build_model`] against an evaluation instant the caller already read.
///
/// # Errors
/// Same as [`build_model`].
pub fn build_model_at(
    ctx: &StoreContext,
    request: &BuildRequest,
    now: OffsetDateTime,
) -> Result<BuildReport> {
    let Some(raw_proposal) = read_json(&request.proposal_path)? else {
        return Err(BeliefError::InputMissing(format!(
            "proposal missing/empty: {}",
            request.proposal_path.display()
        ))
        .into());
    };
    let proposal = ctx.gate.check_proposal(
        &raw_proposal,
        &format!("proposal ({})", request.proposal_path.display()),
    )?;
    if proposal.scope != request.scope {
        return Err(BeliefError::ScopeMismatch {
            expected: request.scope.clone(),
            actual: proposal.scope,
        }
        .into());
    }

    let store = JsonModelStore::open(&request.model_path);
    let prior = store.load()?;
    let created = prior.is_none();
    let base = match &prior {
        Some(model) => model.clone(),
        None => BeliefModel::skeleton(&request.scope, Timestamp::from_datetime(now)?),
    };

    let workspace = request.workspace.canonicalize().with_context(|| {
        format!("workspace not accessible: {}", request.workspace.display())
    })?;
    let (merged, merge) = merge_proposal(
        &base,
        &proposal,
        &MergeOptions {
            workspace: &workspace,
            verify_sources: request.verify_sources,
            ruleset: &ctx.ruleset,
            now,
        },
    )?;

    for id in &merge.decay.expired {
        tracing::debug!(scope = %request.scope, id = %id, "demoted expired item to stale");
    }
    if merge.suppressed > 0 {
        tracing::debug!(
            scope = %request.scope,
            suppressed = merge.suppressed,
            "dropped items matching do-not-store rules"
        );
    }

    let document = store.save(&ctx.gate, &merged)?;
    if let Some(snapshot) = &request.snapshot_out {
        write_json_atomic(snapshot, &document)?;
    }

    let diff = match &prior {
        Some(prior) => diff_models(prior, &merged, ctx.ruleset.diff_cap).lines(),
        None => vec![INITIAL_SNAPSHOT_LINE.to_string()],
    };
    if let Some(diff_out) = &request.diff_out {
        write_lines(diff_out, &diff)?;
    }

    tracing::info!(
        scope = %request.scope,
        path = %request.model_path.display(),
        refreshed = merge.refreshed,
        carried = merge.carried,
        stale = merge.decay.stale_total,
        "belief model written"
    );

    Ok(BuildReport {
        contract_version: BUILD_CONTRACT_VERSION,
        scope: request.scope.clone(),
        model_path: request.model_path.display().to_string(),
        updated_at: merged.updated_at,
        created,
        merge,
        diff,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsentOutcome {
    pub contract_version: &'static str,
    pub model_path: String,
    pub updated_at: Timestamp,
    #[serde(flatten)]
    pub report: ConsentReport,
}

/// Applies a consent operation to a persisted model and writes it back.
///
/// # Errors
/// Returns [`BeliefError::InputMissing`] when the model is absent, consent
/// errors for a bad target, and schema or I/O errors. The file is untouched
/// on any error.
pub fn apply_consent_file(
    ctx: &StoreContext,
    model_path: &Path,
    op: &ConsentOp,
) -> Result<ConsentOutcome> {
    let store = JsonModelStore::open(model_path);
    let model = store.load_required()?;
    let (updated, report) = apply_consent(&model, op, ctx.now())?;
    store.save(&ctx.gate, &updated)?;

    tracing::info!(
        path = %model_path.display(),
        operation = op.as_str(),
        affected = report.affected.len(),
        retired = report.retired.len(),
        "consent operation applied"
    );

    Ok(ConsentOutcome {
        contract_version: CONSENT_CONTRACT_VERSION,
        model_path: model_path.display().to_string(),
        updated_at: updated.updated_at,
        report,
    })
}

/// Loads and validates a model file.
///
/// # Errors
/// Returns [`BeliefError::InputMissing`] for a missing document and
/// [`BeliefError::SchemaViolation`] for an invalid one.
pub fn validate_model_file(gate: &SchemaGate, path: &Path) -> Result<BeliefModel> {
    let Some(document) = read_json(path)? else {
        return Err(
            BeliefError::InputMissing(format!("model not found or empty: {}", path.display()))
                .into(),
        );
    };
    Ok(gate.check_model_document(&document, &format!("model ({})", path.display()))?)
}

/// Diffs two model files; a missing file reads as an empty model.
///
/// # Errors
/// Returns an error when an existing file cannot be read or decoded.
pub fn diff_files(prev: &Path, cur: &Path, cap: usize) -> Result<ModelDiff> {
    let before = JsonModelStore::open(prev).load()?.unwrap_or_else(empty_model);
    let after = JsonModelStore::open(cur).load()?.unwrap_or_else(empty_model);
    Ok(diff_models(&before, &after, cap))
}

fn empty_model() -> BeliefModel {
    BeliefModel::skeleton("", Timestamp::default())
}

/// Writes lines with a trailing newline, creating parent directories.
///
/// # Errors
/// Returns an error when the file cannot be written.
pub fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    let mut body = lines.join("\n");
    body.push('\n');
    write_text_atomic(path, &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory_kernel_belief_core::{parse_rfc3339, FixedClock, ForgetTarget, Status};
    use serde_json::json;
    use tempfile::TempDir;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_err<T>(result: Result<T>) -> anyhow::Error {
        match result {
            Ok(_) => panic!("expected Err(..), got Ok"),
            Err(err) => err,
        }
    }

    const SCOPE: &str = "user-profile/preferences";
    const NOTES: &str = "# 2026-02-21\nJD prefers concise communication.\nUses UTC everywhere.\n";

    fn context(at: &str) -> StoreContext {
        StoreContext::new(
            must_ok(SchemaGate::builtin()),
            BeliefRuleset::v1(),
            Box::new(FixedClock(must_ok(parse_rfc3339(at)))),
        )
    }

    fn workspace() -> TempDir {
        let dir = must_ok(TempDir::new());
        must_ok(fs::create_dir_all(dir.path().join("memory")));
        must_ok(fs::write(dir.path().join("memory/2026-02-21.md"), NOTES));
        dir
    }

    fn write_proposal(ws: &TempDir, scope: &str, quote: &str) -> PathBuf {
        let path = ws.path().join("tmp/proposal.json");
        must_ok(write_json_atomic(
            &path,
            &json!({
                "scope": scope,
                "generatedAt": "2026-02-22T00:00:00Z",
                "items": {
                    "confirmed_facts": [],
                    "hypotheses": [{
                        "id": "h1",
                        "statement": "JD prefers concise communication.",
                        "evidence": [{
                            "path": "memory/2026-02-21.md",
                            "lines": "L2-L2",
                            "quote": quote,
                            "ts": "2026-02-21T00:00:00Z"
                        }]
                    }],
                    "open_loops": [],
                    "candidate_moves": []
                }
            }),
        ));
        path
    }

    fn request(ws: &TempDir, proposal_path: PathBuf) -> BuildRequest {
        BuildRequest {
            scope: SCOPE.to_string(),
            workspace: ws.path().to_path_buf(),
            model_path: ws.path().join("memory/internal/beliefs").join(SCOPE).join("model.json"),
            proposal_path,
            snapshot_out: None,
            diff_out: Some(ws.path().join("tmp/diff.txt")),
            verify_sources: true,
        }
    }

    #[test]
    fn build_creates_model_and_initial_diff() {
        let ws = workspace();
        let ctx = context("2026-02-22T00:00:00Z");
        let req = request(&ws, write_proposal(&ws, SCOPE, "prefers concise"));

        let report = must_ok(build_model(&ctx, &req));

        assert!(report.created);
        assert_eq!(report.contract_version, BUILD_CONTRACT_VERSION);
        assert_eq!(report.merge.refreshed, 1);
        let model = must_ok(JsonModelStore::open(&req.model_path).load_required());
        assert_eq!(model.hypotheses.len(), 1);
        assert_eq!(model.updated_at.as_str(), "2026-02-22T00:00:00Z");
        let diff = must_ok(fs::read_to_string(ws.path().join("tmp/diff.txt")));
        assert_eq!(diff, "+ added initial snapshot\n");
    }

    #[test]
    fn bad_citation_leaves_existing_model_untouched() {
        let ws = workspace();
        let req = request(&ws, write_proposal(&ws, SCOPE, "prefers concise"));
        must_ok(build_model(&context("2026-02-22T00:00:00Z"), &req));
        let before = must_ok(fs::read_to_string(&req.model_path));

        let broken = request(&ws, write_proposal(&ws, SCOPE, "prefers verbose"));
        let err = must_err(build_model(&context("2026-02-23T00:00:00Z"), &broken));

        assert!(matches!(
            err.downcast_ref::<BeliefError>(),
            Some(BeliefError::EvidenceViolation(_))
        ));
        assert_eq!(must_ok(fs::read_to_string(&req.model_path)), before);
    }

    #[test]
    fn scope_mismatch_and_missing_proposal_fail_closed() {
        let ws = workspace();
        let ctx = context("2026-02-22T00:00:00Z");

        let mismatched = request(&ws, write_proposal(&ws, "repos", "prefers concise"));
        let err = must_err(build_model(&ctx, &mismatched));
        assert!(matches!(
            err.downcast_ref::<BeliefError>(),
            Some(BeliefError::ScopeMismatch { .. })
        ));

        let missing = request(&ws, ws.path().join("tmp/absent.json"));
        let err = must_err(build_model(&ctx, &missing));
        assert!(matches!(
            err.downcast_ref::<BeliefError>(),
            Some(BeliefError::InputMissing(_))
        ));
        assert!(!missing.model_path.exists());
    }

    #[test]
    fn consent_round_trips_through_the_file() {
        let ws = workspace();
        let req = request(&ws, write_proposal(&ws, SCOPE, "prefers concise"));
        must_ok(build_model(&context("2026-02-22T00:00:00Z"), &req));

        let outcome = must_ok(apply_consent_file(
            &context("2026-02-23T00:00:00Z"),
            &req.model_path,
            &ConsentOp::Forget(ForgetTarget::Id("h1".to_string())),
        ));
        assert_eq!(outcome.report.retired, vec!["h1".to_string()]);

        let model = must_ok(validate_model_file(&must_ok(SchemaGate::builtin()), &req.model_path));
        assert!(model.hypotheses.is_empty());
        assert_eq!(model.stale_items[0].status, Status::Retracted);
        assert_eq!(model.updated_at.as_str(), "2026-02-23T00:00:00Z");
    }

    #[test]
    fn consent_on_missing_model_is_input_missing() {
        let ws = workspace();
        let err = must_err(apply_consent_file(
            &context("2026-02-22T00:00:00Z"),
            &ws.path().join("nope/model.json"),
            &ConsentOp::Deny {
                id: "h1".to_string(),
            },
        ));
        assert!(matches!(
            err.downcast_ref::<BeliefError>(),
            Some(BeliefError::InputMissing(_))
        ));
    }

    #[test]
    fn atomic_write_leaves_no_staging_files() {
        let ws = workspace();
        let path = ws.path().join("out/doc.json");
        must_ok(write_json_atomic(&path, &json!({"a": 1})));
        must_ok(write_json_atomic(&path, &json!({"a": 2})));

        let entries: Vec<String> = must_ok(fs::read_dir(ws.path().join("out")))
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["doc.json".to_string()]);
        assert_eq!(must_ok(read_json(&path)), Some(json!({"a": 2})));
    }

    #[test]
    fn diff_files_treats_missing_as_empty() {
        let ws = workspace();
        let req = request(&ws, write_proposal(&ws, SCOPE, "prefers concise"));
        must_ok(build_model(&context("2026-02-22T00:00:00Z"), &req));

        let diff = must_ok(diff_files(&ws.path().join("absent.json"), &req.model_path, 10));
        assert_eq!(diff.lines(), vec!["+ JD prefers concise communication.".to_string()]);
    }
}
