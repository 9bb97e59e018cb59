//! `mk belief` command surface.
//!
//! Hosts embed the CLI through [`run_cli`]; the `mk` binary only initialises
//! logging and delegates here. Stdout carries command output, logs go to
//! stderr.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};
use memory_kernel_belief_core::schema::{MODEL_SCHEMA, PROPOSAL_SCHEMA};
use memory_kernel_belief_core::{
    locate_quote, parse_rfc3339, render_summary, truncate_to_seconds, BeliefRuleset, Clock,
    ConsentOp, FixedClock, ForgetTarget, SchemaGate, SystemClock,
};
use memory_kernel_belief_store::nightly::{
    parse_scopes, run_nightly, NightlyConfig, RolloutPhase, DEFAULT_SCOPES, MODELS_DIR, PHASE_ENV,
};
use memory_kernel_belief_store::{
    apply_consent_file, build_model, diff_files, read_json, validate_model_file, BuildRequest,
    JsonModelStore, StoreContext,
};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "MK_LOG";

#[derive(Debug, Parser)]
#[command(name = "mk")]
#[command(about = "Memory Kernel belief model CLI")]
pub struct Cli {
    /// Ruleset JSON overriding the built-in v1 ruleset.
    #[arg(long)]
    ruleset: Option<PathBuf>,

    /// Evaluation instant (RFC 3339) instead of the system clock.
    #[arg(long)]
    now: Option<String>,

    #[arg(long)]
    model_schema: Option<PathBuf>,

    #[arg(long)]
    proposal_schema: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Belief {
        #[command(subcommand)]
        command: Box<BeliefCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum BeliefCommand {
    /// Merge a proposal into a scope's model.
    Build(BuildArgs),
    /// Apply an explicit user consent operation.
    Consent {
        #[command(subcommand)]
        command: Box<ConsentCommand>,
    },
    Diff(DiffArgs),
    Validate(ValidateArgs),
    Render(RenderArgs),
    /// Find the line range citing a quote.
    Locate(LocateArgs),
    /// Two-phase rollout across scopes.
    Nightly(NightlyArgs),
}

#[derive(Debug, Args)]
pub struct BuildArgs {
    #[arg(long)]
    scope: String,
    #[arg(long, default_value = ".")]
    workspace: PathBuf,
    /// Defaults to `memory/internal/beliefs/<scope>/model.json` under the workspace.
    #[arg(long)]
    model: Option<PathBuf>,
    #[arg(long)]
    proposal: PathBuf,
    #[arg(long)]
    snapshot_out: Option<PathBuf>,
    #[arg(long)]
    diff_out: Option<PathBuf>,
    #[arg(long)]
    no_verify_sources: bool,
}

#[derive(Debug, Subcommand)]
pub enum ConsentCommand {
    DontStore(DontStoreArgs),
    Forget(ForgetArgs),
    Confirm(ConfirmArgs),
    Deny(DenyArgs),
}

#[derive(Debug, Args)]
pub struct DontStoreArgs {
    #[arg(long)]
    model: PathBuf,
    #[arg(long)]
    pattern: String,
    #[arg(long)]
    domain: Option<String>,
    #[arg(long)]
    note: Option<String>,
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("target").required(true).args(["id", "matching"])))]
pub struct ForgetArgs {
    #[arg(long)]
    model: PathBuf,
    #[arg(long)]
    id: Option<String>,
    #[arg(long = "match")]
    matching: Option<String>,
}

#[derive(Debug, Args)]
pub struct ConfirmArgs {
    #[arg(long)]
    model: PathBuf,
    #[arg(long)]
    id: String,
    #[arg(long)]
    fact: Option<String>,
    #[arg(long)]
    value: Option<String>,
}

#[derive(Debug, Args)]
pub struct DenyArgs {
    #[arg(long)]
    model: PathBuf,
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
pub struct DiffArgs {
    #[arg(long)]
    prev: PathBuf,
    #[arg(long)]
    cur: PathBuf,
    /// Per-category cap; defaults to the ruleset's diff cap.
    #[arg(long)]
    cap: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ValidateArgs {
    #[arg(long)]
    model: PathBuf,
}

#[derive(Debug, Args)]
pub struct RenderArgs {
    #[arg(long)]
    model: PathBuf,
    #[arg(long)]
    prev: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct LocateArgs {
    #[arg(long, default_value = ".")]
    workspace: PathBuf,
    /// Workspace-relative source file.
    #[arg(long)]
    path: String,
    #[arg(long)]
    quote: String,
    #[arg(long, default_value_t = 1)]
    window: usize,
}

#[derive(Debug, Args)]
pub struct NightlyArgs {
    #[arg(long, default_value = ".")]
    workspace: PathBuf,
    /// 1 = dry run, 2 = apply. Falls back to `MK_BELIEF_PHASE`, then 1.
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=2))]
    phase: Option<u8>,
    #[arg(long, default_value = DEFAULT_SCOPES)]
    scopes: String,
    #[arg(long)]
    run_id: Option<String>,
}

/// Installs the stderr `tracing` subscriber. Filter directives come from
/// `MK_LOG`, falling back to `info`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when configuration loading fails, the requested command
/// fails, a quote cannot be located, or any nightly scope fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let ctx = build_context(&cli)?;
    match cli.command {
        Command::Belief { command } => run_belief(*command, &ctx),
    }
}

/// Executes a parsed belief command against prepared collaborators.
///
/// # Errors
/// Returns an error when the command fails.
pub fn run_belief(command: BeliefCommand, ctx: &StoreContext) -> Result<()> {
    match command {
        BeliefCommand::Build(args) => {
            let model_path = args.model.unwrap_or_else(|| {
                args.workspace
                    .join(MODELS_DIR)
                    .join(&args.scope)
                    .join("model.json")
            });
            let request = BuildRequest {
                scope: args.scope,
                workspace: args.workspace,
                model_path,
                proposal_path: args.proposal,
                snapshot_out: args.snapshot_out,
                diff_out: args.diff_out,
                verify_sources: !args.no_verify_sources,
            };
            let report = build_model(ctx, &request)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        BeliefCommand::Consent { command } => {
            let (model, op) = consent_op(*command);
            let outcome = apply_consent_file(ctx, &model, &op)?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        BeliefCommand::Diff(args) => {
            let cap = args.cap.unwrap_or(ctx.ruleset.diff_cap);
            let diff = diff_files(&args.prev, &args.cur, cap)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&diff)?);
            } else {
                for line in diff.lines() {
                    println!("{line}");
                }
            }
            Ok(())
        }
        BeliefCommand::Validate(args) => {
            validate_model_file(&ctx.gate, &args.model)?;
            println!("ok");
            Ok(())
        }
        BeliefCommand::Render(args) => {
            let model = JsonModelStore::open(&args.model).load_required()?;
            let prev = match &args.prev {
                Some(path) => JsonModelStore::open(path).load()?,
                None => None,
            };
            let text = render_summary(&model, prev.as_ref(), ctx.now(), &ctx.ruleset)?;
            print!("{text}");
            Ok(())
        }
        BeliefCommand::Locate(args) => {
            match locate_quote(&args.workspace, &args.path, &args.quote, args.window)? {
                Some(range) => {
                    println!("{range}");
                    Ok(())
                }
                None => Err(anyhow!("quote not found in {}", args.path)),
            }
        }
        BeliefCommand::Nightly(args) => {
            let env_phase = std::env::var(PHASE_ENV).ok();
            let config = NightlyConfig {
                workspace: args.workspace,
                phase: RolloutPhase::resolve(args.phase, env_phase.as_deref())?,
                scopes: parse_scopes(&args.scopes),
                run_id: args.run_id,
            };
            if config.scopes.is_empty() {
                return Err(anyhow!("at least one scope is required"));
            }
            let report = run_nightly(ctx, &config)?;
            println!("{}", serde_json::to_string_pretty(&report)?);

            if !report.succeeded() {
                let failed = report
                    .scopes
                    .iter()
                    .filter(|outcome| outcome.error.is_some())
                    .map(|outcome| outcome.scope.as_str())
                    .collect::<Vec<_>>();
                return Err(anyhow!("nightly run failed for scopes: {}", failed.join(", ")));
            }
            Ok(())
        }
    }
}

fn consent_op(command: ConsentCommand) -> (PathBuf, ConsentOp) {
    match command {
        ConsentCommand::DontStore(args) => (
            args.model,
            ConsentOp::DontStore {
                pattern: args.pattern,
                domain: args.domain,
                note: args.note,
            },
        ),
        ConsentCommand::Forget(args) => {
            let target = match (args.id, args.matching) {
                (Some(id), _) => ForgetTarget::Id(id),
                (None, matching) => ForgetTarget::Match(matching.unwrap_or_default()),
            };
            (args.model, ConsentOp::Forget(target))
        }
        ConsentCommand::Confirm(args) => (
            args.model,
            ConsentOp::Confirm {
                id: args.id,
                fact: args.fact,
                value: args.value.map(Value::String),
            },
        ),
        ConsentCommand::Deny(args) => (args.model, ConsentOp::Deny { id: args.id }),
    }
}

fn build_context(cli: &Cli) -> Result<StoreContext> {
    let ruleset = match &cli.ruleset {
        Some(path) => {
            let document = load_document(path, "ruleset")?;
            BeliefRuleset::from_json(&document)
                .with_context(|| format!("invalid ruleset {}", path.display()))?
        }
        None => BeliefRuleset::v1(),
    };

    let gate = match (&cli.model_schema, &cli.proposal_schema) {
        (None, None) => SchemaGate::builtin()?,
        (model, proposal) => {
            let model = match model {
                Some(path) => load_document(path, "model schema")?,
                None => serde_json::from_str(MODEL_SCHEMA)?,
            };
            let proposal = match proposal {
                Some(path) => load_document(path, "proposal schema")?,
                None => serde_json::from_str(PROPOSAL_SCHEMA)?,
            };
            SchemaGate::from_documents(&model, &proposal)?
        }
    };

    let clock: Box<dyn Clock> = match &cli.now {
        Some(raw) => {
            let now = parse_rfc3339(raw).map_err(|err| anyhow!("invalid --now value: {err}"))?;
            Box::new(FixedClock(truncate_to_seconds(now)))
        }
        None => Box::new(SystemClock),
    };

    Ok(StoreContext::new(gate, ruleset, clock))
}

fn load_document(path: &Path, what: &str) -> Result<Value> {
    read_json(path)?.ok_or_else(|| anyhow!("{what} not found or empty: {}", path.display()))
}
