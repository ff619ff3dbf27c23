//! IG-017: CLI subcommands: init, validate, plan, deploy, status, reset.

use crate::core::error::EngineError;
use crate::core::executor::Executor;
use crate::core::journal::{FileJournal, JournalStore};
use crate::core::types::{
    ActionOutcome, ActionStatus, Disposition, ExecutionPlan, PlanReview, RunReport, Value,
};
use crate::core::{parser, planner, resolver};
use crate::env::local::LocalChain;
use crate::tripwire::eventlog::EventLog;
use clap::Subcommand;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new ignis project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate ignis.yaml without touching any environment
    Validate {
        /// Path to ignis.yaml
        #[arg(short, long, default_value = "ignis.yaml")]
        file: PathBuf,
    },

    /// Show the execution plan, annotated with journal state
    Plan {
        /// Path to ignis.yaml
        #[arg(short, long, default_value = "ignis.yaml")]
        file: PathBuf,

        /// Parameter override, repeatable (key=value)
        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Execute the module against the local chain, resuming from the journal
    Deploy {
        /// Path to ignis.yaml
        #[arg(short, long, default_value = "ignis.yaml")]
        file: PathBuf,

        /// Parameter override, repeatable (key=value)
        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Chain state file (default: <state-dir>/chain.json)
        #[arg(long)]
        chain: Option<PathBuf>,

        /// Override policy.max_in_flight
        #[arg(long)]
        max_in_flight: Option<usize>,

        /// Override policy.timeout_ms
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Show journal entries
    Status {
        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Only this module
        #[arg(short, long)]
        module: Option<String>,
    },

    /// Reset a journal entry so the action runs again
    Reset {
        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Module the entry belongs to
        #[arg(short, long)]
        module: String,

        /// Action id (e.g. MyModule#Token)
        #[arg(short, long)]
        action: String,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Plan {
            file,
            params,
            state_dir,
        } => cmd_plan(&file, &params, &state_dir),
        Commands::Deploy {
            file,
            params,
            state_dir,
            chain,
            max_in_flight,
            timeout_ms,
        } => cmd_deploy(&DeployArgs {
            file: &file,
            params: &params,
            state_dir: &state_dir,
            chain: chain.as_deref(),
            max_in_flight,
            timeout_ms,
        }),
        Commands::Status { state_dir, module } => cmd_status(&state_dir, module.as_deref()),
        Commands::Reset {
            state_dir,
            module,
            action,
        } => cmd_reset(&state_dir, &module, &action),
    }
}

fn cmd_init(path: &Path) -> Result<(), String> {
    let desc_path = path.join("ignis.yaml");
    if desc_path.exists() {
        return Err(format!("{} already exists", desc_path.display()));
    }

    let state_dir = path.join("state");
    std::fs::create_dir_all(&state_dir).map_err(|e| format!("cannot create state dir: {}", e))?;

    let template = r#"version: "1.0"
module: MyModule
description: "Managed by ignis"

parameters:
  initialSupply: { type: uint, default: "1000000" }

actions:
  token:
    contract: Token
    args: ["{{params.initialSupply}}"]

exports: [token]

policy:
  max_in_flight: 1
  timeout_ms: 60000
  tripwire: true
"#;
    std::fs::write(&desc_path, template)
        .map_err(|e| format!("cannot write {}: {}", desc_path.display(), e))?;

    println!("Initialized ignis project at {}", path.display());
    println!("  Created: {}", desc_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(())
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let desc = parser::parse_description_file(file)?;
    let errors = parser::validate_description(&desc);
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        return Err(format!("{} validation error(s)", errors.len()));
    }

    // Cycles only show up once references are wired.
    let module = parser::build_module(&desc).map_err(|e| e.to_string())?;
    planner::plan(&module).map_err(|e| e.to_string())?;

    println!(
        "OK: {} ({} parameters, {} actions, {} exports)",
        desc.module,
        desc.parameters.len(),
        desc.actions.len(),
        desc.exports.len()
    );
    Ok(())
}

/// Parse repeated `key=value` flags. Values stay strings; the resolver
/// coerces them to the declared parameter type.
fn parse_overrides(params: &[String]) -> Result<HashMap<String, Value>, String> {
    let mut overrides = HashMap::new();
    for raw in params {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| format!("invalid --param '{}': expected key=value", raw))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("invalid --param '{}': empty key", raw));
        }
        overrides.insert(key.to_string(), Value::String(value.to_string()));
    }
    Ok(overrides)
}

fn cmd_plan(file: &Path, params: &[String], state_dir: &Path) -> Result<(), String> {
    let (_, module) = parser::load_module(file)?;
    let overrides = parse_overrides(params)?;
    resolver::resolve_parameters(&module, &overrides).map_err(|e| e.to_string())?;

    let plan = planner::plan(&module).map_err(|e| e.to_string())?;
    let entries = FileJournal::new(state_dir)
        .load(&module.name)
        .map_err(|e| e.to_string())?;
    let review = planner::review(&module, &plan, &entries);

    print_plan(&review, &plan);
    Ok(())
}

fn disposition_symbol(disposition: Disposition) -> &'static str {
    match disposition {
        Disposition::Execute => "+",
        Disposition::Reuse => " ",
        Disposition::Reconcile => "?",
        Disposition::Retry => "~",
        Disposition::Bind => "=",
    }
}

/// Display a reviewed plan to stdout.
fn print_plan(review: &PlanReview, plan: &ExecutionPlan) {
    println!("Planning: {} ({} actions)", review.module, review.steps.len());
    println!();
    for step in &review.steps {
        println!(
            "  {} {:<40} {}",
            disposition_symbol(step.disposition),
            step.action_id.as_str(),
            step.description
        );
    }

    let concurrent: Vec<_> = plan
        .concurrent
        .iter()
        .filter(|(_, peers)| !peers.is_empty())
        .collect();
    if !concurrent.is_empty() {
        println!();
        println!("May run concurrently:");
        for (id, peers) in concurrent {
            let peers: Vec<&str> = peers.iter().map(|p| p.as_str()).collect();
            println!("  {} || {}", id, peers.join(", "));
        }
    }

    println!();
    println!(
        "Plan: {} to execute, {} to reuse, {} to reconcile, {} to retry.",
        review.to_execute, review.to_reuse, review.to_reconcile, review.to_retry
    );
}

struct DeployArgs<'a> {
    file: &'a Path,
    params: &'a [String],
    state_dir: &'a Path,
    chain: Option<&'a Path>,
    max_in_flight: Option<usize>,
    timeout_ms: Option<u64>,
}

fn cmd_deploy(args: &DeployArgs<'_>) -> Result<(), String> {
    let (desc, module) = parser::load_module(args.file)?;
    let overrides = parse_overrides(args.params)?;

    let mut policy = desc.policy.clone();
    if let Some(n) = args.max_in_flight {
        policy.max_in_flight = n;
    }
    if let Some(ms) = args.timeout_ms {
        policy.timeout_ms = ms;
    }

    let chain_path = args
        .chain
        .map(Path::to_path_buf)
        .unwrap_or_else(|| args.state_dir.join("chain.json"));
    let chain = Arc::new(LocalChain::load(&chain_path)?);
    let events = if policy.tripwire {
        EventLog::new(args.state_dir, &module.name)
    } else {
        EventLog::disabled()
    };
    let executor = Executor::new(chain.clone(), Arc::new(FileJournal::new(args.state_dir)))
        .with_policy(policy)
        .with_event_log(events);
    let cancel = executor.cancellation_token();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("cannot start runtime: {}", e))?;
    let outcome = runtime.block_on(async {
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; letting in-flight actions finish");
                cancel.cancel();
            }
        });
        let result = executor.run(&module, &overrides).await;
        interrupt.abort();
        result
    });

    // Whatever happened on chain must survive for the next run.
    chain.save(&chain_path)?;

    let report = match outcome {
        Ok(report) => report,
        Err(EngineError::AllActionsFailed { failed, report }) => {
            print_report(&report);
            return Err(format!("all attempted actions failed ({})", failed));
        }
        Err(e) => return Err(e.to_string()),
    };
    print_report(&report);

    if report.failed() > 0 {
        return Err(format!(
            "{} action(s) failed, {} skipped; rerun to resume",
            report.failed(),
            report.skipped()
        ));
    }
    if report.skipped() > 0 {
        return Err(format!(
            "deployment interrupted; {} action(s) not started, rerun to resume",
            report.skipped()
        ));
    }
    Ok(())
}

/// Display a run report to stdout.
fn print_report(report: &RunReport) {
    println!("Deploying: {} (run {})", report.module, report.run_id);
    println!();
    for (id, outcome) in &report.outcomes {
        println!("  {}: {}", id, outcome);
    }

    if !report.exports.is_empty() {
        println!();
        println!("Exports:");
        for (name, value) in &report.exports {
            println!("  {} = {}", name, value);
        }
    }

    let reused = report
        .outcomes
        .values()
        .filter(|o| matches!(o, ActionOutcome::Completed { reused: true, .. }))
        .count();
    println!();
    println!(
        "Deploy finished: {} completed ({} reused), {} failed, {} skipped ({:.1}s)",
        report.completed(),
        reused,
        report.failed(),
        report.skipped(),
        report.total_duration.as_secs_f64()
    );
}

fn cmd_status(state_dir: &Path, module_filter: Option<&str>) -> Result<(), String> {
    if !state_dir.exists() {
        println!("No state found. Run `ignis deploy` first.");
        return Ok(());
    }
    let dirents = std::fs::read_dir(state_dir)
        .map_err(|e| format!("cannot read state dir {}: {}", state_dir.display(), e))?;
    let mut modules: Vec<String> = dirents
        .flatten()
        .filter(|d| d.path().join("journal").is_dir())
        .map(|d| d.file_name().to_string_lossy().to_string())
        .filter(|name| module_filter.map(|f| f == name).unwrap_or(true))
        .collect();
    modules.sort();

    let journal = FileJournal::new(state_dir);
    let mut found = false;
    for module in &modules {
        let entries = journal.load(module).map_err(|e| e.to_string())?;
        if entries.is_empty() {
            continue;
        }
        found = true;
        let mut entries: Vec<_> = entries.into_values().collect();
        entries.sort_by(|a, b| a.action_id.cmp(&b.action_id));

        println!("Module: {} ({} entries)", module, entries.len());
        for entry in &entries {
            let mut line = format!(
                "    {}: {} attempts={}",
                entry.action_id, entry.status, entry.attempts
            );
            if let Some(result) = &entry.result {
                line.push_str(&format!(" result={}", result));
            }
            if let Some(external_ref) = &entry.external_ref {
                line.push_str(&format!(" ref={}", external_ref));
            }
            if let Some(error) = &entry.error {
                line.push_str(&format!(" error=\"{}\"", error));
            }
            println!("{}", line);
        }
        println!();
    }

    if !found {
        println!("No state found. Run `ignis deploy` first.");
    }
    Ok(())
}

fn cmd_reset(state_dir: &Path, module: &str, action: &str) -> Result<(), String> {
    let journal = FileJournal::new(state_dir);
    let entries = journal.load(module).map_err(|e| e.to_string())?;
    let id = entries
        .keys()
        .find(|id| id.as_str() == action)
        .cloned()
        .ok_or_else(|| format!("no journal entry for {} in module {}", action, module))?;

    let previous = journal.reset(module, &id).map_err(|e| e.to_string())?;
    let was = previous
        .map(|p| p.status)
        .unwrap_or(ActionStatus::Pending);
    println!("Reset {}: {} -> {}", id, was, ActionStatus::Pending);
    Ok(())
}
