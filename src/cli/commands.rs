//! CLI command definitions for analysis-forge.
//!
//! Every command works on an experiment directory. Commands return the
//! process exit code; errors that escape a command are mapped to one too.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{ErrorKind, ValidationIssue};
use crate::llm::{CapabilityMatrix, ModelGateway};
use crate::metrics::{export_metrics, init_metrics};
use crate::pipeline::orchestrator::{exit_code_for, EXIT_STAGE_BASE};
use crate::pipeline::resume::{ResumeController, ResumeError, ResumeRequest};
use crate::pipeline::run::{CancellationFlag, Run, RunLayout, StageName};
use crate::pipeline::stages::validate_spec;
use crate::pipeline::{
    ConfigError, ExperimentSpec, PipelineConfig, PipelineError, PipelineOrchestrator, RunOptions, RunReport,
    RunTarget,
};
use crate::storage::ArtifactStore;

/// Reproducible LLM corpus-analysis pipeline.
#[derive(Parser)]
#[command(name = "analysis-forge")]
#[command(about = "Run reproducible LLM corpus-analysis experiments")]
#[command(version)]
#[command(
    long_about = "analysis-forge drives an experiment directory through validation, per-document analysis, statistical preparation, synthesis and finalization.\n\nEvery artifact is content-addressed and every step is recorded in the run manifest, so failed runs can be resumed without repeating paid work.\n\nExample usage:\n  analysis-forge run ./my-experiment --statistical-prep"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Start a new run of an experiment.
    Run(RunArgs),

    /// Start a new run that reuses the verified work of an earlier one.
    Resume(ResumeArgs),

    /// Check an experiment without running anything.
    Validate(ValidateArgs),

    /// Move a completed workbench run into the operational runs directory.
    Promote(PromoteArgs),

    /// List runs of an experiment.
    Status(StatusArgs),
}

/// Flags shared by commands that execute stages.
#[derive(clap::Args, Debug, Clone)]
pub struct ExecutionArgs {
    /// Allow models marked experimental in the capability matrix.
    #[arg(long)]
    pub allow_experimental: bool,

    /// Continue past an analysis stage with failed documents.
    #[arg(long)]
    pub tolerate_partial: bool,

    /// Maximum documents analysed concurrently.
    #[arg(long, env = "FORGE_MAX_CONCURRENT_UNITS")]
    pub max_concurrency: Option<usize>,

    /// Write a Prometheus text snapshot here when the run ends.
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,

    /// Output a JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `analysis-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Experiment directory.
    pub dir: PathBuf,

    /// Stop after statistical preparation.
    #[arg(long, conflicts_with = "resume_from_stats")]
    pub statistical_prep: bool,

    /// Reuse the latest run's statistical package and continue with synthesis.
    #[arg(long)]
    pub resume_from_stats: bool,

    /// Create the run under workbench/runs.
    #[arg(long)]
    pub workbench: bool,

    #[command(flatten)]
    pub exec: ExecutionArgs,
}

/// Arguments for `analysis-forge resume`.
#[derive(Parser, Debug)]
pub struct ResumeArgs {
    /// Experiment directory.
    pub dir: PathBuf,

    /// Run to resume. Defaults to the latest run of the same experiment.
    #[arg(long)]
    pub run_id: Option<String>,

    /// Resume a workbench run; the new run is also a workbench run.
    #[arg(long)]
    pub workbench: bool,

    /// Stop after statistical preparation.
    #[arg(long)]
    pub statistical_prep: bool,

    /// Remove the predecessor's lease even if its holder looks alive.
    #[arg(long)]
    pub break_lease: bool,

    #[command(flatten)]
    pub exec: ExecutionArgs,
}

/// Arguments for `analysis-forge validate`.
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Experiment directory.
    pub dir: PathBuf,

    /// Only check what a `--statistical-prep` run needs.
    #[arg(long)]
    pub statistical_prep: bool,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `analysis-forge promote`.
#[derive(Parser, Debug)]
pub struct PromoteArgs {
    /// Experiment directory.
    pub dir: PathBuf,

    /// Workbench run to promote. Defaults to the latest completed one.
    #[arg(long)]
    pub run_id: Option<String>,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `analysis-forge status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Experiment directory.
    pub dir: PathBuf,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the parsed command and return the process exit code.
pub async fn run_with_cli(cli: Cli) -> i32 {
    let result = match cli.command {
        Commands::Run(args) => run_run_command(args).await,
        Commands::Resume(args) => run_resume_command(args).await,
        Commands::Validate(args) => run_validate_command(args).await,
        Commands::Promote(args) => run_promote_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_code_of(&e)
        }
    }
}

/// Maps an error that escaped a command to an exit code.
fn exit_code_of(err: &anyhow::Error) -> i32 {
    if let Some(e) = err.downcast_ref::<PipelineError>() {
        return e.exit_code();
    }
    if let Some(e) = err.downcast_ref::<ResumeError>() {
        return exit_code_for(e.kind(), None);
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return exit_code_for(ErrorKind::Config, None);
    }
    EXIT_STAGE_BASE
}

// ============================================================================
// Shared setup
// ============================================================================

fn load_spec(dir: &Path, exec: Option<&ExecutionArgs>) -> anyhow::Result<ExperimentSpec> {
    let spec = ExperimentSpec::load(dir)?;
    let Some(exec) = exec else {
        return Ok(spec);
    };
    Ok(spec.with_settings(|m| {
        m.allow_experimental |= exec.allow_experimental;
        m.tolerate_partial |= exec.tolerate_partial;
    }))
}

fn load_gateway(spec: &ExperimentSpec, config: &PipelineConfig) -> anyhow::Result<Arc<ModelGateway>> {
    let matrix_path = spec.matrix_path();
    let matrix = CapabilityMatrix::load(&matrix_path).map_err(ConfigError::from)?;
    info!(path = %matrix_path.display(), "Loaded capability matrix");
    Ok(Arc::new(ModelGateway::from_matrix(
        Arc::new(matrix),
        config.gateway_config(),
    )))
}

fn pipeline_config(exec: &ExecutionArgs) -> anyhow::Result<PipelineConfig> {
    let mut config = PipelineConfig::from_env()?;
    if let Some(n) = exec.max_concurrency {
        config = config.with_max_concurrent_units(n);
    }
    config.validate()?;
    Ok(config)
}

/// Cancels the run on Ctrl-C. In-flight units finish; the run pauses.
fn cancel_on_ctrl_c() -> CancellationFlag {
    let flag = CancellationFlag::new();
    let handle = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight work and pausing the run");
            handle.cancel();
        }
    });
    flag
}

async fn execute(dir: &Path, spec: ExperimentSpec, exec: &ExecutionArgs, options: RunOptions) -> anyhow::Result<i32> {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics unavailable");
    }

    let config = pipeline_config(exec)?;
    let gateway = load_gateway(&spec, &config)?;
    let orchestrator = PipelineOrchestrator::new(dir, config, gateway.clone());

    let report = orchestrator.run(Arc::new(spec), options).await?;

    if let Some(path) = &exec.metrics_out {
        std::fs::write(path, export_metrics()).with_context(|| format!("writing {}", path.display()))?;
    }

    print_report(&report, exec.json, &gateway)?;
    Ok(report.exit_code())
}

fn print_report(report: &RunReport, json: bool, gateway: &ModelGateway) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let run = &report.run;
    println!("Run {} {}", run.run_id, run.status);
    println!("  Directory: {}", report.run_dir.display());
    if let Some(parent) = &run.parent_run_id {
        println!("  Resumed from: {}", parent);
    }
    for stage in &report.stages {
        println!(
            "  {:<24} {:<10} outputs={:<3} cache_hit={:<5} {}ms",
            stage.stage.as_str(),
            stage.status.as_str(),
            stage.outputs,
            stage.cache_hit,
            stage.duration_ms
        );
    }
    println!("  Estimated cost: ${:.4}", report.total_cost);
    for (model, spent) in gateway.cost_tracker().report().by_model {
        println!("    {}: ${:.4}", model, spent);
    }
    for warning in &run.warnings {
        println!("  warning: {}", warning);
    }
    if let Some(failure) = &run.failure {
        println!("  Failed in {} ({}): {}", failure.stage, failure.kind, failure.message);
    }
    println!("  Exit code: {}", report.exit_code());
    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

async fn run_run_command(args: RunArgs) -> anyhow::Result<i32> {
    let spec = load_spec(&args.dir, Some(&args.exec))?;
    let target = if args.statistical_prep {
        RunTarget::StatisticalPrep
    } else {
        RunTarget::Full
    };
    let resume = args.resume_from_stats.then(|| {
        ResumeRequest::latest()
            .from_stage(StageName::Synthesis)
            .workbench(args.workbench)
    });

    let options = RunOptions {
        target,
        workbench: args.workbench,
        resume,
        cancel: cancel_on_ctrl_c(),
    };
    execute(&args.dir, spec, &args.exec, options).await
}

async fn run_resume_command(args: ResumeArgs) -> anyhow::Result<i32> {
    let spec = load_spec(&args.dir, Some(&args.exec))?;
    let request = ResumeRequest {
        run_id: args.run_id.clone(),
        from_stage: None,
        workbench: args.workbench,
        break_lease: args.break_lease,
    };
    let options = RunOptions {
        target: if args.statistical_prep {
            RunTarget::StatisticalPrep
        } else {
            RunTarget::Full
        },
        workbench: args.workbench,
        resume: Some(request),
        cancel: cancel_on_ctrl_c(),
    };
    execute(&args.dir, spec, &args.exec, options).await
}

#[derive(Serialize)]
struct ValidateOutput<'a> {
    experiment: &'a str,
    spec_hash: &'a str,
    documents: usize,
    valid: bool,
    issues: &'a [ValidationIssue],
}

async fn run_validate_command(args: ValidateArgs) -> anyhow::Result<i32> {
    let spec = load_spec(&args.dir, None)?;
    let config = PipelineConfig::from_env()?;
    let gateway = load_gateway(&spec, &config)?;
    let through = if args.statistical_prep {
        StageName::StatisticalPreparation
    } else {
        StageName::Finalization
    };

    let issues = validate_spec(&spec, &gateway, through);
    let output = ValidateOutput {
        experiment: &spec.name,
        spec_hash: spec.spec_hash(),
        documents: spec.documents.len(),
        valid: issues.is_empty(),
        issues: &issues,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if issues.is_empty() {
        println!("✓ {} is valid ({} documents)", spec.name, spec.documents.len());
    } else {
        println!("✗ {} has {} issue(s):", spec.name, issues.len());
        for issue in &issues {
            println!("  - {}", issue);
        }
    }

    Ok(if issues.is_empty() {
        0
    } else {
        exit_code_for(ErrorKind::Validation, None)
    })
}

async fn run_promote_command(args: PromoteArgs) -> anyhow::Result<i32> {
    let layout = RunLayout::new(&args.dir);
    let store = ArtifactStore::open(layout.store_root()).await?;
    let report = ResumeController::new(&layout, &store)
        .promote(args.run_id.as_deref())
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("✓ Promoted run {}", report.run_id);
        println!("  Destination: {}", report.destination.display());
        println!("  Artifacts verified: {}", report.artifacts);
        println!("  Files copied: {}", report.files);
    }
    Ok(0)
}

#[derive(Serialize)]
struct StatusEntry<'a> {
    scope: &'static str,
    #[serde(flatten)]
    run: &'a Run,
}

async fn run_status_command(args: StatusArgs) -> anyhow::Result<i32> {
    let layout = RunLayout::new(&args.dir);
    let operational = layout.list_runs(false).await?;
    let workbench = layout.list_runs(true).await?;

    let entries: Vec<StatusEntry> = operational
        .iter()
        .map(|run| StatusEntry { scope: "runs", run })
        .chain(workbench.iter().map(|run| StatusEntry {
            scope: "workbench",
            run,
        }))
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(0);
    }

    if entries.is_empty() {
        println!("No runs under {}", args.dir.display());
        return Ok(0);
    }
    println!("{:<30} {:<10} {:<10} {:<24} PARENT", "RUN", "SCOPE", "STATUS", "STAGE");
    for entry in &entries {
        let run = entry.run;
        println!(
            "{:<30} {:<10} {:<10} {:<24} {}",
            run.run_id,
            entry.scope,
            run.status.as_str(),
            run.current_stage.map(|s| s.as_str()).unwrap_or("-"),
            run.parent_run_id.as_deref().unwrap_or("-")
        );
    }
    Ok(0)
}
