//! Pipeline orchestrator: the stage state machine.
//!
//! This module provides the `PipelineOrchestrator` that drives one run:
//! - Creates the run directory and takes its lease
//! - Plans reuse from a predecessor run when resuming
//! - Executes stages strictly in order, journaling a stage entry for each
//! - Applies the partial-analysis policy
//! - Writes `run.json`, artifact copies and the README

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use super::config::{ConfigError, PipelineConfig};
use super::resume::{ResumeController, ResumeError, ResumePlan, ResumeRequest, ReusedStage};
use super::run::{new_run_id, CancellationFlag, Run, RunFailure, RunLayout, RunPaths, RunStatus, StageName};
use super::spec::ExperimentSpec;
use super::stages::{
    load_json, statistics, StageContext, StageError, StageExecutor, StageInputs, StageOutcome,
    StageRegistry, StatisticalPackage,
};
use crate::error::ErrorKind;
use crate::llm::ModelGateway;
use crate::metrics::MetricsCollector;
use crate::provenance::{
    render_readme, EntryStatus, LeaseError, Manifest, ManifestEntry, ManifestError, ManifestJournal, RunLease,
};
use crate::storage::{write_atomic, ArtifactHandle, ArtifactKind, ArtifactStore, StorageError};

/// Exit code for a completed run whose analysis was partial but tolerated.
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_VALIDATION: i32 = 2;
pub const EXIT_CONFIG: i32 = 3;
/// Hard failures add the stage index to this base.
pub const EXIT_STAGE_BASE: i32 = 10;
pub const EXIT_CORRUPT: i32 = 20;
pub const EXIT_CANCELLED: i32 = 130;

/// Process exit code for a failure of `kind`, raised in `stage` if known.
pub fn exit_code_for(kind: ErrorKind, stage: Option<StageName>) -> i32 {
    match kind {
        ErrorKind::Validation => EXIT_VALIDATION,
        ErrorKind::Config => EXIT_CONFIG,
        ErrorKind::CorruptArtifact => EXIT_CORRUPT,
        ErrorKind::Cancelled => EXIT_CANCELLED,
        _ => EXIT_STAGE_BASE + stage.map(|s| s.index() as i32).unwrap_or(0),
    }
}

/// Errors that prevent a run from being driven at all.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The run directory is owned by another process.
    #[error("Lease error: {0}")]
    Lease(#[from] LeaseError),

    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The manifest could not be written.
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Resume planning failed.
    #[error("Resume error: {0}")]
    Resume(#[from] ResumeError),

    /// No executor registered for a stage.
    #[error("No executor registered for stage {0}")]
    MissingExecutor(StageName),

    /// A run was aborted by an error raised while `stage` was active.
    #[error("{stage}: {source}")]
    InStage {
        stage: StageName,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Config(_) | PipelineError::MissingExecutor(_) => ErrorKind::Config,
            PipelineError::Lease(e) => e.kind(),
            PipelineError::Storage(e) => e.kind(),
            PipelineError::Manifest(e) => e.kind(),
            PipelineError::Resume(e) => e.kind(),
            PipelineError::InStage { source, .. } => source.kind(),
        }
    }

    /// Stage that was active when the error was raised, if a run had started.
    pub fn stage(&self) -> Option<StageName> {
        match self {
            PipelineError::InStage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub fn exit_code(&self) -> i32 {
        exit_code_for(self.kind(), self.stage())
    }

    fn in_stage(self, stage: StageName) -> Self {
        match self {
            PipelineError::InStage { .. } => self,
            other => PipelineError::InStage {
                stage,
                source: Box::new(other),
            },
        }
    }
}

/// How far a run goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTarget {
    /// Through Finalization.
    #[default]
    Full,
    /// Stop after StatisticalPreparation (the offramp).
    StatisticalPrep,
}

impl RunTarget {
    pub fn last_stage(self) -> StageName {
        match self {
            RunTarget::Full => StageName::Finalization,
            RunTarget::StatisticalPrep => StageName::StatisticalPreparation,
        }
    }
}

/// Options for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub target: RunTarget,
    /// Create the run under `workbench/runs`.
    pub workbench: bool,
    /// Reuse a predecessor's verified artifacts.
    pub resume: Option<ResumeRequest>,
    pub cancel: CancellationFlag,
}

/// One stage line of a [`RunReport`].
#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    pub stage: StageName,
    pub status: EntryStatus,
    pub outputs: usize,
    pub cache_hit: bool,
    pub duration_ms: u64,
    pub cost: Option<f64>,
}

/// Result of a run that was driven to an end state.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run: Run,
    pub run_dir: PathBuf,
    pub stages: Vec<StageSummary>,
    pub total_cost: f64,
    /// Analysis was partial and the run continued anyway.
    pub tolerated_partial: bool,
    pub exit_code: i32,
}

impl RunReport {
    fn new(run: Run, paths: &RunPaths, manifest: &Manifest, tolerated_partial: bool) -> Self {
        let stages = manifest
            .entries
            .iter()
            .filter(|e| e.unit.is_none())
            .map(|e| StageSummary {
                stage: e.stage,
                status: e.status,
                outputs: e.outputs.len(),
                cache_hit: e.cache_hit,
                duration_ms: e.duration_ms,
                cost: e.cost,
            })
            .collect();

        let exit_code = match run.status {
            RunStatus::Completed if tolerated_partial => EXIT_PARTIAL,
            RunStatus::Completed => 0,
            RunStatus::Paused => EXIT_CANCELLED,
            RunStatus::Failed | RunStatus::Running => run
                .failure
                .as_ref()
                .map(|f| exit_code_for(f.kind, Some(f.stage)))
                .unwrap_or(EXIT_STAGE_BASE),
        };

        Self {
            run_dir: paths.dir().to_path_buf(),
            stages,
            total_cost: manifest.total_cost(),
            tolerated_partial,
            exit_code,
            run,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }
}

/// How a stage ended, as seen by the state machine.
enum StageStep {
    Continue,
    Halt,
}

/// Drives experiment runs.
pub struct PipelineOrchestrator {
    layout: RunLayout,
    config: PipelineConfig,
    gateway: Arc<ModelGateway>,
    registry: StageRegistry,
    metrics: MetricsCollector,
}

impl PipelineOrchestrator {
    /// Creates an orchestrator for the experiment at `experiment_dir`.
    pub fn new(experiment_dir: impl Into<PathBuf>, config: PipelineConfig, gateway: Arc<ModelGateway>) -> Self {
        Self {
            layout: RunLayout::new(experiment_dir),
            config,
            gateway,
            registry: StageRegistry::standard(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Replaces the stage executors.
    pub fn with_registry(mut self, registry: StageRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    /// Executes a new run of `spec`.
    ///
    /// Failures inside stages end the run with status `failed` and are
    /// reported through [`RunReport`]; an `Err` means no run could be driven.
    pub async fn run(&self, spec: Arc<ExperimentSpec>, options: RunOptions) -> Result<RunReport, PipelineError> {
        self.config.validate()?;
        let target = options.target.last_stage();
        let executors = StageName::through(target)
            .map(|stage| {
                self.registry
                    .get(stage)
                    .map(|executor| (stage, executor))
                    .ok_or(PipelineError::MissingExecutor(stage))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        let store = ArtifactStore::open(self.layout.store_root()).await?;
        let plan = match &options.resume {
            Some(request) => Some(
                ResumeController::new(&self.layout, &store)
                    .plan(&spec, request, target)
                    .await?,
            ),
            None => None,
        };

        let run_id = new_run_id(Utc::now());
        let paths = self.layout.run_paths(&run_id, options.workbench);
        let lease = RunLease::acquire(paths.lease(), &run_id)?;

        let parent = plan.as_ref().map(|p| p.parent_run_id.clone());
        let mut run = Run::new(
            run_id.clone(),
            spec.name.clone(),
            spec.spec_hash().to_string(),
            target,
            parent.clone(),
            options.workbench,
        );
        if let Some(plan) = plan.as_ref().filter(|p| p.spec_changed) {
            run.warnings.push(format!(
                "Experiment changed since run {}; nothing was reused",
                plan.parent_run_id
            ));
        }
        run.save(&paths.run_record()).await?;

        let journal =
            ManifestJournal::create(paths.manifest(), Manifest::new(&run_id, spec.spec_hash(), parent)).await?;

        info!(
            run_id = %run_id,
            experiment = %spec.name,
            target = %target,
            parent = ?run.parent_run_id,
            workbench = options.workbench,
            "Starting run"
        );

        let ctx = StageContext {
            run_id: run_id.clone(),
            spec: spec.clone(),
            store,
            gateway: self.gateway.clone(),
            config: self.config.clone(),
            journal: journal.clone(),
            cancel: options.cancel.clone(),
            paths: paths.clone(),
            target,
            metrics: self.metrics.clone(),
        };

        let mut tolerated_partial = false;
        let driven = self
            .drive(&ctx, &executors, plan, &mut run, &mut tolerated_partial)
            .await
            .map_err(|e| e.in_stage(run.current_stage.unwrap_or(StageName::PreflightValidation)));

        if let Err(e) = &driven {
            error!(run_id = %run_id, error = %e, "Run aborted");
            let stage = e.stage().unwrap_or(StageName::PreflightValidation);
            run.fail(RunFailure {
                stage,
                kind: e.kind(),
                message: e.to_string(),
                entry_seq: None,
            });
        } else if run.status == RunStatus::Running {
            run.finish(RunStatus::Completed);
        }
        run.save(&paths.run_record()).await?;

        let manifest = journal.snapshot().await;
        self.write_readme(&run, &manifest, &paths).await;
        drop(lease);
        driven?;

        let report = RunReport::new(run, &paths, &manifest, tolerated_partial);
        info!(
            run_id = %run_id,
            status = %report.run.status,
            cost = report.total_cost,
            exit_code = report.exit_code,
            "Run finished"
        );
        Ok(report)
    }

    async fn drive(
        &self,
        ctx: &StageContext,
        executors: &BTreeMap<StageName, Arc<dyn StageExecutor>>,
        plan: Option<ResumePlan>,
        run: &mut Run,
        tolerated_partial: &mut bool,
    ) -> Result<(), PipelineError> {
        let (mut reused, start_stage, mut preresolved) = match plan {
            Some(plan) => (plan.reused, plan.start_stage, plan.preresolved),
            None => (BTreeMap::new(), Some(StageName::Analysis), BTreeMap::new()),
        };
        let mut artifacts: BTreeMap<StageName, Vec<ArtifactHandle>> = BTreeMap::new();

        for (&stage, executor) in executors {
            if ctx.cancel.is_cancelled() {
                warn!(run_id = %ctx.run_id, stage = %stage, "Cancelled before stage start");
                ctx.journal
                    .append(
                        ManifestEntry::for_stage(stage, Utc::now())
                            .with_error(ErrorKind::Cancelled, "run cancelled before the stage started")
                            .finish(EntryStatus::Cancelled, Utc::now()),
                    )
                    .await?;
                run.finish(RunStatus::Paused);
                return Ok(());
            }

            run.current_stage = Some(stage);
            run.save(&ctx.paths.run_record()).await?;

            let reuse = match start_stage {
                Some(start) if stage >= start => None,
                _ if stage == StageName::PreflightValidation => None,
                _ => reused.remove(&stage),
            };
            let started_at = Utc::now();
            let clock = Instant::now();

            let result = match reuse {
                Some(previous) => self.reuse_stage(ctx, stage, previous).await,
                None => {
                    let inputs = StageInputs {
                        artifacts: artifacts.clone(),
                        preresolved: if Some(stage) == start_stage {
                            std::mem::take(&mut preresolved)
                        } else {
                            BTreeMap::new()
                        },
                    };
                    info!(run_id = %ctx.run_id, stage = %stage, "Executing stage");
                    executor.execute(ctx, &inputs).await
                }
            };

            let step = match result {
                Ok(outcome) => {
                    let outputs = outcome.outputs.clone();
                    let step = self
                        .record_outcome(ctx, stage, outcome, started_at, run, tolerated_partial)
                        .await?;
                    self.copy_artifacts(ctx, &outputs).await?;
                    artifacts.insert(stage, outputs);
                    step
                }
                Err(e) => self.record_failure(ctx, stage, e, started_at, run).await?,
            };

            let status = match &step {
                StageStep::Continue => "completed",
                StageStep::Halt => run.status.as_str(),
            };
            self.metrics
                .record_stage(stage.as_str(), status, clock.elapsed().as_secs_f64());

            if let StageStep::Halt = step {
                return Ok(());
            }
        }

        Ok(())
    }

    /// Carries a predecessor's stage over. Run-directory files that the
    /// executor would have written are materialized from the store.
    async fn reuse_stage(
        &self,
        ctx: &StageContext,
        stage: StageName,
        previous: ReusedStage,
    ) -> Result<StageOutcome, StageError> {
        info!(run_id = %ctx.run_id, stage = %stage, outputs = previous.outputs.len(), "Reusing stage");

        for handle in &previous.outputs {
            match handle.kind {
                ArtifactKind::StatisticalPackage => {
                    let package: StatisticalPackage = load_json(&ctx.store, &handle.hash).await?;
                    statistics::write_exports(ctx, package).await?;
                }
                ArtifactKind::DeliveryBundle => {
                    let bytes = ctx.store.get_verified(&handle.hash).await?;
                    let path = ctx.paths.bundle();
                    write_atomic(&path, &bytes)
                        .await
                        .map_err(|e| StageError::Export(format!("{}: {}", path.display(), e)))?;
                }
                _ => {}
            }
        }

        let mut outcome = StageOutcome::success(previous.inputs, previous.outputs).cache_hit(true);
        outcome.status = EntryStatus::Reused;
        outcome.fingerprint = previous.fingerprint;
        outcome.failures = previous.failures;
        Ok(outcome)
    }

    async fn record_outcome(
        &self,
        ctx: &StageContext,
        stage: StageName,
        outcome: StageOutcome,
        started_at: chrono::DateTime<Utc>,
        run: &mut Run,
        tolerated_partial: &mut bool,
    ) -> Result<StageStep, PipelineError> {
        let mut entry = ManifestEntry::for_stage(stage, started_at)
            .with_inputs(outcome.inputs)
            .with_outputs(outcome.outputs.iter().map(|h| h.hash.clone()).collect())
            .with_model(outcome.model_used)
            .with_attempts(outcome.attempts)
            .with_cost(outcome.cost)
            .cache_hit(outcome.cache_hit);
        if let Some(fingerprint) = outcome.fingerprint {
            entry = entry.with_fingerprint(fingerprint);
        }

        let failed_units: Vec<&str> = outcome.failures.iter().map(|f| f.unit.as_str()).collect();
        if let Some(first) = outcome.failures.first() {
            entry = entry.with_error(
                first.kind,
                format!("{} unit(s) failed: {}", failed_units.len(), failed_units.join(", ")),
            );
        }
        let seq = ctx.journal.append(entry.finish(outcome.status, Utc::now())).await?;

        let message = format!("{} incomplete: document(s) {} failed", stage, failed_units.join(", "));
        if outcome.status == EntryStatus::Reused && !failed_units.is_empty() {
            warn!(run_id = %ctx.run_id, stage = %stage, failed = ?failed_units, "Reused partial results");
            run.warnings.push(message);
            *tolerated_partial = true;
            return Ok(StageStep::Continue);
        }
        if outcome.status != EntryStatus::Partial {
            return Ok(StageStep::Continue);
        }

        if ctx.spec.models.tolerate_partial {
            warn!(run_id = %ctx.run_id, stage = %stage, failed = ?failed_units, "Continuing with partial results");
            run.warnings.push(message);
            *tolerated_partial = true;
            return Ok(StageStep::Continue);
        }

        warn!(run_id = %ctx.run_id, stage = %stage, failed = ?failed_units, "Partial results not tolerated; halting");
        let kind = outcome
            .failures
            .first()
            .map(|f| f.kind)
            .unwrap_or(ErrorKind::AllCandidatesExhausted);
        run.fail(RunFailure {
            stage,
            kind,
            message,
            entry_seq: outcome.failures.first().map(|f| f.entry_seq).or(Some(seq)),
        });
        Ok(StageStep::Halt)
    }

    async fn record_failure(
        &self,
        ctx: &StageContext,
        stage: StageName,
        e: StageError,
        started_at: chrono::DateTime<Utc>,
        run: &mut Run,
    ) -> Result<StageStep, PipelineError> {
        let kind = e.kind();
        let message = e.to_string();
        let status = if kind == ErrorKind::Cancelled {
            EntryStatus::Cancelled
        } else {
            EntryStatus::Failed
        };

        let mut entry = ManifestEntry::for_stage(stage, started_at).with_error(kind, &message);
        if let StageError::Gateway(gateway_error) = &e {
            entry = entry.with_attempts(gateway_error.attempts().to_vec());
        }
        let seq = ctx.journal.append(entry.finish(status, Utc::now())).await?;

        if status == EntryStatus::Cancelled {
            warn!(run_id = %ctx.run_id, stage = %stage, "Run paused: {}", message);
            run.finish(RunStatus::Paused);
            return Ok(StageStep::Halt);
        }

        error!(run_id = %ctx.run_id, stage = %stage, kind = %kind, "Stage failed: {}", message);
        let entry_seq = match &e {
            StageError::AllUnitsFailed { failures, .. } => failures.first().map(|f| f.entry_seq),
            _ => Some(seq),
        };
        run.fail(RunFailure {
            stage,
            kind,
            message,
            entry_seq,
        });
        Ok(StageStep::Halt)
    }

    /// Copies artifacts into the run directory, verifying each.
    async fn copy_artifacts(&self, ctx: &StageContext, handles: &[ArtifactHandle]) -> Result<(), PipelineError> {
        for handle in handles {
            let path = ctx.paths.artifact(&handle.hash);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                continue;
            }
            let bytes = ctx.store.get_verified(&handle.hash).await?;
            write_atomic(&path, &bytes)
                .await
                .map_err(|e| StorageError::Io { path: path.clone(), source: e })?;
        }
        Ok(())
    }

    async fn write_readme(&self, run: &Run, manifest: &Manifest, paths: &RunPaths) {
        let path = paths.readme();
        let rendered = match render_readme(run, manifest) {
            Ok(text) => text,
            Err(e) => {
                warn!(run_id = %run.run_id, error = %e, "Failed to render README");
                return;
            }
        };
        if let Err(e) = write_atomic(&path, rendered.as_bytes()).await {
            warn!(path = %path.display(), error = %e, "Failed to write README");
        }
    }
}
