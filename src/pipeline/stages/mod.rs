//! Stage executors.
//!
//! Each pipeline stage is a [`StageExecutor`]: a function of the experiment
//! spec and the artifacts of earlier stages that produces new artifacts. The
//! orchestrator resolves executors from a [`StageRegistry`] when the run
//! starts and drives them strictly in [`StageName`] order.
//!
//! Executors consult the artifact store before doing expensive work, journal
//! one manifest entry per work unit as it resolves, and leave the
//! stage-level entry to the orchestrator.

pub mod analysis;
pub mod finalization;
pub mod statistics;
pub mod synthesis;
pub mod validation;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use super::config::PipelineConfig;
use super::run::{CancellationFlag, RunPaths, StageName};
use super::spec::ExperimentSpec;
use crate::error::{ErrorKind, ValidationError};
use crate::llm::{AttemptRecord, GatewayError, ModelGateway};
use crate::metrics::MetricsCollector;
use crate::provenance::{EntryStatus, ManifestError, ManifestJournal};
use crate::storage::{
    canonical_json_pretty, ArtifactHandle, ArtifactKind, ArtifactStore, ContentHash, Fingerprint,
    PutRequest, StorageError,
};

pub use analysis::{AnalysisRecord, AnalysisStage};
pub use finalization::FinalizationStage;
pub use statistics::{StatisticalPackage, StatisticsStage};
pub use synthesis::{SynthesisReport, SynthesisStage};
pub use validation::{validate_spec, ValidationStage};

/// Artifact kind produced by each stage.
pub fn artifact_kind(stage: StageName) -> ArtifactKind {
    match stage {
        StageName::PreflightValidation => ArtifactKind::ValidationReport,
        StageName::Analysis => ArtifactKind::RawAnalysis,
        StageName::StatisticalPreparation => ArtifactKind::StatisticalPackage,
        StageName::Synthesis => ArtifactKind::SynthesisReport,
        StageName::Finalization => ArtifactKind::DeliveryBundle,
    }
}

/// A work unit that did not produce an artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitFailure {
    pub unit: String,
    pub kind: ErrorKind,
    pub message: String,
    /// Manifest entry recording the failure.
    pub entry_seq: u64,
}

/// Errors that end a stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Every work unit of the stage failed.
    #[error("All {} work unit(s) of {stage} failed", failures.len())]
    AllUnitsFailed {
        stage: StageName,
        failures: Vec<UnitFailure>,
    },

    /// Cancellation stopped the stage before every unit ran.
    #[error("{stage} cancelled: {completed} unit(s) finished, {cancelled} not started")]
    Cancelled {
        stage: StageName,
        completed: usize,
        cancelled: usize,
    },

    /// A stored input could not be interpreted.
    #[error("Invalid input artifact {hash}: {message}")]
    InvalidInput { hash: ContentHash, message: String },

    /// A required input is missing from earlier stages.
    #[error("{stage} is missing its input: {message}")]
    MissingInput { stage: StageName, message: String },

    /// Writing an export file failed.
    #[error("Export failed: {0}")]
    Export(String),
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Validation(_) => ErrorKind::Validation,
            StageError::Storage(e) => e.kind(),
            StageError::Manifest(e) => e.kind(),
            StageError::Gateway(e) => e.kind(),
            StageError::AllUnitsFailed { failures, .. } => {
                let first = failures
                    .first()
                    .map(|f| f.kind)
                    .unwrap_or(ErrorKind::AllCandidatesExhausted);
                if failures.iter().all(|f| f.kind == first) {
                    first
                } else {
                    ErrorKind::AllCandidatesExhausted
                }
            }
            StageError::Cancelled { .. } => ErrorKind::Cancelled,
            StageError::InvalidInput { .. } => ErrorKind::CorruptArtifact,
            StageError::MissingInput { .. } => ErrorKind::Config,
            StageError::Export(_) => ErrorKind::StorageIo,
        }
    }
}

/// Everything a stage may use. Cheap to clone.
#[derive(Clone)]
pub struct StageContext {
    pub run_id: String,
    pub spec: Arc<ExperimentSpec>,
    pub store: ArtifactStore,
    pub gateway: Arc<ModelGateway>,
    pub config: PipelineConfig,
    pub journal: ManifestJournal,
    pub cancel: CancellationFlag,
    pub paths: RunPaths,
    /// Last stage the run will execute.
    pub target: StageName,
    pub metrics: MetricsCollector,
}

/// Inputs handed to one stage execution.
#[derive(Debug, Clone, Default)]
pub struct StageInputs {
    /// Outputs of every earlier stage, executed or reused.
    pub artifacts: BTreeMap<StageName, Vec<ArtifactHandle>>,
    /// Work units of this stage already resolved by a parent run, keyed by
    /// unit id. Their artifacts have been verified.
    pub preresolved: BTreeMap<String, ArtifactHandle>,
}

impl StageInputs {
    pub fn outputs_of(&self, stage: StageName) -> &[ArtifactHandle] {
        self.artifacts.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The single artifact an earlier stage produced.
    pub fn single_output(&self, of: StageName, for_stage: StageName) -> Result<&ArtifactHandle, StageError> {
        match self.outputs_of(of) {
            [handle] => Ok(handle),
            other => Err(StageError::MissingInput {
                stage: for_stage,
                message: format!("expected one {} artifact, found {}", of, other.len()),
            }),
        }
    }
}

/// Result of a stage that did not fail outright.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    /// `Success` or `Partial`.
    pub status: EntryStatus,
    pub inputs: Vec<ContentHash>,
    pub outputs: Vec<ArtifactHandle>,
    pub fingerprint: Option<Fingerprint>,
    pub failures: Vec<UnitFailure>,
    pub model_used: Option<String>,
    pub attempts: Vec<AttemptRecord>,
    /// Stage total spend.
    pub cost: Option<f64>,
    pub cache_hit: bool,
}

impl StageOutcome {
    pub fn success(inputs: Vec<ContentHash>, outputs: Vec<ArtifactHandle>) -> Self {
        Self {
            status: EntryStatus::Success,
            inputs,
            outputs,
            fingerprint: None,
            failures: Vec::new(),
            model_used: None,
            attempts: Vec::new(),
            cost: None,
            cache_hit: false,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    pub fn cache_hit(mut self, hit: bool) -> Self {
        self.cache_hit = hit;
        self
    }
}

/// One pipeline stage.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    fn stage(&self) -> StageName;

    /// Whether identical inputs always reproduce identical outputs.
    fn deterministic(&self, _spec: &ExperimentSpec) -> bool {
        true
    }

    async fn execute(&self, ctx: &StageContext, inputs: &StageInputs) -> Result<StageOutcome, StageError>;
}

/// Executors by stage, resolved once at run start.
#[derive(Clone)]
pub struct StageRegistry {
    executors: BTreeMap<StageName, Arc<dyn StageExecutor>>,
}

impl StageRegistry {
    /// Registry with the built-in executor for every stage.
    pub fn standard() -> Self {
        Self {
            executors: BTreeMap::new(),
        }
        .with_executor(Arc::new(ValidationStage))
        .with_executor(Arc::new(AnalysisStage))
        .with_executor(Arc::new(StatisticsStage))
        .with_executor(Arc::new(SynthesisStage))
        .with_executor(Arc::new(FinalizationStage))
    }

    /// Registers `executor` for its stage, replacing any previous one.
    pub fn with_executor(mut self, executor: Arc<dyn StageExecutor>) -> Self {
        self.executors.insert(executor.stage(), executor);
        self
    }

    pub fn get(&self, stage: StageName) -> Option<Arc<dyn StageExecutor>> {
        self.executors.get(&stage).cloned()
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Reads and decodes a JSON artifact, verifying its hash.
pub async fn load_json<T: DeserializeOwned>(store: &ArtifactStore, hash: &ContentHash) -> Result<T, StageError> {
    let bytes = store.get_verified(hash).await?;
    serde_json::from_slice(&bytes).map_err(|e| StageError::InvalidInput {
        hash: hash.clone(),
        message: e.to_string(),
    })
}

/// Stores `value` as canonical JSON.
pub async fn store_json<T: Serialize>(
    store: &ArtifactStore,
    value: &T,
    request: PutRequest,
) -> Result<(ArtifactHandle, Vec<u8>), StageError> {
    let bytes = canonical_json_pretty(value).map_err(|e| StageError::Export(e.to_string()))?;
    let handle = store.put(&bytes, request).await?;
    Ok((handle, bytes))
}
