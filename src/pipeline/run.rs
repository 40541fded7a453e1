//! Runs: identity, lifecycle status and on-disk layout.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::storage::{write_json_atomic, ContentHash, StorageError};

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    PreflightValidation,
    Analysis,
    StatisticalPreparation,
    Synthesis,
    Finalization,
}

impl StageName {
    pub const ALL: [StageName; 5] = [
        StageName::PreflightValidation,
        StageName::Analysis,
        StageName::StatisticalPreparation,
        StageName::Synthesis,
        StageName::Finalization,
    ];

    /// Position in the pipeline, starting at 0.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageName::PreflightValidation => "preflight_validation",
            StageName::Analysis => "analysis",
            StageName::StatisticalPreparation => "statistical_preparation",
            StageName::Synthesis => "synthesis",
            StageName::Finalization => "finalization",
        }
    }

    pub fn next(self) -> Option<StageName> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// Stages up to and including `last`.
    pub fn through(last: StageName) -> impl Iterator<Item = StageName> {
        Self::ALL.into_iter().filter(move |s| *s <= last)
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// Stopped cooperatively; resumable.
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub stage: StageName,
    pub kind: ErrorKind,
    pub message: String,
    /// Manifest entry describing the failure.
    pub entry_seq: Option<u64>,
}

/// One execution of an experiment spec. Persisted as `run.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub experiment: String,
    pub spec_hash: String,
    pub status: RunStatus,
    pub current_stage: Option<StageName>,
    /// Last stage this run was asked to reach.
    pub target_stage: StageName,
    /// Run whose verified artifacts this one reuses.
    pub parent_run_id: Option<String>,
    pub workbench: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub failure: Option<RunFailure>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl Run {
    pub fn new(
        run_id: String,
        experiment: String,
        spec_hash: String,
        target_stage: StageName,
        parent_run_id: Option<String>,
        workbench: bool,
    ) -> Self {
        Self {
            run_id,
            experiment,
            spec_hash,
            status: RunStatus::Running,
            current_stage: None,
            target_stage,
            parent_run_id,
            workbench,
            started_at: Utc::now(),
            ended_at: None,
            failure: None,
            warnings: Vec::new(),
        }
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }

    pub fn fail(&mut self, failure: RunFailure) {
        self.failure = Some(failure);
        self.finish(RunStatus::Failed);
    }

    pub async fn load(path: &Path) -> Result<Self, StorageError> {
        let bytes = fs::read(path)
            .await
            .map_err(|e| StorageError::io(path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| StorageError::Metadata {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub async fn save(&self, path: &Path) -> Result<(), StorageError> {
        write_json_atomic(path, self)
            .await
            .map_err(|e| StorageError::io(path, e))
    }
}

/// New run id: UTC timestamp to the millisecond plus 8 random hex chars.
///
/// Ids sort chronologically as plain strings.
pub fn new_run_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", now.format("%Y%m%dT%H%M%S%3fZ"), &suffix[..8])
}

/// Cooperative cancellation signal shared by everything in a run.
///
/// Work units check it before starting; in-flight units finish.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Directory layout of one experiment.
///
/// ```text
/// <experiment>/.forge/store/          shared artifact store
/// <experiment>/runs/<run_id>/         operational runs
/// <experiment>/workbench/runs/<id>/   workbench runs
/// ```
#[derive(Debug, Clone)]
pub struct RunLayout {
    experiment_dir: PathBuf,
}

impl RunLayout {
    pub fn new(experiment_dir: impl Into<PathBuf>) -> Self {
        Self {
            experiment_dir: experiment_dir.into(),
        }
    }

    pub fn experiment_dir(&self) -> &Path {
        &self.experiment_dir
    }

    pub fn store_root(&self) -> PathBuf {
        self.experiment_dir.join(".forge").join("store")
    }

    pub fn runs_root(&self, workbench: bool) -> PathBuf {
        if workbench {
            self.experiment_dir.join("workbench").join("runs")
        } else {
            self.experiment_dir.join("runs")
        }
    }

    pub fn run_paths(&self, run_id: &str, workbench: bool) -> RunPaths {
        RunPaths::new(self.runs_root(workbench).join(run_id))
    }

    /// Runs under the given scope, oldest first. Directories without a
    /// readable `run.json` are ignored.
    pub async fn list_runs(&self, workbench: bool) -> Result<Vec<Run>, StorageError> {
        let root = self.runs_root(workbench);
        let mut entries = match fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(&root, e)),
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&root, e))?
        {
            let paths = RunPaths::new(entry.path());
            match Run::load(&paths.run_record()).await {
                Ok(run) => runs.push(run),
                Err(e) => {
                    tracing::debug!(path = %entry.path().display(), error = %e, "Skipping unreadable run directory");
                }
            }
        }

        runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        Ok(runs)
    }
}

/// Files that make up one run directory.
#[derive(Debug, Clone)]
pub struct RunPaths {
    dir: PathBuf,
}

impl RunPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn run_record(&self) -> PathBuf {
        self.dir.join("run.json")
    }

    pub fn manifest(&self) -> PathBuf {
        self.dir.join("manifest.json")
    }

    pub fn lease(&self) -> PathBuf {
        self.dir.join(".lease")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.dir.join("artifacts")
    }

    pub fn artifact(&self, hash: &ContentHash) -> PathBuf {
        self.artifacts_dir().join(hash.as_str())
    }

    pub fn statistical_exports(&self) -> PathBuf {
        self.dir.join("exports").join("statistical_package")
    }

    pub fn bundle(&self) -> PathBuf {
        self.dir.join("bundle.tar.gz")
    }

    pub fn readme(&self) -> PathBuf {
        self.dir.join("README.md")
    }
}
