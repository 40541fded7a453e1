//! Append-only provenance manifest.
//!
//! One manifest per run, stored as `manifest.json` in the run directory. An
//! entry is added for every resolved work unit and every resolved stage;
//! entries are never modified or removed. The whole document is rewritten
//! atomically on each append, so a crash leaves the last complete version.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::error::ErrorKind;
use crate::llm::AttemptRecord;
use crate::pipeline::run::StageName;
use crate::storage::{write_json_atomic, ContentHash, Fingerprint};

pub const MANIFEST_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Failed to write manifest {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed manifest {path}: {message}")]
    Malformed { path: PathBuf, message: String },
}

impl ManifestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ManifestError::Write { .. } | ManifestError::Read { .. } => ErrorKind::StorageIo,
            ManifestError::Malformed { .. } => ErrorKind::CorruptArtifact,
        }
    }
}

/// Result of a stage or work unit as recorded in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Success,
    /// Stage finished with some work units failed.
    Partial,
    Failed,
    Cancelled,
    /// Output carried over, verified, from the parent run.
    Reused,
}

impl EntryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Success => "success",
            EntryStatus::Partial => "partial",
            EntryStatus::Failed => "failed",
            EntryStatus::Cancelled => "cancelled",
            EntryStatus::Reused => "reused",
        }
    }

    /// Whether the entry's outputs are complete and usable downstream.
    pub fn is_complete(self) -> bool {
        matches!(self, EntryStatus::Success | EntryStatus::Reused)
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
}

/// One provenance record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Position in the manifest, assigned on append.
    pub seq: u64,
    pub stage: StageName,
    /// Work unit id; `None` for stage-level entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
    pub status: EntryStatus,
    pub inputs: Vec<ContentHash>,
    pub outputs: Vec<ContentHash>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<AttemptRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Output came from the artifact store rather than fresh computation.
    pub cache_hit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl ManifestEntry {
    fn new(stage: StageName, unit: Option<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            seq: 0,
            stage,
            unit,
            fingerprint: None,
            status: EntryStatus::Success,
            inputs: Vec::new(),
            outputs: Vec::new(),
            started_at,
            ended_at: started_at,
            duration_ms: 0,
            model_used: None,
            attempts: Vec::new(),
            cost: None,
            cache_hit: false,
            error: None,
        }
    }

    /// Entry describing a whole stage.
    pub fn for_stage(stage: StageName, started_at: DateTime<Utc>) -> Self {
        Self::new(stage, None, started_at)
    }

    /// Entry describing one work unit of a stage.
    pub fn for_unit(stage: StageName, unit: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self::new(stage, Some(unit.into()), started_at)
    }

    pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    pub fn with_inputs(mut self, inputs: Vec<ContentHash>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<ContentHash>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model_used = model;
        self
    }

    pub fn with_attempts(mut self, attempts: Vec<AttemptRecord>) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_cost(mut self, cost: Option<f64>) -> Self {
        self.cost = cost;
        self
    }

    pub fn cache_hit(mut self, hit: bool) -> Self {
        self.cache_hit = hit;
        self
    }

    pub fn with_error(mut self, kind: ErrorKind, message: impl Into<String>) -> Self {
        self.error = Some(ErrorDetail {
            kind,
            message: message.into(),
        });
        self
    }

    /// Stamps the end time and status.
    pub fn finish(mut self, status: EntryStatus, ended_at: DateTime<Utc>) -> Self {
        self.status = status;
        self.ended_at = ended_at;
        self.duration_ms = (ended_at - self.started_at).num_milliseconds().max(0) as u64;
        self
    }
}

/// The manifest document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub run_id: String,
    pub spec_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Serialized as `stages`, in append order.
    #[serde(rename = "stages")]
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(run_id: impl Into<String>, spec_hash: impl Into<String>, parent_run_id: Option<String>) -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            run_id: run_id.into(),
            spec_hash: spec_hash.into(),
            parent_run_id,
            created_at: Utc::now(),
            entries: Vec::new(),
        }
    }

    pub async fn load(path: &Path) -> Result<Self, ManifestError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|e| ManifestError::Malformed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Latest stage-level entry for `stage`.
    pub fn stage_entry(&self, stage: StageName) -> Option<&ManifestEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.stage == stage && e.unit.is_none())
    }

    /// Work-unit entries for `stage`, in append order.
    pub fn unit_entries(&self, stage: StageName) -> impl Iterator<Item = &ManifestEntry> {
        self.entries
            .iter()
            .filter(move |e| e.stage == stage && e.unit.is_some())
    }

    /// Latest completed entry per unit id for `stage`.
    pub fn completed_units(&self, stage: StageName) -> BTreeMap<&str, &ManifestEntry> {
        let mut latest: BTreeMap<&str, &ManifestEntry> = BTreeMap::new();
        for entry in self.unit_entries(stage) {
            if let Some(unit) = entry.unit.as_deref() {
                latest.insert(unit, entry);
            }
        }
        latest.retain(|_, e| e.status.is_complete());
        latest
    }

    /// Failed or cancelled entries, in append order.
    pub fn failures(&self) -> Vec<&ManifestEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.status, EntryStatus::Failed | EntryStatus::Cancelled))
            .collect()
    }

    /// Spend recorded by this run. Stage-level entries carry the stage total.
    pub fn total_cost(&self) -> f64 {
        self.entries
            .iter()
            .filter(|e| e.unit.is_none())
            .filter_map(|e| e.cost)
            .sum()
    }
}

/// Owns a manifest file and appends to it.
#[derive(Debug)]
pub struct ManifestWriter {
    path: PathBuf,
    manifest: Manifest,
}

impl ManifestWriter {
    /// Writes an empty manifest at `path`.
    pub async fn create(path: impl Into<PathBuf>, manifest: Manifest) -> Result<Self, ManifestError> {
        let writer = Self {
            path: path.into(),
            manifest,
        };
        writer.persist().await?;
        Ok(writer)
    }

    async fn persist(&self) -> Result<(), ManifestError> {
        write_json_atomic(&self.path, &self.manifest)
            .await
            .map_err(|source| ManifestError::Write {
                path: self.path.clone(),
                source,
            })
    }

    /// Appends `entry`, assigning its sequence number, and persists.
    ///
    /// If persisting fails the entry is rolled back so memory and disk agree.
    pub async fn append(&mut self, mut entry: ManifestEntry) -> Result<u64, ManifestError> {
        let seq = self.manifest.entries.len() as u64;
        entry.seq = seq;
        self.manifest.entries.push(entry);
        if let Err(e) = self.persist().await {
            self.manifest.entries.pop();
            return Err(e);
        }
        Ok(seq)
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Shared, serialized access to a run's manifest for concurrent work units.
#[derive(Debug, Clone)]
pub struct ManifestJournal {
    inner: Arc<Mutex<ManifestWriter>>,
}

impl ManifestJournal {
    pub async fn create(path: impl Into<PathBuf>, manifest: Manifest) -> Result<Self, ManifestError> {
        let writer = ManifestWriter::create(path, manifest).await?;
        Ok(Self {
            inner: Arc::new(Mutex::new(writer)),
        })
    }

    pub async fn append(&self, entry: ManifestEntry) -> Result<u64, ManifestError> {
        self.inner.lock().await.append(entry).await
    }

    /// Copy of the manifest as persisted so far.
    pub async fn snapshot(&self) -> Manifest {
        self.inner.lock().await.manifest().clone()
    }
}
