//! Resume and promote.
//!
//! Resuming never touches the old run. It plans a new run that reuses the
//! verified artifacts of its predecessor and starts at the first stage that
//! did not complete. Promotion relocates a finished workbench run into the
//! operational runs directory without executing anything.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::run::{Run, RunLayout, RunPaths, RunStatus, StageName};
use super::spec::ExperimentSpec;
use super::stages::UnitFailure;
use crate::error::ErrorKind;
use crate::provenance::{EntryStatus, LeaseError, Manifest, ManifestEntry, ManifestError, RunLease};
use crate::storage::{verify_bytes, ArtifactHandle, ArtifactStore, ContentHash, Fingerprint, StorageError};

#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("No earlier run of this experiment (spec {spec_hash}) to resume")]
    NoPredecessor { spec_hash: String },

    #[error("Run {0} not found")]
    RunNotFound(String),

    #[error("Run {run_id} is still leased by another process")]
    Leased { run_id: String },

    #[error("Run {run_id} has no successful {stage} to resume from")]
    StageIncomplete { run_id: String, stage: StageName },

    #[error("Run {run_id} is {status}; only completed runs can be promoted")]
    NotCompleted { run_id: String, status: RunStatus },

    #[error("Run {0} already exists in the operational runs directory")]
    AlreadyPromoted(String),

    #[error("Artifact {hash} is not available in the store or the run directory")]
    MissingArtifact { hash: ContentHash },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Lease error: {0}")]
    Lease(#[from] LeaseError),

    #[error("Copy failed: {0}")]
    Copy(String),
}

impl ResumeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResumeError::Storage(e) => e.kind(),
            ResumeError::Manifest(e) => e.kind(),
            ResumeError::Lease(e) => e.kind(),
            ResumeError::MissingArtifact { .. } => ErrorKind::CorruptArtifact,
            ResumeError::Copy(_) => ErrorKind::StorageIo,
            _ => ErrorKind::Config,
        }
    }
}

/// Which run to resume and how.
#[derive(Debug, Clone, Default)]
pub struct ResumeRequest {
    /// Explicit predecessor. Defaults to the latest run with the same spec hash.
    pub run_id: Option<String>,
    /// Re-execute from this stage even if the predecessor completed it.
    /// Every earlier stage must have completed.
    pub from_stage: Option<StageName>,
    /// Look for the predecessor among workbench runs.
    pub workbench: bool,
    /// Remove the predecessor's lease even when its holder looks alive.
    pub break_lease: bool,
}

impl ResumeRequest {
    pub fn latest() -> Self {
        Self::default()
    }

    pub fn run(run_id: impl Into<String>) -> Self {
        Self {
            run_id: Some(run_id.into()),
            ..Self::default()
        }
    }

    pub fn from_stage(mut self, stage: StageName) -> Self {
        self.from_stage = Some(stage);
        self
    }

    pub fn workbench(mut self, workbench: bool) -> Self {
        self.workbench = workbench;
        self
    }

    pub fn break_lease(mut self) -> Self {
        self.break_lease = true;
        self
    }
}

/// A completed stage carried over verbatim.
#[derive(Debug, Clone)]
pub struct ReusedStage {
    pub inputs: Vec<ContentHash>,
    pub outputs: Vec<ArtifactHandle>,
    pub fingerprint: Option<Fingerprint>,
    /// Units the predecessor tolerated as failed. `entry_seq` points into
    /// the predecessor's manifest.
    pub failures: Vec<UnitFailure>,
}

/// What a resumed run executes and what it reuses.
#[derive(Debug, Clone)]
pub struct ResumePlan {
    pub parent_run_id: String,
    /// First stage after validation to execute; `None` when every stage up
    /// to the target is reused.
    pub start_stage: Option<StageName>,
    pub reused: BTreeMap<StageName, ReusedStage>,
    /// Verified work units of `start_stage`, by unit id.
    pub preresolved: BTreeMap<String, ArtifactHandle>,
    /// The predecessor ran a different spec; nothing is reused.
    pub spec_changed: bool,
}

/// Outcome of a promotion.
#[derive(Debug, Clone, Serialize)]
pub struct PromoteReport {
    pub run_id: String,
    pub destination: PathBuf,
    pub artifacts: usize,
    pub files: usize,
}

/// Plans resumes and performs promotions over one experiment layout.
pub struct ResumeController<'a> {
    layout: &'a RunLayout,
    store: &'a ArtifactStore,
}

impl<'a> ResumeController<'a> {
    pub fn new(layout: &'a RunLayout, store: &'a ArtifactStore) -> Self {
        Self { layout, store }
    }

    /// Finds the predecessor run and decides what the new run reuses.
    ///
    /// `target` is the last stage the new run will reach.
    ///
    /// # Errors
    ///
    /// `StorageError::Corrupt` when a reused artifact no longer matches its
    /// hash. Such artifacts are never reused.
    pub async fn plan(
        &self,
        spec: &ExperimentSpec,
        request: &ResumeRequest,
        target: StageName,
    ) -> Result<ResumePlan, ResumeError> {
        let parent = self.find_predecessor(spec, request).await?;
        let paths = self.layout.run_paths(&parent.run_id, request.workbench);
        let lease = paths.lease();
        if request.break_lease {
            RunLease::break_lease(&lease)?;
        } else {
            RunLease::reclaim_if_stale(&lease)?;
        }
        if RunLease::is_held(&lease) {
            return Err(ResumeError::Leased {
                run_id: parent.run_id,
            });
        }

        let manifest = Manifest::load(&paths.manifest()).await?;
        if manifest.spec_hash != spec.spec_hash() {
            warn!(
                parent = %parent.run_id,
                parent_spec = %manifest.spec_hash,
                spec = %spec.spec_hash(),
                "Experiment changed since the parent run; nothing will be reused"
            );
            return Ok(ResumePlan {
                parent_run_id: parent.run_id,
                start_stage: Some(StageName::Analysis),
                reused: BTreeMap::new(),
                preresolved: BTreeMap::new(),
                spec_changed: true,
            });
        }

        let mut reused = BTreeMap::new();
        let mut start_stage = None;
        for stage in StageName::through(target).filter(|s| *s > StageName::PreflightValidation) {
            let forced = request.from_stage.is_some_and(|from| stage >= from);
            let before_forced = request.from_stage.is_some_and(|from| stage < from);
            let entry = manifest.stage_entry(stage).filter(|e| {
                e.status.is_complete()
                    || (before_forced && e.status == EntryStatus::Partial && completed_after(&manifest, stage))
            });

            match entry {
                Some(entry) if !forced => {
                    let outputs = self.verify_outputs(&paths, &entry.outputs).await?;
                    let failures = if entry.status == EntryStatus::Partial {
                        warn!(parent = %parent.run_id, stage = %stage, "Reusing partial results the parent run tolerated");
                        failed_units(&manifest, stage)
                    } else {
                        Vec::new()
                    };
                    reused.insert(
                        stage,
                        ReusedStage {
                            inputs: entry.inputs.clone(),
                            outputs,
                            fingerprint: entry.fingerprint.clone(),
                            failures,
                        },
                    );
                }
                None if before_forced => {
                    return Err(ResumeError::StageIncomplete {
                        run_id: parent.run_id,
                        stage,
                    });
                }
                _ => {
                    start_stage = Some(stage);
                    break;
                }
            }
        }

        let preresolved = match start_stage {
            Some(stage) if request.from_stage.is_none() => {
                self.verify_units(&paths, manifest.completed_units(stage)).await?
            }
            _ => BTreeMap::new(),
        };

        info!(
            parent = %parent.run_id,
            start = ?start_stage,
            reused_stages = reused.len(),
            preresolved = preresolved.len(),
            "Resume planned"
        );

        Ok(ResumePlan {
            parent_run_id: parent.run_id,
            start_stage,
            reused,
            preresolved,
            spec_changed: false,
        })
    }

    async fn find_predecessor(&self, spec: &ExperimentSpec, request: &ResumeRequest) -> Result<Run, ResumeError> {
        if let Some(run_id) = &request.run_id {
            let paths = self.layout.run_paths(run_id, request.workbench);
            return match Run::load(&paths.run_record()).await {
                Ok(run) => Ok(run),
                Err(StorageError::Io { .. }) => Err(ResumeError::RunNotFound(run_id.clone())),
                Err(e) => Err(e.into()),
            };
        }

        self.layout
            .list_runs(request.workbench)
            .await?
            .into_iter()
            .rev()
            .find(|run| run.spec_hash == spec.spec_hash())
            .ok_or_else(|| ResumeError::NoPredecessor {
                spec_hash: spec.spec_hash().to_string(),
            })
    }

    async fn verify_units(
        &self,
        paths: &RunPaths,
        units: BTreeMap<&str, &ManifestEntry>,
    ) -> Result<BTreeMap<String, ArtifactHandle>, ResumeError> {
        let mut verified = BTreeMap::new();
        for (unit, entry) in units {
            let [hash] = entry.outputs.as_slice() else {
                debug!(unit, "Skipping unit without a single output");
                continue;
            };
            let handle = self.verify_artifact(paths, hash).await?;
            verified.insert(unit.to_string(), handle);
        }
        Ok(verified)
    }

    async fn verify_outputs(&self, paths: &RunPaths, hashes: &[ContentHash]) -> Result<Vec<ArtifactHandle>, ResumeError> {
        let mut handles = Vec::with_capacity(hashes.len());
        for hash in hashes {
            handles.push(self.verify_artifact(paths, hash).await?);
        }
        Ok(handles)
    }

    /// Checks the store's bytes for `hash`. A blob missing from the store is
    /// restored from the run directory's copy, after verification.
    async fn verify_artifact(&self, paths: &RunPaths, hash: &ContentHash) -> Result<ArtifactHandle, ResumeError> {
        let handle = self
            .store
            .handle(hash)
            .await?
            .ok_or_else(|| ResumeError::MissingArtifact { hash: hash.clone() })?;

        match self.store.get(hash).await? {
            Some(bytes) => {
                verify_bytes(hash, &bytes)?;
                Ok(handle)
            }
            None => {
                let copy = paths.artifact(hash);
                let bytes = tokio::fs::read(&copy)
                    .await
                    .map_err(|_| ResumeError::MissingArtifact { hash: hash.clone() })?;
                warn!(hash = %hash.short(), "Restoring missing blob from run directory");
                Ok(self.store.import(&bytes, &handle).await?)
            }
        }
    }

    /// Moves a completed workbench run into the operational runs directory.
    ///
    /// Every artifact copy is verified and imported into the store before
    /// the directory is copied. The operational copy appears atomically.
    pub async fn promote(&self, run_id: Option<&str>) -> Result<PromoteReport, ResumeError> {
        let run = match run_id {
            Some(id) => Run::load(&self.layout.run_paths(id, true).run_record())
                .await
                .map_err(|_| ResumeError::RunNotFound(id.to_string()))?,
            None => self
                .layout
                .list_runs(true)
                .await?
                .into_iter()
                .rev()
                .find(|r| r.status == RunStatus::Completed)
                .ok_or_else(|| ResumeError::RunNotFound("latest completed workbench run".to_string()))?,
        };

        if run.status != RunStatus::Completed {
            return Err(ResumeError::NotCompleted {
                run_id: run.run_id,
                status: run.status,
            });
        }

        let source = self.layout.run_paths(&run.run_id, true);
        if RunLease::is_held(&source.lease()) {
            return Err(ResumeError::Leased { run_id: run.run_id });
        }
        let destination = self.layout.run_paths(&run.run_id, false);
        if tokio::fs::try_exists(destination.dir()).await.unwrap_or(false) {
            return Err(ResumeError::AlreadyPromoted(run.run_id));
        }

        let manifest = Manifest::load(&source.manifest()).await?;
        let hashes: BTreeSet<&ContentHash> = manifest.entries.iter().flat_map(|e| e.outputs.iter()).collect();
        for hash in &hashes {
            let bytes = tokio::fs::read(source.artifact(hash))
                .await
                .map_err(|_| ResumeError::MissingArtifact { hash: (*hash).clone() })?;
            verify_bytes(hash, &bytes)?;
            let handle = self
                .store
                .handle(hash)
                .await?
                .ok_or_else(|| ResumeError::MissingArtifact { hash: (*hash).clone() })?;
            self.store.import(&bytes, &handle).await?;
        }

        let from = source.dir().to_path_buf();
        let to = destination.dir().to_path_buf();
        let files = tokio::task::spawn_blocking(move || copy_run_dir(&from, &to))
            .await
            .map_err(|e| ResumeError::Copy(e.to_string()))?
            .map_err(|e| ResumeError::Copy(e.to_string()))?;

        info!(run_id = %run.run_id, artifacts = hashes.len(), files, "Run promoted");
        Ok(PromoteReport {
            run_id: run.run_id,
            destination: destination.dir().to_path_buf(),
            artifacts: hashes.len(),
            files,
        })
    }
}

/// Copies `from` into a hidden sibling of `to`, then renames it into place.
/// Lease files are not copied.
fn copy_run_dir(from: &Path, to: &Path) -> std::io::Result<usize> {
    let parent = to
        .parent()
        .ok_or_else(|| std::io::Error::other(format!("{} has no parent", to.display())))?;
    std::fs::create_dir_all(parent)?;
    let staging = parent.join(format!(".promote-{}", uuid::Uuid::new_v4().simple()));

    let mut files = 0;
    for entry in walkdir::WalkDir::new(from).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(std::io::Error::other)?;
        if relative.file_name().is_some_and(|n| n == ".lease") {
            continue;
        }

        let target = staging.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
            files += 1;
        }
    }

    std::fs::rename(&staging, to)?;
    Ok(files)
}

/// Whether a stage after `stage` completed, which shows the run went on
/// past a partial `stage`.
fn completed_after(manifest: &Manifest, stage: StageName) -> bool {
    manifest
        .entries
        .iter()
        .any(|e| e.unit.is_none() && e.stage > stage && e.status.is_complete())
}

/// Units of `stage` whose latest entry did not complete.
fn failed_units(manifest: &Manifest, stage: StageName) -> Vec<UnitFailure> {
    let mut latest: BTreeMap<&str, &ManifestEntry> = BTreeMap::new();
    for entry in manifest.unit_entries(stage) {
        if let Some(unit) = entry.unit.as_deref() {
            latest.insert(unit, entry);
        }
    }
    latest
        .into_iter()
        .filter(|(_, e)| !e.status.is_complete())
        .map(|(unit, e)| UnitFailure {
            unit: unit.to_string(),
            kind: e.error.as_ref().map(|d| d.kind).unwrap_or(ErrorKind::AllCandidatesExhausted),
            message: e.error.as_ref().map(|d| d.message.clone()).unwrap_or_default(),
            entry_seq: e.seq,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stages::test_support::spec;
    use crate::provenance::ManifestJournal;
    use crate::storage::{ArtifactKind, PutRequest};
    use chrono::Utc;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        layout: RunLayout,
        store: ArtifactStore,
        spec: ExperimentSpec,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let layout = RunLayout::new(dir.path());
        let store = ArtifactStore::open(layout.store_root()).await.unwrap();
        Fixture {
            _dir: dir,
            layout,
            store,
            spec: spec(&[("a", "alpha"), ("b", "bravo")]),
        }
    }

    /// Writes a parent run with the given stage entries. Each stage gets one
    /// stored artifact.
    async fn parent_run(
        f: &Fixture,
        run_id: &str,
        workbench: bool,
        stages: &[(StageName, EntryStatus)],
        units: &[(&str, EntryStatus)],
        status: RunStatus,
    ) -> BTreeMap<StageName, ArtifactHandle> {
        let paths = f.layout.run_paths(run_id, workbench);
        let journal = ManifestJournal::create(paths.manifest(), Manifest::new(run_id, f.spec.spec_hash(), None))
            .await
            .unwrap();
        let mut outputs = BTreeMap::new();

        for (unit, unit_status) in units {
            let handle = f
                .store
                .put(unit.as_bytes(), PutRequest::new(StageName::Analysis, ArtifactKind::RawAnalysis))
                .await
                .unwrap();
            write_copy(&paths, &handle, unit.as_bytes()).await;
            let mut entry = ManifestEntry::for_unit(StageName::Analysis, *unit, Utc::now());
            if unit_status.is_complete() {
                entry = entry.with_outputs(vec![handle.hash.clone()]);
            }
            journal.append(entry.finish(*unit_status, Utc::now())).await.unwrap();
        }

        for (stage, stage_status) in stages {
            let body = format!("{}-{}", run_id, stage);
            let handle = f
                .store
                .put(body.as_bytes(), PutRequest::new(*stage, crate::pipeline::stages::artifact_kind(*stage)))
                .await
                .unwrap();
            write_copy(&paths, &handle, body.as_bytes()).await;
            journal
                .append(
                    ManifestEntry::for_stage(*stage, Utc::now())
                        .with_outputs(vec![handle.hash.clone()])
                        .finish(*stage_status, Utc::now()),
                )
                .await
                .unwrap();
            outputs.insert(*stage, handle);
        }

        let mut run = Run::new(
            run_id.to_string(),
            f.spec.name.clone(),
            f.spec.spec_hash().to_string(),
            StageName::Finalization,
            None,
            workbench,
        );
        run.finish(status);
        run.save(&paths.run_record()).await.unwrap();
        outputs
    }

    async fn write_copy(paths: &RunPaths, handle: &ArtifactHandle, bytes: &[u8]) {
        crate::storage::write_atomic(&paths.artifact(&handle.hash), bytes)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_resume_starts_at_first_incomplete_stage() {
        let f = fixture().await;
        parent_run(
            &f,
            "20260101T000000000Z-aaaaaaaa",
            false,
            &[
                (StageName::PreflightValidation, EntryStatus::Success),
                (StageName::Analysis, EntryStatus::Partial),
            ],
            &[("a", EntryStatus::Success), ("b", EntryStatus::Failed)],
            RunStatus::Failed,
        )
        .await;

        let plan = ResumeController::new(&f.layout, &f.store)
            .plan(&f.spec, &ResumeRequest::latest(), StageName::Finalization)
            .await
            .unwrap();

        assert_eq!(plan.start_stage, Some(StageName::Analysis));
        assert!(plan.reused.is_empty());
        assert_eq!(plan.preresolved.keys().collect::<Vec<_>>(), ["a"]);
        assert!(!plan.spec_changed);
    }

    #[tokio::test]
    async fn test_resume_from_stats_requires_statistics() {
        let f = fixture().await;
        let id = "20260101T000000000Z-aaaaaaaa";
        parent_run(
            &f,
            id,
            false,
            &[
                (StageName::PreflightValidation, EntryStatus::Success),
                (StageName::Analysis, EntryStatus::Success),
            ],
            &[],
            RunStatus::Failed,
        )
        .await;

        let err = ResumeController::new(&f.layout, &f.store)
            .plan(
                &f.spec,
                &ResumeRequest::latest().from_stage(StageName::Synthesis),
                StageName::Finalization,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ResumeError::StageIncomplete {
                stage: StageName::StatisticalPreparation,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_forced_stage_reuses_everything_before_it() {
        let f = fixture().await;
        let outputs = parent_run(
            &f,
            "20260101T000000000Z-aaaaaaaa",
            false,
            &[
                (StageName::PreflightValidation, EntryStatus::Success),
                (StageName::Analysis, EntryStatus::Success),
                (StageName::StatisticalPreparation, EntryStatus::Success),
                (StageName::Synthesis, EntryStatus::Success),
            ],
            &[],
            RunStatus::Completed,
        )
        .await;

        let plan = ResumeController::new(&f.layout, &f.store)
            .plan(
                &f.spec,
                &ResumeRequest::latest().from_stage(StageName::Synthesis),
                StageName::Finalization,
            )
            .await
            .unwrap();

        assert_eq!(plan.start_stage, Some(StageName::Synthesis));
        assert_eq!(
            plan.reused[&StageName::StatisticalPreparation].outputs[0].hash,
            outputs[&StageName::StatisticalPreparation].hash
        );
        assert!(!plan.reused.contains_key(&StageName::Synthesis));
    }

    #[tokio::test]
    async fn test_corrupt_blob_is_fatal() {
        let f = fixture().await;
        let outputs = parent_run(
            &f,
            "20260101T000000000Z-aaaaaaaa",
            false,
            &[
                (StageName::PreflightValidation, EntryStatus::Success),
                (StageName::Analysis, EntryStatus::Success),
            ],
            &[],
            RunStatus::Failed,
        )
        .await;
        let blob = f.store.blob_path(&outputs[&StageName::Analysis].hash);
        std::fs::write(&blob, b"tampered").unwrap();

        let err = ResumeController::new(&f.layout, &f.store)
            .plan(&f.spec, &ResumeRequest::latest(), StageName::Finalization)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptArtifact);
    }

    #[tokio::test]
    async fn test_missing_blob_is_restored_from_run_copy() {
        let f = fixture().await;
        let outputs = parent_run(
            &f,
            "20260101T000000000Z-aaaaaaaa",
            false,
            &[
                (StageName::PreflightValidation, EntryStatus::Success),
                (StageName::Analysis, EntryStatus::Success),
            ],
            &[],
            RunStatus::Failed,
        )
        .await;
        let hash = &outputs[&StageName::Analysis].hash;
        std::fs::remove_file(f.store.blob_path(hash)).unwrap();

        let plan = ResumeController::new(&f.layout, &f.store)
            .plan(&f.spec, &ResumeRequest::latest(), StageName::Finalization)
            .await
            .unwrap();
        assert_eq!(plan.start_stage, Some(StageName::StatisticalPreparation));
        f.store.verify(hash).await.unwrap();
    }

    #[tokio::test]
    async fn test_changed_spec_gives_fresh_plan() {
        let f = fixture().await;
        let id = "20260101T000000000Z-aaaaaaaa";
        parent_run(&f, id, false, &[(StageName::Analysis, EntryStatus::Success)], &[], RunStatus::Failed).await;

        let changed = spec(&[("a", "different")]);
        let plan = ResumeController::new(&f.layout, &f.store)
            .plan(&changed, &ResumeRequest::run(id), StageName::Finalization)
            .await
            .unwrap();
        assert!(plan.spec_changed);
        assert!(plan.reused.is_empty());
        assert_eq!(plan.parent_run_id, id);
    }

    #[tokio::test]
    async fn test_leased_predecessor_is_refused() {
        let f = fixture().await;
        let id = "20260101T000000000Z-aaaaaaaa";
        parent_run(&f, id, false, &[], &[], RunStatus::Running).await;
        let _lease = RunLease::acquire(f.layout.run_paths(id, false).lease(), id).unwrap();

        let err = ResumeController::new(&f.layout, &f.store)
            .plan(&f.spec, &ResumeRequest::latest(), StageName::Finalization)
            .await
            .unwrap_err();
        assert!(matches!(err, ResumeError::Leased { .. }));
    }

    #[tokio::test]
    async fn test_lease_left_by_dead_process_is_reclaimed() {
        let f = fixture().await;
        let id = "20260101T000000000Z-aaaaaaaa";
        parent_run(&f, id, false, &[], &[], RunStatus::Running).await;
        let lease = f.layout.run_paths(id, false).lease();
        let abandoned = crate::provenance::LeaseInfo {
            run_id: id.to_string(),
            owner: uuid::Uuid::new_v4(),
            pid: 4_000_000_000,
            acquired_at: Utc::now() - chrono::Duration::days(2),
        };
        std::fs::write(&lease, serde_json::to_vec(&abandoned).unwrap()).unwrap();

        let plan = ResumeController::new(&f.layout, &f.store)
            .plan(&f.spec, &ResumeRequest::latest(), StageName::Finalization)
            .await
            .unwrap();
        assert_eq!(plan.parent_run_id, id);
        assert!(!lease.exists());
    }

    #[tokio::test]
    async fn test_break_lease_overrides_live_holder() {
        let f = fixture().await;
        let id = "20260101T000000000Z-aaaaaaaa";
        parent_run(&f, id, false, &[], &[], RunStatus::Running).await;
        let _lease = RunLease::acquire(f.layout.run_paths(id, false).lease(), id).unwrap();

        let plan = ResumeController::new(&f.layout, &f.store)
            .plan(&f.spec, &ResumeRequest::latest().break_lease(), StageName::Finalization)
            .await
            .unwrap();
        assert_eq!(plan.start_stage, Some(StageName::Analysis));
    }

    #[tokio::test]
    async fn test_tolerated_partial_analysis_feeds_synthesis() {
        let f = fixture().await;
        let outputs = parent_run(
            &f,
            "20260101T000000000Z-aaaaaaaa",
            false,
            &[
                (StageName::PreflightValidation, EntryStatus::Success),
                (StageName::Analysis, EntryStatus::Partial),
                (StageName::StatisticalPreparation, EntryStatus::Success),
            ],
            &[("a", EntryStatus::Success), ("b", EntryStatus::Failed)],
            RunStatus::Completed,
        )
        .await;

        let plan = ResumeController::new(&f.layout, &f.store)
            .plan(
                &f.spec,
                &ResumeRequest::latest().from_stage(StageName::Synthesis),
                StageName::Finalization,
            )
            .await
            .unwrap();

        assert_eq!(plan.start_stage, Some(StageName::Synthesis));
        let analysis = &plan.reused[&StageName::Analysis];
        assert_eq!(analysis.outputs[0].hash, outputs[&StageName::Analysis].hash);
        let failed: Vec<_> = analysis.failures.iter().map(|f| f.unit.as_str()).collect();
        assert_eq!(failed, ["b"]);
        assert!(plan.reused[&StageName::StatisticalPreparation].failures.is_empty());
    }

    #[tokio::test]
    async fn test_partial_analysis_alone_is_not_reused() {
        let f = fixture().await;
        parent_run(
            &f,
            "20260101T000000000Z-aaaaaaaa",
            false,
            &[
                (StageName::PreflightValidation, EntryStatus::Success),
                (StageName::Analysis, EntryStatus::Partial),
            ],
            &[("a", EntryStatus::Success), ("b", EntryStatus::Failed)],
            RunStatus::Failed,
        )
        .await;

        let err = ResumeController::new(&f.layout, &f.store)
            .plan(
                &f.spec,
                &ResumeRequest::latest().from_stage(StageName::StatisticalPreparation),
                StageName::Finalization,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ResumeError::StageIncomplete {
                stage: StageName::Analysis,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_no_predecessor() {
        let f = fixture().await;
        let err = ResumeController::new(&f.layout, &f.store)
            .plan(&f.spec, &ResumeRequest::latest(), StageName::Finalization)
            .await
            .unwrap_err();
        assert!(matches!(err, ResumeError::NoPredecessor { .. }));
    }

    #[tokio::test]
    async fn test_promote_copies_completed_run_once() {
        let f = fixture().await;
        let id = "20260101T000000000Z-aaaaaaaa";
        parent_run(
            &f,
            id,
            true,
            &[(StageName::PreflightValidation, EntryStatus::Success)],
            &[],
            RunStatus::Completed,
        )
        .await;

        let controller = ResumeController::new(&f.layout, &f.store);
        let report = controller.promote(None).await.unwrap();
        assert_eq!(report.run_id, id);
        assert_eq!(report.artifacts, 1);
        let promoted = f.layout.run_paths(id, false);
        assert!(promoted.manifest().exists());
        assert!(promoted.run_record().exists());

        let err = controller.promote(Some(id)).await.unwrap_err();
        assert!(matches!(err, ResumeError::AlreadyPromoted(_)));
    }

    #[tokio::test]
    async fn test_promote_refuses_unfinished_and_corrupt_runs() {
        let f = fixture().await;
        let failed = "20260101T000000000Z-aaaaaaaa";
        parent_run(&f, failed, true, &[], &[], RunStatus::Failed).await;
        let controller = ResumeController::new(&f.layout, &f.store);
        let err = controller.promote(Some(failed)).await.unwrap_err();
        assert!(matches!(err, ResumeError::NotCompleted { .. }));

        let done = "20260102T000000000Z-bbbbbbbb";
        let outputs = parent_run(
            &f,
            done,
            true,
            &[(StageName::PreflightValidation, EntryStatus::Success)],
            &[],
            RunStatus::Completed,
        )
        .await;
        let copy = f
            .layout
            .run_paths(done, true)
            .artifact(&outputs[&StageName::PreflightValidation].hash);
        std::fs::write(copy, b"tampered").unwrap();

        let err = controller.promote(Some(done)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptArtifact);
        assert!(!f.layout.run_paths(done, false).dir().exists());
    }
}
