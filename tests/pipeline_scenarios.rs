//! End-to-end runs against an experiment directory on disk.

mod common;

use std::sync::Arc;

use analysis_forge::llm::AttemptOutcome;
use analysis_forge::pipeline::{
    PipelineConfig, ResumeController, ResumeRequest, RunOptions, RunStatus, RunTarget, StageName,
};
use analysis_forge::provenance::{EntryStatus, LeaseInfo, Manifest, RunLease};
use analysis_forge::storage::ArtifactStore;
use chrono::Utc;
use common::{corpus, Fixture};

fn offramp() -> RunOptions {
    RunOptions {
        target: RunTarget::StatisticalPrep,
        ..RunOptions::default()
    }
}

fn resume(request: ResumeRequest) -> RunOptions {
    RunOptions {
        resume: Some(request),
        ..RunOptions::default()
    }
}

async fn manifest(run_dir: &std::path::Path) -> Manifest {
    Manifest::load(&run_dir.join("manifest.json")).await.unwrap()
}

#[tokio::test]
async fn test_statistical_prep_offramp() {
    let f = Fixture::new(&corpus()[..2]);
    let report = f.orchestrator().run(f.spec.clone(), offramp()).await.unwrap();

    assert_eq!(report.run.status, RunStatus::Completed);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.stages.len(), 3);
    assert_eq!(f.provider.analysis_calls(), 2);

    let exports = report.run_dir.join("exports/statistical_package");
    for file in ["data.csv", "data.parquet", "codebook.json"] {
        assert!(exports.join(file).exists(), "missing {file}");
    }
    assert!(!report.run_dir.join("bundle.tar.gz").exists());

    let csv = std::fs::read_to_string(exports.join("data.csv")).unwrap();
    assert_eq!(csv.lines().count(), 3);
    assert!(csv.starts_with("document_id,document_hash,analysis_hash,model_used,warmth,hostility,warmth_ratio"));
}

#[tokio::test]
async fn test_tolerated_partial_continues_to_the_end() {
    let f = Fixture::new(&corpus()).with_spec(|s| s.with_settings(|m| m.tolerate_partial = true));
    f.provider.fail_on("They lie");

    let report = f.orchestrator().run(f.spec.clone(), RunOptions::default()).await.unwrap();

    assert_eq!(report.run.status, RunStatus::Completed);
    assert!(report.tolerated_partial);
    assert_eq!(report.exit_code(), 1);
    assert!(report.run_dir.join("bundle.tar.gz").exists());

    let csv = std::fs::read_to_string(report.run_dir.join("exports/statistical_package/data.csv")).unwrap();
    assert_eq!(csv.lines().count(), 5);
    assert!(!csv.contains("speech-04"));

    let manifest = manifest(&report.run_dir).await;
    assert_eq!(manifest.stage_entry(StageName::Analysis).unwrap().status, EntryStatus::Partial);
    let failed: Vec<_> = manifest
        .failures()
        .iter()
        .filter_map(|e| e.unit.clone())
        .collect();
    assert_eq!(failed, ["speech-04"]);
}

#[tokio::test]
async fn test_partial_analysis_halts_by_default() {
    let f = Fixture::new(&corpus());
    f.provider.fail_on("They lie");

    let report = f.orchestrator().run(f.spec.clone(), RunOptions::default()).await.unwrap();

    assert_eq!(report.run.status, RunStatus::Failed);
    assert_eq!(report.exit_code(), 11);
    let failure = report.run.failure.as_ref().unwrap();
    assert_eq!(failure.stage, StageName::Analysis);
    assert!(failure.message.contains("speech-04"));
    assert!(!report.run_dir.join("exports").exists());
    assert_eq!(f.provider.analysis_calls(), 5);
}

#[tokio::test]
async fn test_documents_are_analysed_at_most_once() {
    let f = Fixture::new(&corpus());
    let orchestrator = f.orchestrator();

    let first = orchestrator.run(f.spec.clone(), RunOptions::default()).await.unwrap();
    let second = orchestrator.run(f.spec.clone(), RunOptions::default()).await.unwrap();

    assert_eq!(first.exit_code(), 0);
    assert_eq!(second.exit_code(), 0);
    assert_ne!(first.run.run_id, second.run.run_id);
    assert_eq!(f.provider.analysis_calls(), 5);

    let manifest = manifest(&second.run_dir).await;
    assert!(manifest.unit_entries(StageName::Analysis).all(|e| e.cache_hit));
}

#[tokio::test]
async fn test_resume_reuses_successful_documents() {
    let f = Fixture::new(&corpus());
    f.provider.fail_on("They lie");
    let orchestrator = f.orchestrator();

    let failed = orchestrator.run(f.spec.clone(), RunOptions::default()).await.unwrap();
    assert_eq!(failed.run.status, RunStatus::Failed);

    f.provider.heal();
    let resumed = orchestrator
        .run(f.spec.clone(), resume(ResumeRequest::latest()))
        .await
        .unwrap();

    assert_eq!(resumed.run.status, RunStatus::Completed);
    assert_eq!(resumed.run.parent_run_id.as_deref(), Some(failed.run.run_id.as_str()));
    assert_eq!(f.provider.analysis_calls(), 6);
    assert_eq!(f.provider.analysed().last().map(String::as_str), Some("speech-04"));

    // The failed run stays as it was.
    let original = manifest(&failed.run_dir).await;
    assert_eq!(original.stage_entry(StageName::Analysis).unwrap().status, EntryStatus::Partial);
    assert!(original.stage_entry(StageName::Finalization).is_none());
}

#[tokio::test]
async fn test_corrupt_artifact_stops_resume() {
    let f = Fixture::new(&corpus()[..3]);
    let orchestrator = f.orchestrator();
    let prep = orchestrator.run(f.spec.clone(), offramp()).await.unwrap();
    assert_eq!(prep.exit_code(), 0);

    let analysis = manifest(&prep.run_dir).await;
    let hash = analysis.stage_entry(StageName::Analysis).unwrap().outputs[0].clone();
    let store = ArtifactStore::new(orchestrator.layout().store_root());
    std::fs::write(store.blob_path(&hash), b"{\"tampered\": true}").unwrap();

    let err = orchestrator
        .run(f.spec.clone(), resume(ResumeRequest::latest()))
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), 20);
    assert_eq!(orchestrator.layout().list_runs(false).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_statistical_package_is_reproducible() {
    let a = Fixture::new(&corpus());
    let b = Fixture::new(&corpus());

    let first = a.orchestrator().run(a.spec.clone(), offramp()).await.unwrap();
    let second = b.orchestrator().run(b.spec.clone(), offramp()).await.unwrap();

    assert_eq!(a.spec.spec_hash(), b.spec.spec_hash());
    let package = |m: &Manifest| m.stage_entry(StageName::StatisticalPreparation).unwrap().outputs.clone();
    assert_eq!(
        package(&manifest(&first.run_dir).await),
        package(&manifest(&second.run_dir).await)
    );

    let csv = |dir: &std::path::Path| std::fs::read(dir.join("exports/statistical_package/data.csv")).unwrap();
    assert_eq!(csv(&first.run_dir), csv(&second.run_dir));
}

#[tokio::test]
async fn test_cancelled_run_pauses_and_resumes() {
    let f = Fixture::new(&corpus());
    let orchestrator = f.orchestrator_with(PipelineConfig::default().with_max_concurrent_units(1));

    let options = RunOptions::default();
    f.provider.cancel_after(2, options.cancel.clone());
    let paused = orchestrator.run(f.spec.clone(), options).await.unwrap();

    assert_eq!(paused.run.status, RunStatus::Paused);
    assert_eq!(paused.exit_code(), 130);
    assert_eq!(f.provider.analysis_calls(), 2);
    assert!(!paused.run_dir.join(".lease").exists());

    let resumed = orchestrator
        .run(f.spec.clone(), resume(ResumeRequest::latest()))
        .await
        .unwrap();
    assert_eq!(resumed.run.status, RunStatus::Completed);
    assert_eq!(f.provider.analysis_calls(), 5);

    let mut analysed = f.provider.analysed();
    analysed.sort();
    analysed.dedup();
    assert_eq!(analysed.len(), 5);
}

#[tokio::test]
async fn test_leased_predecessor_cannot_be_resumed() {
    let f = Fixture::new(&corpus()[..2]);
    let orchestrator = f.orchestrator();
    let prep = orchestrator.run(f.spec.clone(), offramp()).await.unwrap();

    let _held = RunLease::acquire(prep.run_dir.join(".lease"), &prep.run.run_id).unwrap();
    let err = orchestrator
        .run(f.spec.clone(), resume(ResumeRequest::latest()))
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), 3);
}

#[tokio::test]
async fn test_workbench_run_is_promoted() {
    let f = Fixture::new(&corpus()[..2]);
    let orchestrator = f.orchestrator();
    let options = RunOptions {
        workbench: true,
        ..RunOptions::default()
    };
    let report = orchestrator.run(f.spec.clone(), options).await.unwrap();
    assert_eq!(report.exit_code(), 0);
    assert!(report.run_dir.starts_with(f.dir.path().join("workbench")));

    let layout = orchestrator.layout();
    let store = ArtifactStore::open(layout.store_root()).await.unwrap();
    let promoted = ResumeController::new(layout, &store).promote(None).await.unwrap();

    assert_eq!(promoted.run_id, report.run.run_id);
    assert!(promoted.destination.join("bundle.tar.gz").exists());
    assert!(promoted.destination.join("manifest.json").exists());
    assert_eq!(layout.list_runs(false).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_resume_from_stats_reruns_synthesis_only() {
    let f = Fixture::new(&corpus()[..3]);
    let orchestrator = f.orchestrator();
    let prep = orchestrator.run(f.spec.clone(), offramp()).await.unwrap();
    assert_eq!(prep.exit_code(), 0);

    let options = resume(ResumeRequest::latest().from_stage(StageName::Synthesis));
    let report = orchestrator.run(Arc::clone(&f.spec), options).await.unwrap();

    assert_eq!(report.run.status, RunStatus::Completed);
    assert_eq!(f.provider.analysis_calls(), 3);

    let manifest = manifest(&report.run_dir).await;
    for stage in [StageName::Analysis, StageName::StatisticalPreparation] {
        assert_eq!(manifest.stage_entry(stage).unwrap().status, EntryStatus::Reused);
    }
    assert_eq!(manifest.stage_entry(StageName::Synthesis).unwrap().status, EntryStatus::Success);
    assert!(report.run_dir.join("exports/statistical_package/data.csv").exists());
    assert!(report.run_dir.join("bundle.tar.gz").exists());
}

#[tokio::test]
async fn test_lease_of_killed_run_does_not_block_resume() {
    let f = Fixture::new(&corpus()[..2]);
    let orchestrator = f.orchestrator();
    let prep = orchestrator.run(f.spec.clone(), offramp()).await.unwrap();

    // What a SIGKILLed holder leaves behind.
    let lease = prep.run_dir.join(".lease");
    let dead = LeaseInfo {
        run_id: prep.run.run_id.clone(),
        owner: uuid::Uuid::new_v4(),
        pid: 4_000_000_000,
        acquired_at: Utc::now() - chrono::Duration::days(2),
    };
    std::fs::write(&lease, serde_json::to_vec(&dead).unwrap()).unwrap();

    let resumed = orchestrator
        .run(f.spec.clone(), resume(ResumeRequest::latest()))
        .await
        .unwrap();
    assert_eq!(resumed.run.status, RunStatus::Completed);
    assert_eq!(resumed.exit_code(), 0);
    assert_eq!(resumed.run.parent_run_id.as_deref(), Some(prep.run.run_id.as_str()));
    assert_eq!(f.provider.analysis_calls(), 2);
    assert!(!lease.exists());
}

#[tokio::test]
async fn test_tolerated_partial_offramp_resumes_into_synthesis() {
    let f = Fixture::new(&corpus()).with_spec(|s| s.with_settings(|m| m.tolerate_partial = true));
    f.provider.fail_on("They lie");
    let orchestrator = f.orchestrator();

    let prep = orchestrator.run(f.spec.clone(), offramp()).await.unwrap();
    assert_eq!(prep.exit_code(), 1);

    let options = resume(ResumeRequest::latest().from_stage(StageName::Synthesis));
    let report = orchestrator.run(Arc::clone(&f.spec), options).await.unwrap();

    assert_eq!(report.run.status, RunStatus::Completed);
    assert!(report.tolerated_partial);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(f.provider.analysis_calls(), 5);
    assert!(report.run_dir.join("bundle.tar.gz").exists());

    let manifest = manifest(&report.run_dir).await;
    let analysis = manifest.stage_entry(StageName::Analysis).unwrap();
    assert_eq!(analysis.status, EntryStatus::Reused);
    assert!(analysis.error.as_ref().unwrap().message.contains("speech-04"));
    assert_eq!(manifest.stage_entry(StageName::Synthesis).unwrap().status, EntryStatus::Success);
}

const FALLBACK_MODELS_YAML: &str = r#"
models:
  - id: mock-stalled
    provider: mock
    tier: flagship
  - id: mock-large
    provider: mock
    tier: flagship
    pricing: { input_per_1m: 2.0, output_per_1m: 8.0 }
matrix:
  analysis:
    standard: [mock-stalled, mock-large]
  synthesis:
    standard: [mock-large]
"#;

#[tokio::test]
async fn test_timed_out_candidate_is_recorded_in_manifest() {
    let f = Fixture::new(&corpus()[..1]).with_models(FALLBACK_MODELS_YAML);
    f.provider.stall("mock-stalled");

    let report = f.orchestrator().run(f.spec.clone(), offramp()).await.unwrap();
    assert_eq!(report.exit_code(), 0);

    let manifest = manifest(&report.run_dir).await;
    let unit = manifest.unit_entries(StageName::Analysis).next().unwrap();
    assert_eq!(unit.status, EntryStatus::Success);
    assert_eq!(unit.model_used.as_deref(), Some("mock-large"));

    let tried: Vec<_> = unit.attempts.iter().map(|a| a.model.as_str()).collect();
    assert_eq!(tried, ["mock-stalled", "mock-large"]);
    assert_eq!(unit.attempts[0].outcome, AttemptOutcome::RetriesExhausted);
    assert_eq!(unit.attempts[1].outcome, AttemptOutcome::Succeeded);
}
