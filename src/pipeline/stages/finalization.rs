//! Finalization: pack every run artifact into a reproducible tar.gz bundle.
//!
//! Identical inputs produce a byte-identical bundle: entries are sorted, and
//! every timestamp, owner and mode in the archive is fixed.

use std::io::Write;

use async_trait::async_trait;
use flate2::{Compression, GzBuilder};
use serde::Serialize;
use tar::{Builder as TarBuilder, EntryType, Header};
use tracing::{debug, info};

use super::{
    load_json, StageContext, StageError, StageExecutor, StageInputs, StageOutcome, SynthesisReport,
};
use crate::pipeline::run::StageName;
use crate::storage::{write_atomic, ArtifactKind, ContentHash, Fingerprint, PutRequest};

const BUNDLE_FORMAT: &str = "1";

#[derive(Debug, Serialize)]
struct BundleEntry {
    stage: StageName,
    kind: ArtifactKind,
    hash: ContentHash,
    path: String,
}

#[derive(Debug, Serialize)]
struct BundleIndex<'a> {
    experiment: &'a str,
    spec_hash: &'a str,
    framework: &'a str,
    framework_version: &'a str,
    artifacts: Vec<BundleEntry>,
}

/// Builds a gzip-compressed tarball from `(path, bytes)` pairs.
///
/// Output depends only on the entries: they are written in path order with
/// zeroed timestamps and owners, and the gzip header carries no mtime.
pub fn build_tarball(mut entries: Vec<(String, Vec<u8>)>) -> std::io::Result<Vec<u8>> {
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let encoder = GzBuilder::new().mtime(0).write(Vec::new(), Compression::default());
    let mut tar = TarBuilder::new(encoder);
    tar.mode(tar::HeaderMode::Deterministic);

    for (path, data) in &entries {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        tar.append_data(&mut header, path, data.as_slice())?;
    }

    let mut encoder = tar.into_inner()?;
    encoder.flush()?;
    encoder.finish()
}

/// Packs the run's artifacts into the delivery bundle.
pub struct FinalizationStage;

#[async_trait]
impl StageExecutor for FinalizationStage {
    fn stage(&self) -> StageName {
        StageName::Finalization
    }

    async fn execute(&self, ctx: &StageContext, inputs: &StageInputs) -> Result<StageOutcome, StageError> {
        let stage = StageName::Finalization;
        let spec = &ctx.spec;

        let handles: Vec<_> = inputs
            .artifacts
            .iter()
            .filter(|(s, _)| **s < stage)
            .flat_map(|(_, handles)| handles.iter())
            .collect();
        if handles.is_empty() {
            return Err(StageError::MissingInput {
                stage,
                message: "no artifacts to bundle".to_string(),
            });
        }

        let fingerprint = Fingerprint::builder(stage.as_str())
            .field("format", BUNDLE_FORMAT)
            .field("spec", spec.spec_hash())
            .list(
                "artifacts",
                handles.iter().map(|h| format!("{}:{}", h.stage, h.hash)),
            )
            .finish();
        let input_hashes: Vec<ContentHash> = handles.iter().map(|h| h.hash.clone()).collect();

        let cached = ctx.store.exists(&fingerprint).await?;
        ctx.metrics.record_cache_lookup(stage.as_str(), cached.is_some());

        let (handle, bytes, cache_hit) = match cached {
            Some(handle) => {
                debug!(fingerprint = %fingerprint.short(), "Bundle cached");
                let bytes = ctx.store.get_verified(&handle.hash).await?;
                (handle, bytes, true)
            }
            None => {
                let mut entries = Vec::with_capacity(handles.len() + 2);
                let mut index = Vec::with_capacity(handles.len());
                for handle in &handles {
                    let data = ctx.store.get_verified(&handle.hash).await?;
                    let path = format!(
                        "artifacts/{}/{}.{}",
                        handle.stage,
                        handle.hash,
                        handle.kind.extension()
                    );
                    index.push(BundleEntry {
                        stage: handle.stage,
                        kind: handle.kind,
                        hash: handle.hash.clone(),
                        path: path.clone(),
                    });
                    entries.push((path, data));

                    if handle.kind == ArtifactKind::SynthesisReport {
                        let report: SynthesisReport = load_json(&ctx.store, &handle.hash).await?;
                        entries.push(("report.md".to_string(), format!("{}\n", report.narrative).into_bytes()));
                    }
                }

                let bundle_index = BundleIndex {
                    experiment: &spec.name,
                    spec_hash: spec.spec_hash(),
                    framework: &spec.framework.name,
                    framework_version: &spec.framework.version,
                    artifacts: index,
                };
                let index_bytes = crate::storage::canonical_json_pretty(&bundle_index)
                    .map_err(|e| StageError::Export(e.to_string()))?;
                entries.push(("bundle.json".to_string(), index_bytes));

                let bytes = tokio::task::spawn_blocking(move || build_tarball(entries))
                    .await
                    .map_err(|e| StageError::Export(e.to_string()))?
                    .map_err(|e| StageError::Export(e.to_string()))?;
                let handle = ctx
                    .store
                    .put(
                        &bytes,
                        PutRequest::new(stage, ArtifactKind::DeliveryBundle).with_fingerprint(fingerprint.clone()),
                    )
                    .await?;
                (handle, bytes, false)
            }
        };

        let bundle_path = ctx.paths.bundle();
        write_atomic(&bundle_path, &bytes)
            .await
            .map_err(|e| StageError::Export(format!("{}: {}", bundle_path.display(), e)))?;

        info!(
            run_id = %ctx.run_id,
            artifacts = handles.len(),
            bytes = bytes.len(),
            hash = %handle.hash.short(),
            cache_hit,
            "Delivery bundle written"
        );

        Ok(StageOutcome::success(input_hashes, vec![handle])
            .with_fingerprint(fingerprint)
            .cache_hit(cache_hit))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{context, spec, EchoScorer};
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn list(bytes: &[u8]) -> Vec<(String, String)> {
        let mut archive = tar::Archive::new(GzDecoder::new(bytes));
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let path = entry.path().unwrap().to_string_lossy().to_string();
                let mut body = String::new();
                entry.read_to_string(&mut body).unwrap();
                (path, body)
            })
            .collect()
    }

    #[test]
    fn test_tarball_is_order_independent_and_reproducible() {
        let a = build_tarball(vec![("b.txt".into(), b"two".to_vec()), ("a.txt".into(), b"one".to_vec())]).unwrap();
        let b = build_tarball(vec![("a.txt".into(), b"one".to_vec()), ("b.txt".into(), b"two".to_vec())]).unwrap();
        assert_eq!(a, b);

        let entries = list(&a);
        assert_eq!(entries[0], ("a.txt".to_string(), "one".to_string()));
        assert_eq!(entries[1], ("b.txt".to_string(), "two".to_string()));
    }

    #[tokio::test]
    async fn test_bundle_contains_index_and_artifacts() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, spec(&[("a", "alpha")]), Arc::new(EchoScorer::new())).await;

        let report = ctx
            .store
            .put(b"{\"ok\": true}", PutRequest::new(StageName::PreflightValidation, ArtifactKind::ValidationReport))
            .await
            .unwrap();
        let mut inputs = StageInputs::default();
        inputs.artifacts.insert(StageName::PreflightValidation, vec![report.clone()]);

        let first = FinalizationStage.execute(&ctx, &inputs).await.unwrap();
        let on_disk = std::fs::read(ctx.paths.bundle()).unwrap();
        let entries = list(&on_disk);
        let names: Vec<_> = entries.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(
            names,
            [
                format!("artifacts/preflight_validation/{}.json", report.hash).as_str(),
                "bundle.json"
            ]
        );
        assert!(entries[1].1.contains(&report.hash.to_string()));

        let second = FinalizationStage.execute(&ctx, &inputs).await.unwrap();
        assert!(second.cache_hit);
        assert_eq!(first.outputs[0].hash, second.outputs[0].hash);
    }

    #[tokio::test]
    async fn test_nothing_to_bundle_is_an_error() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, spec(&[("a", "alpha")]), Arc::new(EchoScorer::new())).await;
        let err = FinalizationStage.execute(&ctx, &StageInputs::default()).await.unwrap_err();
        assert!(matches!(err, StageError::MissingInput { .. }));
    }
}
