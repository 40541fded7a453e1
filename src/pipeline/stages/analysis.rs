//! Analysis: one model call per document, cached by fingerprint.
//!
//! Each document is a work unit. A unit resolves, in order, from the parent
//! run (pre-resolved and verified), from the artifact store (same fingerprint
//! seen before), or from the model gateway. Units run concurrently under a
//! semaphore; one unit's failure is recorded and never aborts its siblings.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{
    store_json, StageContext, StageError, StageExecutor, StageInputs, StageOutcome, UnitFailure,
};
use crate::error::ErrorKind;
use crate::llm::gateway::score_value;
use crate::llm::{CompletionRequest, Message, ResponseFormat};
use crate::pipeline::run::StageName;
use crate::pipeline::spec::{Document, ExperimentSpec};
use crate::provenance::{EntryStatus, ManifestEntry};
use crate::storage::{ArtifactHandle, ArtifactKind, ContentHash, Fingerprint, PutRequest};

/// Bumped whenever the analysis artifact layout or prompt shape changes.
const ANALYSIS_FORMAT: &str = "1";

/// Stored result of analysing one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub document_id: String,
    pub document_hash: ContentHash,
    pub framework: String,
    pub framework_version: String,
    pub prompt_version: String,
    pub model_used: String,
    /// Score per framework dimension.
    pub scores: BTreeMap<String, f64>,
    /// The validated reply object, kept for audit.
    pub response: Value,
}

/// Fingerprint of one analysis work unit.
pub fn unit_fingerprint(
    spec: &ExperimentSpec,
    document: &Document,
    models: &[String],
    temperature: f64,
) -> Fingerprint {
    Fingerprint::builder(StageName::Analysis.as_str())
        .field("format", ANALYSIS_FORMAT)
        .field("document", document.hash.as_str())
        .field("framework", &spec.framework_hash())
        .field("prompt_version", &spec.framework.prompt_version)
        .field("capability", &spec.models.analysis_capability)
        .field("safety_tier", spec.models.safety_tier.as_str())
        .list("models", models)
        .field("temperature", &temperature.to_string())
        .finish()
}

fn build_messages(spec: &ExperimentSpec, document: &Document) -> Vec<Message> {
    let framework = &spec.framework;
    let mut keys = String::new();
    for dimension in &framework.dimensions {
        keys.push_str(&format!("- \"{}\": {}\n", dimension.id, dimension.description));
    }

    let system = format!(
        "{}\n\nReturn only a JSON object with one numeric score per key:\n{}\
         A key may also map to an object with a numeric \"score\" and supporting \"evidence\".",
        framework.instructions.trim(),
        keys
    );
    let user = format!("Document {}:\n\n{}", document.id, document.text);
    vec![Message::system(system), Message::user(user)]
}

enum UnitOutcome {
    Resolved { unit: String, handle: ArtifactHandle, cost: f64, model: Option<String> },
    Failed(UnitFailure),
    Cancelled,
}

/// Per-document analysis.
pub struct AnalysisStage;

impl AnalysisStage {
    async fn resolve_unit(
        &self,
        ctx: &StageContext,
        document: &Document,
        fingerprint: Fingerprint,
        preresolved: Option<&ArtifactHandle>,
        limiter: &Semaphore,
        halted: &AtomicBool,
    ) -> Result<UnitOutcome, StageError> {
        let stage = StageName::Analysis;
        let Ok(_permit) = limiter.acquire().await else {
            return Ok(UnitOutcome::Cancelled);
        };

        let started = Utc::now();
        let entry = ManifestEntry::for_unit(stage, &document.id, started)
            .with_fingerprint(fingerprint.clone())
            .with_inputs(vec![document.hash.clone()]);

        if ctx.cancel.is_cancelled() || halted.load(Ordering::SeqCst) {
            ctx.journal
                .append(
                    entry
                        .with_error(ErrorKind::Cancelled, "stopped before the unit started")
                        .finish(EntryStatus::Cancelled, Utc::now()),
                )
                .await?;
            ctx.metrics.record_unit(stage.as_str(), EntryStatus::Cancelled.as_str());
            return Ok(UnitOutcome::Cancelled);
        }

        ctx.metrics.unit_started();
        let result = self
            .compute_unit(ctx, document, fingerprint, preresolved, entry)
            .await;
        ctx.metrics.unit_finished();

        if result.is_err() {
            halted.store(true, Ordering::SeqCst);
        }
        result
    }

    async fn compute_unit(
        &self,
        ctx: &StageContext,
        document: &Document,
        fingerprint: Fingerprint,
        preresolved: Option<&ArtifactHandle>,
        entry: ManifestEntry,
    ) -> Result<UnitOutcome, StageError> {
        let stage = StageName::Analysis;

        if let Some(handle) = preresolved {
            debug!(unit = %document.id, hash = %handle.hash.short(), "Reusing unit from parent run");
            ctx.journal
                .append(
                    entry
                        .with_outputs(vec![handle.hash.clone()])
                        .cache_hit(true)
                        .finish(EntryStatus::Reused, Utc::now()),
                )
                .await?;
            ctx.metrics.record_unit(stage.as_str(), EntryStatus::Reused.as_str());
            return Ok(UnitOutcome::Resolved {
                unit: document.id.clone(),
                handle: handle.clone(),
                cost: 0.0,
                model: None,
            });
        }

        let cached = ctx.store.exists(&fingerprint).await?;
        ctx.metrics.record_cache_lookup(stage.as_str(), cached.is_some());
        if let Some(handle) = cached {
            debug!(unit = %document.id, fingerprint = %fingerprint.short(), "Cache hit");
            ctx.journal
                .append(
                    entry
                        .with_outputs(vec![handle.hash.clone()])
                        .cache_hit(true)
                        .finish(EntryStatus::Success, Utc::now()),
                )
                .await?;
            ctx.metrics.record_unit(stage.as_str(), EntryStatus::Success.as_str());
            return Ok(UnitOutcome::Resolved {
                unit: document.id.clone(),
                handle,
                cost: 0.0,
                model: None,
            });
        }

        let spec = &ctx.spec;
        let request = CompletionRequest::new(
            spec.models.analysis_capability.clone(),
            spec.models.safety_tier,
            build_messages(spec, document),
        )
        .with_temperature(ctx.config.analysis_temperature)
        .with_max_tokens(ctx.config.max_tokens)
        .with_format(ResponseFormat::Scores {
            keys: spec.framework.dimension_ids(),
        })
        .allow_experimental(spec.models.allow_experimental);

        match ctx.gateway.complete(&request).await {
            Ok(result) => {
                let response = result.json.clone().unwrap_or(Value::Null);
                let scores = spec
                    .framework
                    .dimensions
                    .iter()
                    .filter_map(|d| {
                        response
                            .get(&d.id)
                            .and_then(score_value)
                            .map(|score| (d.id.clone(), score))
                    })
                    .collect();
                let record = AnalysisRecord {
                    document_id: document.id.clone(),
                    document_hash: document.hash.clone(),
                    framework: spec.framework.name.clone(),
                    framework_version: spec.framework.version.clone(),
                    prompt_version: spec.framework.prompt_version.clone(),
                    model_used: result.model_used.clone(),
                    scores,
                    response,
                };

                let (handle, _) = store_json(
                    &ctx.store,
                    &record,
                    PutRequest::new(stage, ArtifactKind::RawAnalysis).with_fingerprint(fingerprint),
                )
                .await?;

                ctx.journal
                    .append(
                        entry
                            .with_outputs(vec![handle.hash.clone()])
                            .with_model(Some(result.model_used.clone()))
                            .with_attempts(result.attempts)
                            .with_cost(Some(result.cost_estimate))
                            .finish(EntryStatus::Success, Utc::now()),
                    )
                    .await?;
                ctx.metrics.record_unit(stage.as_str(), EntryStatus::Success.as_str());

                Ok(UnitOutcome::Resolved {
                    unit: document.id.clone(),
                    handle,
                    cost: result.cost_estimate,
                    model: Some(result.model_used),
                })
            }
            Err(e) => {
                warn!(run_id = %ctx.run_id, unit = %document.id, error = %e, "Work unit failed");
                let kind = e.kind();
                let message = e.to_string();
                let seq = ctx
                    .journal
                    .append(
                        entry
                            .with_attempts(e.attempts().to_vec())
                            .with_error(kind, &message)
                            .finish(EntryStatus::Failed, Utc::now()),
                    )
                    .await?;
                ctx.metrics.record_unit(stage.as_str(), EntryStatus::Failed.as_str());

                Ok(UnitOutcome::Failed(UnitFailure {
                    unit: document.id.clone(),
                    kind,
                    message,
                    entry_seq: seq,
                }))
            }
        }
    }
}

#[async_trait]
impl StageExecutor for AnalysisStage {
    fn stage(&self) -> StageName {
        StageName::Analysis
    }

    async fn execute(&self, ctx: &StageContext, inputs: &StageInputs) -> Result<StageOutcome, StageError> {
        let spec = &ctx.spec;
        let plan = ctx.gateway.plan(
            &spec.models.analysis_capability,
            spec.models.safety_tier,
            spec.models.allow_experimental,
        )?;
        let models = plan.eligible_ids();

        let limiter = Semaphore::new(ctx.config.max_concurrent_units.max(1));
        let halted = AtomicBool::new(false);

        info!(
            run_id = %ctx.run_id,
            documents = spec.documents.len(),
            preresolved = inputs.preresolved.len(),
            concurrency = ctx.config.max_concurrent_units,
            "Starting analysis"
        );

        let units = spec.documents.iter().map(|document| {
            let fingerprint =
                unit_fingerprint(spec, document, &models, ctx.config.analysis_temperature);
            self.resolve_unit(
                ctx,
                document,
                fingerprint,
                inputs.preresolved.get(&document.id),
                &limiter,
                &halted,
            )
        });
        let results = futures::future::join_all(units).await;

        let mut resolved: BTreeMap<String, ArtifactHandle> = BTreeMap::new();
        let mut failures = Vec::new();
        let mut cancelled = 0usize;
        let mut cost = 0.0;
        let mut models_used = BTreeSet::new();
        let mut fatal = None;

        for result in results {
            match result {
                Ok(UnitOutcome::Resolved { unit, handle, cost: unit_cost, model }) => {
                    cost += unit_cost;
                    models_used.extend(model);
                    resolved.insert(unit, handle);
                }
                Ok(UnitOutcome::Failed(failure)) => failures.push(failure),
                Ok(UnitOutcome::Cancelled) => cancelled += 1,
                Err(e) => {
                    fatal.get_or_insert(e);
                }
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }

        if cancelled > 0 {
            return Err(StageError::Cancelled {
                stage: StageName::Analysis,
                completed: resolved.len() + failures.len(),
                cancelled,
            });
        }

        failures.sort_by(|a, b| a.unit.cmp(&b.unit));
        if resolved.is_empty() && !failures.is_empty() {
            return Err(StageError::AllUnitsFailed {
                stage: StageName::Analysis,
                failures,
            });
        }

        let status = if failures.is_empty() {
            EntryStatus::Success
        } else {
            EntryStatus::Partial
        };
        info!(
            run_id = %ctx.run_id,
            succeeded = resolved.len(),
            failed = failures.len(),
            status = %status,
            "Analysis finished"
        );

        let inputs = spec.documents.iter().map(|d| d.hash.clone()).collect();
        let outcome = StageOutcome {
            status,
            inputs,
            outputs: resolved.into_values().collect(),
            fingerprint: None,
            failures,
            model_used: (!models_used.is_empty())
                .then(|| models_used.into_iter().collect::<Vec<_>>().join(",")),
            attempts: Vec::new(),
            cost: Some(cost),
            cache_hit: false,
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{context, spec, EchoScorer};
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_every_document_becomes_an_artifact() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(EchoScorer::new());
        let ctx = context(&dir, spec(&[("b", "bravo"), ("a", "alpha")]), provider.clone()).await;

        let outcome = AnalysisStage.execute(&ctx, &StageInputs::default()).await.unwrap();
        assert_eq!(outcome.status, EntryStatus::Success);
        assert_eq!(outcome.outputs.len(), 2);
        assert_eq!(provider.call_count(), 2);

        let record: AnalysisRecord = super::super::load_json(&ctx.store, &outcome.outputs[0].hash)
            .await
            .unwrap();
        assert_eq!(record.document_id, "a");
        assert_eq!(record.scores["hostility"], 2.0);
        assert!(record.scores.contains_key("warmth"));

        let manifest = ctx.journal.snapshot().await;
        assert_eq!(manifest.unit_entries(StageName::Analysis).count(), 2);
    }

    #[tokio::test]
    async fn test_second_execution_makes_no_calls() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(EchoScorer::new());
        let ctx = context(&dir, spec(&[("a", "alpha"), ("b", "bravo")]), provider.clone()).await;

        let first = AnalysisStage.execute(&ctx, &StageInputs::default()).await.unwrap();
        let second = AnalysisStage.execute(&ctx, &StageInputs::default()).await.unwrap();

        assert_eq!(provider.call_count(), 2);
        let hashes = |o: &StageOutcome| o.outputs.iter().map(|h| h.hash.clone()).collect::<Vec<_>>();
        assert_eq!(hashes(&first), hashes(&second));
        assert_eq!(second.cost, Some(0.0));

        let manifest = ctx.journal.snapshot().await;
        let hits = manifest
            .unit_entries(StageName::Analysis)
            .filter(|e| e.cache_hit)
            .count();
        assert_eq!(hits, 2);
    }

    #[tokio::test]
    async fn test_failing_document_makes_stage_partial() {
        let dir = TempDir::new().unwrap();
        let ctx = context(
            &dir,
            spec(&[("a", "alpha"), ("b", "FAIL here"), ("c", "charlie")]),
            Arc::new(EchoScorer::new()),
        )
        .await;

        let outcome = AnalysisStage.execute(&ctx, &StageInputs::default()).await.unwrap();
        assert_eq!(outcome.status, EntryStatus::Partial);
        assert_eq!(outcome.outputs.len(), 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].unit, "b");
        assert_eq!(outcome.failures[0].kind, ErrorKind::AllCandidatesExhausted);

        let manifest = ctx.journal.snapshot().await;
        let failed = &manifest.entries[outcome.failures[0].entry_seq as usize];
        assert_eq!(failed.unit.as_deref(), Some("b"));
        assert_eq!(failed.attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_all_units_failing_is_a_stage_error() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, spec(&[("a", "FAIL")]), Arc::new(EchoScorer::new())).await;

        let err = AnalysisStage.execute(&ctx, &StageInputs::default()).await.unwrap_err();
        assert!(matches!(err, StageError::AllUnitsFailed { .. }));
        assert_eq!(err.kind(), ErrorKind::AllCandidatesExhausted);
    }

    #[tokio::test]
    async fn test_cancelled_units_are_recorded() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(EchoScorer::new());
        let ctx = context(&dir, spec(&[("a", "alpha"), ("b", "bravo")]), provider.clone()).await;
        ctx.cancel.cancel();

        let err = AnalysisStage.execute(&ctx, &StageInputs::default()).await.unwrap_err();
        assert!(matches!(err, StageError::Cancelled { cancelled: 2, .. }));
        assert_eq!(provider.call_count(), 0);

        let manifest = ctx.journal.snapshot().await;
        assert!(manifest
            .unit_entries(StageName::Analysis)
            .all(|e| e.status == EntryStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_preresolved_units_skip_the_gateway() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(EchoScorer::new());
        let ctx = context(&dir, spec(&[("a", "alpha"), ("b", "bravo")]), provider.clone()).await;

        let handle = ctx
            .store
            .put(b"{}", PutRequest::new(StageName::Analysis, ArtifactKind::RawAnalysis))
            .await
            .unwrap();
        let mut inputs = StageInputs::default();
        inputs.preresolved.insert("a".into(), handle.clone());

        let outcome = AnalysisStage.execute(&ctx, &inputs).await.unwrap();
        assert_eq!(provider.call_count(), 1);
        assert_eq!(outcome.outputs[0].hash, handle.hash);

        let manifest = ctx.journal.snapshot().await;
        let reused: Vec<_> = manifest
            .unit_entries(StageName::Analysis)
            .filter(|e| e.status == EntryStatus::Reused)
            .collect();
        assert_eq!(reused.len(), 1);
        assert_eq!(reused[0].unit.as_deref(), Some("a"));
    }
}
