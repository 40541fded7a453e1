//! Pre-flight validation: structural checks before any money is spent.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use super::{store_json, StageContext, StageError, StageExecutor, StageInputs, StageOutcome};
use crate::error::{ValidationError, ValidationIssue};
use crate::llm::ModelGateway;
use crate::pipeline::export::ID_COLUMNS;
use crate::pipeline::run::StageName;
use crate::pipeline::spec::ExperimentSpec;
use crate::storage::{ArtifactKind, Fingerprint, PutRequest};

/// Checks that `spec` can run through stage `through` with `gateway`.
///
/// Returns every issue found rather than stopping at the first.
pub fn validate_spec(spec: &ExperimentSpec, gateway: &ModelGateway, through: StageName) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if spec.name.trim().is_empty() {
        issues.push(ValidationIssue::new("experiment", "name is empty"));
    }

    check_framework(spec, &mut issues);

    if through >= StageName::Analysis {
        check_corpus(spec, &mut issues);
        check_capability(spec, gateway, &spec.models.analysis_capability, &mut issues);
    }

    if through >= StageName::Synthesis {
        if spec.research_questions.iter().all(|q| q.trim().is_empty()) {
            issues.push(ValidationIssue::new(
                "experiment",
                "synthesis requested but no research questions are declared",
            ));
        }
        check_capability(spec, gateway, &spec.models.synthesis_capability, &mut issues);
    }

    issues
}

fn check_framework(spec: &ExperimentSpec, issues: &mut Vec<ValidationIssue>) {
    let framework = &spec.framework;

    if let Err(e) = semver::Version::parse(&framework.version) {
        issues.push(ValidationIssue::new(
            "framework",
            format!("version '{}' is not a semantic version: {}", framework.version, e),
        ));
    }

    if framework.prompt_version.trim().is_empty() {
        issues.push(ValidationIssue::new("framework", "prompt_version is empty"));
    }

    if framework.dimensions.is_empty() {
        issues.push(ValidationIssue::new("framework", "no dimensions declared"));
    }

    let mut known = BTreeSet::new();
    for dimension in &framework.dimensions {
        if dimension.id.trim().is_empty() {
            issues.push(ValidationIssue::new("framework", "dimension with empty id"));
        } else if ID_COLUMNS.contains(&dimension.id.as_str()) {
            issues.push(reserved_column(&dimension.id));
        } else if !known.insert(dimension.id.as_str()) {
            issues.push(ValidationIssue::new(
                format!("framework/{}", dimension.id),
                "duplicate dimension id",
            ));
        }
    }

    // Operands may reference dimensions and metrics declared earlier.
    for metric in &framework.derived_metrics {
        let subject = format!("framework/{}", metric.name);
        if metric.name.trim().is_empty() {
            issues.push(ValidationIssue::new("framework", "derived metric with empty name"));
            continue;
        }

        match metric.op.arity() {
            Some(n) if metric.operands.len() != n => issues.push(ValidationIssue::new(
                &subject,
                format!(
                    "{} takes exactly {} operands, got {}",
                    metric.op.as_str(),
                    n,
                    metric.operands.len()
                ),
            )),
            None if metric.operands.is_empty() => {
                issues.push(ValidationIssue::new(&subject, "no operands"));
            }
            _ => {}
        }

        for operand in &metric.operands {
            if !known.contains(operand.as_str()) {
                issues.push(ValidationIssue::new(
                    &subject,
                    format!("operand '{}' is not a dimension or an earlier metric", operand),
                ));
            }
        }

        if ID_COLUMNS.contains(&metric.name.as_str()) {
            issues.push(reserved_column(&metric.name));
        } else if !known.insert(metric.name.as_str()) {
            issues.push(ValidationIssue::new(&subject, "name collides with another column"));
        }
    }
}

fn reserved_column(name: &str) -> ValidationIssue {
    ValidationIssue::new(
        format!("framework/{}", name),
        format!("'{}' is reserved for an export identifier column", name),
    )
}

fn check_corpus(spec: &ExperimentSpec, issues: &mut Vec<ValidationIssue>) {
    if spec.documents.is_empty() {
        issues.push(ValidationIssue::new("corpus", "no documents found"));
    }

    let mut seen = BTreeSet::new();
    for document in &spec.documents {
        let subject = format!("corpus/{}", document.id);
        if !seen.insert(document.id.as_str()) {
            issues.push(ValidationIssue::new(&subject, "duplicate document id"));
        }
        if document.text.trim().is_empty() {
            issues.push(ValidationIssue::new(&subject, "document is empty"));
        }
    }
}

fn check_capability(
    spec: &ExperimentSpec,
    gateway: &ModelGateway,
    capability: &str,
    issues: &mut Vec<ValidationIssue>,
) {
    let subject = format!("matrix/{}", capability);
    let plan = match gateway.plan(capability, spec.models.safety_tier, spec.models.allow_experimental) {
        Ok(plan) => plan,
        Err(e) => {
            issues.push(ValidationIssue::new(subject, e.to_string()));
            return;
        }
    };

    if !plan.has_eligible() {
        issues.push(ValidationIssue::new(
            subject,
            format!(
                "no eligible model at safety tier '{}' (experimental opt-in: {})",
                spec.models.safety_tier, spec.models.allow_experimental
            ),
        ));
        return;
    }

    if !plan.eligible().any(|c| gateway.has_backend(&c.model.provider)) {
        issues.push(ValidationIssue::new(
            subject,
            "no eligible model has a configured provider backend (check API key variables)",
        ));
    }
}

#[derive(Serialize)]
struct ValidationReport<'a> {
    experiment: &'a str,
    spec_hash: &'a str,
    checked_through: StageName,
    documents: usize,
    dimensions: usize,
    derived_metrics: usize,
}

/// Runs [`validate_spec`] and records a report artifact.
pub struct ValidationStage;

#[async_trait]
impl StageExecutor for ValidationStage {
    fn stage(&self) -> StageName {
        StageName::PreflightValidation
    }

    async fn execute(&self, ctx: &StageContext, _inputs: &StageInputs) -> Result<StageOutcome, StageError> {
        let spec = &ctx.spec;
        let issues = validate_spec(spec, &ctx.gateway, ctx.target);
        if !issues.is_empty() {
            return Err(ValidationError::Failed(issues).into());
        }

        let fingerprint = Fingerprint::builder(StageName::PreflightValidation.as_str())
            .field("spec", spec.spec_hash())
            .field("through", ctx.target.as_str())
            .finish();
        let report = ValidationReport {
            experiment: &spec.name,
            spec_hash: spec.spec_hash(),
            checked_through: ctx.target,
            documents: spec.documents.len(),
            dimensions: spec.framework.dimensions.len(),
            derived_metrics: spec.framework.derived_metrics.len(),
        };

        let (handle, _) = store_json(
            &ctx.store,
            &report,
            PutRequest::new(StageName::PreflightValidation, ArtifactKind::ValidationReport)
                .with_fingerprint(fingerprint.clone()),
        )
        .await?;

        info!(
            run_id = %ctx.run_id,
            documents = report.documents,
            through = %ctx.target,
            "Pre-flight validation passed"
        );
        Ok(StageOutcome::success(Vec::new(), vec![handle]).with_fingerprint(fingerprint))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{context, gateway, spec, EchoScorer};
    use super::*;
    use crate::pipeline::spec::{DerivedMetric, Dimension, MetricOp};
    use crate::llm::SafetyTier;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_valid_spec_has_no_issues() {
        let spec = spec(&[("a", "text")]);
        let gw = gateway(Arc::new(EchoScorer::new()));
        assert!(validate_spec(&spec, &gw, StageName::Finalization).is_empty());
    }

    #[test]
    fn test_structural_problems_are_all_reported() {
        let mut spec = spec(&[("a", "   ")]);
        spec.framework.version = "one".into();
        spec.framework.derived_metrics.push(DerivedMetric {
            name: "bad".into(),
            description: String::new(),
            op: MetricOp::Difference,
            operands: vec!["warmth".into(), "missing".into(), "hostility".into()],
        });
        let gw = gateway(Arc::new(EchoScorer::new()));

        let issues = validate_spec(&spec, &gw, StageName::Analysis);
        let text: Vec<String> = issues.iter().map(ToString::to_string).collect();
        assert!(text.iter().any(|t| t.contains("not a semantic version")));
        assert!(text.iter().any(|t| t.contains("exactly 2 operands")));
        assert!(text.iter().any(|t| t.contains("operand 'missing'")));
        assert!(text.iter().any(|t| t.contains("corpus/a: document is empty")));
    }

    #[test]
    fn test_export_identifier_names_are_rejected() {
        let mut spec = spec(&[("a", "text")]);
        spec.framework.dimensions.push(Dimension {
            id: "document_id".into(),
            description: String::new(),
        });
        spec.framework.derived_metrics.push(DerivedMetric {
            name: "model_used".into(),
            description: String::new(),
            op: MetricOp::Sum,
            operands: vec!["warmth".into()],
        });
        let gw = gateway(Arc::new(EchoScorer::new()));

        let issues = validate_spec(&spec, &gw, StageName::Analysis);
        let text: Vec<String> = issues.iter().map(ToString::to_string).collect();
        assert_eq!(issues.len(), 2, "{:?}", text);
        assert!(text.iter().any(|t| t.contains("framework/document_id") && t.contains("reserved")));
        assert!(text.iter().any(|t| t.contains("framework/model_used") && t.contains("reserved")));
    }

    #[test]
    fn test_corpus_and_synthesis_checks_depend_on_target() {
        let mut spec = spec(&[]);
        spec.research_questions.clear();
        let gw = gateway(Arc::new(EchoScorer::new()));

        assert!(validate_spec(&spec, &gw, StageName::PreflightValidation).is_empty());
        assert_eq!(validate_spec(&spec, &gw, StageName::StatisticalPreparation).len(), 1);
        assert_eq!(validate_spec(&spec, &gw, StageName::Finalization).len(), 2);
    }

    #[test]
    fn test_unknown_capability_and_missing_backend() {
        let vision = spec(&[("a", "text")]).with_settings(|m| m.analysis_capability = "vision".into());
        let gw = gateway(Arc::new(EchoScorer::new()));
        let issues = validate_spec(&vision, &gw, StageName::Analysis);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].subject, "matrix/vision");

        // Same matrix, but no provider registered.
        let plain = spec(&[("a", "text")]);
        let bare = ModelGateway::new(Arc::new(gw.matrix().clone()), Default::default());
        let issues = validate_spec(&plain, &bare, StageName::Analysis);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("no eligible model has a configured provider backend"));

        let strict = plain.with_settings(|m| m.safety_tier = SafetyTier::Strict);
        let issues = validate_spec(&strict, &gw, StageName::Analysis);
        assert!(issues[0].message.contains("No candidates declared"));
    }

    #[tokio::test]
    async fn test_stage_fails_with_validation_error() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, spec(&[]), Arc::new(EchoScorer::new())).await;

        let err = ValidationStage.execute(&ctx, &StageInputs::default()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_stage_report_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, spec(&[("a", "text")]), Arc::new(EchoScorer::new())).await;

        let first = ValidationStage.execute(&ctx, &StageInputs::default()).await.unwrap();
        let second = ValidationStage.execute(&ctx, &StageInputs::default()).await.unwrap();
        assert_eq!(first.outputs[0].hash, second.outputs[0].hash);
        assert_eq!(first.outputs[0].kind, ArtifactKind::ValidationReport);
    }
}
