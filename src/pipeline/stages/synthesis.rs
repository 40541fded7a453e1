//! Synthesis: one narrative model call over the statistical package.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    load_json, store_json, StageContext, StageError, StageExecutor, StageInputs, StageOutcome,
    StatisticalPackage,
};
use crate::llm::{CompletionRequest, Message, ResponseFormat};
use crate::pipeline::run::StageName;
use crate::pipeline::spec::ExperimentSpec;
use crate::storage::{ArtifactKind, ContentHash, Fingerprint, PutRequest};

const SYSTEM_PROMPT: &str = "You are a careful research analyst. Answer the research questions using \
only the statistics provided. Quote numbers where they support a claim and say plainly when the \
data cannot answer a question.";

/// The synthesis artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisReport {
    pub experiment: String,
    pub framework: String,
    pub research_questions: Vec<String>,
    pub package_hash: ContentHash,
    pub model_used: String,
    pub narrative: String,
    /// Set only when the report is not reproducible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
}

fn build_prompt(spec: &ExperimentSpec, package: &StatisticalPackage) -> String {
    let mut prompt = String::from("Research questions:\n");
    for (i, question) in spec.research_questions.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", i + 1, question));
    }

    prompt.push_str(&format!(
        "\nFramework: {} {}\nDocuments analysed: {}\n",
        package.framework,
        package.framework_version,
        package.rows.len()
    ));
    if !package.excluded_documents.is_empty() {
        prompt.push_str(&format!(
            "Documents excluded after failed analysis: {}\n",
            package.excluded_documents.join(", ")
        ));
    }

    prompt.push_str("\n| column | description | n | mean | std | min | max |\n|---|---|---|---|---|---|---|\n");
    let fmt = |v: Option<f64>| v.map(|v| format!("{:.3}", v)).unwrap_or_else(|| "-".to_string());
    for column in &package.codebook {
        if let Some(s) = package.summaries.get(&column.name) {
            prompt.push_str(&format!(
                "| {} | {} | {} | {} | {} | {} | {} |\n",
                column.name,
                column.description,
                s.n,
                fmt(s.mean),
                fmt(s.std),
                fmt(s.min),
                fmt(s.max)
            ));
        }
    }
    prompt
}

/// Narrative synthesis over the statistical package.
pub struct SynthesisStage;

#[async_trait]
impl StageExecutor for SynthesisStage {
    fn stage(&self) -> StageName {
        StageName::Synthesis
    }

    fn deterministic(&self, spec: &ExperimentSpec) -> bool {
        spec.models.deterministic_synthesis
    }

    async fn execute(&self, ctx: &StageContext, inputs: &StageInputs) -> Result<StageOutcome, StageError> {
        let stage = StageName::Synthesis;
        let spec = &ctx.spec;
        let package_handle = inputs.single_output(StageName::StatisticalPreparation, stage)?;
        let deterministic = self.deterministic(spec);

        let plan = ctx.gateway.plan(
            &spec.models.synthesis_capability,
            spec.models.safety_tier,
            spec.models.allow_experimental,
        )?;
        let fingerprint = Fingerprint::builder(stage.as_str())
            .field("package", package_handle.hash.as_str())
            .field("framework", &spec.framework_hash())
            .list("questions", &spec.research_questions)
            .field("capability", &spec.models.synthesis_capability)
            .field("safety_tier", spec.models.safety_tier.as_str())
            .list("models", plan.eligible_ids())
            .field("temperature", &ctx.config.synthesis_temperature.to_string())
            .finish();
        let inputs = vec![package_handle.hash.clone()];

        if deterministic {
            let cached = ctx.store.exists(&fingerprint).await?;
            ctx.metrics.record_cache_lookup(stage.as_str(), cached.is_some());
            if let Some(handle) = cached {
                debug!(fingerprint = %fingerprint.short(), "Synthesis cached");
                return Ok(StageOutcome::success(inputs, vec![handle])
                    .with_fingerprint(fingerprint)
                    .cache_hit(true));
            }
        }

        let package: StatisticalPackage = load_json(&ctx.store, &package_handle.hash).await?;
        let request = CompletionRequest::new(
            spec.models.synthesis_capability.clone(),
            spec.models.safety_tier,
            vec![Message::system(SYSTEM_PROMPT), Message::user(build_prompt(spec, &package))],
        )
        .with_temperature(ctx.config.synthesis_temperature)
        .with_max_tokens(ctx.config.max_tokens)
        .with_format(ResponseFormat::Text)
        .allow_experimental(spec.models.allow_experimental);

        let result = ctx.gateway.complete(&request).await?;

        let report = SynthesisReport {
            experiment: spec.name.clone(),
            framework: spec.framework.name.clone(),
            research_questions: spec.research_questions.clone(),
            package_hash: package_handle.hash.clone(),
            model_used: result.model_used.clone(),
            narrative: result.text.trim().to_string(),
            generated_at: (!deterministic).then(Utc::now),
        };
        let (handle, _) = store_json(
            &ctx.store,
            &report,
            PutRequest::new(stage, ArtifactKind::SynthesisReport)
                .with_fingerprint(fingerprint.clone())
                .deterministic(deterministic),
        )
        .await?;

        info!(
            run_id = %ctx.run_id,
            model = %result.model_used,
            cost = result.cost_estimate,
            deterministic,
            "Synthesis written"
        );

        let mut outcome = StageOutcome::success(inputs, vec![handle]).with_fingerprint(fingerprint);
        outcome.model_used = Some(result.model_used);
        outcome.attempts = result.attempts;
        outcome.cost = Some(result.cost_estimate);
        Ok(outcome)
    }
}
