//! Shared fixtures for the integration tests: an experiment directory on
//! disk and a scripted provider standing in for a real model backend.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use analysis_forge::llm::{
    CapabilityMatrix, GatewayConfig, GenerationRequest, GenerationResponse, LlmProvider, ModelGateway, RetryPolicy,
    Usage,
};
use analysis_forge::pipeline::{CancellationFlag, ExperimentSpec, PipelineConfig, PipelineOrchestrator};
use analysis_forge::LlmError;
use async_trait::async_trait;
use tempfile::TempDir;

pub const FRAMEWORK_YAML: &str = r#"
name: civic-tone
version: 1.2.0
prompt_version: v3
instructions: Rate the civic tone of the speech.
dimensions:
  - id: warmth
    description: Appeals to shared identity
  - id: hostility
    description: Attacks on opponents
derived_metrics:
  - name: warmth_ratio
    op: ratio
    operands: [warmth, hostility]
"#;

pub const MODELS_YAML: &str = r#"
models:
  - id: mock-large
    provider: mock
    tier: flagship
    pricing: { input_per_1m: 2.0, output_per_1m: 8.0 }
matrix:
  analysis:
    standard: [mock-large]
  synthesis:
    standard: [mock-large]
"#;

/// Writes an experiment directory with one corpus file per document.
pub fn write_experiment(dir: &Path, documents: &[(&str, &str)]) {
    std::fs::create_dir_all(dir.join("corpus")).unwrap();
    std::fs::write(
        dir.join("experiment.yaml"),
        "name: civic-tone-study\nresearch_questions:\n  - Does civic tone vary across speakers?\n",
    )
    .unwrap();
    std::fs::write(dir.join("framework.yaml"), FRAMEWORK_YAML).unwrap();
    std::fs::write(dir.join("models.yaml"), MODELS_YAML).unwrap();
    for (id, text) in documents {
        std::fs::write(dir.join("corpus").join(format!("{id}.txt")), text).unwrap();
    }
}

/// Five short speeches.
pub fn corpus() -> Vec<(&'static str, &'static str)> {
    vec![
        ("speech-01", "We stand together as neighbours."),
        ("speech-02", "Our opponents have failed you again and again."),
        ("speech-03", "Let us build bridges across every town."),
        ("speech-04", "They lie, and they know it."),
        ("speech-05", "Thank you all for coming tonight."),
    ]
}

/// Deterministic stand-in for a model backend.
///
/// Analysis replies are derived from the document text. Any request whose
/// prompt contains a marker in `failing` gets a permanent error.
pub struct ScriptedProvider {
    failing: Mutex<BTreeSet<String>>,
    stalled: Mutex<BTreeSet<String>>,
    calls: Mutex<Vec<String>>,
    cancel_after: Mutex<Option<(usize, CancellationFlag)>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            failing: Mutex::new(BTreeSet::new()),
            stalled: Mutex::new(BTreeSet::new()),
            calls: Mutex::new(Vec::new()),
            cancel_after: Mutex::new(None),
        }
    }

    pub fn fail_on(&self, marker: &str) {
        self.failing.lock().unwrap().insert(marker.to_string());
    }

    pub fn stall(&self, model: &str) {
        self.stalled.lock().unwrap().insert(model.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    /// Raises `flag` once `calls` analysis requests have been answered.
    pub fn cancel_after(&self, calls: usize, flag: CancellationFlag) {
        *self.cancel_after.lock().unwrap() = Some((calls, flag));
    }

    pub fn analysis_calls(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.starts_with("Document "))
            .count()
    }

    pub fn analysed(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|p| p.strip_prefix("Document "))
            .filter_map(|p| p.split(':').next())
            .map(str::to_string)
            .collect()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let prompt = request.last_user_content().unwrap_or_default().to_string();
        let answered = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(prompt.clone());
            calls.iter().filter(|p| p.starts_with("Document ")).count()
        };

        let stalled = self.stalled.lock().unwrap().contains(&request.model);
        if stalled {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }

        if self.failing.lock().unwrap().iter().any(|m| prompt.contains(m)) {
            return Err(LlmError::ApiError {
                code: 422,
                message: "content rejected".to_string(),
            });
        }

        let text = if prompt.starts_with("Research questions") {
            "Tone is warmer in rally speeches than in debates.".to_string()
        } else {
            let warmth = prompt.matches(' ').count() % 5 + 1;
            format!("{{\"warmth\": {warmth}, \"hostility\": {{\"score\": 2, \"evidence\": \"n/a\"}}}}")
        };

        if let Some((after, flag)) = self.cancel_after.lock().unwrap().as_ref() {
            if answered >= *after {
                flag.cancel();
            }
        }

        Ok(GenerationResponse::from_text(&request.model, text, Usage::new(400, 40)))
    }
}

/// Gateway reading the experiment's `models.yaml`, routed to `provider`.
pub fn gateway(spec: &ExperimentSpec, provider: Arc<ScriptedProvider>) -> Arc<ModelGateway> {
    let matrix = CapabilityMatrix::load(&spec.matrix_path()).unwrap();
    let config = GatewayConfig {
        request_timeout: Duration::from_millis(500),
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
        ..GatewayConfig::default()
    };
    Arc::new(ModelGateway::new(Arc::new(matrix), config).with_provider("mock", provider))
}

pub struct Fixture {
    pub dir: TempDir,
    pub spec: Arc<ExperimentSpec>,
    pub provider: Arc<ScriptedProvider>,
}

impl Fixture {
    pub fn new(documents: &[(&str, &str)]) -> Self {
        let dir = TempDir::new().unwrap();
        write_experiment(dir.path(), documents);
        let spec = Arc::new(ExperimentSpec::load(dir.path()).unwrap());
        Self {
            dir,
            spec,
            provider: Arc::new(ScriptedProvider::new()),
        }
    }

    /// Replaces `models.yaml` and reloads the experiment.
    pub fn with_models(mut self, yaml: &str) -> Self {
        std::fs::write(self.dir.path().join("models.yaml"), yaml).unwrap();
        self.spec = Arc::new(ExperimentSpec::load(self.dir.path()).unwrap());
        self
    }

    pub fn with_spec(mut self, update: impl FnOnce(ExperimentSpec) -> ExperimentSpec) -> Self {
        self.spec = Arc::new(update((*self.spec).clone()));
        self
    }

    pub fn orchestrator(&self) -> PipelineOrchestrator {
        self.orchestrator_with(PipelineConfig::default())
    }

    pub fn orchestrator_with(&self, config: PipelineConfig) -> PipelineOrchestrator {
        PipelineOrchestrator::new(self.dir.path(), config, gateway(&self.spec, self.provider.clone()))
    }
}
