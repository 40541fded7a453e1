//! Human-readable run summary written next to the manifest.

use serde::Serialize;
use tera::{Context, Tera};

use super::manifest::{EntryStatus, Manifest};
use crate::pipeline::run::Run;

const README_TEMPLATE: &str = r#"# Run {{ run.run_id }}

| | |
|---|---|
| Experiment | {{ run.experiment }} |
| Status | **{{ run.status }}** |
| Spec hash | `{{ run.spec_hash }}` |
| Target stage | {{ run.target_stage }} |
| Started | {{ run.started_at }} |
| Ended | {{ ended_at }} |
{% if run.parent_run_id %}| Resumed from | {{ run.parent_run_id }} |
{% endif %}{% if run.workbench %}| Scope | workbench |
{% endif %}| Estimated cost | ${{ total_cost }} |

## Stages

| Stage | Status | Outputs | Units ok / failed | Cache hits | Duration (ms) | Model |
|---|---|---|---|---|---|---|
{% for s in stages %}| {{ s.stage }} | {{ s.status }} | {{ s.outputs }} | {{ s.units_ok }} / {{ s.units_failed }} | {{ s.cache_hits }} | {{ s.duration_ms }} | {{ s.model }} |
{% endfor %}
{% if failures %}## Failures

{% for f in failures %}- `{{ f.stage }}`{% if f.unit %} / `{{ f.unit }}`{% endif %}: **{{ f.kind }}**: {{ f.message }}
{% endfor %}{% endif %}{% if run.failure %}
Run halted in `{{ run.failure.stage }}` ({{ run.failure.kind }}): {{ run.failure.message }}
{% endif %}{% if run.warnings %}
## Warnings

{% for w in run.warnings %}- {{ w }}
{% endfor %}{% endif %}
Provenance for every artifact is in `manifest.json`. Artifacts are stored by
SHA-256 under `artifacts/`.
"#;

#[derive(Serialize)]
struct StageRow {
    stage: String,
    status: String,
    outputs: usize,
    units_ok: usize,
    units_failed: usize,
    cache_hits: usize,
    duration_ms: u64,
    model: String,
}

#[derive(Serialize)]
struct FailureRow {
    stage: String,
    unit: Option<String>,
    kind: String,
    message: String,
}

/// Renders the run README from the run record and its manifest.
pub fn render_readme(run: &Run, manifest: &Manifest) -> Result<String, tera::Error> {
    let stages: Vec<StageRow> = manifest
        .entries
        .iter()
        .filter(|e| e.unit.is_none())
        .map(|entry| {
            let units: Vec<_> = manifest.unit_entries(entry.stage).collect();
            StageRow {
                stage: entry.stage.to_string(),
                status: entry.status.to_string(),
                outputs: entry.outputs.len(),
                units_ok: units.iter().filter(|u| u.status.is_complete()).count(),
                units_failed: units
                    .iter()
                    .filter(|u| u.status == EntryStatus::Failed)
                    .count(),
                cache_hits: units.iter().filter(|u| u.cache_hit).count()
                    + usize::from(entry.cache_hit),
                duration_ms: entry.duration_ms,
                model: entry.model_used.clone().unwrap_or_else(|| "-".to_string()),
            }
        })
        .collect();

    let failures: Vec<FailureRow> = manifest
        .failures()
        .into_iter()
        .map(|entry| FailureRow {
            stage: entry.stage.to_string(),
            unit: entry.unit.clone(),
            kind: entry
                .error
                .as_ref()
                .map(|e| e.kind.to_string())
                .unwrap_or_else(|| entry.status.to_string()),
            message: entry
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_default(),
        })
        .collect();

    let mut context = Context::new();
    context.insert("run", run);
    context.insert(
        "ended_at",
        &run.ended_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string()),
    );
    context.insert("total_cost", &format!("{:.4}", manifest.total_cost()));
    context.insert("stages", &stages);
    context.insert("failures", &failures);

    Tera::one_off(README_TEMPLATE, &context, false)
}
