//! Statistical preparation: tabulate analysis scores into an analysis-ready
//! package.
//!
//! No model calls happen here. The package is a pure function of the stored
//! analysis records and the framework, so it is always cacheable.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    load_json, store_json, AnalysisRecord, StageContext, StageError, StageExecutor, StageInputs,
    StageOutcome,
};
use crate::pipeline::export;
use crate::pipeline::run::StageName;
use crate::pipeline::spec::{ExperimentSpec, FrameworkSpec, MetricOp};
use crate::storage::{ArtifactKind, ContentHash, Fingerprint, PutRequest};

const PACKAGE_FORMAT: &str = "1";

/// Where a dataset column comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Dimension,
    Derived,
}

/// Codebook entry for one numeric column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodebookEntry {
    pub name: String,
    pub kind: ColumnKind,
    /// Dimension id, or the formula of a derived metric.
    pub source: String,
    pub description: String,
}

/// One document's row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRow {
    pub document_id: String,
    pub document_hash: ContentHash,
    pub analysis_hash: ContentHash,
    pub model_used: String,
    /// Value per codebook column; `None` when undefined.
    pub values: BTreeMap<String, Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSummary {
    pub n: usize,
    pub mean: Option<f64>,
    /// Sample standard deviation; needs at least two values.
    pub std: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ColumnSummary {
    fn of(values: &[f64]) -> Self {
        let n = values.len();
        if n == 0 {
            return Self {
                n,
                mean: None,
                std: None,
                min: None,
                max: None,
            };
        }

        let mean = values.iter().sum::<f64>() / n as f64;
        let std = (n > 1).then(|| {
            let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
            var.sqrt()
        });
        Self {
            n,
            mean: Some(mean),
            std,
            min: values.iter().copied().reduce(f64::min),
            max: values.iter().copied().reduce(f64::max),
        }
    }
}

/// The statistical preparation artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticalPackage {
    pub experiment: String,
    pub framework: String,
    pub framework_version: String,
    /// Numeric columns in table order.
    pub codebook: Vec<CodebookEntry>,
    /// Rows ordered by document id.
    pub rows: Vec<DatasetRow>,
    pub summaries: BTreeMap<String, ColumnSummary>,
    /// Corpus documents with no analysis (failed units).
    pub excluded_documents: Vec<String>,
    /// Sorted hashes of the analysis artifacts the package was built from.
    pub analysis_hashes: Vec<ContentHash>,
}

impl StatisticalPackage {
    /// Builds the package from analysis records.
    pub fn build(spec: &ExperimentSpec, records: &[(ContentHash, AnalysisRecord)]) -> Self {
        let framework = &spec.framework;
        let codebook = codebook(framework);

        let mut rows: Vec<DatasetRow> = records
            .iter()
            .map(|(hash, record)| DatasetRow {
                document_id: record.document_id.clone(),
                document_hash: record.document_hash.clone(),
                analysis_hash: hash.clone(),
                model_used: record.model_used.clone(),
                values: row_values(framework, &record.scores),
            })
            .collect();
        rows.sort_by(|a, b| a.document_id.cmp(&b.document_id));

        let summaries = codebook
            .iter()
            .map(|column| {
                let values: Vec<f64> = rows
                    .iter()
                    .filter_map(|row| row.values.get(&column.name).copied().flatten())
                    .collect();
                (column.name.clone(), ColumnSummary::of(&values))
            })
            .collect();

        let excluded_documents = spec
            .documents
            .iter()
            .filter(|d| !rows.iter().any(|row| row.document_id == d.id))
            .map(|d| d.id.clone())
            .collect();

        let mut analysis_hashes: Vec<ContentHash> = records.iter().map(|(h, _)| h.clone()).collect();
        analysis_hashes.sort();

        Self {
            experiment: spec.name.clone(),
            framework: framework.name.clone(),
            framework_version: framework.version.clone(),
            codebook,
            rows,
            summaries,
            excluded_documents,
            analysis_hashes,
        }
    }
}

fn codebook(framework: &FrameworkSpec) -> Vec<CodebookEntry> {
    let dimensions = framework.dimensions.iter().map(|d| CodebookEntry {
        name: d.id.clone(),
        kind: ColumnKind::Dimension,
        source: d.id.clone(),
        description: d.description.clone(),
    });
    let derived = framework.derived_metrics.iter().map(|m| CodebookEntry {
        name: m.name.clone(),
        kind: ColumnKind::Derived,
        source: format!("{}({})", m.op.as_str(), m.operands.join(", ")),
        description: m.description.clone(),
    });
    dimensions.chain(derived).collect()
}

/// Dimension scores followed by derived metrics, evaluated in declaration
/// order so a metric may use earlier metrics.
fn row_values(framework: &FrameworkSpec, scores: &BTreeMap<String, f64>) -> BTreeMap<String, Option<f64>> {
    let mut values: BTreeMap<String, Option<f64>> = framework
        .dimensions
        .iter()
        .map(|d| (d.id.clone(), scores.get(&d.id).copied().filter(|v| v.is_finite())))
        .collect();

    for metric in &framework.derived_metrics {
        let operands: Option<Vec<f64>> = metric
            .operands
            .iter()
            .map(|name| values.get(name).copied().flatten())
            .collect();
        let value = operands
            .and_then(|ops| apply(metric.op, &ops))
            .filter(|v| v.is_finite());
        values.insert(metric.name.clone(), value);
    }
    values
}

fn apply(op: MetricOp, operands: &[f64]) -> Option<f64> {
    match (op, operands) {
        (_, []) => None,
        (MetricOp::Sum, ops) => Some(ops.iter().sum()),
        (MetricOp::Difference, [a, b]) => Some(a - b),
        (MetricOp::Ratio, [_, b]) if *b == 0.0 => None,
        (MetricOp::Ratio, [a, b]) => Some(a / b),
        (MetricOp::Mean, ops) => Some(ops.iter().sum::<f64>() / ops.len() as f64),
        (MetricOp::Max, ops) => ops.iter().copied().reduce(f64::max),
        (MetricOp::Min, ops) => ops.iter().copied().reduce(f64::min),
        _ => None,
    }
}

/// Writes the export files for `package` into the run directory.
pub async fn write_exports(ctx: &StageContext, package: StatisticalPackage) -> Result<usize, StageError> {
    let dir = ctx.paths.statistical_exports();
    let written = export::write_package(package, &dir)
        .await
        .map_err(|e| StageError::Export(format!("{:#}", e)))?;
    Ok(written.len())
}

/// Tabulates analysis output and writes the export files.
pub struct StatisticsStage;

impl StatisticsStage {
    fn fingerprint(spec: &ExperimentSpec, analysis_hashes: &[ContentHash]) -> Fingerprint {
        Fingerprint::builder(StageName::StatisticalPreparation.as_str())
            .field("format", PACKAGE_FORMAT)
            .field("framework", &spec.framework_hash())
            .list("documents", spec.documents.iter().map(|d| d.id.as_str()))
            .list("analyses", analysis_hashes.iter().map(ContentHash::as_str))
            .finish()
    }
}

#[async_trait]
impl StageExecutor for StatisticsStage {
    fn stage(&self) -> StageName {
        StageName::StatisticalPreparation
    }

    async fn execute(&self, ctx: &StageContext, inputs: &StageInputs) -> Result<StageOutcome, StageError> {
        let stage = StageName::StatisticalPreparation;
        let analyses = inputs.outputs_of(StageName::Analysis);
        if analyses.is_empty() {
            return Err(StageError::MissingInput {
                stage,
                message: "no analysis artifacts".to_string(),
            });
        }

        let mut input_hashes: Vec<ContentHash> = analyses.iter().map(|h| h.hash.clone()).collect();
        input_hashes.sort();
        let fingerprint = Self::fingerprint(&ctx.spec, &input_hashes);

        let cached = ctx.store.exists(&fingerprint).await?;
        ctx.metrics.record_cache_lookup(stage.as_str(), cached.is_some());

        let (handle, package, cache_hit) = match cached {
            Some(handle) => {
                debug!(fingerprint = %fingerprint.short(), "Statistical package cached");
                let package: StatisticalPackage = load_json(&ctx.store, &handle.hash).await?;
                (handle, package, true)
            }
            None => {
                let mut records = Vec::with_capacity(analyses.len());
                for handle in analyses {
                    let record: AnalysisRecord = load_json(&ctx.store, &handle.hash).await?;
                    records.push((handle.hash.clone(), record));
                }
                let package = StatisticalPackage::build(&ctx.spec, &records);
                let (handle, _) = store_json(
                    &ctx.store,
                    &package,
                    PutRequest::new(stage, ArtifactKind::StatisticalPackage)
                        .with_fingerprint(fingerprint.clone()),
                )
                .await?;
                (handle, package, false)
            }
        };

        let rows = package.rows.len();
        let files = write_exports(ctx, package).await?;

        info!(
            run_id = %ctx.run_id,
            rows,
            files,
            cache_hit,
            "Statistical package ready"
        );

        Ok(StageOutcome::success(input_hashes, vec![handle])
            .with_fingerprint(fingerprint)
            .cache_hit(cache_hit))
    }
}
