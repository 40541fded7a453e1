//! Experiment specifications.
//!
//! An experiment directory holds `experiment.yaml`, a framework file and a
//! corpus directory. [`ExperimentSpec::load`] turns it into an immutable value
//! that is passed explicitly to every stage; nothing reads the directory again
//! during a run.
//!
//! Loading only checks that the files exist and parse. Whether the experiment
//! makes sense (dimensions declared, operands resolvable, models eligible) is
//! decided by pre-flight validation.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::config::ConfigError;
use crate::llm::SafetyTier;
use crate::storage::{canonical_json, sha256_hex, ContentHash};

pub const EXPERIMENT_FILE: &str = "experiment.yaml";

/// One analytical dimension the model scores every document on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub id: String,
    #[serde(default)]
    pub description: String,
}

/// Operation combining operands into a derived metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricOp {
    Sum,
    /// First operand minus the second.
    Difference,
    /// First operand divided by the second.
    Ratio,
    Mean,
    Max,
    Min,
}

impl MetricOp {
    /// Exact operand count, if the op has one.
    pub fn arity(self) -> Option<usize> {
        match self {
            MetricOp::Difference | MetricOp::Ratio => Some(2),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MetricOp::Sum => "sum",
            MetricOp::Difference => "difference",
            MetricOp::Ratio => "ratio",
            MetricOp::Mean => "mean",
            MetricOp::Max => "max",
            MetricOp::Min => "min",
        }
    }
}

/// A metric computed from dimension scores or earlier metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetric {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub op: MetricOp,
    pub operands: Vec<String>,
}

/// The analytical framework. Its instructions are opaque to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameworkSpec {
    pub name: String,
    /// Semantic version, checked by pre-flight validation.
    pub version: String,
    pub prompt_version: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    #[serde(default)]
    pub derived_metrics: Vec<DerivedMetric>,
}

impl FrameworkSpec {
    pub fn dimension_ids(&self) -> Vec<String> {
        self.dimensions.iter().map(|d| d.id.clone()).collect()
    }
}

/// One corpus document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    /// SHA-256 of the document bytes.
    pub hash: ContentHash,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            id: id.into(),
            hash: ContentHash::of_bytes(text.as_bytes()),
            text,
        }
    }
}

/// Model selection and run policy for an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub analysis_capability: String,
    pub synthesis_capability: String,
    pub safety_tier: SafetyTier,
    /// Let experimental models into fallback plans.
    pub allow_experimental: bool,
    /// Continue past an Analysis stage that ended partial.
    pub tolerate_partial: bool,
    /// Treat synthesis as deterministic and cache it by fingerprint.
    pub deterministic_synthesis: bool,
    /// Capability matrix file, relative to the experiment directory.
    pub matrix: PathBuf,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            analysis_capability: "analysis".to_string(),
            synthesis_capability: "synthesis".to_string(),
            safety_tier: SafetyTier::Standard,
            allow_experimental: false,
            tolerate_partial: false,
            deterministic_synthesis: false,
            matrix: PathBuf::from("models.yaml"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExperimentFile {
    name: String,
    #[serde(default = "default_framework_path")]
    framework: PathBuf,
    #[serde(default = "default_corpus_path")]
    corpus: PathBuf,
    #[serde(default)]
    research_questions: Vec<String>,
    #[serde(default)]
    models: ModelSettings,
}

fn default_framework_path() -> PathBuf {
    PathBuf::from("framework.yaml")
}

fn default_corpus_path() -> PathBuf {
    PathBuf::from("corpus")
}

/// Immutable description of one experiment.
#[derive(Debug, Clone)]
pub struct ExperimentSpec {
    pub name: String,
    /// Directory the spec was loaded from.
    pub root: PathBuf,
    pub framework: FrameworkSpec,
    /// Sorted by id.
    pub documents: Vec<Document>,
    pub research_questions: Vec<String>,
    pub models: ModelSettings,
    spec_hash: String,
}

/// The parts of a spec that determine its results.
#[derive(Serialize)]
struct HashedSpec<'a> {
    name: &'a str,
    framework: &'a FrameworkSpec,
    documents: Vec<(&'a str, &'a ContentHash)>,
    research_questions: &'a [String],
    analysis_capability: &'a str,
    synthesis_capability: &'a str,
    safety_tier: SafetyTier,
}

impl ExperimentSpec {
    /// Builds a spec from in-memory parts. Documents are sorted by id.
    pub fn from_parts(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        framework: FrameworkSpec,
        mut documents: Vec<Document>,
        research_questions: Vec<String>,
        models: ModelSettings,
    ) -> Self {
        documents.sort_by(|a, b| a.id.cmp(&b.id));
        let mut spec = Self {
            name: name.into(),
            root: root.into(),
            framework,
            documents,
            research_questions,
            models,
            spec_hash: String::new(),
        };
        spec.spec_hash = spec.compute_hash();
        spec
    }

    /// Loads `experiment.yaml`, the framework and the corpus from `dir`.
    ///
    /// # Errors
    ///
    /// `ConfigError` if a file is missing, unreadable or malformed.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let dir = dir.as_ref();
        let experiment_path = dir.join(EXPERIMENT_FILE);
        let experiment: ExperimentFile = read_yaml(&experiment_path)?;

        let framework_path = dir.join(&experiment.framework);
        let framework: FrameworkSpec = read_yaml(&framework_path)?;

        let corpus_dir = dir.join(&experiment.corpus);
        let documents = load_corpus(&corpus_dir)?;

        tracing::debug!(
            experiment = %experiment.name,
            documents = documents.len(),
            dimensions = framework.dimensions.len(),
            "Loaded experiment"
        );

        Ok(Self::from_parts(
            experiment.name,
            dir,
            framework,
            documents,
            experiment.research_questions,
            experiment.models,
        ))
    }

    /// Returns a copy with adjusted model settings and a recomputed hash.
    pub fn with_settings(mut self, update: impl FnOnce(&mut ModelSettings)) -> Self {
        update(&mut self.models);
        self.spec_hash = self.compute_hash();
        self
    }

    /// SHA-256 over everything that determines the experiment's results.
    ///
    /// Run policy (partial tolerance, experimental opt-in, synthesis caching)
    /// and the matrix file location are excluded: they change how a run
    /// proceeds, and work-unit fingerprints already cover the models used.
    pub fn spec_hash(&self) -> &str {
        &self.spec_hash
    }

    /// SHA-256 of the framework's canonical JSON.
    pub fn framework_hash(&self) -> String {
        // Serializing plain strings and vectors cannot fail.
        sha256_hex(&canonical_json(&self.framework).unwrap_or_default())
    }

    pub fn document(&self, id: &str) -> Option<&Document> {
        self.documents.iter().find(|d| d.id == id)
    }

    /// Absolute path of the capability matrix file.
    pub fn matrix_path(&self) -> PathBuf {
        self.root.join(&self.models.matrix)
    }

    fn compute_hash(&self) -> String {
        let hashed = HashedSpec {
            name: &self.name,
            framework: &self.framework,
            documents: self
                .documents
                .iter()
                .map(|d| (d.id.as_str(), &d.hash))
                .collect(),
            research_questions: &self.research_questions,
            analysis_capability: &self.models.analysis_capability,
            synthesis_capability: &self.models.synthesis_capability,
            safety_tier: self.models.safety_tier,
        };
        sha256_hex(&canonical_json(&hashed).unwrap_or_default())
    }
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|e| ConfigError::Yaml {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Reads every `*.txt` / `*.md` file of `dir` (non-recursive).
fn load_corpus(dir: &Path) -> Result<Vec<Document>, ConfigError> {
    if !dir.is_dir() {
        return Err(ConfigError::InvalidExperiment(format!(
            "corpus directory {} does not exist",
            dir.display()
        )));
    }

    let entries = fs::read_dir(dir).map_err(|source| ConfigError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut documents = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            continue;
        }

        let is_text = path
            .extension()
            .map(|ext| ext == "txt" || ext == "md")
            .unwrap_or(false);
        if !is_text {
            continue;
        }

        let Some(id) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
            continue;
        };
        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        documents.push(Document::new(id, text));
    }

    documents.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(documents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn experiment_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "experiment.yaml",
            "name: tone-study\nresearch_questions: [\"Is tone stable?\"]\nmodels:\n  tolerate_partial: true\n",
        );
        write(
            dir.path(),
            "framework.yaml",
            r#"
name: tone
version: 1.2.0
prompt_version: v3
instructions: Score the tone.
dimensions:
  - id: warmth
  - id: hostility
derived_metrics:
  - name: net_warmth
    op: difference
    operands: [warmth, hostility]
"#,
        );
        write(dir.path(), "corpus/b.txt", "second document");
        write(dir.path(), "corpus/a.md", "first document");
        write(dir.path(), "corpus/notes.json", "{}");
        dir
    }

    #[test]
    fn test_load_reads_all_parts() {
        let dir = experiment_dir();
        let spec = ExperimentSpec::load(dir.path()).unwrap();

        assert_eq!(spec.name, "tone-study");
        assert_eq!(spec.framework.dimension_ids(), vec!["warmth", "hostility"]);
        assert_eq!(spec.framework.derived_metrics[0].op, MetricOp::Difference);
        let ids: Vec<_> = spec.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(spec.documents[0].hash, ContentHash::of_bytes(b"first document"));
        assert!(spec.models.tolerate_partial);
        assert_eq!(spec.models.analysis_capability, "analysis");
        assert_eq!(spec.matrix_path(), dir.path().join("models.yaml"));
        assert_eq!(spec.spec_hash().len(), 64);
    }

    #[test]
    fn test_spec_hash_ignores_policy_knobs() {
        let dir = experiment_dir();
        let spec = ExperimentSpec::load(dir.path()).unwrap();
        let original = spec.spec_hash().to_string();

        let relaxed = spec.clone().with_settings(|m| {
            m.tolerate_partial = false;
            m.allow_experimental = true;
            m.deterministic_synthesis = true;
        });
        assert_eq!(relaxed.spec_hash(), original);

        let stricter = spec.with_settings(|m| m.safety_tier = SafetyTier::Strict);
        assert_ne!(stricter.spec_hash(), original);
    }

    #[test]
    fn test_spec_hash_tracks_corpus_content() {
        let dir = experiment_dir();
        let before = ExperimentSpec::load(dir.path()).unwrap();
        write(dir.path(), "corpus/b.txt", "second document, edited");
        let after = ExperimentSpec::load(dir.path()).unwrap();
        assert_ne!(before.spec_hash(), after.spec_hash());
        assert_eq!(before.framework_hash(), after.framework_hash());
    }

    #[test]
    fn test_missing_pieces_are_config_errors() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            ExperimentSpec::load(dir.path()),
            Err(ConfigError::Io { .. })
        ));

        write(dir.path(), "experiment.yaml", "name: x\n");
        write(dir.path(), "framework.yaml", "name: [unclosed\n");
        assert!(matches!(
            ExperimentSpec::load(dir.path()),
            Err(ConfigError::Yaml { .. })
        ));

        write(
            dir.path(),
            "framework.yaml",
            "name: f\nversion: 1.0.0\nprompt_version: v1\n",
        );
        assert!(matches!(
            ExperimentSpec::load(dir.path()),
            Err(ConfigError::InvalidExperiment(_))
        ));
    }
}
