//! Capability matrix: which models may serve which capability at which
//! safety tier, and in what order they are tried.
//!
//! Loaded from `models.yaml`:
//!
//! ```yaml
//! providers:
//!   - name: openrouter
//!     kind: openrouter
//! models:
//!   - id: anthropic/claude-sonnet-4
//!     provider: openrouter
//!     tier: flagship
//!     pricing: { input_per_1m: 3.0, output_per_1m: 15.0 }
//! matrix:
//!   analysis:
//!     standard: [anthropic/claude-sonnet-4]
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or querying the matrix.
#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("Failed to read capability matrix {path}: {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse capability matrix: {0}")]
    Parse(String),

    #[error("Capability '{capability}' at tier '{tier}' references unknown model '{model}'")]
    UnknownModel {
        capability: String,
        tier: SafetyTier,
        model: String,
    },

    #[error("Model '{model}' references unknown provider '{provider}'")]
    UnknownProvider { model: String, provider: String },

    #[error("Duplicate {what} '{name}'")]
    Duplicate { what: &'static str, name: String },

    #[error("No candidates declared for capability '{capability}' at tier '{tier}'")]
    NoCandidates { capability: String, tier: SafetyTier },
}

/// Content-safety tier a request runs under.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SafetyTier {
    Strict,
    #[default]
    Standard,
    Permissive,
}

impl SafetyTier {
    pub fn as_str(self) -> &'static str {
        match self {
            SafetyTier::Strict => "strict",
            SafetyTier::Standard => "standard",
            SafetyTier::Permissive => "permissive",
        }
    }
}

impl std::fmt::Display for SafetyTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SafetyTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(SafetyTier::Strict),
            "standard" => Ok(SafetyTier::Standard),
            "permissive" => Ok(SafetyTier::Permissive),
            other => Err(format!("unknown safety tier '{}'", other)),
        }
    }
}

/// Capability class of a model. Declaration order is fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityTier {
    Flagship,
    Standard,
    CostOptimized,
}

/// Availability of a model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    #[default]
    Available,
    Unavailable,
    Experimental,
}

/// Dollar pricing per million tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    #[serde(default)]
    pub input_per_1m: f64,
    #[serde(default)]
    pub output_per_1m: f64,
}

/// Kind of backend a provider entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Openrouter,
    OpenaiCompatible,
}

/// A backend declared in the matrix file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    /// Base URL; required for `openai_compatible`.
    #[serde(default)]
    pub api_base: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

/// One model known to the matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub provider: String,
    pub tier: CapabilityTier,
    #[serde(default)]
    pub status: ModelStatus,
    /// Safety tiers this model must not serve.
    #[serde(default)]
    pub blocked_tiers: Vec<SafetyTier>,
    #[serde(default)]
    pub pricing: Pricing,
}

/// How a candidate relates to the one tried before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStep {
    /// First candidate of the plan.
    Primary,
    /// Same capability tier as the previous candidate.
    Horizontal,
    /// First candidate of a lower capability tier.
    Vertical,
}

/// Why a candidate is not eligible for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Unavailable,
    BlockedForTier,
    ExperimentalNotOptedIn,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SkipReason::Unavailable => "model is unavailable",
            SkipReason::BlockedForTier => "model is blocked for this safety tier",
            SkipReason::ExperimentalNotOptedIn => "model is experimental and not opted in",
        })
    }
}

/// One entry of a [`FallbackPlan`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedCandidate {
    pub model: ModelEntry,
    pub step: FallbackStep,
    /// Set when the candidate must be skipped.
    pub skip: Option<SkipReason>,
}

/// Ordered candidate list for one (capability, safety tier) request.
///
/// Candidates are ordered by capability tier, flagship first; within a tier the
/// declared order is kept. Ineligible candidates stay in the plan so that the
/// skip can be recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackPlan {
    pub capability: String,
    pub safety_tier: SafetyTier,
    pub candidates: Vec<PlannedCandidate>,
}

impl FallbackPlan {
    /// Candidates that may actually be called.
    pub fn eligible(&self) -> impl Iterator<Item = &PlannedCandidate> {
        self.candidates.iter().filter(|c| c.skip.is_none())
    }

    pub fn has_eligible(&self) -> bool {
        self.eligible().next().is_some()
    }

    /// Eligible model ids in order. Feeds work-unit fingerprints, so a change
    /// to the candidate set invalidates cached results.
    pub fn eligible_ids(&self) -> Vec<String> {
        self.eligible().map(|c| c.model.id.clone()).collect()
    }
}

#[derive(Debug, Deserialize)]
struct MatrixFile {
    #[serde(default)]
    providers: Vec<ProviderConfig>,
    models: Vec<ModelEntry>,
    matrix: BTreeMap<String, BTreeMap<SafetyTier, Vec<String>>>,
}

/// Validated capability matrix.
#[derive(Debug, Clone)]
pub struct CapabilityMatrix {
    providers: Vec<ProviderConfig>,
    models: BTreeMap<String, ModelEntry>,
    table: BTreeMap<String, BTreeMap<SafetyTier, Vec<String>>>,
}

impl CapabilityMatrix {
    /// Builds and validates a matrix. Every model must name a known provider
    /// (when providers are declared) and every table entry a known model.
    pub fn from_parts(
        providers: Vec<ProviderConfig>,
        models: Vec<ModelEntry>,
        table: BTreeMap<String, BTreeMap<SafetyTier, Vec<String>>>,
    ) -> Result<Self, MatrixError> {
        let mut provider_names = std::collections::BTreeSet::new();
        for provider in &providers {
            if !provider_names.insert(provider.name.clone()) {
                return Err(MatrixError::Duplicate {
                    what: "provider",
                    name: provider.name.clone(),
                });
            }
            if provider.kind == ProviderKind::OpenaiCompatible && provider.api_base.is_none() {
                return Err(MatrixError::Parse(format!(
                    "provider '{}' of kind openai_compatible needs an api_base",
                    provider.name
                )));
            }
        }

        let mut by_id = BTreeMap::new();
        for model in models {
            if !providers.is_empty() && !provider_names.contains(&model.provider) {
                return Err(MatrixError::UnknownProvider {
                    model: model.id.clone(),
                    provider: model.provider.clone(),
                });
            }
            if by_id.contains_key(&model.id) {
                return Err(MatrixError::Duplicate {
                    what: "model",
                    name: model.id.clone(),
                });
            }
            by_id.insert(model.id.clone(), model);
        }

        for (capability, tiers) in &table {
            for (tier, ids) in tiers {
                if ids.is_empty() {
                    return Err(MatrixError::NoCandidates {
                        capability: capability.clone(),
                        tier: *tier,
                    });
                }
                for id in ids {
                    if !by_id.contains_key(id) {
                        return Err(MatrixError::UnknownModel {
                            capability: capability.clone(),
                            tier: *tier,
                            model: id.clone(),
                        });
                    }
                }
            }
        }

        Ok(Self {
            providers,
            models: by_id,
            table,
        })
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, MatrixError> {
        let file: MatrixFile =
            serde_yaml::from_str(yaml).map_err(|e| MatrixError::Parse(e.to_string()))?;
        Self::from_parts(file.providers, file.models, file.matrix)
    }

    pub fn load(path: &Path) -> Result<Self, MatrixError> {
        let yaml = std::fs::read_to_string(path).map_err(|e| MatrixError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_yaml_str(&yaml)
    }

    pub fn providers(&self) -> &[ProviderConfig] {
        &self.providers
    }

    pub fn model(&self, id: &str) -> Option<&ModelEntry> {
        self.models.get(id)
    }

    /// Capabilities declared in the table.
    pub fn capabilities(&self) -> impl Iterator<Item = &str> {
        self.table.keys().map(String::as_str)
    }

    /// Builds the fallback plan for `capability` at `tier`.
    pub fn plan(
        &self,
        capability: &str,
        tier: SafetyTier,
        allow_experimental: bool,
    ) -> Result<FallbackPlan, MatrixError> {
        let ids = self
            .table
            .get(capability)
            .and_then(|tiers| tiers.get(&tier))
            .filter(|ids| !ids.is_empty())
            .ok_or_else(|| MatrixError::NoCandidates {
                capability: capability.to_string(),
                tier,
            })?;

        let mut ordered: Vec<&ModelEntry> = ids.iter().filter_map(|id| self.models.get(id)).collect();
        // Stable: declared order survives within a tier.
        ordered.sort_by_key(|m| m.tier);

        let mut candidates = Vec::with_capacity(ordered.len());
        let mut previous_tier: Option<CapabilityTier> = None;
        for model in ordered {
            let step = match previous_tier {
                None => FallbackStep::Primary,
                Some(prev) if prev == model.tier => FallbackStep::Horizontal,
                Some(_) => FallbackStep::Vertical,
            };
            previous_tier = Some(model.tier);

            let skip = if model.status == ModelStatus::Unavailable {
                Some(SkipReason::Unavailable)
            } else if model.blocked_tiers.contains(&tier) {
                Some(SkipReason::BlockedForTier)
            } else if model.status == ModelStatus::Experimental && !allow_experimental {
                Some(SkipReason::ExperimentalNotOptedIn)
            } else {
                None
            };

            candidates.push(PlannedCandidate {
                model: model.clone(),
                step,
                skip,
            });
        }

        Ok(FallbackPlan {
            capability: capability.to_string(),
            safety_tier: tier,
            candidates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MATRIX: &str = r#"
providers:
  - name: router
    kind: openrouter
  - name: local
    kind: openai_compatible
    api_base: http://localhost:4000/v1
models:
  - id: cheap-a
    provider: local
    tier: cost_optimized
  - id: flag-a
    provider: router
    tier: flagship
    pricing: { input_per_1m: 3.0, output_per_1m: 15.0 }
  - id: std-a
    provider: router
    tier: standard
  - id: flag-b
    provider: router
    tier: flagship
  - id: lab
    provider: router
    tier: flagship
    status: experimental
  - id: edgy
    provider: router
    tier: standard
    blocked_tiers: [strict]
  - id: retired
    provider: router
    tier: standard
    status: unavailable
matrix:
  analysis:
    standard: [cheap-a, flag-a, std-a, flag-b]
    strict: [lab, edgy, std-a, retired]
"#;

    fn matrix() -> CapabilityMatrix {
        CapabilityMatrix::from_yaml_str(MATRIX).unwrap()
    }

    #[test]
    fn test_plan_orders_by_tier_and_keeps_declared_order() {
        let plan = matrix().plan("analysis", SafetyTier::Standard, false).unwrap();
        let ids: Vec<_> = plan.candidates.iter().map(|c| c.model.id.as_str()).collect();
        assert_eq!(ids, vec!["flag-a", "flag-b", "std-a", "cheap-a"]);

        let steps: Vec<_> = plan.candidates.iter().map(|c| c.step).collect();
        assert_eq!(
            steps,
            vec![
                FallbackStep::Primary,
                FallbackStep::Horizontal,
                FallbackStep::Vertical,
                FallbackStep::Vertical,
            ]
        );
        assert_eq!(plan.eligible_ids().len(), 4);
    }

    #[test]
    fn test_ineligible_candidates_are_marked() {
        let plan = matrix().plan("analysis", SafetyTier::Strict, false).unwrap();
        let skips: Vec<_> = plan
            .candidates
            .iter()
            .map(|c| (c.model.id.as_str(), c.skip))
            .collect();
        assert_eq!(
            skips,
            vec![
                ("lab", Some(SkipReason::ExperimentalNotOptedIn)),
                ("edgy", Some(SkipReason::BlockedForTier)),
                ("std-a", None),
                ("retired", Some(SkipReason::Unavailable)),
            ]
        );
        assert_eq!(plan.eligible_ids(), vec!["std-a".to_string()]);
    }

    #[test]
    fn test_experimental_opt_in() {
        let plan = matrix().plan("analysis", SafetyTier::Strict, true).unwrap();
        assert_eq!(plan.eligible_ids(), vec!["lab".to_string(), "std-a".to_string()]);
    }

    #[test]
    fn test_missing_capability_is_error() {
        let err = matrix().plan("synthesis", SafetyTier::Standard, false).unwrap_err();
        assert!(matches!(err, MatrixError::NoCandidates { .. }));
        let err = matrix().plan("analysis", SafetyTier::Permissive, false).unwrap_err();
        assert!(err.to_string().contains("permissive"));
    }

    #[test]
    fn test_unknown_model_rejected() {
        let yaml = r#"
models:
  - id: a
    provider: p
    tier: standard
matrix:
  analysis:
    standard: [a, ghost]
"#;
        let err = CapabilityMatrix::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, MatrixError::UnknownModel { ref model, .. } if model == "ghost"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let yaml = r#"
providers:
  - name: p
    kind: openrouter
models:
  - id: a
    provider: q
    tier: standard
matrix: {}
"#;
        let err = CapabilityMatrix::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, MatrixError::UnknownProvider { .. }));
    }

    #[test]
    fn test_safety_tier_parse() {
        assert_eq!("STRICT".parse::<SafetyTier>().unwrap(), SafetyTier::Strict);
        assert!("lenient".parse::<SafetyTier>().is_err());
        assert_eq!(SafetyTier::default(), SafetyTier::Standard);
    }
}
