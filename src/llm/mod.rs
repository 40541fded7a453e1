//! LLM access for analysis-forge.
//!
//! Stages never pick a model. They send a capability-addressed
//! [`CompletionRequest`] to the [`ModelGateway`], which resolves it through the
//! [`CapabilityMatrix`] into an ordered fallback plan and handles retries,
//! timeouts, per-provider concurrency and cost accounting.
//!
//! ```ignore
//! use analysis_forge::llm::{CapabilityMatrix, CompletionRequest, GatewayConfig, Message, ModelGateway, SafetyTier};
//! use std::sync::Arc;
//!
//! let matrix = Arc::new(CapabilityMatrix::load("models.yaml".as_ref())?);
//! let gateway = ModelGateway::from_matrix(matrix, GatewayConfig::default());
//!
//! let request = CompletionRequest::new("analysis", SafetyTier::Standard, vec![Message::user("...")]);
//! let result = gateway.complete(&request).await?;
//! println!("{} answered", result.model_used);
//! ```

pub mod cost;
pub mod gateway;
pub mod matrix;
pub mod providers;
pub mod types;

pub use cost::{CostReport, CostTracker, UsageRecord};
pub use gateway::{
    AttemptOutcome, AttemptRecord, CompletionRequest, CompletionResult, GatewayConfig,
    GatewayError, ModelGateway, ResponseFormat, RetryPolicy,
};
pub use matrix::{
    CapabilityMatrix, CapabilityTier, FallbackPlan, FallbackStep, MatrixError, ModelEntry,
    ModelStatus, Pricing, ProviderConfig, ProviderKind, SafetyTier, SkipReason,
};
pub use providers::OpenAiCompatibleProvider;
pub use types::{Choice, GenerationRequest, GenerationResponse, LlmProvider, Message, Usage};
