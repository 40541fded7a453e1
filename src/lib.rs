//! analysis-forge: reproducible experiment orchestration for LLM-driven
//! corpus analysis.
//!
//! An experiment directory (framework, corpus, research questions) is driven
//! through a fixed sequence of stages. Every artifact is content-addressed,
//! every step is journaled in a provenance manifest, and failed runs resume
//! without repeating work whose inputs have not changed.

pub mod cli;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod pipeline;
pub mod provenance;
pub mod storage;
pub mod utils;

// Re-export commonly used error types
pub use error::{ErrorKind, LlmError, ValidationError, ValidationIssue};
