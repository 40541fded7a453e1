//! LLM backend implementations.

pub mod openai_compatible;

use std::sync::Arc;

pub use openai_compatible::{OpenAiCompatibleProvider, OPENROUTER_API_KEY_ENV, OPENROUTER_BASE_URL};

use super::matrix::{ProviderConfig, ProviderKind};
use super::types::LlmProvider;
use crate::error::LlmError;

/// Builds the backend a matrix provider entry describes.
///
/// # Errors
///
/// Returns `LlmError::MissingApiKey` when the provider needs a key and its
/// environment variable is not set.
pub fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let provider = match config.kind {
        ProviderKind::Openrouter => {
            let base = config.api_base.as_deref().unwrap_or(OPENROUTER_BASE_URL);
            let env = config.api_key_env.as_deref().unwrap_or(OPENROUTER_API_KEY_ENV);
            OpenAiCompatibleProvider::from_env(&config.name, base, env)?
        }
        ProviderKind::OpenaiCompatible => {
            let base = config.api_base.clone().unwrap_or_default();
            match config.api_key_env.as_deref() {
                Some(env) => OpenAiCompatibleProvider::from_env(&config.name, base, env)?,
                None => OpenAiCompatibleProvider::new(&config.name, base, None)?,
            }
        }
    };
    Ok(Arc::new(provider))
}
