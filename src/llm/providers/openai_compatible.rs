//! Backend for OpenAI-compatible chat completion endpoints.
//!
//! Covers OpenRouter as well as any self-hosted proxy (LiteLLM, vLLM, ...)
//! that speaks `/chat/completions`. One call is one HTTP request.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::llm::types::{Choice, GenerationRequest, GenerationResponse, LlmProvider, Message, Usage};

/// Default OpenRouter API endpoint.
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Environment variable holding the OpenRouter key when none is configured.
pub const OPENROUTER_API_KEY_ENV: &str = "OPENROUTER_API_KEY";

/// Client for one OpenAI-compatible endpoint.
pub struct OpenAiCompatibleProvider {
    /// Provider name from the capability matrix.
    name: String,
    /// HTTP client for making API requests.
    client: Client,
    /// Optional bearer token.
    api_key: Option<String>,
    /// Base URL, without the `/chat/completions` suffix.
    base_url: String,
}

impl OpenAiCompatibleProvider {
    /// Create a provider for `base_url`.
    ///
    /// The client has no request timeout of its own; the gateway bounds every
    /// call.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, LlmError> {
        let client = Client::builder()
            .build()
            .map_err(|e| LlmError::RequestFailed(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            name: name.into(),
            client,
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Create a provider pointed at OpenRouter.
    pub fn openrouter(api_key: String) -> Result<Self, LlmError> {
        Self::new("openrouter", OPENROUTER_BASE_URL, Some(api_key))
    }

    /// Create a provider whose key comes from environment variable `api_key_env`.
    ///
    /// # Errors
    ///
    /// Returns `LlmError::MissingApiKey` if the variable is unset or empty.
    pub fn from_env(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key_env: &str,
    ) -> Result<Self, LlmError> {
        let api_key = std::env::var(api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| LlmError::MissingApiKey(api_key_env.to_string()))?;
        Self::new(name, base_url, Some(api_key))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get the API key (for debugging, returns masked value).
    pub fn api_key_masked(&self) -> String {
        let Some(api_key) = &self.api_key else {
            return "<none>".to_string();
        };
        if api_key.len() <= 8 {
            "*".repeat(api_key.len())
        } else {
            format!("{}...{}", &api_key[..4], &api_key[api_key.len() - 4..])
        }
    }

    async fn execute_request(&self, request: &ApiRequest) -> Result<GenerationResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut http_request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("HTTP-Referer", "https://analysis-forge.local")
            .header("X-Title", "analysis-forge");

        if let Some(api_key) = &self.api_key {
            http_request = http_request.header("Authorization", format!("Bearer {}", api_key));
        }

        let http_response = http_request.json(request).send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::RequestFailed(format!("timeout: {}", e))
            } else if e.is_connect() {
                LlmError::RequestFailed(format!("connection error: {}", e))
            } else {
                LlmError::RequestFailed(e.to_string())
            }
        })?;

        let status = http_response.status();

        if !status.is_success() {
            let status_code = status.as_u16();
            let error_text = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());

            let message = serde_json::from_str::<ApiErrorResponse>(&error_text)
                .map(|r| r.error.message)
                .unwrap_or(error_text);

            return Err(match status_code {
                429 => LlmError::RateLimited(message),
                404 => LlmError::InvalidModel(format!("{}: {}", request.model, message)),
                _ => LlmError::ApiError {
                    code: status_code,
                    message,
                },
            });
        }

        let api_response: ApiResponse = http_response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(format!("Failed to parse API response: {}", e)))?;

        let choices = api_response
            .choices
            .into_iter()
            .map(|choice| Choice {
                index: choice.index,
                message: Message {
                    role: choice.message.role,
                    content: choice.message.content.unwrap_or_default(),
                },
                finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
            })
            .collect();

        Ok(GenerationResponse {
            id: api_response.id,
            model: api_response.model,
            choices,
            usage: api_response
                .usage
                .map(|u| Usage {
                    prompt_tokens: u.prompt_tokens,
                    completion_tokens: u.completion_tokens,
                    total_tokens: u.total_tokens,
                })
                .unwrap_or_default(),
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let api_request = ApiRequest {
            model: request.model,
            messages: request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
        };

        tracing::trace!(provider = %self.name, model = %api_request.model, "Sending completion request");
        self.execute_request(&api_request).await
    }
}

/// Internal request structure for the chat completions API.
#[derive(Debug, Clone, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
}

/// Internal response structure from the chat completions API.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

/// Internal choice structure from the API response.
#[derive(Debug, Deserialize)]
struct ApiChoice {
    #[serde(default)]
    index: u32,
    message: ApiMessage,
    finish_reason: Option<String>,
}

/// Internal message structure from the API response.
#[derive(Debug, Deserialize)]
struct ApiMessage {
    role: String,
    content: Option<String>,
}

/// Internal usage structure from the API response.
#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

/// Error response from the API.
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

/// Error detail from the API.
#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openrouter_defaults() {
        let provider = OpenAiCompatibleProvider::openrouter("test-api-key".to_string()).unwrap();

        assert_eq!(provider.name(), "openrouter");
        assert_eq!(provider.base_url(), OPENROUTER_BASE_URL);
        assert_eq!(provider.api_key_masked(), "test...-key");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let provider = OpenAiCompatibleProvider::new("proxy", "http://localhost:4000/v1/", None).unwrap();
        assert_eq!(provider.base_url(), "http://localhost:4000/v1");
        assert_eq!(provider.api_key_masked(), "<none>");
    }

    #[test]
    fn test_api_key_masked_short() {
        let provider = OpenAiCompatibleProvider::openrouter("abc".to_string()).unwrap();
        assert_eq!(provider.api_key_masked(), "***");
    }

    #[test]
    fn test_from_env_missing_key() {
        let result = OpenAiCompatibleProvider::from_env(
            "proxy",
            "http://localhost:4000",
            "ANALYSIS_FORGE_TEST_UNSET_KEY_VAR",
        );
        assert!(matches!(result, Err(LlmError::MissingApiKey(var)) if var == "ANALYSIS_FORGE_TEST_UNSET_KEY_VAR"));
    }

    #[tokio::test]
    async fn test_generate_connection_error_is_transient() {
        let provider =
            OpenAiCompatibleProvider::new("local", "http://127.0.0.1:9", Some("k".to_string())).unwrap();

        let request = GenerationRequest::new("test-model", vec![Message::user("test")]);
        let err = provider.generate(request).await.unwrap_err();

        assert!(matches!(err, LlmError::RequestFailed(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_api_request_serialization() {
        let request = ApiRequest {
            model: "test-model".to_string(),
            messages: vec![Message::user("Hello")],
            temperature: Some(0.7),
            max_tokens: Some(1000),
            top_p: None,
        };

        let json = serde_json::to_string(&request).expect("serialization should succeed");
        assert!(json.contains("\"model\":\"test-model\""));
        assert!(json.contains("\"temperature\":0.7"));
        assert!(json.contains("\"max_tokens\":1000"));
        assert!(!json.contains("top_p"));
    }

    #[test]
    fn test_api_response_without_usage() {
        let body = r#"{"id":"x","model":"m","choices":[{"index":0,"message":{"role":"assistant","content":"hi"}}]}"#;
        let parsed: ApiResponse = serde_json::from_str(body).unwrap();
        assert!(parsed.usage.is_none());
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("hi"));
    }
}
