//! Runtime configuration for the pipeline orchestrator.
//!
//! These knobs control how a run executes (concurrency, timeouts, retries,
//! spend), never what it computes, so none of them enter the spec hash.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::llm::{GatewayConfig, MatrixError, RetryPolicy};

/// Errors raised while loading configuration or experiment inputs.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// A configuration or input file could not be read.
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A YAML file could not be parsed.
    #[error("Failed to parse {path}: {message}")]
    Yaml { path: PathBuf, message: String },

    /// The experiment directory is unusable.
    #[error("Invalid experiment: {0}")]
    InvalidExperiment(String),

    /// The capability matrix is inconsistent.
    #[error(transparent)]
    Matrix(#[from] MatrixError),
}

/// Configuration for the pipeline orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Work units of one stage processed concurrently.
    pub max_concurrent_units: usize,
    /// Requests in flight against a single provider.
    pub max_in_flight_per_provider: usize,
    /// Upper bound for one model request.
    pub request_timeout: Duration,
    /// Backoff for transient gateway failures.
    pub retry: RetryPolicy,
    /// Dollar budget for the run, `None` for unlimited.
    pub run_budget: Option<f64>,
    /// Sampling temperature for per-document analysis.
    pub analysis_temperature: f64,
    /// Sampling temperature for narrative synthesis.
    pub synthesis_temperature: f64,
    /// Completion token cap per request.
    pub max_tokens: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_units: 4,
            max_in_flight_per_provider: 4,
            request_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            run_budget: None,
            analysis_temperature: 0.0,
            synthesis_temperature: 0.7,
            max_tokens: 4096,
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `FORGE_MAX_CONCURRENT_UNITS`: Work units in parallel (default: 4)
    /// - `FORGE_MAX_IN_FLIGHT_PER_PROVIDER`: Requests per provider (default: 4)
    /// - `FORGE_REQUEST_TIMEOUT_SECS`: Request timeout (default: 120)
    /// - `FORGE_RETRY_MAX_ATTEMPTS`: Tries per candidate (default: 3)
    /// - `FORGE_RETRY_BASE_DELAY_MS`: First backoff delay (default: 1000)
    /// - `FORGE_RETRY_MAX_DELAY_SECS`: Backoff ceiling (default: 30)
    /// - `FORGE_RUN_BUDGET`: Dollar budget per run (default: unlimited)
    /// - `FORGE_ANALYSIS_TEMPERATURE`: Analysis temperature (default: 0.0)
    /// - `FORGE_SYNTHESIS_TEMPERATURE`: Synthesis temperature (default: 0.7)
    /// - `FORGE_MAX_TOKENS`: Completion token cap (default: 4096)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("FORGE_MAX_CONCURRENT_UNITS") {
            config.max_concurrent_units = parse_env_value(&val, "FORGE_MAX_CONCURRENT_UNITS")?;
        }

        if let Some(val) = lookup("FORGE_MAX_IN_FLIGHT_PER_PROVIDER") {
            config.max_in_flight_per_provider =
                parse_env_value(&val, "FORGE_MAX_IN_FLIGHT_PER_PROVIDER")?;
        }

        if let Some(val) = lookup("FORGE_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "FORGE_REQUEST_TIMEOUT_SECS")?;
            config.request_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("FORGE_RETRY_MAX_ATTEMPTS") {
            config.retry.max_attempts = parse_env_value(&val, "FORGE_RETRY_MAX_ATTEMPTS")?;
        }

        if let Some(val) = lookup("FORGE_RETRY_BASE_DELAY_MS") {
            let millis: u64 = parse_env_value(&val, "FORGE_RETRY_BASE_DELAY_MS")?;
            config.retry.base_delay = Duration::from_millis(millis);
        }

        if let Some(val) = lookup("FORGE_RETRY_MAX_DELAY_SECS") {
            let secs: u64 = parse_env_value(&val, "FORGE_RETRY_MAX_DELAY_SECS")?;
            config.retry.max_delay = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("FORGE_RUN_BUDGET") {
            config.run_budget = Some(parse_env_value(&val, "FORGE_RUN_BUDGET")?);
        }

        if let Some(val) = lookup("FORGE_ANALYSIS_TEMPERATURE") {
            config.analysis_temperature = parse_env_value(&val, "FORGE_ANALYSIS_TEMPERATURE")?;
        }

        if let Some(val) = lookup("FORGE_SYNTHESIS_TEMPERATURE") {
            config.synthesis_temperature = parse_env_value(&val, "FORGE_SYNTHESIS_TEMPERATURE")?;
        }

        if let Some(val) = lookup("FORGE_MAX_TOKENS") {
            config.max_tokens = parse_env_value(&val, "FORGE_MAX_TOKENS")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_units == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_units must be greater than 0".to_string(),
            ));
        }

        if self.max_in_flight_per_provider == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_in_flight_per_provider must be greater than 0".to_string(),
            ));
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "request_timeout must be greater than 0".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::ValidationFailed(
                "retry.base_delay cannot exceed retry.max_delay".to_string(),
            ));
        }

        if let Some(budget) = self.run_budget {
            if !(budget.is_finite() && budget >= 0.0) {
                return Err(ConfigError::ValidationFailed(
                    "run_budget must be a non-negative amount".to_string(),
                ));
            }
        }

        for (name, value) in [
            ("analysis_temperature", self.analysis_temperature),
            ("synthesis_temperature", self.synthesis_temperature),
        ] {
            if !(0.0..=2.0).contains(&value) {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be between 0.0 and 2.0",
                    name
                )));
            }
        }

        if self.max_tokens == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_tokens must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Gateway settings derived from this configuration.
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            max_in_flight_per_provider: self.max_in_flight_per_provider,
            request_timeout: self.request_timeout,
            retry: self.retry.clone(),
            run_budget: self.run_budget,
        }
    }

    /// Builder method to set concurrent work units.
    pub fn with_max_concurrent_units(mut self, max: usize) -> Self {
        self.max_concurrent_units = max;
        self
    }

    /// Builder method to set per-provider in-flight requests.
    pub fn with_max_in_flight_per_provider(mut self, max: usize) -> Self {
        self.max_in_flight_per_provider = max;
        self
    }

    /// Builder method to set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Builder method to set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Builder method to set the run budget.
    pub fn with_run_budget(mut self, budget: Option<f64>) -> Self {
        self.run_budget = budget;
        self
    }

    /// Builder method to set the analysis temperature.
    pub fn with_analysis_temperature(mut self, temp: f64) -> Self {
        self.analysis_temperature = temp;
        self
    }

    /// Builder method to set the synthesis temperature.
    pub fn with_synthesis_temperature(mut self, temp: f64) -> Self {
        self.synthesis_temperature = temp;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
