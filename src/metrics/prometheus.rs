//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by analysis-forge and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all analysis-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Stage executions, labeled by stage and final status.
pub static STAGE_RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Stage wall-clock duration in seconds, labeled by stage.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Resolved work units, labeled by stage and manifest status.
pub static WORK_UNITS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Fingerprint lookups, labeled by stage and result (hit/miss).
pub static CACHE_LOOKUPS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Work units currently executing.
pub static UNITS_IN_FLIGHT: OnceLock<Gauge> = OnceLock::new();

/// Gateway candidate attempts, labeled by model and outcome.
pub static GATEWAY_ATTEMPTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// LLM API request latency in seconds, labeled by model.
pub static LLM_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Total tokens used, labeled by model and type (input/output).
pub static LLM_TOKENS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Estimated LLM spend in US dollars, labeled by model.
pub static LLM_COST_USD: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Repeated calls leave the first registry in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let stage_runs_total = CounterVec::new(
        Opts::new("analysis_forge_stage_runs_total", "Stage executions"),
        &["stage", "status"],
    )?;

    let stage_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "analysis_forge_stage_duration_seconds",
            "Stage execution duration in seconds",
        )
        .buckets(vec![0.1, 1.0, 10.0, 60.0, 300.0, 1800.0, 7200.0]),
        &["stage"],
    )?;

    let work_units_total = CounterVec::new(
        Opts::new("analysis_forge_work_units_total", "Resolved work units"),
        &["stage", "status"],
    )?;

    let cache_lookups_total = CounterVec::new(
        Opts::new(
            "analysis_forge_cache_lookups_total",
            "Fingerprint lookups against the artifact store",
        ),
        &["stage", "result"],
    )?;

    let units_in_flight = Gauge::new(
        "analysis_forge_units_in_flight",
        "Work units currently executing",
    )?;

    let gateway_attempts_total = CounterVec::new(
        Opts::new(
            "analysis_forge_gateway_attempts_total",
            "Model gateway candidate attempts",
        ),
        &["model", "outcome"],
    )?;

    let llm_latency = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "analysis_forge_llm_latency_seconds",
            "LLM API request latency in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 120.0]),
        &["model"],
    )?;

    let llm_tokens_total = CounterVec::new(
        Opts::new("analysis_forge_llm_tokens_total", "Total tokens used"),
        &["model", "type"],
    )?;

    let llm_cost_usd = CounterVec::new(
        Opts::new("analysis_forge_llm_cost_usd", "Estimated LLM spend in USD"),
        &["model"],
    )?;

    registry.register(Box::new(stage_runs_total.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(work_units_total.clone()))?;
    registry.register(Box::new(cache_lookups_total.clone()))?;
    registry.register(Box::new(units_in_flight.clone()))?;
    registry.register(Box::new(gateway_attempts_total.clone()))?;
    registry.register(Box::new(llm_latency.clone()))?;
    registry.register(Box::new(llm_tokens_total.clone()))?;
    registry.register(Box::new(llm_cost_usd.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = STAGE_RUNS_TOTAL.set(stage_runs_total);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = WORK_UNITS_TOTAL.set(work_units_total);
    let _ = CACHE_LOOKUPS_TOTAL.set(cache_lookups_total);
    let _ = UNITS_IN_FLIGHT.set(units_in_flight);
    let _ = GATEWAY_ATTEMPTS_TOTAL.set(gateway_attempts_total);
    let _ = LLM_LATENCY.set(llm_latency);
    let _ = LLM_TOKENS_TOTAL.set(llm_tokens_total);
    let _ = LLM_COST_USD.set(llm_cost_usd);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, the returned
/// text is a single comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
