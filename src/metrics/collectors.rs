//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until [`init_metrics`](super::init_metrics) has run,
//! so library code can record unconditionally.

use super::prometheus::{
    CACHE_LOOKUPS_TOTAL, GATEWAY_ATTEMPTS_TOTAL, LLM_COST_USD, LLM_LATENCY, LLM_TOKENS_TOTAL,
    STAGE_DURATION, STAGE_RUNS_TOTAL, UNITS_IN_FLIGHT, WORK_UNITS_TOTAL,
};

/// Metrics collector for recording pipeline operational metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a finished stage.
    pub fn record_stage(&self, stage: &str, status: &str, duration_secs: f64) {
        if let Some(stage_runs) = STAGE_RUNS_TOTAL.get() {
            stage_runs.with_label_values(&[stage, status]).inc();
        }

        if let Some(stage_duration) = STAGE_DURATION.get() {
            stage_duration
                .with_label_values(&[stage])
                .observe(duration_secs);
        }

        tracing::trace!(
            stage = stage,
            status = status,
            duration_secs = duration_secs,
            "Recorded stage metric"
        );
    }

    /// Record a resolved work unit.
    pub fn record_unit(&self, stage: &str, status: &str) {
        if let Some(units) = WORK_UNITS_TOTAL.get() {
            units.with_label_values(&[stage, status]).inc();
        }
    }

    /// Record a fingerprint lookup.
    pub fn record_cache_lookup(&self, stage: &str, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        if let Some(lookups) = CACHE_LOOKUPS_TOTAL.get() {
            lookups.with_label_values(&[stage, result]).inc();
        }
    }

    /// Mark a work unit as started.
    pub fn unit_started(&self) {
        if let Some(gauge) = UNITS_IN_FLIGHT.get() {
            gauge.inc();
        }
    }

    /// Mark a work unit as finished.
    pub fn unit_finished(&self) {
        if let Some(gauge) = UNITS_IN_FLIGHT.get() {
            gauge.dec();
        }
    }

    /// Record one gateway attempt against a candidate model.
    pub fn record_gateway_attempt(&self, model: &str, outcome: &str) {
        if let Some(attempts) = GATEWAY_ATTEMPTS_TOTAL.get() {
            attempts.with_label_values(&[model, outcome]).inc();
        }
    }

    /// Record a completed LLM request.
    pub fn record_llm_request(
        &self,
        model: &str,
        latency_secs: f64,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
    ) {
        if let Some(llm_latency) = LLM_LATENCY.get() {
            llm_latency.with_label_values(&[model]).observe(latency_secs);
        }

        if let Some(llm_tokens) = LLM_TOKENS_TOTAL.get() {
            llm_tokens
                .with_label_values(&[model, "input"])
                .inc_by(input_tokens as f64);
            llm_tokens
                .with_label_values(&[model, "output"])
                .inc_by(output_tokens as f64);
        }

        if cost_usd > 0.0 {
            if let Some(llm_cost) = LLM_COST_USD.get() {
                llm_cost.with_label_values(&[model]).inc_by(cost_usd);
            }
        }

        tracing::trace!(
            model = model,
            latency_secs = latency_secs,
            input_tokens = input_tokens,
            output_tokens = output_tokens,
            cost_usd = cost_usd,
            "Recorded LLM request metric"
        );
    }
}
