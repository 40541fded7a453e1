//! Run-scoped cost tracking for LLM usage.
//!
//! Costs are tracked internally in micro-dollars so that many small requests
//! do not round away to zero. Public methods accept and return dollars.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use super::matrix::Pricing;
use super::types::Usage;

const MICROS_PER_DOLLAR: f64 = 1_000_000.0;

fn dollars_to_micros(dollars: f64) -> u64 {
    (dollars.max(0.0) * MICROS_PER_DOLLAR).round() as u64
}

fn micros_to_dollars(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_DOLLAR
}

/// Estimated dollar cost of one request at `pricing`.
pub fn estimate_cost(usage: &Usage, pricing: &Pricing) -> f64 {
    (usage.prompt_tokens as f64 / 1_000_000.0) * pricing.input_per_1m
        + (usage.completion_tokens as f64 / 1_000_000.0) * pricing.output_per_1m
}

/// A single usage record for one successful model call.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_micros: u64,
}

/// Summary report of the spend so far.
#[derive(Debug, Clone, Serialize)]
pub struct CostReport {
    /// Total spent in dollars.
    pub total_spent: f64,
    /// Remaining budget in dollars, if a budget is set.
    pub remaining: Option<f64>,
    /// Number of calls recorded.
    pub requests: usize,
    /// Cost breakdown by model in dollars.
    pub by_model: BTreeMap<String, f64>,
}

/// Tracks spend for one run and enforces an optional run budget.
pub struct CostTracker {
    budget_micros: Option<u64>,
    spent_micros: AtomicU64,
    cost_by_model: RwLock<BTreeMap<String, u64>>,
    usage_history: RwLock<Vec<UsageRecord>>,
}

impl CostTracker {
    /// Create a tracker; `budget` is in dollars, `None` means unlimited.
    pub fn new(budget: Option<f64>) -> Self {
        Self {
            budget_micros: budget.map(dollars_to_micros),
            spent_micros: AtomicU64::new(0),
            cost_by_model: RwLock::new(BTreeMap::new()),
            usage_history: RwLock::new(Vec::new()),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Record usage from a model call and return its cost in dollars.
    pub fn record_usage(&self, model: &str, usage: &Usage, pricing: &Pricing) -> f64 {
        let cost = estimate_cost(usage, pricing);
        let cost_micros = dollars_to_micros(cost);

        self.spent_micros.fetch_add(cost_micros, Ordering::SeqCst);

        {
            let mut cost_by_model = self
                .cost_by_model
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *cost_by_model.entry(model.to_string()).or_insert(0) += cost_micros;
        }

        {
            let mut history = self
                .usage_history
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            history.push(UsageRecord {
                timestamp: Utc::now(),
                model: model.to_string(),
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                cost_micros,
            });
        }

        tracing::debug!(
            model = model,
            input_tokens = usage.prompt_tokens,
            output_tokens = usage.completion_tokens,
            cost_usd = cost,
            "Recorded LLM usage"
        );

        cost
    }

    /// Total spent so far in dollars.
    pub fn total_spent(&self) -> f64 {
        micros_to_dollars(self.spent_micros.load(Ordering::SeqCst))
    }

    /// The configured budget in dollars.
    pub fn budget(&self) -> Option<f64> {
        self.budget_micros.map(micros_to_dollars)
    }

    /// Whether spend has reached the budget.
    pub fn is_over_budget(&self) -> bool {
        match self.budget_micros {
            Some(budget) => self.spent_micros.load(Ordering::SeqCst) >= budget,
            None => false,
        }
    }

    /// Snapshot of spend so far.
    pub fn report(&self) -> CostReport {
        let by_model = self
            .cost_by_model
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(model, micros)| (model.clone(), micros_to_dollars(*micros)))
            .collect();
        let requests = self
            .usage_history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        let total_spent = self.total_spent();

        CostReport {
            total_spent,
            remaining: self.budget().map(|b| (b - total_spent).max(0.0)),
            requests,
            by_model,
        }
    }

    /// Usage history in recording order.
    pub fn usage_history(&self) -> Vec<UsageRecord> {
        self.usage_history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for CostTracker {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pricing(input: f64, output: f64) -> Pricing {
        Pricing {
            input_per_1m: input,
            output_per_1m: output,
        }
    }

    #[test]
    fn test_estimate_cost() {
        let cost = estimate_cost(&Usage::new(1_000_000, 500_000), &pricing(3.0, 15.0));
        assert!((cost - 10.5).abs() < 1e-9);
    }

    #[test]
    fn test_small_requests_are_not_rounded_away() {
        let tracker = CostTracker::unlimited();
        for _ in 0..100 {
            tracker.record_usage("cheap", &Usage::new(100, 50), &pricing(0.15, 0.60));
        }
        // 100 * (100 * 0.15 + 50 * 0.60) / 1e6 = 0.0045
        assert!((tracker.total_spent() - 0.0045).abs() < 1e-6);
    }

    #[test]
    fn test_budget_enforcement() {
        let tracker = CostTracker::new(Some(1.0));
        assert!(!tracker.is_over_budget());

        tracker.record_usage("m", &Usage::new(1_000_000, 0), &pricing(0.6, 0.0));
        assert!(!tracker.is_over_budget());

        tracker.record_usage("m", &Usage::new(1_000_000, 0), &pricing(0.6, 0.0));
        assert!(tracker.is_over_budget());

        let report = tracker.report();
        assert_eq!(report.remaining, Some(0.0));
        assert_eq!(report.requests, 2);
    }

    #[test]
    fn test_report_by_model() {
        let tracker = CostTracker::unlimited();
        tracker.record_usage("a", &Usage::new(1_000_000, 0), &pricing(1.0, 0.0));
        tracker.record_usage("b", &Usage::new(0, 1_000_000), &pricing(0.0, 2.0));
        tracker.record_usage("a", &Usage::new(1_000_000, 0), &pricing(1.0, 0.0));

        let report = tracker.report();
        assert!((report.by_model["a"] - 2.0).abs() < 1e-9);
        assert!((report.by_model["b"] - 2.0).abs() < 1e-9);
        assert!((report.total_spent - 4.0).abs() < 1e-9);
        assert!(report.remaining.is_none());
        assert_eq!(tracker.usage_history().len(), 3);
    }
}
