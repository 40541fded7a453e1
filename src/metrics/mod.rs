//! Prometheus-based pipeline metrics.
//!
//! Stage durations, work-unit outcomes, cache hit rates and gateway usage are
//! recorded through [`MetricsCollector`]. The CLI writes a text snapshot with
//! `--metrics-out`.
//!
//! # Example
//!
//! ```ignore
//! use analysis_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! MetricsCollector::new().record_stage("analysis", "success", 12.0);
//! let text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, REGISTRY};
