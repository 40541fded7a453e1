//! Experiment pipeline.
//!
//! A run drives one [`ExperimentSpec`] through the fixed stage sequence:
//!
//! 1. **Preflight validation**: framework, corpus and capability matrix are
//!    checked before any model is called
//! 2. **Analysis**: one model call per document, each cached by fingerprint
//! 3. **Statistical preparation**: scores become a dataset with derived
//!    metrics, exported as CSV and Parquet
//! 4. **Synthesis**: a narrative answer to the research questions
//! 5. **Finalization**: everything is packed into a reproducible bundle
//!
//! Runs are never mutated after they end. A resume forks a new run that
//! reuses the verified artifacts of its predecessor.
//!
//! # Example
//!
//! ```rust,ignore
//! use analysis_forge::pipeline::{ExperimentSpec, PipelineConfig, PipelineOrchestrator, RunOptions, RunTarget};
//! use std::sync::Arc;
//!
//! let spec = Arc::new(ExperimentSpec::load("my-experiment")?);
//! let orchestrator = PipelineOrchestrator::new("my-experiment", PipelineConfig::from_env()?, gateway);
//!
//! let report = orchestrator
//!     .run(spec, RunOptions { target: RunTarget::StatisticalPrep, ..Default::default() })
//!     .await?;
//! println!("{} -> exit {}", report.run.run_id, report.exit_code());
//! ```

pub mod config;
pub mod export;
pub mod orchestrator;
pub mod resume;
pub mod run;
pub mod spec;
pub mod stages;

pub use config::{ConfigError, PipelineConfig};
pub use orchestrator::{PipelineError, PipelineOrchestrator, RunOptions, RunReport, RunTarget, StageSummary};
pub use resume::{PromoteReport, ResumeController, ResumeError, ResumePlan, ResumeRequest};
pub use run::{CancellationFlag, Run, RunLayout, RunPaths, RunStatus, StageName};
pub use spec::{ExperimentSpec, FrameworkSpec, ModelSettings};
