#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]

//! Multi-engine threat analysis: reputation fan-out, local heuristics,
//! aggregation into one risk level and plain-language explanations.

/// Requests, engine results and verdicts.
#[path = "../model.rs"]
pub mod model;

/// TOML configuration with environment overrides.
#[path = "../config.rs"]
pub mod config;

/// Structured logging and event publishing handle.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Verdict cache with expiry and hit counting.
#[path = "../cache.rs"]
pub mod cache;

/// Password-protected archive detection.
#[path = "../archive.rs"]
pub mod archive;

/// Point-weighted URL and file-name classifier.
#[path = "../heuristic.rs"]
pub mod heuristic;

/// Combination of engine results and heuristic into a verdict.
#[path = "../aggregator.rs"]
pub mod aggregator;

/// Generative explanations with template fallback.
#[path = "../explainer.rs"]
pub mod explainer;

/// Reputation source adapters.
#[path = "../engines/main.rs"]
pub mod engines;

/// Analysis state machine.
#[path = "../orchestrator.rs"]
pub mod orchestrator;

#[cfg(test)]
#[path = "../testing.rs"]
pub(crate) mod testing;

pub use aggregator::{Aggregator, Thresholds};
pub use cache::{CacheError, ResultCache};
pub use config::VigilConfig;
pub use engines::{EngineAdapter, HttpTransport};
pub use explainer::{Explainer, Explanation, TextGenerator};
pub use heuristic::{HeuristicRules, HeuristicScorer};
pub use model::{AggregatedVerdict, AnalysisRequest, EngineResult, ErrorKind, ResourceKind, RiskLevel};
pub use orchestrator::{AnalysisOutcome, AnalysisStage, ThreatOrchestrator};
pub use telemetry::{EngineTelemetry, EngineTelemetryBuilder};
