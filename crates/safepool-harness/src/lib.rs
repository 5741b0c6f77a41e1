//! Scenario harness for the SafePool runtime.
//!
//! This crate provides:
//! - Scenarios: self-checking runs of the engine's core properties
//!   (registry coherence, rewriting, temporal keys, metadata trie)
//! - Structured logging: JSONL records for every scenario step, with a
//!   schema validator
//! - Report generation: markdown and machine-readable summaries carrying
//!   SHA-256 digests of their inputs

#![forbid(unsafe_code)]

pub mod report;
pub mod scenarios;
pub mod structured_log;

pub use report::{ScenarioReport, ScenarioSummary};
pub use scenarios::{Scenario, ScenarioResult, ScenarioRunner};

use thiserror::Error;

/// Failures of the harness itself, as opposed to failed scenarios.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("runtime setup failed: {0}")]
    Runtime(#[from] safepool_membrane::RuntimeError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown scenario '{0}'")]
    UnknownScenario(String),
}
