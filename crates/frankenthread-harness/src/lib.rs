//! Verification harness for frankenthread.
//!
//! This crate provides:
//! - Scenarios: one runnable check per runtime property, each producing a
//!   serializable [`ScenarioReport`]
//! - Report output as a single JSON document or one JSONL line per scenario

#![forbid(unsafe_code)]

pub mod error;
pub mod report;
pub mod scenarios;

pub use error::HarnessError;
pub use report::{Outcome, RunSummary, ScenarioReport};
pub use scenarios::{SCENARIOS, Scenario};
