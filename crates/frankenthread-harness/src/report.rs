//! Scenario reports and their JSON / JSONL rendering.

use std::io::Write;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::HarnessError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
}

/// Result of running one scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub name: String,
    pub outcome: Outcome,
    pub duration_ms: u64,
    pub details: serde_json::Value,
}

/// Every report from one run plus pass/fail totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub reports: Vec<ScenarioReport>,
}

impl RunSummary {
    #[must_use]
    pub fn from_reports(reports: Vec<ScenarioReport>) -> Self {
        let passed = reports
            .iter()
            .filter(|r| r.outcome == Outcome::Pass)
            .count();
        Self {
            total: reports.len(),
            passed,
            failed: reports.len() - passed,
            reports,
        }
    }

    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    /// One pretty-printed [`RunSummary`] document.
    Json,
    /// One [`ScenarioReport`] per line.
    Jsonl,
}

impl FromStr for ReportFormat {
    type Err = HarnessError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "jsonl" => Ok(Self::Jsonl),
            other => Err(HarnessError::UnknownFormat(other.to_string())),
        }
    }
}

/// Render `summary` to `out` in `format`.
pub fn write_summary<W: Write>(
    summary: &RunSummary,
    format: ReportFormat,
    out: &mut W,
) -> Result<(), HarnessError> {
    match format {
        ReportFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, summary)?;
            writeln!(out)?;
        }
        ReportFormat::Jsonl => {
            for report in &summary.reports {
                serde_json::to_writer(&mut *out, report)?;
                writeln!(out)?;
            }
        }
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(name: &str, outcome: Outcome) -> ScenarioReport {
        ScenarioReport {
            name: name.to_string(),
            outcome,
            duration_ms: 1,
            details: serde_json::json!({}),
        }
    }

    #[test]
    fn summary_counts_outcomes() {
        let summary = RunSummary::from_reports(vec![
            report("a", Outcome::Pass),
            report("b", Outcome::Fail),
            report("c", Outcome::Pass),
        ]);
        assert_eq!((summary.total, summary.passed, summary.failed), (3, 2, 1));
        assert!(!summary.all_passed());
    }

    #[test]
    fn jsonl_writes_one_line_per_scenario() {
        let summary = RunSummary::from_reports(vec![
            report("a", Outcome::Pass),
            report("b", Outcome::Pass),
        ]);
        let mut out = Vec::new();
        write_summary(&summary, ReportFormat::Jsonl, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: ScenarioReport = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.name, "a");
        assert_eq!(first.outcome, Outcome::Pass);
    }

    #[test]
    fn format_names_parse_loosely() {
        assert_eq!(" JSONL ".parse::<ReportFormat>().unwrap(), ReportFormat::Jsonl);
        assert!(matches!(
            "yaml".parse::<ReportFormat>(),
            Err(HarnessError::UnknownFormat(name)) if name == "yaml"
        ));
    }
}
