use crate::driver::{RunOutcome, RunReport};
use crate::length::{LengthOutcome, LengthReport};
use crate::selector::SelectMode;
use serde::Serialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Report I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Report serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPosition {
    pub position: usize,
    pub ch: char,
}

/// Persisted summary of a resolution run. `pattern` can be passed back as
/// the known pattern to resume.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ResolveSummary {
    pub outcome: RunOutcome,
    pub secret: Option<String>,
    pub pattern: String,
    pub padding: char,
    pub length: usize,
    pub resolved: Vec<ResolvedPosition>,
    pub mode: SelectMode,
    pub rounds: usize,
    pub oracle_calls: usize,
}

impl ResolveSummary {
    pub fn new(report: &RunReport, padding: char, mode: SelectMode) -> Self {
        Self {
            outcome: report.outcome,
            secret: report.secret(),
            pattern: report.known.render(padding),
            padding,
            length: report.known.length(),
            resolved: report
                .known
                .iter()
                .map(|(position, ch)| ResolvedPosition { position, ch })
                .collect(),
            mode,
            rounds: report.rounds,
            oracle_calls: report.oracle_calls,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LengthSummary {
    pub outcome: LengthOutcome,
    pub min_length: usize,
    pub max_length: usize,
    pub mode: SelectMode,
    pub trials: usize,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ReportDocument {
    Resolve(ResolveSummary),
    Length(LengthSummary),
}

impl ReportDocument {
    pub fn length(
        report: &LengthReport,
        min_length: usize,
        max_length: usize,
        mode: SelectMode,
    ) -> Self {
        ReportDocument::Length(LengthSummary {
            outcome: report.outcome,
            min_length,
            max_length,
            mode,
            trials: report.trials,
        })
    }

    pub fn to_json(&self) -> Result<String, ReportError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_json(&self, path: &Path) -> Result<(), ReportError> {
        let mut text = self.to_json()?;
        text.push('\n');
        fs::write(path, text)?;
        tracing::debug!(path = %path.display(), "report written");
        Ok(())
    }
}
