use crate::candidate::{Candidate, Score};
use crate::executor::{BatchError, BatchExecutor};
use crate::observer::{ProgressObserver, observe};
use crate::oracle::Oracle;
use crate::selector::{SelectMode, Selection, select};
use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_MIN_LENGTH: usize = 4;

#[derive(Error, Debug)]
pub enum LengthError {
    #[error("Invalid length range {min}..={max}")]
    InvalidRange { min: usize, max: usize },
    #[error(transparent)]
    Batch(#[from] BatchError),
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LengthOutcome {
    Detected(usize),
    Inconclusive,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthSearch {
    pub min_length: usize,
    pub max_length: usize,
    pub padding: char,
}

impl LengthSearch {
    /// One all-padding candidate per trial length, shortest first.
    pub fn candidates(&self) -> Result<Vec<Candidate>, LengthError> {
        if self.min_length == 0 || self.min_length > self.max_length {
            return Err(LengthError::InvalidRange {
                min: self.min_length,
                max: self.max_length,
            });
        }
        Ok((self.min_length..=self.max_length)
            .map(|len| Candidate::new(self.padding.to_string().repeat(len)))
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthReport {
    pub outcome: LengthOutcome,
    pub trials: usize,
}

/// Single selection round over padded inputs of every trial length.
pub fn detect_length<O: Oracle>(
    executor: &BatchExecutor<O>,
    search: &LengthSearch,
    mode: SelectMode,
    observer: &mut dyn ProgressObserver,
) -> Result<LengthReport, LengthError> {
    let batch = search.candidates()?;
    tracing::info!(
        min = search.min_length,
        max = search.max_length,
        mode = %mode,
        "searching input length"
    );

    let results = match executor.run_batch(&batch, observer) {
        Ok(results) => results,
        Err(BatchError::Cancelled) => {
            return Ok(LengthReport {
                outcome: LengthOutcome::Cancelled,
                trials: batch.len(),
            });
        }
        Err(e) => return Err(e.into()),
    };

    let scores: Vec<Score> = results.iter().map(|r| r.score).collect();
    let selection = select(&scores, mode);
    observe(observer, |o| o.on_selection(&results, selection));

    let outcome = match selection {
        Selection::Winner(index) => {
            let length = search.min_length + index;
            tracing::info!(length, "expected input length found");
            LengthOutcome::Detected(length)
        }
        Selection::Inconclusive => {
            tracing::warn!(?scores, "length search did not single out a length");
            LengthOutcome::Inconclusive
        }
    };
    Ok(LengthReport {
        outcome,
        trials: batch.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::executor::ExecutionMode;
    use crate::observer::{NoOpObserver, RecordingObserver};
    use crate::oracle::{FnOracle, OracleError};

    fn search(min_length: usize, max_length: usize) -> LengthSearch {
        LengthSearch {
            min_length,
            max_length,
            padding: '_',
        }
    }

    #[test]
    fn trial_range_is_inclusive() {
        let batch = search(2, 4).candidates().unwrap();
        let texts: Vec<&str> = batch.iter().map(Candidate::as_str).collect();
        assert_eq!(texts, vec!["__", "___", "____"]);
    }

    #[test]
    fn invalid_ranges_are_rejected() {
        assert!(matches!(
            search(5, 4).candidates(),
            Err(LengthError::InvalidRange { min: 5, max: 4 })
        ));
        assert!(matches!(
            search(0, 4).candidates(),
            Err(LengthError::InvalidRange { .. })
        ));
    }

    #[test]
    fn detects_length_from_distinct_count() {
        // a length check passes only for the right length, running more branches
        let executor = BatchExecutor::new(
            FnOracle::new(|c: &Candidate| Ok(if c.len() == 7 { 120 } else { 80 })),
            ExecutionMode::parallel(),
            CancellationToken::new(),
        );
        let mut observer = RecordingObserver::new();
        let report =
            detect_length(&executor, &search(4, 40), SelectMode::Max, &mut observer).unwrap();
        assert_eq!(report.outcome, LengthOutcome::Detected(7));
        assert_eq!(report.trials, 37);
        assert_eq!(
            observer.last().unwrap().selection,
            Some(Selection::Winner(3))
        );
    }

    #[test]
    fn upper_bound_is_a_trial_length() {
        let executor = BatchExecutor::new(
            FnOracle::new(|c: &Candidate| Ok(if c.len() == 12 { 1 } else { 9 })),
            ExecutionMode::Sequential,
            CancellationToken::new(),
        );
        let report = detect_length(
            &executor,
            &search(4, 12),
            SelectMode::Min,
            &mut NoOpObserver,
        )
        .unwrap();
        assert_eq!(report.outcome, LengthOutcome::Detected(12));
    }

    #[test]
    fn flat_scores_are_inconclusive() {
        let executor = BatchExecutor::new(
            FnOracle::new(|_c: &Candidate| Ok(3)),
            ExecutionMode::Sequential,
            CancellationToken::new(),
        );
        let report = detect_length(
            &executor,
            &search(4, 8),
            SelectMode::UniqueOutlier,
            &mut NoOpObserver,
        )
        .unwrap();
        assert_eq!(report.outcome, LengthOutcome::Inconclusive);
    }

    #[test]
    fn cancelled_probe_reports_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let executor = BatchExecutor::new(
            FnOracle::new(|_c: &Candidate| Ok(3)),
            ExecutionMode::parallel(),
            cancel,
        );
        let report =
            detect_length(&executor, &search(4, 8), SelectMode::Max, &mut NoOpObserver).unwrap();
        assert_eq!(report.outcome, LengthOutcome::Cancelled);
    }

    #[test]
    fn oracle_failure_is_an_error() {
        let executor = BatchExecutor::new(
            FnOracle::new(|_c: &Candidate| {
                Err(OracleError::Parse {
                    reason: "no count".to_string(),
                    stderr_excerpt: String::new(),
                })
            }),
            ExecutionMode::Sequential,
            CancellationToken::new(),
        );
        assert!(matches!(
            detect_length(&executor, &search(4, 8), SelectMode::Max, &mut NoOpObserver),
            Err(LengthError::Batch(BatchError::Oracle { index: 0, .. }))
        ));
    }
}
