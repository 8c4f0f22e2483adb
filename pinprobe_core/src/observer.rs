use crate::candidate::{Candidate, Score};
use crate::oracle::OracleResult;
use crate::selector::Selection;

/// A `ProgressObserver` watches batches as they are executed and decided.
///
/// Observers run on the thread that drives the batch, never on pool workers,
/// so they need not be `Sync`. Errors returned by an observer are logged and
/// otherwise ignored; they never abort a batch.
pub trait ProgressObserver {
    /// Static name used when logging observer failures.
    fn name(&self) -> &'static str;

    /// Called once before any candidate of a batch is dispatched.
    fn on_batch_start(&mut self, candidates: &[Candidate]) -> Result<(), anyhow::Error>;

    /// Called as each result arrives.
    ///
    /// Sequential batches report in candidate order. Parallel batches report
    /// in completion order; `index` is always the candidate's position in
    /// the batch.
    fn on_result(&mut self, index: usize, result: &OracleResult) -> Result<(), anyhow::Error>;

    /// Called after the Selector has decided on a completed batch.
    fn on_selection(
        &mut self,
        results: &[OracleResult],
        selection: Selection,
    ) -> Result<(), anyhow::Error>;
}

/// Runs one observer callback, logging instead of propagating its failure.
pub(crate) fn observe<F>(observer: &mut dyn ProgressObserver, call: F)
where
    F: FnOnce(&mut dyn ProgressObserver) -> Result<(), anyhow::Error>,
{
    if let Err(e) = call(&mut *observer) {
        tracing::warn!(observer = observer.name(), error = %e, "observer failed");
    }
}

/// Observer that does nothing.
#[derive(Default, Debug, Clone, Copy)]
pub struct NoOpObserver;

impl ProgressObserver for NoOpObserver {
    fn name(&self) -> &'static str {
        "NoOpObserver"
    }

    fn on_batch_start(&mut self, _candidates: &[Candidate]) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn on_result(&mut self, _index: usize, _result: &OracleResult) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn on_selection(
        &mut self,
        _results: &[OracleResult],
        _selection: Selection,
    ) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

/// One decided batch as seen by a [`RecordingObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedBatch {
    pub candidates: Vec<Candidate>,
    pub arrivals: Vec<usize>,
    pub scores: Vec<Score>,
    pub selection: Option<Selection>,
}

/// Keeps every batch it sees in memory.
#[derive(Default, Debug, Clone)]
pub struct RecordingObserver {
    pub batches: Vec<RecordedBatch>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn last(&self) -> Option<&RecordedBatch> {
        self.batches.last()
    }
}

impl ProgressObserver for RecordingObserver {
    fn name(&self) -> &'static str {
        "RecordingObserver"
    }

    fn on_batch_start(&mut self, candidates: &[Candidate]) -> Result<(), anyhow::Error> {
        self.batches.push(RecordedBatch {
            candidates: candidates.to_vec(),
            arrivals: Vec::new(),
            scores: Vec::new(),
            selection: None,
        });
        Ok(())
    }

    fn on_result(&mut self, index: usize, _result: &OracleResult) -> Result<(), anyhow::Error> {
        let batch = self
            .batches
            .last_mut()
            .ok_or_else(|| anyhow::anyhow!("result reported before batch start"))?;
        batch.arrivals.push(index);
        Ok(())
    }

    fn on_selection(
        &mut self,
        results: &[OracleResult],
        selection: Selection,
    ) -> Result<(), anyhow::Error> {
        let batch = self
            .batches
            .last_mut()
            .ok_or_else(|| anyhow::anyhow!("selection reported before batch start"))?;
        batch.scores = results.iter().map(|r| r.score).collect();
        batch.selection = Some(selection);
        Ok(())
    }
}
