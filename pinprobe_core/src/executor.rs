use crate::cancel::CancellationToken;
use crate::candidate::Candidate;
use crate::observer::{ProgressObserver, observe};
use crate::oracle::{Oracle, OracleError, OracleResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchError {
    /// An oracle invocation failed for good; the whole batch is discarded.
    #[error("Oracle failed on candidate #{index} '{candidate}': {source}")]
    Oracle {
        index: usize,
        candidate: Candidate,
        #[source]
        source: OracleError,
    },

    /// Cancellation was requested while the batch was running.
    #[error("Batch cancelled")]
    Cancelled,
}

/// How a batch is dispatched to the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// One candidate at a time, in order.
    Sequential,
    /// Bounded worker pool. `workers == 0` means host parallelism.
    Parallel { workers: usize },
}

impl ExecutionMode {
    pub fn parallel() -> Self {
        ExecutionMode::Parallel { workers: 0 }
    }

    fn pool_size(workers: usize, batch_len: usize) -> usize {
        let workers = if workers == 0 {
            thread::available_parallelism().map_or(1, |n| n.get())
        } else {
            workers
        };
        workers.min(batch_len).max(1)
    }
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::parallel()
    }
}

/// Runs the oracle over ordered batches of candidates.
pub struct BatchExecutor<O: Oracle> {
    oracle: O,
    mode: ExecutionMode,
    cancel: CancellationToken,
}

impl<O: Oracle> BatchExecutor<O> {
    pub fn new(oracle: O, mode: ExecutionMode, cancel: CancellationToken) -> Self {
        Self {
            oracle,
            mode,
            cancel,
        }
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Scores every candidate. `result[i]` always belongs to `candidates[i]`.
    ///
    /// Any oracle failure aborts the batch; there are no partial results.
    pub fn run_batch(
        &self,
        candidates: &[Candidate],
        observer: &mut dyn ProgressObserver,
    ) -> Result<Vec<OracleResult>, BatchError> {
        observe(observer, |o| o.on_batch_start(candidates));
        if self.cancel.is_cancelled() {
            return Err(BatchError::Cancelled);
        }

        let results = match self.mode {
            ExecutionMode::Sequential => self.run_sequential(candidates, observer),
            ExecutionMode::Parallel { workers } => {
                let pool_size = ExecutionMode::pool_size(workers, candidates.len());
                self.run_parallel(candidates, pool_size, observer)
            }
        };

        if self.cancel.is_cancelled() {
            tracing::warn!(
                batch_size = candidates.len(),
                "batch cancelled after in-flight invocations settled"
            );
            return Err(BatchError::Cancelled);
        }
        results
    }

    fn run_sequential(
        &self,
        candidates: &[Candidate],
        observer: &mut dyn ProgressObserver,
    ) -> Result<Vec<OracleResult>, BatchError> {
        let mut results = Vec::with_capacity(candidates.len());
        for (index, candidate) in candidates.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(BatchError::Cancelled);
            }
            let result = self
                .oracle
                .invoke(candidate, &self.cancel)
                .map_err(|source| self.batch_error(index, candidate, source))?;
            observe(observer, |o| o.on_result(index, &result));
            results.push(result);
        }
        Ok(results)
    }

    fn run_parallel(
        &self,
        candidates: &[Candidate],
        pool_size: usize,
        observer: &mut dyn ProgressObserver,
    ) -> Result<Vec<OracleResult>, BatchError> {
        tracing::debug!(
            batch_size = candidates.len(),
            pool_size,
            "dispatching parallel batch"
        );

        let next_index = AtomicUsize::new(0);
        let failed = AtomicBool::new(false);
        let mut slots: Vec<Option<OracleResult>> = vec![None; candidates.len()];
        let mut first_error: Option<(usize, OracleError)> = None;

        thread::scope(|scope| {
            let (tx, rx) = mpsc::channel::<(usize, Result<OracleResult, OracleError>)>();

            for worker_id in 0..pool_size {
                let tx = tx.clone();
                let next_index = &next_index;
                let failed = &failed;
                let oracle = &self.oracle;
                let cancel = &self.cancel;
                scope.spawn(move || {
                    // Cancellation and failures are only checked between
                    // invocations; a started invocation always runs to the end.
                    while !cancel.is_cancelled() && !failed.load(Ordering::SeqCst) {
                        let index = next_index.fetch_add(1, Ordering::SeqCst);
                        let Some(candidate) = candidates.get(index) else {
                            break;
                        };
                        let outcome = oracle.invoke(candidate, cancel);
                        if outcome.is_err() {
                            failed.store(true, Ordering::SeqCst);
                        }
                        if tx.send((index, outcome)).is_err() {
                            break;
                        }
                    }
                    tracing::trace!(worker_id, "worker drained");
                });
            }
            drop(tx);

            for (index, outcome) in rx {
                match outcome {
                    Ok(result) => {
                        observe(observer, |o| o.on_result(index, &result));
                        slots[index] = Some(result);
                    }
                    Err(err) => {
                        if first_error.as_ref().is_none_or(|(seen, _)| index < *seen) {
                            first_error = Some((index, err));
                        }
                    }
                }
            }
        });

        if let Some((index, source)) = first_error {
            return Err(self.batch_error(index, &candidates[index], source));
        }
        // Without a failure, workers only leave slots empty when they stop
        // on cancellation.
        slots
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or(BatchError::Cancelled)
    }

    fn batch_error(&self, index: usize, candidate: &Candidate, source: OracleError) -> BatchError {
        if self.cancel.is_cancelled() || matches!(source, OracleError::Interrupted) {
            BatchError::Cancelled
        } else {
            BatchError::Oracle {
                index,
                candidate: candidate.clone(),
                source,
            }
        }
    }
}
