use crate::candidate::{Candidate, Score};
use crate::executor::{BatchError, BatchExecutor};
use crate::observer::{ProgressObserver, observe};
use crate::oracle::Oracle;
use crate::selector::{SelectMode, Selection, select};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KnowledgeError {
    #[error("Known pattern has {pattern_len} characters but the secret length is {length}")]
    PatternTooLong { pattern_len: usize, length: usize },
    #[error("Position {position} is outside a secret of length {length}")]
    PositionOutOfRange { position: usize, length: usize },
    #[error("Position {position} is already resolved to {existing:?}")]
    PositionAlreadyKnown { position: usize, existing: char },
    #[error("Charset is empty")]
    EmptyCharset,
    /// A resolved padding character could not be told apart from an
    /// unknown position when the map is rendered.
    #[error("Charset contains the padding character {0:?}")]
    PaddingInCharset(char),
}

#[derive(Error, Debug)]
pub enum DriverError {
    #[error(
        "Batch failed with {}/{} positions resolved: {source}",
        .partial.len(),
        .partial.length()
    )]
    Batch {
        partial: KnownMap,
        #[source]
        source: BatchError,
    },
    #[error(transparent)]
    Knowledge(#[from] KnowledgeError),
}

impl DriverError {
    /// Knowledge accumulated before the failure, if the run got that far.
    pub fn partial(&self) -> Option<&KnownMap> {
        match self {
            DriverError::Batch { partial, .. } => Some(partial),
            DriverError::Knowledge(_) => None,
        }
    }
}

/// Resolved positions of a secret of fixed length.
///
/// Positions are always below `length`, and a resolved position never changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownMap {
    length: usize,
    known: BTreeMap<usize, char>,
}

impl KnownMap {
    pub fn new(length: usize) -> Self {
        Self {
            length,
            known: BTreeMap::new(),
        }
    }

    /// Seeds from a pattern such as `fl_g`, where `padding` marks unknown
    /// positions. A pattern shorter than `length` leaves the tail unknown.
    pub fn from_pattern(
        pattern: &str,
        padding: char,
        length: usize,
    ) -> Result<Self, KnowledgeError> {
        let pattern_len = pattern.chars().count();
        if pattern_len > length {
            return Err(KnowledgeError::PatternTooLong {
                pattern_len,
                length,
            });
        }
        let mut map = Self::new(length);
        for (position, ch) in pattern.chars().enumerate().filter(|&(_, ch)| ch != padding) {
            map.commit(position, ch)?;
        }
        Ok(map)
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Number of resolved positions.
    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.known.len() == self.length
    }

    pub fn get(&self, position: usize) -> Option<char> {
        self.known.get(&position).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, char)> + '_ {
        self.known.iter().map(|(&p, &c)| (p, c))
    }

    pub fn commit(&mut self, position: usize, ch: char) -> Result<(), KnowledgeError> {
        if position >= self.length {
            return Err(KnowledgeError::PositionOutOfRange {
                position,
                length: self.length,
            });
        }
        if let Some(&existing) = self.known.get(&position) {
            return Err(KnowledgeError::PositionAlreadyKnown { position, existing });
        }
        self.known.insert(position, ch);
        Ok(())
    }

    pub fn unresolved(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.length).filter(|p| !self.known.contains_key(p))
    }

    /// Full-length characters with `fill` at every unresolved position.
    pub fn template(&self, fill: char) -> Vec<char> {
        (0..self.length)
            .map(|p| self.get(p).unwrap_or(fill))
            .collect()
    }

    /// Same as [`KnownMap::template`], as a string. Feeding the result back
    /// through [`KnownMap::from_pattern`] restores this map as long as no
    /// resolved character equals `padding`.
    pub fn render(&self, padding: char) -> String {
        self.template(padding).into_iter().collect()
    }

    /// Resolved characters from position 0 up to the first gap.
    pub fn known_prefix(&self) -> String {
        (0..self.length).map_while(|p| self.get(p)).collect()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown order '{0}', expected forward, backward, blind or length-detect")]
pub struct UnknownOrder(pub String);

/// Search order selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    Forward,
    Backward,
    Blind,
    LengthDetect,
}

impl Order {
    /// The position strategy, or `None` for length detection.
    pub fn strategy(&self) -> Option<Strategy> {
        match self {
            Order::Forward => Some(Strategy::Forward),
            Order::Backward => Some(Strategy::Backward),
            Order::Blind => Some(Strategy::Blind),
            Order::LengthDetect => None,
        }
    }
}

impl FromStr for Order {
    type Err = UnknownOrder;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "forward" => Ok(Order::Forward),
            "backward" => Ok(Order::Backward),
            "blind" => Ok(Order::Blind),
            "length-detect" => Ok(Order::LengthDetect),
            other => Err(UnknownOrder(other.to_string())),
        }
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Order::Forward => "forward",
            Order::Backward => "backward",
            Order::Blind => "blind",
            Order::LengthDetect => "length-detect",
        })
    }
}

/// Which secret position is probed next and how its batch is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Lowest unresolved position first.
    Forward,
    /// Highest unresolved position first.
    Backward,
    /// Find a character first, then the position it belongs to.
    Blind,
}

impl Strategy {
    /// One candidate per charset character, in charset order.
    pub fn generate_probe_batch(
        &self,
        known: &KnownMap,
        charset: &[char],
        padding: char,
    ) -> Vec<Candidate> {
        match self {
            Strategy::Forward | Strategy::Backward => {
                let Some(target) = self.position_for(known) else {
                    return Vec::new();
                };
                let mut template = known.template(padding);
                charset
                    .iter()
                    .map(|&ch| {
                        template[target] = ch;
                        Candidate::from_chars(&template)
                    })
                    .collect()
            }
            Strategy::Blind => charset
                .iter()
                .map(|&ch| Candidate::from_chars(&known.template(ch)))
                .collect(),
        }
    }

    /// Position the next committed character goes to. Blind search cannot
    /// tell without a locating round and returns `None`.
    pub fn position_for(&self, known: &KnownMap) -> Option<usize> {
        match self {
            Strategy::Forward => known.unresolved().next(),
            Strategy::Backward => known.unresolved().last(),
            Strategy::Blind => None,
        }
    }

    /// Locating round of blind search: `ch` at one unresolved position, padding
    /// everywhere else unresolved. Returns the batch and the position probed
    /// by each entry.
    pub fn locate_batch(known: &KnownMap, ch: char, padding: char) -> (Vec<Candidate>, Vec<usize>) {
        let template = known.template(padding);
        known
            .unresolved()
            .map(|position| {
                let mut chars = template.clone();
                chars[position] = ch;
                (Candidate::from_chars(&chars), position)
            })
            .unzip()
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RunOutcome {
    /// Every position resolved.
    Resolved,
    /// A round's scores did not single out a candidate.
    Inconclusive,
    /// Cancellation arrived during a batch.
    Cancelled,
}

/// What a resolution run ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub known: KnownMap,
    /// Completed Selector rounds, including blind locating rounds.
    pub rounds: usize,
    pub oracle_calls: usize,
}

impl RunReport {
    pub fn secret(&self) -> Option<String> {
        self.known
            .is_complete()
            .then(|| self.known.render(char::REPLACEMENT_CHARACTER))
    }
}

enum Round {
    Winner(usize),
    Inconclusive,
    Cancelled,
}

/// Drives the position-by-position search over a [`BatchExecutor`].
pub struct Resolver<'a, O: Oracle> {
    executor: &'a BatchExecutor<O>,
    strategy: Strategy,
    charset: Vec<char>,
    padding: char,
    mode: SelectMode,
}

impl<'a, O: Oracle> Resolver<'a, O> {
    pub fn new(
        executor: &'a BatchExecutor<O>,
        strategy: Strategy,
        charset: &str,
        padding: char,
        mode: SelectMode,
    ) -> Result<Self, KnowledgeError> {
        let charset: Vec<char> = charset.chars().collect();
        if charset.is_empty() {
            return Err(KnowledgeError::EmptyCharset);
        }
        if charset.contains(&padding) {
            return Err(KnowledgeError::PaddingInCharset(padding));
        }
        Ok(Self {
            executor,
            strategy,
            charset,
            padding,
            mode,
        })
    }

    /// Resolves positions until `known` is complete, a round is inconclusive
    /// or the run is cancelled. Knowledge only changes between batches.
    pub fn run(
        &self,
        mut known: KnownMap,
        observer: &mut dyn ProgressObserver,
    ) -> Result<RunReport, DriverError> {
        let mut report = RunReport {
            outcome: RunOutcome::Resolved,
            known: KnownMap::new(known.length()),
            rounds: 0,
            oracle_calls: 0,
        };
        tracing::info!(
            strategy = ?self.strategy,
            mode = %self.mode,
            length = known.length(),
            resolved = known.len(),
            charset_size = self.charset.len(),
            "starting resolution"
        );

        while !known.is_complete() {
            let batch = self
                .strategy
                .generate_probe_batch(&known, &self.charset, self.padding);
            let ch = match self.round(&batch, observer, &mut report) {
                Ok(Round::Winner(index)) => self.charset[index],
                Ok(Round::Inconclusive) => {
                    return Ok(self.halt(report, known, RunOutcome::Inconclusive));
                }
                Ok(Round::Cancelled) => {
                    return Ok(self.halt(report, known, RunOutcome::Cancelled));
                }
                Err(source) => {
                    return Err(DriverError::Batch {
                        partial: known,
                        source,
                    });
                }
            };

            let position = match self.strategy.position_for(&known) {
                Some(position) => position,
                None => match self.locate(&known, ch, observer, &mut report) {
                    Ok(Round::Winner(position)) => position,
                    Ok(Round::Inconclusive) => {
                        return Ok(self.halt(report, known, RunOutcome::Inconclusive));
                    }
                    Ok(Round::Cancelled) => {
                        return Ok(self.halt(report, known, RunOutcome::Cancelled));
                    }
                    Err(source) => {
                        return Err(DriverError::Batch {
                            partial: known,
                            source,
                        });
                    }
                },
            };

            known.commit(position, ch)?;
            tracing::info!(
                position,
                ch = %ch,
                progress = %known.render(self.padding),
                "resolved position"
            );
        }

        report.known = known;
        Ok(report)
    }

    /// Blind search: find which unresolved position `ch` belongs to. Returns
    /// the position itself in `Round::Winner`.
    fn locate(
        &self,
        known: &KnownMap,
        ch: char,
        observer: &mut dyn ProgressObserver,
        report: &mut RunReport,
    ) -> Result<Round, BatchError> {
        let (batch, positions) = Strategy::locate_batch(known, ch, self.padding);
        if let [only] = positions.as_slice() {
            return Ok(Round::Winner(*only));
        }
        Ok(match self.round(&batch, observer, report)? {
            Round::Winner(index) => Round::Winner(positions[index]),
            other => other,
        })
    }

    fn round(
        &self,
        batch: &[Candidate],
        observer: &mut dyn ProgressObserver,
        report: &mut RunReport,
    ) -> Result<Round, BatchError> {
        let results = match self.executor.run_batch(batch, observer) {
            Ok(results) => results,
            Err(BatchError::Cancelled) => return Ok(Round::Cancelled),
            Err(e) => return Err(e),
        };
        report.rounds += 1;
        report.oracle_calls += results.len();

        let scores: Vec<Score> = results.iter().map(|r| r.score).collect();
        let selection = select(&scores, self.mode);
        observe(observer, |o| o.on_selection(&results, selection));
        tracing::debug!(round = report.rounds, ?scores, ?selection, "round decided");

        Ok(match selection {
            Selection::Winner(index) => Round::Winner(index),
            Selection::Inconclusive => Round::Inconclusive,
        })
    }

    fn halt(&self, mut report: RunReport, known: KnownMap, outcome: RunOutcome) -> RunReport {
        tracing::warn!(
            ?outcome,
            resolved = known.len(),
            length = known.length(),
            partial = %known.render(self.padding),
            "resolution stopped early"
        );
        report.outcome = outcome;
        report.known = known;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::executor::ExecutionMode;
    use crate::observer::{NoOpObserver, RecordingObserver};
    use crate::oracle::{FnOracle, OracleError};
    use rand::Rng;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn prefix_score(candidate: &Candidate, secret: &str) -> Score {
        candidate
            .as_str()
            .chars()
            .zip(secret.chars())
            .take_while(|(a, b)| a == b)
            .count() as Score
    }

    fn suffix_score(candidate: &Candidate, secret: &str) -> Score {
        candidate
            .as_str()
            .chars()
            .rev()
            .zip(secret.chars().rev())
            .take_while(|(a, b)| a == b)
            .count() as Score
    }

    fn executor<F>(mode: ExecutionMode, score: F) -> BatchExecutor<FnOracle<F>>
    where
        F: Fn(&Candidate) -> Result<Score, OracleError> + Send + Sync,
    {
        BatchExecutor::new(FnOracle::new(score), mode, CancellationToken::new())
    }

    fn strings(batch: &[Candidate]) -> Vec<&str> {
        batch.iter().map(Candidate::as_str).collect()
    }

    #[test]
    fn pattern_seeds_known_positions() {
        let known = KnownMap::from_pattern("fl_g", '_', 4).unwrap();
        assert_eq!(known.len(), 3);
        assert_eq!(known.get(0), Some('f'));
        assert_eq!(known.get(1), Some('l'));
        assert_eq!(known.get(2), None);
        assert_eq!(known.get(3), Some('g'));
        assert_eq!(known.unresolved().collect::<Vec<_>>(), vec![2]);
        assert_eq!(known.render('_'), "fl_g");
        assert_eq!(known.known_prefix(), "fl");
    }

    #[test]
    fn short_pattern_leaves_tail_unknown() {
        let known = KnownMap::from_pattern("ab", '\\', 5).unwrap();
        assert_eq!(known.unresolved().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(known.render('\\'), "ab\\\\\\");
    }

    #[test]
    fn long_pattern_is_rejected() {
        assert_eq!(
            KnownMap::from_pattern("flag!", '_', 4),
            Err(KnowledgeError::PatternTooLong {
                pattern_len: 5,
                length: 4
            })
        );
    }

    #[test]
    fn committed_positions_never_change() {
        let mut known = KnownMap::new(3);
        known.commit(1, 'x').unwrap();
        assert_eq!(
            known.commit(1, 'y'),
            Err(KnowledgeError::PositionAlreadyKnown {
                position: 1,
                existing: 'x'
            })
        );
        assert!(matches!(
            known.commit(3, 'z'),
            Err(KnowledgeError::PositionOutOfRange { .. })
        ));
        assert_eq!(known.get(1), Some('x'));
    }

    #[test]
    fn forward_batch_targets_lowest_unresolved() {
        let charset = ['A', 'B'];
        let known = KnownMap::new(4);
        let batch = Strategy::Forward.generate_probe_batch(&known, &charset, '_');
        assert_eq!(strings(&batch), vec!["A___", "B___"]);
        assert_eq!(Strategy::Forward.position_for(&known), Some(0));

        let gapped = KnownMap::from_pattern("fl_g", '_', 4).unwrap();
        let batch = Strategy::Forward.generate_probe_batch(&gapped, &charset, '_');
        assert_eq!(strings(&batch), vec!["flAg", "flBg"]);
        assert_eq!(Strategy::Forward.position_for(&gapped), Some(2));
    }

    #[test]
    fn backward_batch_targets_highest_unresolved() {
        let charset = ['A', 'B'];
        let known = KnownMap::from_pattern("___x", '_', 4).unwrap();
        let batch = Strategy::Backward.generate_probe_batch(&known, &charset, '_');
        assert_eq!(strings(&batch), vec!["__Ax", "__Bx"]);
        assert_eq!(Strategy::Backward.position_for(&known), Some(2));
    }

    #[test]
    fn blind_batches_fill_all_unresolved_then_locate() {
        let known = KnownMap::from_pattern("_x_", '_', 3).unwrap();
        let batch = Strategy::Blind.generate_probe_batch(&known, &['A', 'B'], '_');
        assert_eq!(strings(&batch), vec!["AxA", "BxB"]);
        assert_eq!(Strategy::Blind.position_for(&known), None);

        let (locate, positions) = Strategy::locate_batch(&known, 'A', '_');
        assert_eq!(strings(&locate), vec!["Ax_", "_xA"]);
        assert_eq!(positions, vec![0, 2]);
    }

    #[test]
    fn forward_resolves_in_one_round_per_position() {
        let executor = executor(ExecutionMode::Sequential, |c: &Candidate| {
            Ok(prefix_score(c, "BAAB"))
        });
        let resolver =
            Resolver::new(&executor, Strategy::Forward, "AB", '_', SelectMode::Max).unwrap();
        let mut observer = RecordingObserver::new();
        let report = resolver.run(KnownMap::new(4), &mut observer).unwrap();

        assert_eq!(report.outcome, RunOutcome::Resolved);
        assert_eq!(report.secret().as_deref(), Some("BAAB"));
        assert_eq!(report.rounds, 4);
        assert_eq!(report.oracle_calls, 8);
        let first = &observer.batches[0];
        assert_eq!(strings(&first.candidates), vec!["A___", "B___"]);
        assert_eq!(first.scores, vec![0, 1]);
        assert_eq!(first.selection, Some(Selection::Winner(1)));
    }

    #[test]
    fn backward_resolves_from_the_end() {
        let executor = executor(ExecutionMode::parallel(), |c: &Candidate| {
            Ok(suffix_score(c, "c0de"))
        });
        let resolver = Resolver::new(
            &executor,
            Strategy::Backward,
            "0123456789abcdef",
            '\\',
            SelectMode::Max,
        )
        .unwrap();
        let mut observer = RecordingObserver::new();
        let report = resolver.run(KnownMap::new(4), &mut observer).unwrap();
        assert_eq!(report.secret().as_deref(), Some("c0de"));
        assert_eq!(report.rounds, 4);
        assert_eq!(observer.batches[0].candidates[0].as_str(), "\\\\\\0");
    }

    #[test]
    fn min_mode_follows_lowest_score() {
        let executor = executor(ExecutionMode::Sequential, |c: &Candidate| {
            Ok(100 - prefix_score(c, "xyz"))
        });
        let resolver =
            Resolver::new(&executor, Strategy::Forward, "xyz", '_', SelectMode::Min).unwrap();
        let report = resolver.run(KnownMap::new(3), &mut NoOpObserver).unwrap();
        assert_eq!(report.secret().as_deref(), Some("xyz"));
    }

    #[test]
    fn unique_outlier_mode_resolves_two_valued_oracle() {
        // the correct character flips the count to a rare alternate value
        let executor = executor(ExecutionMode::parallel(), |c: &Candidate| {
            let filled = c.as_str().trim_end_matches('_').chars().count() as Score;
            let hit = prefix_score(c, "ok!") == filled;
            Ok(if hit { 3 } else { 7 })
        });
        let resolver = Resolver::new(
            &executor,
            Strategy::Forward,
            "!abcdefghijklmnopqrstuvwxyz",
            '_',
            SelectMode::UniqueOutlier,
        )
        .unwrap();
        let report = resolver.run(KnownMap::new(3), &mut NoOpObserver).unwrap();
        assert_eq!(report.outcome, RunOutcome::Resolved);
        assert_eq!(report.secret().as_deref(), Some("ok!"));
    }

    #[test]
    fn seeded_pattern_only_probes_missing_positions() {
        let executor = executor(ExecutionMode::Sequential, |c: &Candidate| {
            Ok(prefix_score(c, "flag"))
        });
        let resolver = Resolver::new(
            &executor,
            Strategy::Forward,
            "abcdefghijklmnopqrstuvwxyz",
            '_',
            SelectMode::Max,
        )
        .unwrap();
        let known = KnownMap::from_pattern("fl_g", '_', 4).unwrap();
        let report = resolver.run(known, &mut NoOpObserver).unwrap();
        assert_eq!(report.secret().as_deref(), Some("flag"));
        assert_eq!(report.rounds, 1);
    }

    #[test]
    fn blind_search_locates_positions_out_of_order() {
        // Target checks positions in a fixed scrambled order and stops at the
        // first mismatch; the count is the number of checks passed.
        let secret: Vec<char> = "BAAB".chars().collect();
        let order = [2usize, 0, 3, 1];
        let executor = executor(ExecutionMode::Sequential, move |c: &Candidate| {
            let input: Vec<char> = c.as_str().chars().collect();
            Ok(order.iter().take_while(|&&p| input[p] == secret[p]).count() as Score)
        });
        let resolver =
            Resolver::new(&executor, Strategy::Blind, "AB", '_', SelectMode::Max).unwrap();
        let report = resolver.run(KnownMap::new(4), &mut NoOpObserver).unwrap();

        assert_eq!(report.outcome, RunOutcome::Resolved);
        assert_eq!(report.secret().as_deref(), Some("BAAB"));
        // four character rounds plus three locating rounds; the last
        // position is forced
        assert_eq!(report.rounds, 7);
    }

    #[test]
    fn inconclusive_round_stops_with_partial_knowledge() {
        let executor = executor(ExecutionMode::Sequential, |c: &Candidate| {
            Ok(prefix_score(c, "BAAB").min(2))
        });
        let resolver =
            Resolver::new(&executor, Strategy::Forward, "AB", '_', SelectMode::Max).unwrap();
        let report = resolver.run(KnownMap::new(4), &mut NoOpObserver).unwrap();
        assert_eq!(report.outcome, RunOutcome::Inconclusive);
        assert_eq!(report.known.render('_'), "BA__");
        assert_eq!(report.secret(), None);
        assert_eq!(report.rounds, 3);
    }

    #[test]
    fn flat_oracle_resolves_nothing() {
        let executor = executor(ExecutionMode::parallel(), |_c: &Candidate| Ok(5));
        let resolver =
            Resolver::new(&executor, Strategy::Blind, "abc", '_', SelectMode::Max).unwrap();
        let report = resolver.run(KnownMap::new(6), &mut NoOpObserver).unwrap();
        assert_eq!(report.outcome, RunOutcome::Inconclusive);
        assert!(report.known.is_empty());
    }

    #[test]
    fn cancellation_keeps_knowledge_from_before_the_batch() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let oracle = {
            let (cancel, calls) = (cancel.clone(), calls.clone());
            FnOracle::new(move |c: &Candidate| {
                // interrupt lands during the third batch
                if calls.fetch_add(1, Ordering::SeqCst) == 5 {
                    cancel.cancel();
                }
                Ok(prefix_score(c, "BAAB"))
            })
        };
        let executor = BatchExecutor::new(oracle, ExecutionMode::Sequential, cancel);
        let resolver =
            Resolver::new(&executor, Strategy::Forward, "AB", '_', SelectMode::Max).unwrap();
        let report = resolver.run(KnownMap::new(4), &mut NoOpObserver).unwrap();

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.known.render('_'), "BA__");
        assert_eq!(report.rounds, 2);
    }

    #[test]
    fn cancellation_during_parallel_batch_keeps_committed_positions() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let oracle = {
            let (cancel, calls) = (cancel.clone(), calls.clone());
            FnOracle::new(move |c: &Candidate| {
                // third call of the second batch
                if calls.fetch_add(1, Ordering::SeqCst) == 12 {
                    cancel.cancel();
                }
                Ok(prefix_score(c, "JIHG"))
            })
        };
        let mode = ExecutionMode::Parallel { workers: 4 };
        let executor = BatchExecutor::new(oracle, mode, cancel);
        let charset = "ABCDEFGHIJ";
        let resolver =
            Resolver::new(&executor, Strategy::Forward, charset, '_', SelectMode::Max).unwrap();
        let report = resolver.run(KnownMap::new(4), &mut NoOpObserver).unwrap();

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.known.render('_'), "J___");
        assert_eq!(report.rounds, 1);
        assert_eq!(report.oracle_calls, 10);
        assert!(calls.load(Ordering::SeqCst) < 20);
    }

    #[test]
    fn oracle_failure_surfaces_partial_map() {
        let executor = executor(ExecutionMode::Sequential, |c: &Candidate| {
            if c.as_str().starts_with("BA") {
                Err(OracleError::Launch("target vanished".to_string()))
            } else {
                Ok(prefix_score(c, "BAAB"))
            }
        });
        let resolver =
            Resolver::new(&executor, Strategy::Forward, "AB", '_', SelectMode::Max).unwrap();
        match resolver.run(KnownMap::new(4), &mut NoOpObserver) {
            Err(err @ DriverError::Batch { .. }) => {
                let partial = err.partial().unwrap();
                assert_eq!(partial.render('_'), "B___");
                assert!(err.to_string().contains("1/4 positions resolved"));
            }
            other => panic!("Expected DriverError::Batch, got {other:?}"),
        }
    }

    #[test]
    fn empty_charset_is_rejected() {
        let executor = executor(ExecutionMode::Sequential, |_c: &Candidate| Ok(0));
        assert!(matches!(
            Resolver::new(&executor, Strategy::Forward, "", '_', SelectMode::Max),
            Err(KnowledgeError::EmptyCharset)
        ));
    }

    #[test]
    fn padding_in_charset_is_rejected() {
        let executor = executor(ExecutionMode::Sequential, |_c: &Candidate| Ok(0));
        assert!(matches!(
            Resolver::new(&executor, Strategy::Forward, "ab\\c", '\\', SelectMode::Max),
            Err(KnowledgeError::PaddingInCharset('\\'))
        ));
        assert!(matches!(
            Resolver::new(&executor, Strategy::Blind, "ab_", '_', SelectMode::Max),
            Err(KnowledgeError::PaddingInCharset('_'))
        ));
    }

    #[test]
    fn inconclusive_pattern_resumes_with_the_same_knowledge() {
        let executor = executor(ExecutionMode::Sequential, |c: &Candidate| {
            Ok(prefix_score(c, "a/bc").min(2))
        });
        let resolver =
            Resolver::new(&executor, Strategy::Forward, "abc/", '\\', SelectMode::Max).unwrap();
        let report = resolver.run(KnownMap::new(4), &mut NoOpObserver).unwrap();
        assert_eq!(report.outcome, RunOutcome::Inconclusive);

        let pattern = report.known.render('\\');
        assert_eq!(pattern, "a/\\\\");
        let resumed = KnownMap::from_pattern(&pattern, '\\', 4).unwrap();
        assert_eq!(resumed, report.known);
        assert_eq!(resumed.len(), 2);
    }

    #[test]
    fn zero_length_secret_is_trivially_resolved() {
        let executor = executor(ExecutionMode::Sequential, |_c: &Candidate| Ok(0));
        let resolver =
            Resolver::new(&executor, Strategy::Forward, "a", '_', SelectMode::Max).unwrap();
        let report = resolver.run(KnownMap::new(0), &mut NoOpObserver).unwrap();
        assert_eq!(report.outcome, RunOutcome::Resolved);
        assert_eq!(report.rounds, 0);
        assert_eq!(report.secret().as_deref(), Some(""));
    }

    #[test]
    fn random_secrets_resolve_in_exactly_length_rounds() {
        let charset: Vec<char> = "0123456789abcdef".chars().collect();
        let mut rng = ChaCha8Rng::from_seed([7u8; 32]);
        for _ in 0..5 {
            let length = rng.random_range(1..10);
            let secret: String = (0..length)
                .map(|_| charset[rng.random_range(0..charset.len())])
                .collect();
            let expected = secret.clone();
            let executor = executor(ExecutionMode::parallel(), move |c: &Candidate| {
                Ok(prefix_score(c, &secret))
            });
            let charset_str: String = charset.iter().collect();
            let resolver = Resolver::new(
                &executor,
                Strategy::Forward,
                &charset_str,
                '_',
                SelectMode::Max,
            )
            .unwrap();
            let report = resolver.run(KnownMap::new(length), &mut NoOpObserver).unwrap();
            assert_eq!(report.secret(), Some(expected));
            assert_eq!(report.rounds, length);
        }
    }

    #[test]
    fn order_parses_exact_names_only() {
        assert_eq!("forward".parse::<Order>(), Ok(Order::Forward));
        assert_eq!("length-detect".parse::<Order>(), Ok(Order::LengthDetect));
        assert!("n".parse::<Order>().is_err());
        assert!("rev".parse::<Order>().is_err());
        assert_eq!(Order::Blind.strategy(), Some(Strategy::Blind));
        assert_eq!(Order::LengthDetect.strategy(), None);
    }
}
