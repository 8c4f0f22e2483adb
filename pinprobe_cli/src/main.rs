use pinprobe_core::cancel::CancellationToken;
use pinprobe_core::candidate::{Candidate, Score};
use pinprobe_core::config::{Arch, CountMode, PinprobeConfig, ProbeConfig};
use pinprobe_core::driver::{KnownMap, Order, Resolver, RunOutcome};
use pinprobe_core::encoding::TextEncoding;
use pinprobe_core::executor::{BatchExecutor, ExecutionMode};
use pinprobe_core::length::{DEFAULT_MIN_LENGTH, LengthOutcome, LengthSearch, detect_length};
use pinprobe_core::observer::ProgressObserver;
use pinprobe_core::oracle::{OracleResult, PinOracle};
use pinprobe_core::report::{ReportDocument, ResolveSummary};
use pinprobe_core::selector::{SelectMode, Selection};

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use tracing_subscriber::EnvFilter;

const DEFAULT_LENGTH: usize = 40;

#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about = "Recovers a secret input by steering on branch counts of an instrumented target",
    long_about = None
)]
struct Cli {
    /// Target word size, 32 or 64.
    #[clap(short, long, default_value = "64")]
    arch: Arch,
    /// Only count branches inside this module.
    #[clap(short, long)]
    module: Option<String>,
    /// Start of the counted address range (decimal, 0x, 0o or 0b).
    #[clap(short = 's', long, value_parser = parse_address)]
    range_start: Option<u64>,
    /// End of the counted address range.
    #[clap(short = 'e', long, value_parser = parse_address)]
    range_end: Option<u64>,
    /// Which branches to count: all, taken or not-taken.
    #[clap(long, default_value = "all")]
    count: CountMode,
    /// Shorthand for `--count taken`.
    #[clap(short = 'b', conflicts_with = "count")]
    taken: bool,
    /// Extra attempts for failed harness runs.
    #[clap(short, long, default_value_t = 0)]
    retry: u32,
    /// Encoding of candidates on the target's stdin.
    #[clap(long, default_value = "utf8")]
    encoding: TextEncoding,
    /// Characters to try at each position. Defaults to printable ASCII
    /// without whitespace and without the padding character.
    #[clap(short, long)]
    charset: Option<String>,
    /// Fill character for unknown positions.
    #[clap(short, long, default_value = "\\")]
    padding: char,
    /// Already known pattern, with the padding character at unknown positions.
    #[clap(short, long)]
    known: Option<String>,
    /// Secret length, or the upper bound for length detection.
    #[clap(short, long, default_value_t = DEFAULT_LENGTH)]
    length: usize,
    /// Lower bound for length detection.
    #[clap(long, default_value_t = DEFAULT_MIN_LENGTH)]
    min_length: usize,
    /// Selection rule: max, min or unique-outlier.
    #[clap(short = 't', long = "type", default_value = "max")]
    select: SelectMode,
    /// Search order: forward, backward, blind or length-detect.
    #[clap(short, long, default_value = "forward")]
    order: Order,
    /// Shorthand for `--order length-detect`.
    #[clap(short = 'd', long, conflicts_with = "order")]
    detect: bool,
    /// Run one harness at a time.
    #[clap(long)]
    disable_parallel: bool,
    /// Worker count for parallel batches.
    #[clap(short = 'j', long, conflicts_with = "disable_parallel")]
    workers: Option<usize>,
    /// Configuration file. Defaults to pinprobe.toml in the user config directory.
    #[clap(long)]
    config: Option<PathBuf>,
    /// Write a JSON summary of the run here.
    #[clap(long)]
    report: Option<PathBuf>,
    /// Pass -d to the harness (prints the resolved range on stderr).
    #[clap(long)]
    harness_debug: bool,
    #[clap(short, long)]
    verbose: bool,
    /// Target command line.
    #[clap(last = true, required = true)]
    cmd: Vec<String>,
}

impl Cli {
    fn order(&self) -> Order {
        if self.detect {
            Order::LengthDetect
        } else {
            self.order
        }
    }

    fn count_mode(&self) -> CountMode {
        if self.taken {
            CountMode::Taken
        } else {
            self.count
        }
    }

    fn charset(&self) -> String {
        self.charset
            .clone()
            .unwrap_or_else(|| {
                (0x21u8..=0x7e)
                    .map(char::from)
                    .filter(|&c| c != self.padding)
                    .collect()
            })
    }
}

fn parse_address(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, radix) = match s.get(..2).map(str::to_ascii_lowercase).as_deref() {
        Some("0x") => (&s[2..], 16),
        Some("0o") => (&s[2..], 8),
        Some("0b") => (&s[2..], 2),
        _ => (s, 10),
    };
    u64::from_str_radix(digits, radix).map_err(|e| format!("invalid address '{s}': {e}"))
}

/// Terminal end state of a run, mapped to the process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Done,
    Inconclusive,
    Cancelled,
}

impl Status {
    fn code(self) -> u8 {
        match self {
            Status::Done => 0,
            Status::Inconclusive => 2,
            Status::Cancelled => 130,
        }
    }
}

/// Prints each scored candidate and the decision of every round. Rows that
/// improve on the best score of the batch so far are marked with `*`.
struct TableObserver {
    mode: SelectMode,
    candidates: Vec<Candidate>,
    best: Option<Score>,
}

impl TableObserver {
    fn new(mode: SelectMode) -> Self {
        Self {
            mode,
            candidates: Vec::new(),
            best: None,
        }
    }

    fn is_new_best(&mut self, score: Score) -> bool {
        let improves = match (self.mode, self.best) {
            (SelectMode::UniqueOutlier, _) => return false,
            (_, None) => true,
            (SelectMode::Max, Some(best)) => score > best,
            (SelectMode::Min, Some(best)) => score < best,
        };
        if improves {
            self.best = Some(score);
        }
        improves
    }
}

impl ProgressObserver for TableObserver {
    fn name(&self) -> &'static str {
        "TableObserver"
    }

    fn on_batch_start(&mut self, candidates: &[Candidate]) -> Result<(), anyhow::Error> {
        self.candidates = candidates.to_vec();
        self.best = None;
        Ok(())
    }

    fn on_result(&mut self, _index: usize, result: &OracleResult) -> Result<(), anyhow::Error> {
        let best = self.is_new_best(result.score);
        let marker = if best { '*' } else { ' ' };
        println!("{marker} {} | {}", result.candidate, result.score);
        Ok(())
    }

    fn on_selection(
        &mut self,
        results: &[OracleResult],
        selection: Selection,
    ) -> Result<(), anyhow::Error> {
        match selection {
            Selection::Winner(index) => {
                let winner = results
                    .get(index)
                    .ok_or_else(|| anyhow::anyhow!("winner #{index} outside the batch"))?;
                println!("> {} | {}", winner.candidate, winner.score);
            }
            Selection::Inconclusive => {
                println!(
                    "> no unique winner among {} candidates",
                    self.candidates.len()
                );
            }
        }
        Ok(())
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Flips `cancel` on the first interrupt. Harness runs sit in their own
/// process groups, so the interrupt only reaches this process.
fn spawn_interrupt_listener(cancel: CancellationToken) {
    let spawned = thread::Builder::new()
        .name("interrupt".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::warn!(error = %e, "interrupt handling unavailable");
                    return;
                }
            };
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        tracing::warn!("interrupt received, finishing in-flight harness runs");
                        cancel.cancel();
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to listen for interrupt"),
                }
            });
        });
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "failed to spawn interrupt listener");
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(status) => ExitCode::from(status.code()),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<Status, anyhow::Error> {
    let settings = PinprobeConfig::load_or_bootstrap(cli.config.as_deref())?;

    let mut config = ProbeConfig::new(cli.arch, settings.path.clone());
    config.range_start = cli.range_start;
    config.range_end = cli.range_end;
    config.count_mode = cli.count_mode();
    config.module = cli.module.clone();
    config.encoding = cli.encoding;
    config.retry = cli.retry;
    config.harness_debug = cli.harness_debug;
    config.validate()?;
    let config = Arc::new(config);

    let mode = if cli.disable_parallel {
        ExecutionMode::Sequential
    } else {
        let workers = cli
            .workers
            .or_else(|| settings.pool.as_ref().and_then(|p| p.workers))
            .unwrap_or(0);
        ExecutionMode::Parallel { workers }
    };

    let cancel = CancellationToken::new();
    spawn_interrupt_listener(cancel.clone());

    let oracle = PinOracle::new(Arc::clone(&config), cli.cmd.clone());
    tracing::debug!(?config, ?mode, "effective configuration");
    let executor = BatchExecutor::new(oracle, mode, cancel);
    let mut observer = TableObserver::new(cli.select);

    match cli.order().strategy() {
        Some(strategy) => {
            let pattern = cli.known.as_deref().unwrap_or("");
            let known = KnownMap::from_pattern(pattern, cli.padding, cli.length)?;
            let resolver =
                Resolver::new(&executor, strategy, &cli.charset(), cli.padding, cli.select)?;
            let report = match resolver.run(known, &mut observer) {
                Ok(report) => report,
                Err(e) => {
                    if let Some(partial) = e.partial() {
                        eprintln!("Partial: {}", partial.render(cli.padding));
                    }
                    return Err(e.into());
                }
            };

            let status = match report.outcome {
                RunOutcome::Resolved => {
                    println!("Secret: {}", report.known.render(cli.padding));
                    Status::Done
                }
                RunOutcome::Inconclusive => {
                    println!("Partial: {}", report.known.render(cli.padding));
                    Status::Inconclusive
                }
                RunOutcome::Cancelled => {
                    println!("Partial: {}", report.known.render(cli.padding));
                    Status::Cancelled
                }
            };
            if let Some(path) = &cli.report {
                ReportDocument::Resolve(ResolveSummary::new(&report, cli.padding, cli.select))
                    .write_json(path)?;
            }
            Ok(status)
        }
        None => {
            let search = LengthSearch {
                min_length: cli.min_length,
                max_length: cli.length,
                padding: cli.padding,
            };
            let report = detect_length(&executor, &search, cli.select, &mut observer)?;
            let status = match report.outcome {
                LengthOutcome::Detected(length) => {
                    println!("Length: {length}");
                    Status::Done
                }
                LengthOutcome::Inconclusive => {
                    println!("Length: undetermined");
                    Status::Inconclusive
                }
                LengthOutcome::Cancelled => Status::Cancelled,
            };
            if let Some(path) = &cli.report {
                ReportDocument::length(&report, search.min_length, search.max_length, cli.select)
                    .write_json(path)?;
            }
            Ok(status)
        }
    }
}
