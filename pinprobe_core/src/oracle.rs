use crate::cancel::CancellationToken;
use crate::candidate::{Candidate, Score};
use crate::config::ProbeConfig;
use crate::encoding::EncodingError;
use regex::Regex;
use std::ffi::OsString;
use std::io::{ErrorKind, Write};
use std::process::{Command, Output, Stdio};
use std::sync::{Arc, LazyLock};
use thiserror::Error;

static COUNT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Count (\w+)").expect("count pattern is a valid regex"));

/// Upper bound on how much captured stderr is carried inside an error.
const STDERR_EXCERPT_LEN: usize = 512;

#[derive(Error, Debug)]
pub enum OracleError {
    /// The harness could not be started or exited with a failure status.
    #[error("Harness launch failed: {0}")]
    Launch(String),

    /// The harness ran but reported no usable `Count <n>` line. Never retried.
    #[error("No branch count found in harness stderr ({reason}); stderr: {stderr_excerpt}")]
    Parse {
        reason: String,
        stderr_excerpt: String,
    },

    #[error("Harness failed {attempts} times, giving up: {last}")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        last: Box<OracleError>,
    },

    #[error("Candidate cannot be encoded: {0}")]
    Encode(#[from] EncodingError),

    /// A retry was due but cancellation had been requested.
    #[error("Invocation interrupted before retry")]
    Interrupted,
}

impl OracleError {
    /// Whether another attempt of the same invocation might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, OracleError::Launch(_))
    }
}

/// Outcome of one oracle invocation for one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleResult {
    pub candidate: Candidate,
    pub score: Score,
    pub stdout: String,
    pub stderr: String,
}

/// A source of side-channel scores for candidates.
///
/// Implementations must be callable from several worker threads at once.
pub trait Oracle: Send + Sync {
    fn invoke(
        &self,
        candidate: &Candidate,
        cancel: &CancellationToken,
    ) -> Result<OracleResult, OracleError>;
}

/// Extracts the branch count from harness stderr. The first match wins.
pub fn parse_count(stderr: &str) -> Result<Score, OracleError> {
    let captures = COUNT_LINE.captures(stderr).ok_or_else(|| OracleError::Parse {
        reason: "pattern `Count <token>` not found".to_string(),
        stderr_excerpt: excerpt(stderr),
    })?;
    let token = &captures[1];
    token.parse::<Score>().map_err(|e| OracleError::Parse {
        reason: format!("token '{token}' is not an integer: {e}"),
        stderr_excerpt: excerpt(stderr),
    })
}

fn excerpt(text: &str) -> String {
    let trimmed = text.trim_end();
    match trimmed.char_indices().nth(STDERR_EXCERPT_LEN) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

/// Runs the target under the branch-counting instrumentation harness.
pub struct PinOracle {
    config: Arc<ProbeConfig>,
    target: Vec<String>,
}

impl PinOracle {
    pub fn new(config: Arc<ProbeConfig>, target: Vec<String>) -> Self {
        Self { config, target }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Full argument vector, harness binary first.
    pub fn command_line(&self) -> Vec<OsString> {
        let config = &self.config;
        let mut argv: Vec<OsString> = vec![
            config.harness.pin.clone().into_os_string(),
            "-t".into(),
            config.tool_path().as_os_str().to_owned(),
        ];
        if let Some(start) = config.range_start {
            argv.push("-s".into());
            argv.push(start.to_string().into());
        }
        if let Some(end) = config.range_end {
            argv.push("-e".into());
            argv.push(end.to_string().into());
        }
        if let Some(flag) = config.count_mode.harness_flag() {
            argv.push(flag.into());
        }
        if let Some(module) = config.module.as_deref().filter(|m| !m.is_empty()) {
            argv.push("-p".into());
            argv.push(module.into());
        }
        if config.harness_debug {
            argv.push("-d".into());
        }
        argv.push("--".into());
        argv.extend(self.target.iter().map(OsString::from));
        argv
    }

    fn build_command(&self) -> Command {
        let argv = self.command_line();
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        // Keep terminal interrupts away from the harness so in-flight runs
        // complete on their own.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        cmd
    }

    fn run_once(&self, payload: &[u8]) -> Result<Output, OracleError> {
        let mut child = self.build_command().spawn().map_err(|e| {
            OracleError::Launch(format!(
                "failed to spawn '{}': {e}",
                self.config.harness.pin.display()
            ))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(payload) {
                Ok(()) => {}
                // The target may exit without reading its input.
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                    tracing::debug!("target closed stdin before reading the candidate");
                }
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(OracleError::Launch(format!("failed to write stdin: {e}")));
                }
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|e| OracleError::Launch(format!("failed to wait for harness: {e}")))?;

        if output.status.success() {
            Ok(output)
        } else {
            let stderr = self.config.encoding.decode(&output.stderr);
            Err(OracleError::Launch(format!(
                "harness exited with {}; stderr: {}",
                output.status,
                excerpt(&stderr)
            )))
        }
    }
}

impl Oracle for PinOracle {
    fn invoke(
        &self,
        candidate: &Candidate,
        cancel: &CancellationToken,
    ) -> Result<OracleResult, OracleError> {
        let encoding = self.config.encoding;
        let payload = candidate.stdin_payload(encoding)?;
        let retry = self.config.retry;

        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match self.run_once(&payload) {
                Ok(output) => {
                    let stderr = encoding.decode(&output.stderr);
                    let score = parse_count(&stderr)?;
                    tracing::debug!(candidate = %candidate, score, attempts, "oracle invocation");
                    return Ok(OracleResult {
                        candidate: candidate.clone(),
                        score,
                        stdout: encoding.decode(&output.stdout),
                        stderr,
                    });
                }
                Err(err) if attempts > retry => {
                    return Err(if retry == 0 {
                        err
                    } else {
                        OracleError::ExhaustedRetries {
                            attempts,
                            last: Box::new(err),
                        }
                    });
                }
                Err(err) => {
                    if cancel.is_cancelled() {
                        return Err(OracleError::Interrupted);
                    }
                    tracing::debug!(
                        candidate = %candidate,
                        attempts,
                        error = %err,
                        "retrying oracle invocation"
                    );
                }
            }
        }
    }
}

/// In-process oracle backed by a scoring closure.
pub struct FnOracle<F>
where
    F: Fn(&Candidate) -> Result<Score, OracleError>,
{
    score_fn: F,
}

impl<F> FnOracle<F>
where
    F: Fn(&Candidate) -> Result<Score, OracleError>,
{
    pub fn new(score_fn: F) -> Self {
        Self { score_fn }
    }
}

impl<F> Oracle for FnOracle<F>
where
    F: Fn(&Candidate) -> Result<Score, OracleError> + Send + Sync,
{
    fn invoke(
        &self,
        candidate: &Candidate,
        _cancel: &CancellationToken,
    ) -> Result<OracleResult, OracleError> {
        let score = (self.score_fn)(candidate)?;
        Ok(OracleResult {
            candidate: candidate.clone(),
            score,
            stdout: String::new(),
            stderr: format!("Count {score}\n"),
        })
    }
}
