//! Encoder supervision.
//!
//! One supervisor task per running encoder: stderr lines go to `tracing`,
//! the exit status is classified into an [`ExitOutcome`], and cancellation
//! kills the process. What happens after an exit is decided by the owner
//! through [`RestartPolicy`].

use super::launcher::{EncoderProcess, StderrStream};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How an encoder terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exit status 0. Carries no success meaning for a live feed.
    Exited,
    /// Non-zero status, signal, or failure to spawn/wait.
    Crashed { code: Option<i32>, reason: String },
}

impl ExitOutcome {
    /// Bounded label for metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ExitOutcome::Exited => "exited",
            ExitOutcome::Crashed { .. } => "crashed",
        }
    }

    #[must_use]
    pub fn from_status(code: Option<i32>) -> Self {
        match code {
            Some(0) => ExitOutcome::Exited,
            Some(code) => ExitOutcome::Crashed {
                code: Some(code),
                reason: format!("exit status {code}"),
            },
            None => ExitOutcome::Crashed {
                code: None,
                reason: "terminated by signal".to_string(),
            },
        }
    }
}

/// What to do when an encoder terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    /// Leave the pipeline in its terminal state.
    #[default]
    Never,
    /// Restart with exponential backoff, at most `max_attempts` times.
    Backoff {
        initial: Duration,
        max: Duration,
        max_attempts: u32,
    },
}

impl RestartPolicy {
    /// Delay before restart number `restarts_done + 1`, or `None` to give up.
    #[must_use]
    pub fn next_delay(&self, restarts_done: u32) -> Option<Duration> {
        match *self {
            RestartPolicy::Never => None,
            RestartPolicy::Backoff {
                initial,
                max,
                max_attempts,
            } => {
                if restarts_done >= max_attempts {
                    return None;
                }
                let factor = 2u32.saturating_pow(restarts_done);
                Some(initial.saturating_mul(factor).min(max))
            }
        }
    }
}

/// Log every stderr line until EOF.
///
/// The pipe stays open for the life of the child: undecodable bytes are
/// logged lossily and a read error falls back to discarding the rest.
async fn forward_stderr(source: String, pid: Option<u32>, stderr: StderrStream) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => return,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(|c| c == '\n' || c == '\r');
                warn!(target: "sfu.encoder", source = %source, pid = ?pid, "{line}");
            }
            Err(e) => {
                debug!(
                    target: "sfu.encoder",
                    source = %source,
                    pid = ?pid,
                    error = %e,
                    "Encoder stderr unreadable, discarding"
                );
                let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                return;
            }
        }
    }
}

/// Drive one encoder until it exits or `cancel` fires.
///
/// Returns `None` when the process was killed because of cancellation.
pub async fn supervise(
    source: String,
    mut process: Box<dyn EncoderProcess>,
    cancel: CancellationToken,
) -> Option<ExitOutcome> {
    let pid = process.id();

    if let Some(stderr) = process.take_stderr() {
        let source = source.clone();
        tokio::spawn(forward_stderr(source, pid, stderr));
    }

    tokio::select! {
        () = cancel.cancelled() => {
            if let Err(e) = process.kill().await {
                warn!(
                    target: "sfu.encoder",
                    source = %source,
                    pid = ?pid,
                    error = %e,
                    "Failed to kill encoder"
                );
            }
            info!(target: "sfu.encoder", source = %source, pid = ?pid, "Encoder stopped");
            None
        }

        status = process.wait() => {
            let outcome = match status {
                Ok(code) => ExitOutcome::from_status(code),
                Err(e) => ExitOutcome::Crashed {
                    code: None,
                    reason: format!("wait failed: {e}"),
                },
            };
            info!(
                target: "sfu.encoder",
                source = %source,
                pid = ?pid,
                outcome = outcome.as_str(),
                "Encoder exited"
            );
            Some(outcome)
        }
    }
}
