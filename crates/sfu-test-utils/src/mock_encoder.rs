//! Scripted encoder processes for SFU testing.
//!
//! [`MockEncoderLauncher`] records every command it is asked to run and
//! hands out processes that run until the test tells them to exit (or the
//! supervisor kills them).
//!
//! # Example
//!
//! ```rust,ignore
//! use sfu_test_utils::MockEncoderLauncher;
//!
//! let launcher = MockEncoderLauncher::new();
//! // ... create a source through the registry ...
//! launcher.wait_for_launches(1).await;
//! launcher.exit(0, Some(1)); // first encoder crashes with status 1
//! ```

use async_trait::async_trait;
use sfu_service::ingest::{EncoderCommand, EncoderLauncher, EncoderProcess, StderrStream};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, Notify};

/// First fake pid handed out.
const FIRST_PID: u32 = 10_000;

struct LaunchRecord {
    command: EncoderCommand,
    exit_tx: Option<oneshot::Sender<Option<i32>>>,
    killed: Arc<AtomicBool>,
}

/// Launcher that records commands and returns controllable processes.
pub struct MockEncoderLauncher {
    launches: Mutex<Vec<LaunchRecord>>,
    fail_spawn: AtomicBool,
    stderr_lines: Mutex<Vec<String>>,
    next_pid: AtomicU32,
    launched: Notify,
}

impl std::fmt::Debug for MockEncoderLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockEncoderLauncher")
            .field("launches", &self.launch_count())
            .finish_non_exhaustive()
    }
}

impl MockEncoderLauncher {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            launches: Mutex::new(Vec::new()),
            fail_spawn: AtomicBool::new(false),
            stderr_lines: Mutex::new(Vec::new()),
            next_pid: AtomicU32::new(FIRST_PID),
            launched: Notify::new(),
        })
    }

    /// Make subsequent launches fail as if the binary were missing.
    pub fn set_fail_spawn(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }

    /// Lines written to the stderr of subsequently launched processes.
    pub fn set_stderr_lines(&self, lines: Vec<String>) {
        *self.stderr_lines.lock().unwrap() = lines;
    }

    /// Number of launch attempts, including failed spawns.
    #[must_use]
    pub fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }

    #[must_use]
    pub fn commands(&self) -> Vec<EncoderCommand> {
        self.launches
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.command.clone())
            .collect()
    }

    /// Terminate the `index`-th launched process with `code`
    /// (`None` = killed by signal). Returns false if it already exited.
    pub fn exit(&self, index: usize, code: Option<i32>) -> bool {
        let mut launches = self.launches.lock().unwrap();
        let Some(record) = launches.get_mut(index) else {
            return false;
        };
        match record.exit_tx.take() {
            Some(tx) => tx.send(code).is_ok(),
            None => false,
        }
    }

    /// Whether the supervisor killed the `index`-th process.
    #[must_use]
    pub fn was_killed(&self, index: usize) -> bool {
        self.launches
            .lock()
            .unwrap()
            .get(index)
            .is_some_and(|r| r.killed.load(Ordering::SeqCst))
    }

    /// Wait until at least `count` launches happened.
    pub async fn wait_for_launches(&self, count: usize) {
        loop {
            let notified = self.launched.notified();
            if self.launch_count() >= count {
                return;
            }
            notified.await;
        }
    }
}

impl EncoderLauncher for MockEncoderLauncher {
    fn launch(&self, command: &EncoderCommand) -> io::Result<Box<dyn EncoderProcess>> {
        let killed = Arc::new(AtomicBool::new(false));

        if self.fail_spawn.load(Ordering::SeqCst) {
            self.launches.lock().unwrap().push(LaunchRecord {
                command: command.clone(),
                exit_tx: None,
                killed,
            });
            self.launched.notify_waiters();
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}: not found", command.program),
            ));
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        let stderr = {
            let lines = self.stderr_lines.lock().unwrap();
            if lines.is_empty() {
                None
            } else {
                let mut text = lines.join("\n");
                text.push('\n');
                Some(Box::pin(io::Cursor::new(text.into_bytes())) as StderrStream)
            }
        };

        self.launches.lock().unwrap().push(LaunchRecord {
            command: command.clone(),
            exit_tx: Some(exit_tx),
            killed: Arc::clone(&killed),
        });
        self.launched.notify_waiters();

        Ok(Box::new(MockEncoderProcess {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            exit_rx: Some(exit_rx),
            stderr,
            killed,
        }))
    }
}

struct MockEncoderProcess {
    pid: u32,
    exit_rx: Option<oneshot::Receiver<Option<i32>>>,
    stderr: Option<StderrStream>,
    killed: Arc<AtomicBool>,
}

#[async_trait]
impl EncoderProcess for MockEncoderProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn take_stderr(&mut self) -> Option<StderrStream> {
        self.stderr.take()
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        match self.exit_rx.take() {
            Some(rx) => match rx.await {
                Ok(code) => Ok(code),
                Err(_) => std::future::pending().await,
            },
            None => std::future::pending().await,
        }
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
