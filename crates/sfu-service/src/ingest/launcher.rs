//! Encoder process spawning.
//!
//! [`EncoderLauncher`] is the seam between the supervisor and the operating
//! system. [`ProcessLauncher`] spawns real child processes; tests script
//! exits and stderr output through their own implementations.

use super::command::EncoderCommand;
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};

/// Boxed diagnostic stream of an encoder.
pub type StderrStream = Pin<Box<dyn AsyncRead + Send>>;

/// A running encoder.
#[async_trait]
pub trait EncoderProcess: Send {
    /// OS process id, if the process is still known to the OS.
    fn id(&self) -> Option<u32>;

    /// Take the diagnostic output stream. Returns `None` after the first call.
    fn take_stderr(&mut self) -> Option<StderrStream>;

    /// Wait for termination. `Ok(None)` means killed by a signal.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    async fn kill(&mut self) -> io::Result<()>;
}

/// Starts encoder processes.
pub trait EncoderLauncher: Send + Sync {
    fn launch(&self, command: &EncoderCommand) -> io::Result<Box<dyn EncoderProcess>>;
}

/// Launches encoders as OS child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl EncoderLauncher for ProcessLauncher {
    fn launch(&self, command: &EncoderCommand) -> io::Result<Box<dyn EncoderProcess>> {
        let child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        Ok(Box::new(ChildProcess { child }))
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl EncoderProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_stderr(&mut self) -> Option<StderrStream> {
        self.child
            .stderr
            .take()
            .map(|stderr| Box::pin(stderr) as StderrStream)
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}
