//! Ingestion pipeline pieces that live outside the registry actor: the
//! encoder command line, the process launcher seam, and supervision.

pub mod command;
pub mod launcher;
pub mod supervisor;

pub use command::{
    EncoderCommand, RtpTarget, ENCODER_CLOCK_RATE, ENCODER_MIME_TYPE, ENCODER_PAYLOAD_TYPE,
};
pub use launcher::{EncoderLauncher, EncoderProcess, ProcessLauncher, StderrStream};
pub use supervisor::{supervise, ExitOutcome, RestartPolicy};
