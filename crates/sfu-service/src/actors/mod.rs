//! Actor model implementation for the SFU.
//!
//! ```text
//! SourceRegistryActor (singleton)
//! └── one ingestion pipeline per source
//!     ├── receiver endpoint + published stream (engine)
//!     └── encoder process (supervised task)
//!
//! SessionManagerActor (singleton)
//! ├── consumer id -> peer index
//! └── supervises N ViewerSessionActors
//!     └── ViewerSessionActor (one per signaling peer)
//!         └── owns its peer transport and consumers
//! ```
//!
//! # Key Design Decisions
//!
//! - **Mailbox as lock**: registry-wide and session-wide exclusion come from
//!   each actor processing one message at a time
//! - **CancellationToken propagation**: parents hand out child tokens, so
//!   cancelling the root drains sessions, encoders and engine resources
//! - **Mailbox monitoring**: depth thresholds with metrics (singletons: 100/500,
//!   sessions: 20/100)
//!
//! # Modules
//!
//! - [`registry`] - `SourceRegistryActor`, sources and ingestion pipelines
//! - [`sessions`] - `SessionManagerActor`, peer registration and consumer routing
//! - [`session`] - `ViewerSessionActor`, one per peer
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod messages;
pub mod metrics;
pub mod registry;
pub mod session;
pub mod sessions;

pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use registry::{IngestConfig, SourceRegistryActor, SourceRegistryHandle, SSRC_SPACE};
pub use session::{SessionContext, ViewerSessionActor, ViewerSessionHandle};
pub use sessions::{SessionManagerActor, SessionManagerHandle};
