//! Actor metrics and mailbox monitoring.
//!
//! Mailbox depth thresholds per actor type:
//!
//! | Actor Type | Normal | Warning | Critical |
//! |------------|--------|---------|----------|
//! | Registry   | < 100  | 100-500 | > 500    |
//! | Sessions   | < 100  | 100-500 | > 500    |
//! | Session    | < 20   | 20-100  | > 100    |
//!
//! A viewer session only ever has one request in flight from its own peer,
//! so a deep session mailbox means the peer is not waiting for replies.

use crate::observability;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Mailbox depth thresholds for the singleton actors.
pub const SINGLETON_MAILBOX_NORMAL: usize = 100;
pub const SINGLETON_MAILBOX_WARNING: usize = 500;

/// Mailbox depth thresholds for viewer session actors.
pub const SESSION_MAILBOX_NORMAL: usize = 20;
pub const SESSION_MAILBOX_WARNING: usize = 100;

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// `SourceRegistryActor` (singleton).
    Registry,
    /// `SessionManagerActor` (singleton).
    SessionManager,
    /// `ViewerSessionActor` (one per signaling peer).
    Session,
}

impl ActorType {
    /// Returns the actor type as a string for metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Registry => "registry",
            ActorType::SessionManager => "sessions",
            ActorType::Session => "session",
        }
    }

    #[must_use]
    pub const fn warning_threshold(&self) -> usize {
        match self {
            ActorType::Registry | ActorType::SessionManager => SINGLETON_MAILBOX_WARNING,
            ActorType::Session => SESSION_MAILBOX_WARNING,
        }
    }

    #[must_use]
    pub const fn normal_threshold(&self) -> usize {
        match self {
            ActorType::Registry | ActorType::SessionManager => SINGLETON_MAILBOX_NORMAL,
            ActorType::Session => SESSION_MAILBOX_NORMAL,
        }
    }
}

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    Normal,
    Warning,
    Critical,
}

/// Mailbox monitor for tracking queue depth and emitting metrics.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    /// Actor identifier (instance id, peer id).
    actor_id: String,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    messages_processed: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
        }
    }

    /// Record a message being taken off the channel for processing.
    pub fn record_enqueue(&self) {
        let new_depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_depth.fetch_max(new_depth, Ordering::Relaxed);

        match self.level_for_depth(new_depth) {
            MailboxLevel::Critical => {
                warn!(
                    target: "sfu.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    depth = new_depth,
                    threshold = self.actor_type.warning_threshold(),
                    "Mailbox depth critical"
                );
            }
            MailboxLevel::Warning if new_depth == self.actor_type.normal_threshold() + 1 => {
                debug!(
                    target: "sfu.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    depth = new_depth,
                    "Mailbox depth elevated"
                );
            }
            _ => {}
        }

        observability::set_actor_mailbox_depth(self.actor_type.as_str(), new_depth);
    }

    /// Record a message as processed.
    pub fn record_dequeue(&self) {
        let new_depth = self.depth.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        observability::set_actor_mailbox_depth(self.actor_type.as_str(), new_depth);
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        self.level_for_depth(self.current_depth())
    }

    fn level_for_depth(&self, depth: usize) -> MailboxLevel {
        if depth > self.actor_type.warning_threshold() {
            MailboxLevel::Critical
        } else if depth > self.actor_type.normal_threshold() {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Aggregated counters shared by every actor.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    pub active_sources: AtomicUsize,
    pub active_sessions: AtomicUsize,
    /// Total actor panics (indicates bugs).
    pub actor_panics: AtomicU64,
    pub total_messages_processed: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn source_registered(&self) {
        let count = self.active_sources.fetch_add(1, Ordering::Relaxed) + 1;
        observability::set_sources_active(count);
    }

    pub fn source_removed(&self) {
        let count = self
            .active_sources
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        observability::set_sources_active(count);
    }

    pub fn session_opened(&self) {
        let count = self.active_sessions.fetch_add(1, Ordering::Relaxed) + 1;
        observability::set_sessions_active(count);
    }

    pub fn session_closed(&self) {
        let count = self
            .active_sessions
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        observability::set_sessions_active(count);
    }

    /// Record an actor panic.
    pub fn record_panic(&self, actor_type: ActorType) {
        self.actor_panics.fetch_add(1, Ordering::Relaxed);
        observability::record_actor_panic(actor_type.as_str());
        tracing::error!(
            target: "sfu.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics = self.actor_panics.load(Ordering::Relaxed),
            "Actor panic detected - indicates bug, investigation required"
        );
    }

    pub fn record_message_processed(&self) {
        self.total_messages_processed
            .fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn source_count(&self) -> usize {
        self.active_sources.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }
}
