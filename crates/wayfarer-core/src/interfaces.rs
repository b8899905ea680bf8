//! Cross-crate interface definitions.
//!
//! The orchestrator (wayfarer-ai) and the sync coordinator (wayfarer-sync)
//! only meet through the types in this module.

use tokio::sync::broadcast;

/// Status of turns and conversation sync, streamed to the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum AssistantStatus {
    /// A user turn was accepted and is being processed.
    Sending { conversation_id: String },
    /// The turn was answered by the local fallback.
    Degraded { conversation_id: String, reason: String },
    /// All local changes were acknowledged by the remote store.
    Synced { conversation_id: String, remote_version: u64 },
    /// A sync cycle failed transiently; another attempt is scheduled.
    SyncRetrying {
        conversation_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    /// The remote store permanently rejected an operation. Needs user action.
    SyncBlocked { conversation_id: String, reason: String },
}

impl AssistantStatus {
    pub fn conversation_id(&self) -> &str {
        match self {
            Self::Sending { conversation_id }
            | Self::Degraded { conversation_id, .. }
            | Self::Synced { conversation_id, .. }
            | Self::SyncRetrying { conversation_id, .. }
            | Self::SyncBlocked { conversation_id, .. } => conversation_id,
        }
    }

    /// Short label used by the CLI and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sending { .. } => "sending",
            Self::Degraded { .. } => "degraded",
            Self::Synced { .. } => "synced",
            Self::SyncRetrying { .. } => "sync-retrying",
            Self::SyncBlocked { .. } => "sync-blocked",
        }
    }
}

pub type StatusSender = broadcast::Sender<AssistantStatus>;
pub type StatusReceiver = broadcast::Receiver<AssistantStatus>;

/// Create the status channel shared by the orchestrator and the sync coordinator.
/// Slow subscribers lose the oldest events rather than blocking producers.
pub fn status_channel(capacity: usize) -> (StatusSender, StatusReceiver) {
    broadcast::channel(capacity.max(1))
}

/// Fire-and-forget hook the orchestrator uses after committing a turn.
pub trait SyncNotifier: Send + Sync {
    fn notify(&self, conversation_id: &str);
}

/// Notifier for deployments without sync.
pub struct NoopNotifier;

impl SyncNotifier for NoopNotifier {
    fn notify(&self, _conversation_id: &str) {}
}
