use async_trait::async_trait;

use crate::error::StoreResult;
use crate::schema::{Conversation, ConversationSummary, StoredUtterance, Utterance};

/// Durable, ordered, per-conversation utterance log.
///
/// Appends to the same conversation are serialized: versions are assigned
/// strictly increasing and an append that returns `Ok` has been persisted.
/// Uses `async-trait` for object safety (`dyn ConversationStore`).
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Connect to the storage backend.
    async fn connect(&self) -> StoreResult<()>;

    /// Initialize schema (tables, indexes).
    async fn init_schema(&self) -> StoreResult<()>;

    /// Durably append a locally authored utterance and mark the conversation
    /// dirty. Returns the assigned local version.
    async fn append(&self, conversation_id: &str, utterance: Utterance) -> StoreResult<u64>;

    /// Durably append a user utterance and its reply as one write: either
    /// both land or neither does. Returns their local versions.
    async fn append_turn(
        &self,
        conversation_id: &str,
        user: Utterance,
        reply: Utterance,
    ) -> StoreResult<(u64, u64)>;

    /// Snapshot of the conversation in version order.
    async fn read(&self, conversation_id: &str) -> StoreResult<Conversation>;

    /// The last `limit` utterances in version order. Empty for unknown conversations.
    async fn recent(&self, conversation_id: &str, limit: usize) -> StoreResult<Vec<StoredUtterance>>;

    /// Record that every local write up to `up_to` was acknowledged remotely.
    async fn mark_synced(
        &self,
        conversation_id: &str,
        up_to: u64,
        remote_version: u64,
    ) -> StoreResult<()>;

    /// Fold remote utterances into the local log. Returns how many were added.
    async fn merge_remote(
        &self,
        conversation_id: &str,
        remote: Vec<Utterance>,
        remote_version: u64,
    ) -> StoreResult<usize>;

    /// Remove an utterance locally, leaving a tombstone. Returns the version
    /// assigned to the delete.
    async fn delete_utterance(&self, conversation_id: &str, utterance_id: &str) -> StoreResult<u64>;

    // -- Listing ---

    async fn list_conversations(&self) -> StoreResult<Vec<ConversationSummary>>;

    /// Ids of conversations with writes not yet acknowledged remotely.
    async fn list_dirty(&self) -> StoreResult<Vec<String>>;
}
