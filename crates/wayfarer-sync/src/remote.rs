use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use wayfarer_db::Utterance;

use crate::error::RemoteError;

/// Result of a write against the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Accepted; the conversation is now at `version` remotely.
    Ack { version: u64 },
    /// The remote conversation moved past the caller's base version.
    Conflict { remote_version: u64 },
}

/// Remote changes since a given version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteDelta {
    pub version: u64,
    #[serde(default)]
    pub utterances: Vec<Utterance>,
}

/// Remote authoritative document store. Authentication is the
/// implementation's concern.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn upsert(
        &self,
        conversation_id: &str,
        utterance_id: &str,
        payload: &Utterance,
        base_version: u64,
    ) -> Result<UpsertOutcome, RemoteError>;

    async fn delete(
        &self,
        conversation_id: &str,
        utterance_id: &str,
        base_version: u64,
    ) -> Result<UpsertOutcome, RemoteError>;

    async fn fetch(&self, conversation_id: &str, since_version: u64) -> Result<RemoteDelta, RemoteError>;
}
