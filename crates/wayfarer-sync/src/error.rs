use std::time::Duration;

use thiserror::Error;
use wayfarer_db::StoreError;

use crate::state::SyncState;

/// Failure talking to the remote document store.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    #[error("Remote call timed out after {0:?}")]
    Timeout(Duration),

    /// The remote store will never accept this operation as sent.
    #[error("Remote store rejected operation: {0}")]
    Rejected(String),

    #[error("Invalid response from remote store: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    pub fn is_retriable(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Local store error: {0}")]
    Store(#[from] StoreError),

    #[error("Conversation {conversation_id} is blocked: {reason}")]
    Blocked {
        conversation_id: String,
        reason: String,
    },

    #[error("Invalid sync state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: SyncState, to: SyncState },
}

pub type SyncResult<T> = Result<T, SyncError>;
