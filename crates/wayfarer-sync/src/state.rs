//! Per-conversation sync state machine with validated transitions.
//!
//! Clean -> Dirty -> Syncing -> Clean | Dirty | Blocked
//! Clean -> Syncing (pull only)
//! Blocked -> Dirty (manual retry)

use std::collections::VecDeque;
use std::time::Instant;

use wayfarer_db::{Conversation, Utterance};

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Clean,
    Dirty,
    Syncing,
    Blocked,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Clean => "clean",
            Self::Dirty => "dirty",
            Self::Syncing => "syncing",
            Self::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// Validate that a sync state transition is allowed.
pub fn validate_transition(from: SyncState, to: SyncState) -> SyncResult<()> {
    let valid = matches!(
        (from, to),
        (SyncState::Clean, SyncState::Dirty)
            | (SyncState::Clean, SyncState::Syncing)
            | (SyncState::Dirty, SyncState::Syncing)
            | (SyncState::Syncing, SyncState::Clean)
            | (SyncState::Syncing, SyncState::Dirty)
            | (SyncState::Syncing, SyncState::Blocked)
            | (SyncState::Blocked, SyncState::Dirty)
    );

    if valid {
        Ok(())
    } else {
        Err(SyncError::InvalidTransition { from, to })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Upsert,
    Delete,
}

/// A local write awaiting remote acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOp {
    pub kind: OpKind,
    pub utterance_id: String,
    pub local_version: u64,
    /// Present for upserts.
    pub payload: Option<Utterance>,
}

/// Unacknowledged writes of a conversation snapshot in local-version order.
pub fn pending_operations(conversation: &Conversation) -> VecDeque<PendingOp> {
    let mut ops: Vec<PendingOp> = conversation
        .unsynced()
        .map(|stored| PendingOp {
            kind: OpKind::Upsert,
            utterance_id: stored.utterance.id.clone(),
            local_version: stored.local_version,
            payload: Some(stored.utterance.clone()),
        })
        .chain(conversation.pending_tombstones().map(|t| PendingOp {
            kind: OpKind::Delete,
            utterance_id: t.utterance_id.clone(),
            local_version: t.local_version,
            payload: None,
        }))
        .collect();
    ops.sort_by_key(|op| op.local_version);
    ops.into()
}

/// Coordinator bookkeeping for one conversation.
#[derive(Debug, Clone)]
pub struct SyncRecord {
    pub conversation_id: String,
    pub state: SyncState,
    /// Consecutive failed cycles; reset on success.
    pub attempt: u32,
    pub next_attempt: Option<Instant>,
    pub last_error: Option<String>,
    /// A notification arrived while a cycle was in flight.
    pub rerun: bool,
}

impl SyncRecord {
    pub fn new(conversation_id: impl Into<String>, state: SyncState) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            state,
            attempt: 0,
            next_attempt: None,
            last_error: None,
            rerun: false,
        }
    }

    pub fn transition(&mut self, to: SyncState) -> SyncResult<()> {
        validate_transition(self.state, to)?;
        tracing::debug!(
            conversation = %self.conversation_id,
            "Sync state {} -> {}",
            self.state,
            to
        );
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wayfarer_db::{ConversationMeta, StoredUtterance};

    #[test]
    fn normal_cycle_is_valid() {
        assert!(validate_transition(SyncState::Clean, SyncState::Dirty).is_ok());
        assert!(validate_transition(SyncState::Dirty, SyncState::Syncing).is_ok());
        assert!(validate_transition(SyncState::Syncing, SyncState::Clean).is_ok());
        assert!(validate_transition(SyncState::Syncing, SyncState::Dirty).is_ok());
    }

    #[test]
    fn blocked_only_leaves_through_dirty() {
        assert!(validate_transition(SyncState::Syncing, SyncState::Blocked).is_ok());
        assert!(validate_transition(SyncState::Blocked, SyncState::Dirty).is_ok());
        assert!(validate_transition(SyncState::Blocked, SyncState::Syncing).is_err());
        assert!(validate_transition(SyncState::Blocked, SyncState::Clean).is_err());
    }

    #[test]
    fn invalid_transitions_rejected() {
        assert!(validate_transition(SyncState::Clean, SyncState::Blocked).is_err());
        assert!(validate_transition(SyncState::Dirty, SyncState::Clean).is_err());
        assert!(validate_transition(SyncState::Syncing, SyncState::Syncing).is_err());
        let mut record = SyncRecord::new("c1", SyncState::Clean);
        let err = record.transition(SyncState::Blocked).unwrap_err();
        assert!(matches!(
            err,
            SyncError::InvalidTransition {
                from: SyncState::Clean,
                to: SyncState::Blocked
            }
        ));
        assert_eq!(record.state, SyncState::Clean);
    }

    #[test]
    fn pending_ops_interleave_upserts_and_deletes_by_version() {
        let mut meta = ConversationMeta::new("c1");
        let a = Utterance::user("c1", "a");
        let b = Utterance::user("c1", "b");
        let va = meta.record_append(&a);
        meta.mark_synced(va, 1);
        let vb = meta.record_append(&b);
        let vdel = meta.record_tombstone(&a.id, (va, true));
        let conversation = Conversation::from_parts(
            meta,
            vec![StoredUtterance {
                utterance: b.clone(),
                local_version: vb,
                synced: false,
            }],
        );

        let ops = pending_operations(&conversation);
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].kind, OpKind::Upsert);
        assert_eq!(ops[0].utterance_id, b.id);
        assert_eq!(ops[0].payload.as_ref(), Some(&b));
        assert_eq!(ops[1].kind, OpKind::Delete);
        assert_eq!(ops[1].utterance_id, a.id);
        assert_eq!(ops[1].local_version, vdel);
        assert!(ops[1].payload.is_none());
    }
}
