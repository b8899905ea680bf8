//! In-memory mock implementation of ConversationStore for testing.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{StoreError, StoreResult};
use crate::schema::*;
use crate::traits::ConversationStore;

#[derive(Default)]
struct Entry {
    meta: Option<ConversationMeta>,
    utterances: Vec<StoredUtterance>,
}

/// In-memory ConversationStore with write-failure injection.
pub struct MockConversationStore {
    conversations: RwLock<HashMap<String, Entry>>,
    failing_appends: AtomicU32,
    /// Countdown to a single failing utterance write; 0 means none.
    failing_write: AtomicU32,
}

impl Default for MockConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConversationStore {
    pub fn new() -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            failing_appends: AtomicU32::new(0),
            failing_write: AtomicU32::new(0),
        }
    }

    /// Make the next `n` appends fail as if the disk refused the write.
    pub fn fail_next_appends(&self, n: u32) {
        self.failing_appends.store(n, Ordering::SeqCst);
    }

    /// Fail only the `n`-th utterance write from now (1-based). Each
    /// utterance of a turn counts as its own write.
    pub fn fail_write_number(&self, n: u32) {
        self.failing_write.store(n, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        let append_fails = self
            .failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let write_fails = self
            .failing_write
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok_and(|previous| previous == 1);
        append_fails || write_fails
    }

    /// Stage `utterances` and commit them together, or not at all.
    fn append_all(&self, conversation_id: &str, utterances: Vec<Utterance>) -> StoreResult<Vec<u64>> {
        if !validate_conversation_id(conversation_id)
            || utterances.iter().any(|u| u.conversation_id != conversation_id)
        {
            return Err(StoreError::InvalidId(conversation_id.to_string()));
        }
        for _ in &utterances {
            if self.take_injected_failure() {
                return Err(StoreError::Persistence("injected write failure".into()));
            }
        }
        let mut map = self.conversations.write().unwrap();
        let entry = map.entry(conversation_id.to_string()).or_default();
        let mut ids: HashSet<&str> = entry.utterances.iter().map(|u| u.utterance.id.as_str()).collect();
        if let Some(dup) = utterances.iter().find(|u| !ids.insert(u.id.as_str())) {
            return Err(StoreError::Duplicate(dup.id.clone()));
        }
        let meta = entry
            .meta
            .get_or_insert_with(|| ConversationMeta::new(conversation_id));
        let mut versions = Vec::with_capacity(utterances.len());
        for utterance in utterances {
            let version = meta.record_append(&utterance);
            versions.push(version);
            entry.utterances.push(StoredUtterance { utterance, local_version: version, synced: false });
        }
        Ok(versions)
    }
}

#[async_trait]
impl ConversationStore for MockConversationStore {
    async fn connect(&self) -> StoreResult<()> { Ok(()) }
    async fn init_schema(&self) -> StoreResult<()> { Ok(()) }

    async fn append(&self, conversation_id: &str, utterance: Utterance) -> StoreResult<u64> {
        let versions = self.append_all(conversation_id, vec![utterance])?;
        Ok(versions[0])
    }

    async fn append_turn(&self, conversation_id: &str, user: Utterance, reply: Utterance) -> StoreResult<(u64, u64)> {
        let versions = self.append_all(conversation_id, vec![user, reply])?;
        Ok((versions[0], versions[1]))
    }

    async fn read(&self, conversation_id: &str) -> StoreResult<Conversation> {
        let map = self.conversations.read().unwrap();
        let entry = map
            .get(conversation_id)
            .and_then(|e| e.meta.clone().map(|m| (m, e.utterances.clone())))
            .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))?;
        Ok(Conversation::from_parts(entry.0, entry.1))
    }

    async fn recent(&self, conversation_id: &str, limit: usize) -> StoreResult<Vec<StoredUtterance>> {
        let map = self.conversations.read().unwrap();
        Ok(map
            .get(conversation_id)
            .map(|e| {
                let skip = e.utterances.len().saturating_sub(limit);
                e.utterances[skip..].to_vec()
            })
            .unwrap_or_default())
    }

    async fn mark_synced(&self, conversation_id: &str, up_to: u64, remote_version: u64) -> StoreResult<()> {
        let mut map = self.conversations.write().unwrap();
        let entry = map
            .get_mut(conversation_id)
            .filter(|e| e.meta.is_some())
            .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))?;
        if let Some(meta) = entry.meta.as_mut() {
            meta.mark_synced(up_to, remote_version);
        }
        for u in entry.utterances.iter_mut().filter(|u| u.local_version <= up_to) {
            u.synced = true;
        }
        Ok(())
    }

    async fn merge_remote(&self, conversation_id: &str, remote: Vec<Utterance>, remote_version: u64) -> StoreResult<usize> {
        let mut map = self.conversations.write().unwrap();
        let entry = map.entry(conversation_id.to_string()).or_default();
        let existing: HashSet<String> = entry.utterances.iter().map(|u| u.utterance.id.clone()).collect();
        let meta = entry
            .meta
            .get_or_insert_with(|| ConversationMeta::new(conversation_id));
        let admitted = meta.admit_remote(&existing, remote);
        meta.remote_version = meta.remote_version.max(remote_version);
        let added = admitted.len();
        entry.utterances.extend(admitted);
        Ok(added)
    }

    async fn delete_utterance(&self, conversation_id: &str, utterance_id: &str) -> StoreResult<u64> {
        let mut map = self.conversations.write().unwrap();
        let entry = map
            .get_mut(conversation_id)
            .filter(|e| e.meta.is_some())
            .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))?;
        let pos = entry
            .utterances
            .iter()
            .position(|u| u.utterance.id == utterance_id)
            .ok_or_else(|| StoreError::UtteranceNotFound(utterance_id.to_string()))?;
        let removed = entry.utterances.remove(pos);
        let meta = entry
            .meta
            .get_or_insert_with(|| ConversationMeta::new(conversation_id));
        Ok(meta.record_tombstone(utterance_id, (removed.local_version, removed.synced)))
    }

    async fn list_conversations(&self) -> StoreResult<Vec<ConversationSummary>> {
        let map = self.conversations.read().unwrap();
        let mut result: Vec<ConversationSummary> = map
            .values()
            .filter_map(|e| e.meta.as_ref().map(|m| ConversationSummary::from_meta(m, e.utterances.len())))
            .collect();
        result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(result)
    }

    async fn list_dirty(&self) -> StoreResult<Vec<String>> {
        let map = self.conversations.read().unwrap();
        let mut dirty: Vec<String> = map
            .values()
            .filter_map(|e| e.meta.as_ref())
            .filter(|m| m.is_dirty())
            .map(|m| m.conversation_id.clone())
            .collect();
        dirty.sort();
        Ok(dirty)
    }
}
