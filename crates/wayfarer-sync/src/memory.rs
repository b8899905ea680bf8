//! In-process remote store for offline use and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use wayfarer_db::Utterance;

use crate::error::RemoteError;
use crate::remote::{RemoteDelta, RemoteStore, UpsertOutcome};

/// Failure to inject into a remote call.
#[derive(Debug, Clone)]
pub enum Fault {
    Unavailable,
    Reject(String),
    /// Never answer; the caller's timeout has to fire.
    Stall,
    /// Another device writes to the conversation just before this call
    /// runs, so a write based on the old version conflicts.
    ConcurrentWrite,
}

#[derive(Default)]
struct RemoteConversation {
    version: u64,
    /// (version at which the entry was written, utterance)
    log: Vec<(u64, Utterance)>,
}

/// Versioned per-conversation log held in memory. Each accepted write bumps
/// the conversation version; writes against a stale base version conflict.
#[derive(Default)]
pub struct InMemoryRemoteStore {
    conversations: Mutex<HashMap<String, RemoteConversation>>,
    /// One entry per upcoming write call; `None` lets the call through.
    write_script: Mutex<VecDeque<Option<Fault>>>,
    fetch_faults: Mutex<VecDeque<Fault>>,
    writes: Mutex<Vec<String>>,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `ok` write calls through, then fail the next one with `fault`.
    pub fn fail_after(&self, ok: usize, fault: Fault) {
        let mut script = self.write_script.lock().unwrap_or_else(|e| e.into_inner());
        script.clear();
        script.extend(std::iter::repeat(None).take(ok));
        script.push_back(Some(fault));
    }

    /// Replace the write script. Each entry applies to one upcoming write
    /// call; `None` lets the call through.
    pub fn script_writes(&self, script: impl IntoIterator<Item = Option<Fault>>) {
        let mut queued = self.write_script.lock().unwrap_or_else(|e| e.into_inner());
        queued.clear();
        queued.extend(script);
    }

    pub fn fail_next_fetch(&self, fault: Fault) {
        self.fetch_faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(fault);
    }

    /// Record an utterance authored on another device.
    pub fn insert_remote(&self, utterance: Utterance) -> u64 {
        let mut map = self.conversations.lock().unwrap_or_else(|e| e.into_inner());
        let conv = map.entry(utterance.conversation_id.clone()).or_default();
        conv.version += 1;
        conv.log.push((conv.version, utterance));
        conv.version
    }

    /// Remote utterances of a conversation in write order.
    pub fn utterances(&self, conversation_id: &str) -> Vec<Utterance> {
        let map = self.conversations.lock().unwrap_or_else(|e| e.into_inner());
        map.get(conversation_id)
            .map(|c| c.log.iter().map(|(_, u)| u.clone()).collect())
            .unwrap_or_default()
    }

    pub fn version(&self, conversation_id: &str) -> u64 {
        let map = self.conversations.lock().unwrap_or_else(|e| e.into_inner());
        map.get(conversation_id).map_or(0, |c| c.version)
    }

    /// Utterance ids of every write call that reached the store, in order.
    pub fn write_log(&self) -> Vec<String> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn apply_fault(&self, conversation_id: &str, fault: Option<Fault>) -> Result<(), RemoteError> {
        match fault {
            None => Ok(()),
            Some(Fault::ConcurrentWrite) => {
                self.insert_remote(Utterance::assistant(conversation_id, "written elsewhere"));
                Ok(())
            }
            Some(Fault::Unavailable) => Err(RemoteError::Unavailable("injected outage".into())),
            Some(Fault::Reject(reason)) => Err(RemoteError::Rejected(reason)),
            Some(Fault::Stall) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(RemoteError::Unavailable("stalled".into()))
            }
        }
    }

    async fn before_write(&self, conversation_id: &str, utterance_id: &str) -> Result<(), RemoteError> {
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(utterance_id.to_string());
        let fault = self
            .write_script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .flatten();
        self.apply_fault(conversation_id, fault).await
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn upsert(
        &self,
        conversation_id: &str,
        utterance_id: &str,
        payload: &Utterance,
        base_version: u64,
    ) -> Result<UpsertOutcome, RemoteError> {
        self.before_write(conversation_id, utterance_id).await?;
        let mut map = self.conversations.lock().unwrap_or_else(|e| e.into_inner());
        let conv = map.entry(conversation_id.to_string()).or_default();
        if base_version < conv.version {
            return Ok(UpsertOutcome::Conflict {
                remote_version: conv.version,
            });
        }
        // Utterances are immutable; a repeated upsert is acknowledged as is.
        if conv.log.iter().any(|(_, u)| u.id == utterance_id) {
            return Ok(UpsertOutcome::Ack {
                version: conv.version,
            });
        }
        conv.version += 1;
        conv.log.push((conv.version, payload.clone()));
        Ok(UpsertOutcome::Ack {
            version: conv.version,
        })
    }

    async fn delete(
        &self,
        conversation_id: &str,
        utterance_id: &str,
        base_version: u64,
    ) -> Result<UpsertOutcome, RemoteError> {
        self.before_write(conversation_id, utterance_id).await?;
        let mut map = self.conversations.lock().unwrap_or_else(|e| e.into_inner());
        let conv = map.entry(conversation_id.to_string()).or_default();
        if base_version < conv.version {
            return Ok(UpsertOutcome::Conflict {
                remote_version: conv.version,
            });
        }
        let before = conv.log.len();
        conv.log.retain(|(_, u)| u.id != utterance_id);
        if conv.log.len() != before {
            conv.version += 1;
        }
        Ok(UpsertOutcome::Ack {
            version: conv.version,
        })
    }

    async fn fetch(&self, conversation_id: &str, since_version: u64) -> Result<RemoteDelta, RemoteError> {
        let fault = self
            .fetch_faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        self.apply_fault(conversation_id, fault).await?;

        let map = self.conversations.lock().unwrap_or_else(|e| e.into_inner());
        Ok(map
            .get(conversation_id)
            .map(|c| RemoteDelta {
                version: c.version,
                utterances: c
                    .log
                    .iter()
                    .filter(|(v, _)| *v > since_version)
                    .map(|(_, u)| u.clone())
                    .collect(),
            })
            .unwrap_or_default())
    }
}
