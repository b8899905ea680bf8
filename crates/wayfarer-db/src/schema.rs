//! Conversation log model for the Wayfarer assistant

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Language tag recorded when detection could not settle on a language.
pub const UNDETERMINED_LANGUAGE: &str = "und";

/// Who produced an utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    User,
    Assistant,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

impl std::str::FromStr for Origin {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(format!("Unknown origin: {other}")),
        }
    }
}

/// One message in a conversation. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    pub id: String,
    pub conversation_id: String,
    pub text: String,
    pub detected_language: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub origin: Origin,
    /// The text in the assistant's working language, when `text` is in
    /// another language and a translation was available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_text: Option<String>,
}

impl Utterance {
    pub fn new(conversation_id: impl Into<String>, text: impl Into<String>, origin: Origin) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            text: text.into(),
            detected_language: None,
            timestamp: Utc::now(),
            origin,
            working_text: None,
        }
    }

    pub fn user(conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(conversation_id, text, Origin::User)
    }

    pub fn assistant(conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(conversation_id, text, Origin::Assistant)
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.detected_language = Some(language.into());
        self
    }

    pub fn with_working_text(mut self, working_text: impl Into<String>) -> Self {
        self.working_text = Some(working_text.into());
        self
    }

    /// What reply sources should see for this utterance.
    pub fn context_text(&self) -> &str {
        self.working_text.as_deref().unwrap_or(&self.text)
    }

    /// The detected language, unless detection was undetermined.
    pub fn determined_language(&self) -> Option<&str> {
        self.detected_language
            .as_deref()
            .filter(|l| !l.is_empty() && *l != UNDETERMINED_LANGUAGE)
    }
}

/// An utterance as held in the local log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredUtterance {
    pub utterance: Utterance,
    /// Position in the conversation's local write sequence (1-based).
    pub local_version: u64,
    pub synced: bool,
}

/// Marker left behind by a local delete so remote merges cannot resurrect it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub utterance_id: String,
    pub local_version: u64,
    pub synced: bool,
}

/// Per-conversation bookkeeping persisted next to the utterances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMeta {
    pub conversation_id: String,
    /// Established from the first user utterance with a determined language.
    pub language: Option<String>,
    pub local_version: u64,
    pub synced_version: u64,
    pub remote_version: u64,
    /// Local write versions not yet acknowledged by the remote store.
    pub pending_versions: Vec<u64>,
    pub tombstones: Vec<Tombstone>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationMeta {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            conversation_id: conversation_id.into(),
            language: None,
            local_version: 0,
            synced_version: 0,
            remote_version: 0,
            pending_versions: Vec::new(),
            tombstones: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_dirty(&self) -> bool {
        !self.pending_versions.is_empty()
    }

    pub fn is_tombstoned(&self, utterance_id: &str) -> bool {
        self.tombstones.iter().any(|t| t.utterance_id == utterance_id)
    }

    fn next_version(&mut self) -> u64 {
        self.local_version += 1;
        self.updated_at = Utc::now();
        self.local_version
    }

    /// Reserve the next version for a locally authored utterance.
    pub fn record_append(&mut self, utterance: &Utterance) -> u64 {
        if self.language.is_none() && utterance.origin == Origin::User {
            if let Some(lang) = utterance.determined_language() {
                self.language = Some(lang.to_string());
            }
        }
        let version = self.next_version();
        self.pending_versions.push(version);
        version
    }

    /// Reserve the next version for a delete. `removed` is the deleted
    /// utterance's `(local_version, synced)`.
    pub fn record_tombstone(&mut self, utterance_id: &str, removed: (u64, bool)) -> u64 {
        let (removed_version, removed_synced) = removed;
        if !removed_synced {
            self.pending_versions.retain(|v| *v != removed_version);
        }
        let version = self.next_version();
        self.tombstones.push(Tombstone {
            utterance_id: utterance_id.to_string(),
            local_version: version,
            // Never-synced utterances have nothing to delete remotely.
            synced: !removed_synced,
        });
        if removed_synced {
            self.pending_versions.push(version);
        }
        version
    }

    /// Acknowledge every local write up to and including `up_to`.
    pub fn mark_synced(&mut self, up_to: u64, remote_version: u64) {
        let up_to = up_to.min(self.local_version);
        self.pending_versions.retain(|v| *v > up_to);
        for tombstone in self.tombstones.iter_mut().filter(|t| t.local_version <= up_to) {
            tombstone.synced = true;
        }
        self.synced_version = self.synced_version.max(up_to);
        self.remote_version = self.remote_version.max(remote_version);
        self.updated_at = Utc::now();
    }

    /// Decide which remote utterances enter the local log. Skips ids already
    /// present, tombstoned ids, duplicates within the batch and utterances
    /// belonging to another conversation. Admitted utterances get fresh local
    /// versions and are already synced.
    pub fn admit_remote(
        &mut self,
        existing_ids: &HashSet<String>,
        remote: Vec<Utterance>,
    ) -> Vec<StoredUtterance> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut admitted = Vec::new();
        for utterance in remote {
            if utterance.conversation_id != self.conversation_id
                || existing_ids.contains(&utterance.id)
                || self.is_tombstoned(&utterance.id)
                || !seen.insert(utterance.id.clone())
            {
                continue;
            }
            if self.language.is_none() && utterance.origin == Origin::User {
                if let Some(lang) = utterance.determined_language() {
                    self.language = Some(lang.to_string());
                }
            }
            let local_version = self.next_version();
            admitted.push(StoredUtterance {
                utterance,
                local_version,
                synced: true,
            });
        }
        // Remote content never becomes a pending local write.
        if self.pending_versions.is_empty() {
            self.synced_version = self.local_version;
        }
        admitted
    }
}

/// Full view of a conversation: metadata plus its ordered utterances.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub language: Option<String>,
    pub utterances: Vec<StoredUtterance>,
    pub local_version: u64,
    pub synced_version: u64,
    pub remote_version: u64,
    pub dirty: bool,
    pub tombstones: Vec<Tombstone>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn from_parts(meta: ConversationMeta, mut utterances: Vec<StoredUtterance>) -> Self {
        utterances.sort_by_key(|u| u.local_version);
        Self {
            dirty: meta.is_dirty(),
            id: meta.conversation_id,
            language: meta.language,
            utterances,
            local_version: meta.local_version,
            synced_version: meta.synced_version,
            remote_version: meta.remote_version,
            tombstones: meta.tombstones,
            created_at: meta.created_at,
            updated_at: meta.updated_at,
        }
    }

    pub fn contains(&self, utterance_id: &str) -> bool {
        self.utterances.iter().any(|u| u.utterance.id == utterance_id)
    }

    pub fn messages(&self) -> impl Iterator<Item = &Utterance> {
        self.utterances.iter().map(|u| &u.utterance)
    }

    /// Utterances not yet acknowledged by the remote store, oldest first.
    pub fn unsynced(&self) -> impl Iterator<Item = &StoredUtterance> {
        self.utterances.iter().filter(|u| !u.synced)
    }

    /// Deletes not yet propagated to the remote store, oldest first.
    pub fn pending_tombstones(&self) -> impl Iterator<Item = &Tombstone> {
        self.tombstones.iter().filter(|t| !t.synced)
    }
}

/// Row returned by `list_conversations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub language: Option<String>,
    pub utterance_count: usize,
    pub dirty: bool,
    pub updated_at: DateTime<Utc>,
}

impl ConversationSummary {
    pub fn from_meta(meta: &ConversationMeta, utterance_count: usize) -> Self {
        Self {
            id: meta.conversation_id.clone(),
            language: meta.language.clone(),
            utterance_count,
            dirty: meta.is_dirty(),
            updated_at: meta.updated_at,
        }
    }
}

/// Conversation ids are used as record keys; keep them to a safe alphabet.
pub fn validate_conversation_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
