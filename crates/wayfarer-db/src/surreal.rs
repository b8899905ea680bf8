use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::engine::local::{Db, Mem, RocksDb};
use surrealdb::sql::Thing;
use surrealdb::Surreal;

use crate::error::{StoreError, StoreResult};
use crate::locks::ConversationLocks;
use crate::schema::{
    validate_conversation_id, Conversation, ConversationMeta, ConversationSummary, Origin,
    StoredUtterance, Utterance,
};
use crate::traits::ConversationStore;

/// Storage mode for SurrealDB
pub enum StorageMode {
    Memory,
    Persistent(String),
}

/// SurrealDB implementation of the ConversationStore trait
pub struct SurrealConversationStore {
    db: Surreal<Db>,
    locks: ConversationLocks,
}

impl SurrealConversationStore {
    /// Create a new store with the given storage mode.
    pub async fn new(mode: StorageMode) -> StoreResult<Self> {
        let db = match mode {
            StorageMode::Memory => Surreal::new::<Mem>(()).await?,
            StorageMode::Persistent(ref path) => Surreal::new::<RocksDb>(path).await?,
        };
        Ok(Self {
            db,
            locks: ConversationLocks::new(),
        })
    }

    async fn load_meta(&self, conversation_id: &str) -> StoreResult<Option<ConversationMeta>> {
        let meta: Option<ConversationMeta> =
            self.db.select(("conversation", conversation_id)).await?;
        Ok(meta)
    }

    async fn require_meta(&self, conversation_id: &str) -> StoreResult<ConversationMeta> {
        self.load_meta(conversation_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))
    }

    async fn find_utterance(
        &self,
        conversation_id: &str,
        utterance_id: &str,
    ) -> StoreResult<Option<UtteranceRecord>> {
        let mut result = self
            .db
            .query("SELECT * FROM utterance WHERE conversation_id = $cid AND utterance_id = $uid LIMIT 1")
            .bind(("cid", conversation_id.to_string()))
            .bind(("uid", utterance_id.to_string()))
            .await?;
        let rows: Vec<UtteranceRecord> = result.take(0)?;
        Ok(rows.into_iter().next())
    }

    async fn utterance_ids(&self, conversation_id: &str) -> StoreResult<HashSet<String>> {
        let mut result = self
            .db
            .query("SELECT utterance_id FROM utterance WHERE conversation_id = $cid")
            .bind(("cid", conversation_id.to_string()))
            .await?;
        let rows: Vec<IdRow> = result.take(0)?;
        Ok(rows.into_iter().map(|r| r.utterance_id).collect())
    }

    async fn save_meta(&self, meta: ConversationMeta) -> StoreResult<()> {
        let response = self
            .db
            .query("UPSERT type::thing('conversation', $cid) CONTENT $meta")
            .bind(("cid", meta.conversation_id.clone()))
            .bind(("meta", meta))
            .await?;
        response
            .check()
            .map_err(|e| StoreError::Persistence(e.to_string()))?;
        Ok(())
    }

    /// Append locally authored utterances in one transaction.
    async fn append_batch(
        &self,
        conversation_id: &str,
        utterances: Vec<Utterance>,
    ) -> StoreResult<Vec<u64>> {
        check_id(conversation_id)?;
        if let Some(stray) = utterances.iter().find(|u| u.conversation_id != conversation_id) {
            return Err(StoreError::InvalidId(format!(
                "Utterance belongs to {}, not {conversation_id}",
                stray.conversation_id
            )));
        }

        let _guard = self.locks.lock(conversation_id).await;
        let mut batch_ids = HashSet::new();
        for utterance in &utterances {
            if !batch_ids.insert(utterance.id.as_str())
                || self.find_utterance(conversation_id, &utterance.id).await?.is_some()
            {
                return Err(StoreError::Duplicate(utterance.id.clone()));
            }
        }
        let mut meta = self
            .load_meta(conversation_id)
            .await?
            .unwrap_or_else(|| ConversationMeta::new(conversation_id));
        let mut versions = Vec::with_capacity(utterances.len());
        let mut records = Vec::with_capacity(utterances.len());
        for utterance in utterances {
            let version = meta.record_append(&utterance);
            versions.push(version);
            records.push(UtteranceRecord::from(StoredUtterance {
                utterance,
                local_version: version,
                synced: false,
            }));
        }

        let response = self
            .db
            .query(
                "BEGIN TRANSACTION;
                 INSERT INTO utterance $records;
                 UPSERT type::thing('conversation', $cid) CONTENT $meta;
                 COMMIT TRANSACTION;",
            )
            .bind(("records", records))
            .bind(("cid", conversation_id.to_string()))
            .bind(("meta", meta))
            .await?;
        response
            .check()
            .map_err(|e| StoreError::Persistence(e.to_string()))?;

        tracing::debug!(conversation_id, ?versions, "Appended utterances");
        Ok(versions)
    }
}

fn check_id(conversation_id: &str) -> StoreResult<()> {
    if validate_conversation_id(conversation_id) {
        Ok(())
    } else {
        Err(StoreError::InvalidId(format!(
            "Conversation IDs must be 1-128 characters of [A-Za-z0-9_-], got: {conversation_id}"
        )))
    }
}

/// Row layout of the `utterance` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UtteranceRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<Thing>,
    utterance_id: String,
    conversation_id: String,
    text: String,
    detected_language: Option<String>,
    timestamp: DateTime<Utc>,
    origin: Origin,
    local_version: u64,
    synced: bool,
    #[serde(default)]
    working_text: Option<String>,
}

impl From<StoredUtterance> for UtteranceRecord {
    fn from(stored: StoredUtterance) -> Self {
        let StoredUtterance {
            utterance,
            local_version,
            synced,
        } = stored;
        Self {
            id: None,
            utterance_id: utterance.id,
            conversation_id: utterance.conversation_id,
            text: utterance.text,
            detected_language: utterance.detected_language,
            timestamp: utterance.timestamp,
            origin: utterance.origin,
            local_version,
            synced,
            working_text: utterance.working_text,
        }
    }
}

impl From<UtteranceRecord> for StoredUtterance {
    fn from(record: UtteranceRecord) -> Self {
        Self {
            utterance: Utterance {
                id: record.utterance_id,
                conversation_id: record.conversation_id,
                text: record.text,
                detected_language: record.detected_language,
                timestamp: record.timestamp,
                origin: record.origin,
                working_text: record.working_text,
            },
            local_version: record.local_version,
            synced: record.synced,
        }
    }
}

#[derive(Debug, Deserialize)]
struct IdRow {
    utterance_id: String,
}

#[derive(Debug, Deserialize)]
struct CountRow {
    conversation_id: String,
    total: usize,
}

#[async_trait]
impl ConversationStore for SurrealConversationStore {
    async fn connect(&self) -> StoreResult<()> {
        self.db
            .use_ns("wayfarer")
            .use_db("main")
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    async fn init_schema(&self) -> StoreResult<()> {
        let queries = [
            "DEFINE INDEX IF NOT EXISTS idx_utterance_conversation ON utterance FIELDS conversation_id",
            "DEFINE INDEX IF NOT EXISTS idx_utterance_version ON utterance FIELDS conversation_id, local_version UNIQUE",
            "DEFINE INDEX IF NOT EXISTS idx_utterance_key ON utterance FIELDS conversation_id, utterance_id UNIQUE",
            "DEFINE INDEX IF NOT EXISTS idx_conversation_updated ON conversation FIELDS updated_at",
        ];
        for q in queries {
            self.db
                .query(q)
                .await
                .and_then(|r| r.check())
                .map_err(|e| StoreError::SchemaInit(e.to_string()))?;
        }
        Ok(())
    }

    // ── Utterance log ───────────────────────────────────────

    async fn append(&self, conversation_id: &str, utterance: Utterance) -> StoreResult<u64> {
        let versions = self.append_batch(conversation_id, vec![utterance]).await?;
        versions
            .first()
            .copied()
            .ok_or_else(|| StoreError::Query("append assigned no version".into()))
    }

    async fn append_turn(
        &self,
        conversation_id: &str,
        user: Utterance,
        reply: Utterance,
    ) -> StoreResult<(u64, u64)> {
        let versions = self.append_batch(conversation_id, vec![user, reply]).await?;
        match versions.as_slice() {
            [user_version, reply_version] => Ok((*user_version, *reply_version)),
            _ => Err(StoreError::Query("turn append assigned wrong versions".into())),
        }
    }

    async fn read(&self, conversation_id: &str) -> StoreResult<Conversation> {
        check_id(conversation_id)?;
        let meta = self.require_meta(conversation_id).await?;
        let mut result = self
            .db
            .query("SELECT * FROM utterance WHERE conversation_id = $cid ORDER BY local_version ASC")
            .bind(("cid", conversation_id.to_string()))
            .await?;
        let rows: Vec<UtteranceRecord> = result.take(0)?;
        Ok(Conversation::from_parts(
            meta,
            rows.into_iter().map(StoredUtterance::from).collect(),
        ))
    }

    async fn recent(&self, conversation_id: &str, limit: usize) -> StoreResult<Vec<StoredUtterance>> {
        check_id(conversation_id)?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut result = self
            .db
            .query(format!(
                "SELECT * FROM utterance WHERE conversation_id = $cid ORDER BY local_version DESC LIMIT {limit}"
            ))
            .bind(("cid", conversation_id.to_string()))
            .await?;
        let rows: Vec<UtteranceRecord> = result.take(0)?;
        let mut recent: Vec<StoredUtterance> = rows.into_iter().map(StoredUtterance::from).collect();
        recent.reverse();
        Ok(recent)
    }

    async fn mark_synced(
        &self,
        conversation_id: &str,
        up_to: u64,
        remote_version: u64,
    ) -> StoreResult<()> {
        check_id(conversation_id)?;
        let _guard = self.locks.lock(conversation_id).await;
        let mut meta = self.require_meta(conversation_id).await?;
        meta.mark_synced(up_to, remote_version);

        let response = self
            .db
            .query(
                "BEGIN TRANSACTION;
                 UPDATE utterance SET synced = true WHERE conversation_id = $cid AND local_version <= $up_to;
                 UPSERT type::thing('conversation', $cid) CONTENT $meta;
                 COMMIT TRANSACTION;",
            )
            .bind(("cid", conversation_id.to_string()))
            .bind(("up_to", up_to))
            .bind(("meta", meta))
            .await?;
        response
            .check()
            .map_err(|e| StoreError::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn merge_remote(
        &self,
        conversation_id: &str,
        remote: Vec<Utterance>,
        remote_version: u64,
    ) -> StoreResult<usize> {
        check_id(conversation_id)?;
        let _guard = self.locks.lock(conversation_id).await;
        let mut meta = self
            .load_meta(conversation_id)
            .await?
            .unwrap_or_else(|| ConversationMeta::new(conversation_id));
        let existing = self.utterance_ids(conversation_id).await?;
        let admitted = meta.admit_remote(&existing, remote);
        meta.remote_version = meta.remote_version.max(remote_version);
        let added = admitted.len();

        if admitted.is_empty() {
            self.save_meta(meta).await?;
            return Ok(0);
        }

        let records: Vec<UtteranceRecord> = admitted.into_iter().map(UtteranceRecord::from).collect();
        let response = self
            .db
            .query(
                "BEGIN TRANSACTION;
                 INSERT INTO utterance $records;
                 UPSERT type::thing('conversation', $cid) CONTENT $meta;
                 COMMIT TRANSACTION;",
            )
            .bind(("records", records))
            .bind(("cid", conversation_id.to_string()))
            .bind(("meta", meta))
            .await?;
        response
            .check()
            .map_err(|e| StoreError::Persistence(e.to_string()))?;

        tracing::debug!(conversation_id, added, remote_version, "Merged remote utterances");
        Ok(added)
    }

    async fn delete_utterance(&self, conversation_id: &str, utterance_id: &str) -> StoreResult<u64> {
        check_id(conversation_id)?;
        let _guard = self.locks.lock(conversation_id).await;
        let mut meta = self.require_meta(conversation_id).await?;
        let record = self
            .find_utterance(conversation_id, utterance_id)
            .await?
            .ok_or_else(|| StoreError::UtteranceNotFound(utterance_id.to_string()))?;
        let version = meta.record_tombstone(utterance_id, (record.local_version, record.synced));

        let response = self
            .db
            .query(
                "BEGIN TRANSACTION;
                 DELETE utterance WHERE conversation_id = $cid AND utterance_id = $uid;
                 UPSERT type::thing('conversation', $cid) CONTENT $meta;
                 COMMIT TRANSACTION;",
            )
            .bind(("cid", conversation_id.to_string()))
            .bind(("uid", utterance_id.to_string()))
            .bind(("meta", meta))
            .await?;
        response
            .check()
            .map_err(|e| StoreError::Persistence(e.to_string()))?;
        Ok(version)
    }

    // ── Listing ─────────────────────────────────────────────

    async fn list_conversations(&self) -> StoreResult<Vec<ConversationSummary>> {
        let metas: Vec<ConversationMeta> = self.db.select("conversation").await?;
        let mut result = self
            .db
            .query("SELECT conversation_id, count() AS total FROM utterance GROUP BY conversation_id")
            .await?;
        let counts: Vec<CountRow> = result.take(0)?;
        let counts: HashMap<String, usize> = counts
            .into_iter()
            .map(|r| (r.conversation_id, r.total))
            .collect();

        let mut summaries: Vec<ConversationSummary> = metas
            .iter()
            .map(|m| {
                let count = counts.get(&m.conversation_id).copied().unwrap_or(0);
                ConversationSummary::from_meta(m, count)
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    async fn list_dirty(&self) -> StoreResult<Vec<String>> {
        let metas: Vec<ConversationMeta> = self.db.select("conversation").await?;
        let mut dirty: Vec<String> = metas
            .into_iter()
            .filter(ConversationMeta::is_dirty)
            .map(|m| m.conversation_id)
            .collect();
        dirty.sort();
        Ok(dirty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn setup_store() -> SurrealConversationStore {
        let store = SurrealConversationStore::new(StorageMode::Memory).await.unwrap();
        store.connect().await.unwrap();
        store.init_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let store = setup_store().await;
        let v1 = store
            .append("trip", Utterance::user("trip", "Where can I eat?").with_language("en"))
            .await
            .unwrap();
        let v2 = store
            .append("trip", Utterance::assistant("trip", "Try the market."))
            .await
            .unwrap();
        assert_eq!((v1, v2), (1, 2));

        let conv = store.read("trip").await.unwrap();
        assert_eq!(conv.utterances.len(), 2);
        assert_eq!(conv.utterances[0].utterance.text, "Where can I eat?");
        assert_eq!(conv.utterances[1].utterance.origin, Origin::Assistant);
        assert_eq!(conv.language.as_deref(), Some("en"));
        assert!(conv.dirty);
        assert_eq!(conv.unsynced().count(), 2);
    }

    #[tokio::test]
    async fn test_read_missing_conversation() {
        let store = setup_store().await;
        assert!(matches!(store.read("nope").await, Err(StoreError::NotFound(_))));
        assert!(store.recent("nope", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_rejects_bad_ids() {
        let store = setup_store().await;
        let err = store.append("a:b", Utterance::user("a:b", "x")).await;
        assert!(matches!(err, Err(StoreError::InvalidId(_))));
        let err = store.append("a", Utterance::user("b", "x")).await;
        assert!(matches!(err, Err(StoreError::InvalidId(_))));
    }

    #[tokio::test]
    async fn test_append_duplicate_id() {
        let store = setup_store().await;
        let u = Utterance::user("trip", "hello");
        store.append("trip", u.clone()).await.unwrap();
        let err = store.append("trip", u).await;
        assert!(matches!(err, Err(StoreError::Duplicate(_))));
        assert_eq!(store.read("trip").await.unwrap().utterances.len(), 1);
    }

    #[tokio::test]
    async fn test_append_turn_commits_both() {
        let store = setup_store().await;
        let user = Utterance::user("trip", "Any night markets?").with_language("en");
        let reply = Utterance::assistant("trip", "Try the riverside market.");
        let versions = store.append_turn("trip", user.clone(), reply.clone()).await.unwrap();
        assert_eq!(versions, (1, 2));

        let conv = store.read("trip").await.unwrap();
        let ids: Vec<&str> = conv.messages().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, [user.id.as_str(), reply.id.as_str()]);
        assert_eq!(conv.unsynced().count(), 2);
        assert_eq!(store.list_dirty().await.unwrap(), ["trip"]);
    }

    #[tokio::test]
    async fn test_append_turn_is_all_or_nothing() {
        let store = setup_store().await;
        let earlier = Utterance::assistant("trip", "Welcome!");
        store.append("trip", earlier.clone()).await.unwrap();

        // The reply collides with a stored id, so the user half must not land either.
        let user = Utterance::user("trip", "Where are budget hostels?");
        let err = store.append_turn("trip", user, earlier.clone()).await;
        assert!(matches!(err, Err(StoreError::Duplicate(_))));

        let conv = store.read("trip").await.unwrap();
        assert_eq!(conv.utterances.len(), 1);
        assert_eq!(conv.local_version, 1);

        let same = Utterance::user("trip", "twice");
        let err = store.append_turn("trip", same.clone(), same).await;
        assert!(matches!(err, Err(StoreError::Duplicate(_))));
        assert_eq!(store.read("trip").await.unwrap().utterances.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_get_distinct_increasing_versions() {
        let store = Arc::new(setup_store().await);
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append("busy", Utterance::user("busy", format!("message {i}")))
                    .await
                    .unwrap()
            }));
        }
        let mut versions = Vec::new();
        for h in handles {
            versions.push(h.await.unwrap());
        }
        versions.sort();
        assert_eq!(versions, (1..=16).collect::<Vec<u64>>());

        let conv = store.read("busy").await.unwrap();
        let stored: Vec<u64> = conv.utterances.iter().map(|u| u.local_version).collect();
        assert_eq!(stored, (1..=16).collect::<Vec<u64>>());
        assert_eq!(store.locks.active(), 0);
    }

    #[tokio::test]
    async fn test_recent_returns_tail_in_order() {
        let store = setup_store().await;
        for i in 0..5 {
            store
                .append("trip", Utterance::user("trip", format!("m{i}")))
                .await
                .unwrap();
        }
        let recent = store.recent("trip", 2).await.unwrap();
        let texts: Vec<&str> = recent.iter().map(|u| u.utterance.text.as_str()).collect();
        assert_eq!(texts, ["m3", "m4"]);
    }

    #[tokio::test]
    async fn test_mark_synced_prefix() {
        let store = setup_store().await;
        for text in ["a", "b", "c"] {
            store.append("trip", Utterance::user("trip", text)).await.unwrap();
        }
        store.mark_synced("trip", 2, 10).await.unwrap();

        let conv = store.read("trip").await.unwrap();
        let synced: Vec<bool> = conv.utterances.iter().map(|u| u.synced).collect();
        assert_eq!(synced, [true, true, false]);
        assert!(conv.dirty);
        assert_eq!(conv.remote_version, 10);
        assert_eq!(store.list_dirty().await.unwrap(), ["trip"]);

        store.mark_synced("trip", 3, 11).await.unwrap();
        assert!(!store.read("trip").await.unwrap().dirty);
        assert!(store.list_dirty().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_remote_unions_by_id() {
        let store = setup_store().await;
        let u1 = Utterance::user("trip", "u1");
        let u2 = Utterance::assistant("trip", "u2");
        let u3 = Utterance::assistant("trip", "u3");
        store.append("trip", u1.clone()).await.unwrap();
        store.append("trip", u2.clone()).await.unwrap();
        store.mark_synced("trip", 2, 2).await.unwrap();

        let added = store
            .merge_remote("trip", vec![u1.clone(), u3.clone()], 3)
            .await
            .unwrap();
        assert_eq!(added, 1);

        let conv = store.read("trip").await.unwrap();
        let ids: Vec<&str> = conv.messages().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, [u1.id.as_str(), u2.id.as_str(), u3.id.as_str()]);
        assert!(conv.utterances.iter().all(|u| u.synced));
        assert!(!conv.dirty);
        assert_eq!(conv.remote_version, 3);
    }

    #[tokio::test]
    async fn test_merge_remote_creates_unknown_conversation() {
        let store = setup_store().await;
        let added = store
            .merge_remote("fresh", vec![Utterance::user("fresh", "hola").with_language("es")], 1)
            .await
            .unwrap();
        assert_eq!(added, 1);
        let conv = store.read("fresh").await.unwrap();
        assert_eq!(conv.language.as_deref(), Some("es"));
        assert!(!conv.dirty);
    }

    #[tokio::test]
    async fn test_delete_leaves_tombstone() {
        let store = setup_store().await;
        let u = Utterance::user("trip", "mistake");
        store.append("trip", u.clone()).await.unwrap();
        store.mark_synced("trip", 1, 1).await.unwrap();

        let version = store.delete_utterance("trip", &u.id).await.unwrap();
        assert_eq!(version, 2);
        let conv = store.read("trip").await.unwrap();
        assert!(conv.utterances.is_empty());
        assert_eq!(conv.pending_tombstones().count(), 1);
        assert!(conv.dirty);

        // A later remote merge cannot bring it back.
        let added = store.merge_remote("trip", vec![u.clone()], 1).await.unwrap();
        assert_eq!(added, 0);

        let err = store.delete_utterance("trip", &u.id).await;
        assert!(matches!(err, Err(StoreError::UtteranceNotFound(_))));
    }

    #[tokio::test]
    async fn test_list_conversations() {
        let store = setup_store().await;
        store.append("one", Utterance::user("one", "a")).await.unwrap();
        store.append("two", Utterance::user("two", "b")).await.unwrap();
        store.append("two", Utterance::assistant("two", "c")).await.unwrap();

        let list = store.list_conversations().await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, "two");
        assert_eq!(list[0].utterance_count, 2);
        assert_eq!(list[1].utterance_count, 1);
        assert!(list.iter().all(|s| s.dirty));
    }

    #[tokio::test]
    async fn test_persistent_mode_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").to_string_lossy().to_string();
        let store = SurrealConversationStore::new(StorageMode::Persistent(path)).await.unwrap();
        store.connect().await.unwrap();
        store.init_schema().await.unwrap();
        store.append("trip", Utterance::user("trip", "saved")).await.unwrap();
        assert_eq!(store.read("trip").await.unwrap().utterances.len(), 1);
    }
}
