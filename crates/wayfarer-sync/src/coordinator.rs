//! Reconciles local conversation logs with the remote document store.
//!
//! Each conversation is pushed in local-version order: an operation is only
//! attempted once every earlier one was acknowledged. A transient failure
//! stops the cycle and leaves the remaining operations pending; the retry is
//! scheduled with exponential backoff. A permanent rejection blocks the
//! conversation until the user resolves it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wayfarer_core::config::SyncConfig;
use wayfarer_core::{AssistantStatus, StatusSender, SyncNotifier};
use wayfarer_db::{ConversationStore, StoreError};

use crate::backoff::Backoff;
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::remote::{RemoteDelta, RemoteStore, UpsertOutcome};
use crate::state::{pending_operations, OpKind, PendingOp, SyncRecord, SyncState};

/// Passes `sync_now` makes when writes land during a cycle.
const MAX_PASSES: usize = 3;

type Records = Arc<Mutex<HashMap<String, SyncRecord>>>;

fn lock(records: &Records) -> MutexGuard<'_, HashMap<String, SyncRecord>> {
    records.lock().unwrap_or_else(|e| e.into_inner())
}

/// Result of one sync cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Every local write was acknowledged and remote changes were merged.
    Synced {
        remote_version: u64,
        pushed: usize,
        pulled: usize,
    },
    /// A transient failure stopped the cycle; retry after `delay`.
    Retrying {
        attempt: u32,
        delay: Duration,
        error: String,
    },
    /// The remote store rejected an operation permanently.
    Blocked { reason: String },
    /// Another cycle for this conversation is running; it will pick up the new work.
    InFlight,
    /// Still inside the backoff window.
    Deferred { remaining: Duration },
    /// Nothing exists locally or remotely.
    Idle,
    /// New local writes arrived while the cycle ran.
    MoreWork,
}

enum Failure {
    Transient(String),
    Rejected(String),
}

impl From<RemoteError> for Failure {
    fn from(e: RemoteError) -> Self {
        if e.is_retriable() {
            Failure::Transient(e.to_string())
        } else {
            Failure::Rejected(e.to_string())
        }
    }
}

impl From<StoreError> for Failure {
    fn from(e: StoreError) -> Self {
        Failure::Transient(format!("local store: {e}"))
    }
}

struct CycleReport {
    remote_version: u64,
    pushed: usize,
    pulled: usize,
    exists: bool,
}

/// Cheap handle the orchestrator uses to announce committed turns.
#[derive(Clone)]
pub struct SyncHandle {
    records: Records,
    tx: mpsc::UnboundedSender<String>,
}

impl SyncNotifier for SyncHandle {
    fn notify(&self, conversation_id: &str) {
        mark_dirty(&self.records, conversation_id);
        let _ = self.tx.send(conversation_id.to_string());
    }
}

fn mark_dirty(records: &Records, conversation_id: &str) {
    let mut records = lock(records);
    let record = records
        .entry(conversation_id.to_string())
        .or_insert_with(|| SyncRecord::new(conversation_id, SyncState::Dirty));
    match record.state {
        SyncState::Clean => {
            let _ = record.transition(SyncState::Dirty);
        }
        SyncState::Syncing => record.rerun = true,
        SyncState::Dirty | SyncState::Blocked => {}
    }
}

pub struct SyncCoordinator {
    store: Arc<dyn ConversationStore>,
    remote: Arc<dyn RemoteStore>,
    status_tx: StatusSender,
    backoff: Backoff,
    push_timeout: Duration,
    sweep_interval: Duration,
    max_conflict_rounds: u32,
    records: Records,
    notify_tx: mpsc::UnboundedSender<String>,
    notify_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl SyncCoordinator {
    pub fn new(
        config: &SyncConfig,
        store: Arc<dyn ConversationStore>,
        remote: Arc<dyn RemoteStore>,
        status_tx: StatusSender,
    ) -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Self {
            store,
            remote,
            status_tx,
            backoff: Backoff::from_config(config),
            push_timeout: config.push_timeout(),
            sweep_interval: config.sweep_interval(),
            max_conflict_rounds: config.max_conflict_rounds,
            records: Arc::new(Mutex::new(HashMap::new())),
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn handle(&self) -> SyncHandle {
        SyncHandle {
            records: self.records.clone(),
            tx: self.notify_tx.clone(),
        }
    }

    fn emit(&self, status: AssistantStatus) {
        tracing::debug!(conversation = status.conversation_id(), "Sync status: {}", status.label());
        let _ = self.status_tx.send(status);
    }

    /// Current state of a conversation. Conversations the coordinator has not
    /// touched since startup report what the store says.
    pub async fn state(&self, conversation_id: &str) -> SyncResult<SyncState> {
        let tracked = lock(&self.records).get(conversation_id).map(|r| r.state);
        if let Some(state) = tracked {
            return Ok(state);
        }
        match self.store.read(conversation_id).await {
            Ok(conversation) if conversation.dirty => Ok(SyncState::Dirty),
            Ok(_) | Err(StoreError::NotFound(_)) => Ok(SyncState::Clean),
            Err(e) => Err(e.into()),
        }
    }

    /// Last error recorded for a conversation that is retrying or blocked.
    pub fn last_error(&self, conversation_id: &str) -> Option<String> {
        lock(&self.records)
            .get(conversation_id)
            .and_then(|r| r.last_error.clone())
    }

    /// Run one cycle now, ignoring any backoff window. Repeats while writes
    /// keep landing during the cycle, up to a few passes.
    pub async fn sync_now(&self, conversation_id: &str) -> SyncResult<SyncOutcome> {
        let mut outcome = SyncOutcome::MoreWork;
        for _ in 0..MAX_PASSES {
            outcome = self.sync_conversation(conversation_id, true).await?;
            if outcome != SyncOutcome::MoreWork {
                break;
            }
        }
        Ok(outcome)
    }

    /// Sync every conversation with unacknowledged writes.
    pub async fn sync_all(&self) -> SyncResult<Vec<(String, SyncResult<SyncOutcome>)>> {
        let dirty = self.store.list_dirty().await?;
        let mut results = Vec::with_capacity(dirty.len());
        for conversation_id in dirty {
            let outcome = self.sync_now(&conversation_id).await;
            results.push((conversation_id, outcome));
        }
        Ok(results)
    }

    /// Run a single sync cycle. Without `force`, a conversation inside its
    /// backoff window is left alone.
    pub async fn sync_conversation(&self, conversation_id: &str, force: bool) -> SyncResult<SyncOutcome> {
        if let Some(outcome) = self.begin(conversation_id, force)? {
            return Ok(outcome);
        }

        let result = self.cycle(conversation_id).await;
        let still_dirty = match &result {
            Ok(_) => match self.store.read(conversation_id).await {
                Ok(conversation) => conversation.dirty,
                Err(StoreError::NotFound(_)) => false,
                Err(e) => {
                    tracing::warn!(conversation = conversation_id, "Re-read after sync failed: {e}");
                    true
                }
            },
            Err(_) => false,
        };

        let mut records = lock(&self.records);
        let record = records
            .entry(conversation_id.to_string())
            .or_insert_with(|| SyncRecord::new(conversation_id, SyncState::Syncing));

        match result {
            Ok(report) if record.rerun || still_dirty => {
                record.transition(SyncState::Dirty)?;
                record.rerun = false;
                record.attempt = 0;
                record.next_attempt = None;
                record.last_error = None;
                tracing::debug!(
                    conversation = conversation_id,
                    pushed = report.pushed,
                    "New writes during sync, going again"
                );
                Ok(SyncOutcome::MoreWork)
            }
            Ok(report) => {
                record.transition(SyncState::Clean)?;
                records.remove(conversation_id);
                drop(records);
                if !report.exists {
                    return Ok(SyncOutcome::Idle);
                }
                tracing::info!(
                    conversation = conversation_id,
                    pushed = report.pushed,
                    pulled = report.pulled,
                    remote_version = report.remote_version,
                    "Conversation synced"
                );
                self.emit(AssistantStatus::Synced {
                    conversation_id: conversation_id.to_string(),
                    remote_version: report.remote_version,
                });
                Ok(SyncOutcome::Synced {
                    remote_version: report.remote_version,
                    pushed: report.pushed,
                    pulled: report.pulled,
                })
            }
            Err(Failure::Transient(error)) => {
                record.transition(SyncState::Dirty)?;
                record.rerun = false;
                record.attempt = record.attempt.saturating_add(1);
                let attempt = record.attempt;
                let delay = self.backoff.delay(attempt);
                record.next_attempt = Some(Instant::now() + delay);
                record.last_error = Some(error.clone());
                drop(records);
                tracing::warn!(
                    conversation = conversation_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Sync failed, will retry: {error}"
                );
                self.emit(AssistantStatus::SyncRetrying {
                    conversation_id: conversation_id.to_string(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    error: error.clone(),
                });
                Ok(SyncOutcome::Retrying {
                    attempt,
                    delay,
                    error,
                })
            }
            Err(Failure::Rejected(reason)) => {
                record.transition(SyncState::Blocked)?;
                record.rerun = false;
                record.next_attempt = None;
                record.last_error = Some(reason.clone());
                drop(records);
                tracing::error!(conversation = conversation_id, "Sync blocked: {reason}");
                self.emit(AssistantStatus::SyncBlocked {
                    conversation_id: conversation_id.to_string(),
                    reason: reason.clone(),
                });
                Ok(SyncOutcome::Blocked { reason })
            }
        }
    }

    /// Claim the conversation for a cycle, or say why not.
    fn begin(&self, conversation_id: &str, force: bool) -> SyncResult<Option<SyncOutcome>> {
        let mut records = lock(&self.records);
        let record = records
            .entry(conversation_id.to_string())
            .or_insert_with(|| SyncRecord::new(conversation_id, SyncState::Clean));
        match record.state {
            SyncState::Syncing => {
                record.rerun = true;
                return Ok(Some(SyncOutcome::InFlight));
            }
            SyncState::Blocked => {
                return Err(SyncError::Blocked {
                    conversation_id: conversation_id.to_string(),
                    reason: record.last_error.clone().unwrap_or_default(),
                });
            }
            SyncState::Clean | SyncState::Dirty => {}
        }
        if !force {
            if let Some(at) = record.next_attempt {
                let now = Instant::now();
                if at > now {
                    return Ok(Some(SyncOutcome::Deferred {
                        remaining: at - now,
                    }));
                }
            }
        }
        record.transition(SyncState::Syncing)?;
        record.rerun = false;
        Ok(None)
    }

    async fn cycle(&self, conversation_id: &str) -> Result<CycleReport, Failure> {
        let snapshot = match self.store.read(conversation_id).await {
            Ok(conversation) => Some(conversation),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        let exists_locally = snapshot.is_some();
        let mut base = snapshot.as_ref().map_or(0, |c| c.remote_version);
        let mut queue = snapshot.as_ref().map(pending_operations).unwrap_or_default();
        let mut pushed = 0;
        let mut pulled = 0;

        while let Some(op) = queue.front() {
            let mut rounds = 0;
            loop {
                match self.push(conversation_id, op, base).await? {
                    UpsertOutcome::Ack { version } => {
                        self.store
                            .mark_synced(conversation_id, op.local_version, version)
                            .await?;
                        base = base.max(version);
                        pushed += 1;
                        break;
                    }
                    UpsertOutcome::Conflict { remote_version } => {
                        rounds += 1;
                        if rounds > self.max_conflict_rounds {
                            return Err(Failure::Transient(format!(
                                "conflict on {} unresolved after {} rounds",
                                op.utterance_id, self.max_conflict_rounds
                            )));
                        }
                        tracing::debug!(
                            conversation = conversation_id,
                            base,
                            remote_version,
                            "Remote moved ahead, merging before replay"
                        );
                        let delta = self.fetch(conversation_id, base).await?;
                        pulled += self.merge(conversation_id, delta.utterances, delta.version.max(remote_version)).await?;
                        base = base.max(delta.version).max(remote_version);
                    }
                }
            }
            queue.pop_front();
        }

        let delta = self.fetch(conversation_id, base).await?;
        let exists = exists_locally || !delta.utterances.is_empty();
        if exists && (!delta.utterances.is_empty() || delta.version > base) {
            pulled += self.merge(conversation_id, delta.utterances, delta.version).await?;
        }
        base = base.max(delta.version);

        Ok(CycleReport {
            remote_version: base,
            pushed,
            pulled,
            exists,
        })
    }

    async fn merge(
        &self,
        conversation_id: &str,
        utterances: Vec<wayfarer_db::Utterance>,
        remote_version: u64,
    ) -> Result<usize, Failure> {
        let added = self
            .store
            .merge_remote(conversation_id, utterances, remote_version)
            .await?;
        if added > 0 {
            tracing::info!(conversation = conversation_id, added, "Merged remote utterances");
        }
        Ok(added)
    }

    async fn push(&self, conversation_id: &str, op: &PendingOp, base: u64) -> Result<UpsertOutcome, RemoteError> {
        let call = async {
            match (op.kind, &op.payload) {
                (OpKind::Upsert, Some(payload)) => {
                    self.remote
                        .upsert(conversation_id, &op.utterance_id, payload, base)
                        .await
                }
                (OpKind::Upsert, None) => Err(RemoteError::Rejected(format!(
                    "upsert of {} has no payload",
                    op.utterance_id
                ))),
                (OpKind::Delete, _) => {
                    self.remote
                        .delete(conversation_id, &op.utterance_id, base)
                        .await
                }
            }
        };
        tokio::time::timeout(self.push_timeout, call)
            .await
            .map_err(|_| RemoteError::Timeout(self.push_timeout))?
    }

    async fn fetch(&self, conversation_id: &str, since: u64) -> Result<RemoteDelta, RemoteError> {
        tokio::time::timeout(self.push_timeout, self.remote.fetch(conversation_id, since))
            .await
            .map_err(|_| RemoteError::Timeout(self.push_timeout))?
    }

    fn require_blocked(&self, conversation_id: &str) -> SyncResult<()> {
        let state = lock(&self.records)
            .get(conversation_id)
            .map_or(SyncState::Clean, |r| r.state);
        if state == SyncState::Blocked {
            Ok(())
        } else {
            Err(SyncError::InvalidTransition {
                from: state,
                to: SyncState::Dirty,
            })
        }
    }

    fn unblock(&self, conversation_id: &str) -> SyncResult<()> {
        {
            let mut records = lock(&self.records);
            if let Some(record) = records.get_mut(conversation_id) {
                record.transition(SyncState::Dirty)?;
                record.attempt = 0;
                record.next_attempt = None;
                record.last_error = None;
            }
        }
        let _ = self.notify_tx.send(conversation_id.to_string());
        Ok(())
    }

    /// User asked to try a blocked conversation again as is.
    pub fn retry_blocked(&self, conversation_id: &str) -> SyncResult<()> {
        self.require_blocked(conversation_id)?;
        tracing::info!(conversation = conversation_id, "Retrying blocked conversation");
        self.unblock(conversation_id)
    }

    /// User gave up on the rejected operation: treat the head of the queue as
    /// settled and resume with the rest. Returns the skipped utterance id.
    pub async fn skip_blocked_operation(&self, conversation_id: &str) -> SyncResult<Option<String>> {
        self.require_blocked(conversation_id)?;
        let conversation = self.store.read(conversation_id).await?;
        let skipped = pending_operations(&conversation).pop_front();
        if let Some(op) = &skipped {
            self.store
                .mark_synced(conversation_id, op.local_version, conversation.remote_version)
                .await?;
            tracing::warn!(
                conversation = conversation_id,
                utterance = %op.utterance_id,
                "Skipped rejected operation"
            );
        }
        self.unblock(conversation_id)?;
        Ok(skipped.map(|op| op.utterance_id))
    }

    /// Background loop: cycles conversations as turns are committed and
    /// sweeps the store for dirty conversations (including those left over
    /// from a previous run). Stops when `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let receiver = self
            .notify_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut rx) = receiver else {
            tracing::warn!("Sync coordinator is already running");
            return;
        };

        tracing::info!(sweep_secs = self.sweep_interval.as_secs(), "Sync coordinator started");
        let mut sweep = tokio::time::interval(self.sweep_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(conversation_id) = rx.recv() => {
                    self.spawn_cycle(conversation_id, &cancel);
                }
                _ = sweep.tick() => {
                    match self.store.list_dirty().await {
                        Ok(ids) => {
                            for conversation_id in ids {
                                self.spawn_cycle(conversation_id, &cancel);
                            }
                        }
                        Err(e) => tracing::warn!("Dirty sweep failed: {e}"),
                    }
                }
            }
        }
        tracing::info!("Sync coordinator stopped");
    }

    fn spawn_cycle(self: &Arc<Self>, conversation_id: String, cancel: &CancellationToken) {
        let this = Arc::clone(self);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match this.sync_conversation(&conversation_id, false).await {
                Ok(SyncOutcome::Retrying { delay, .. }) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            let _ = this.notify_tx.send(conversation_id);
                        }
                    }
                }
                Ok(SyncOutcome::MoreWork) => {
                    let _ = this.notify_tx.send(conversation_id);
                }
                Ok(_) => {}
                Err(SyncError::Blocked { .. }) => {}
                Err(e) => tracing::warn!(conversation = %conversation_id, "Sync cycle error: {e}"),
            }
        });
    }
}
