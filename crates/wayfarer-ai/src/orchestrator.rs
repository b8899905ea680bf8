use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use wayfarer_core::config::AssistantConfig;
use wayfarer_core::interfaces::{AssistantStatus, StatusReceiver, StatusSender, SyncNotifier};
use wayfarer_core::NoopNotifier;
use wayfarer_db::schema::validate_conversation_id;
use wayfarer_db::{Conversation, ConversationStore, StoreError, StoredUtterance, Utterance};

use crate::error::{AssistantError, AssistantResult};
use crate::language::{Detection, LanguageIdentifier};
use crate::source::ReplySource;
use crate::translate::Translator;
use crate::types::{CandidateSource, ConversationContext, ReplyCandidate, TranslationResult};

/// Reply used when the generative call failed and no suggestion matched.
pub const FALLBACK_REPLY: &str = "I couldn't find an exact match. Try asking more specifically (e.g., 'best cafes near city center' or 'budget hostels with wifi').";

/// Backoff applied after a rate-limit response without `Retry-After`.
const DEFAULT_RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(30);

/// Result of one handled user utterance.
#[derive(Debug, Clone)]
pub struct AssistantTurn {
    pub conversation_id: String,
    pub user: Utterance,
    pub reply: Utterance,
    pub source: CandidateSource,
    pub degraded: bool,
    pub degraded_reason: Option<String>,
    /// Local suggestions computed for this turn, best first.
    pub suggestions: Vec<ReplyCandidate>,
    /// Translation of the user text into the working language, if any.
    pub translation: Option<TranslationResult>,
    pub user_version: u64,
    pub reply_version: u64,
}

/// Why the generative reply was not used for a turn.
#[derive(Debug)]
enum Fallback {
    Disabled,
    Backoff(Duration),
    Timeout(Duration),
    Cancelled,
    Failed(AssistantError),
}

impl std::fmt::Display for Fallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "generative replies disabled"),
            Self::Backoff(left) => write!(f, "rate limited, retrying in {}s", left.as_secs()),
            Self::Timeout(d) => write!(f, "generative reply timed out after {}ms", d.as_millis()),
            Self::Cancelled => write!(f, "turn cancelled"),
            Self::Failed(e) => write!(f, "{e}"),
        }
    }
}

/// Sequences detection, translation, reply sources and persistence for each
/// incoming utterance, and exposes the assistant to the UI layer.
pub struct Orchestrator {
    store: Arc<dyn ConversationStore>,
    detector: Arc<dyn LanguageIdentifier>,
    local: Arc<dyn ReplySource>,
    remote: Option<Arc<dyn ReplySource>>,
    translator: Option<Arc<Translator>>,
    notifier: Arc<dyn SyncNotifier>,
    status_tx: StatusSender,
    working_language: String,
    context_window: usize,
    max_suggestions: usize,
    generative_timeout: Duration,
    rate_limited_until: Mutex<Option<Instant>>,
}

impl Orchestrator {
    pub fn new(
        config: &AssistantConfig,
        store: Arc<dyn ConversationStore>,
        detector: Arc<dyn LanguageIdentifier>,
        local: Arc<dyn ReplySource>,
        status_tx: StatusSender,
    ) -> Self {
        Self {
            store,
            detector,
            local,
            remote: None,
            translator: None,
            notifier: Arc::new(NoopNotifier),
            status_tx,
            working_language: config.working_language.to_lowercase(),
            context_window: config.context_window.max(1),
            max_suggestions: config.max_suggestions.max(1),
            generative_timeout: config.generative_timeout(),
            rate_limited_until: Mutex::new(None),
        }
    }

    pub fn with_generative(mut self, remote: Arc<dyn ReplySource>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_translator(mut self, translator: Arc<Translator>) -> Self {
        self.translator = Some(translator);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn SyncNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn subscribe(&self) -> StatusReceiver {
        self.status_tx.subscribe()
    }

    fn emit(&self, status: AssistantStatus) {
        // No subscribers is not an error.
        let _ = self.status_tx.send(status);
    }

    pub async fn handle_utterance(
        &self,
        conversation_id: &str,
        raw_text: &str,
    ) -> AssistantResult<AssistantTurn> {
        self.handle_utterance_with_cancel(conversation_id, raw_text, CancellationToken::new())
            .await
    }

    /// Handle one user utterance. Cancelling `cancel` abandons the generative
    /// call; the turn still completes with a local reply.
    pub async fn handle_utterance_with_cancel(
        &self,
        conversation_id: &str,
        raw_text: &str,
        cancel: CancellationToken,
    ) -> AssistantResult<AssistantTurn> {
        let text = raw_text.trim();
        if text.is_empty() {
            return Err(AssistantError::InvalidInput("utterance text is empty".into()));
        }
        if !validate_conversation_id(conversation_id) {
            return Err(AssistantError::InvalidInput(format!(
                "invalid conversation id: {conversation_id}"
            )));
        }
        self.emit(AssistantStatus::Sending {
            conversation_id: conversation_id.to_string(),
        });

        let detection = match self.detector.detect(text) {
            Ok(d) => d,
            Err(AssistantError::UnsupportedInput(reason)) => {
                tracing::debug!("Language detection skipped: {reason}");
                Detection::undetermined(0.0)
            }
            Err(e) => return Err(e),
        };

        let conversation = self.load_conversation(conversation_id).await?;
        let history = conversation
            .as_ref()
            .map(|c| {
                // The current prompt takes the last slot of the window.
                let skip = c.utterances.len().saturating_sub(self.context_window - 1);
                c.utterances[skip..].to_vec()
            })
            .unwrap_or_default();
        let reply_language = conversation
            .as_ref()
            .and_then(|c| c.language.clone())
            .or_else(|| detection.is_determined().then(|| detection.language.clone()))
            .unwrap_or_else(|| self.working_language.clone());

        // Reply sources work in the working language.
        let mut translation = None;
        let mut prompt = text.to_string();
        if detection.is_determined() && detection.language != self.working_language {
            if let Some(result) = self
                .try_translate(text, &detection.language, &self.working_language)
                .await
            {
                prompt = result.translated_text.clone();
                translation = Some(result);
            }
        }

        let history = self.render_history(history).await;
        let context = ConversationContext::from_history(&history, &prompt, self.context_window);
        let (local, remote) = tokio::join!(
            self.local.candidates(&context, self.max_suggestions),
            self.remote_reply(&context, &cancel),
        );
        let suggestions = local.unwrap_or_else(|e| {
            tracing::warn!("Reply suggester failed: {e}");
            Vec::new()
        });

        let (chosen, fallback) = match remote {
            Ok(candidate) => (candidate, None),
            Err(reason) => {
                let best = suggestions.first().cloned().unwrap_or_else(|| {
                    ReplyCandidate::new(FALLBACK_REPLY, CandidateSource::Suggester, 0.0)
                });
                (best, Some(reason))
            }
        };
        let degraded_reason = match &fallback {
            None | Some(Fallback::Disabled) => None,
            Some(reason) => Some(reason.to_string()),
        };

        let mut reply_text = chosen.text.clone();
        let mut reply_tag = self.working_language.clone();
        if reply_language != self.working_language {
            if let Some(result) = self
                .try_translate(&chosen.text, &self.working_language, &reply_language)
                .await
            {
                reply_text = result.translated_text;
                reply_tag = reply_language.clone();
            }
        }

        let mut user = Utterance::user(conversation_id, text).with_language(detection.language.clone());
        if translation.is_some() {
            user = user.with_working_text(prompt.clone());
        }
        let translated_reply = reply_tag != self.working_language;
        let mut reply = Utterance::assistant(conversation_id, reply_text).with_language(reply_tag);
        if translated_reply {
            reply = reply.with_working_text(chosen.text.clone());
        }
        // The turn counts only once both utterances land together.
        let (user_version, reply_version) = self
            .store
            .append_turn(conversation_id, user.clone(), reply.clone())
            .await?;

        if let Some(reason) = &degraded_reason {
            tracing::warn!(conversation_id, "Degraded turn: {reason}");
            self.emit(AssistantStatus::Degraded {
                conversation_id: conversation_id.to_string(),
                reason: reason.clone(),
            });
        }
        self.notifier.notify(conversation_id);

        tracing::info!(
            conversation_id,
            language = %detection.language,
            source = %chosen.source,
            degraded = degraded_reason.is_some(),
            "Turn complete"
        );
        Ok(AssistantTurn {
            conversation_id: conversation_id.to_string(),
            user,
            reply,
            source: chosen.source,
            degraded: degraded_reason.is_some(),
            degraded_reason,
            suggestions,
            translation,
            user_version,
            reply_version,
        })
    }

    async fn load_conversation(&self, conversation_id: &str) -> AssistantResult<Option<Conversation>> {
        match self.store.read(conversation_id).await {
            Ok(c) => Ok(Some(c)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Give every history turn a working-language rendering. Turns stored
    /// before renderings were kept are translated now when possible.
    async fn render_history(&self, mut history: Vec<StoredUtterance>) -> Vec<StoredUtterance> {
        for stored in &mut history {
            let utterance = &mut stored.utterance;
            if utterance.working_text.is_some() {
                continue;
            }
            let Some(language) = utterance.determined_language().map(str::to_string) else {
                continue;
            };
            if language == self.working_language {
                continue;
            }
            if let Some(result) = self
                .try_translate(&utterance.text, &language, &self.working_language)
                .await
            {
                utterance.working_text = Some(result.translated_text);
            }
        }
        history
    }

    async fn try_translate(&self, text: &str, from: &str, to: &str) -> Option<TranslationResult> {
        let translator = self.translator.as_ref()?;
        match translator.translate(text, from, to).await {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::warn!("Translation {from}->{to} failed, using original text: {e}");
                None
            }
        }
    }

    fn backoff_remaining(&self) -> Option<Duration> {
        let mut guard = self.rate_limited_until.lock().unwrap_or_else(|e| e.into_inner());
        match *guard {
            Some(until) => {
                let now = Instant::now();
                if until > now {
                    Some(until - now)
                } else {
                    *guard = None;
                    None
                }
            }
            None => None,
        }
    }

    fn open_backoff(&self, retry_after: Option<Duration>) {
        let window = retry_after.unwrap_or(DEFAULT_RATE_LIMIT_BACKOFF);
        let mut guard = self.rate_limited_until.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(Instant::now() + window);
    }

    async fn remote_reply(
        &self,
        context: &ConversationContext,
        cancel: &CancellationToken,
    ) -> Result<ReplyCandidate, Fallback> {
        let remote = self.remote.as_ref().ok_or(Fallback::Disabled)?;
        if let Some(left) = self.backoff_remaining() {
            return Err(Fallback::Backoff(left));
        }

        let call = tokio::time::timeout(self.generative_timeout, remote.candidates(context, 1));
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(Fallback::Cancelled),
            outcome = call => outcome,
        };
        match outcome {
            Err(_) => Err(Fallback::Timeout(self.generative_timeout)),
            Ok(Err(AssistantError::RateLimited { retry_after })) => {
                self.open_backoff(retry_after);
                Err(Fallback::Failed(AssistantError::RateLimited { retry_after }))
            }
            Ok(Err(e)) => Err(Fallback::Failed(e)),
            Ok(Ok(candidates)) => candidates.into_iter().next().ok_or_else(|| {
                Fallback::Failed(AssistantError::InvalidResponse("no candidates".into()))
            }),
        }
    }

    pub async fn read_conversation(&self, conversation_id: &str) -> AssistantResult<Conversation> {
        Ok(self.store.read(conversation_id).await?)
    }

    /// Explicit user deletion. Leaves a tombstone and schedules sync.
    pub async fn delete_utterance(&self, conversation_id: &str, utterance_id: &str) -> AssistantResult<u64> {
        let version = self.store.delete_utterance(conversation_id, utterance_id).await?;
        self.notifier.notify(conversation_id);
        Ok(version)
    }
}
