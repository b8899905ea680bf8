use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use wayfarer_ai::translate::LocalModelAssets;
use wayfarer_ai::{
    AssistantResult, CandidateSource, ConversationContext, HeuristicDetector, Orchestrator,
    ReplyCandidate, ReplySource, ReplySuggester, Translator,
};
use wayfarer_core::config::{AssistantConfig, TranslationConfig};
use wayfarer_core::interfaces::{status_channel, AssistantStatus, SyncNotifier};
use wayfarer_db::mock::MockConversationStore;
use wayfarer_db::{ConversationStore, Utterance};

/// Generative source that never answers.
struct Stalled {
    calls: AtomicUsize,
}

#[async_trait]
impl ReplySource for Stalled {
    fn kind(&self) -> CandidateSource {
        CandidateSource::Generative
    }

    async fn candidates(&self, _: &ConversationContext, _: usize) -> AssistantResult<Vec<ReplyCandidate>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

#[derive(Default)]
struct RecordingNotifier {
    notified: std::sync::Mutex<Vec<String>>,
}

impl SyncNotifier for RecordingNotifier {
    fn notify(&self, conversation_id: &str) {
        self.notified.lock().unwrap().push(conversation_id.to_string());
    }
}

fn config(timeout_ms: u64) -> AssistantConfig {
    AssistantConfig {
        generative_timeout_ms: timeout_ms,
        ..AssistantConfig::default()
    }
}

#[tokio::test]
async fn stalled_generative_yields_one_degraded_turn_per_utterance() {
    const TURNS: usize = 5;
    let timeout = Duration::from_millis(50);
    let store = Arc::new(MockConversationStore::new());
    let stalled = Arc::new(Stalled { calls: AtomicUsize::new(0) });
    let notifier = Arc::new(RecordingNotifier::default());
    let (tx, mut rx) = status_channel(64);

    let orchestrator = Orchestrator::new(
        &config(timeout.as_millis() as u64),
        store.clone(),
        Arc::new(HeuristicDetector::default()),
        Arc::new(ReplySuggester::builtin().unwrap()),
        tx,
    )
    .with_generative(stalled.clone())
    .with_notifier(notifier.clone());

    for i in 0..TURNS {
        let started = Instant::now();
        let turn = orchestrator
            .handle_utterance("trip", &format!("Where can I find budget hostels with wifi? ({i})"))
            .await
            .unwrap();
        assert!(started.elapsed() < timeout + Duration::from_secs(1));
        assert!(turn.degraded);
        assert_eq!(turn.source, CandidateSource::Suggester);
        assert!(turn.reply.text.contains("hostels"));
    }

    let mut degraded = 0;
    while let Ok(status) = rx.try_recv() {
        if let AssistantStatus::Degraded { conversation_id, reason } = status {
            assert_eq!(conversation_id, "trip");
            assert!(reason.contains("timed out"));
            degraded += 1;
        }
    }
    assert_eq!(degraded, TURNS);
    assert_eq!(stalled.calls.load(Ordering::SeqCst), TURNS);
    assert_eq!(notifier.notified.lock().unwrap().len(), TURNS);
    assert_eq!(store.read("trip").await.unwrap().utterances.len(), TURNS * 2);
}

#[tokio::test]
async fn cancelled_turn_falls_back_without_waiting() {
    let store = Arc::new(MockConversationStore::new());
    let (tx, _rx) = status_channel(8);
    let orchestrator = Orchestrator::new(
        &config(60_000),
        store.clone(),
        Arc::new(HeuristicDetector::default()),
        Arc::new(ReplySuggester::builtin().unwrap()),
        tx,
    )
    .with_generative(Arc::new(Stalled { calls: AtomicUsize::new(0) }));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let turn = orchestrator
        .handle_utterance_with_cancel("trip", "hello there", cancel)
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(turn.degraded);
    assert_eq!(turn.degraded_reason.as_deref(), Some("turn cancelled"));

    // Both halves of the turn are stored exactly once.
    let conv = store.read("trip").await.unwrap();
    assert_eq!(conv.utterances.len(), 2);
}

/// Generative source that answers with a fixed English reply and records
/// the turns it was shown.
#[derive(Default)]
struct Capturing {
    seen: std::sync::Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl ReplySource for Capturing {
    fn kind(&self) -> CandidateSource {
        CandidateSource::Generative
    }

    async fn candidates(&self, context: &ConversationContext, _: usize) -> AssistantResult<Vec<ReplyCandidate>> {
        let texts = context.turns.iter().map(|t| t.text.clone()).collect();
        self.seen.lock().unwrap().push(texts);
        Ok(vec![ReplyCandidate::new(
            "Budget hostels cluster near the main railway station.",
            CandidateSource::Generative,
            1.0,
        )])
    }
}

/// Spanish/English lexicon models in a temporary directory.
fn spanish_translator() -> (tempfile::TempDir, Arc<Translator>) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("es-en.json"),
        r#"{"source":"es","target":"en","entries":{"dónde":"where","hay":"are there","hostales":"hostels","baratos":"budget","con":"with","wifi":"wifi","y":"and","museos":"museums","los":"the","se agrupan":"cluster","cerca de":"near","la":"the","principal":"main","estación de tren":"railway station"}}"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("en-es.json"),
        r#"{"source":"en","target":"es","entries":{"budget hostels":"los hostales baratos","cluster":"se agrupan","near":"cerca de","the":"la","main":"principal","railway station":"estación de tren"}}"#,
    )
    .unwrap();

    let translation_config = TranslationConfig {
        model_dir: dir.path().to_string_lossy().to_string(),
        ..TranslationConfig::default()
    };
    let translator = Arc::new(Translator::new(
        &translation_config,
        Arc::new(LocalModelAssets::from_config(&translation_config).unwrap()),
    ));
    (dir, translator)
}

fn spanish_orchestrator(store: Arc<MockConversationStore>, translator: Arc<Translator>) -> Orchestrator {
    let (tx, _rx) = status_channel(8);
    Orchestrator::new(
        &AssistantConfig::default(),
        store,
        Arc::new(HeuristicDetector::default()),
        Arc::new(ReplySuggester::builtin().unwrap()),
        tx,
    )
    .with_translator(translator)
}

fn assert_no_spanish(turns: &[String]) {
    for text in turns {
        assert!(
            !text.contains("hostales") && !text.contains("dónde") && !text.contains("Dónde"),
            "context turn not in the working language: {text}"
        );
    }
}

#[tokio::test]
async fn foreign_language_turn_is_translated_both_ways() {
    let (_dir, translator) = spanish_translator();
    let store = Arc::new(MockConversationStore::new());
    let orchestrator = spanish_orchestrator(store.clone(), translator.clone());

    let turn = orchestrator
        .handle_utterance("viaje", "¿Dónde hay hostales baratos con wifi?")
        .await
        .unwrap();

    assert_eq!(turn.user.detected_language.as_deref(), Some("es"));
    let translation = turn.translation.expect("user text translated");
    assert_eq!(translation.target_language, "en");
    assert!(translation.translated_text.contains("hostels"));
    assert_eq!(turn.reply.detected_language.as_deref(), Some("es"));
    assert!(turn.reply.text.contains("hostales"));

    let conv = store.read("viaje").await.unwrap();
    assert_eq!(conv.language.as_deref(), Some("es"));
    assert_eq!(translator.resident_pairs().await.len(), 2);
}

#[tokio::test]
async fn later_turns_see_earlier_turns_in_the_working_language() {
    let (_dir, translator) = spanish_translator();
    let store = Arc::new(MockConversationStore::new());
    let generative = Arc::new(Capturing::default());
    let orchestrator = spanish_orchestrator(store.clone(), translator).with_generative(generative.clone());

    let first = orchestrator
        .handle_utterance("viaje", "¿Dónde hay hostales baratos con wifi?")
        .await
        .unwrap();
    assert!(first.reply.text.contains("hostales"));
    assert_eq!(
        first.reply.working_text.as_deref(),
        Some("Budget hostels cluster near the main railway station.")
    );
    assert!(first.user.working_text.as_deref().unwrap().contains("hostels"));

    orchestrator
        .handle_utterance("viaje", "¿Y dónde hay museos?")
        .await
        .unwrap();

    let seen = generative.seen.lock().unwrap();
    let second = &seen[1];
    assert_eq!(second.len(), 3);
    assert!(second[0].contains("hostels"));
    assert_eq!(second[1], "Budget hostels cluster near the main railway station.");
    assert!(second[2].contains("museums"));
    assert_no_spanish(second);

    // The stored texts stay in the user's language.
    let conv = store.read("viaje").await.unwrap();
    assert!(conv.utterances[0].utterance.text.contains("hostales"));
}

#[tokio::test]
async fn history_without_renderings_is_translated_for_context() {
    let (_dir, translator) = spanish_translator();
    let store = Arc::new(MockConversationStore::new());
    store
        .append_turn(
            "viaje",
            Utterance::user("viaje", "¿Dónde hay hostales baratos con wifi?").with_language("es"),
            Utterance::assistant(
                "viaje",
                "los hostales baratos se agrupan cerca de la principal estación de tren",
            )
            .with_language("es"),
        )
        .await
        .unwrap();
    let generative = Arc::new(Capturing::default());
    let orchestrator = spanish_orchestrator(store, translator).with_generative(generative.clone());

    orchestrator
        .handle_utterance("viaje", "¿Y dónde hay museos?")
        .await
        .unwrap();

    let seen = generative.seen.lock().unwrap();
    let context = &seen[0];
    assert_eq!(context.len(), 3);
    assert!(context[0].contains("hostels"));
    assert!(context[1].contains("railway station"));
    assert_no_spanish(context);
}
