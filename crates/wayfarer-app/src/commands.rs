use std::io::Write;

use anyhow::{bail, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use wayfarer_ai::{AssistantError, AssistantTurn, LanguageIdentifier};
use wayfarer_core::config::AppConfig;
use wayfarer_core::interfaces::{AssistantStatus, StatusReceiver};
use wayfarer_db::{ConversationStore, StoreError};
use wayfarer_sync::{SyncCoordinator, SyncOutcome, SyncResult};

use crate::setup::{create_assistant, create_store, create_translator, Assistant};

fn print_turn(turn: &AssistantTurn) {
    println!("{}", turn.reply.text);
    if let Some(reason) = &turn.degraded_reason {
        println!("  (offline reply: {reason})");
    }
    if let Some(t) = &turn.translation {
        println!(
            "  [{} -> {}, {:.0}%] {}",
            t.source_language,
            t.target_language,
            t.confidence * 100.0,
            t.translated_text
        );
    }
    for s in turn.suggestions.iter().filter(|s| s.text != turn.reply.text) {
        println!("  - {}", s.text);
    }
}

fn describe(outcome: &SyncResult<SyncOutcome>) -> String {
    match outcome {
        Ok(SyncOutcome::Synced {
            remote_version,
            pushed,
            pulled,
        }) => format!("synced (remote v{remote_version}, {pushed} pushed, {pulled} pulled)"),
        Ok(SyncOutcome::Retrying { attempt, delay, error }) => {
            format!("retrying (attempt {attempt}, next in {}s): {error}", delay.as_secs())
        }
        Ok(SyncOutcome::Blocked { reason }) => format!("blocked: {reason}"),
        Ok(SyncOutcome::InFlight) => "already syncing".into(),
        Ok(SyncOutcome::Deferred { remaining }) => format!("waiting {}s before retry", remaining.as_secs()),
        Ok(SyncOutcome::Idle) => "nothing to sync".into(),
        Ok(SyncOutcome::MoreWork) => "more changes pending".into(),
        Err(e) => format!("error: {e}"),
    }
}

/// Print status events until the channel closes.
fn spawn_status_printer(mut rx: StatusReceiver) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match rx.recv().await {
                Ok(AssistantStatus::Sending { .. }) => {}
                Ok(status) => eprintln!("[{}] {}", status.label(), status.conversation_id()),
                Err(RecvError::Lagged(n)) => eprintln!("[status] {n} events dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

pub async fn say(config: &AppConfig, conversation: String, text: String) -> Result<()> {
    let assistant = create_assistant(config).await?;
    let turn = assistant.orchestrator.handle_utterance(&conversation, &text).await?;
    print_turn(&turn);
    // One-shot processes have no background loop; push the turn right away.
    if let Some(coordinator) = &assistant.coordinator {
        let outcome = coordinator.sync_now(&conversation).await;
        tracing::info!("Sync {conversation}: {}", describe(&outcome));
    }
    Ok(())
}

pub async fn history(config: &AppConfig, conversation: String, json: bool) -> Result<()> {
    let store = create_store(config).await?;
    let conv = match store.read(&conversation).await {
        Ok(c) => c,
        Err(StoreError::NotFound(_)) => bail!("No conversation named {conversation}"),
        Err(e) => return Err(e.into()),
    };
    if json {
        let messages: Vec<_> = conv.messages().collect();
        println!("{}", serde_json::to_string_pretty(&messages)?);
        return Ok(());
    }
    if let Some(language) = &conv.language {
        println!("# language: {language}");
    }
    for stored in &conv.utterances {
        let u = &stored.utterance;
        println!(
            "{}\t{}\t{}\t{}\t{}",
            u.id,
            u.origin,
            u.detected_language.as_deref().unwrap_or("-"),
            if stored.synced { "synced" } else { "pending" },
            u.text
        );
    }
    println!("({} utterances)", conv.utterances.len());
    Ok(())
}

pub async fn list(config: &AppConfig) -> Result<()> {
    let store = create_store(config).await?;
    let conversations = store.list_conversations().await?;
    for c in &conversations {
        println!(
            "{}\t{}\t{}\t{}",
            c.id,
            c.language.as_deref().unwrap_or("-"),
            c.utterance_count,
            if c.dirty { "pending" } else { "synced" }
        );
    }
    println!("({} conversations)", conversations.len());
    Ok(())
}

pub fn detect(config: &AppConfig, text: String) -> Result<()> {
    let detector = wayfarer_ai::HeuristicDetector::new(config.language.min_confidence);
    let detection = detector.detect(&text)?;
    println!("{}\t{:.2}", detection.language, detection.confidence);
    Ok(())
}

pub async fn translate(config: &AppConfig, text: String, from: String, to: String) -> Result<()> {
    let translator = create_translator(config)?;
    let result = translator.translate(&text, &from, &to).await?;
    println!("{}", result.translated_text);
    println!("(confidence {:.2})", result.confidence);
    Ok(())
}

pub async fn sync(config: &AppConfig, conversation: Option<String>) -> Result<()> {
    let assistant = create_assistant(config).await?;
    let Some(coordinator) = &assistant.coordinator else {
        bail!("Sync is not configured (set sync.remote_url)");
    };
    match conversation {
        Some(id) => println!("{id}\t{}", describe(&coordinator.sync_now(&id).await)),
        None => {
            let results = coordinator.sync_all().await?;
            for (id, outcome) in &results {
                println!("{id}\t{}", describe(outcome));
            }
            println!("({} conversations)", results.len());
        }
    }
    Ok(())
}

pub async fn delete_utterance(config: &AppConfig, conversation: String, id: String) -> Result<()> {
    let assistant = create_assistant(config).await?;
    let version = assistant.orchestrator.delete_utterance(&conversation, &id).await?;
    println!("Deleted {id} (v{version})");
    if let Some(coordinator) = &assistant.coordinator {
        let outcome = coordinator.sync_now(&conversation).await;
        tracing::info!("Sync {conversation}: {}", describe(&outcome));
    }
    Ok(())
}

const CHAT_HELP: &str = "Commands: /history  /sync  /retry  /skip  /quit";

async fn chat_command(assistant: &Assistant, coordinator: Option<&SyncCoordinator>, conversation: &str, line: &str) -> Result<bool> {
    match line {
        "/quit" | "/exit" => return Ok(false),
        "/help" => println!("{CHAT_HELP}"),
        "/history" => match assistant.orchestrator.read_conversation(conversation).await {
            Ok(conv) => {
                for u in conv.messages() {
                    println!("{:>9}: {}", u.origin, u.text);
                }
            }
            Err(AssistantError::Storage(StoreError::NotFound(_))) => println!("(empty)"),
            Err(e) => return Err(e.into()),
        },
        "/sync" | "/retry" | "/skip" => {
            let Some(coordinator) = coordinator else {
                println!("Sync is not configured");
                return Ok(true);
            };
            match line {
                "/retry" => {
                    if let Err(e) = coordinator.retry_blocked(conversation) {
                        println!("{e}");
                    }
                }
                "/skip" => match coordinator.skip_blocked_operation(conversation).await {
                    Ok(Some(id)) => println!("Skipped {id}"),
                    Ok(None) => println!("Nothing to skip"),
                    Err(e) => println!("{e}"),
                },
                _ => println!("{}", describe(&coordinator.sync_now(conversation).await)),
            }
        }
        other => println!("Unknown command {other}. {CHAT_HELP}"),
    }
    Ok(true)
}

pub async fn chat(config: &AppConfig, conversation: String) -> Result<()> {
    let assistant = create_assistant(config).await?;
    let cancel = CancellationToken::new();
    let printer = spawn_status_printer(assistant.status_tx.subscribe());
    let sync_task = assistant
        .coordinator
        .clone()
        .map(|coordinator| tokio::spawn(coordinator.run(cancel.clone())));

    println!("Conversation {conversation}. {CHAT_HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('/') {
            if !chat_command(&assistant, assistant.coordinator.as_deref(), &conversation, line).await? {
                break;
            }
            continue;
        }
        match assistant.orchestrator.handle_utterance(&conversation, line).await {
            Ok(turn) => print_turn(&turn),
            Err(e) => eprintln!("error: {e}"),
        }
    }

    cancel.cancel();
    if let Some(task) = sync_task {
        let _ = task.await;
    }
    // Last chance to push what this session wrote.
    if let Some(coordinator) = &assistant.coordinator {
        let outcome = coordinator.sync_now(&conversation).await;
        tracing::info!("Sync {conversation}: {}", describe(&outcome));
    }
    printer.abort();
    Ok(())
}
