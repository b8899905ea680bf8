use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use wayfarer_ai::translate::LocalModelAssets;
use wayfarer_ai::{GeminiResponder, HeuristicDetector, Orchestrator, ReplySuggester, Translator};
use wayfarer_core::config::AppConfig;
use wayfarer_core::interfaces::{status_channel, StatusSender};
use wayfarer_db::surreal::{StorageMode, SurrealConversationStore};
use wayfarer_db::ConversationStore;
use wayfarer_sync::{HttpRemoteStore, InMemoryRemoteStore, RemoteStore, SyncCoordinator};

pub async fn create_store(config: &AppConfig) -> Result<Arc<SurrealConversationStore>> {
    let mode = match config.database.mode.as_str() {
        "memory" => StorageMode::Memory,
        _ => StorageMode::Persistent(config.database.path.clone()),
    };
    let store = SurrealConversationStore::new(mode).await?;
    store.connect().await?;
    store.init_schema().await?;
    Ok(store.into())
}

/// Remote store for this process. A persistent database without a remote
/// URL has nowhere durable to sync to, so its conversations stay dirty.
pub fn create_remote(config: &AppConfig) -> Result<Option<Arc<dyn RemoteStore>>> {
    if !config.sync.enabled {
        return Ok(None);
    }
    match (&config.sync.remote_url, config.database.mode.as_str()) {
        (Some(url), _) => {
            let remote = HttpRemoteStore::new(url).context("remote document store")?;
            tracing::info!("Syncing with {url}");
            Ok(Some(Arc::new(remote)))
        }
        (None, "memory") => {
            tracing::info!("No remote configured; syncing with an in-process store");
            Ok(Some(Arc::new(InMemoryRemoteStore::new())))
        }
        (None, _) => {
            tracing::info!("No remote configured; sync disabled");
            Ok(None)
        }
    }
}

fn create_suggester(config: &AppConfig) -> Result<ReplySuggester> {
    let suggester = match &config.assistant.knowledge_base {
        Some(path) => ReplySuggester::from_path(Path::new(path))
            .with_context(|| format!("knowledge base {path}"))?,
        None => ReplySuggester::builtin()?,
    };
    tracing::info!("Loaded {} knowledge entries", suggester.len());
    Ok(suggester)
}

pub fn create_translator(config: &AppConfig) -> Result<Translator> {
    let assets = LocalModelAssets::from_config(&config.translation)?;
    Ok(Translator::new(&config.translation, Arc::new(assets)))
}

/// Everything a command needs, wired together.
pub struct Assistant {
    pub orchestrator: Arc<Orchestrator>,
    pub coordinator: Option<Arc<SyncCoordinator>>,
    pub status_tx: StatusSender,
}

pub async fn create_assistant(config: &AppConfig) -> Result<Assistant> {
    let store = create_store(config).await?;
    let (status_tx, _) = status_channel(256);

    let coordinator = create_remote(config)?.map(|remote| {
        Arc::new(SyncCoordinator::new(
            &config.sync,
            store.clone(),
            remote,
            status_tx.clone(),
        ))
    });

    let detector = Arc::new(HeuristicDetector::new(config.language.min_confidence));
    let suggester = Arc::new(create_suggester(config)?);
    let mut orchestrator = Orchestrator::new(
        &config.assistant,
        store,
        detector,
        suggester,
        status_tx.clone(),
    );

    match create_translator(config) {
        Ok(translator) => orchestrator = orchestrator.with_translator(Arc::new(translator)),
        Err(e) => tracing::warn!("Translation unavailable: {e}"),
    }

    if config.generative.enabled {
        match config.generative.api_key() {
            Some(key) => {
                let responder = GeminiResponder::new(
                    &config.generative,
                    Some(key),
                    config.assistant.generative_timeout(),
                );
                tracing::info!("Generative replies via {}", responder.endpoint());
                orchestrator = orchestrator.with_generative(Arc::new(responder));
            }
            None => tracing::info!(
                "{} not set; replies come from the knowledge base only",
                config.generative.api_key_env
            ),
        }
    }

    if let Some(coordinator) = &coordinator {
        orchestrator = orchestrator.with_notifier(Arc::new(coordinator.handle()));
    }

    Ok(Assistant {
        orchestrator: Arc::new(orchestrator),
        coordinator,
        status_tx,
    })
}
