//! On-device translation with a bounded pool of resident model pairs.

pub mod assets;
pub mod lexicon;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use wayfarer_core::config::TranslationConfig;

use crate::error::{AssistantError, AssistantResult};
use crate::types::TranslationResult;

pub use assets::LocalModelAssets;
pub use lexicon::{LexiconFile, LexiconModel};

/// Raw output of a model, before confidence is derived.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslationOutput {
    pub text: String,
    pub covered_words: usize,
    pub total_words: usize,
}

impl TranslationOutput {
    /// Share of source words the model had an entry for.
    pub fn confidence(&self) -> f32 {
        if self.total_words == 0 {
            0.0
        } else {
            self.covered_words as f32 / self.total_words as f32
        }
    }
}

/// A loaded translation model for one (source, target) pair.
pub trait TranslationModel: Send + Sync {
    fn model_id(&self) -> &str;
    fn version(&self) -> &str;
    fn translate(&self, text: &str) -> TranslationOutput;
}

/// Source of on-device models. Acquisition may hit the network.
#[async_trait]
pub trait ModelAssets: Send + Sync {
    async fn acquire(&self, model_id: &str) -> AssistantResult<Arc<dyn TranslationModel>>;
    async fn release(&self, model: Arc<dyn TranslationModel>);
}

pub fn model_id(source: &str, target: &str) -> String {
    format!("{source}-{target}")
}

struct Resident {
    source: String,
    target: String,
    model: Arc<dyn TranslationModel>,
    last_used: u64,
}

#[derive(Default)]
struct Pool {
    entries: Vec<Resident>,
    clock: u64,
}

impl Pool {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Drop least-recently-used entries until the pool fits `max`. Entries
    /// with outstanding handles and the entry at `keep` are never chosen.
    fn evict_over(&mut self, max: usize, keep: &str) -> Vec<Resident> {
        let mut evicted = Vec::new();
        while self.entries.len() > max {
            let victim = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, r)| r.model.model_id() != keep && Arc::strong_count(&r.model) == 1)
                .min_by_key(|(_, r)| r.last_used)
                .map(|(i, _)| i);
            match victim {
                Some(i) => evicted.push(self.entries.remove(i)),
                None => break,
            }
        }
        evicted
    }
}

/// Translator over a shared LRU pool of resident model pairs.
pub struct Translator {
    assets: Arc<dyn ModelAssets>,
    supported: HashSet<String>,
    max_resident: usize,
    acquire_timeout: Duration,
    pool: Mutex<Pool>,
}

impl Translator {
    pub fn new(config: &TranslationConfig, assets: Arc<dyn ModelAssets>) -> Self {
        Self {
            assets,
            supported: config
                .supported_languages
                .iter()
                .map(|l| l.to_lowercase())
                .collect(),
            max_resident: config.max_resident_models.max(1),
            acquire_timeout: config.acquire_timeout(),
            pool: Mutex::new(Pool::default()),
        }
    }

    pub fn supports(&self, source: &str, target: &str) -> bool {
        source != target && self.supported.contains(source) && self.supported.contains(target)
    }

    fn check_pair(&self, source: &str, target: &str) -> AssistantResult<(String, String)> {
        let source = source.to_lowercase();
        let target = target.to_lowercase();
        if !self.supports(&source, &target) {
            return Err(AssistantError::UnsupportedLanguagePair {
                from: source,
                to: target,
            });
        }
        Ok((source, target))
    }

    /// Translate `text` from `source` to `target`, acquiring the model pair
    /// on first use.
    pub async fn translate(
        &self,
        text: &str,
        source: &str,
        target: &str,
    ) -> AssistantResult<TranslationResult> {
        let (source, target) = self.check_pair(source, target)?;
        if text.trim().is_empty() {
            return Err(AssistantError::InvalidInput("nothing to translate".into()));
        }

        // The handle keeps the pair out of eviction until translation ends.
        let model = self.checkout(&source, &target).await?;
        let output = model.translate(text);
        tracing::debug!(
            model = model.model_id(),
            covered = output.covered_words,
            total = output.total_words,
            "Translated"
        );

        Ok(TranslationResult {
            confidence: output.confidence(),
            source_language: source,
            target_language: target,
            source_text: text.to_string(),
            translated_text: output.text,
        })
    }

    /// Hold a resident model pair. The pair cannot be evicted while the
    /// returned handle is alive.
    pub async fn pin(&self, source: &str, target: &str) -> AssistantResult<Arc<dyn TranslationModel>> {
        let (source, target) = self.check_pair(source, target)?;
        self.checkout(&source, &target).await
    }

    /// Make a pair resident ahead of use.
    pub async fn prefetch(&self, source: &str, target: &str) -> AssistantResult<()> {
        self.pin(source, target).await.map(|_| ())
    }

    /// Resident pairs, most recently used first.
    pub async fn resident_pairs(&self) -> Vec<(String, String)> {
        let pool = self.pool.lock().await;
        let mut entries: Vec<&Resident> = pool.entries.iter().collect();
        entries.sort_by(|a, b| b.last_used.cmp(&a.last_used));
        entries
            .into_iter()
            .map(|r| (r.source.clone(), r.target.clone()))
            .collect()
    }

    async fn checkout(&self, source: &str, target: &str) -> AssistantResult<Arc<dyn TranslationModel>> {
        let mut pool = self.pool.lock().await;
        let now = pool.tick();
        if let Some(entry) = pool
            .entries
            .iter_mut()
            .find(|r| r.source == source && r.target == target)
        {
            entry.last_used = now;
            return Ok(entry.model.clone());
        }

        let id = model_id(source, target);
        tracing::info!(model = %id, "Acquiring translation model");
        let model = tokio::time::timeout(self.acquire_timeout, self.assets.acquire(&id))
            .await
            .map_err(|_| {
                AssistantError::ModelUnavailable(format!(
                    "{id}: acquisition timed out after {}ms",
                    self.acquire_timeout.as_millis()
                ))
            })??;

        pool.entries.push(Resident {
            source: source.to_string(),
            target: target.to_string(),
            model: model.clone(),
            last_used: now,
        });
        let evicted = pool.evict_over(self.max_resident, model.model_id());
        if pool.entries.len() > self.max_resident {
            tracing::warn!(
                resident = pool.entries.len(),
                max = self.max_resident,
                "All resident models busy, pool temporarily over capacity"
            );
        }
        drop(pool);

        for resident in evicted {
            tracing::info!(model = resident.model.model_id(), "Evicting translation model");
            self.assets.release(resident.model).await;
        }
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoModel(String);

    impl TranslationModel for EchoModel {
        fn model_id(&self) -> &str {
            &self.0
        }
        fn version(&self) -> &str {
            "test"
        }
        fn translate(&self, text: &str) -> TranslationOutput {
            TranslationOutput {
                text: format!("[{}] {text}", self.0),
                covered_words: 1,
                total_words: 2,
            }
        }
    }

    #[derive(Default)]
    struct CountingAssets {
        acquired: AtomicUsize,
        released: AtomicUsize,
    }

    #[async_trait]
    impl ModelAssets for CountingAssets {
        async fn acquire(&self, model_id: &str) -> AssistantResult<Arc<dyn TranslationModel>> {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(EchoModel(model_id.to_string())))
        }
        async fn release(&self, _model: Arc<dyn TranslationModel>) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(max: usize) -> TranslationConfig {
        TranslationConfig {
            max_resident_models: max,
            ..TranslationConfig::default()
        }
    }

    #[tokio::test]
    async fn rejects_unoffered_pairs() {
        let translator = Translator::new(&config(2), Arc::new(CountingAssets::default()));
        assert!(matches!(
            translator.translate("hi", "en", "xx").await,
            Err(AssistantError::UnsupportedLanguagePair { .. })
        ));
        assert!(matches!(
            translator.translate("hi", "en", "en").await,
            Err(AssistantError::UnsupportedLanguagePair { .. })
        ));
    }

    #[tokio::test]
    async fn resident_pair_is_reused() {
        let assets = Arc::new(CountingAssets::default());
        let translator = Translator::new(&config(2), assets.clone());
        let first = translator.translate("hola", "es", "en").await.unwrap();
        translator.translate("hola", "ES", "EN").await.unwrap();
        assert_eq!(assets.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(first.translated_text, "[es-en] hola");
        assert!((first.confidence - 0.5).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn pinned_pair_survives_eviction() {
        let assets = Arc::new(CountingAssets::default());
        let translator = Translator::new(&config(1), assets.clone());
        let pinned = translator.pin("es", "en").await.unwrap();
        translator.translate("hello", "en", "fr").await.unwrap();

        // Over capacity while the pin is held.
        assert_eq!(translator.resident_pairs().await.len(), 2);
        assert_eq!(assets.released.load(Ordering::SeqCst), 0);

        drop(pinned);
        translator.translate("hallo", "de", "en").await.unwrap();
        let resident = translator.resident_pairs().await;
        assert_eq!(resident, vec![("de".to_string(), "en".to_string())]);
        assert_eq!(assets.released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn empty_output_has_zero_confidence() {
        let out = TranslationOutput { text: String::new(), covered_words: 0, total_words: 0 };
        assert_eq!(out.confidence(), 0.0);
    }
}
