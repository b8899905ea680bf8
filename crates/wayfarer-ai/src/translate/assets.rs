use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use url::Url;
use wayfarer_core::config::TranslationConfig;

use super::{LexiconModel, ModelAssets, TranslationModel};
use crate::error::{AssistantError, AssistantResult};

/// Lexicon models cached under a local directory, optionally backfilled
/// from a remote model repository.
///
/// Layout: `<model_dir>/<source>-<target>.json`. A missing file is fetched
/// from `<repository>/<source>-<target>.json` and written to the cache
/// before use.
pub struct LocalModelAssets {
    model_dir: PathBuf,
    repository: Option<Url>,
    client: reqwest::Client,
}

impl LocalModelAssets {
    pub fn new(model_dir: impl Into<PathBuf>, repository: Option<Url>) -> Self {
        Self {
            model_dir: model_dir.into(),
            repository,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &TranslationConfig) -> AssistantResult<Self> {
        let repository = config
            .model_repository_url
            .as_deref()
            .map(|u| {
                // Join treats a base without a trailing slash as a file.
                let base = if u.ends_with('/') { u.to_string() } else { format!("{u}/") };
                Url::parse(&base)
                    .map_err(|e| AssistantError::InvalidInput(format!("model repository URL: {e}")))
            })
            .transpose()?;
        Ok(Self::new(&config.model_dir, repository))
    }

    fn model_path(&self, model_id: &str) -> PathBuf {
        self.model_dir.join(format!("{model_id}.json"))
    }

    async fn load_cached(path: &Path) -> AssistantResult<Option<LexiconModel>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => LexiconModel::from_json(&bytes).map(Some).map_err(|e| {
                AssistantError::ModelUnavailable(format!("corrupt model {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AssistantError::ModelUnavailable(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn download(&self, repository: &Url, model_id: &str, path: &Path) -> AssistantResult<LexiconModel> {
        let url = repository
            .join(&format!("{model_id}.json"))
            .map_err(|e| AssistantError::ModelUnavailable(format!("bad model URL: {e}")))?;
        tracing::info!(%url, "Downloading translation model");

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| AssistantError::ModelUnavailable(format!("{model_id}: {e}")))?;
        if !response.status().is_success() {
            return Err(AssistantError::ModelUnavailable(format!(
                "{model_id}: repository returned {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| AssistantError::ModelUnavailable(format!("{model_id}: {e}")))?;
        let model = LexiconModel::from_json(&bytes)
            .map_err(|e| AssistantError::ModelUnavailable(format!("{model_id}: invalid model: {e}")))?;

        // A failed cache write only costs a re-download later.
        if let Err(e) = tokio::fs::create_dir_all(&self.model_dir).await {
            tracing::warn!("Cannot create model dir {}: {e}", self.model_dir.display());
        } else if let Err(e) = tokio::fs::write(path, &bytes).await {
            tracing::warn!("Cannot cache model {}: {e}", path.display());
        }
        Ok(model)
    }
}

#[async_trait]
impl ModelAssets for LocalModelAssets {
    async fn acquire(&self, model_id: &str) -> AssistantResult<Arc<dyn TranslationModel>> {
        let path = self.model_path(model_id);
        if let Some(model) = Self::load_cached(&path).await? {
            tracing::debug!(model_id, entries = model.len(), "Loaded cached translation model");
            return Ok(Arc::new(model));
        }
        match &self.repository {
            Some(repository) => Ok(Arc::new(self.download(repository, model_id, &path).await?)),
            None => Err(AssistantError::ModelUnavailable(format!(
                "{model_id} is not cached and no model repository is configured"
            ))),
        }
    }

    async fn release(&self, model: Arc<dyn TranslationModel>) {
        tracing::debug!(model_id = model.model_id(), "Released translation model");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loads_model_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("es-en.json"),
            r#"{"source":"es","target":"en","entries":{"hola":"hello"}}"#,
        )
        .unwrap();
        let assets = LocalModelAssets::new(dir.path(), None);
        let model = assets.acquire("es-en").await.unwrap();
        assert_eq!(model.translate("hola").text, "hello");
    }

    #[tokio::test]
    async fn missing_model_without_repository_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let assets = LocalModelAssets::new(dir.path(), None);
        assert!(matches!(
            assets.acquire("fr-en").await,
            Err(AssistantError::ModelUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn corrupt_model_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("de-en.json"), "not json").unwrap();
        let assets = LocalModelAssets::new(dir.path(), None);
        assert!(matches!(
            assets.acquire("de-en").await,
            Err(AssistantError::ModelUnavailable(_))
        ));
    }

    #[test]
    fn repository_url_gets_trailing_slash() {
        let config = TranslationConfig {
            model_repository_url: Some("http://models.local/lexicons".into()),
            ..TranslationConfig::default()
        };
        let assets = LocalModelAssets::from_config(&config).unwrap();
        let joined = assets.repository.unwrap().join("es-en.json").unwrap();
        assert_eq!(joined.as_str(), "http://models.local/lexicons/es-en.json");
    }
}
