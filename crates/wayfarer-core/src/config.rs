use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub language: LanguageConfig,
    #[serde(default)]
    pub translation: TranslationConfig,
    #[serde(default)]
    pub generative: GenerativeConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// "persistent" (RocksDB on disk) or "memory".
    #[serde(default = "default_db_mode")]
    pub mode: String,
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_mode() -> String {
    "persistent".into()
}
fn default_db_path() -> String {
    "data/wayfarer.db".into()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            mode: default_db_mode(),
            path: default_db_path(),
        }
    }
}

/// Turn handling: working language, context window, fallback policy.
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantConfig {
    /// Language the reply sources operate in.
    #[serde(default = "default_working_language")]
    pub working_language: String,
    /// Number of stored turns handed to the reply sources.
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    #[serde(default = "default_max_suggestions")]
    pub max_suggestions: usize,
    /// Deadline for the remote generative call of a single turn.
    #[serde(default = "default_generative_timeout_ms")]
    pub generative_timeout_ms: u64,
    /// Optional travel FAQ knowledge base (JSON array of {q, a, tags}).
    #[serde(default)]
    pub knowledge_base: Option<String>,
}

fn default_working_language() -> String {
    "en".into()
}
fn default_context_window() -> usize {
    8
}
fn default_max_suggestions() -> usize {
    3
}
fn default_generative_timeout_ms() -> u64 {
    8_000
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            working_language: default_working_language(),
            context_window: default_context_window(),
            max_suggestions: default_max_suggestions(),
            generative_timeout_ms: default_generative_timeout_ms(),
            knowledge_base: None,
        }
    }
}

impl AssistantConfig {
    pub fn generative_timeout(&self) -> Duration {
        Duration::from_millis(self.generative_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LanguageConfig {
    /// Below this confidence the detector reports the undetermined code `und`.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
}

fn default_min_confidence() -> f32 {
    0.5
}

impl Default for LanguageConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
        }
    }
}

/// On-device translation models.
#[derive(Debug, Clone, Deserialize)]
pub struct TranslationConfig {
    #[serde(default = "default_model_dir")]
    pub model_dir: String,
    /// Base URL models are downloaded from when not present in `model_dir`.
    #[serde(default)]
    pub model_repository_url: Option<String>,
    #[serde(default = "default_max_resident_models")]
    pub max_resident_models: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_supported_languages")]
    pub supported_languages: Vec<String>,
}

fn default_model_dir() -> String {
    "models/translation".into()
}
fn default_max_resident_models() -> usize {
    3
}
fn default_acquire_timeout_ms() -> u64 {
    15_000
}
fn default_supported_languages() -> Vec<String> {
    ["en", "es", "fr", "de", "it", "pt", "nl", "hi", "mr", "ja", "zh", "ko", "ru", "ar"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            model_repository_url: None,
            max_resident_models: default_max_resident_models(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            supported_languages: default_supported_languages(),
        }
    }
}

impl TranslationConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Remote generative service.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerativeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_generative_base_url")]
    pub base_url: String,
    #[serde(default = "default_generative_model")]
    pub model: String,
    /// Environment variable holding the API key. The key itself is never stored in config.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_true() -> bool {
    true
}
fn default_generative_base_url() -> String {
    "https://generativelanguage.googleapis.com".into()
}
fn default_generative_model() -> String {
    "gemini-1.5-flash-latest".into()
}
fn default_api_key_env() -> String {
    "GEMINI_API_KEY".into()
}
fn default_max_output_tokens() -> u32 {
    512
}
fn default_temperature() -> f32 {
    0.7
}

impl Default for GenerativeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_generative_base_url(),
            model: default_generative_model(),
            api_key_env: default_api_key_env(),
            max_output_tokens: default_max_output_tokens(),
            temperature: default_temperature(),
        }
    }
}

impl GenerativeConfig {
    /// Resolve the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

/// Remote document store synchronisation.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Base URL of the remote document store. When unset, an in-memory database
    /// syncs to an in-process store and a persistent one does not sync.
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Conflict/merge rounds allowed per operation within one cycle.
    #[serde(default = "default_max_conflict_rounds")]
    pub max_conflict_rounds: u32,
}

fn default_push_timeout_ms() -> u64 {
    10_000
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_backoff_initial_ms() -> u64 {
    1_000
}
fn default_backoff_max_ms() -> u64 {
    5 * 60 * 1_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_conflict_rounds() -> u32 {
    3
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            remote_url: None,
            push_timeout_ms: default_push_timeout_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_conflict_rounds: default_max_conflict_rounds(),
        }
    }
}

impl SyncConfig {
    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            assistant: AssistantConfig::default(),
            language: LanguageConfig::default(),
            translation: TranslationConfig::default(),
            generative: GenerativeConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load config with fallback chain: explicit path → ./config/default.toml → hardcoded defaults.
    pub fn load_or_default(explicit_path: Option<&Path>) -> Self {
        if let Some(path) = explicit_path {
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {e}", path.display());
                }
            }
        }

        let default_path = Path::new("config/default.toml");
        if default_path.exists() {
            match Self::load(default_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    tracing::warn!("Failed to load default config: {e}");
                }
            }
        }

        tracing::info!("Using hardcoded default configuration");
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.database.mode, "persistent");
        assert_eq!(cfg.assistant.working_language, "en");
        assert_eq!(cfg.assistant.generative_timeout(), Duration::from_secs(8));
        assert_eq!(cfg.translation.max_resident_models, 3);
        assert!(cfg.translation.supported_languages.contains(&"es".to_string()));
        assert!(cfg.sync.remote_url.is_none());
        assert_eq!(cfg.sync.backoff_multiplier, 2.0);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let toml = r#"
            [database]
            mode = "memory"

            [translation]
            max_resident_models = 2
            supported_languages = ["en", "fr"]

            [sync]
            remote_url = "https://sync.example.com"
            backoff_max_ms = 30000
        "#;
        let cfg: AppConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.database.mode, "memory");
        assert_eq!(cfg.database.path, "data/wayfarer.db");
        assert_eq!(cfg.translation.max_resident_models, 2);
        assert_eq!(cfg.translation.supported_languages, vec!["en", "fr"]);
        assert_eq!(cfg.sync.remote_url.as_deref(), Some("https://sync.example.com"));
        assert_eq!(cfg.sync.backoff_max_ms, 30_000);
        assert_eq!(cfg.sync.backoff_initial_ms, 1_000);
        assert_eq!(cfg.assistant.context_window, 8);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wayfarer.toml");
        std::fs::write(&path, "[assistant]\nworking_language = \"fr\"\n").unwrap();
        let cfg = AppConfig::load(&path).unwrap();
        assert_eq!(cfg.assistant.working_language, "fr");
    }

    #[test]
    fn load_or_default_falls_back_on_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "this is = = not toml").unwrap();
        let cfg = AppConfig::load_or_default(Some(&path));
        assert_eq!(cfg.assistant.max_suggestions, 3);
    }

    #[test]
    fn sweep_interval_never_zero() {
        let cfg = SyncConfig {
            sweep_interval_secs: 0,
            ..SyncConfig::default()
        };
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(1));
    }
}
