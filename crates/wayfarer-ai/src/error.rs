use std::time::Duration;

use thiserror::Error;
use wayfarer_db::StoreError;

#[derive(Debug, Error)]
pub enum AssistantError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unsupported input: {0}")]
    UnsupportedInput(String),

    #[error("Unsupported language pair: {from} -> {to}")]
    UnsupportedLanguagePair { from: String, to: String },

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Remote service unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Rate limited by remote service (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Knowledge base error: {0}")]
    KnowledgeBase(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl AssistantError {
    /// Whether the same call may succeed later without the caller changing anything.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::ModelUnavailable(_) | Self::RemoteUnavailable(_) | Self::RateLimited { .. }
        )
    }
}

pub type AssistantResult<T> = Result<T, AssistantError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_classification() {
        assert!(AssistantError::RemoteUnavailable("503".into()).is_retriable());
        assert!(AssistantError::RateLimited { retry_after: None }.is_retriable());
        assert!(AssistantError::ModelUnavailable("offline".into()).is_retriable());
        assert!(!AssistantError::InvalidInput("empty".into()).is_retriable());
        assert!(!AssistantError::InvalidResponse("no candidates".into()).is_retriable());
        assert!(!AssistantError::UnsupportedLanguagePair { from: "en".into(), to: "xx".into() }
            .is_retriable());
    }

    #[test]
    fn store_errors_convert() {
        let err: AssistantError = StoreError::Persistence("disk full".into()).into();
        assert!(matches!(err, AssistantError::Storage(_)));
        assert!(err.to_string().contains("disk full"));
    }
}
