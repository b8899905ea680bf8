use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Conversation not found: {0}")]
    NotFound(String),

    #[error("Utterance not found: {0}")]
    UtteranceNotFound(String),

    #[error("Invalid ID: {0}")]
    InvalidId(String),

    #[error("Duplicate utterance: {0}")]
    Duplicate(String),

    #[error("Schema initialization failed: {0}")]
    SchemaInit(String),

    #[error("Database connection failed: {0}")]
    Connection(String),

    /// The durability layer refused a write.
    #[error("Write rejected: {0}")]
    Persistence(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("SurrealDB error: {0}")]
    Surreal(#[from] surrealdb::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
