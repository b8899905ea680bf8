pub mod error;
pub mod locks;
pub mod schema;
pub mod surreal;
pub mod traits;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use error::{StoreError, StoreResult};
pub use schema::{
    Conversation, ConversationMeta, ConversationSummary, Origin, StoredUtterance, Tombstone,
    Utterance, UNDETERMINED_LANGUAGE,
};
pub use surreal::{StorageMode, SurrealConversationStore};
pub use traits::ConversationStore;
