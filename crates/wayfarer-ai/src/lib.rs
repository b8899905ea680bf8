pub mod error;
pub mod generative;
pub mod language;
pub mod orchestrator;
pub mod source;
pub mod suggest;
pub mod translate;
pub mod types;

pub use error::{AssistantError, AssistantResult};
pub use generative::GeminiResponder;
pub use language::{Detection, HeuristicDetector, LanguageIdentifier};
pub use orchestrator::{AssistantTurn, Orchestrator};
pub use source::ReplySource;
pub use suggest::ReplySuggester;
pub use translate::{LocalModelAssets, ModelAssets, TranslationModel, Translator};
pub use types::{CandidateSource, ConversationContext, ReplyCandidate, TranslationResult};
