use async_trait::async_trait;

use crate::error::AssistantResult;
use crate::types::{CandidateSource, ConversationContext, ReplyCandidate};

/// A capability that proposes replies for a conversation.
///
/// The orchestrator only sees this trait; the suggester and the generative
/// responder are interchangeable behind it.
#[async_trait]
pub trait ReplySource: Send + Sync {
    fn kind(&self) -> CandidateSource;

    /// Candidates ordered by descending score, at most `max_candidates`.
    async fn candidates(
        &self,
        context: &ConversationContext,
        max_candidates: usize,
    ) -> AssistantResult<Vec<ReplyCandidate>>;
}
