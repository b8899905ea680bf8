use serde::{Deserialize, Serialize};
use wayfarer_db::{Origin, StoredUtterance};

/// Which capability produced a reply candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateSource {
    Suggester,
    Generative,
}

impl std::fmt::Display for CandidateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Suggester => write!(f, "suggester"),
            Self::Generative => write!(f, "generative"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyCandidate {
    pub text: String,
    pub source: CandidateSource,
    pub score: f32,
}

impl ReplyCandidate {
    pub fn new(text: impl Into<String>, source: CandidateSource, score: f32) -> Self {
        Self {
            text: text.into(),
            source,
            score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationResult {
    pub source_language: String,
    pub target_language: String,
    pub source_text: String,
    pub translated_text: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextTurn {
    pub origin: Origin,
    pub text: String,
}

/// Bounded window of recent turns. The last turn is the one being answered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationContext {
    pub turns: Vec<ContextTurn>,
}

impl ConversationContext {
    /// Build a context from stored history plus the incoming user text,
    /// keeping at most `window` turns in total.
    pub fn from_history(history: &[StoredUtterance], current: &str, window: usize) -> Self {
        let keep = window.max(1) - 1;
        let skip = history.len().saturating_sub(keep);
        let mut turns: Vec<ContextTurn> = history[skip..]
            .iter()
            .map(|s| ContextTurn {
                origin: s.utterance.origin,
                text: s.utterance.context_text().to_string(),
            })
            .collect();
        turns.push(ContextTurn {
            origin: Origin::User,
            text: current.to_string(),
        });
        Self { turns }
    }

    pub fn single(text: &str) -> Self {
        Self::from_history(&[], text, 1)
    }

    /// Text of the most recent user turn.
    pub fn latest_user_text(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.origin == Origin::User)
            .map(|t| t.text.as_str())
    }

    /// Earlier user turns, most recent first.
    pub fn earlier_user_texts(&self) -> impl Iterator<Item = &str> {
        self.turns
            .iter()
            .rev()
            .filter(|t| t.origin == Origin::User)
            .skip(1)
            .map(|t| t.text.as_str())
    }
}
