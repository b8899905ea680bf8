//! Local reply suggestions from a travel knowledge base and canned smart replies.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{AssistantError, AssistantResult};
use crate::source::ReplySource;
use crate::types::{CandidateSource, ConversationContext, ReplyCandidate};

/// Larger knowledge bases are truncated to this many entries.
pub const MAX_KNOWLEDGE_ENTRIES: usize = 10_000;

const BUILTIN_KNOWLEDGE: &str = include_str!("../data/travel_faq.json");

/// Keyword families that boost entries carrying the matching tag.
const CATEGORY_HINTS: &[(&[&str], &str)] = &[
    (&["restaurant", "restaurants"], "restaurants"),
    (&["cafe", "cafes", "coffee"], "cafes"),
    (&["hotel", "hotels"], "hotels"),
    (&["hostel", "hostels"], "hostels"),
    (&["park", "parks"], "parks"),
    (&["mall", "malls", "shopping"], "malls"),
];

struct SmartReply {
    triggers: &'static [&'static str],
    reply: &'static str,
}

const SMART_REPLIES: &[SmartReply] = &[
    SmartReply {
        triggers: &["hello", "hi", "hey", "hola", "bonjour", "hallo", "ciao", "namaste"],
        reply: "Hello! Where are you headed? I can help with places to eat, stay and visit.",
    },
    SmartReply {
        triggers: &["thanks", "thank", "gracias", "merci", "danke", "grazie"],
        reply: "You're welcome! Anything else I can help with for your trip?",
    },
    SmartReply {
        triggers: &["bye", "goodbye", "adios", "ciao"],
        reply: "Safe travels! Come back any time you need a recommendation.",
    },
];

const SMART_REPLY_SCORE: u32 = 6;

#[derive(Debug, Clone, Deserialize)]
pub struct KnowledgeEntry {
    pub q: String,
    pub a: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Scores knowledge-base answers against the recent user turns.
///
/// Pure and synchronous after construction.
pub struct ReplySuggester {
    entries: Vec<IndexedEntry>,
}

struct IndexedEntry {
    entry: KnowledgeEntry,
    question_tokens: HashSet<String>,
    tags: Vec<String>,
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

/// Normalise a raw score into (0, 1).
fn normalise(raw: u32) -> f32 {
    raw as f32 / (raw as f32 + 10.0)
}

impl ReplySuggester {
    pub fn new(mut entries: Vec<KnowledgeEntry>) -> Self {
        if entries.len() > MAX_KNOWLEDGE_ENTRIES {
            tracing::warn!(
                total = entries.len(),
                kept = MAX_KNOWLEDGE_ENTRIES,
                "Knowledge base truncated"
            );
            entries.truncate(MAX_KNOWLEDGE_ENTRIES);
        }
        let entries = entries
            .into_iter()
            .map(|entry| IndexedEntry {
                question_tokens: tokens(&entry.q).collect(),
                tags: entry.tags.iter().map(|t| t.to_lowercase()).collect(),
                entry,
            })
            .collect();
        Self { entries }
    }

    pub fn from_json(json: &str) -> AssistantResult<Self> {
        let entries: Vec<KnowledgeEntry> =
            serde_json::from_str(json).map_err(|e| AssistantError::KnowledgeBase(e.to_string()))?;
        Ok(Self::new(entries))
    }

    pub fn from_path(path: &Path) -> AssistantResult<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| AssistantError::KnowledgeBase(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    /// The travel knowledge base bundled with the crate.
    pub fn builtin() -> AssistantResult<Self> {
        Self::from_json(BUILTIN_KNOWLEDGE)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn score_entry(indexed: &IndexedEntry, query: &str, query_tokens: &[String], earlier: &[String]) -> u32 {
        let overlap = query_tokens
            .iter()
            .filter(|t| t.chars().count() >= 3 && indexed.question_tokens.contains(*t))
            .count() as u32;
        let mut score = overlap * 3;

        score += indexed
            .tags
            .iter()
            .filter(|t| !t.is_empty() && query.contains(t.as_str()))
            .count() as u32
            * 2;

        for (keywords, tag) in CATEGORY_HINTS {
            if keywords.iter().any(|k| query.contains(k)) && indexed.tags.iter().any(|t| t == tag) {
                score += 2;
            }
        }

        // Earlier turns only refine an existing match.
        if score > 0 {
            score += earlier
                .iter()
                .filter(|t| t.chars().count() >= 3 && indexed.question_tokens.contains(*t))
                .count() as u32;
        }
        score
    }

    /// Candidates for the latest user turn, ordered by descending score.
    pub fn suggest(&self, context: &ConversationContext, max_candidates: usize) -> Vec<ReplyCandidate> {
        let Some(latest) = context.latest_user_text() else {
            return Vec::new();
        };
        let query = latest.to_lowercase();
        let query_tokens: Vec<String> = tokens(&query).collect();
        let earlier: Vec<String> = context.earlier_user_texts().flat_map(tokens).collect();

        let mut scored: Vec<(u32, &str)> = Vec::new();
        for reply in SMART_REPLIES {
            if query_tokens.iter().any(|t| reply.triggers.contains(&t.as_str())) {
                scored.push((SMART_REPLY_SCORE, reply.reply));
            }
        }
        for indexed in &self.entries {
            let score = Self::score_entry(indexed, &query, &query_tokens, &earlier);
            if score > 0 {
                scored.push((score, indexed.entry.a.as_str()));
            }
        }
        // Stable: equal scores keep knowledge-base order.
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        let mut seen = HashSet::new();
        scored
            .into_iter()
            .filter(|(_, text)| seen.insert(*text))
            .take(max_candidates)
            .map(|(score, text)| ReplyCandidate::new(text, CandidateSource::Suggester, normalise(score)))
            .collect()
    }
}

#[async_trait]
impl ReplySource for ReplySuggester {
    fn kind(&self) -> CandidateSource {
        CandidateSource::Suggester
    }

    async fn candidates(
        &self,
        context: &ConversationContext,
        max_candidates: usize,
    ) -> AssistantResult<Vec<ReplyCandidate>> {
        Ok(self.suggest(context, max_candidates))
    }
}
