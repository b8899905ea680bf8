//! On-device language identification.
//!
//! Non-Latin scripts are identified from their Unicode blocks. Latin-script
//! text is scored against small stop-word profiles. The classifier is a pure
//! function of its input, so identical text always yields the same result.

use std::collections::HashSet;

use wayfarer_db::UNDETERMINED_LANGUAGE;

use crate::error::{AssistantError, AssistantResult};

/// Outcome of language identification.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub language: String,
    pub confidence: f32,
}

impl Detection {
    pub fn undetermined(confidence: f32) -> Self {
        Self {
            language: UNDETERMINED_LANGUAGE.to_string(),
            confidence,
        }
    }

    pub fn is_determined(&self) -> bool {
        self.language != UNDETERMINED_LANGUAGE
    }
}

pub trait LanguageIdentifier: Send + Sync {
    /// Classify the dominant language of `text`.
    /// Fails with `UnsupportedInput` on empty text or text without letters.
    fn detect(&self, text: &str) -> AssistantResult<Detection>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Script {
    Latin,
    Devanagari,
    Arabic,
    Cyrillic,
    Greek,
    Hebrew,
    Han,
    Kana,
    Hangul,
    Thai,
    Other,
}

fn script_of(c: char) -> Script {
    match c as u32 {
        0x0041..=0x005A | 0x0061..=0x007A | 0x00C0..=0x024F | 0x1E00..=0x1EFF => Script::Latin,
        0x0900..=0x097F => Script::Devanagari,
        0x0600..=0x06FF | 0x0750..=0x077F => Script::Arabic,
        0x0400..=0x04FF => Script::Cyrillic,
        0x0370..=0x03FF => Script::Greek,
        0x0590..=0x05FF => Script::Hebrew,
        0x4E00..=0x9FFF | 0x3400..=0x4DBF => Script::Han,
        0x3040..=0x30FF => Script::Kana,
        0xAC00..=0xD7AF | 0x1100..=0x11FF | 0x3130..=0x318F => Script::Hangul,
        0x0E00..=0x0E7F => Script::Thai,
        _ => Script::Other,
    }
}

/// Stop-word and greeting profiles for Latin-script languages.
const LATIN_PROFILES: &[(&str, &[&str])] = &[
    ("en", &["the", "is", "are", "and", "where", "what", "how", "can", "you", "i", "to", "of", "a", "in", "my", "me", "this", "with", "for", "near", "hello", "thanks", "please", "there", "best"]),
    ("es", &["el", "la", "los", "las", "es", "y", "donde", "dónde", "que", "qué", "cómo", "como", "un", "una", "de", "del", "por", "para", "con", "hola", "gracias", "está", "esta", "estoy", "hay", "mi", "quiero", "cerca"]),
    ("fr", &["le", "la", "les", "est", "et", "où", "que", "quoi", "comment", "un", "une", "des", "du", "je", "vous", "pour", "avec", "bonjour", "merci", "suis", "il", "c'est", "près"]),
    ("de", &["der", "die", "das", "ist", "und", "wo", "was", "wie", "ein", "eine", "ich", "sie", "mit", "für", "nicht", "hallo", "danke", "bitte", "gibt", "es", "nach", "zum"]),
    ("it", &["il", "lo", "la", "gli", "è", "e", "dove", "che", "come", "un", "una", "di", "del", "per", "con", "ciao", "grazie", "sono", "vorrei", "c'è", "vicino"]),
    ("pt", &["o", "os", "as", "é", "e", "onde", "que", "como", "um", "uma", "de", "do", "da", "para", "com", "olá", "ola", "obrigado", "obrigada", "estou", "quero", "perto"]),
    ("nl", &["de", "het", "een", "is", "en", "waar", "wat", "hoe", "ik", "je", "jij", "met", "voor", "niet", "hallo", "dank", "bedankt", "graag", "zijn", "van"]),
    ("id", &["yang", "dan", "di", "ke", "dari", "ini", "itu", "saya", "anda", "apa", "mana", "bagaimana", "halo", "terima", "kasih", "tolong", "ada", "dengan"]),
];

const MARATHI_MARKERS: &[&str] = &["आहे", "आणि", "नाही", "मी", "तुम्ही", "कुठे", "काय", "आहेत"];
const HINDI_MARKERS: &[&str] = &["है", "और", "नहीं", "मैं", "आप", "कहाँ", "क्या", "हैं", "का", "की", "में"];

/// Heuristic identifier combining script analysis with Latin stop-word scoring.
pub struct HeuristicDetector {
    min_confidence: f32,
    profiles: Vec<(&'static str, HashSet<&'static str>)>,
}

impl HeuristicDetector {
    pub fn new(min_confidence: f32) -> Self {
        let profiles = LATIN_PROFILES
            .iter()
            .map(|(code, words)| (*code, words.iter().copied().collect()))
            .collect();
        Self {
            min_confidence: min_confidence.clamp(0.0, 1.0),
            profiles,
        }
    }

    fn classify_latin(&self, text: &str) -> (String, f32) {
        let lower = text.to_lowercase();
        let tokens: Vec<&str> = lower
            .split(|c: char| !(c.is_alphanumeric() || c == '\''))
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.is_empty() {
            return (UNDETERMINED_LANGUAGE.to_string(), 0.0);
        }

        let hits: Vec<usize> = self
            .profiles
            .iter()
            .map(|(_, words)| tokens.iter().filter(|t| words.contains(*t)).count())
            .collect();
        let total: usize = hits.iter().sum();
        // First profile wins ties, keeping the result deterministic.
        let (best_idx, best) = hits
            .iter()
            .enumerate()
            .fold((0, 0), |acc, (i, &h)| if h > acc.1 { (i, h) } else { acc });
        if best == 0 {
            return (UNDETERMINED_LANGUAGE.to_string(), 0.0);
        }

        let share = best as f32 / total as f32;
        let coverage = (best as f32 * 2.0 / tokens.len() as f32).min(1.0);
        let confidence = share * (0.5 + 0.5 * coverage);
        (self.profiles[best_idx].0.to_string(), confidence)
    }

    fn classify_devanagari(text: &str) -> &'static str {
        let mr = MARATHI_MARKERS.iter().filter(|w| text.contains(**w)).count();
        let hi = HINDI_MARKERS.iter().filter(|w| text.contains(**w)).count();
        if mr > hi {
            "mr"
        } else {
            "hi"
        }
    }
}

impl Default for HeuristicDetector {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl LanguageIdentifier for HeuristicDetector {
    fn detect(&self, text: &str) -> AssistantResult<Detection> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AssistantError::UnsupportedInput("empty text".into()));
        }

        let mut counts: Vec<(Script, usize)> = Vec::new();
        let mut letters = 0usize;
        for c in text.chars().filter(|c| c.is_alphabetic()) {
            letters += 1;
            let script = script_of(c);
            match counts.iter_mut().find(|(s, _)| *s == script) {
                Some((_, n)) => *n += 1,
                None => counts.push((script, 1)),
            }
        }
        if letters == 0 {
            return Err(AssistantError::UnsupportedInput(
                "text contains no letters".into(),
            ));
        }

        let count = |script: Script| {
            counts
                .iter()
                .find(|(s, _)| *s == script)
                .map_or(0, |(_, n)| *n)
        };
        let (dominant, dominant_count) = counts
            .iter()
            .copied()
            .max_by_key(|(_, n)| *n)
            .unwrap_or((Script::Other, 0));
        let fraction = dominant_count as f32 / letters as f32;

        let (language, confidence) = match dominant {
            Script::Latin => {
                let (lang, conf) = self.classify_latin(text);
                (lang, conf * fraction)
            }
            // Japanese mixes kanji with kana; any kana tips Han text to Japanese.
            Script::Han | Script::Kana if count(Script::Kana) > 0 => {
                let share = (count(Script::Han) + count(Script::Kana)) as f32 / letters as f32;
                ("ja".to_string(), share)
            }
            Script::Han => ("zh".to_string(), fraction),
            Script::Kana => ("ja".to_string(), fraction),
            Script::Devanagari => (Self::classify_devanagari(text).to_string(), fraction),
            Script::Arabic => ("ar".to_string(), fraction),
            Script::Cyrillic => ("ru".to_string(), fraction),
            Script::Greek => ("el".to_string(), fraction),
            Script::Hebrew => ("he".to_string(), fraction),
            Script::Hangul => ("ko".to_string(), fraction),
            Script::Thai => ("th".to_string(), fraction),
            Script::Other => (UNDETERMINED_LANGUAGE.to_string(), 0.0),
        };

        if language == UNDETERMINED_LANGUAGE || confidence < self.min_confidence {
            tracing::debug!(confidence, "Language undetermined");
            return Ok(Detection::undetermined(confidence));
        }
        Ok(Detection {
            language,
            confidence,
        })
    }
}
