use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{TranslationModel, TranslationOutput};

/// On-disk format of a phrase-table translation model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LexiconFile {
    pub source: String,
    pub target: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub entries: HashMap<String, String>,
}

fn default_version() -> String {
    "1".into()
}

/// Phrase-table model. Translates by greedy longest-phrase matching; words
/// without an entry pass through unchanged.
#[derive(Debug, Clone)]
pub struct LexiconModel {
    model_id: String,
    version: String,
    phrases: HashMap<String, String>,
    longest_phrase: usize,
}

impl LexiconModel {
    pub fn from_file(file: LexiconFile) -> Self {
        let mut phrases = HashMap::new();
        let mut longest_phrase = 1;
        for (key, value) in file.entries {
            let normalized = key
                .split_whitespace()
                .map(normalize_word)
                .collect::<Vec<_>>()
                .join(" ");
            if normalized.is_empty() {
                continue;
            }
            longest_phrase = longest_phrase.max(normalized.split(' ').count());
            phrases.insert(normalized, value);
        }
        Self {
            model_id: format!("{}-{}", file.source, file.target),
            version: file.version,
            phrases,
            longest_phrase,
        }
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let file: LexiconFile = serde_json::from_slice(bytes)?;
        Ok(Self::from_file(file))
    }

    pub fn len(&self) -> usize {
        self.phrases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }
}

fn normalize_word(word: &str) -> String {
    word.trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase()
}

/// Split a token into (leading punctuation, core, trailing punctuation).
fn split_punctuation(token: &str) -> (&str, &str, &str) {
    let start = token
        .find(|c: char| c.is_alphanumeric())
        .unwrap_or(token.len());
    let end = token
        .rfind(|c: char| c.is_alphanumeric())
        .map_or(start, |i| i + token[i..].chars().next().map_or(1, char::len_utf8));
    (&token[..start], &token[start..end.max(start)], &token[end.max(start)..])
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl TranslationModel for LexiconModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn translate(&self, text: &str) -> TranslationOutput {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        let words: Vec<String> = tokens.iter().map(|t| normalize_word(t)).collect();
        let total_words = words.iter().filter(|w| !w.is_empty()).count();

        let mut out: Vec<String> = Vec::with_capacity(tokens.len());
        let mut covered = 0usize;
        let mut i = 0;
        while i < tokens.len() {
            let max_len = self.longest_phrase.min(tokens.len() - i);
            let matched = (1..=max_len).rev().find_map(|len| {
                let key = words[i..i + len].join(" ");
                self.phrases.get(&key).map(|t| (len, t))
            });
            match matched {
                Some((len, translated)) if !words[i].is_empty() => {
                    let (lead, core, _) = split_punctuation(tokens[i]);
                    let (_, _, trail) = split_punctuation(tokens[i + len - 1]);
                    let starts_upper = core.chars().next().is_some_and(char::is_uppercase);
                    let rendered = if starts_upper {
                        capitalize(translated)
                    } else {
                        translated.clone()
                    };
                    out.push(format!("{lead}{rendered}{trail}"));
                    covered += words[i..i + len].iter().filter(|w| !w.is_empty()).count();
                    i += len;
                }
                _ => {
                    out.push(tokens[i].to_string());
                    i += 1;
                }
            }
        }

        TranslationOutput {
            text: out.join(" "),
            covered_words: covered,
            total_words,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> LexiconModel {
        LexiconModel::from_file(LexiconFile {
            source: "es".into(),
            target: "en".into(),
            version: "1".into(),
            entries: [
                ("dónde", "where"),
                ("está", "is"),
                ("el", "the"),
                ("baño", "bathroom"),
                ("buenos días", "good morning"),
                ("muchas gracias", "thank you very much"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        })
    }

    #[test]
    fn translates_with_longest_phrase() {
        let out = model().translate("Buenos días, ¿dónde está el baño?");
        assert_eq!(out.text, "Good morning, ¿where is the bathroom?");
        assert_eq!(out.covered_words, 6);
        assert_eq!(out.total_words, 6);
    }

    #[test]
    fn unknown_words_pass_through() {
        let out = model().translate("el tren rápido");
        assert_eq!(out.text, "the tren rápido");
        assert_eq!((out.covered_words, out.total_words), (1, 3));
    }

    #[test]
    fn model_id_from_pair() {
        let m = model();
        assert_eq!(m.model_id(), "es-en");
        assert_eq!(m.len(), 6);
    }

    #[test]
    fn parses_json() {
        let json = br#"{"source":"en","target":"fr","entries":{"hello":"bonjour"}}"#;
        let m = LexiconModel::from_json(json).unwrap();
        assert_eq!(m.version(), "1");
        assert_eq!(m.translate("Hello!").text, "Bonjour!");
    }

    #[test]
    fn punctuation_split() {
        assert_eq!(split_punctuation("¿dónde"), ("¿", "dónde", ""));
        assert_eq!(split_punctuation("baño?"), ("", "baño", "?"));
        assert_eq!(split_punctuation("..."), ("...", "", ""));
    }
}
