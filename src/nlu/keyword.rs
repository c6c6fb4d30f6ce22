//! Keyword-pattern intent classifier with simple entity extraction.

use super::{IntentClassifier, normalize};
use crate::error::Result;
use crate::pipeline::messages::{Intent, SlotValue, Slots};
use async_trait::async_trait;

/// Phrase matches are more specific than single keywords.
const PHRASE_CONFIDENCE: f32 = 0.92;
const KEYWORD_CONFIDENCE: f32 = 0.85;
/// A follow-up like "what about tomorrow" inherits the previous intent.
const FOLLOW_UP_CONFIDENCE: f32 = 0.7;
const UNKNOWN_CONFIDENCE: f32 = 0.3;

/// Name of the context slot holding the last committed intent.
pub const LAST_INTENT_SLOT: &str = "last_intent";

const PATTERNS: &[(&str, &[&str])] = &[
    ("greeting", &["hello", "hi", "hey", "good morning", "good afternoon", "good evening"]),
    ("status", &["status", "how are you", "system check", "health"]),
    ("capabilities", &["what can you do", "capabilities", "features", "skills", "help"]),
    ("time", &["what time", "time", "clock", "hour"]),
    ("weather", &["weather", "temperature", "forecast", "rain", "sunny"]),
    ("system", &["diagnostics", "performance", "report"]),
    ("memory", &["remember", "recall", "memory", "history"]),
    ("schedule", &["schedule", "calendar", "appointment", "meeting", "reminder"]),
    ("news", &["news", "headlines", "current events"]),
    ("shutdown", &["shutdown", "turn off", "goodbye", "exit"]),
];

const RELATIVE_DAYS: &[&str] = &["today", "tomorrow", "yesterday", "next week", "next month"];

const FOLLOW_UP_PREFIXES: &[&str] = &["what about", "how about", "and"];

const PLACE_STOPWORDS: &[&str] = &[
    "the", "a", "an", "my", "this", "that", "there", "here", "it", "minutes", "hours",
];

/// Built-in classifier matching keyword patterns.
#[derive(Debug, Clone, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Classify without context. Deterministic and synchronous.
    #[must_use]
    pub fn classify_text(&self, text: &str) -> Intent {
        self.classify_with_context(text, &Slots::new())
    }

    fn classify_with_context(&self, text: &str, context: &Slots) -> Intent {
        let normalized = normalize(text);
        let padded = format!(" {normalized} ");

        let mut best: Option<(&str, f32)> = None;
        for &(intent, patterns) in PATTERNS {
            let score = patterns
                .iter()
                .filter(|p| padded.contains(&format!(" {p} ")))
                .map(|p| {
                    if p.contains(' ') {
                        PHRASE_CONFIDENCE
                    } else {
                        KEYWORD_CONFIDENCE
                    }
                })
                .fold(0.0_f32, f32::max);
            if score > 0.0 && best.is_none_or(|(_, s)| score > s) {
                best = Some((intent, score));
            }
        }

        let mut intent = match best {
            Some((name, confidence)) => Intent::new(name, confidence),
            None => match follow_up_intent(&normalized, context) {
                Some(name) => Intent::new(name, FOLLOW_UP_CONFIDENCE),
                None => Intent::new("general", UNKNOWN_CONFIDENCE),
            },
        };
        intent.slots = extract_entities(text);
        intent
    }
}

#[async_trait]
impl IntentClassifier for KeywordClassifier {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn classify(&self, text: &str, context: &Slots) -> Result<Intent> {
        Ok(self.classify_with_context(text, context))
    }
}

fn follow_up_intent<'a>(normalized: &str, context: &'a Slots) -> Option<&'a str> {
    let last = context.get(LAST_INTENT_SLOT)?.as_text()?;
    FOLLOW_UP_PREFIXES
        .iter()
        .any(|p| normalized.starts_with(&format!("{p} ")))
        .then_some(last)
}

/// Pull relative days, numbers and an "in <place>" location out of `text`.
#[must_use]
pub fn extract_entities(text: &str) -> Slots {
    let mut slots = Slots::new();
    let normalized = normalize(text);
    let padded = format!(" {normalized} ");

    if let Some(day) = RELATIVE_DAYS
        .iter()
        .find(|d| padded.contains(&format!(" {d} ")))
    {
        slots.insert("day".to_owned(), SlotValue::Text((*day).to_owned()));
    }

    if let Some(number) = normalized
        .split_whitespace()
        .find_map(|w| w.parse::<f64>().ok())
    {
        slots.insert("number".to_owned(), SlotValue::Number(number));
    }

    // Keep the caller's casing for place names.
    let words: Vec<&str> = text
        .split(|c: char| c.is_whitespace() || matches!(c, ',' | '?' | '!' | '.'))
        .filter(|w| !w.is_empty())
        .collect();
    if let Some(pos) = words.iter().position(|w| w.eq_ignore_ascii_case("in"))
        && let Some(place) = words.get(pos + 1)
        && place.chars().all(char::is_alphabetic)
        && !PLACE_STOPWORDS.contains(&place.to_ascii_lowercase().as_str())
    {
        slots.insert("city".to_owned(), SlotValue::Text((*place).to_owned()));
    }

    slots
}
