use regex::Regex;
use std::collections::HashSet;

/// Content detectors applied to intro text.
pub trait TextClassifier: Send + Sync {
    fn is_rude(&self, text: &str) -> bool;
    fn is_spam(&self, text: &str) -> bool;
}

const RUDE_WORDS: &[&str] = &[
    "bitch", "cunt", "faggot", "fuck", "fucking", "nigger", "retard", "slut", "whore",
];

/// Keyword and pattern heuristics for rudeness and spam
pub struct HeuristicClassifier {
    rude_words: HashSet<String>,
    url_pattern: Regex,
    contact_pattern: Regex,
}

impl HeuristicClassifier {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            rude_words: RUDE_WORDS.iter().map(|w| w.to_string()).collect(),
            url_pattern: Regex::new(
                r"(?i)(https?://\S+|www\.\S+|\b[a-z0-9-]+\.(com|net|org|io|ly|me|gg|xyz|app)\b)",
            )?,
            contact_pattern: Regex::new(r"(?i)\b(snap(chat)?|telegram|whatsapp|kik|onlyfans)\b")?,
        })
    }

    pub fn with_rude_words<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.rude_words = words.into_iter().map(|w| w.as_ref().to_lowercase()).collect();
        self
    }

    fn has_gibberish(&self, text: &str) -> bool {
        text.split_whitespace().any(|word| {
            let letters: Vec<char> = word.chars().filter(|c| c.is_alphabetic()).collect();
            if letters.len() < 8 {
                return false;
            }
            let vowels = letters
                .iter()
                .filter(|c| "aeiouyAEIOUY".contains(**c))
                .count();
            vowels * 10 < letters.len()
        })
    }
}

impl TextClassifier for HeuristicClassifier {
    fn is_rude(&self, text: &str) -> bool {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .any(|word| self.rude_words.contains(word))
    }

    fn is_spam(&self, text: &str) -> bool {
        self.url_pattern.is_match(text)
            || self.contact_pattern.is_match(text)
            || self.has_gibberish(text)
    }
}
