use anyhow::{Context, Result};
use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SafetyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_denylist")]
    pub denylist: Vec<String>,
    #[serde(default = "default_qualifier")]
    pub qualifier: String,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            denylist: default_denylist(),
            qualifier: default_qualifier(),
        }
    }
}

fn default_denylist() -> Vec<String> {
    [
        "blood", "bloody", "kill", "killing", "dead", "death", "weapon", "gun", "knife", "sword",
        "fight", "violence", "violent", "horror", "scary", "monster", "war", "injury",
    ]
    .iter()
    .map(|w| w.to_string())
    .collect()
}

fn default_qualifier() -> String {
    "child-friendly, gentle and safe for young readers".to_string()
}

/// Client-side scrub of image prompts. Whole words only, case-insensitive.
/// Rewordings and synonyms pass straight through.
#[derive(Debug, Clone)]
pub struct SafetyFilter {
    pattern: Option<Regex>,
    qualifier: String,
}

impl SafetyFilter {
    pub fn new(config: &SafetyConfig) -> Result<Self> {
        let words: Vec<String> = config
            .denylist
            .iter()
            .map(|w| w.trim())
            .filter(|w| !w.is_empty())
            .map(bounded_term)
            .collect();

        let pattern = if words.is_empty() {
            None
        } else {
            let source = format!(r"(?i)(?:{})", words.join("|"));
            Some(Regex::new(&source).context("Invalid safety denylist")?)
        };

        Ok(Self {
            pattern,
            qualifier: config.qualifier.trim().to_string(),
        })
    }

    /// Removes denylisted words and squeezes the gaps they leave behind.
    pub fn scrub(&self, text: &str) -> String {
        let Some(pattern) = &self.pattern else {
            return text.to_string();
        };
        let removed = pattern.replace_all(text, "");
        if removed != text {
            debug!("Safety filter removed words from prompt: {}", text);
        }
        removed.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    pub fn qualifier(&self) -> &str {
        &self.qualifier
    }
}

/// Escapes `term` and puts `\b` on each side whose edge character is a word character.
/// A punctuation edge has no boundary to anchor on, and Han or kana text has no spaces.
fn bounded_term(term: &str) -> String {
    let anchored = |c: Option<char>| {
        c.is_some_and(|c| (c.is_alphanumeric() || c == '_') && !is_unspaced_script(c))
    };
    let mut source = String::new();
    if anchored(term.chars().next()) {
        source.push_str(r"\b");
    }
    source.push_str(&regex::escape(term));
    if anchored(term.chars().next_back()) {
        source.push_str(r"\b");
    }
    source
}

fn is_unspaced_script(c: char) -> bool {
    matches!(
        c,
        '\u{3040}'..='\u{30FF}'
            | '\u{3400}'..='\u{4DBF}'
            | '\u{4E00}'..='\u{9FFF}'
            | '\u{F900}'..='\u{FAFF}'
            | '\u{20000}'..='\u{2FFFF}'
    )
}
