//! Deterministic token counting for window accounting.
//!
//! Used when callers do not supply a count. Word runs and individual
//! punctuation marks count as one token each; long words are split every
//! four characters, roughly tracking BPE tokenizers.

use std::sync::OnceLock;

use regex::Regex;

const CHARS_PER_TOKEN: usize = 4;

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\w+|[^\w\s]").expect("static token pattern"))
}

pub fn count_tokens(text: &str) -> u32 {
    let count: usize = token_pattern()
        .find_iter(text)
        .map(|m| {
            let chars = m.as_str().chars().count();
            chars.div_ceil(CHARS_PER_TOKEN).max(1)
        })
        .sum();
    count as u32
}

/// Lowercased alphanumeric terms, used for keyword overlap scoring.
pub fn terms(text: &str) -> Vec<String> {
    static TERMS: OnceLock<Regex> = OnceLock::new();
    let re = TERMS.get_or_init(|| Regex::new(r"[a-z0-9]+").expect("static term pattern"));
    let lowered = text.to_lowercase();
    re.find_iter(&lowered).map(|m| m.as_str().to_string()).collect()
}
