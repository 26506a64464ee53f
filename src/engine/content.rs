//! Fragment text cleaning
//!
//! Feed-style pages interleave real content with UI chrome: timestamps,
//! view counters, "Subscribe" buttons. That noise is removed before a fragment
//! is fingerprinted or described to the classifier, otherwise two copies of the
//! same post with different view counts would never look similar.

use once_cell::sync::Lazy;
use regex::Regex;

static UI_NOISE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?xi)
        \b\d{1,2}:\d{2}(?::\d{2})?\b                                 # 12:34, 1:02:03
        | \b\d[\d.,]*\s*[km]?\s+views?\b                             # 1.2K views
        | \b\d+\s+(?:second|minute|hour|day|week|month|year)s?\s+ago\b
        | \bsubscribe\b
        | \bnotifications?\b
        | \bwatch\s+later\b
        | \bshare\b
        | \b(?:see|show|read)\s+more\b
        | \bshow\s+this\s+thread\b
        | \bquote\s+tweet\b
        | \[(?:deleted|removed)\]
        ",
    )
    .expect("static noise pattern")
});

static WHITESPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("static pattern"));

static NON_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\w\s]").expect("static pattern"));

/// Strips UI noise and judges whether text is worth classifying
#[derive(Debug, Clone)]
pub struct TextCleaner {
    min_length: usize,
    max_noise_ratio: f64,
}

impl TextCleaner {
    pub fn new(min_length: usize) -> Self {
        Self {
            min_length,
            max_noise_ratio: 0.5,
        }
    }

    /// Remove UI noise and normalise whitespace
    pub fn clean(&self, text: &str) -> String {
        let stripped = UI_NOISE.replace_all(text, " ");
        WHITESPACE.replace_all(&stripped, " ").trim().to_string()
    }

    /// Whether cleaned text carries enough signal to send to the classifier
    pub fn is_valid(&self, cleaned: &str) -> bool {
        let chars = cleaned.chars().count();
        if chars == 0 || cleaned.trim().chars().count() < self.min_length {
            return false;
        }
        let noise = NON_WORD.find_iter(cleaned).count();
        (noise as f64 / chars as f64) <= self.max_noise_ratio
    }

    /// Cut `text` to `max_chars` characters, marking the cut with an ellipsis
    pub fn truncate(text: &str, max_chars: usize) -> String {
        if text.chars().count() <= max_chars {
            return text.to_string();
        }
        let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
        out.push('…');
        out
    }
}

impl Default for TextCleaner {
    fn default() -> Self {
        Self::new(10)
    }
}
