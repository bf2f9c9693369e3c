//! Text normalization shared by every metric.

use unicode_normalization::UnicodeNormalization;

/// NFKC, lowercase, punctuation replaced by spaces, whitespace collapsed.
///
/// Applying it twice gives the same result as applying it once.
pub fn normalize(text: &str) -> String {
    let folded: String = text
        .nfkc()
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Tokens of the normalized text.
pub fn tokens(text: &str) -> Vec<String> {
    normalize(text).split(' ').filter(|t| !t.is_empty()).map(str::to_string).collect()
}
