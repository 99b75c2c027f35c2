use std::sync::LazyLock;

use regex::Regex;

static WORD_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\w+").expect("invalid word regex pattern"));

/// Lowercase word tokens of `text`, in order.
///
/// This is the only tokenizer in the crate: keyword scoring, hashed
/// embeddings and snippet highlighting all agree on what a term is.
///
/// # Examples
///
/// ```
/// use docrag::text_util::tokenize;
///
/// assert_eq!(tokenize("Hello, World! snake_case"), vec![
///     "hello",
///     "world",
///     "snake_case"
/// ]);
/// ```
pub fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    WORD_PATTERN
        .find_iter(&lowered)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Extract a snippet around the first occurrence of any query term.
///
/// Matching is case-insensitive. The snippet keeps `window` characters of
/// context on each side of the match and is marked with `...` where it
/// was cut. Without a match the leading `2 * window` characters are used.
pub fn snippet(text: &str, query: &str, window: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    let (start, end) = match first_match(text, &tokenize(query)) {
        Some((match_start, match_end)) => (
            match_start.saturating_sub(window),
            (match_end + window).min(chars.len()),
        ),
        None => (0, (2 * window).min(chars.len())),
    };

    let mut out = String::new();
    if start > 0 {
        out.push_str("...");
    }
    out.extend(&chars[start..end]);
    if end < chars.len() {
        out.push_str("...");
    }
    out
}

/// Character span `(start, end)` of the earliest occurrence of any term.
fn first_match(text: &str, terms: &[String]) -> Option<(usize, usize)> {
    if terms.is_empty() {
        return None;
    }

    // Lowercasing may change lengths, so keep a map from lowered byte
    // offsets back to original character positions.
    let mut lowered = String::with_capacity(text.len());
    let mut origin: Vec<usize> = Vec::with_capacity(text.len() + 1);
    for (char_idx, c) in text.chars().enumerate() {
        for lower in c.to_lowercase() {
            lowered.push(lower);
            origin.extend(std::iter::repeat_n(char_idx, lower.len_utf8()));
        }
    }
    origin.push(text.chars().count());

    terms
        .iter()
        .filter_map(|term| {
            let at = lowered.find(term.as_str())?;
            let end = origin[at + term.len()];
            Some((origin[at], end.max(origin[at] + 1)))
        })
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_splits_on_non_word_characters() {
        assert_eq!(tokenize("cat-dog cat"), vec!["cat", "dog", "cat"]);
        assert_eq!(tokenize("Ünïcode wörds"), vec!["ünïcode", "wörds"]);
        assert!(tokenize("  ... !!").is_empty());
    }

    #[test]
    fn snippet_centers_on_match() {
        let text = format!("{}needle{}", "a ".repeat(50), " b".repeat(50));
        let snip = snippet(&text, "NEEDLE", 10);
        assert!(snip.starts_with("..."));
        assert!(snip.ends_with("..."));
        assert!(snip.contains("needle"));
        assert_eq!(snip.chars().count(), 3 + 10 + 6 + 10 + 3);
    }

    #[test]
    fn snippet_is_case_insensitive() {
        let snip = snippet("The Rust Book", "rust", 100);
        assert_eq!(snip, "The Rust Book");
    }

    #[test]
    fn snippet_uses_earliest_term() {
        let text = "zzz alpha yyy beta";
        let snip = snippet(text, "beta alpha", 2);
        assert_eq!(snip, "...z alpha y...");
    }

    #[test]
    fn snippet_without_match_returns_head() {
        let text = "x".repeat(300);
        let snip = snippet(&text, "missing", 100);
        assert_eq!(snip.chars().count(), 203);
        assert!(snip.ends_with("..."));
        assert!(!snip.starts_with("..."));
    }

    #[test]
    fn snippet_of_short_text_is_untouched() {
        assert_eq!(snippet("short", "", 100), "short");
        assert_eq!(snippet("", "query", 100), "");
    }

    #[test]
    fn snippet_handles_multibyte_text() {
        let text = "日本語のテキスト and İstanbul café";
        let snip = snippet(text, "café", 4);
        assert!(snip.ends_with("café"));
        assert!(snip.starts_with("..."));
    }
}
