//! Free-text normalization for issue titles and descriptions
//!
//! Produces the ordered token sequences the similarity scorer works on.

/// Words that carry no meaning for matching purposes.
const STOPWORDS: &[&str] = &[
    "a", "the", "and", "or", "but", "in", "on", "at", "to", "for", "is", "are",
];

/// Tokens of this many characters or fewer are dropped.
const MIN_TOKEN_LEN: usize = 2;

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Lower-case the text and replace everything that isn't a word character or
/// whitespace with a space. Whitespace is collapsed and the result trimmed.
pub fn clean(text: &str) -> String {
    let lowered = text.to_lowercase();
    let replaced: String = lowered
        .chars()
        .map(|c| {
            if is_word_char(c) || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Tokenize text into meaningful, order-preserving tokens.
///
/// Absent or empty input yields an empty sequence.
pub fn normalize(text: Option<&str>) -> Vec<String> {
    let Some(text) = text.filter(|t| !t.trim().is_empty()) else {
        return Vec::new();
    };

    clean(text)
        .split(' ')
        .filter(|word| word.chars().count() > MIN_TOKEN_LEN && !STOPWORDS.contains(word))
        .map(str::to_string)
        .collect()
}

/// Pick up to `n` distinct tokens, longest first.
///
/// Ties keep their original position so the result is deterministic.
pub fn significant_terms(tokens: &[String], n: usize) -> Vec<String> {
    let mut unique: Vec<(usize, &String)> = Vec::new();
    for (idx, token) in tokens.iter().enumerate() {
        if !unique.iter().any(|(_, t)| *t == token) {
            unique.push((idx, token));
        }
    }
    unique.sort_by(|(ia, a), (ib, b)| b.len().cmp(&a.len()).then(ia.cmp(ib)));
    unique
        .into_iter()
        .take(n)
        .map(|(_, t)| t.clone())
        .collect()
}

/// Configured keywords that occur in `text`, case-insensitively, in keyword order.
pub fn matched_keywords<'a>(text: &str, keywords: &'a [String]) -> Vec<&'a str> {
    let haystack = text.to_lowercase();
    keywords
        .iter()
        .filter(|k| !k.is_empty() && haystack.contains(&k.to_lowercase()))
        .map(String::as_str)
        .collect()
}
