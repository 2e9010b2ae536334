//! Bracket token extraction from free-text search terms
//!
//! Callers that cannot send structured parameters embed them in `q`, e.g.
//! `Show Name {tvdbid:12345}{season:01}{episode:05}`. Tokens allowed for the
//! search mode are pulled out; anything else stays part of the text.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::indexer::types::SearchMode;

static TOKEN_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z]+):([^{}]*)\}").expect("token pattern is valid"));

const TV_TOKENS: &[&str] = &[
    "imdbid", "rid", "tvdbid", "tmdbid", "tvmazeid", "traktid", "doubanid", "season", "episode", "year", "genre",
];
const MOVIE_TOKENS: &[&str] = &["imdbid", "tmdbid", "traktid", "doubanid", "year", "genre"];
const MUSIC_TOKENS: &[&str] = &["artist", "album", "label", "track", "year", "genre"];
const BOOK_TOKENS: &[&str] = &["author", "title", "publisher", "year", "genre"];

/// Token keys recognised for a search mode
pub fn allowed_tokens(mode: SearchMode) -> &'static [&'static str] {
    match mode {
        SearchMode::Search => &[],
        SearchMode::TvSearch => TV_TOKENS,
        SearchMode::Movie => MOVIE_TOKENS,
        SearchMode::Music => MUSIC_TOKENS,
        SearchMode::Book => BOOK_TOKENS,
    }
}

/// A term split into its remaining text and extracted tokens
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenizedTerm {
    /// Text left after extraction, whitespace collapsed
    pub text: String,
    /// Extracted `(key, value)` pairs in order of appearance, keys lowercased
    pub tokens: Vec<(String, String)>,
}

impl TokenizedTerm {
    /// Last value given for a key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.tokens
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Last value for a key parsed as a number
    pub fn get_number<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn has_text(&self) -> bool {
        !self.text.is_empty()
    }
}

/// Extract the tokens allowed for `mode` from a term
pub fn tokenize(mode: SearchMode, term: &str) -> TokenizedTerm {
    let allowed = allowed_tokens(mode);
    let mut tokens = Vec::new();

    let remaining = TOKEN_REGEX.replace_all(term, |caps: &regex::Captures| {
        let key = caps[1].to_lowercase();
        if allowed.contains(&key.as_str()) {
            tokens.push((key, caps[2].trim().to_string()));
            " ".to_string()
        } else {
            caps[0].to_string()
        }
    });

    TokenizedTerm {
        text: remaining.split_whitespace().collect::<Vec<_>>().join(" "),
        tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_adjacent_tokens() {
        let tokenized = tokenize(SearchMode::TvSearch, "foo {season:02}{episode:05}");
        assert_eq!(tokenized.text, "foo");
        assert_eq!(tokenized.get_number::<i32>("season"), Some(2));
        assert_eq!(tokenized.get("episode"), Some("05"));
    }

    #[test]
    fn test_tokens_not_allowed_for_mode_stay_in_text() {
        let tokenized = tokenize(SearchMode::Movie, "Title {season:1} {TmdbId:603}");
        assert_eq!(tokenized.text, "Title {season:1}");
        assert_eq!(tokenized.get_number::<i64>("tmdbid"), Some(603));
    }

    #[test]
    fn test_basic_search_keeps_everything() {
        let tokenized = tokenize(SearchMode::Search, "  a  {imdbid:tt0133093}   b ");
        assert_eq!(tokenized.text, "a {imdbid:tt0133093} b");
        assert!(tokenized.tokens.is_empty());
    }

    #[test]
    fn test_last_token_wins() {
        let tokenized = tokenize(SearchMode::Music, "{artist:One} {artist:Two}");
        assert_eq!(tokenized.get("artist"), Some("Two"));
        assert!(!tokenized.has_text());
    }
}
