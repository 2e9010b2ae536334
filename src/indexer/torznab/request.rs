//! Torznab request parsing
//!
//! Parses query parameters into [`SearchCriteria`].

use serde::Deserialize;

use super::tokenizer::{TokenizedTerm, tokenize};
use crate::indexer::criteria::{
    BasicSearch, BookSearch, MovieSearch, MusicSearch, SearchBase, SearchCriteria, TvSearch, normalize_imdb_id,
};
use crate::indexer::error::SearchError;
use crate::indexer::types::SearchMode;

/// Torznab API request parameters
#[derive(Debug, Deserialize, Default, Clone)]
pub struct TorznabRequest {
    /// Query type: search, tvsearch, movie, music, book, caps
    pub t: Option<String>,
    /// Search query, may carry `{key:value}` tokens
    pub q: Option<String>,
    pub apikey: Option<String>,
    /// Categories (comma-separated)
    pub cat: Option<String>,
    pub extended: Option<String>,
    pub limit: Option<String>,
    pub offset: Option<String>,

    // TV-specific
    pub season: Option<String>,
    pub ep: Option<String>,
    pub imdbid: Option<String>,
    pub tvdbid: Option<String>,
    /// TVRage ID
    pub rid: Option<String>,
    pub tmdbid: Option<String>,
    pub tvmazeid: Option<String>,
    pub traktid: Option<String>,
    pub doubanid: Option<String>,

    // Music-specific
    pub album: Option<String>,
    pub artist: Option<String>,
    pub label: Option<String>,
    pub track: Option<String>,

    // Book-specific
    pub title: Option<String>,
    pub author: Option<String>,
    pub publisher: Option<String>,

    // Common
    pub year: Option<String>,
    pub genre: Option<String>,

    /// Backend allowlist (comma-separated), `-1`/`-2` for all Usenet/Torrent
    #[serde(rename = "indexerIds", alias = "indexerids")]
    pub indexer_ids: Option<String>,
    /// Minimum age in days
    pub minage: Option<String>,
    /// Maximum age in days
    pub maxage: Option<String>,
    /// Minimum size in bytes
    pub minsize: Option<String>,
    /// Maximum size in bytes
    pub maxsize: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn number<T: std::str::FromStr>(value: &Option<String>) -> Option<T> {
    value.as_deref().and_then(|v| v.trim().parse().ok())
}

/// Parse a comma-separated id list, rejecting anything non-numeric
fn id_list(name: &str, value: &Option<String>) -> Result<Vec<i32>, SearchError> {
    let Some(value) = value.as_deref() else {
        return Ok(Vec::new());
    };

    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i32>()
                .map_err(|_| SearchError::InvalidQuery(format!("Invalid {} value: {}", name, s)))
        })
        .collect()
}

/// Token value when present, otherwise the parameter
fn pick(tokens: &TokenizedTerm, key: &str, param: &Option<String>) -> Option<String> {
    tokens
        .get(key)
        .map(str::to_string)
        .filter(|v| !v.is_empty())
        .or_else(|| non_empty(param))
}

fn pick_number<T: std::str::FromStr>(tokens: &TokenizedTerm, key: &str, param: &Option<String>) -> Option<T> {
    tokens.get_number(key).or_else(|| number(param))
}

/// Numeric episodes lose their padding, anything else is kept verbatim
fn normalize_episode(episode: String) -> String {
    if !episode.is_empty() && episode.chars().all(|c| c.is_ascii_digit()) {
        episode
            .parse::<u32>()
            .map(|n| n.to_string())
            .unwrap_or(episode)
    } else {
        episode
    }
}

impl TorznabRequest {
    /// Whether this is a capabilities request
    pub fn is_caps(&self) -> bool {
        matches!(self.t.as_deref().map(str::trim), Some("caps") | Some("capabilities"))
    }

    pub fn mode(&self) -> Result<SearchMode, SearchError> {
        match self.t.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            None => Ok(SearchMode::Search),
            Some(t) => t
                .parse()
                .map_err(|_| SearchError::InvalidQuery(format!("Unknown query type: {}", t))),
        }
    }

    /// Convert to structured criteria
    ///
    /// Tokens embedded in `q` override the matching parameters.
    pub fn to_criteria(&self) -> Result<SearchCriteria, SearchError> {
        let mode = self.mode()?;
        let tokens = tokenize(mode, self.q.as_deref().unwrap_or_default());

        let indexer_ids = id_list("indexerIds", &self.indexer_ids)?;
        let base = SearchBase {
            term: tokens.has_text().then(|| tokens.text.clone()),
            categories: id_list("cat", &self.cat)?,
            limit: number(&self.limit),
            offset: number(&self.offset),
            indexer_ids: (!indexer_ids.is_empty()).then_some(indexer_ids),
            min_age: number(&self.minage),
            max_age: number(&self.maxage),
            min_size: number(&self.minsize),
            max_size: number(&self.maxsize),
        };

        let year = pick_number(&tokens, "year", &self.year);
        let genre = pick(&tokens, "genre", &self.genre);
        let imdb_id = pick(&tokens, "imdbid", &self.imdbid).and_then(|id| normalize_imdb_id(&id));

        Ok(match mode {
            SearchMode::Search => SearchCriteria::Basic(BasicSearch { base }),
            SearchMode::Movie => SearchCriteria::Movie(MovieSearch {
                base,
                imdb_id,
                tmdb_id: pick_number(&tokens, "tmdbid", &self.tmdbid),
                trakt_id: pick_number(&tokens, "traktid", &self.traktid),
                douban_id: pick_number(&tokens, "doubanid", &self.doubanid),
                year,
                genre,
            }),
            SearchMode::TvSearch => SearchCriteria::Tv(TvSearch {
                base,
                imdb_id,
                tvdb_id: pick_number(&tokens, "tvdbid", &self.tvdbid),
                tmdb_id: pick_number(&tokens, "tmdbid", &self.tmdbid),
                rid: pick_number(&tokens, "rid", &self.rid),
                tvmaze_id: pick_number(&tokens, "tvmazeid", &self.tvmazeid),
                trakt_id: pick_number(&tokens, "traktid", &self.traktid),
                douban_id: pick_number(&tokens, "doubanid", &self.doubanid),
                season: pick_number(&tokens, "season", &self.season),
                episode: pick(&tokens, "episode", &self.ep).map(normalize_episode),
                year,
                genre,
            }),
            SearchMode::Music => SearchCriteria::Music(MusicSearch {
                base,
                artist: pick(&tokens, "artist", &self.artist),
                album: pick(&tokens, "album", &self.album),
                label: pick(&tokens, "label", &self.label),
                track: pick(&tokens, "track", &self.track),
                year,
                genre,
            }),
            SearchMode::Book => SearchCriteria::Book(BookSearch {
                base,
                author: pick(&tokens, "author", &self.author),
                title: pick(&tokens, "title", &self.title),
                publisher: pick(&tokens, "publisher", &self.publisher),
                year,
                genre,
            }),
        })
    }
}
