//! Structured search criteria
//!
//! One value is built per inbound query and shared by reference with every
//! backend the query fans out to.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::types::SearchMode;

static IMDB_ID_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:tt)?(\d{1,8})$").expect("imdb id pattern is valid"));

/// Normalise an IMDb id to its `tt` form with 7 (or 8) digits
///
/// Accepts `tt0133093`, `133093` and similar. Returns `None` for anything
/// that is not an IMDb id.
pub fn normalize_imdb_id(value: &str) -> Option<String> {
    let value = value.trim().to_lowercase();
    let caps = IMDB_ID_REGEX.captures(&value)?;
    let number: u64 = caps.get(1)?.as_str().parse().ok()?;
    if number == 0 {
        return None;
    }

    if number > 9_999_999 {
        Some(format!("tt{:08}", number))
    } else {
        Some(format!("tt{:07}", number))
    }
}

/// Fields shared by every search mode
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchBase {
    /// Free text, tokens already extracted
    pub term: Option<String>,
    /// Requested generic categories; empty means unrestricted
    pub categories: Vec<i32>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    /// Explicit backend allowlist (may contain the -1/-2 sentinels)
    pub indexer_ids: Option<Vec<i32>>,
    /// Minimum age in days
    pub min_age: Option<i32>,
    /// Maximum age in days
    pub max_age: Option<i32>,
    /// Minimum size in bytes
    pub min_size: Option<i64>,
    /// Maximum size in bytes
    pub max_size: Option<i64>,
}

impl SearchBase {
    /// The term stripped down to characters backends accept
    pub fn sanitized_term(&self) -> String {
        self.term
            .as_deref()
            .map(|term| {
                term.chars()
                    .filter(|c| c.is_alphanumeric() || c.is_whitespace() || "-._()@/'[]+%".contains(*c))
                    .collect::<String>()
            })
            .unwrap_or_default()
    }

    pub fn has_term(&self) -> bool {
        self.term.as_deref().is_some_and(|t| !t.trim().is_empty())
    }

    pub fn is_rss(&self) -> bool {
        !self.has_term()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicSearch {
    pub base: SearchBase,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovieSearch {
    pub base: SearchBase,
    /// Always in `tt1234567` form
    pub imdb_id: Option<String>,
    pub tmdb_id: Option<i64>,
    pub trakt_id: Option<i64>,
    pub douban_id: Option<i64>,
    pub year: Option<i32>,
    pub genre: Option<String>,
}

impl MovieSearch {
    /// The IMDb id without its `tt` prefix, as Newznab backends expect it
    pub fn imdb_id_short(&self) -> Option<&str> {
        self.imdb_id.as_deref().map(|id| id.trim_start_matches("tt"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TvSearch {
    pub base: SearchBase,
    pub imdb_id: Option<String>,
    pub tvdb_id: Option<i64>,
    pub tmdb_id: Option<i64>,
    /// TVRage id
    pub rid: Option<i64>,
    pub tvmaze_id: Option<i64>,
    pub trakt_id: Option<i64>,
    pub douban_id: Option<i64>,
    pub season: Option<i32>,
    /// Kept as text: daily shows use `02/14` style episodes
    pub episode: Option<String>,
    pub year: Option<i32>,
    pub genre: Option<String>,
}

impl TvSearch {
    pub fn imdb_id_short(&self) -> Option<&str> {
        self.imdb_id.as_deref().map(|id| id.trim_start_matches("tt"))
    }

    /// Leading numeric part of the episode, if any
    pub fn episode_number(&self) -> Option<i32> {
        let digits: String = self
            .episode
            .as_deref()?
            .trim()
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.parse().ok()
    }

    /// `S01E05` style label used when falling back to a text search
    pub fn episode_label(&self) -> Option<String> {
        match (self.season, self.episode_number()) {
            (Some(season), Some(episode)) => Some(format!("S{:02}E{:02}", season, episode)),
            (Some(season), None) => Some(format!("S{:02}", season)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MusicSearch {
    pub base: SearchBase,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub label: Option<String>,
    pub track: Option<String>,
    pub year: Option<i32>,
    pub genre: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSearch {
    pub base: SearchBase,
    pub author: Option<String>,
    pub title: Option<String>,
    pub publisher: Option<String>,
    pub year: Option<i32>,
    pub genre: Option<String>,
}

/// A fully parsed query, one variant per search mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SearchCriteria {
    Basic(BasicSearch),
    Movie(MovieSearch),
    Tv(TvSearch),
    Music(MusicSearch),
    Book(BookSearch),
}

impl Default for SearchCriteria {
    fn default() -> Self {
        SearchCriteria::Basic(BasicSearch::default())
    }
}

impl SearchCriteria {
    pub fn mode(&self) -> SearchMode {
        match self {
            SearchCriteria::Basic(_) => SearchMode::Search,
            SearchCriteria::Movie(_) => SearchMode::Movie,
            SearchCriteria::Tv(_) => SearchMode::TvSearch,
            SearchCriteria::Music(_) => SearchMode::Music,
            SearchCriteria::Book(_) => SearchMode::Book,
        }
    }

    pub fn base(&self) -> &SearchBase {
        match self {
            SearchCriteria::Basic(c) => &c.base,
            SearchCriteria::Movie(c) => &c.base,
            SearchCriteria::Tv(c) => &c.base,
            SearchCriteria::Music(c) => &c.base,
            SearchCriteria::Book(c) => &c.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut SearchBase {
        match self {
            SearchCriteria::Basic(c) => &mut c.base,
            SearchCriteria::Movie(c) => &mut c.base,
            SearchCriteria::Tv(c) => &mut c.base,
            SearchCriteria::Music(c) => &mut c.base,
            SearchCriteria::Book(c) => &mut c.base,
        }
    }

    pub fn categories(&self) -> &[i32] {
        &self.base().categories
    }

    /// Mode-specific identifiers for log lines
    fn extra_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = Vec::new();
        let mut push = |name: &'static str, value: Option<String>| {
            if let Some(value) = value {
                fields.push((name, value));
            }
        };

        match self {
            SearchCriteria::Basic(_) => {}
            SearchCriteria::Movie(m) => {
                push("ImdbId", m.imdb_id.clone());
                push("TmdbId", m.tmdb_id.map(|v| v.to_string()));
                push("TraktId", m.trakt_id.map(|v| v.to_string()));
                push("DoubanId", m.douban_id.map(|v| v.to_string()));
                push("Year", m.year.map(|v| v.to_string()));
                push("Genre", m.genre.clone());
            }
            SearchCriteria::Tv(t) => {
                push("ImdbId", t.imdb_id.clone());
                push("TvdbId", t.tvdb_id.map(|v| v.to_string()));
                push("TmdbId", t.tmdb_id.map(|v| v.to_string()));
                push("RId", t.rid.map(|v| v.to_string()));
                push("TvMazeId", t.tvmaze_id.map(|v| v.to_string()));
                push("TraktId", t.trakt_id.map(|v| v.to_string()));
                push("DoubanId", t.douban_id.map(|v| v.to_string()));
                push("Season", t.season.map(|v| v.to_string()));
                push("Episode", t.episode.clone());
            }
            SearchCriteria::Music(m) => {
                push("Artist", m.artist.clone());
                push("Album", m.album.clone());
                push("Label", m.label.clone());
                push("Track", m.track.clone());
                push("Year", m.year.map(|v| v.to_string()));
            }
            SearchCriteria::Book(b) => {
                push("Author", b.author.clone());
                push("Title", b.title.clone());
                push("Publisher", b.publisher.clone());
                push("Year", b.year.map(|v| v.to_string()));
            }
        }

        fields
    }
}

impl fmt::Display for SearchCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = self.base();
        let categories = base
            .categories
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(", ");

        write!(
            f,
            "{{Term: {}, Offset: {}, Limit: {}, Categories: [{}]",
            base.term.as_deref().unwrap_or(""),
            base.offset.unwrap_or(0),
            base.limit.unwrap_or(0),
            categories
        )?;

        for (name, value) in self.extra_fields() {
            write!(f, ", {}: {}", name, value)?;
        }

        write!(f, "}}")
    }
}
