//! Core types for the indexer system
//!
//! These types follow the Newznab/Torznab vocabulary: search modes, the
//! per-mode parameters a backend can accept, the capability descriptor and
//! the normalized release record.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::categories::CategoryMap;
use super::criteria::SearchCriteria;

/// Which kind of download a backend hands out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadProtocol {
    Usenet,
    Torrent,
}

impl std::fmt::Display for DownloadProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadProtocol::Usenet => write!(f, "usenet"),
            DownloadProtocol::Torrent => write!(f, "torrent"),
        }
    }
}

/// Access model of a backend site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexerPrivacy {
    Public,
    SemiPrivate,
    #[default]
    Private,
}

impl std::fmt::Display for IndexerPrivacy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexerPrivacy::Public => write!(f, "public"),
            IndexerPrivacy::SemiPrivate => write!(f, "semi-private"),
            IndexerPrivacy::Private => write!(f, "private"),
        }
    }
}

/// Search mode of a query (the `t` parameter)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// General text search
    #[default]
    Search,
    /// TV search (supports season/episode)
    TvSearch,
    Movie,
    Music,
    Book,
}

impl std::fmt::Display for SearchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchMode::Search => write!(f, "search"),
            SearchMode::TvSearch => write!(f, "tvsearch"),
            SearchMode::Movie => write!(f, "movie"),
            SearchMode::Music => write!(f, "music"),
            SearchMode::Book => write!(f, "book"),
        }
    }
}

impl std::str::FromStr for SearchMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "search" | "q" => Ok(SearchMode::Search),
            "tvsearch" | "tv-search" | "tv" => Ok(SearchMode::TvSearch),
            "movie" | "movie-search" | "moviesearch" => Ok(SearchMode::Movie),
            "music" | "music-search" | "musicsearch" | "audio" => Ok(SearchMode::Music),
            "book" | "book-search" | "booksearch" => Ok(SearchMode::Book),
            _ => Err(anyhow::anyhow!("Unknown search mode: {}", s)),
        }
    }
}

macro_rules! search_params {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $param:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Wire name of the parameter
            pub fn as_param(&self) -> &'static str {
                match self {
                    $($name::$variant => $param),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_param())
            }
        }

        impl std::str::FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_lowercase().as_str() {
                    $($param => Ok($name::$variant),)+
                    _ => Err(anyhow::anyhow!("Unknown search parameter: {}", s)),
                }
            }
        }
    };
}

search_params! {
    /// Basic search parameters supported by a backend
    SearchParam {
        Q => "q",
    }
}

search_params! {
    /// TV search parameters supported by a backend
    TvSearchParam {
        Q => "q",
        Season => "season",
        Ep => "ep",
        ImdbId => "imdbid",
        TvdbId => "tvdbid",
        RId => "rid",
        TmdbId => "tmdbid",
        TvMazeId => "tvmazeid",
        TraktId => "traktid",
        DoubanId => "doubanid",
        Year => "year",
        Genre => "genre",
    }
}

search_params! {
    /// Movie search parameters supported by a backend
    MovieSearchParam {
        Q => "q",
        ImdbId => "imdbid",
        TmdbId => "tmdbid",
        TraktId => "traktid",
        DoubanId => "doubanid",
        Year => "year",
        Genre => "genre",
    }
}

search_params! {
    /// Music search parameters supported by a backend
    MusicSearchParam {
        Q => "q",
        Album => "album",
        Artist => "artist",
        Label => "label",
        Track => "track",
        Year => "year",
        Genre => "genre",
    }
}

search_params! {
    /// Book search parameters supported by a backend
    BookSearchParam {
        Q => "q",
        Title => "title",
        Author => "author",
        Publisher => "publisher",
        Year => "year",
        Genre => "genre",
    }
}

/// What a backend can do: modes, parameters per mode, paging and categories
///
/// A mode is available when its parameter list is non-empty. Built once per
/// backend and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerCapabilities {
    /// Maximum results per page
    pub limits_max: Option<u32>,
    /// Default results per page
    pub limits_default: Option<u32>,

    pub search_params: Vec<SearchParam>,
    /// Whether raw search is supported
    pub supports_raw_search: bool,
    pub tv_search_params: Vec<TvSearchParam>,
    pub movie_search_params: Vec<MovieSearchParam>,
    pub music_search_params: Vec<MusicSearchParam>,
    pub book_search_params: Vec<BookSearchParam>,

    /// Results per page the backend returns, 0 when it does not page
    pub page_size: usize,
    /// Whether an offset can be passed through to the backend
    pub supports_pagination: bool,

    pub categories: CategoryMap,
}

impl Default for IndexerCapabilities {
    fn default() -> Self {
        Self {
            limits_max: Some(100),
            limits_default: Some(100),
            search_params: vec![SearchParam::Q],
            supports_raw_search: false,
            tv_search_params: Vec::new(),
            movie_search_params: Vec::new(),
            music_search_params: Vec::new(),
            book_search_params: Vec::new(),
            page_size: 0,
            supports_pagination: false,
            categories: CategoryMap::new(),
        }
    }
}

impl IndexerCapabilities {
    pub fn search_available(&self) -> bool {
        !self.search_params.is_empty()
    }

    pub fn tv_search_available(&self) -> bool {
        !self.tv_search_params.is_empty()
    }

    pub fn movie_search_available(&self) -> bool {
        !self.movie_search_params.is_empty()
    }

    pub fn music_search_available(&self) -> bool {
        !self.music_search_params.is_empty()
    }

    pub fn book_search_available(&self) -> bool {
        !self.book_search_params.is_empty()
    }

    pub fn has_tv_param(&self, param: TvSearchParam) -> bool {
        self.tv_search_params.contains(&param)
    }

    pub fn has_movie_param(&self, param: MovieSearchParam) -> bool {
        self.movie_search_params.contains(&param)
    }

    pub fn has_music_param(&self, param: MusicSearchParam) -> bool {
        self.music_search_params.contains(&param)
    }

    pub fn has_book_param(&self, param: BookSearchParam) -> bool {
        self.book_search_params.contains(&param)
    }

    /// Whether the backend can service the given search mode at all
    pub fn supports_mode(&self, mode: SearchMode) -> bool {
        match mode {
            SearchMode::Search => self.search_available(),
            SearchMode::TvSearch => self.tv_search_available(),
            SearchMode::Movie => self.movie_search_available(),
            SearchMode::Music => self.music_search_available(),
            SearchMode::Book => self.book_search_available(),
        }
    }

    /// Whether every parameter the criteria uses is supported
    ///
    /// A backend that would have to drop an id or field the caller asked
    /// for is skipped rather than answering a looser query. An offset on a
    /// backend without pagination is unsupported as well.
    pub fn supports_criteria(&self, criteria: &SearchCriteria) -> bool {
        if !self.supports_mode(criteria.mode()) {
            return false;
        }

        if !self.supports_pagination && criteria.base().offset.is_some_and(|o| o > 0) {
            return false;
        }

        let unsupported = |used: bool, supported: bool| used && !supported;

        match criteria {
            SearchCriteria::Basic(_) => true,
            SearchCriteria::Movie(m) => {
                !(unsupported(m.imdb_id.is_some(), self.has_movie_param(MovieSearchParam::ImdbId))
                    || unsupported(m.tmdb_id.is_some(), self.has_movie_param(MovieSearchParam::TmdbId))
                    || unsupported(m.trakt_id.is_some(), self.has_movie_param(MovieSearchParam::TraktId))
                    || unsupported(m.douban_id.is_some(), self.has_movie_param(MovieSearchParam::DoubanId))
                    || unsupported(m.genre.is_some(), self.has_movie_param(MovieSearchParam::Genre))
                    || unsupported(m.year.is_some(), self.has_movie_param(MovieSearchParam::Year)))
            }
            SearchCriteria::Tv(t) => {
                !(unsupported(t.imdb_id.is_some(), self.has_tv_param(TvSearchParam::ImdbId))
                    || unsupported(t.tvdb_id.is_some(), self.has_tv_param(TvSearchParam::TvdbId))
                    || unsupported(t.rid.is_some(), self.has_tv_param(TvSearchParam::RId))
                    || unsupported(t.tvmaze_id.is_some(), self.has_tv_param(TvSearchParam::TvMazeId))
                    || unsupported(t.trakt_id.is_some(), self.has_tv_param(TvSearchParam::TraktId))
                    || unsupported(t.tmdb_id.is_some(), self.has_tv_param(TvSearchParam::TmdbId))
                    || unsupported(t.douban_id.is_some(), self.has_tv_param(TvSearchParam::DoubanId))
                    || unsupported(t.genre.is_some(), self.has_tv_param(TvSearchParam::Genre))
                    || unsupported(t.year.is_some(), self.has_tv_param(TvSearchParam::Year)))
            }
            SearchCriteria::Music(m) => {
                !(unsupported(m.album.is_some(), self.has_music_param(MusicSearchParam::Album))
                    || unsupported(m.artist.is_some(), self.has_music_param(MusicSearchParam::Artist))
                    || unsupported(m.label.is_some(), self.has_music_param(MusicSearchParam::Label))
                    || unsupported(m.track.is_some(), self.has_music_param(MusicSearchParam::Track))
                    || unsupported(m.genre.is_some(), self.has_music_param(MusicSearchParam::Genre))
                    || unsupported(m.year.is_some(), self.has_music_param(MusicSearchParam::Year)))
            }
            SearchCriteria::Book(b) => {
                !(unsupported(b.title.is_some(), self.has_book_param(BookSearchParam::Title))
                    || unsupported(b.author.is_some(), self.has_book_param(BookSearchParam::Author))
                    || unsupported(b.publisher.is_some(), self.has_book_param(BookSearchParam::Publisher))
                    || unsupported(b.genre.is_some(), self.has_book_param(BookSearchParam::Genre))
                    || unsupported(b.year.is_some(), self.has_book_param(BookSearchParam::Year)))
            }
        }
    }
}

/// A configured backend as the core sees it
///
/// Created when an operator registers a backend; read-only at query time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerDefinition {
    pub id: i32,
    pub name: String,
    pub enabled: bool,
    pub protocol: DownloadProtocol,
    /// Key into the implementation table (e.g. "newznab")
    pub implementation: String,
    pub privacy: IndexerPrivacy,
    /// Lower runs first when callers sort by indexer
    pub priority: i32,
    /// Maximum queries per day
    pub query_limit: Option<u32>,
    /// Maximum queries per calendar month
    pub query_limit_monthly: Option<u32>,
    /// Minimum spacing between requests to this backend's hosts
    pub rate_limit_ms: Option<u64>,
    pub capabilities: IndexerCapabilities,
    /// Backend-specific settings, opaque to the core
    pub settings: HashMap<String, String>,
}

impl IndexerDefinition {
    pub fn new(id: i32, name: impl Into<String>, protocol: DownloadProtocol) -> Self {
        Self {
            id,
            name: name.into(),
            enabled: true,
            protocol,
            implementation: match protocol {
                DownloadProtocol::Usenet => "newznab".to_string(),
                DownloadProtocol::Torrent => "torznab".to_string(),
            },
            privacy: IndexerPrivacy::default(),
            priority: 25,
            query_limit: None,
            query_limit_monthly: None,
            rate_limit_ms: None,
            capabilities: IndexerCapabilities::default(),
            settings: HashMap::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: IndexerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings
            .get(key)
            .map(|s| s.as_str())
            .filter(|s| !s.trim().is_empty())
    }
}

/// A normalized search result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub title: String,

    /// Unique identifier (usually the details URL)
    pub guid: String,

    /// Download link (nzb or torrent file)
    pub link: Option<String>,

    pub magnet_uri: Option<String>,

    pub info_hash: Option<String>,

    /// Details page URL
    pub details: Option<String>,

    pub comments: Option<String>,

    pub publish_date: DateTime<Utc>,

    /// Generic category ids
    pub categories: Vec<i32>,

    /// Size in bytes
    pub size: Option<i64>,

    pub files: Option<i32>,

    pub grabs: Option<i32>,

    pub description: Option<String>,

    // Metadata IDs
    pub imdb_id: Option<i64>,
    pub tmdb_id: Option<i64>,
    pub tvdb_id: Option<i64>,
    pub tvmaze_id: Option<i64>,
    pub trakt_id: Option<i64>,
    pub rage_id: Option<i64>,
    pub douban_id: Option<i64>,

    pub genres: Vec<String>,
    pub year: Option<i32>,

    pub poster: Option<String>,

    // Torrent-only fields
    pub seeders: Option<i32>,
    /// Number of peers (seeders + leechers)
    pub peers: Option<i32>,
    /// 0 = freeleech, 1 = normal
    pub download_volume_factor: Option<f64>,
    pub upload_volume_factor: Option<f64>,
    pub minimum_ratio: Option<f64>,
    /// Minimum seed time in seconds
    pub minimum_seed_time: Option<i64>,

    pub protocol: DownloadProtocol,

    /// The backend that produced this release
    pub indexer_id: i32,
    pub indexer: String,
    pub indexer_priority: i32,
}

impl ReleaseInfo {
    /// Create a release with minimal info
    pub fn new(title: impl Into<String>, guid: impl Into<String>, publish_date: DateTime<Utc>) -> Self {
        Self {
            title: title.into(),
            guid: guid.into(),
            link: None,
            magnet_uri: None,
            info_hash: None,
            details: None,
            comments: None,
            publish_date,
            categories: Vec::new(),
            size: None,
            files: None,
            grabs: None,
            description: None,
            imdb_id: None,
            tmdb_id: None,
            tvdb_id: None,
            tvmaze_id: None,
            trakt_id: None,
            rage_id: None,
            douban_id: None,
            genres: Vec::new(),
            year: None,
            poster: None,
            seeders: None,
            peers: None,
            download_volume_factor: None,
            upload_volume_factor: None,
            minimum_ratio: None,
            minimum_seed_time: None,
            protocol: DownloadProtocol::Usenet,
            indexer_id: 0,
            indexer: String::new(),
            indexer_priority: 25,
        }
    }

    /// Stamp the producing backend onto the release
    pub fn with_indexer(mut self, definition: &IndexerDefinition) -> Self {
        self.indexer_id = definition.id;
        self.indexer = definition.name.clone();
        self.indexer_priority = definition.priority;
        self.protocol = definition.protocol;
        self
    }

    pub fn leechers(&self) -> Option<i32> {
        match (self.peers, self.seeders) {
            (Some(peers), Some(seeders)) => Some(peers.saturating_sub(seeders)),
            _ => None,
        }
    }

    /// Age in whole days relative to `now`
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.publish_date).num_days()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::criteria::{BasicSearch, MovieSearch, SearchBase, TvSearch};

    #[test]
    fn test_search_mode_aliases() {
        assert_eq!("tv-search".parse::<SearchMode>().unwrap(), SearchMode::TvSearch);
        assert_eq!("MOVIE".parse::<SearchMode>().unwrap(), SearchMode::Movie);
        assert_eq!("audio".parse::<SearchMode>().unwrap(), SearchMode::Music);
        assert!("caps".parse::<SearchMode>().is_err());
        assert_eq!(SearchMode::TvSearch.to_string(), "tvsearch");
    }

    #[test]
    fn test_param_names_round_trip() {
        for param in TvSearchParam::ALL {
            assert_eq!(param.as_param().parse::<TvSearchParam>().unwrap(), *param);
        }
        assert_eq!("TvMazeId".parse::<TvSearchParam>().unwrap(), TvSearchParam::TvMazeId);
        assert!("bogus".parse::<BookSearchParam>().is_err());
    }

    #[test]
    fn test_supports_mode_follows_param_lists() {
        let caps = IndexerCapabilities {
            movie_search_params: vec![MovieSearchParam::Q, MovieSearchParam::ImdbId],
            ..Default::default()
        };

        assert!(caps.supports_mode(SearchMode::Search));
        assert!(caps.supports_mode(SearchMode::Movie));
        assert!(!caps.supports_mode(SearchMode::Music));
        assert!(!caps.supports_mode(SearchMode::TvSearch));
    }

    #[test]
    fn test_supports_criteria_rejects_unsupported_ids() {
        let caps = IndexerCapabilities {
            movie_search_params: vec![MovieSearchParam::Q, MovieSearchParam::ImdbId],
            tv_search_params: vec![TvSearchParam::Q, TvSearchParam::Season, TvSearchParam::Ep],
            ..Default::default()
        };

        let by_imdb = SearchCriteria::Movie(MovieSearch {
            imdb_id: Some("tt0133093".to_string()),
            ..Default::default()
        });
        let by_tmdb = SearchCriteria::Movie(MovieSearch {
            tmdb_id: Some(603),
            ..Default::default()
        });
        let by_tvdb = SearchCriteria::Tv(TvSearch {
            tvdb_id: Some(81189),
            season: Some(1),
            ..Default::default()
        });

        assert!(caps.supports_criteria(&by_imdb));
        assert!(!caps.supports_criteria(&by_tmdb));
        assert!(!caps.supports_criteria(&by_tvdb));
    }

    #[test]
    fn test_offset_requires_pagination() {
        let paged = SearchCriteria::Basic(BasicSearch {
            base: SearchBase {
                offset: Some(100),
                ..Default::default()
            },
        });

        let mut caps = IndexerCapabilities::default();
        assert!(!caps.supports_criteria(&paged));

        caps.supports_pagination = true;
        assert!(caps.supports_criteria(&paged));
    }

    #[test]
    fn test_capabilities_from_yaml_defaults() {
        let yaml = "movie_search_params: [q, tmdbid]\ncategories:\n  - id: \"44\"\n    generic: [2000]\n";
        let caps: IndexerCapabilities = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(caps.limits_max, Some(100));
        assert!(caps.search_available());
        assert!(caps.has_movie_param(MovieSearchParam::TmdbId));
        assert!(caps.categories.supports(&[2000]));
    }

    #[test]
    fn test_leechers() {
        let mut release = ReleaseInfo::new("a", "b", Utc::now());
        assert_eq!(release.leechers(), None);
        release.seeders = Some(10);
        release.peers = Some(14);
        assert_eq!(release.leechers(), Some(4));

        release.peers = Some(i32::MIN);
        assert_eq!(release.leechers(), Some(i32::MIN));
    }
}
