//! Newznab/Torznab indexer implementation
//!
//! Newznab is the standard API for Usenet indexers (NZBGeek, DrunkenSlug,
//! etc.); Torznab is the same API serving torrents. Both share the request
//! format and the RSS response shape, so one generator and one parser cover
//! both protocols.
//!
//! # Configuration
//!
//! Settings read from the indexer definition:
//! - `base_url`: site root, e.g. `https://api.nzbgeek.info`
//! - `api_path`: API path, defaults to `/api`
//! - `api_key`: API key from the indexer site
//! - `additional_parameters`: raw query string appended to every search

use std::sync::Arc;

use chrono::{DateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde::Serialize;
use tracing::{debug, warn};

use crate::indexer::cache::TtlCache;
use crate::indexer::categories::{STANDARD_CATEGORIES, StandardCategory, cats, get_category};
use crate::indexer::clock::Clock;
use crate::indexer::criteria::SearchBase;
use crate::indexer::{
    BasicSearch, BookSearch, BookSearchParam, DownloadProtocol, HttpExecutor, IndexerCapabilities,
    IndexerDefinition, IndexerError, IndexerHandlers, IndexerRequest, IndexerResponse, MovieSearch,
    MovieSearchParam, MusicSearch, MusicSearchParam, ReleaseInfo, RequestChain, RequestGenerator,
    ResponseParser, SearchParam, TvSearch, TvSearchParam,
};

/// Pages fetched at most for one search
pub const DEFAULT_MAX_PAGES: usize = 30;
/// Page size when the indexer does not advertise one
pub const DEFAULT_PAGE_SIZE: usize = 100;

const NZB_MIME_TYPE: &str = "application/x-nzb";
const TORRENT_MIME_TYPE: &str = "application/x-bittorrent";

/// Connection settings for one Newznab/Torznab indexer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct NewznabSettings {
    pub base_url: String,
    pub api_path: String,
    pub api_key: Option<String>,
    pub additional_parameters: Option<String>,
}

impl NewznabSettings {
    pub fn from_definition(definition: &IndexerDefinition) -> Self {
        Self {
            base_url: definition.setting("base_url").unwrap_or_default().trim().to_string(),
            api_path: definition.setting("api_path").unwrap_or("/api").trim().to_string(),
            api_key: definition.setting("api_key").map(str::to_string),
            additional_parameters: definition.setting("additional_parameters").map(str::to_string),
        }
    }

    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.base_url.is_empty() {
            return Err(IndexerError::NotConfigured("base_url is required".to_string()));
        }
        url::Url::parse(&self.base_url)
            .map_err(|e| IndexerError::NotConfigured(format!("invalid base_url: {}", e)))?;
        Ok(())
    }

    /// Full API endpoint without query string
    pub fn api_url(&self) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            self.api_path.trim_end_matches('/')
        )
    }

    /// Key the capabilities cache is indexed by
    pub fn cache_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.api_url())
    }

    pub fn caps_url(&self) -> String {
        let mut url = format!("{}?t=caps", self.api_url());
        if let Some(api_key) = &self.api_key {
            url.push_str("&apikey=");
            url.push_str(api_key);
        }
        url
    }
}

/// Builds Newznab API requests
pub struct NewznabRequestGenerator {
    settings: NewznabSettings,
    capabilities: IndexerCapabilities,
    max_pages: usize,
}

impl NewznabRequestGenerator {
    pub fn new(settings: NewznabSettings, capabilities: IndexerCapabilities) -> Self {
        Self {
            settings,
            capabilities,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    /// Id/field parameters first, or a plain text search when none applied
    fn chain(
        &self,
        search_type: &str,
        base: &SearchBase,
        mut params: Vec<(&'static str, String)>,
        mode_available: bool,
    ) -> RequestChain {
        let term = base.has_term().then(|| newznabify_term(base.term.as_deref().unwrap_or_default()));

        let search_type = if params.is_empty() {
            if let Some(term) = term.filter(|_| self.capabilities.search_available()) {
                params.push(("q", term));
            }
            "search"
        } else {
            if let Some(term) = term.filter(|_| mode_available) {
                params.push(("q", term));
            }
            search_type
        };

        let mut chain = RequestChain::new();
        chain.add(self.paged_requests(search_type, base, &params));
        chain
    }

    fn paged_requests(&self, search_type: &str, base: &SearchBase, params: &[(&'static str, String)]) -> Vec<IndexerRequest> {
        let mut url = format!("{}?t={}&extended=1", self.settings.api_url(), search_type);

        let categories = self.capabilities.categories.map_generic_to_native(&base.categories);
        if !categories.is_empty() {
            url.push_str("&cat=");
            url.push_str(&categories.join(","));
        }

        if let Some(additional) = &self.settings.additional_parameters {
            url.push_str(additional);
        }

        if let Some(api_key) = &self.settings.api_key {
            url.push_str("&apikey=");
            url.push_str(api_key);
        }

        for (key, value) in params {
            url.push_str(&format!("&{}={}", key, urlencoding::encode(value)));
        }

        let page_size = self.capabilities.page_size;
        let paged = page_size > 0 && base.limit.is_none() && base.offset.is_none() && !params.is_empty();

        if !paged {
            let mut single = url;
            if let Some(limit) = base.limit {
                single.push_str(&format!("&limit={}", limit));
            }
            if let Some(offset) = base.offset {
                single.push_str(&format!("&offset={}", offset));
            }
            return vec![IndexerRequest::get(single)];
        }

        (0..self.max_pages)
            .map(|page| {
                IndexerRequest::get(format!(
                    "{}&limit={}&offset={}",
                    url,
                    page_size,
                    page * page_size
                ))
            })
            .collect()
    }
}

impl RequestGenerator for NewznabRequestGenerator {
    fn basic_search(&self, criteria: &BasicSearch) -> Result<RequestChain, IndexerError> {
        Ok(self.chain("search", &criteria.base, Vec::new(), true))
    }

    fn movie_search(&self, criteria: &MovieSearch) -> Result<RequestChain, IndexerError> {
        let caps = &self.capabilities;
        let mut params = Vec::new();

        if let Some(id) = criteria.tmdb_id.filter(|_| caps.has_movie_param(MovieSearchParam::TmdbId)) {
            params.push(("tmdbid", id.to_string()));
        }
        if let Some(id) = criteria.imdb_id_short().filter(|_| caps.has_movie_param(MovieSearchParam::ImdbId)) {
            params.push(("imdbid", id.to_string()));
        }
        if let Some(id) = criteria.trakt_id.filter(|_| caps.has_movie_param(MovieSearchParam::TraktId)) {
            params.push(("traktid", id.to_string()));
        }
        if let Some(id) = criteria.douban_id.filter(|_| caps.has_movie_param(MovieSearchParam::DoubanId)) {
            params.push(("doubanid", id.to_string()));
        }
        if let Some(year) = criteria.year.filter(|_| caps.has_movie_param(MovieSearchParam::Year)) {
            params.push(("year", year.to_string()));
        }
        if let Some(genre) = criteria.genre.clone().filter(|_| caps.has_movie_param(MovieSearchParam::Genre)) {
            params.push(("genre", genre));
        }

        Ok(self.chain("movie", &criteria.base, params, caps.movie_search_available()))
    }

    fn tv_search(&self, criteria: &TvSearch) -> Result<RequestChain, IndexerError> {
        let caps = &self.capabilities;
        let mut params = Vec::new();

        if let Some(id) = criteria.tvdb_id.filter(|_| caps.has_tv_param(TvSearchParam::TvdbId)) {
            params.push(("tvdbid", id.to_string()));
        }
        if let Some(id) = criteria.imdb_id_short().filter(|_| caps.has_tv_param(TvSearchParam::ImdbId)) {
            params.push(("imdbid", id.to_string()));
        }
        if let Some(id) = criteria.tvmaze_id.filter(|_| caps.has_tv_param(TvSearchParam::TvMazeId)) {
            params.push(("tvmazeid", id.to_string()));
        }
        if let Some(id) = criteria.rid.filter(|_| caps.has_tv_param(TvSearchParam::RId)) {
            params.push(("rid", id.to_string()));
        }
        if let Some(id) = criteria.tmdb_id.filter(|_| caps.has_tv_param(TvSearchParam::TmdbId)) {
            params.push(("tmdbid", id.to_string()));
        }
        if let Some(id) = criteria.trakt_id.filter(|_| caps.has_tv_param(TvSearchParam::TraktId)) {
            params.push(("traktid", id.to_string()));
        }
        if let Some(id) = criteria.douban_id.filter(|_| caps.has_tv_param(TvSearchParam::DoubanId)) {
            params.push(("doubanid", id.to_string()));
        }
        if let Some(season) = criteria.season.filter(|_| caps.has_tv_param(TvSearchParam::Season)) {
            // Some servers mishandle season=0 unless padded
            params.push(("season", format!("{:02}", season)));
        }
        if let Some(ep) = criteria.episode.clone().filter(|_| caps.has_tv_param(TvSearchParam::Ep)) {
            params.push(("ep", ep));
        }
        if let Some(year) = criteria.year.filter(|_| caps.has_tv_param(TvSearchParam::Year)) {
            params.push(("year", year.to_string()));
        }
        if let Some(genre) = criteria.genre.clone().filter(|_| caps.has_tv_param(TvSearchParam::Genre)) {
            params.push(("genre", genre));
        }

        Ok(self.chain("tvsearch", &criteria.base, params, caps.tv_search_available()))
    }

    fn music_search(&self, criteria: &MusicSearch) -> Result<RequestChain, IndexerError> {
        let caps = &self.capabilities;
        let mut params = Vec::new();

        if let Some(artist) = criteria.artist.clone().filter(|_| caps.has_music_param(MusicSearchParam::Artist)) {
            params.push(("artist", artist));
        }
        if let Some(album) = criteria.album.clone().filter(|_| caps.has_music_param(MusicSearchParam::Album)) {
            params.push(("album", album));
        }
        if let Some(label) = criteria.label.clone().filter(|_| caps.has_music_param(MusicSearchParam::Label)) {
            params.push(("label", label));
        }
        if let Some(track) = criteria.track.clone().filter(|_| caps.has_music_param(MusicSearchParam::Track)) {
            params.push(("track", track));
        }
        if let Some(year) = criteria.year.filter(|_| caps.has_music_param(MusicSearchParam::Year)) {
            params.push(("year", year.to_string()));
        }
        if let Some(genre) = criteria.genre.clone().filter(|_| caps.has_music_param(MusicSearchParam::Genre)) {
            params.push(("genre", genre));
        }

        Ok(self.chain("music", &criteria.base, params, caps.music_search_available()))
    }

    fn book_search(&self, criteria: &BookSearch) -> Result<RequestChain, IndexerError> {
        let caps = &self.capabilities;
        let mut params = Vec::new();

        if let Some(author) = criteria.author.clone().filter(|_| caps.has_book_param(BookSearchParam::Author)) {
            params.push(("author", author));
        }
        if let Some(title) = criteria.title.clone().filter(|_| caps.has_book_param(BookSearchParam::Title)) {
            params.push(("title", title));
        }
        if let Some(publisher) = criteria
            .publisher
            .clone()
            .filter(|_| caps.has_book_param(BookSearchParam::Publisher))
        {
            params.push(("publisher", publisher));
        }
        if let Some(year) = criteria.year.filter(|_| caps.has_book_param(BookSearchParam::Year)) {
            params.push(("year", year.to_string()));
        }
        if let Some(genre) = criteria.genre.clone().filter(|_| caps.has_book_param(BookSearchParam::Genre)) {
            params.push(("genre", genre));
        }

        Ok(self.chain("book", &criteria.base, params, caps.book_search_available()))
    }

    fn is_configured(&self) -> Result<(), IndexerError> {
        self.settings.validate()
    }
}

/// A literal `+` in a term means a space to Newznab servers
fn newznabify_term(term: &str) -> String {
    term.trim().replace('+', " ")
}

/// Parses Newznab/Torznab RSS responses
pub struct NewznabParser {
    capabilities: IndexerCapabilities,
    protocol: DownloadProtocol,
}

impl NewznabParser {
    pub fn new(capabilities: IndexerCapabilities, protocol: DownloadProtocol) -> Self {
        Self {
            capabilities,
            protocol,
        }
    }

    fn expected_mime_type(&self) -> &'static str {
        match self.protocol {
            DownloadProtocol::Usenet => NZB_MIME_TYPE,
            DownloadProtocol::Torrent => TORRENT_MIME_TYPE,
        }
    }

    /// Generic ids for one native category reported on an item
    fn map_category(&self, native: &str) -> Vec<i32> {
        let mapped = self.capabilities.categories.map_native_to_generic(native);
        if !mapped.is_empty() {
            return mapped;
        }
        // Servers without a caps category list report standard ids
        native
            .trim()
            .parse::<i32>()
            .ok()
            .filter(|id| get_category(*id).is_some())
            .into_iter()
            .collect()
    }

    fn parse_feed(&self, xml: &str) -> Result<Vec<ReleaseInfo>, IndexerError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut releases = Vec::new();
        let mut current_item: Option<ReleaseInfoBuilder> = None;
        let mut current_tag = String::new();
        let mut skipped = 0usize;

        loop {
            match reader.read_event() {
                Ok(Event::Start(ref e)) => {
                    let tag_name = String::from_utf8_lossy(e.name().as_ref()).to_string();

                    if tag_name == "error" {
                        return Err(api_error(e));
                    }

                    if tag_name == "item" {
                        current_item = Some(ReleaseInfoBuilder::new());
                    } else if let Some(ref mut item) = current_item {
                        item.apply_element(&tag_name, e);
                    }
                    current_tag = tag_name;
                }
                Ok(Event::Empty(ref e)) => {
                    let tag_name = String::from_utf8_lossy(e.name().as_ref()).to_string();

                    if tag_name == "error" {
                        return Err(api_error(e));
                    }

                    if let Some(ref mut item) = current_item {
                        item.apply_element(&tag_name, e);
                    }
                }
                Ok(Event::Text(ref e)) => {
                    if let Some(ref mut item) = current_item {
                        let text = e.unescape().unwrap_or_default().to_string();
                        item.apply_text(&current_tag, text);
                    }
                }
                Ok(Event::CData(ref e)) => {
                    if let Some(ref mut item) = current_item {
                        let text = String::from_utf8_lossy(e.as_ref()).to_string();
                        item.apply_text(&current_tag, text);
                    }
                }
                Ok(Event::End(ref e)) => {
                    let tag_name = String::from_utf8_lossy(e.name().as_ref()).to_string();

                    if tag_name == "item" {
                        if let Some(item) = current_item.take() {
                            match item.build(self) {
                                Some(release) => releases.push(release),
                                None => skipped += 1,
                            }
                        }
                    }
                    current_tag.clear();
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    warn!(error = %e, "Error parsing Newznab XML");
                    return Err(e.into());
                }
                _ => {}
            }
        }

        if skipped > 0 {
            warn!(skipped = skipped, parsed = releases.len(), "Skipped unusable feed items");
        }

        Ok(releases)
    }
}

impl ResponseParser for NewznabParser {
    fn parse_releases(&self, response: &IndexerResponse) -> Result<Vec<ReleaseInfo>, IndexerError> {
        let releases = self.parse_feed(&response.body)?;
        debug!(
            url = %response.request.redacted_url(),
            releases = releases.len(),
            "Parsed Newznab response"
        );
        Ok(releases)
    }
}

fn attribute(e: &BytesStart, name: &str) -> Option<String> {
    e.attributes().flatten().find_map(|attr| {
        if attr.key.as_ref() == name.as_bytes() {
            Some(
                attr.unescape_value()
                    .map(|v| v.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned()),
            )
        } else {
            None
        }
    })
}

/// Map an `<error code=".." description=".."/>` element
fn api_error(e: &BytesStart) -> IndexerError {
    let code = attribute(e, "code")
        .and_then(|c| c.trim().parse::<u32>().ok())
        .unwrap_or(900);
    let description = attribute(e, "description").unwrap_or_default();

    if (100..=199).contains(&code) {
        return IndexerError::Auth(description);
    }
    if description == "Request limit reached" {
        return IndexerError::RequestLimitReached;
    }
    IndexerError::Api { code, description }
}

/// Helper to build ReleaseInfo from parsed XML
struct ReleaseInfoBuilder {
    title: Option<String>,
    guid: Option<String>,
    link: Option<String>,
    enclosure_type: Option<String>,
    pub_date: Option<DateTime<Utc>>,
    usenet_date: Option<DateTime<Utc>>,
    description: Option<String>,
    comments: Option<String>,
    size: Option<i64>,
    attr_categories: Vec<String>,
    element_categories: Vec<String>,
    files: Option<i32>,
    grabs: Option<i32>,
    seeders: Option<i32>,
    peers: Option<i32>,
    leechers: Option<i32>,
    info_hash: Option<String>,
    magnet_uri: Option<String>,
    imdb: Option<i64>,
    tmdb_id: Option<i64>,
    tvdb_id: Option<i64>,
    tvmaze_id: Option<i64>,
    trakt_id: Option<i64>,
    rage_id: Option<i64>,
    douban_id: Option<i64>,
    genres: Vec<String>,
    year: Option<i32>,
    download_volume_factor: Option<f64>,
    upload_volume_factor: Option<f64>,
    minimum_ratio: Option<f64>,
    minimum_seed_time: Option<i64>,
    poster: Option<String>,
}

impl ReleaseInfoBuilder {
    fn new() -> Self {
        Self {
            title: None,
            guid: None,
            link: None,
            enclosure_type: None,
            pub_date: None,
            usenet_date: None,
            description: None,
            comments: None,
            size: None,
            attr_categories: Vec::new(),
            element_categories: Vec::new(),
            files: None,
            grabs: None,
            seeders: None,
            peers: None,
            leechers: None,
            info_hash: None,
            magnet_uri: None,
            imdb: None,
            tmdb_id: None,
            tvdb_id: None,
            tvmaze_id: None,
            trakt_id: None,
            rage_id: None,
            douban_id: None,
            genres: Vec::new(),
            year: None,
            download_volume_factor: None,
            upload_volume_factor: None,
            minimum_ratio: None,
            minimum_seed_time: None,
            poster: None,
        }
    }

    fn apply_element(&mut self, tag_name: &str, e: &BytesStart) {
        match tag_name {
            "newznab:attr" | "torznab:attr" | "attr" => {
                let name = attribute(e, "name").unwrap_or_default();
                let value = attribute(e, "value").unwrap_or_default();
                self.set_newznab_attr(&name.to_lowercase(), value.trim());
            }
            "enclosure" => {
                if let Some(url) = attribute(e, "url") {
                    self.link = Some(url);
                }
                if let Some(length) = attribute(e, "length").and_then(|l| l.parse::<i64>().ok()) {
                    self.size.get_or_insert(length);
                }
                self.enclosure_type = attribute(e, "type");
            }
            _ => {}
        }
    }

    fn apply_text(&mut self, tag: &str, text: String) {
        if text.is_empty() {
            return;
        }
        match tag {
            "title" => self.title = Some(text),
            "guid" => self.guid = Some(text),
            "link" => {
                if self.link.is_none() {
                    self.link = Some(text);
                }
            }
            "pubDate" => self.pub_date = parse_rfc822_date(&text),
            "description" => self.description = Some(text),
            "comments" => self.comments = Some(text),
            "category" => self.element_categories.push(text),
            "size" => {
                if let Ok(size) = text.parse::<i64>() {
                    self.size.get_or_insert(size);
                }
            }
            _ => {}
        }
    }

    fn set_newznab_attr(&mut self, name: &str, value: &str) {
        match name {
            "size" => {
                if let Ok(size) = value.parse::<i64>() {
                    self.size = Some(size);
                }
            }
            "category" => self.attr_categories.push(value.to_string()),
            "files" => self.files = value.parse().ok(),
            "grabs" => self.grabs = value.parse().ok(),
            "seeders" => self.seeders = value.parse().ok(),
            "peers" => self.peers = value.parse().ok(),
            "leechers" => self.leechers = value.parse().ok(),
            "infohash" => self.info_hash = Some(value.to_string()),
            "magneturl" => self.magnet_uri = Some(value.to_string()),
            "imdb" | "imdbid" => self.imdb = value.trim_start_matches("tt").parse().ok(),
            "tmdbid" | "tmdb" => self.tmdb_id = value.parse().ok(),
            "tvdbid" | "tvdb" => self.tvdb_id = value.parse().ok(),
            "tvmazeid" | "tvmaze" => self.tvmaze_id = value.parse().ok(),
            "traktid" | "trakt" => self.trakt_id = value.parse().ok(),
            "rageid" | "tvrageid" => self.rage_id = value.parse().ok(),
            "doubanid" | "douban" => self.douban_id = value.parse().ok(),
            "genre" => {
                self.genres.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|g| !g.is_empty())
                        .map(str::to_string),
                );
            }
            "year" => self.year = value.parse().ok(),
            "usenetdate" => self.usenet_date = parse_rfc822_date(value),
            "downloadvolumefactor" => self.download_volume_factor = value.parse().ok(),
            "uploadvolumefactor" => self.upload_volume_factor = value.parse().ok(),
            "minimumratio" => self.minimum_ratio = value.parse().ok(),
            "minimumseedtime" => self.minimum_seed_time = value.parse().ok(),
            "poster" | "coverurl" => self.poster = Some(value.to_string()),
            _ => {
                debug!(attr_name = name, attr_value = value, "Unknown newznab attribute");
            }
        }
    }

    fn build(self, parser: &NewznabParser) -> Option<ReleaseInfo> {
        let Some(title) = self.title.filter(|t| !t.trim().is_empty()) else {
            debug!("Skipping item without a title");
            return None;
        };

        if let Some(kind) = &self.enclosure_type {
            if kind != parser.expected_mime_type() {
                debug!(title = %title, enclosure_type = %kind, "Skipping item with foreign enclosure type");
                return None;
            }
        }

        let Some(link) = self.link.or_else(|| self.magnet_uri.clone()) else {
            debug!(title = %title, "Skipping item without a link");
            return None;
        };
        let guid = self.guid.unwrap_or_else(|| link.clone());

        let natives = if self.attr_categories.is_empty() {
            self.element_categories
        } else {
            self.attr_categories
        };
        let mut categories: Vec<i32> = Vec::new();
        for native in &natives {
            for id in parser.map_category(native) {
                if !categories.contains(&id) {
                    categories.push(id);
                }
            }
        }

        let publish_date = self.usenet_date.or(self.pub_date).unwrap_or_else(Utc::now);
        let peers = self.peers.or(match (self.seeders, self.leechers) {
            (Some(seeders), Some(leechers)) => Some(seeders.saturating_add(leechers)),
            _ => None,
        });

        let mut release = ReleaseInfo::new(title, guid, publish_date);
        release.link = Some(link);
        release.magnet_uri = self.magnet_uri;
        release.info_hash = self.info_hash;
        release.details = self
            .comments
            .as_deref()
            .map(|c| c.trim_end_matches("#comments").to_string());
        release.comments = self.comments;
        release.categories = categories;
        release.size = self.size;
        release.files = self.files;
        release.grabs = self.grabs;
        release.description = self.description;
        release.imdb_id = self.imdb;
        release.tmdb_id = self.tmdb_id;
        release.tvdb_id = self.tvdb_id;
        release.tvmaze_id = self.tvmaze_id;
        release.trakt_id = self.trakt_id;
        release.rage_id = self.rage_id;
        release.douban_id = self.douban_id;
        release.genres = self.genres;
        release.year = self.year;
        release.poster = self.poster;
        release.protocol = parser.protocol;

        if parser.protocol == DownloadProtocol::Torrent {
            release.seeders = self.seeders;
            release.peers = peers;
            release.download_volume_factor = self.download_volume_factor.or(Some(1.0));
            release.upload_volume_factor = self.upload_volume_factor.or(Some(1.0));
            release.minimum_ratio = self.minimum_ratio;
            release.minimum_seed_time = self.minimum_seed_time;
        }

        Some(release)
    }
}

/// Parse RFC 822 date format (common in RSS/Atom feeds)
fn parse_rfc822_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();

    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }

    let formats = [
        "%a, %d %b %Y %H:%M:%S %z",
        "%d %b %Y %H:%M:%S %z",
        "%Y-%m-%dT%H:%M:%S%z",
        "%Y-%m-%d %H:%M:%S %z",
    ];

    for format in &formats {
        if let Ok(dt) = DateTime::parse_from_str(s, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

/// Parse a `t=caps` document into a capability descriptor
pub fn parse_capabilities(xml: &str) -> Result<IndexerCapabilities, IndexerError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut caps = IndexerCapabilities {
        supports_pagination: true,
        ..Default::default()
    };
    let mut saw_root = false;
    let mut parent: Option<(String, &'static StandardCategory)> = None;

    loop {
        let (e, is_empty) = match reader.read_event() {
            Ok(Event::Start(e)) => (e, false),
            Ok(Event::Empty(e)) => (e, true),
            Ok(Event::End(e)) => {
                if e.name().as_ref() == b"category" {
                    parent = None;
                }
                continue;
            }
            Ok(Event::Eof) => break,
            Ok(_) => continue,
            Err(e) => return Err(e.into()),
        };

        let tag_name = String::from_utf8_lossy(e.name().as_ref()).to_string();
        match tag_name.as_str() {
            "error" => return Err(api_error(&e)),
            "caps" => saw_root = true,
            "limits" => {
                caps.limits_default = attribute(&e, "default").and_then(|v| v.parse().ok());
                caps.limits_max = attribute(&e, "max").and_then(|v| v.parse().ok());
            }
            "search" | "tv-search" | "movie-search" | "audio-search" | "music-search" | "book-search" => {
                apply_search_element(&mut caps, &tag_name, &e);
            }
            "category" => {
                let Some(id) = attribute(&e, "id").and_then(|v| v.trim().parse::<i32>().ok()) else {
                    continue;
                };
                let name = attribute(&e, "name").unwrap_or_default();
                let mapped = map_parent_category(id, &name);
                caps.categories.add_mapping(id.to_string(), mapped.id, Some(&name));
                if !is_empty {
                    parent = Some((name, mapped));
                }
            }
            "subcat" => {
                let Some((parent_name, mapped_parent)) = parent.as_ref() else {
                    continue;
                };
                let Some(id) = attribute(&e, "id").and_then(|v| v.trim().parse::<i32>().ok()) else {
                    continue;
                };
                let name = attribute(&e, "name").unwrap_or_default();
                let mapped = map_subcategory(id, &name, mapped_parent);
                let label = format!("{}/{}", parent_name, name);
                caps.categories.add_mapping(id.to_string(), mapped, Some(&label));
            }
            _ => {}
        }
    }

    if !saw_root {
        return Err(IndexerError::Parse("Unexpected XML: missing caps element".to_string()));
    }
    caps.page_size = caps
        .limits_default
        .map(|d| d as usize)
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, DEFAULT_PAGE_SIZE);

    Ok(caps)
}

fn split_params<T: std::str::FromStr>(supported: Option<String>) -> Option<Vec<T>> {
    supported.map(|list| list.split(',').filter_map(|p| p.trim().parse::<T>().ok()).collect())
}

fn apply_search_element(caps: &mut IndexerCapabilities, tag_name: &str, e: &BytesStart) {
    let available = attribute(e, "available").is_some_and(|a| a.eq_ignore_ascii_case("yes"));
    let supported = attribute(e, "supportedParams");

    match tag_name {
        "search" => {
            caps.search_params = if available {
                split_params(supported).unwrap_or_else(|| vec![SearchParam::Q])
            } else {
                Vec::new()
            };
            caps.supports_raw_search = attribute(e, "searchEngine").is_some_and(|s| s == "raw");
        }
        "tv-search" => {
            caps.tv_search_params = if available {
                split_params(supported).unwrap_or_else(|| vec![TvSearchParam::Q])
            } else {
                Vec::new()
            };
        }
        "movie-search" => {
            caps.movie_search_params = if available {
                split_params(supported).unwrap_or_else(|| vec![MovieSearchParam::Q])
            } else {
                Vec::new()
            };
        }
        "audio-search" | "music-search" => {
            caps.music_search_params = if available {
                split_params(supported).unwrap_or_else(|| vec![MusicSearchParam::Q])
            } else {
                Vec::new()
            };
        }
        "book-search" => {
            caps.book_search_params = if available {
                split_params(supported).unwrap_or_else(|| vec![BookSearchParam::Q])
            } else {
                Vec::new()
            };
        }
        _ => {}
    }
}

/// Standard parent for a caps `<category>`: by name, then id, else Other
fn map_parent_category(id: i32, name: &str) -> &'static StandardCategory {
    let name_lower = name.to_lowercase();
    let parents = || STANDARD_CATEGORIES.iter().filter(|c| c.is_parent());

    parents()
        .find(|c| name_lower.contains(&c.name.to_lowercase()))
        .or_else(|| parents().find(|c| c.id == id))
        .or_else(|| get_category(cats::OTHER))
        .unwrap_or(&STANDARD_CATEGORIES[0])
}

/// Standard id for a caps `<subcat>`
fn map_subcategory(id: i32, name: &str, parent: &StandardCategory) -> i32 {
    let full_name = format!("{}/{}", parent.name, name).to_lowercase();
    let parent_other = format!("{}/other", parent.name.to_lowercase());

    STANDARD_CATEGORIES
        .iter()
        .find(|c| c.name.to_lowercase() == full_name)
        .or_else(|| get_category(id))
        .or_else(|| {
            if parent.id == cats::OTHER {
                None
            } else {
                STANDARD_CATEGORIES
                    .iter()
                    .find(|c| c.name.to_lowercase() == parent_other)
            }
        })
        .map(|c| c.id)
        .unwrap_or(cats::OTHER_MISC)
}

/// Fetches and caches `t=caps` per distinct settings
pub struct NewznabCapabilitiesProvider {
    executor: Arc<dyn HttpExecutor>,
    cache: TtlCache<String, IndexerCapabilities>,
}

impl NewznabCapabilitiesProvider {
    pub fn new(executor: Arc<dyn HttpExecutor>, ttl: chrono::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            executor,
            cache: TtlCache::new(ttl, clock),
        }
    }

    pub async fn get_capabilities(&self, settings: &NewznabSettings) -> Result<IndexerCapabilities, IndexerError> {
        settings.validate()?;
        self.cache
            .get_or_try_insert_with(settings.cache_key(), || self.fetch(settings))
            .await
    }

    async fn fetch(&self, settings: &NewznabSettings) -> Result<IndexerCapabilities, IndexerError> {
        let request = IndexerRequest::get(settings.caps_url());
        debug!(url = %request.redacted_url(), "Fetching Newznab capabilities");

        let response = self.executor.execute(&request).await?;
        if response.status >= 400 {
            return Err(IndexerError::Http {
                status: response.status,
                url: request.redacted_url(),
            });
        }

        parse_capabilities(&response.body).inspect_err(|e| {
            debug!(base_url = %settings.base_url, error = %e, "Failed to parse Newznab capabilities");
        })
    }

    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }
}

/// Build handlers for a Newznab or Torznab indexer
pub fn build(definition: &IndexerDefinition) -> Result<IndexerHandlers, IndexerError> {
    let settings = NewznabSettings::from_definition(definition);
    settings.validate()?;

    let generator = NewznabRequestGenerator::new(settings, definition.capabilities.clone());
    let parser = NewznabParser::new(definition.capabilities.clone(), definition.protocol);

    Ok(IndexerHandlers {
        generator: Arc::new(generator),
        parser: Arc::new(parser),
    })
}
