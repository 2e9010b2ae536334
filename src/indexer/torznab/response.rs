//! Newznab/Torznab XML response generation
//!
//! Generates RSS feeds with Newznab or Torznab attribute extensions, the
//! caps document and error documents.

use std::collections::HashMap;
use std::io::Cursor;
use std::time::Duration;

use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use quick_xml::{
    Writer,
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
};

use crate::indexer::{DownloadProtocol, IndexerCapabilities, IndexerPrivacy, ReleaseInfo};

const NEWZNAB_NAMESPACE: &str = "http://www.newznab.com/DTD/2010/feeds/attributes/";
const TORZNAB_NAMESPACE: &str = "http://torznab.com/schemas/2015/feed";

/// Channel-level details of a results feed
#[derive(Debug, Clone)]
pub struct FeedInfo {
    pub title: String,
    pub description: String,
    pub link: String,
    /// Decides the attribute namespace, `None` for mixed feeds
    pub protocol: Option<DownloadProtocol>,
    /// Privacy of each backend that may appear in the feed
    pub privacy: HashMap<i32, IndexerPrivacy>,
}

impl FeedInfo {
    fn attr_prefix(&self) -> &'static str {
        match self.protocol {
            Some(DownloadProtocol::Usenet) => "newznab",
            _ => "torznab",
        }
    }
}

/// Torznab response wrapper
pub enum TorznabResponse {
    Rss(String),
    Caps(String),
}

impl TorznabResponse {
    /// Create a capabilities response
    pub fn capabilities(title: &str, caps: &IndexerCapabilities) -> Self {
        TorznabResponse::Caps(render_caps(title, caps))
    }

    /// Create a search results response
    pub fn search_results(feed: &FeedInfo, releases: &[ReleaseInfo]) -> Self {
        TorznabResponse::Rss(render_results(feed, releases))
    }
}

impl IntoResponse for TorznabResponse {
    fn into_response(self) -> Response {
        match self {
            TorznabResponse::Rss(xml) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/rss+xml; charset=utf-8")],
                xml,
            )
                .into_response(),
            TorznabResponse::Caps(xml) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/xml; charset=utf-8")],
                xml,
            )
                .into_response(),
        }
    }
}

/// Torznab error response
#[derive(Debug, Clone, PartialEq)]
pub struct TorznabError {
    code: i32,
    description: String,
    status: StatusCode,
    retry_after: Option<Duration>,
}

impl TorznabError {
    pub fn new(code: i32, description: impl Into<String>, status: StatusCode) -> Self {
        Self {
            code,
            description: description.into(),
            status,
            retry_after: None,
        }
    }

    pub fn unauthorized(msg: &str) -> Self {
        Self::new(100, msg, StatusCode::UNAUTHORIZED)
    }

    pub fn not_found(msg: &str) -> Self {
        Self::new(201, msg, StatusCode::NOT_FOUND)
    }

    pub fn bad_request(msg: &str) -> Self {
        Self::new(201, msg, StatusCode::BAD_REQUEST)
    }

    pub fn function_not_available(msg: &str) -> Self {
        Self::new(203, msg, StatusCode::BAD_REQUEST)
    }

    /// Backend throttled, with the time until it may be queried again
    pub fn too_many_requests(msg: &str, retry_after: Duration) -> Self {
        Self {
            retry_after: Some(retry_after),
            ..Self::new(429, msg, StatusCode::TOO_MANY_REQUESTS)
        }
    }

    pub fn unavailable(msg: &str) -> Self {
        Self::new(900, msg, StatusCode::SERVICE_UNAVAILABLE)
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn to_xml(&self) -> String {
        render_error(self.code, &self.description)
    }
}

impl IntoResponse for TorznabError {
    fn into_response(self) -> Response {
        let xml = self.to_xml();
        let mut response = (
            self.status,
            [(header::CONTENT_TYPE, "application/xml; charset=utf-8")],
            xml,
        )
            .into_response();

        if let Some(retry_after) = self.retry_after {
            // Round up so clients never retry early
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

type XmlWriter = Writer<Cursor<Vec<u8>>>;

fn new_writer() -> XmlWriter {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .ok();
    writer
}

fn finish(writer: XmlWriter) -> String {
    String::from_utf8(writer.into_inner().into_inner()).unwrap_or_default()
}

/// `<error code=".." description=".."/>`
pub fn render_error(code: i32, description: &str) -> String {
    let mut writer = new_writer();

    let mut error = BytesStart::new("error");
    error.push_attribute(("code", code.to_string().as_str()));
    error.push_attribute(("description", description));
    writer.write_event(Event::Empty(error)).ok();

    finish(writer)
}

/// The `t=caps` document for a capability descriptor
pub fn render_caps(title: &str, caps: &IndexerCapabilities) -> String {
    let mut writer = new_writer();

    writer.write_event(Event::Start(BytesStart::new("caps"))).ok();

    let mut server = BytesStart::new("server");
    server.push_attribute(("title", title));
    writer.write_event(Event::Empty(server)).ok();

    if caps.limits_default.is_some() || caps.limits_max.is_some() {
        let mut limits = BytesStart::new("limits");
        if let Some(default) = caps.limits_default {
            limits.push_attribute(("default", default.to_string().as_str()));
        }
        if let Some(max) = caps.limits_max {
            limits.push_attribute(("max", max.to_string().as_str()));
        }
        writer.write_event(Event::Empty(limits)).ok();
    }

    writer.write_event(Event::Start(BytesStart::new("searching"))).ok();

    let mut search = search_element(
        "search",
        caps.search_available(),
        caps.search_params.iter().map(|p| p.as_param()),
    );
    if caps.supports_raw_search {
        search.push_attribute(("searchEngine", "raw"));
    }
    writer.write_event(Event::Empty(search)).ok();

    let tv = search_element(
        "tv-search",
        caps.tv_search_available(),
        caps.tv_search_params.iter().map(|p| p.as_param()),
    );
    writer.write_event(Event::Empty(tv)).ok();

    let movie = search_element(
        "movie-search",
        caps.movie_search_available(),
        caps.movie_search_params.iter().map(|p| p.as_param()),
    );
    writer.write_event(Event::Empty(movie)).ok();

    let music = search_element(
        "music-search",
        caps.music_search_available(),
        caps.music_search_params.iter().map(|p| p.as_param()),
    );
    writer.write_event(Event::Empty(music)).ok();

    // Older clients only know the audio-search name
    let audio = search_element(
        "audio-search",
        caps.music_search_available(),
        caps.music_search_params.iter().map(|p| p.as_param()),
    );
    writer.write_event(Event::Empty(audio)).ok();

    let book = search_element(
        "book-search",
        caps.book_search_available(),
        caps.book_search_params.iter().map(|p| p.as_param()),
    );
    writer.write_event(Event::Empty(book)).ok();

    writer.write_event(Event::End(BytesEnd::new("searching"))).ok();

    writer.write_event(Event::Start(BytesStart::new("categories"))).ok();
    for node in caps.categories.tree() {
        let mut category = BytesStart::new("category");
        category.push_attribute(("id", node.id.to_string().as_str()));
        category.push_attribute(("name", node.name.as_str()));

        if node.children.is_empty() {
            writer.write_event(Event::Empty(category)).ok();
            continue;
        }

        writer.write_event(Event::Start(category)).ok();
        for (id, name) in &node.children {
            let mut subcat = BytesStart::new("subcat");
            subcat.push_attribute(("id", id.to_string().as_str()));
            subcat.push_attribute(("name", name.as_str()));
            writer.write_event(Event::Empty(subcat)).ok();
        }
        writer.write_event(Event::End(BytesEnd::new("category"))).ok();
    }
    writer.write_event(Event::End(BytesEnd::new("categories"))).ok();

    writer.write_event(Event::End(BytesEnd::new("caps"))).ok();

    finish(writer)
}

fn search_element<'a>(name: &'a str, available: bool, params: impl Iterator<Item = &'static str>) -> BytesStart<'a> {
    let params: Vec<&str> = params.collect();
    let mut elem = BytesStart::new(name);
    elem.push_attribute(("available", if available { "yes" } else { "no" }));
    elem.push_attribute(("supportedParams", params.join(",").as_str()));
    elem
}

/// An RSS results feed
pub fn render_results(feed: &FeedInfo, releases: &[ReleaseInfo]) -> String {
    let mut writer = new_writer();
    let prefix = feed.attr_prefix();

    let mut rss = BytesStart::new("rss");
    rss.push_attribute(("version", "1.0"));
    rss.push_attribute(("xmlns:atom", "http://www.w3.org/2005/Atom"));
    match feed.protocol {
        Some(DownloadProtocol::Usenet) => rss.push_attribute(("xmlns:newznab", NEWZNAB_NAMESPACE)),
        _ => rss.push_attribute(("xmlns:torznab", TORZNAB_NAMESPACE)),
    }
    writer.write_event(Event::Start(rss)).ok();

    writer.write_event(Event::Start(BytesStart::new("channel"))).ok();

    write_text_element(&mut writer, "title", &feed.title);
    write_text_element(&mut writer, "description", &feed.description);
    write_text_element(&mut writer, "link", &feed.link);
    write_text_element(&mut writer, "language", "en-us");

    for release in releases {
        let privacy = feed.privacy.get(&release.indexer_id).copied();
        write_release_item(&mut writer, prefix, release, privacy);
    }

    writer.write_event(Event::End(BytesEnd::new("channel"))).ok();
    writer.write_event(Event::End(BytesEnd::new("rss"))).ok();

    finish(writer)
}

fn write_text_element(writer: &mut XmlWriter, name: &str, text: &str) {
    writer.write_event(Event::Start(BytesStart::new(name))).ok();
    writer.write_event(Event::Text(BytesText::new(text))).ok();
    writer.write_event(Event::End(BytesEnd::new(name))).ok();
}

fn write_attr(writer: &mut XmlWriter, prefix: &str, name: &str, value: &str) {
    let tag = format!("{}:attr", prefix);
    let mut attr = BytesStart::new(tag.as_str());
    attr.push_attribute(("name", name));
    attr.push_attribute(("value", value));
    writer.write_event(Event::Empty(attr)).ok();
}

fn write_release_item(writer: &mut XmlWriter, prefix: &str, release: &ReleaseInfo, privacy: Option<IndexerPrivacy>) {
    writer.write_event(Event::Start(BytesStart::new("item"))).ok();

    write_text_element(writer, "title", &release.title);
    if let Some(ref description) = release.description {
        write_text_element(writer, "description", description);
    }
    write_text_element(writer, "guid", &release.guid);

    let mut indexer = BytesStart::new("prowlarrindexer");
    indexer.push_attribute(("id", release.indexer_id.to_string().as_str()));
    writer.write_event(Event::Start(indexer)).ok();
    writer.write_event(Event::Text(BytesText::new(&release.indexer))).ok();
    writer.write_event(Event::End(BytesEnd::new("prowlarrindexer"))).ok();

    let kind = match privacy {
        Some(IndexerPrivacy::Public) => "public",
        Some(IndexerPrivacy::SemiPrivate) => "semi-private",
        _ => "private",
    };
    write_text_element(writer, "type", kind);

    if let Some(comments) = release.details.as_ref().or(release.comments.as_ref()) {
        write_text_element(writer, "comments", comments);
    }

    write_text_element(writer, "pubDate", &format_rfc2822(&release.publish_date));

    if let Some(size) = release.size {
        write_text_element(writer, "size", &size.to_string());
    }

    let link = release
        .link
        .as_ref()
        .or(release.magnet_uri.as_ref())
        .map(|s| s.as_str())
        .unwrap_or("");
    write_text_element(writer, "link", link);

    for category in &release.categories {
        write_text_element(writer, "category", &category.to_string());
    }

    if !link.is_empty() {
        let mut enclosure = BytesStart::new("enclosure");
        enclosure.push_attribute(("url", link));
        if let Some(size) = release.size {
            enclosure.push_attribute(("length", size.to_string().as_str()));
        }
        let mime = match release.protocol {
            DownloadProtocol::Usenet => "application/x-nzb",
            DownloadProtocol::Torrent => "application/x-bittorrent",
        };
        enclosure.push_attribute(("type", mime));
        writer.write_event(Event::Empty(enclosure)).ok();
    }

    for category in &release.categories {
        write_attr(writer, prefix, "category", &category.to_string());
    }

    if let Some(size) = release.size {
        write_attr(writer, prefix, "size", &size.to_string());
    }
    if let Some(files) = release.files {
        write_attr(writer, prefix, "files", &files.to_string());
    }
    if let Some(grabs) = release.grabs {
        write_attr(writer, prefix, "grabs", &grabs.to_string());
    }

    if let Some(imdb) = release.imdb_id {
        write_attr(writer, prefix, "imdb", &format!("{:07}", imdb));
        write_attr(writer, prefix, "imdbid", &format!("tt{:07}", imdb));
    }
    if let Some(tmdb) = release.tmdb_id {
        write_attr(writer, prefix, "tmdbid", &tmdb.to_string());
    }
    if let Some(tvdb) = release.tvdb_id {
        write_attr(writer, prefix, "tvdbid", &tvdb.to_string());
    }
    if let Some(tvmaze) = release.tvmaze_id {
        write_attr(writer, prefix, "tvmazeid", &tvmaze.to_string());
    }
    if let Some(trakt) = release.trakt_id {
        write_attr(writer, prefix, "traktid", &trakt.to_string());
    }
    if let Some(rage) = release.rage_id {
        write_attr(writer, prefix, "rageid", &rage.to_string());
    }
    if let Some(douban) = release.douban_id {
        write_attr(writer, prefix, "doubanid", &douban.to_string());
    }
    if !release.genres.is_empty() {
        write_attr(writer, prefix, "genre", &release.genres.join(", "));
    }
    if let Some(year) = release.year {
        write_attr(writer, prefix, "year", &year.to_string());
    }
    if let Some(ref poster) = release.poster {
        write_attr(writer, prefix, "coverurl", poster);
    }

    if release.protocol == DownloadProtocol::Torrent {
        if let Some(seeders) = release.seeders {
            write_attr(writer, prefix, "seeders", &seeders.to_string());
        }
        if let Some(peers) = release.peers {
            write_attr(writer, prefix, "peers", &peers.to_string());
        }
        if let Some(ref info_hash) = release.info_hash {
            write_attr(writer, prefix, "infohash", info_hash);
        }
        if let Some(ref magnet) = release.magnet_uri {
            write_attr(writer, prefix, "magneturl", magnet);
        }
        write_attr(
            writer,
            prefix,
            "downloadvolumefactor",
            &release.download_volume_factor.unwrap_or(1.0).to_string(),
        );
        write_attr(
            writer,
            prefix,
            "uploadvolumefactor",
            &release.upload_volume_factor.unwrap_or(1.0).to_string(),
        );
        if let Some(ratio) = release.minimum_ratio {
            write_attr(writer, prefix, "minimumratio", &ratio.to_string());
        }
        if let Some(seed_time) = release.minimum_seed_time {
            write_attr(writer, prefix, "minimumseedtime", &seed_time.to_string());
        }
    }

    writer.write_event(Event::End(BytesEnd::new("item"))).ok();
}

fn format_rfc2822(dt: &DateTime<Utc>) -> String {
    dt.format("%a, %d %b %Y %H:%M:%S %z").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::categories::CategoryMap;
    use crate::indexer::{MovieSearchParam, SearchParam};
    use chrono::TimeZone;

    #[test]
    fn test_error_xml() {
        let xml = render_error(100, "Invalid API Key");
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains(r#"<error code="100" description="Invalid API Key"/>"#));
    }

    #[test]
    fn test_caps_lists_params_and_tree() {
        let mut categories = CategoryMap::new();
        categories.add_mapping("44", 2000, None);
        categories.add_mapping("48", 2040, None);
        let caps = IndexerCapabilities {
            search_params: vec![SearchParam::Q],
            supports_raw_search: true,
            movie_search_params: vec![MovieSearchParam::Q, MovieSearchParam::ImdbId],
            categories,
            ..Default::default()
        };

        let xml = render_caps("Test", &caps);
        assert!(xml.contains(r#"<search available="yes" supportedParams="q" searchEngine="raw"/>"#));
        assert!(xml.contains(r#"<movie-search available="yes" supportedParams="q,imdbid"/>"#));
        assert!(xml.contains(r#"<tv-search available="no" supportedParams=""/>"#));
        assert!(xml.contains(r#"<category id="2000" name="Movies"><subcat id="2040" name="Movies/HD"/></category>"#));
    }

    #[test]
    fn test_usenet_item() {
        let date = Utc.with_ymd_and_hms(2020, 3, 14, 10, 0, 0).unwrap();
        let mut release = ReleaseInfo::new("Matrix & Co", "guid-1", date);
        release.link = Some("https://nzb.example/get/1".into());
        release.size = Some(1024);
        release.categories = vec![2000];
        release.imdb_id = Some(133093);
        release.indexer_id = 3;
        release.indexer = "Example".into();

        let feed = FeedInfo {
            title: "nabgate".into(),
            description: "Example feed".into(),
            link: "http://localhost".into(),
            protocol: Some(DownloadProtocol::Usenet),
            privacy: HashMap::from([(3, IndexerPrivacy::Public)]),
        };

        let xml = render_results(&feed, &[release]);
        assert!(xml.contains(r#"xmlns:newznab="http://www.newznab.com/DTD/2010/feeds/attributes/""#));
        assert!(xml.contains("<title>Matrix &amp; Co</title>"));
        assert!(xml.contains(r#"<prowlarrindexer id="3">Example</prowlarrindexer>"#));
        assert!(xml.contains("<type>public</type>"));
        assert!(xml.contains("<pubDate>Sat, 14 Mar 2020 10:00:00 +0000</pubDate>"));
        assert!(xml.contains(r#"<enclosure url="https://nzb.example/get/1" length="1024" type="application/x-nzb"/>"#));
        assert!(xml.contains(r#"<newznab:attr name="imdbid" value="tt0133093"/>"#));
        assert!(!xml.contains("seeders"));
    }

    #[test]
    fn test_retry_after_header() {
        let response = TorznabError::too_many_requests("Backoff", Duration::from_millis(1500)).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).and_then(|v| v.to_str().ok()),
            Some("2")
        );
    }
}
