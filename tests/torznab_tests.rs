//! HTTP surface tests driven through the router

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tower::ServiceExt;

use nabgate::indexer::clock::ManualClock;
use nabgate::indexer::torznab::{self, TorznabState};
use nabgate::indexer::{
    CategoryMap, DispatchConfig, DownloadProtocol, HttpExecutor, IndexerCapabilities, IndexerDefinition,
    IndexerError, IndexerRegistry, IndexerRequest, IndexerResponse, SearchDispatcher, TvSearchParam,
};

const API_KEY: &str = "secret";

/// Replies with a fixed body per host and remembers every URL
#[derive(Default)]
struct FeedExecutor {
    bodies: HashMap<String, String>,
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl HttpExecutor for FeedExecutor {
    async fn execute(&self, request: &IndexerRequest) -> Result<IndexerResponse, IndexerError> {
        self.calls.lock().push(request.url.clone());
        let host = request.host().unwrap_or_default();
        match self.bodies.get(&host) {
            Some(body) => Ok(IndexerResponse::new(request.clone(), 200, body.clone())),
            None => Err(IndexerError::Connection(host)),
        }
    }
}

const SHOW_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:newznab="http://www.newznab.com/DTD/2010/feeds/attributes/"><channel>
<item>
  <title>Show.S02E05.720p</title>
  <guid>https://one.example/details/1</guid>
  <link>https://one.example/get/1.nzb</link>
  <pubDate>Sat, 01 Jun 2024 10:00:00 +0000</pubDate>
  <newznab:attr name="category" value="5040"/>
  <newznab:attr name="size" value="734003200"/>
</item>
</channel></rss>"#;

fn tv_backend(id: i32, host: &str) -> IndexerDefinition {
    let mut categories = CategoryMap::new();
    categories.add_mapping("5040", 5040, None);
    let capabilities = IndexerCapabilities {
        tv_search_params: vec![TvSearchParam::Q, TvSearchParam::Season, TvSearchParam::Ep],
        categories,
        ..Default::default()
    };

    let mut definition =
        IndexerDefinition::new(id, format!("Backend {}", id), DownloadProtocol::Usenet).with_capabilities(capabilities);
    definition
        .settings
        .insert("base_url".to_string(), format!("https://{}", host));
    definition
        .settings
        .insert("api_key".to_string(), format!("key{}", id));
    definition
}

struct TestApp {
    router: Router,
    dispatcher: Arc<SearchDispatcher>,
    executor: Arc<FeedExecutor>,
}

fn app() -> TestApp {
    let mut executor = FeedExecutor::default();
    executor
        .bodies
        .insert("one.example".to_string(), SHOW_FEED.to_string());
    let executor = Arc::new(executor);

    let registry = Arc::new(IndexerRegistry::new());
    registry.register_definition(tv_backend(1, "one.example")).unwrap();
    registry.register_definition(tv_backend(5, "five.example")).unwrap();

    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
    let config = DispatchConfig {
        host_spacing: Duration::ZERO,
        ..Default::default()
    };
    let dispatcher = Arc::new(SearchDispatcher::new(
        registry,
        executor.clone(),
        config,
        Arc::new(clock),
    ));

    TestApp {
        router: torznab::router(TorznabState::new(dispatcher.clone(), API_KEY)),
        dispatcher,
        executor,
    }
}

async fn get(router: &Router, uri: &str) -> (StatusCode, HashMap<String, String>, String) {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let headers = response
        .headers()
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or_default().to_string()))
        .collect();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn test_wrong_api_key_is_rejected() {
    let app = app();

    let (status, _, body) = get(&app.router, "/api/v1/indexer/all/api?t=caps&apikey=nope").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.contains(r#"<error code="100" description="Invalid API Key"/>"#));

    let (status, _, _) = get(&app.router, "/api/v1/indexer/1/newznab?t=caps").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_caps_for_aggregate_and_single_backend() {
    let app = app();

    let (status, headers, body) = get(&app.router, "/api/v1/indexer/all/api?t=caps&apikey=secret").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get(header::CONTENT_TYPE.as_str()).map(String::as_str),
        Some("application/xml; charset=utf-8")
    );
    assert!(body.contains("<caps>"));
    assert!(body.contains(r#"<server title="nabgate"/>"#));
    assert!(body.contains(r#"<category id="2000" name="Movies">"#));

    let (status, _, body) = get(&app.router, "/api/v1/indexer/1/api?t=caps&apikey=secret").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains(r#"<tv-search available="yes" supportedParams="q,season,ep"/>"#));
    assert!(body.contains(r#"<movie-search available="no" supportedParams=""/>"#));
}

#[tokio::test]
async fn test_unknown_backend_is_not_found() {
    let app = app();

    let (status, _, body) = get(&app.router, "/api/v1/indexer/99/api?t=search&q=x&apikey=secret").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.contains(r#"code="201""#));
}

#[tokio::test]
async fn test_tokens_in_q_reach_the_backend_as_parameters() {
    let app = app();

    let (status, headers, body) = get(
        &app.router,
        "/api/v1/indexer/1/api?t=tvsearch&q=Show%20%7Bseason%3A02%7D%7Bepisode%3A05%7D&apikey=secret",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get(header::CONTENT_TYPE.as_str()).map(String::as_str),
        Some("application/rss+xml; charset=utf-8")
    );
    assert!(body.contains("<title>Show.S02E05.720p</title>"));
    assert!(body.contains(r#"<newznab:attr name="size" value="734003200"/>"#));

    assert_eq!(
        app.executor.calls.lock().clone(),
        vec!["https://one.example/api?t=tvsearch&extended=1&apikey=key1&season=02&ep=5&q=Show".to_string()]
    );
}

#[tokio::test]
async fn test_single_backend_in_backoff_returns_retry_after() {
    let app = app();
    app.dispatcher
        .status()
        .record_failure(1, Some(Duration::from_secs(90)));

    let (status, headers, body) = get(&app.router, "/api/v1/indexer/1/api?t=tvsearch&q=Show&apikey=secret").await;

    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(headers.get("retry-after").map(String::as_str), Some("90"));
    assert!(body.contains(r#"code="429""#));
    assert!(app.executor.calls.lock().is_empty());
}

#[tokio::test]
async fn test_unsupported_mode_on_single_backend() {
    let app = app();

    let (status, _, body) = get(&app.router, "/api/v1/indexer/1/api?t=movie&q=Matrix&apikey=secret").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains(r#"code="203""#));
}

#[tokio::test]
async fn test_malformed_category_is_a_bad_request() {
    let app = app();

    let (status, _, body) = get(&app.router, "/api/v1/indexer/all/api?t=search&q=x&cat=2000,abc&apikey=secret").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains(r#"code="201""#));
    assert!(body.contains("abc"));
}

#[tokio::test]
async fn test_aggregate_allowlist_all_unavailable() {
    let app = app();
    app.dispatcher.status().record_failure(5, None);

    let (status, _, body) = get(
        &app.router,
        "/api/v1/indexer/all/api?t=tvsearch&q=Show&indexerIds=5&apikey=secret",
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body.contains(r#"code="900""#));
    assert!(body.contains("[5]"));
}

#[tokio::test]
async fn test_aggregate_search_merges_into_one_feed() {
    let app = app();

    let (status, _, body) = get(&app.router, "/api/v1/indexer/all/api?t=tvsearch&q=Show&cat=5000&apikey=secret").await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("<title>Show.S02E05.720p</title>"));
    assert!(body.contains("<category>5040</category>"));

    // Backend 5 has no script and fails without affecting the feed
    let now = app.dispatcher.clock().now();
    assert!(!app.dispatcher.status().is_available(5, now));
    assert!(app.dispatcher.status().is_available(1, now));
}
