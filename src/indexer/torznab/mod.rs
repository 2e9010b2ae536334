//! Newznab/Torznab REST API
//!
//! Lets Sonarr, Radarr and similar applications use the gateway as a
//! single indexer.
//!
//! # Endpoints
//!
//! - `GET /api/v1/indexer/{id}/newznab?t=caps` - Capabilities
//! - `GET /api/v1/indexer/{id}/newznab?t=search&q=...` - General search
//! - `GET /api/v1/indexer/{id}/newznab?t=tvsearch&q=...` - TV search
//! - `GET /api/v1/indexer/{id}/newznab?t=movie&q=...` - Movie search
//! - `GET /api/v1/indexer/{id}/api?...` - Same as above
//!
//! `{id}` is a backend id, or `all` to search every backend. All endpoints
//! require an `apikey` parameter.

pub mod request;
pub mod response;
pub mod tokenizer;

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    routing::get,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::indexer::categories::{CategoryMap, STANDARD_CATEGORIES};
use crate::indexer::registry::RegisteredIndexer;
use crate::indexer::{
    BookSearchParam, DownloadProtocol, IndexerCapabilities, MovieSearchParam, MusicSearchParam, SearchDispatcher,
    SearchCriteria, SearchError, SearchParam, TvSearchParam,
};
use request::TorznabRequest;
use response::{FeedInfo, TorznabError, TorznabResponse};

/// Path segment selecting the aggregate of all backends
pub const AGGREGATE_INDEXER: &str = "all";

/// Application state for Torznab routes
#[derive(Clone)]
pub struct TorznabState {
    pub dispatcher: Arc<SearchDispatcher>,
    pub api_key: String,
    /// Site title shown in feeds and caps
    pub title: String,
}

impl TorznabState {
    pub fn new(dispatcher: Arc<SearchDispatcher>, api_key: impl Into<String>) -> Self {
        Self {
            dispatcher,
            api_key: api_key.into(),
            title: "nabgate".to_string(),
        }
    }
}

/// Create the Torznab router
pub fn router(state: TorznabState) -> Router {
    Router::new()
        .route("/api/v1/indexer/{indexer_id}/newznab", get(torznab_handler))
        .route("/api/v1/indexer/{indexer_id}/api", get(torznab_handler))
        .with_state(state)
}

/// Which backends a request addresses
enum Target {
    Single(Arc<RegisteredIndexer>),
    All,
}

fn resolve_target(state: &TorznabState, indexer_id: &str) -> Result<Target, TorznabError> {
    if indexer_id.eq_ignore_ascii_case(AGGREGATE_INDEXER) {
        return Ok(Target::All);
    }

    let id: i32 = indexer_id
        .trim()
        .parse()
        .map_err(|_| TorznabError::not_found("Invalid indexer ID"))?;

    state
        .dispatcher
        .registry()
        .get(id)
        .filter(|indexer| indexer.definition.enabled)
        .map(Target::Single)
        .ok_or_else(|| TorznabError::not_found("Indexer not found or not enabled"))
}

/// Main Torznab endpoint handler
async fn torznab_handler(
    State(state): State<TorznabState>,
    Path(indexer_id): Path<String>,
    Query(params): Query<TorznabRequest>,
) -> Response {
    match handle(&state, &indexer_id, &params).await {
        Ok(response) => response.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle(
    state: &TorznabState,
    indexer_id: &str,
    params: &TorznabRequest,
) -> Result<TorznabResponse, TorznabError> {
    if params.apikey.as_deref() != Some(state.api_key.as_str()) {
        return Err(TorznabError::unauthorized("Invalid API Key"));
    }

    let target = resolve_target(state, indexer_id)?;

    if params.is_caps() {
        return Ok(match &target {
            Target::Single(indexer) => TorznabResponse::capabilities(indexer.name(), &indexer.definition.capabilities),
            Target::All => TorznabResponse::capabilities(&state.title, &aggregate_capabilities()),
        });
    }

    let mut criteria = params
        .to_criteria()
        .map_err(|e| TorznabError::bad_request(&e.to_string()))?;

    if let Target::Single(indexer) = &target {
        check_single_backend(state, indexer, &criteria)?;
        criteria.base_mut().indexer_ids = Some(vec![indexer.id()]);
    }

    // Dropping the handler (client went away) cancels the query
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let result = state
        .dispatcher
        .search(&criteria, &cancel)
        .await
        .map_err(|e| match e {
            SearchError::InvalidQuery(msg) => TorznabError::bad_request(&msg),
            e @ SearchError::NoIndexersAvailable { .. } => {
                warn!(error = %e, "Search rejected");
                TorznabError::unavailable(&e.to_string())
            }
        })?;

    let feed = match &target {
        Target::Single(indexer) => FeedInfo {
            title: indexer.name().to_string(),
            description: indexer.name().to_string(),
            link: indexer.definition.setting("base_url").unwrap_or_default().to_string(),
            protocol: Some(indexer.protocol()),
            privacy: HashMap::from([(indexer.id(), indexer.definition.privacy)]),
        },
        Target::All => {
            let indexers = state.dispatcher.registry().all();
            let protocols: Vec<DownloadProtocol> = indexers.iter().map(|i| i.protocol()).collect();
            FeedInfo {
                title: state.title.clone(),
                description: "Aggregate search".to_string(),
                link: String::new(),
                protocol: protocols
                    .first()
                    .copied()
                    .filter(|first| protocols.iter().all(|p| p == first)),
                privacy: indexers
                    .iter()
                    .map(|i| (i.id(), i.definition.privacy))
                    .collect(),
            }
        }
    };

    debug!(
        query_id = %result.query_id,
        releases = result.releases.len(),
        queried = ?result.queried,
        "Rendering search results"
    );

    Ok(TorznabResponse::search_results(&feed, &result.releases))
}

/// Reject a single-backend query the backend cannot take right now
fn check_single_backend(
    state: &TorznabState,
    indexer: &RegisteredIndexer,
    criteria: &SearchCriteria,
) -> Result<(), TorznabError> {
    let dispatcher = &state.dispatcher;
    let now = dispatcher.clock().now();
    let definition = &indexer.definition;

    if let Some(retry_after) = dispatcher.status().retry_after(definition.id, now) {
        return Err(TorznabError::too_many_requests(
            "Indexer is disabled till later due to recent failures",
            retry_after,
        ));
    }

    if let Some(retry_after) = dispatcher.quotas().retry_after(definition, now) {
        return Err(TorznabError::too_many_requests(
            "Indexer has reached its query limit",
            retry_after,
        ));
    }

    if !definition.capabilities.supports_mode(criteria.mode()) {
        return Err(TorznabError::function_not_available(&format!(
            "{} is not supported by this indexer",
            criteria.mode()
        )));
    }

    if let Err(e) = indexer.handlers.generator.is_configured() {
        warn!(indexer_id = definition.id, error = %e, "Indexer is not configured");
        return Err(TorznabError::unavailable(&e.to_string()));
    }

    Ok(())
}

/// What the aggregate endpoint advertises: all parameters of every mode
/// plus the standard categories
pub fn aggregate_capabilities() -> IndexerCapabilities {
    let mut categories = CategoryMap::new();
    for category in STANDARD_CATEGORIES {
        categories.add_mapping(category.id.to_string(), category.id, None);
    }

    IndexerCapabilities {
        search_params: SearchParam::ALL.to_vec(),
        tv_search_params: TvSearchParam::ALL.to_vec(),
        movie_search_params: MovieSearchParam::ALL.to_vec(),
        music_search_params: MusicSearchParam::ALL.to_vec(),
        book_search_params: BookSearchParam::ALL.to_vec(),
        supports_pagination: true,
        categories,
        ..Default::default()
    }
}
