//! Search dispatcher
//!
//! The SearchDispatcher is responsible for:
//! - Selecting which registered indexers can take a query
//! - Fanning the query out concurrently, one task per indexer
//! - Feeding outcomes back into health and quota tracking
//! - Merging and filtering the releases that came back

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::clock::Clock;
use super::criteria::SearchCriteria;
use super::events::{EventSink, IndexerQueryEvent, RequestRecord, TracingEventSink};
use super::limits::QueryQuotaTracker;
use super::rate_limiter::{DEFAULT_HOST_SPACING, HOST_IDLE_EXPIRY, HostRateLimiter};
use super::registry::{IndexerRegistry, RegisteredIndexer};
use super::status::{BackendStatusTracker, BackoffPolicy};
use super::types::{DownloadProtocol, ReleaseInfo};
use super::{HttpExecutor, ParseOutcome, SearchError};

/// Allowlist sentinel selecting every Usenet indexer
pub const ALL_USENET_INDEXERS: i32 = -1;
/// Allowlist sentinel selecting every torrent indexer
pub const ALL_TORRENT_INDEXERS: i32 = -2;

/// Tunables for query dispatch
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Overall deadline for one query
    pub query_timeout: Duration,
    /// Spacing between requests to one host when the indexer sets none
    pub host_spacing: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(60),
            host_spacing: DEFAULT_HOST_SPACING,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Merged outcome of one query
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub query_id: Uuid,
    pub releases: Vec<ReleaseInfo>,
    /// Indexers that were actually dispatched
    pub queried: Vec<i32>,
    pub elapsed_ms: u64,
}

impl SearchResult {
    fn empty(query_id: Uuid, start: Instant) -> Self {
        Self {
            query_id,
            releases: Vec::new(),
            queried: Vec::new(),
            elapsed_ms: start.elapsed().as_millis() as u64,
        }
    }
}

enum RunOutcome {
    Success,
    Failed {
        reason: String,
        retry_after: Option<Duration>,
    },
    Cancelled,
}

/// What one indexer task produced
struct IndexerRun {
    releases: Vec<ReleaseInfo>,
    requests: Vec<RequestRecord>,
    outcome: RunOutcome,
    elapsed_ms: u64,
}

/// Shared pieces each indexer task needs
struct QueryContext {
    criteria: SearchCriteria,
    executor: Arc<dyn HttpExecutor>,
    quotas: Arc<QueryQuotaTracker>,
    rate_limiter: Arc<HostRateLimiter>,
    clock: Arc<dyn Clock>,
    token: CancellationToken,
}

/// Fans queries out across the registered indexers
pub struct SearchDispatcher {
    registry: Arc<IndexerRegistry>,
    executor: Arc<dyn HttpExecutor>,
    status: Arc<BackendStatusTracker>,
    quotas: Arc<QueryQuotaTracker>,
    rate_limiter: Arc<HostRateLimiter>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: DispatchConfig,
}

impl SearchDispatcher {
    pub fn new(
        registry: Arc<IndexerRegistry>,
        executor: Arc<dyn HttpExecutor>,
        config: DispatchConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            executor,
            status: Arc::new(BackendStatusTracker::new(config.backoff, clock.clone())),
            quotas: Arc::new(QueryQuotaTracker::new(clock.clone())),
            rate_limiter: Arc::new(HostRateLimiter::new(config.host_spacing)),
            events: Arc::new(TracingEventSink),
            clock,
            config,
        }
    }

    /// Send completion events somewhere other than the log
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn registry(&self) -> &Arc<IndexerRegistry> {
        &self.registry
    }

    pub fn status(&self) -> &Arc<BackendStatusTracker> {
        &self.status
    }

    pub fn quotas(&self) -> &Arc<QueryQuotaTracker> {
        &self.quotas
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Run a query across every eligible indexer
    ///
    /// Individual indexer failures never fail the query. The only errors
    /// are an explicit allowlist with nothing usable left in it.
    pub async fn search(
        &self,
        criteria: &SearchCriteria,
        cancel: &CancellationToken,
    ) -> Result<SearchResult, SearchError> {
        let start = Instant::now();
        let query_id = Uuid::new_v4();
        let now = self.clock.now();

        let indexers = self.select(criteria, now)?;
        if indexers.is_empty() {
            debug!(query_id = %query_id, criteria = %criteria, "No indexers match query");
            return Ok(SearchResult::empty(query_id, start));
        }

        info!(
            query_id = %query_id,
            criteria = %criteria,
            indexers = indexers.len(),
            "Searching indexers"
        );

        let runs = self.dispatch(criteria, &indexers, cancel).await;

        let mut releases = Vec::new();
        let mut queried = Vec::with_capacity(runs.len());
        for (indexer, run) in runs {
            queried.push(indexer.id());
            self.publish(query_id, criteria, &indexer, &run);
            releases.extend(run.releases);
        }

        let releases = filter_releases(criteria, &indexers, releases, now);

        info!(
            query_id = %query_id,
            releases = releases.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Search completed"
        );

        Ok(SearchResult {
            query_id,
            releases,
            queried,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Pick the indexers a query goes to
    ///
    /// The allowlist and availability checks come first; if an explicit
    /// allowlist leaves nothing, that is an error. Mode, parameter and
    /// category narrowing afterwards may leave nothing without error.
    fn select(
        &self,
        criteria: &SearchCriteria,
        now: DateTime<Utc>,
    ) -> Result<Vec<Arc<RegisteredIndexer>>, SearchError> {
        let allowlist = criteria
            .base()
            .indexer_ids
            .as_ref()
            .filter(|ids| !ids.is_empty());

        let available: Vec<_> = self
            .registry
            .all()
            .into_iter()
            .filter(|indexer| allowlist.is_none_or(|ids| allowlisted(ids, indexer)))
            .filter(|indexer| self.is_available(indexer, now))
            .collect();

        if available.is_empty() {
            if let Some(ids) = allowlist {
                warn!(requested = ?ids, "All selected indexers are unavailable");
                return Err(SearchError::NoIndexersAvailable {
                    requested: ids.clone(),
                });
            }
        }

        let mode = criteria.mode();
        let categories = criteria.categories();

        Ok(available
            .into_iter()
            .filter(|indexer| {
                let caps = &indexer.definition.capabilities;
                if !caps.supports_mode(mode) {
                    debug!(indexer_id = indexer.id(), mode = %mode, "Indexer does not support search mode");
                    return false;
                }
                if !caps.supports_criteria(criteria) {
                    debug!(indexer_id = indexer.id(), "Indexer does not support query parameters");
                    return false;
                }
                if !caps.categories.supports(categories) {
                    debug!(indexer_id = indexer.id(), categories = ?categories, "Indexer has no matching categories");
                    return false;
                }
                true
            })
            .collect())
    }

    fn is_available(&self, indexer: &RegisteredIndexer, now: DateTime<Utc>) -> bool {
        let definition = &indexer.definition;

        if !definition.enabled {
            return false;
        }
        if let Err(e) = indexer.handlers.generator.is_configured() {
            debug!(indexer_id = definition.id, error = %e, "Indexer is not ready");
            return false;
        }
        if !self.status.is_available(definition.id, now) {
            debug!(indexer_id = definition.id, "Indexer is in backoff");
            return false;
        }
        if self.quotas.at_query_limit(definition, now) {
            return false;
        }
        true
    }

    /// Run one task per indexer and wait for all of them
    async fn dispatch(
        &self,
        criteria: &SearchCriteria,
        indexers: &[Arc<RegisteredIndexer>],
        cancel: &CancellationToken,
    ) -> Vec<(Arc<RegisteredIndexer>, IndexerRun)> {
        let token = cancel.child_token();
        let _deadline = spawn_deadline(token.clone(), self.config.query_timeout);
        self.rate_limiter.prune_idle(HOST_IDLE_EXPIRY);

        let ctx = Arc::new(QueryContext {
            criteria: criteria.clone(),
            executor: self.executor.clone(),
            quotas: self.quotas.clone(),
            rate_limiter: self.rate_limiter.clone(),
            clock: self.clock.clone(),
            token: token.clone(),
        });

        let handles = indexers.iter().map(|indexer| {
            let ctx = ctx.clone();
            let indexer = indexer.clone();
            tokio::spawn(async move { query_indexer(ctx, indexer).await })
        });
        let results = join_all(handles).await;

        let mut runs = Vec::with_capacity(results.len());
        for (indexer, result) in indexers.iter().cloned().zip(results) {
            let run = match result {
                Ok(run) => run,
                Err(e) => {
                    error!(indexer_id = indexer.id(), error = %e, "Indexer search task panicked");
                    IndexerRun {
                        releases: Vec::new(),
                        requests: Vec::new(),
                        outcome: RunOutcome::Failed {
                            reason: e.to_string(),
                            retry_after: None,
                        },
                        elapsed_ms: 0,
                    }
                }
            };

            match &run.outcome {
                RunOutcome::Success => self.status.record_success(indexer.id()),
                RunOutcome::Failed { reason, retry_after } => {
                    warn!(
                        indexer_id = indexer.id(),
                        indexer_name = %indexer.name(),
                        error = %reason,
                        "Indexer search failed"
                    );
                    self.status.record_failure(indexer.id(), *retry_after);
                }
                RunOutcome::Cancelled => {
                    debug!(indexer_id = indexer.id(), "Indexer search cancelled");
                }
            }

            runs.push((indexer, run));
        }

        // Stops the deadline timer
        token.cancel();
        runs
    }

    fn publish(&self, query_id: Uuid, criteria: &SearchCriteria, indexer: &RegisteredIndexer, run: &IndexerRun) {
        let (successful, cancelled, error) = match &run.outcome {
            RunOutcome::Success => (true, false, None),
            RunOutcome::Failed { reason, .. } => (false, false, Some(reason.clone())),
            RunOutcome::Cancelled => (false, true, None),
        };

        self.events.publish(IndexerQueryEvent {
            query_id,
            indexer_id: indexer.id(),
            indexer_name: indexer.name().to_string(),
            mode: criteria.mode(),
            term: criteria.base().term.clone(),
            categories: criteria.categories().to_vec(),
            requests: run.requests.clone(),
            successful,
            cancelled,
            release_count: run.releases.len(),
            elapsed_ms: run.elapsed_ms,
            error,
        });
    }
}

impl std::fmt::Debug for SearchDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchDispatcher")
            .field("indexers_count", &self.registry.len())
            .field("config", &self.config)
            .finish()
    }
}

fn allowlisted(ids: &[i32], indexer: &RegisteredIndexer) -> bool {
    ids.contains(&indexer.id())
        || (ids.contains(&ALL_USENET_INDEXERS) && indexer.protocol() == DownloadProtocol::Usenet)
        || (ids.contains(&ALL_TORRENT_INDEXERS) && indexer.protocol() == DownloadProtocol::Torrent)
}

/// Cancel `token` once `timeout` passes, unless it is cancelled first
fn spawn_deadline(token: CancellationToken, timeout: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                debug!(timeout_secs = timeout.as_secs(), "Query deadline reached");
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    })
}

/// Walk one indexer's request chain
async fn query_indexer(ctx: Arc<QueryContext>, indexer: Arc<RegisteredIndexer>) -> IndexerRun {
    let start = Instant::now();
    let definition = &indexer.definition;
    let mut requests = Vec::new();

    let finish = |releases: Vec<ReleaseInfo>, requests: Vec<RequestRecord>, outcome: RunOutcome| IndexerRun {
        releases,
        requests,
        outcome,
        elapsed_ms: start.elapsed().as_millis() as u64,
    };

    let chain = match indexer.handlers.generator.generate(&ctx.criteria) {
        Ok(chain) => chain,
        Err(e) => {
            return finish(
                Vec::new(),
                requests,
                RunOutcome::Failed {
                    reason: e.to_string(),
                    retry_after: e.retry_after(),
                },
            );
        }
    };

    let backend_spacing = definition
        .rate_limit_ms
        .map(Duration::from_millis)
        .unwrap_or(ctx.rate_limiter.default_spacing());
    let page_size = definition.capabilities.page_size;
    // Overlapping pages repeat releases; the first copy wins
    let mut seen_guids = HashSet::new();

    for tier in chain.tiers() {
        let mut tier_releases = Vec::new();

        for sequence in tier {
            for request in sequence {
                if ctx.token.is_cancelled() {
                    return finish(Vec::new(), requests, RunOutcome::Cancelled);
                }

                let spacing = request
                    .rate_limit
                    .map_or(backend_spacing, |s| s.max(backend_spacing));
                let host = request.host().unwrap_or_default();
                if !ctx.rate_limiter.acquire(&host, Some(spacing), &ctx.token).await {
                    return finish(Vec::new(), requests, RunOutcome::Cancelled);
                }

                // Each page counts against the quota
                if ctx.quotas.at_query_limit(definition, ctx.clock.now()) {
                    info!(
                        indexer_id = definition.id,
                        pages = requests.len(),
                        "Query limit reached, stopping request chain"
                    );
                    return finish(tier_releases, requests, RunOutcome::Success);
                }

                ctx.quotas.record_query(definition.id);
                let sent = Instant::now();

                let response = tokio::select! {
                    biased;
                    response = ctx.executor.execute(request) => response,
                    _ = ctx.token.cancelled() => {
                        return finish(Vec::new(), requests, RunOutcome::Cancelled);
                    }
                };

                let response = match response {
                    Ok(response) => response,
                    Err(e) => {
                        requests.push(RequestRecord {
                            url: request.redacted_url(),
                            status: None,
                            elapsed_ms: sent.elapsed().as_millis() as u64,
                            release_count: 0,
                        });
                        return finish(
                            Vec::new(),
                            requests,
                            RunOutcome::Failed {
                                reason: e.to_string(),
                                retry_after: e.retry_after(),
                            },
                        );
                    }
                };

                let outcome = indexer.handlers.parser.parse(&response, ctx.clock.now());
                let page_len = match &outcome {
                    ParseOutcome::Releases(page) => page.len(),
                    _ => 0,
                };
                requests.push(RequestRecord {
                    url: request.redacted_url(),
                    status: Some(response.status),
                    elapsed_ms: sent.elapsed().as_millis() as u64,
                    release_count: page_len,
                });

                match outcome {
                    ParseOutcome::Releases(page) => {
                        let full_page = page_size != 0 && page.len() >= page_size;
                        tier_releases.extend(
                            page.into_iter()
                                .filter(|r| seen_guids.insert(r.guid.clone()))
                                .map(|r| r.with_indexer(definition)),
                        );
                        if !full_page {
                            break;
                        }
                    }
                    ParseOutcome::RetryAfter(retry_after) => {
                        return finish(
                            Vec::new(),
                            requests,
                            RunOutcome::Failed {
                                reason: format!("Rate limited for {}s", retry_after.as_secs()),
                                retry_after: Some(retry_after),
                            },
                        );
                    }
                    ParseOutcome::HardFailure(reason) => {
                        return finish(
                            Vec::new(),
                            requests,
                            RunOutcome::Failed {
                                reason,
                                retry_after: None,
                            },
                        );
                    }
                }
            }
        }

        if !tier_releases.is_empty() {
            return finish(tier_releases, requests, RunOutcome::Success);
        }
    }

    finish(Vec::new(), requests, RunOutcome::Success)
}

/// Category, age and size filtering over the merged list
fn filter_releases(
    criteria: &SearchCriteria,
    indexers: &[Arc<RegisteredIndexer>],
    releases: Vec<ReleaseInfo>,
    now: DateTime<Utc>,
) -> Vec<ReleaseInfo> {
    let base = criteria.base();

    let mut wanted: Vec<i32> = Vec::new();
    if !base.categories.is_empty() {
        for indexer in indexers {
            for id in indexer.definition.capabilities.categories.expand(&base.categories) {
                if !wanted.contains(&id) {
                    wanted.push(id);
                }
            }
        }
    }

    releases
        .into_iter()
        .filter(|r| {
            base.categories.is_empty()
                || r.categories.is_empty()
                || r.categories.iter().any(|c| wanted.contains(c))
        })
        .filter(|r| {
            let age = r.age_days(now);
            // Zero means no bound
            base.min_age.filter(|m| *m > 0).is_none_or(|min| age >= i64::from(min))
                && base.max_age.filter(|m| *m > 0).is_none_or(|max| age <= i64::from(max))
        })
        .filter(|r| match r.size {
            Some(size) => {
                base.min_size.is_none_or(|min| size >= min) && base.max_size.is_none_or(|max| size <= max)
            }
            None => true,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::categories::CategoryMap;
    use crate::indexer::criteria::{BasicSearch, SearchBase};
    use crate::indexer::types::{DownloadProtocol, IndexerDefinition};
    use crate::indexer::{
        BookSearch, IndexerError, IndexerHandlers, IndexerResponse, MovieSearch, MusicSearch, RequestChain,
        RequestGenerator, ResponseParser, TvSearch,
    };

    struct NoRequests;

    impl RequestGenerator for NoRequests {
        fn basic_search(&self, _: &BasicSearch) -> Result<RequestChain, IndexerError> {
            Ok(RequestChain::new())
        }
        fn movie_search(&self, _: &MovieSearch) -> Result<RequestChain, IndexerError> {
            Ok(RequestChain::new())
        }
        fn tv_search(&self, _: &TvSearch) -> Result<RequestChain, IndexerError> {
            Ok(RequestChain::new())
        }
        fn music_search(&self, _: &MusicSearch) -> Result<RequestChain, IndexerError> {
            Ok(RequestChain::new())
        }
        fn book_search(&self, _: &BookSearch) -> Result<RequestChain, IndexerError> {
            Ok(RequestChain::new())
        }
    }

    impl ResponseParser for NoRequests {
        fn parse_releases(&self, _: &IndexerResponse) -> Result<Vec<ReleaseInfo>, IndexerError> {
            Ok(Vec::new())
        }
    }

    fn registered(id: i32, protocol: DownloadProtocol) -> Arc<RegisteredIndexer> {
        let mut categories = CategoryMap::new();
        categories.add_mapping("44", 2000, None);
        categories.add_mapping("48", 2040, None);
        let mut definition = IndexerDefinition::new(id, format!("Indexer {}", id), protocol);
        definition.capabilities.categories = categories;
        let handlers = IndexerHandlers {
            generator: Arc::new(NoRequests),
            parser: Arc::new(NoRequests),
        };
        Arc::new(RegisteredIndexer {
            definition: Arc::new(definition),
            handlers,
        })
    }

    fn release(categories: Vec<i32>, size: Option<i64>, age_days: i64, now: DateTime<Utc>) -> ReleaseInfo {
        let mut release = ReleaseInfo::new("r", "g", now - chrono::Duration::days(age_days));
        release.categories = categories;
        release.size = size;
        release
    }

    #[test]
    fn test_allowlist_sentinels() {
        let usenet = registered(1, DownloadProtocol::Usenet);
        let torrent = registered(2, DownloadProtocol::Torrent);

        assert!(allowlisted(&[ALL_USENET_INDEXERS], &usenet));
        assert!(!allowlisted(&[ALL_USENET_INDEXERS], &torrent));
        assert!(allowlisted(&[ALL_TORRENT_INDEXERS], &torrent));
        assert!(allowlisted(&[2], &torrent));
        assert!(!allowlisted(&[3], &usenet));
    }

    #[test]
    fn test_category_filter_keeps_uncategorised_and_children() {
        let now = Utc::now();
        let indexers = vec![registered(1, DownloadProtocol::Usenet)];
        let criteria = SearchCriteria::Basic(BasicSearch {
            base: SearchBase {
                categories: vec![2000],
                ..Default::default()
            },
        });

        let releases = vec![
            release(vec![2040], None, 0, now),
            release(vec![5000], None, 0, now),
            release(vec![], None, 0, now),
        ];

        let kept = filter_releases(&criteria, &indexers, releases, now);
        let cats: Vec<Vec<i32>> = kept.iter().map(|r| r.categories.clone()).collect();
        assert_eq!(cats, vec![vec![2040], vec![]]);
    }

    #[test]
    fn test_age_and_size_filters() {
        let now = Utc::now();
        let indexers = vec![registered(1, DownloadProtocol::Usenet)];
        let criteria = SearchCriteria::Basic(BasicSearch {
            base: SearchBase {
                min_age: Some(1),
                max_age: Some(10),
                min_size: Some(100),
                max_size: Some(1_000),
                ..Default::default()
            },
        });

        let releases = vec![
            release(vec![], Some(500), 5, now),
            release(vec![], Some(500), 0, now),
            release(vec![], Some(500), 30, now),
            release(vec![], Some(50), 5, now),
            release(vec![], None, 5, now),
        ];

        let kept = filter_releases(&criteria, &indexers, releases, now);
        let sizes: Vec<Option<i64>> = kept.iter().map(|r| r.size).collect();
        assert_eq!(sizes, vec![Some(500), None]);
    }

    #[test]
    fn test_zero_age_bounds_filter_nothing() {
        let now = Utc::now();
        let indexers = vec![registered(1, DownloadProtocol::Usenet)];
        let criteria = SearchCriteria::Basic(BasicSearch {
            base: SearchBase {
                min_age: Some(0),
                max_age: Some(0),
                ..Default::default()
            },
        });

        let releases = vec![
            release(vec![], Some(1), 0, now),
            release(vec![], Some(2), 3, now),
            release(vec![], Some(3), 400, now),
        ];

        let kept = filter_releases(&criteria, &indexers, releases, now);
        let sizes: Vec<Option<i64>> = kept.iter().map(|r| r.size).collect();
        assert_eq!(sizes, vec![Some(1), Some(2), Some(3)]);
    }
}
