//! Indexer abstraction and search dispatch
//!
//! Every backend plugs in through two pieces: a [`RequestGenerator`] that
//! turns criteria into outbound HTTP requests and a [`ResponseParser`] that
//! turns raw responses into [`ReleaseInfo`] records. The dispatcher only
//! ever talks to those two traits.

pub mod cache;
pub mod categories;
pub mod clock;
pub mod criteria;
pub mod definitions;
pub mod error;
pub mod events;
pub mod http;
pub mod limits;
pub mod manager;
pub mod rate_limiter;
pub mod registry;
pub mod status;
pub mod torznab;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

pub use categories::CategoryMap;
pub use criteria::{BasicSearch, BookSearch, MovieSearch, MusicSearch, SearchBase, SearchCriteria, TvSearch};
pub use error::{IndexerError, SearchError};
pub use manager::{DispatchConfig, SearchDispatcher, SearchResult};
pub use registry::IndexerRegistry;
pub use types::*;

/// Backoff used when a backend throttles us without saying for how long
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60 * 60);

static SECRET_PARAM_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)([?&](?:apikey|api_key|passkey|rsskey)=)[^&]+").expect("secret param pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

/// A fully formed outbound request
#[derive(Debug, Clone, PartialEq)]
pub struct IndexerRequest {
    pub url: String,
    pub method: HttpMethod,
    pub headers: Vec<(String, String)>,
    /// Minimum spacing to other requests to the same host
    pub rate_limit: Option<Duration>,
}

impl IndexerRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Get,
            headers: Vec::new(),
            rate_limit: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_rate_limit(mut self, spacing: Duration) -> Self {
        self.rate_limit = Some(spacing);
        self
    }

    /// The URL with credentials masked, for logs and events
    pub fn redacted_url(&self) -> String {
        SECRET_PARAM_REGEX
            .replace_all(&self.url, "${1}(removed)")
            .into_owned()
    }

    /// Host part of the URL, used as the rate limiting key
    pub fn host(&self) -> Option<String> {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
    }
}

/// Ordered tiers of pageable request sequences
///
/// Tiers are tried in order and the first tier that yields any release
/// wins. Within a tier every sequence is paged until a short page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestChain {
    tiers: Vec<Vec<Vec<IndexerRequest>>>,
}

impl RequestChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pageable sequence to the current tier
    pub fn add(&mut self, requests: Vec<IndexerRequest>) {
        if requests.is_empty() {
            return;
        }
        if self.tiers.is_empty() {
            self.tiers.push(Vec::new());
        }
        if let Some(tier) = self.tiers.last_mut() {
            tier.push(requests);
        }
    }

    /// Start a new fallback tier with the given sequence
    pub fn add_tier(&mut self, requests: Vec<IndexerRequest>) {
        if requests.is_empty() {
            return;
        }
        self.tiers.push(vec![requests]);
    }

    pub fn tiers(&self) -> &[Vec<Vec<IndexerRequest>>] {
        &self.tiers
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(|tier| tier.is_empty())
    }

    pub fn request_count(&self) -> usize {
        self.tiers.iter().flatten().map(|seq| seq.len()).sum()
    }

    pub fn first_request(&self) -> Option<&IndexerRequest> {
        self.tiers.iter().flatten().flatten().next()
    }
}

/// Raw response handed to a parser
#[derive(Debug, Clone)]
pub struct IndexerResponse {
    pub request: IndexerRequest,
    pub status: u16,
    /// Header names are lowercased
    pub headers: HashMap<String, String>,
    pub body: String,
    pub elapsed: Duration,
}

impl IndexerResponse {
    pub fn new(request: IndexerRequest, status: u16, body: impl Into<String>) -> Self {
        Self {
            request,
            status,
            headers: HashMap::new(),
            body: body.into(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(|s| s.as_str())
    }

    /// `Retry-After` as either delta seconds or an HTTP date
    pub fn retry_after(&self, now: DateTime<Utc>) -> Option<Duration> {
        let value = self.header("retry-after")?.trim();
        if let Ok(secs) = value.parse::<u64>() {
            return Some(Duration::from_secs(secs));
        }
        DateTime::parse_from_rfc2822(value)
            .ok()
            .and_then(|at| (at.with_timezone(&Utc) - now).to_std().ok())
    }
}

/// Classified result of parsing one response
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Releases(Vec<ReleaseInfo>),
    /// Retryable throttling with an explicit backoff
    RetryAfter(Duration),
    HardFailure(String),
}

/// Builds outbound requests for one backend
///
/// Implementations must be pure: the same criteria always produce the same
/// chain and nothing shared is mutated.
pub trait RequestGenerator: Send + Sync {
    fn basic_search(&self, criteria: &BasicSearch) -> Result<RequestChain, IndexerError>;
    fn movie_search(&self, criteria: &MovieSearch) -> Result<RequestChain, IndexerError>;
    fn tv_search(&self, criteria: &TvSearch) -> Result<RequestChain, IndexerError>;
    fn music_search(&self, criteria: &MusicSearch) -> Result<RequestChain, IndexerError>;
    fn book_search(&self, criteria: &BookSearch) -> Result<RequestChain, IndexerError>;

    /// Whether the backend has everything it needs to be queried
    fn is_configured(&self) -> Result<(), IndexerError> {
        Ok(())
    }

    fn generate(&self, criteria: &SearchCriteria) -> Result<RequestChain, IndexerError> {
        match criteria {
            SearchCriteria::Basic(c) => self.basic_search(c),
            SearchCriteria::Movie(c) => self.movie_search(c),
            SearchCriteria::Tv(c) => self.tv_search(c),
            SearchCriteria::Music(c) => self.music_search(c),
            SearchCriteria::Book(c) => self.book_search(c),
        }
    }
}

/// Turns raw responses into releases
pub trait ResponseParser: Send + Sync {
    /// Parse a successful response body
    ///
    /// A single malformed record must be skipped, not returned as an error.
    fn parse_releases(&self, response: &IndexerResponse) -> Result<Vec<ReleaseInfo>, IndexerError>;

    /// Classify the response, then parse it
    ///
    /// `now` resolves `Retry-After` given as an HTTP date.
    fn parse(&self, response: &IndexerResponse, now: DateTime<Utc>) -> ParseOutcome {
        match response.status {
            404 => ParseOutcome::Releases(Vec::new()),
            429 => ParseOutcome::RetryAfter(response.retry_after(now).unwrap_or(DEFAULT_RETRY_AFTER)),
            status if status >= 400 => ParseOutcome::HardFailure(
                IndexerError::Http {
                    status,
                    url: response.request.url.clone(),
                }
                .to_string(),
            ),
            _ => match self.parse_releases(response) {
                Ok(releases) => ParseOutcome::Releases(releases),
                Err(e) => match e.retry_after() {
                    Some(retry_after) => ParseOutcome::RetryAfter(retry_after),
                    None => ParseOutcome::HardFailure(e.to_string()),
                },
            },
        }
    }
}

/// The generator/parser pair resolved for one backend
#[derive(Clone)]
pub struct IndexerHandlers {
    pub generator: Arc<dyn RequestGenerator>,
    pub parser: Arc<dyn ResponseParser>,
}

impl std::fmt::Debug for IndexerHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexerHandlers").finish_non_exhaustive()
    }
}

/// Executes outbound requests
///
/// Any HTTP status is a successful execution; only transport problems are
/// errors. Kept behind a trait so tests can script responses.
#[async_trait]
pub trait HttpExecutor: Send + Sync {
    async fn execute(&self, request: &IndexerRequest) -> Result<IndexerResponse, IndexerError>;
}
