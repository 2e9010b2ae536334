//! Error types for backend calls and query handling

use std::time::Duration;

use thiserror::Error;

/// Failure talking to or understanding a single backend
///
/// These never reach the caller of an aggregate search; the dispatcher turns
/// them into status-tracker failures and zero results for that backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexerError {
    /// The backend asked us to slow down
    #[error("Too many requests, retry after {}s", retry_after.as_secs())]
    TooManyRequests { retry_after: Duration },

    #[error("Unexpected HTTP status {status} from {url}")]
    Http { status: u16, url: String },

    #[error("Connection failed: {0}")]
    Connection(String),

    /// The backend did not answer within the per-request timeout
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Request limit reached")]
    RequestLimitReached,

    /// An error element returned in a Newznab response body
    #[error("Indexer API error {code}: {description}")]
    Api { code: u32, description: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Indexer is not configured: {0}")]
    NotConfigured(String),
}

impl IndexerError {
    /// Explicit backoff requested by the backend, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            IndexerError::TooManyRequests { retry_after } => Some(*retry_after),
            IndexerError::RequestLimitReached => Some(Duration::from_secs(60 * 60)),
            _ => None,
        }
    }
}

impl From<quick_xml::Error> for IndexerError {
    fn from(e: quick_xml::Error) -> Self {
        IndexerError::Parse(e.to_string())
    }
}

impl From<reqwest::Error> for IndexerError {
    fn from(e: reqwest::Error) -> Self {
        let url = e.url().map(|u| u.to_string()).unwrap_or_default();
        if e.is_timeout() {
            IndexerError::Timeout(url)
        } else if let Some(status) = e.status() {
            IndexerError::Http {
                status: status.as_u16(),
                url,
            }
        } else {
            IndexerError::Connection(e.to_string())
        }
    }
}

/// Errors surfaced to the caller of a search
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SearchError {
    /// Malformed query input
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// An explicit backend selection left nothing usable
    #[error("Search failed due to all selected indexers being unavailable: {requested:?}")]
    NoIndexersAvailable { requested: Vec<i32> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_hints() {
        let throttled = IndexerError::TooManyRequests {
            retry_after: Duration::from_secs(90),
        };
        assert_eq!(throttled.retry_after(), Some(Duration::from_secs(90)));
        assert_eq!(
            IndexerError::RequestLimitReached.retry_after(),
            Some(Duration::from_secs(3600))
        );
        assert_eq!(IndexerError::Parse("bad".into()).retry_after(), None);
    }

    #[test]
    fn test_no_indexers_message() {
        let err = SearchError::NoIndexersAvailable {
            requested: vec![5, 6],
        };
        assert_eq!(
            err.to_string(),
            "Search failed due to all selected indexers being unavailable: [5, 6]"
        );
    }
}
