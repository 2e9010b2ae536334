//! reqwest-backed request execution

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::{HttpExecutor, HttpMethod, IndexerError, IndexerRequest, IndexerResponse};

const USER_AGENT: &str = concat!("nabgate/", env!("CARGO_PKG_VERSION"));

/// Executes requests over a shared reqwest client
#[derive(Debug, Clone)]
pub struct ReqwestExecutor {
    client: Client,
}

impl ReqwestExecutor {
    /// Build a client with the given per-request timeout
    pub fn new(timeout: Duration) -> Result<Self, IndexerError> {
        let client = Client::builder()
            .gzip(true)
            .deflate(true)
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| IndexerError::Connection(e.to_string()))?;

        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpExecutor for ReqwestExecutor {
    async fn execute(&self, request: &IndexerRequest) -> Result<IndexerResponse, IndexerError> {
        let start = Instant::now();

        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.text().await?;
        let elapsed = start.elapsed();

        debug!(
            url = %request.url,
            status = status,
            elapsed_ms = elapsed.as_millis() as u64,
            bytes = body.len(),
            "Indexer request completed"
        );

        Ok(IndexerResponse {
            request: request.clone(),
            status,
            headers,
            body,
            elapsed,
        })
    }
}
