//! Application configuration management

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::indexer::manager::DispatchConfig;
use crate::indexer::status::BackoffPolicy;
use crate::indexer::{DownloadProtocol, IndexerCapabilities, IndexerDefinition, IndexerPrivacy};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address
    pub host: String,

    pub port: u16,

    /// Key callers must present as `apikey`
    pub api_key: String,

    /// YAML file listing the backends
    pub backends_path: PathBuf,

    /// Overall deadline of one query
    pub query_timeout: Duration,

    /// Per-request HTTP timeout
    pub request_timeout: Duration,

    pub backoff_base: Duration,
    pub backoff_max: Duration,

    /// Default minimum spacing between requests to one host
    pub host_spacing: Duration,

    /// How long fetched capabilities are reused
    pub caps_ttl: Duration,
}

fn parse_var<T>(name: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse()
        .with_context(|| format!("Invalid {}", name))
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("NABGATE_API_KEY").context("NABGATE_API_KEY is required")?;
        if api_key.trim().is_empty() {
            bail!("NABGATE_API_KEY must not be empty");
        }

        let backoff_base = Duration::from_secs(parse_var("NABGATE_BACKOFF_BASE_SECS", "60")?);
        let backoff_max = Duration::from_secs(parse_var("NABGATE_BACKOFF_MAX_SECS", "10800")?);
        if backoff_base.is_zero() || backoff_max < backoff_base {
            bail!("Backoff ceiling must be at least the (non-zero) base window");
        }

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),

            port: parse_var("PORT", "9117")?,

            api_key,

            backends_path: PathBuf::from(
                env::var("NABGATE_BACKENDS").unwrap_or_else(|_| "./backends.yaml".to_string()),
            ),

            query_timeout: Duration::from_secs(parse_var("NABGATE_QUERY_TIMEOUT_SECS", "60")?),

            request_timeout: Duration::from_secs(parse_var("NABGATE_REQUEST_TIMEOUT_SECS", "30")?),

            backoff_base,
            backoff_max,

            host_spacing: Duration::from_millis(parse_var("NABGATE_HOST_SPACING_MS", "2000")?),

            caps_ttl: Duration::from_secs(parse_var("NABGATE_CAPS_TTL_SECS", "604800")?),
        })
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            query_timeout: self.query_timeout,
            host_spacing: self.host_spacing,
            backoff: BackoffPolicy {
                base: self.backoff_base,
                max: self.backoff_max,
            },
        }
    }

    pub fn caps_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.caps_ttl).unwrap_or_else(|_| chrono::Duration::days(7))
    }
}

fn default_enabled() -> bool {
    true
}

fn default_priority() -> i32 {
    25
}

/// One backend entry of the YAML backend list
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub id: i32,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub protocol: DownloadProtocol,
    /// Defaults to `newznab` or `torznab` by protocol
    #[serde(default)]
    pub implementation: Option<String>,
    #[serde(default)]
    pub privacy: IndexerPrivacy,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub query_limit: Option<u32>,
    #[serde(default)]
    pub query_limit_monthly: Option<u32>,
    #[serde(default)]
    pub rate_limit_ms: Option<u64>,
    /// Fetched from the backend at startup when absent
    #[serde(default)]
    pub capabilities: Option<IndexerCapabilities>,
    #[serde(default)]
    pub settings: HashMap<String, String>,
}

impl BackendConfig {
    pub fn has_capabilities(&self) -> bool {
        self.capabilities.is_some()
    }

    pub fn into_definition(self) -> IndexerDefinition {
        let mut definition = IndexerDefinition::new(self.id, self.name, self.protocol);
        if let Some(implementation) = self.implementation {
            definition.implementation = implementation;
        }
        definition.enabled = self.enabled;
        definition.privacy = self.privacy;
        definition.priority = self.priority;
        definition.query_limit = self.query_limit;
        definition.query_limit_monthly = self.query_limit_monthly;
        definition.rate_limit_ms = self.rate_limit_ms;
        definition.settings = self.settings;
        if let Some(capabilities) = self.capabilities {
            definition.capabilities = capabilities;
        }
        definition
    }
}

/// Parse a YAML backend list
pub fn parse_backends(yaml: &str) -> Result<Vec<BackendConfig>> {
    let backends: Vec<BackendConfig> = serde_yaml::from_str(yaml).context("Invalid backend list")?;

    let mut seen = Vec::with_capacity(backends.len());
    for backend in &backends {
        if seen.contains(&backend.id) {
            bail!("Duplicate backend id {}", backend.id);
        }
        seen.push(backend.id);
    }

    Ok(backends)
}

/// Read the YAML backend list from disk
pub fn load_backends(path: &Path) -> Result<Vec<BackendConfig>> {
    let yaml = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read backend list {}", path.display()))?;
    parse_backends(&yaml)
}
