//! nabgate server
//!
//! Loads the backend list, resolves missing capabilities and serves the
//! Newznab/Torznab API.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nabgate::config::{self, Config};
use nabgate::indexer::clock::system_clock;
use nabgate::indexer::definitions::newznab::{NewznabCapabilitiesProvider, NewznabSettings};
use nabgate::indexer::http::ReqwestExecutor;
use nabgate::indexer::torznab::{self, TorznabState};
use nabgate::indexer::{HttpExecutor, IndexerRegistry, SearchDispatcher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nabgate=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = Config::from_env()?;
    tracing::info!("Starting nabgate");

    let clock = system_clock();
    let executor: Arc<dyn HttpExecutor> =
        Arc::new(ReqwestExecutor::new(config.request_timeout).context("Failed to build HTTP client")?);
    let caps_provider = NewznabCapabilitiesProvider::new(executor.clone(), config.caps_ttl(), clock.clone());

    let backends = config::load_backends(&config.backends_path)?;
    let registry = Arc::new(IndexerRegistry::new());

    for backend in backends {
        let needs_caps = !backend.has_capabilities();
        let mut definition = backend.into_definition();

        if needs_caps && definition.enabled {
            let settings = NewznabSettings::from_definition(&definition);
            match caps_provider.get_capabilities(&settings).await {
                Ok(capabilities) => definition.capabilities = capabilities,
                Err(e) => {
                    tracing::warn!(
                        indexer_id = definition.id,
                        indexer_name = %definition.name,
                        error = %e,
                        "Failed to fetch capabilities, using defaults"
                    );
                }
            }
        }

        let (id, name) = (definition.id, definition.name.clone());
        if let Err(e) = registry.register_definition(definition) {
            tracing::warn!(indexer_id = id, indexer_name = %name, error = %e, "Skipping backend");
        }
    }

    tracing::info!(backends = registry.len(), "Backends loaded");

    let dispatcher = Arc::new(SearchDispatcher::new(
        registry,
        executor,
        config.dispatch_config(),
        clock,
    ));

    let app = torznab::router(TorznabState::new(dispatcher, config.api_key.clone()))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", config.host, config.port))?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    Ok(())
}
