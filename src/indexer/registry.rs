//! Registered backends and their resolved handlers

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use super::definitions;
use super::types::{DownloadProtocol, IndexerDefinition};
use super::{IndexerError, IndexerHandlers};

/// A backend definition paired with its generator/parser
#[derive(Debug, Clone)]
pub struct RegisteredIndexer {
    pub definition: Arc<IndexerDefinition>,
    pub handlers: IndexerHandlers,
}

impl RegisteredIndexer {
    pub fn id(&self) -> i32 {
        self.definition.id
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn protocol(&self) -> DownloadProtocol {
        self.definition.protocol
    }
}

/// All configured backends, keyed by id
///
/// Handlers are resolved once when a backend is registered; queries only
/// look them up.
#[derive(Default)]
pub struct IndexerRegistry {
    indexers: RwLock<HashMap<i32, Arc<RegisteredIndexer>>>,
}

impl IndexerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend with explicitly supplied handlers
    pub fn register(&self, definition: IndexerDefinition, handlers: IndexerHandlers) {
        info!(
            indexer_id = definition.id,
            indexer_name = %definition.name,
            implementation = %definition.implementation,
            enabled = definition.enabled,
            "Registered indexer"
        );

        let id = definition.id;
        let indexer = RegisteredIndexer {
            definition: Arc::new(definition),
            handlers,
        };
        self.indexers.write().insert(id, Arc::new(indexer));
    }

    /// Register a backend, resolving handlers from its implementation name
    pub fn register_definition(&self, definition: IndexerDefinition) -> Result<(), IndexerError> {
        let handlers = definitions::build_handlers(&definition)?;
        self.register(definition, handlers);
        Ok(())
    }

    pub fn remove(&self, id: i32) -> Option<Arc<RegisteredIndexer>> {
        self.indexers.write().remove(&id)
    }

    pub fn get(&self, id: i32) -> Option<Arc<RegisteredIndexer>> {
        self.indexers.read().get(&id).cloned()
    }

    /// Every registered backend, ordered by priority then id
    pub fn all(&self) -> Vec<Arc<RegisteredIndexer>> {
        let mut indexers: Vec<_> = self.indexers.read().values().cloned().collect();
        indexers.sort_by_key(|i| (i.definition.priority, i.definition.id));
        indexers
    }

    pub fn enabled(&self) -> Vec<Arc<RegisteredIndexer>> {
        self.all()
            .into_iter()
            .filter(|i| i.definition.enabled)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.indexers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexers.read().is_empty()
    }
}

impl std::fmt::Debug for IndexerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexerRegistry")
            .field("indexers_count", &self.indexers.read().len())
            .finish()
    }
}
