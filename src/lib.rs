//! nabgate - Newznab/Torznab search gateway
//!
//! Accepts one Newznab/Torznab query, fans it out to every eligible
//! backend concurrently and returns the merged, filtered releases. Backends
//! that fail are backed off without failing the query.

pub mod config;
pub mod indexer;

pub use indexer::{
    DispatchConfig, IndexerDefinition, IndexerError, IndexerRegistry, ReleaseInfo, SearchCriteria, SearchDispatcher,
    SearchError, SearchResult,
};
