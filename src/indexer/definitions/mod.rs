//! Backend implementations
//!
//! Every backend definition names an implementation. The implementation
//! resolves the definition's settings and capabilities into the
//! generator/parser pair the dispatcher drives.
//!
//! # Adding a new implementation
//!
//! 1. Create a new file in this directory (e.g., `mybackend.rs`)
//! 2. Implement `RequestGenerator` and `ResponseParser` for it
//! 3. Add it to the `AVAILABLE_IMPLEMENTATIONS` list and to `build_handlers`

pub mod newznab;

use once_cell::sync::Lazy;

use super::{DownloadProtocol, IndexerDefinition, IndexerError, IndexerHandlers};

/// Information about an available implementation
#[derive(Debug, Clone)]
pub struct ImplementationInfo {
    /// Unique identifier, matched against `IndexerDefinition::implementation`
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub protocol: DownloadProtocol,
    /// Settings that must be present for the backend to be queried
    pub required_settings: &'static [&'static str],
    pub optional_settings: &'static [SettingDefinition],
}

/// Definition of a configurable setting
#[derive(Debug, Clone)]
pub struct SettingDefinition {
    pub key: &'static str,
    pub label: &'static str,
    pub default_value: Option<&'static str>,
}

const NEWZNAB_OPTIONAL_SETTINGS: &[SettingDefinition] = &[
    SettingDefinition {
        key: "api_path",
        label: "Path to the API, usually /api",
        default_value: Some("/api"),
    },
    SettingDefinition {
        key: "api_key",
        label: "API key",
        default_value: None,
    },
    SettingDefinition {
        key: "additional_parameters",
        label: "Additional query parameters, e.g. &attrs=poster",
        default_value: None,
    },
];

/// List of all available implementations
pub static AVAILABLE_IMPLEMENTATIONS: Lazy<Vec<ImplementationInfo>> = Lazy::new(|| {
    vec![
        ImplementationInfo {
            id: "newznab",
            name: "Newznab",
            description: "Generic Newznab-compatible Usenet indexer (NZBGeek, DrunkenSlug, etc.)",
            protocol: DownloadProtocol::Usenet,
            required_settings: &["base_url"],
            optional_settings: NEWZNAB_OPTIONAL_SETTINGS,
        },
        ImplementationInfo {
            id: "torznab",
            name: "Torznab",
            description: "Generic Torznab-compatible torrent indexer",
            protocol: DownloadProtocol::Torrent,
            required_settings: &["base_url"],
            optional_settings: NEWZNAB_OPTIONAL_SETTINGS,
        },
    ]
});

pub fn get_available_implementations() -> &'static [ImplementationInfo] {
    &AVAILABLE_IMPLEMENTATIONS
}

/// Look up an implementation, case-insensitively
pub fn get_implementation_info(id: &str) -> Option<&'static ImplementationInfo> {
    AVAILABLE_IMPLEMENTATIONS
        .iter()
        .find(|i| i.id.eq_ignore_ascii_case(id.trim()))
}

/// Resolve the generator/parser pair for a definition
pub fn build_handlers(definition: &IndexerDefinition) -> Result<IndexerHandlers, IndexerError> {
    let info = get_implementation_info(&definition.implementation).ok_or_else(|| {
        IndexerError::NotConfigured(format!(
            "unknown implementation '{}'",
            definition.implementation
        ))
    })?;

    if let Some(missing) = info
        .required_settings
        .iter()
        .find(|key| definition.setting(key).is_none())
    {
        return Err(IndexerError::NotConfigured(format!(
            "{} requires the '{}' setting",
            info.name, missing
        )));
    }

    match info.id {
        "newznab" | "torznab" => newznab::build(definition),
        other => Err(IndexerError::NotConfigured(format!(
            "no handlers for implementation '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert_eq!(get_implementation_info("Torznab").map(|i| i.id), Some("torznab"));
        assert!(get_implementation_info("cardigann").is_none());
        assert_eq!(get_available_implementations().len(), 2);
    }

    #[test]
    fn test_missing_required_setting() {
        let definition = IndexerDefinition::new(1, "No URL", DownloadProtocol::Usenet);
        assert_matches!(build_handlers(&definition), Err(IndexerError::NotConfigured(msg)) if msg.contains("base_url"));
    }

    #[test]
    fn test_build_torznab_handlers() {
        let mut definition = IndexerDefinition::new(2, "Tracker", DownloadProtocol::Torrent);
        definition
            .settings
            .insert("base_url".to_string(), "https://tracker.example".to_string());

        assert_eq!(definition.implementation, "torznab");
        assert!(build_handlers(&definition).is_ok());
    }
}
