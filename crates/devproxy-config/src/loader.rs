//! Loads and validates the config file and the mock file: every fallible
//! step gets an `anyhow::Context` message, and cross-field rules that the
//! JSON schema alone cannot express are checked by hand afterward.

use std::path::Path;

use devproxy_core::ProxyError;

use crate::schema::{Config, ErrorCatalogFile, MockFile, PluginEntry};

pub async fn load_config(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context_path("reading config file", path)?;
    let config: Config = serde_json::from_str(&raw).with_context_path("parsing config json", path)?;
    validate_config(&config).map_err(|e| anyhow::anyhow!(e))?;
    Ok(config)
}

pub async fn load_mock_file(path: impl AsRef<Path>) -> anyhow::Result<MockFile> {
    let path = path.as_ref();
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context_path("reading mock file", path)?;
    let mocks: MockFile = serde_json::from_str(&raw).with_context_path("parsing mock json", path)?;
    Ok(mocks)
}

pub async fn load_error_catalog_file(path: impl AsRef<Path>) -> anyhow::Result<ErrorCatalogFile> {
    let path = path.as_ref();
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context_path("reading error catalog file", path)?;
    let catalog: ErrorCatalogFile = serde_json::from_str(&raw).with_context_path("parsing error catalog json", path)?;
    Ok(catalog)
}

/// An "allowed" or "required" list counts as present only when it is both
/// `Some` and non-empty. See `DESIGN.md` for why this reading was chosen
/// over the literal `!(x == null || x.Any())` predicate.
pub fn is_present_and_nonempty<T>(list: &Option<Vec<T>>) -> bool {
    matches!(list, Some(v) if !v.is_empty())
}

fn validate_config(config: &Config) -> Result<(), ProxyError> {
    if !(1..=65535).contains(&(config.port as u32)) {
        return Err(ProxyError::ConfigInvalid(format!("port {} is out of range", config.port)));
    }
    if config.ip_address.parse::<std::net::IpAddr>().is_err() {
        return Err(ProxyError::ConfigInvalid(format!(
            "ipAddress `{}` is not a valid IP address",
            config.ip_address
        )));
    }
    let mut seen = std::collections::HashSet::new();
    for plugin in &config.plugins {
        if !seen.insert(plugin.name.clone()) {
            return Err(ProxyError::ConfigInvalid(format!(
                "plugin `{}` is configured more than once",
                plugin.name
            )));
        }
        validate_plugin_entry(plugin)?;
    }
    Ok(())
}

fn validate_plugin_entry(entry: &PluginEntry) -> Result<(), ProxyError> {
    match entry.name.as_str() {
        "rate-limiting" | "request-rate-limiting" => {
            serde_json::from_value::<crate::schema::RateLimitConfig>(entry.config.clone())
                .map_err(|e| ProxyError::ConfigInvalid(format!("plugin `{}`: {e}", entry.name)))?;
        }
        "token-rate-limiting" => {
            serde_json::from_value::<crate::schema::RateLimitTokensConfig>(entry.config.clone())
                .map_err(|e| ProxyError::ConfigInvalid(format!("plugin `{}`: {e}", entry.name)))?;
        }
        "random-error" | "generic-random-error" => {
            serde_json::from_value::<crate::schema::RandomErrorConfig>(entry.config.clone())
                .map_err(|e| ProxyError::ConfigInvalid(format!("plugin `{}`: {e}", entry.name)))?;
        }
        "latency" => {
            serde_json::from_value::<crate::schema::LatencyConfig>(entry.config.clone())
                .map_err(|e| ProxyError::ConfigInvalid(format!("plugin `{}`: {e}", entry.name)))?;
        }
        "mock-response" | "mock-generator" => {
            serde_json::from_value::<crate::schema::MockPluginConfig>(entry.config.clone())
                .map_err(|e| ProxyError::ConfigInvalid(format!("plugin `{}`: {e}", entry.name)))?;
        }
        _ => {}
    }
    Ok(())
}

trait ContextPath<T> {
    fn with_context_path(self, action: &'static str, path: &Path) -> anyhow::Result<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ContextPath<T> for Result<T, E> {
    fn with_context_path(self, action: &'static str, path: &Path) -> anyhow::Result<T> {
        use anyhow::Context;
        self.with_context(|| format!("{action} `{}`", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PluginEntry;

    #[test]
    fn rejects_out_of_range_port() {
        let config = Config {
            port: 70000,
            ip_address: "127.0.0.1".to_string(),
            urls_to_watch: vec![],
            plugins: vec![],
            log_level: None,
            new_version_notification: None,
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_duplicate_plugin_names() {
        let config = Config {
            port: 8000,
            ip_address: "127.0.0.1".to_string(),
            urls_to_watch: vec![],
            plugins: vec![
                PluginEntry {
                    name: "latency".to_string(),
                    enabled: true,
                    config: serde_json::json!({"minMs": 1, "maxMs": 2}),
                },
                PluginEntry {
                    name: "latency".to_string(),
                    enabled: true,
                    config: serde_json::json!({"minMs": 1, "maxMs": 2}),
                },
            ],
            log_level: None,
            new_version_notification: None,
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn present_and_nonempty_rejects_empty_list() {
        let empty: Option<Vec<u16>> = Some(vec![]);
        let missing: Option<Vec<u16>> = None;
        let populated: Option<Vec<u16>> = Some(vec![429]);
        assert!(!is_present_and_nonempty(&empty));
        assert!(!is_present_and_nonempty(&missing));
        assert!(is_present_and_nonempty(&populated));
    }
}
