use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// OAuth client secret file, as downloaded from the Google console.
    pub credentials_path: String,
    /// Gmail search query used by the `recent` listing.
    pub query: String,
    /// Default listing size.
    pub max_results: u32,
    pub retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            credentials_path: "credentials.json".to_string(),
            query: "in:inbox".to_string(),
            max_results: 10,
            retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    pub fn load() -> Self {
        use std::fs;
        if let Ok(content) = fs::read_to_string("settings.toml") {
            if let Ok(config) = toml::from_str(&content) {
                return config;
            }
        }
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: Config = toml::from_str("query = \"in:inbox is:unread\"").unwrap();
        assert_eq!(config.query, "in:inbox is:unread");
        assert_eq!(config.credentials_path, "credentials.json");
        assert_eq!(config.retry.retry_delay_ms, 2000);
    }

    #[test]
    fn test_retry_section_overrides() {
        let config: Config = toml::from_str("[retry]\nretry_delay_ms = 500").unwrap();
        assert_eq!(config.retry.retry_delay_ms, 500);
        assert_eq!(config.retry.batch_delay_ms, 1000);
    }
}
