//! Validated configuration surface.
//!
//! This module does **not** read `argv` or a config file — that belongs to
//! the excluded CLI/HTTP shell. It accepts an already-deserialized [`Config`]
//! and validates it against the rejection rules of the outer system's
//! configuration contract.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl Environment {
    fn from_str_strict(s: &str) -> Option<Self> {
        match s {
            "development" => Some(Self::Development),
            "test" => Some(Self::Test),
            "production" => Some(Self::Production),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthHeader {
    pub name: String,
    pub value: String,
}

impl AuthHeader {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() != self.value.is_empty() {
            return Err(ConfigError::PartialAuthHeader);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedSource {
    pub url: String,
    #[serde(default)]
    pub auth_header: Option<AuthHeader>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RealtimeFeedSource {
    pub trip_updates_url: Option<String>,
    pub vehicle_positions_url: Option<String>,
    pub service_alerts_url: Option<String>,
    #[serde(default)]
    pub auth_header: Option<AuthHeader>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "lowercase")]
pub enum DataPath {
    Memory,
    File(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub port: u32,
    pub env: String,
    pub api_keys: Vec<String>,
    pub rate_limit_per_second: i64,
    pub gtfs_static_feed: FeedSource,
    #[serde(default)]
    pub gtfs_rt_feeds: Vec<RealtimeFeedSource>,
    pub data_path: DataPath,
}

/// Returns true if `url` (case-insensitively) uses the `file://` scheme.
fn is_file_url(url: &str) -> bool {
    url.to_ascii_lowercase().starts_with("file://")
}

/// Returns true if, after simple `.`/`..` segment cleaning, the path
/// contains a `..` segment that would escape its starting directory.
fn has_path_traversal(path: &str) -> bool {
    path.split(['/', '\\']).any(|segment| segment == "..")
}

impl Config {
    /// Validate every rejection rule from the outer system's configuration
    /// contract. Returns the first violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port < 1 || self.port > 65535 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        let env = Environment::from_str_strict(&self.env)
            .ok_or_else(|| ConfigError::InvalidEnv(self.env.clone()))?;

        if self.api_keys.is_empty() {
            return Err(ConfigError::EmptyApiKeys);
        }
        let mut seen = std::collections::HashSet::with_capacity(self.api_keys.len());
        for key in &self.api_keys {
            if !seen.insert(key) {
                return Err(ConfigError::DuplicateApiKey(key.clone()));
            }
        }

        if self.rate_limit_per_second < 1 {
            return Err(ConfigError::InvalidRateLimit(self.rate_limit_per_second));
        }

        self.validate_feed_source(&self.gtfs_static_feed)?;
        for rt in &self.gtfs_rt_feeds {
            if let Some(url) = &rt.trip_updates_url {
                self.validate_url(url)?;
            }
            if let Some(url) = &rt.vehicle_positions_url {
                self.validate_url(url)?;
            }
            if let Some(url) = &rt.service_alerts_url {
                self.validate_url(url)?;
            }
            if let Some(h) = &rt.auth_header {
                h.validate()?;
            }
        }

        match &self.data_path {
            DataPath::Memory => {}
            DataPath::File(path) => {
                if has_path_traversal(path) {
                    return Err(ConfigError::PathTraversal(path.clone()));
                }
                if env == Environment::Test {
                    return Err(ConfigError::TestRequiresMemory);
                }
            }
        }

        Ok(())
    }

    fn validate_url(&self, url: &str) -> Result<(), ConfigError> {
        if is_file_url(url) {
            return Err(ConfigError::FileUrlNotAllowed(url.to_string()));
        }
        if has_path_traversal(url) {
            return Err(ConfigError::PathTraversal(url.to_string()));
        }
        Ok(())
    }

    fn validate_feed_source(&self, feed: &FeedSource) -> Result<(), ConfigError> {
        self.validate_url(&feed.url)?;
        if let Some(h) = &feed.auth_header {
            h.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            port: 8080,
            env: "production".to_string(),
            api_keys: vec!["key-a".to_string()],
            rate_limit_per_second: 10,
            gtfs_static_feed: FeedSource {
                url: "https://example.com/gtfs.zip".to_string(),
                auth_header: None,
            },
            gtfs_rt_feeds: vec![],
            data_path: DataPath::File("data/transit.db".to_string()),
        }
    }

    #[test]
    fn accepts_a_well_formed_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_port() {
        let mut c = base_config();
        c.port = 0;
        assert!(matches!(c.validate(), Err(ConfigError::InvalidPort(0))));
        c.port = 70000;
        assert!(matches!(c.validate(), Err(ConfigError::InvalidPort(70000))));
    }

    #[test]
    fn rejects_unknown_env() {
        let mut c = base_config();
        c.env = "staging".to_string();
        assert!(matches!(c.validate(), Err(ConfigError::InvalidEnv(_))));
    }

    #[test]
    fn rejects_empty_api_keys() {
        let mut c = base_config();
        c.api_keys.clear();
        assert!(matches!(c.validate(), Err(ConfigError::EmptyApiKeys)));
    }

    #[test]
    fn rejects_duplicate_api_keys() {
        let mut c = base_config();
        c.api_keys = vec!["dup".to_string(), "dup".to_string()];
        assert!(matches!(c.validate(), Err(ConfigError::DuplicateApiKey(_))));
    }

    #[test]
    fn rejects_rate_limit_below_one() {
        let mut c = base_config();
        c.rate_limit_per_second = 0;
        assert!(matches!(c.validate(), Err(ConfigError::InvalidRateLimit(0))));
    }

    #[test]
    fn rejects_file_scheme_urls_case_insensitively() {
        let mut c = base_config();
        c.gtfs_static_feed.url = "FILE:///etc/passwd".to_string();
        assert!(matches!(c.validate(), Err(ConfigError::FileUrlNotAllowed(_))));
    }

    #[test]
    fn rejects_path_traversal_in_data_path() {
        let mut c = base_config();
        c.data_path = DataPath::File("../../etc/passwd".to_string());
        assert!(matches!(c.validate(), Err(ConfigError::PathTraversal(_))));
    }

    #[test]
    fn memory_data_path_is_exempt_from_traversal_check() {
        let mut c = base_config();
        c.data_path = DataPath::Memory;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn rejects_partially_specified_auth_header() {
        let mut c = base_config();
        c.gtfs_static_feed.auth_header = Some(AuthHeader {
            name: "X-Api-Key".to_string(),
            value: String::new(),
        });
        assert!(matches!(c.validate(), Err(ConfigError::PartialAuthHeader)));
    }

    #[test]
    fn test_env_requires_in_memory_store() {
        let mut c = base_config();
        c.env = "test".to_string();
        c.data_path = DataPath::File("data/transit.db".to_string());
        assert!(matches!(c.validate(), Err(ConfigError::TestRequiresMemory)));

        c.data_path = DataPath::Memory;
        assert!(c.validate().is_ok());
    }
}
