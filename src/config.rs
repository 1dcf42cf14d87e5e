//! Engine configuration
//!
//! Loaded from a TOML file; every field has a default so an empty file (or no
//! file at all) yields a working local-only setup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};
use crate::model::Collection;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub mutation: MutationConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
}

impl Config {
    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("reading {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| SyncError::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding `tracker.db`
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Staleness windows per collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Default window for entity collections, in milliseconds
    #[serde(default = "default_stale_time")]
    pub stale_time_ms: u64,

    /// Window for the points ledger
    #[serde(default = "default_points_stale_time")]
    pub points_stale_time_ms: u64,

    /// Window for the history log
    #[serde(default = "default_history_stale_time")]
    pub history_stale_time_ms: u64,

    /// Retired optimistic ids remembered for redirects; oldest dropped first
    #[serde(default = "default_max_aliases")]
    pub max_aliases: usize,
}

impl CacheConfig {
    pub fn stale_time_for(&self, collection: Collection) -> u64 {
        match collection {
            Collection::Points => self.points_stale_time_ms,
            Collection::History => self.history_stale_time_ms,
            _ => self.stale_time_ms,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_time_ms: default_stale_time(),
            points_stale_time_ms: default_points_stale_time(),
            history_stale_time_ms: default_history_stale_time(),
            max_aliases: default_max_aliases(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationConfig {
    /// Upper bound for each remote call made by a mutation
    #[serde(default = "default_mutation_timeout")]
    pub timeout_ms: u64,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_mutation_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Backend base URL. Unset means local-only.
    #[serde(default)]
    pub base_url: Option<String>,

    /// API key sent as bearer token and `apikey` header
    #[serde(default)]
    pub api_key: Option<String>,

    /// HTTP client timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

// Defaults
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tracker-sync")
}
fn default_stale_time() -> u64 { 5 * 60 * 1000 }
fn default_points_stale_time() -> u64 { 30 * 1000 }
fn default_history_stale_time() -> u64 { 10 * 60 * 1000 }
fn default_max_aliases() -> usize { 256 }
fn default_mutation_timeout() -> u64 { 10_000 }
fn default_request_timeout() -> u64 { 30 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.cache.stale_time_ms, 300_000);
        assert_eq!(config.mutation.timeout_ms, 10_000);
        assert_eq!(config.cache.max_aliases, 256);
        assert!(config.remote.base_url.is_none());
        assert!(config.store.data_dir.ends_with("tracker-sync"));
    }

    #[test]
    fn test_stale_time_per_collection() {
        let config = CacheConfig {
            stale_time_ms: 1,
            points_stale_time_ms: 2,
            history_stale_time_ms: 3,
            ..Default::default()
        };
        assert_eq!(config.stale_time_for(Collection::Rewards), 1);
        assert_eq!(config.stale_time_for(Collection::Points), 2);
        assert_eq!(config.stale_time_for(Collection::History), 3);
    }

    #[test]
    fn test_invalid_toml_is_a_config_error() {
        let err = Config::from_toml("[cache\nstale_time_ms = ").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }
}
