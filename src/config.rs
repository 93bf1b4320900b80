//! Configuration management for the graph grower.
//!
//! Supports loading from environment variables, config files, and CLI arguments.

use crate::grow::GrowOptions;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main grower configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrowerConfig {
    /// Ledger query service settings
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    /// Output directory paths
    #[serde(default)]
    pub paths: PathConfig,

    /// Default options for every growth step
    #[serde(default)]
    pub grow: GrowOptions,

    /// Hard cap on growth steps per run
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Flipside API key
    #[serde(default)]
    pub api_key: String,

    /// JSON-RPC endpoint
    #[serde(default = "default_ledger_url")]
    pub base_url: String,

    /// Delay between query-run status polls (ms)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Give up on a query run after this long
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,

    /// Rows per result page
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Reuse cached results younger than this (0 = always re-run)
    #[serde(default)]
    pub max_age_minutes: u32,

    #[serde(default = "default_result_ttl_hours")]
    pub result_ttl_hours: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_ledger_url(),
            poll_interval_ms: default_poll_interval_ms(),
            query_timeout_secs: default_query_timeout_secs(),
            page_size: default_page_size(),
            max_age_minutes: 0,
            result_ttl_hours: default_result_ttl_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum requests per second
    #[serde(default = "default_rps")]
    pub requests_per_second: u32,

    /// Maximum retry attempts for transient HTTP failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff (ms)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rps(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Checkpoint directory for the grow state
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Where rendered graphs are written
    #[serde(default = "default_graphs_dir")]
    pub graphs_dir: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            graphs_dir: default_graphs_dir(),
        }
    }
}

// Default value functions
fn default_ledger_url() -> String {
    "https://api-v2.flipsidecrypto.xyz/json-rpc".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_query_timeout_secs() -> u64 {
    600
}

fn default_page_size() -> usize {
    10_000
}

fn default_result_ttl_hours() -> u32 {
    1
}

fn default_rps() -> u32 {
    5
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("data/state")
}

fn default_graphs_dir() -> PathBuf {
    PathBuf::from("data/graphs")
}

fn default_max_steps() -> u32 {
    5
}

impl Default for GrowerConfig {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig::default(),
            rate_limits: RateLimitConfig::default(),
            paths: PathConfig::default(),
            grow: GrowOptions::default(),
            max_steps: default_max_steps(),
        }
    }
}

impl GrowerConfig {
    /// Load configuration from environment
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();
        config.apply_env();
        Ok(config)
    }

    /// Load from a TOML config file with environment overrides
    pub fn load_from_file(path: &PathBuf) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = ::toml::from_str(&contents)?;

        // Environment variables override file settings
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("FLIPSIDE_API_KEY") {
            self.ledger.api_key = key;
        }
        if let Ok(url) = std::env::var("FLIPSIDE_BASE_URL") {
            self.ledger.base_url = url;
        }
    }

    /// Validate settings that would otherwise fail deep inside a run
    pub fn validate(&self, needs_ledger: bool) -> anyhow::Result<()> {
        if needs_ledger && self.ledger.api_key.is_empty() {
            anyhow::bail!("FLIPSIDE_API_KEY environment variable not set");
        }
        if self.grow.connection_limit == 0 {
            anyhow::bail!("grow.connection_limit must be > 0");
        }
        if self.ledger.page_size == 0 {
            anyhow::bail!("ledger.page_size must be > 0");
        }
        if self.max_steps == 0 {
            anyhow::bail!("max_steps must be > 0");
        }
        Ok(())
    }

    /// Ensure all output directories exist
    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.paths.state_dir)?;
        std::fs::create_dir_all(&self.paths.graphs_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::RankBy;

    #[test]
    fn test_defaults() {
        let config = GrowerConfig::default();
        assert!(config.grow.drop_spam);
        assert!(config.grow.stop_at_label);
        assert_eq!(config.grow.connection_limit, 500);
        assert_eq!(config.grow.rank_by, RankBy::AmountUsd);
        assert!(config.ledger.base_url.starts_with("https://"));
    }

    #[test]
    fn test_partial_toml() {
        let config: GrowerConfig = toml::from_str(
            r#"
            max_steps = 3

            [ledger]
            api_key = "abc"

            [grow]
            spam_symbols = ["SCAM"]
            rank_by = "block_timestamp"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_steps, 3);
        assert_eq!(config.ledger.api_key, "abc");
        assert_eq!(config.ledger.page_size, 10_000);
        assert!(config.grow.spam_symbols.contains("SCAM"));
        assert_eq!(config.grow.rank_by, RankBy::BlockTimestamp);
        assert!(config.grow.drop_spam);
    }

    #[test]
    fn test_validate_requires_key_only_for_ledger() {
        let config = GrowerConfig::default();
        assert!(config.validate(false).is_ok());
        let mut keyed = config.clone();
        keyed.ledger.api_key = String::new();
        assert!(keyed.validate(true).is_err());
    }
}
