//! Configuration — YAML config + env var overrides, in the same shape as the
//! rest of the reefworld deployment tooling expects.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// TCP port for the combined HTTP + WebSocket listener
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory holding world_state.json and agents.json
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Require the legacy external verification service for agents that
    /// present neither a self-issued key nor the bypass secret
    #[serde(default)]
    pub require_legacy_verify: bool,

    /// Endpoint of the legacy verification service
    #[serde(default)]
    pub legacy_verify_url: Option<String>,

    /// Operator bypass secret for trusted/dev connections (env only by default)
    #[serde(default)]
    pub dev_bypass_key: Option<String>,

    /// Public base URL used when minting claim links behind a proxy
    #[serde(default)]
    pub public_base_url: Option<String>,

    /// Inbound message budget per rate window, per connection
    #[serde(default = "default_rate_limit_max")]
    pub rate_limit_max: u32,

    /// Rate window length in milliseconds
    #[serde(default = "default_rate_limit_window_ms")]
    pub rate_limit_window_ms: u64,

    /// Hard ceiling on blocks in the world
    #[serde(default = "default_max_blocks")]
    pub max_blocks: usize,

    /// Max length of a scripted action's code string
    #[serde(default = "default_max_code_length")]
    pub max_code_length: usize,

    /// Coalescing delay for the debounced world-state flush
    #[serde(default = "default_save_debounce_ms")]
    pub save_debounce_ms: u64,

    /// Days of owner inactivity before a zone is listed for auction
    #[serde(default = "default_auction_inactive_days")]
    pub auction_inactive_days: i64,

    /// Seconds between auction/settlement sweep ticks
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_port() -> u16 {
    8080
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_rate_limit_max() -> u32 {
    30
}
fn default_rate_limit_window_ms() -> u64 {
    1000
}
fn default_max_blocks() -> usize {
    500_000
}
fn default_max_code_length() -> usize {
    5000
}
fn default_save_debounce_ms() -> u64 {
    5000
}
fn default_auction_inactive_days() -> i64 {
    30
}
fn default_sweep_interval_secs() -> u64 {
    3600
}

impl Config {
    /// Load config from a YAML file with env var overrides.
    pub fn load(config_path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config: {}", config_path.display()))?;

        let mut config: Config =
            serde_yaml::from_str(&content).context("Failed to parse reefworld.yaml")?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load `reefworld.yaml` from a directory, falling back to defaults if
    /// the file does not exist.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let config_path = dir.join("reefworld.yaml");
        if config_path.is_file() {
            Self::load(&config_path)
        } else {
            let mut config = Config::default();
            config.apply_env();
            config.validate()?;
            Ok(config)
        }
    }

    fn apply_env(&mut self) {
        if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
            self.port = port;
        }
        if let Ok(dir) = std::env::var("DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(v) = std::env::var("REEFWORLD_REQUIRE_LEGACY") {
            self.require_legacy_verify = v == "true" || v == "1";
        }
        if let Ok(url) = std::env::var("REEFWORLD_LEGACY_URL") {
            self.legacy_verify_url = Some(url);
        }
        if let Ok(key) = std::env::var("DEV_BYPASS_KEY") {
            if !key.is_empty() {
                self.dev_bypass_key = Some(key);
            }
        }
        if let Ok(url) = std::env::var("REEFWORLD_PUBLIC_URL") {
            self.public_base_url = Some(url);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.require_legacy_verify && self.legacy_verify_url.is_none() {
            anyhow::bail!(
                "require_legacy_verify is set but legacy_verify_url is not configured \
                 (reefworld.yaml or REEFWORLD_LEGACY_URL)"
            );
        }
        Ok(())
    }

    /// Base URL for minting claim links. Set `public_base_url` behind a
    /// proxy; otherwise the local listener address is used.
    pub fn base_url(&self) -> String {
        self.public_base_url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", self.port))
    }

    pub fn world_state_path(&self) -> PathBuf {
        self.data_dir.join("world_state.json")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("agents.json")
    }

    pub fn auction_inactive_ms(&self) -> i64 {
        self.auction_inactive_days * 24 * 60 * 60 * 1000
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            data_dir: default_data_dir(),
            require_legacy_verify: false,
            legacy_verify_url: None,
            dev_bypass_key: None,
            public_base_url: None,
            rate_limit_max: default_rate_limit_max(),
            rate_limit_window_ms: default_rate_limit_window_ms(),
            max_blocks: default_max_blocks(),
            max_code_length: default_max_code_length(),
            save_debounce_ms: default_save_debounce_ms(),
            auction_inactive_days: default_auction_inactive_days(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config_defaults() {
        let mut tmp = NamedTempFile::new().unwrap();
        writeln!(tmp, "port: 9001").unwrap();

        let config = Config::load(tmp.path()).unwrap();
        assert_eq!(config.port, 9001);
        assert_eq!(config.rate_limit_max, 30);
        assert_eq!(config.max_blocks, 500_000);
        assert_eq!(config.auction_inactive_days, 30);
        assert_eq!(config.save_debounce_ms, 5000);
    }

    #[test]
    fn test_load_config_custom_values() {
        let mut tmp = NamedTempFile::new().unwrap();
        writeln!(
            tmp,
            "data_dir: /tmp/reef\nrate_limit_max: 5\nauction_inactive_days: 7"
        )
        .unwrap();

        let config = Config::load(tmp.path()).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/reef"));
        assert_eq!(config.rate_limit_max, 5);
        assert_eq!(config.auction_inactive_ms(), 7 * 24 * 60 * 60 * 1000);
    }

    #[test]
    fn test_env_override_applies() {
        let mut tmp = NamedTempFile::new().unwrap();
        writeln!(tmp, "port: 9001").unwrap();

        std::env::set_var("DEV_BYPASS_KEY", "hunter2");
        let config = Config::load(tmp.path()).unwrap();
        std::env::remove_var("DEV_BYPASS_KEY");
        assert_eq!(config.dev_bypass_key.as_deref(), Some("hunter2"));
    }

    #[test]
    fn test_require_legacy_without_url_fails() {
        let mut tmp = NamedTempFile::new().unwrap();
        writeln!(tmp, "require_legacy_verify: true").unwrap();

        assert!(Config::load(tmp.path()).is_err());
    }
}
