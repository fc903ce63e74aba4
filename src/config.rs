//! Configuration management for wavedbg.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (WAVEDBG_TTMPS_SETUP, WAVEDBG_FORWARD_PROGRESS)
//! 2. Project-local config file (`./wavedbg.toml`)
//! 3. User config file (`~/.config/wavedbg/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # wavedbg.toml
//!
//! # Whether the OS sets up ttmp registers at wave launch. When false the
//! # library zero-initializes them and matches waves by snapshot order.
//! ttmps_setup = true
//!
//! # Whether queues suspended for an operation are resumed before the
//! # operation returns.
//! forward_progress = true
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;

/// Global cached configuration.
static CONFIG: OnceLock<Config> = OnceLock::new();

/// wavedbg configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Whether the OS sets up ttmp registers at wave launch.
    pub ttmps_setup: Option<bool>,

    /// Whether suspended queues are resumed before an operation returns.
    pub forward_progress: Option<bool>,
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `wavedbg.toml`
    /// 3. User config `~/.config/wavedbg/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load user config first (lowest priority of file configs)
        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        // Load project-local config (higher priority)
        if let Some(local_config) = Self::load_local_config() {
            config.merge(local_config);
        }

        // Environment variables override everything
        config.apply_env_overrides();

        config
    }

    /// Get the cached global configuration.
    ///
    /// Loads configuration on first call and caches it.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("Loaded configuration: {:?}", config);
            config
        })
    }

    /// Whether ttmp registers are set up by the OS, with fallback to true.
    pub fn ttmps_setup(&self) -> bool {
        self.ttmps_setup.unwrap_or(true)
    }

    /// Whether forward progress is required, with fallback to true.
    pub fn forward_progress(&self) -> bool {
        self.forward_progress.unwrap_or(true)
    }

    /// Load user configuration from ~/.config/wavedbg/config.toml
    fn load_user_config() -> Option<Self> {
        let config_dir = dirs::config_dir()?;
        let config_path = config_dir.join("wavedbg").join("config.toml");
        Self::load_from_file(&config_path)
    }

    /// Load project-local configuration from ./wavedbg.toml
    fn load_local_config() -> Option<Self> {
        Self::load_from_file(Path::new("wavedbg.toml"))
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        let contents = std::fs::read_to_string(path).ok()?;
        match toml::from_str(&contents) {
            Ok(config) => Some(config),
            Err(err) => {
                log::warn!("Ignoring malformed config {}: {}", path.display(), err);
                None
            }
        }
    }

    /// Merge another config into this one; its set fields win.
    fn merge(&mut self, other: Config) {
        if other.ttmps_setup.is_some() {
            self.ttmps_setup = other.ttmps_setup;
        }
        if other.forward_progress.is_some() {
            self.forward_progress = other.forward_progress;
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Some(value) = env_bool("WAVEDBG_TTMPS_SETUP") {
            self.ttmps_setup = Some(value);
        }
        if let Some(value) = env_bool("WAVEDBG_FORWARD_PROGRESS") {
            self.forward_progress = Some(value);
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    match std::env::var(name).ok()?.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            log::warn!("Ignoring unrecognized {}={}", name, other);
            None
        }
    }
}
