use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{NaviError, Result};

/// Top-level configuration for a Navi bot.
///
/// Loaded from `~/.navi/config.toml` by default. Every section is optional
/// and falls back to its defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NaviConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub dialog: DialogConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub responses: ResponsesConfig,
}

impl NaviConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NaviConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| NaviError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Turn-processing settings for the dialogue engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogConfig {
    /// NLU parses with a confidence strictly below this value are rejected.
    pub confidence_threshold: f64,
    /// Upper bound on NLU consultations within a single inbound message.
    pub max_iterations: u32,
    /// Timeout for one NLU call, in milliseconds.
    pub nlu_timeout_ms: u64,
    /// Timeout for one handler stage (resolve, confirm or handle), in milliseconds.
    pub handler_timeout_ms: u64,
    /// Reply used on the parsing-error path when no `parsing_error` subscriber answers.
    pub fallback_message: String,
}

impl Default for DialogConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.1,
            max_iterations: 8,
            nlu_timeout_ms: 5_000,
            handler_timeout_ms: 5_000,
            fallback_message: "Sorry, I didn't understand that.".to_string(),
        }
    }
}

/// Per-user context retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of user contexts kept in memory.
    pub max_users: usize,
    /// Contexts idle for longer than this are evicted, in seconds.
    pub idle_ttl_secs: u64,
    /// How often the background sweep runs, in seconds.
    pub eviction_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_users: 10_000,
            idle_ttl_secs: 3_600,
            eviction_interval_secs: 60,
        }
    }
}

/// Extra response catalogs merged in at start-up.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponsesConfig {
    /// Paths to TOML response catalog files.
    pub paths: Vec<String>,
}
