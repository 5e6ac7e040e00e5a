//! CLI argument definitions for the Navi console bot.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::Parser;
use navi_core::NaviConfig;
use std::path::PathBuf;

/// Navi: a conversational bot you can talk to from the terminal.
#[derive(Parser, Debug)]
#[command(name = "navi", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,

    /// Shorthand for `--log-level debug`.
    #[arg(long = "debug")]
    pub debug: bool,

    /// User id for console messages.
    #[arg(short = 'u', long = "user", default_value = "console")]
    pub user: String,

    /// NLU confidence threshold (0.0 to 1.0).
    #[arg(short = 't', long = "threshold")]
    pub threshold: Option<f64>,

    /// Extra TOML response module; may be repeated.
    #[arg(short = 'r', long = "responses")]
    pub responses: Vec<PathBuf>,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > NAVI_CONFIG env var > ~/.navi/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("NAVI_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the log level.
    ///
    /// Priority: --debug > --log-level > config file value.
    pub fn resolve_log_level(&self, config_level: &str) -> String {
        if self.debug {
            return "debug".to_string();
        }
        self.log_level
            .clone()
            .unwrap_or_else(|| config_level.to_string())
    }

    /// Fold command-line overrides into the loaded configuration.
    pub fn apply(&self, config: &mut NaviConfig) {
        config.general.log_level = self.resolve_log_level(&config.general.log_level);
        if let Some(threshold) = self.threshold {
            config.dialog.confidence_threshold = threshold.clamp(0.0, 1.0);
        }
        config.responses.paths.extend(
            self.responses
                .iter()
                .map(|p| p.to_string_lossy().to_string()),
        );
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".navi").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".navi").join("config.toml");
    }
    PathBuf::from("config.toml")
}
