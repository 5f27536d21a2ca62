//! TOML configuration file loading
//!
//! Supports `~/.config/live-coach/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct CoachConfigFile {
    /// API key for the generative service
    #[serde(default)]
    pub api_key: Option<String>,

    /// Live voice session configuration
    #[serde(default)]
    pub live: LiveFileConfig,

    /// One-shot content generation configuration
    #[serde(default)]
    pub content: ContentFileConfig,
}

/// Live voice session configuration
#[derive(Debug, Default, Deserialize)]
pub struct LiveFileConfig {
    /// WebSocket endpoint
    pub endpoint: Option<String>,

    /// Native-audio model (e.g. "gemini-2.5-flash-native-audio-preview-09-2025")
    pub model: Option<String>,

    /// Prebuilt voice name (e.g. "Kore")
    pub voice: Option<String>,

    /// System instruction sent at setup
    pub system_instruction: Option<String>,

    /// Outbound frames buffered before dropping
    pub outbound_capacity: Option<usize>,

    /// Begin with model speech muted
    pub start_muted: Option<bool>,
}

/// One-shot content generation configuration
#[derive(Debug, Default, Deserialize)]
pub struct ContentFileConfig {
    /// REST base URL
    pub endpoint: Option<String>,

    /// Model for marketing copy
    pub text_model: Option<String>,

    /// Model for image enhancement
    pub image_model: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `CoachConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> CoachConfigFile {
    config_file_path().map_or_else(CoachConfigFile::default, |path| load_config_from(&path))
}

/// Load a TOML config file from `path`, falling back to defaults
pub fn load_config_from(path: &Path) -> CoachConfigFile {
    if !path.exists() {
        return CoachConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                CoachConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            CoachConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/live-coach/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("live-coach").join("config.toml"))
}
