//! Configuration management for the live coach
//!
//! Every setting resolves as env > TOML file > default.

pub mod file;

use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::live::{DEFAULT_OUTBOUND_CAPACITY, LiveConfig};
use crate::{Error, Result};

use self::file::CoachConfigFile;

/// Default live voice endpoint
pub const DEFAULT_LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Default native-audio model
pub const DEFAULT_LIVE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

/// Default prebuilt voice
pub const DEFAULT_VOICE: &str = "Kore";

/// Default system instruction for the voice assistant
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a warm, encouraging, and helpful assistant for SHG (Self Help Group) women entrepreneurs. Speak simply, clearly, and supportively. Keep answers concise.";

/// Default REST base URL for one-shot generation
pub const DEFAULT_CONTENT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Default model for marketing copy
pub const DEFAULT_TEXT_MODEL: &str = "gemini-2.5-flash";

/// Default model for image enhancement
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image";

/// Live coach configuration
#[derive(Debug)]
pub struct Config {
    /// API key for the generative service
    pub api_key: Option<SecretString>,

    /// Live voice session settings
    pub live: LiveSettings,

    /// One-shot content generation settings
    pub content: ContentSettings,
}

/// Live voice session settings
#[derive(Debug, Clone)]
pub struct LiveSettings {
    pub endpoint: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub outbound_capacity: usize,
    pub start_muted: bool,
}

/// One-shot content generation settings
#[derive(Debug, Clone)]
pub struct ContentSettings {
    pub endpoint: String,
    pub text_model: String,
    pub image_model: String,
}

impl Config {
    /// Load configuration from the process environment and config file
    #[must_use]
    pub fn load() -> Self {
        let fc = file::load_config_file();
        Self::resolve(fc, |key| std::env::var(key).ok())
    }

    /// Resolve settings from a parsed file and an environment lookup
    pub fn resolve(fc: CoachConfigFile, env: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        // API key (env > toml > None)
        let api_key = non_empty("GEMINI_API_KEY")
            .or_else(|| non_empty("API_KEY"))
            .or(fc.api_key)
            .filter(|k| !k.trim().is_empty())
            .map(SecretString::from);

        // Live settings (env > toml > default)
        let live = LiveSettings {
            endpoint: non_empty("COACH_LIVE_ENDPOINT")
                .or(fc.live.endpoint)
                .unwrap_or_else(|| DEFAULT_LIVE_ENDPOINT.to_string()),
            model: non_empty("COACH_LIVE_MODEL")
                .or(fc.live.model)
                .unwrap_or_else(|| DEFAULT_LIVE_MODEL.to_string()),
            voice: non_empty("COACH_VOICE")
                .or(fc.live.voice)
                .unwrap_or_else(|| DEFAULT_VOICE.to_string()),
            system_instruction: env("COACH_SYSTEM_INSTRUCTION")
                .or(fc.live.system_instruction)
                .unwrap_or_else(|| DEFAULT_SYSTEM_INSTRUCTION.to_string()),
            outbound_capacity: fc
                .live
                .outbound_capacity
                .filter(|&n| n > 0)
                .unwrap_or(DEFAULT_OUTBOUND_CAPACITY),
            start_muted: fc.live.start_muted.unwrap_or(false),
        };

        // Content settings (env > toml > default)
        let content = ContentSettings {
            endpoint: non_empty("COACH_CONTENT_ENDPOINT")
                .or(fc.content.endpoint)
                .unwrap_or_else(|| DEFAULT_CONTENT_ENDPOINT.to_string()),
            text_model: non_empty("COACH_TEXT_MODEL")
                .or(fc.content.text_model)
                .unwrap_or_else(|| DEFAULT_TEXT_MODEL.to_string()),
            image_model: non_empty("COACH_IMAGE_MODEL")
                .or(fc.content.image_model)
                .unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string()),
        };

        Self {
            api_key,
            live,
            content,
        }
    }

    /// Copy of the API key
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if no key is configured
    pub fn require_api_key(&self) -> Result<SecretString> {
        self.api_key
            .as_ref()
            .map(|key| SecretString::from(key.expose_secret().to_owned()))
            .ok_or_else(|| {
                Error::Config(
                    "no API key configured; set GEMINI_API_KEY or api_key in config.toml"
                        .to_string(),
                )
            })
    }

    /// Connection parameters for the live voice endpoint
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the key is missing or the endpoint is not a URL
    pub fn live_config(&self) -> Result<LiveConfig> {
        let endpoint = Url::parse(&self.live.endpoint).map_err(|e| {
            Error::Config(format!("invalid live endpoint '{}': {e}", self.live.endpoint))
        })?;

        Ok(LiveConfig {
            endpoint,
            api_key: self.require_api_key()?,
            model: self.live.model.clone(),
            voice_name: self.live.voice.clone(),
            system_instruction: self.live.system_instruction.clone(),
            outbound_capacity: self.live.outbound_capacity,
        })
    }
}
