//! Error types for the live coach

use thiserror::Error;

/// Result type alias for live coach operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the live coach
#[derive(Debug, Error)]
pub enum Error {
    /// Microphone access refused or no input device present
    #[error("microphone unavailable: {0}")]
    PermissionDenied(String),

    /// Duplex link failed to open or died
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed inbound transport payload
    #[error("codec error: {0}")]
    Codec(String),

    /// Underlying audio output failure
    #[error("playback error: {0}")]
    Playback(String),

    /// Audio device or resampler setup error
    #[error("audio error: {0}")]
    Audio(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// One-shot content generation error
    #[error("content error: {0}")]
    Content(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Short human-readable message shown to the user
    #[must_use]
    pub const fn user_message(&self) -> &'static str {
        match self {
            Self::PermissionDenied(_) => "Could not access microphone.",
            Self::Connection(_) => "Connection error. Please try again.",
            Self::Codec(_) => "Received unreadable audio. Please try again.",
            Self::Playback(_) => "Audio playback failed. Please try again.",
            _ => "Something went wrong. Please try again.",
        }
    }

    /// Whether the user can retry the failed operation without changing anything
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Config(_) | Self::Toml(_))
    }
}
