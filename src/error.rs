//! Error types for storyloom.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoryloomError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Connection errors
    #[error("Not connected to the generation service")]
    NotConnected,

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Gave up reconnecting after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    // Protocol errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // Media errors
    #[error("Failed to decode media for paragraph {paragraph}: {message}")]
    Decode { paragraph: u32, message: String },

    #[error("Playback failed: {message}")]
    Playback { message: String },

    // Remote-side generation errors
    #[error("Generation failed{}: {message}", .paragraph.map(|p| format!(" for paragraph {p}")).unwrap_or_default())]
    Generation {
        paragraph: Option<u32>,
        message: String,
    },

    #[error("Request aborted by task reset")]
    TaskReset,

    // Fallback HTTP errors
    #[error("HTTP request failed: {message}")]
    Http { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for StoryloomError {
    fn from(err: reqwest::Error) -> Self {
        StoryloomError::Http {
            message: err.to_string(),
        }
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, StoryloomError>;
