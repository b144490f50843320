//! Error handling - one hierarchy for the whole engine

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Exchange hub error hierarchy
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// No constructor registered for this venue type
    #[error("Unsupported venue type: {0}")]
    UnsupportedVenueType(String),

    /// Venue name does not appear in the configuration
    #[error("Unknown venue: {0}")]
    UnknownVenue(String),

    /// Venue is configured but has no live adapter
    #[error("Adapter not found: {0}")]
    AdapterNotFound(String),

    /// Per-call timeout fired
    #[error("request timed out")]
    Timeout(Duration),

    /// Remote call failed inside an adapter
    #[error("Exchange error: {0}")]
    Adapter(String),

    /// No candidate venue produced a usable price
    #[error("No available venue: {0}")]
    NoAvailableVenue(String),

    /// Malformed caller input
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Network/IO errors
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("Failed to write config: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

impl Error {
    /// True for errors raised before any remote call was made.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::UnsupportedVenueType(_) | Error::UnknownVenue(_)
        )
    }
}
