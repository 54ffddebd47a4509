//! Error types for lunstore configuration

use thiserror::Error;

/// Common result type for configuration handling
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for configuration handling
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid value for option {name}: {value:?}")]
    InvalidOption { name: String, value: String },

    #[error("unknown serialization policy: {0:?}")]
    UnknownPolicy(String),

    #[error("unknown role: {0:?}")]
    UnknownRole(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    pub fn invalid_option(name: &str, value: &str) -> Self {
        Self::InvalidOption {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}
