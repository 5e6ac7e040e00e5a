use thiserror::Error;

/// Top-level error type for Navi.
///
/// Subsystem crates define their own error types and implement
/// `From<NaviError>` so that the `?` operator works across crate boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NaviError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for NaviError {
    fn from(err: toml::de::Error) -> Self {
        NaviError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for NaviError {
    fn from(err: toml::ser::Error) -> Self {
        NaviError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for NaviError {
    fn from(err: serde_json::Error) -> Self {
        NaviError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Navi operations.
pub type Result<T> = std::result::Result<T, NaviError>;
