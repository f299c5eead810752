//! Error types for the real-time driver

use thiserror::Error;

pub type Result<T> = std::result::Result<T, URError>;

#[derive(Error, Debug)]
pub enum URError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Socket error: {0}")]
    Socket(#[source] std::io::Error),

    #[error("No data received within {0:?}")]
    ReceiveTimeout(std::time::Duration),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Driver is no longer running")]
    DriverStopped,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl URError {
    /// True for failures that mean the socket is gone and must be reopened
    pub fn is_link_failure(&self) -> bool {
        matches!(self, URError::Socket(_) | URError::Connection(_))
    }
}
