//! Core errors

use thiserror::Error;

/// Core overlay errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bridge is already running
    #[error("Already running")]
    AlreadyRunning,

    /// Bridge is not running
    #[error("Not running")]
    NotRunning,

    /// Network layer error
    #[error("Network error: {0}")]
    Network(#[from] lanmesh_network::NetworkError),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
