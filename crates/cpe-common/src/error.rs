//! Error types shared across the workspace

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Failures decoding shared configuration files
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
