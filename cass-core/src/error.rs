//! Model error abstractions.

use thiserror::Error;

/// Errors raised while interpreting a `CassandraDatacenter` spec.
#[derive(Debug, Error)]
pub enum AppError {
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// No known image exists for the requested server type and version.
    #[error("server '{server_type}' and version '{version}' do not work together")]
    UnsupportedServerVersion { server_type: String, version: String },
    /// The user supplied server config could not be merged with the generated model.
    #[error("invalid server config: {0}")]
    InvalidConfig(String),
}
