//! Error types for the extension system.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in the extension system.
#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("Manifest not found in extension: {0}")]
    ManifestNotFound(PathBuf),

    #[error("Invalid manifest in {path}: {message}")]
    ManifestInvalid { path: PathBuf, message: String },

    #[error("Extension '{extension}' requires API {required}, host provides {provided}")]
    Incompatible {
        extension: String,
        required: String,
        provided: String,
    },

    #[error("Extension '{0}' not found")]
    ExtensionNotFound(String),

    #[error("Failed to start extension '{extension}': {message}")]
    Spawn { extension: String, message: String },

    #[error("Session for extension '{extension}' refused: {message}")]
    SessionRefused { extension: String, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid socket descriptor in {var}: {value}")]
    InvalidDescriptor { var: &'static str, value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for extension operations.
pub type ExtensionResult<T> = Result<T, ExtensionError>;
