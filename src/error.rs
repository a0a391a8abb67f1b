//! Error types for Nova extensions
//!
//! Extension-level failures live in [`crate::extensions::ExtensionError`];
//! this covers the configuration layer around it.

use thiserror::Error;

/// Errors that can occur while loading or saving configuration
#[derive(Debug, Error)]
pub enum NovaError {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing errors
    #[error("Config parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("Config serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Result type alias for Nova operations
pub type NovaResult<T> = Result<T, NovaError>;
