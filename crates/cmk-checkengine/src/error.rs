//! Error types for plugin registration and migration.

use thiserror::Error;

/// Errors raised while registering, wrapping or migrating check plugins.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PluginError {
    /// A function or value violates the plugin API contract.
    #[error("type contract violated: {0}")]
    TypeContract(String),

    /// A value is of the right kind but not acceptable.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// The requested behaviour is reserved but not implemented.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// A legacy scan function cannot be translated mechanically.
    #[error("migration not supported: {0}")]
    MigrationNotSupported(String),
}

/// Result type for check engine operations.
pub type Result<T> = std::result::Result<T, PluginError>;
