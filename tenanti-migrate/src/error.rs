//! Error types for the tenant migration engine.

use thiserror::Error;

/// Result type alias for migration operations.
pub type MigrateResult<T> = Result<T, MigrationError>;

/// Errors that can occur while resolving tenants or running their migrations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Missing driver, default driver, connection template or model.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A run operation was invoked before a tenant entity was bound.
    #[error("No tenant entity is bound to the migrator")]
    NotBound,

    /// Raised from within a migration's up/down body.
    #[error("Migration failed: {0}")]
    Execution(String),

    /// Database operation error.
    #[error("Database error: {0}")]
    Database(String),

    /// Invalid migration file or format.
    #[error("Invalid migration: {0}")]
    InvalidMigration(String),

    /// Migration not found.
    #[error("Migration '{0}' not found")]
    NotFound(String),

    /// Queue transport error.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Job payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General migration error.
    #[error("Migration error: {0}")]
    Other(String),
}

impl MigrationError {
    /// Create a configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an execution error, for use inside migration bodies.
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    /// Create a database error.
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a migration file error.
    pub fn migration_file(msg: impl Into<String>) -> Self {
        Self::InvalidMigration(msg.into())
    }

    /// Create a queue error.
    pub fn queue(msg: impl Into<String>) -> Self {
        Self::Queue(msg.into())
    }

    /// Create an other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Unknown driver name.
    pub fn driver_not_supported(name: &str) -> Self {
        Self::Configuration(format!("Driver [{}] not supported", name))
    }

    /// No driver name given and no default configured.
    pub fn default_driver_missing() -> Self {
        Self::Configuration("Default driver not implemented".to_string())
    }

    /// Named connection absent from the global configuration.
    pub fn connection_unavailable(name: &str) -> Self {
        Self::Configuration(format!("Database connection [{}] is not available", name))
    }

    /// Check if this is a configuration error.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Check if a queue may usefully retry the operation that produced this error.
    ///
    /// Configuration and binding errors are programmer errors and never retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Execution(_) | Self::Io(_) | Self::Queue(_)
        )
    }
}

impl From<toml::de::Error> for MigrationError {
    fn from(err: toml::de::Error) -> Self {
        MigrationError::Configuration(format!("Failed to parse TOML: {}", err))
    }
}
