use thiserror::Error;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum DroverError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Lookup and authorization errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    // Lifecycle errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidState { from: String, to: String },

    #[error("Approval expired: {0}")]
    Expired(String),

    #[error("Approval already resolved: {0}")]
    AlreadyResolved(String),

    // Optimistic concurrency conflict on a snapshot write
    #[error("Stale write: execution {id} moved past version {expected}")]
    StaleWrite { id: String, expected: i32 },

    // Collaborator errors
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias using DroverError
pub type Result<T> = std::result::Result<T, DroverError>;
