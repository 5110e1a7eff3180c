//! Error types for the migration engine.

use thiserror::Error;

/// Exit code for configuration errors.
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for rejected submissions (bad endpoints, bad options).
pub const EXIT_INVALID_REQUEST: u8 = 2;
/// Exit code when a non-terminal migration already exists for a pair.
pub const EXIT_DUPLICATE: u8 = 3;
/// Exit code for unknown migration ids.
pub const EXIT_NOT_FOUND: u8 = 4;
/// Exit code for repository failures.
pub const EXIT_REPOSITORY_ERROR: u8 = 5;
/// Exit code for external process failures.
pub const EXIT_PROCESS_ERROR: u8 = 6;
/// Exit code for IO errors.
pub const EXIT_IO_ERROR: u8 = 7;
/// Exit code after an interrupt.
pub const EXIT_CANCELLED: u8 = 130;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML values, out-of-range settings).
    #[error("Configuration error: {0}")]
    Config(String),

    /// A submission was rejected before any state was created.
    #[error("Invalid migration request: {0}")]
    InvalidConfig(String),

    /// A non-terminal migration already exists for the endpoint pair.
    #[error("An active migration already exists from {from} to {to}")]
    DuplicateActive { from: String, to: String },

    /// No migration with the given id.
    #[error("Migration not found: {0}")]
    NotFound(String),

    /// The requested transition is not allowed from the current status.
    #[error("Migration {id} cannot {action} while {status}")]
    InvalidTransition {
        id: String,
        action: String,
        status: String,
    },

    /// Repository error.
    #[error("Repository error: {0}")]
    Repository(#[from] sqlx::Error),

    /// Stored data could not be decoded.
    #[error("Corrupt repository data: {0}")]
    Corrupt(String),

    /// External process could not be spawned or misbehaved.
    #[error("Process error: {0}")]
    Process(String),

    /// Endpoint listing failed during reconciliation.
    #[error("Listing failed for {endpoint}: {message}")]
    Listing { endpoint: String, message: String },

    /// IO error (file operations, pipes).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Work was abandoned (shutdown or cancellation).
    #[error("Operation cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Listing error for an endpoint.
    pub fn listing(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Listing {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create an InvalidTransition error.
    pub fn transition(
        id: impl Into<String>,
        action: impl Into<String>,
        status: impl std::fmt::Display,
    ) -> Self {
        MigrateError::InvalidTransition {
            id: id.into(),
            action: action.into(),
            status: status.to_string(),
        }
    }

    /// Whether the repository rejected a write because of a unique constraint.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            MigrateError::Repository(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => EXIT_CONFIG_ERROR,
            MigrateError::InvalidConfig(_) | MigrateError::InvalidTransition { .. } => {
                EXIT_INVALID_REQUEST
            }
            MigrateError::DuplicateActive { .. } => EXIT_DUPLICATE,
            MigrateError::NotFound(_) => EXIT_NOT_FOUND,
            MigrateError::Repository(_) | MigrateError::Corrupt(_) | MigrateError::Json(_) => {
                EXIT_REPOSITORY_ERROR
            }
            MigrateError::Process(_) | MigrateError::Listing { .. } => EXIT_PROCESS_ERROR,
            MigrateError::Io(_) => EXIT_IO_ERROR,
            MigrateError::Cancelled => EXIT_CANCELLED,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
