//! Error types for the migration library.

use thiserror::Error;

/// Process exit code for configuration errors.
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Process exit code for a run that left tables behind.
pub const EXIT_PARTIAL: u8 = 2;
/// Process exit code for source database errors.
pub const EXIT_SOURCE_ERROR: u8 = 3;
/// Process exit code for destination errors.
pub const EXIT_TARGET_ERROR: u8 = 4;
/// Process exit code for staging or progress-record errors.
pub const EXIT_STAGING_ERROR: u8 = 5;
/// Process exit code for IO errors.
pub const EXIT_IO_ERROR: u8 = 7;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source database connection or query error
    #[error("Source database error: {0}")]
    Source(#[from] tiberius::error::Error),

    /// Destination (Snowflake) request or statement error
    #[error("Target error: {0}")]
    Target(String),

    /// HTTP transport error talking to the destination
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Schema extraction failed
    #[error("Schema extraction failed: {0}")]
    SchemaExtraction(String),

    /// Staging artifact could not be read or written
    #[error("Staging error: {0}")]
    Staging(String),

    /// CSV encoding/decoding error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Progress record error
    #[error("Progress record error: {0}")]
    Progress(String),

    /// Run finished with tables still outstanding
    #[error("Migration incomplete: {0}")]
    Incomplete(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => EXIT_CONFIG_ERROR,
            MigrateError::Incomplete(_) => EXIT_PARTIAL,
            MigrateError::Source(_)
            | MigrateError::Pool { .. }
            | MigrateError::SchemaExtraction(_) => EXIT_SOURCE_ERROR,
            MigrateError::Target(_) | MigrateError::Http(_) => EXIT_TARGET_ERROR,
            MigrateError::Staging(_) | MigrateError::Csv(_) | MigrateError::Progress(_) => {
                EXIT_STAGING_ERROR
            }
            MigrateError::Io(_) => EXIT_IO_ERROR,
            MigrateError::Json(_) => EXIT_CONFIG_ERROR,
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
