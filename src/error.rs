//! Error types for Castro.

use thiserror::Error;

/// Common error type for Castro.
#[derive(Error, Debug)]
pub enum CastroError {
    /// A script source failed to compile.
    #[error("compile error in {path}: {message}")]
    Compile {
        /// Physical path of the offending file.
        path: String,
        /// Underlying Lua error.
        message: String,
    },

    /// Building a fresh interpreter for a path failed.
    #[error("cold start of {path} failed: {message}")]
    ColdStart {
        /// Virtual path that was requested.
        path: String,
        /// Underlying Lua error.
        message: String,
    },

    /// An extension could not be loaded.
    #[error("extension {extension_id}: {source}")]
    Extension {
        /// Id of the extension that failed.
        extension_id: String,
        /// What went wrong.
        #[source]
        source: Box<CastroError>,
    },

    /// Database error.
    ///
    /// Database errors from sqlx are automatically converted.
    #[error("database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Validation error for configuration or input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found.
    #[error("{0} not found")]
    NotFound(String),

    /// Script execution error.
    #[error("script error: {0}")]
    Script(String),

    /// A dispatch did not finish before its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl CastroError {
    /// Wrap this error with the id of the extension that produced it.
    pub fn in_extension(self, extension_id: impl Into<String>) -> Self {
        CastroError::Extension {
            extension_id: extension_id.into(),
            source: Box::new(self),
        }
    }
}

// Conversion from sqlx errors
impl From<sqlx::Error> for CastroError {
    fn from(e: sqlx::Error) -> Self {
        CastroError::Database(e.to_string())
    }
}

impl From<mlua::Error> for CastroError {
    fn from(e: mlua::Error) -> Self {
        CastroError::Script(e.to_string())
    }
}

/// Result type alias for Castro operations.
pub type Result<T> = std::result::Result<T, CastroError>;
