//! Error types for the dynamic entity/view engine.
//!
//! The variants mirror the failure taxonomy the engine exposes to callers:
//! lookup failures carry the list of known names so a misspelled name is
//! correctable, and database errors are classified by SQLSTATE into a
//! stable kind plus a short engine-agnostic message. The raw engine text
//! stays in the `detail` field for server-side logs only.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("View not found: '{name}'. Known views: [{}]", .known.join(", "))]
    ViewNotFound { name: String, known: Vec<String> },

    #[error("Entity not found: '{name}'. Known entities: [{}]", .known.join(", "))]
    EntityNotFound { name: String, known: Vec<String> },

    #[error("Entity name '{name}' is ambiguous across schemas: [{}]. Use a schema-qualified name.", .candidates.join(", "))]
    AmbiguousEntityName {
        name: String,
        candidates: Vec<String>,
    },

    #[error("'{name}' is not visible to application '{application}'")]
    NotVisible { name: String, application: String },

    #[error("Declaration file not found: {0}")]
    DeclarationMissing(PathBuf),

    #[error("Declaration file {0} declares no views")]
    DeclarationEmpty(PathBuf),

    #[error("Declaration file {path} is malformed: {detail}")]
    DeclarationParse { path: PathBuf, detail: String },

    #[error("Invalid view name: {0}")]
    ViewNameInvalid(String),

    #[error("View '{0}' declares an empty SQL file path")]
    ViewSqlFileInvalid(String),

    #[error("SQL file for view '{view}' not found: {path}")]
    SqlFileNotFound { view: String, path: PathBuf },

    #[error("Permission denied reading SQL file for view '{view}': {path}")]
    SqlFilePermissionDenied { view: String, path: PathBuf },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Not found: {0}")]
    RowNotFound(String),

    #[error("Query returned more than one row: {0}")]
    MoreThanOneRow(String),

    #[error("Query timed out or was cancelled: {0}")]
    QueryTimeout(String),

    /// A database-engine failure classified by SQLSTATE. `friendly` is a
    /// short user-facing message; `detail` carries the raw engine text.
    #[error("{friendly} (SQLSTATE {code})")]
    QueryFailed {
        code: String,
        friendly: String,
        detail: String,
    },

    /// The database reported resource exhaustion. Not recoverable.
    #[error("Database out of memory: {0}")]
    OutOfMemory(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    pub fn row_not_found(msg: impl Into<String>) -> Self {
        Self::RowNotFound(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Friendly message for a PostgreSQL SQLSTATE code, if the engine
/// recognizes it as an operational condition worth translating.
pub fn friendly_message(code: &str) -> Option<&'static str> {
    match code {
        "42501" => Some("Permission denied for the requested database object"),
        "42703" => Some("The query references a column that does not exist"),
        "42P01" => Some("The query references a table or view that does not exist"),
        "42601" => Some("The query contains a syntax error"),
        "40P01" => Some("Database deadlock detected - please retry"),
        "23505" => Some("A record with the same unique value already exists"),
        "23503" => Some("The operation violates a foreign key constraint"),
        "28000" | "28P01" => Some("Database login failed"),
        "3F000" => Some("The requested tenant schema does not exist"),
        _ => None,
    }
}

/// Classify a database-layer error into the engine's taxonomy.
///
/// - statement cancellation/timeout (SQLSTATE 57014, pool timeouts) maps
///   to [`EngineError::QueryTimeout`];
/// - resource exhaustion (class 53) is logged at the highest severity and
///   surfaced as [`EngineError::OutOfMemory`];
/// - recognized engine codes become [`EngineError::QueryFailed`] with a
///   friendly message, keeping the raw text in `detail`;
/// - encode/decode failures and anything else pass through unchanged,
///   since they indicate a caller bug rather than an operational fault.
pub fn classify_db_error(err: sqlx::Error) -> EngineError {
    match err {
        sqlx::Error::PoolTimedOut => {
            EngineError::QueryTimeout("timed out waiting for a pooled connection".to_string())
        }
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            let detail = db.message().to_string();

            match code.as_str() {
                "57014" => EngineError::QueryTimeout(
                    "the statement was cancelled or exceeded its timeout".to_string(),
                ),
                "53000" | "53100" | "53200" | "53300" => {
                    tracing::error!(code = %code, detail = %detail, "database resource exhaustion");
                    EngineError::OutOfMemory(detail)
                }
                _ => {
                    let friendly = friendly_message(&code)
                        .unwrap_or("Database query failed")
                        .to_string();
                    tracing::warn!(code = %code, detail = %detail, "database error");
                    EngineError::QueryFailed {
                        code,
                        friendly,
                        detail,
                    }
                }
            }
        }
        other => EngineError::Sql(other),
    }
}
