//! Configuration for the engine.
//!
//! Provides a builder pattern for configuring connection, declaration
//! file location, and query behavior.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// PostgreSQL database URL.
    pub database_url: String,
    /// Path to the JSON declaration file.
    pub declaration_path: PathBuf,
    /// Directory containing view SQL templates (paths in the declaration
    /// file are resolved against this).
    pub sql_dir: PathBuf,
    /// Tenant schema used when no request-scoped schema is supplied.
    pub default_schema: String,
    /// Server-side statement timeout applied per session, if any.
    pub statement_timeout: Option<Duration>,
}

impl EngineConfig {
    /// Create a new configuration builder.
    pub fn builder(
        database_url: impl Into<String>,
        declaration_path: impl Into<PathBuf>,
    ) -> EngineConfigBuilder {
        EngineConfigBuilder::new(database_url, declaration_path)
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug)]
pub struct EngineConfigBuilder {
    database_url: String,
    declaration_path: PathBuf,
    sql_dir: Option<PathBuf>,
    default_schema: String,
    statement_timeout: Option<Duration>,
}

impl EngineConfigBuilder {
    pub fn new(database_url: impl Into<String>, declaration_path: impl Into<PathBuf>) -> Self {
        Self {
            database_url: database_url.into(),
            declaration_path: declaration_path.into(),
            sql_dir: None,
            default_schema: "public".to_string(),
            statement_timeout: None,
        }
    }

    /// Set the SQL template directory (default: the declaration file's directory).
    pub fn sql_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sql_dir = Some(dir.into());
        self
    }

    /// Set the fallback tenant schema (default: `public`).
    pub fn default_schema(mut self, schema: impl Into<String>) -> Self {
        self.default_schema = schema.into();
        self
    }

    /// Set a server-side statement timeout applied to every session.
    pub fn statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> EngineConfig {
        let sql_dir = self.sql_dir.unwrap_or_else(|| {
            self.declaration_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .to_path_buf()
        });
        EngineConfig {
            database_url: self.database_url,
            declaration_path: self.declaration_path,
            sql_dir,
            default_schema: self.default_schema,
            statement_timeout: self.statement_timeout,
        }
    }
}
