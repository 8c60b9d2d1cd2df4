//! # vistera
//!
//! A schema-driven dynamic entity and view access engine for PostgreSQL.
//!
//! Entities and views are declared in a JSON metadata file rather than in
//! code: the engine loads the declarations at startup, compiles per-entity
//! SQL accessors on first use, and executes CRUD operations and
//! parameterized read-views against tenant schemas resolved at request
//! time.
//!
//! ## Features
//!
//! - **Declared Entities**: CRUD against tables known only from metadata,
//!   with per-entity SQL compiled once and cached
//! - **Declared Views**: named, parameterized SQL templates with typed
//!   result columns, validated and coerced before execution
//! - **Multi-Tenancy**: per-request tenant schemas applied via
//!   `search_path` on pooled connections
//! - **Application Scoping**: entities and views are only reachable from
//!   applications that declare them
//! - **SQL Injection Prevention**: every identifier is validated and
//!   quoted before it reaches a statement
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vistera::{Engine, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::builder(
//!         "postgres://localhost/mydb",
//!         "meta/declarations.json",
//!     )
//!     .default_schema("tenant_acme")
//!     .build();
//!     let engine = Engine::new(config).await?;
//!
//!     // Entity CRUD by name, scoped to an application.
//!     let created = engine
//!         .crud()
//!         .create_for(
//!             "backoffice",
//!             "tenant_acme",
//!             "Widget",
//!             &serde_json::json!({ "label": "Blue Widget", "quantity": 3 }),
//!         )
//!         .await?;
//!
//!     // Typed view execution.
//!     #[derive(serde::Deserialize)]
//!     struct WidgetRow {
//!         label: String,
//!         quantity: i64,
//!     }
//!     let rows: Vec<WidgetRow> = engine
//!         .views()
//!         .execute_view("TopWidgets", Some(&serde_json::json!({ "TopN": 10 })))
//!         .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Multi-Tenancy
//!
//! Tenants share one database and one pool; isolation comes from
//! PostgreSQL schemas. Each operation pins its pooled connection to the
//! caller's schema before running anything, so two tenants never observe
//! each other's rows. Where the tenant schema comes from is pluggable via
//! [`SchemaAccessor`].

pub mod config;
pub mod crud;
pub mod error;
pub mod metadata;
pub mod query;
pub mod registry;
pub mod resolver;
pub mod sql;
pub mod tenant;
pub mod views;

use std::sync::Arc;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

// Re-export main types for convenience
pub use config::{EngineConfig, EngineConfigBuilder};
pub use crud::{CrudExecutor, Record};
pub use error::{EngineError, Result};
pub use metadata::{
    ApplicationInfo, ColumnSpec, Declarations, EntityDefinition, ParameterType,
    ParameterValidation, PropertyDefinition, ResultProperty, ValueRange, ViewDefinition,
    ViewParameter,
};
pub use query::{ParamValue, RawQueryExecutor};
pub use registry::MetadataRegistry;
pub use resolver::{EntityMetadata, EntityResolver};
pub use tenant::{FixedSchema, SchemaAccessor};
pub use views::{ViewService, bind_view_parameters};

// Re-export SQL utilities for advanced users
pub use sql::sanitize::{quote_identifier, validate_identifier};

/// The assembled engine: registry, resolver, and executors sharing one
/// pool.
pub struct Engine {
    pool: PgPool,
    registry: Arc<MetadataRegistry>,
    resolver: Arc<EntityResolver>,
    crud: CrudExecutor,
    views: ViewService,
}

impl Engine {
    /// Connect to the database and load declarations.
    pub async fn new(config: EngineConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .connect(&config.database_url)
            .await
            .map_err(|e| EngineError::connection(e.to_string()))?;
        Self::from_pool(pool, config)
    }

    /// Assemble the engine over an existing pool.
    ///
    /// Declaration loading is fail-fast: any structural problem in the
    /// metadata file surfaces here, before the engine serves anything.
    pub fn from_pool(pool: PgPool, config: EngineConfig) -> Result<Self> {
        let registry = Arc::new(MetadataRegistry::load(
            &config.declaration_path,
            &config.sql_dir,
        )?);
        let resolver = Arc::new(EntityResolver::new(
            registry.entities().iter().cloned(),
            registry.applications().iter().cloned(),
        ));

        info!(default_schema = %config.default_schema, "engine assembled");

        let crud = CrudExecutor::new(pool.clone(), resolver.clone(), config.statement_timeout);
        let executor = RawQueryExecutor::new(pool.clone(), config.statement_timeout);
        let views = ViewService::new(
            registry.clone(),
            resolver.clone(),
            executor,
            Arc::new(FixedSchema::new(config.default_schema)),
        );

        Ok(Self {
            pool,
            registry,
            resolver,
            crud,
            views,
        })
    }

    /// The loaded declaration registry.
    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    /// The entity and application resolver.
    pub fn resolver(&self) -> &Arc<EntityResolver> {
        &self.resolver
    }

    /// The CRUD executor.
    pub fn crud(&self) -> &CrudExecutor {
        &self.crud
    }

    /// The view service bound to the configured default schema.
    pub fn views(&self) -> &ViewService {
        &self.views
    }

    /// A view service bound to a request-scoped tenant schema source.
    pub fn views_for(&self, schema: Arc<dyn SchemaAccessor>) -> ViewService {
        self.views.with_schema(schema)
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
