//! Metadata registry.
//!
//! Loads the declaration file once at startup, validates it, and serves
//! view/entity/application lookups. View SQL templates are read from disk
//! on first request and cached for the life of the process; the set of
//! views is static per deployment, so the cache is never evicted.
//!
//! Load-time validation is deliberately fail-fast: a broken declaration
//! should prevent startup, not surface as a runtime lookup failure deep
//! in a request.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::metadata::{ApplicationInfo, Declarations, EntityDefinition, ViewDefinition};

/// Immutable registry of declared views, entities, and applications.
#[derive(Debug)]
pub struct MetadataRegistry {
    sql_dir: PathBuf,
    /// Lowered view name -> definition.
    views: HashMap<String, Arc<ViewDefinition>>,
    /// View names in declaration order, declared casing.
    view_order: Vec<String>,
    entities: Vec<Arc<EntityDefinition>>,
    applications: Vec<ApplicationInfo>,
    /// Lowered view name -> cached SQL text. Write-once per key.
    sql_cache: DashMap<String, Arc<str>>,
}

impl MetadataRegistry {
    /// Load and validate the declaration file.
    ///
    /// Fails fast with [`EngineError::DeclarationMissing`],
    /// [`EngineError::DeclarationEmpty`], [`EngineError::DeclarationParse`],
    /// [`EngineError::ViewNameInvalid`], or [`EngineError::ViewSqlFileInvalid`]
    /// before the registry becomes usable.
    pub fn load(declaration_path: &Path, sql_dir: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(declaration_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EngineError::DeclarationMissing(declaration_path.to_path_buf())
            } else {
                EngineError::Io(e)
            }
        })?;

        let declarations: Declarations =
            serde_json::from_str(&text).map_err(|e| EngineError::DeclarationParse {
                path: declaration_path.to_path_buf(),
                detail: e.to_string(),
            })?;

        if declarations.views.is_empty() {
            return Err(EngineError::DeclarationEmpty(declaration_path.to_path_buf()));
        }

        let mut views = HashMap::with_capacity(declarations.views.len());
        let mut view_order = Vec::with_capacity(declarations.views.len());

        for (idx, view) in declarations.views.into_iter().enumerate() {
            if view.name.trim().is_empty() {
                return Err(EngineError::ViewNameInvalid(format!(
                    "view entry #{} has an empty name",
                    idx + 1
                )));
            }
            if view.sql_file.trim().is_empty() {
                return Err(EngineError::ViewSqlFileInvalid(view.name.clone()));
            }

            let key = view.name.to_lowercase();
            if views.contains_key(&key) {
                return Err(EngineError::ViewNameInvalid(format!(
                    "view name '{}' is declared more than once",
                    view.name
                )));
            }

            view_order.push(view.name.clone());
            views.insert(key, Arc::new(view));
        }

        info!(
            path = %declaration_path.display(),
            views = view_order.len(),
            entities = declarations.entities.len(),
            applications = declarations.applications.len(),
            "loaded declarations"
        );

        Ok(Self {
            sql_dir: sql_dir.to_path_buf(),
            views,
            view_order,
            entities: declarations.entities.into_iter().map(Arc::new).collect(),
            applications: declarations.applications,
            sql_cache: DashMap::new(),
        })
    }

    /// Look up a view definition by name, case-insensitively.
    pub fn view_definition(&self, name: &str) -> Result<Arc<ViewDefinition>> {
        self.views
            .get(&name.trim().to_lowercase())
            .cloned()
            .ok_or_else(|| EngineError::ViewNotFound {
                name: name.to_string(),
                known: self.view_names(),
            })
    }

    /// Return the SQL text for a view, reading the template from disk on
    /// first use and serving the cached text thereafter.
    ///
    /// Repeat calls return the same `Arc`, so cached text is shared, not
    /// re-read or copied. Concurrent first-callers converge on whichever
    /// read wins the cache insert.
    pub fn view_sql(&self, name: &str) -> Result<Arc<str>> {
        let view = self.view_definition(name)?;
        let key = view.name.to_lowercase();

        if let Some(cached) = self.sql_cache.get(&key) {
            return Ok(cached.clone());
        }

        let path = self.sql_dir.join(&view.sql_file);
        let text = std::fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::SqlFileNotFound {
                view: view.name.clone(),
                path: path.clone(),
            },
            std::io::ErrorKind::PermissionDenied => EngineError::SqlFilePermissionDenied {
                view: view.name.clone(),
                path: path.clone(),
            },
            _ => EngineError::Io(e),
        })?;

        debug!(view = %view.name, path = %path.display(), "loaded view SQL");

        let sql: Arc<str> = text.into();
        let stored = self.sql_cache.entry(key).or_insert(sql);
        Ok(stored.value().clone())
    }

    /// All declared view names, in declaration order.
    pub fn view_names(&self) -> Vec<String> {
        self.view_order.clone()
    }

    /// All declared entities.
    pub fn entities(&self) -> &[Arc<EntityDefinition>] {
        &self.entities
    }

    /// All declared applications.
    pub fn applications(&self) -> &[ApplicationInfo] {
        &self.applications
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_declarations(dir: &Path, json: &str) -> PathBuf {
        let path = dir.join("declarations.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(json.as_bytes()).unwrap();
        path
    }

    fn write_sql(dir: &Path, name: &str, sql: &str) {
        std::fs::write(dir.join(name), sql).unwrap();
    }

    const TWO_VIEWS: &str = r#"{
        "views": [
            {"name": "TopCustomers", "sql_file": "top_customers.sql",
             "parameters": [{"name": "TopN", "type": "int", "nullable": false}],
             "properties": [{"name": "name", "type": "string"}]},
            {"name": "OpenOrders", "sql_file": "open_orders.sql",
             "properties": [{"name": "id", "type": "long"}]}
        ]
    }"#;

    fn loaded(dir: &Path) -> MetadataRegistry {
        let path = write_declarations(dir, TWO_VIEWS);
        write_sql(dir, "top_customers.sql", "SELECT name FROM customers LIMIT $1");
        write_sql(dir, "open_orders.sql", "SELECT id FROM orders WHERE open");
        MetadataRegistry::load(&path, dir).unwrap()
    }

    #[test]
    fn missing_declaration_file_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let err = MetadataRegistry::load(&dir.path().join("absent.json"), dir.path()).unwrap_err();
        assert!(matches!(err, EngineError::DeclarationMissing(_)));
    }

    #[test]
    fn empty_views_list_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_declarations(dir.path(), r#"{"views": []}"#);
        let err = MetadataRegistry::load(&path, dir.path()).unwrap_err();
        assert!(matches!(err, EngineError::DeclarationEmpty(_)));
    }

    #[test]
    fn malformed_json_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_declarations(dir.path(), "{not json");
        let err = MetadataRegistry::load(&path, dir.path()).unwrap_err();
        assert!(matches!(err, EngineError::DeclarationParse { .. }));
    }

    #[test]
    fn empty_view_name_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_declarations(
            dir.path(),
            r#"{"views": [{"name": "  ", "sql_file": "a.sql"}]}"#,
        );
        let err = MetadataRegistry::load(&path, dir.path()).unwrap_err();
        assert!(matches!(err, EngineError::ViewNameInvalid(_)));
    }

    #[test]
    fn empty_sql_file_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_declarations(
            dir.path(),
            r#"{"views": [{"name": "V", "sql_file": ""}]}"#,
        );
        let err = MetadataRegistry::load(&path, dir.path()).unwrap_err();
        assert!(matches!(err, EngineError::ViewSqlFileInvalid(_)));
    }

    #[test]
    fn duplicate_view_names_fail_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_declarations(
            dir.path(),
            r#"{"views": [
                {"name": "Dup", "sql_file": "a.sql"},
                {"name": "dup", "sql_file": "b.sql"}
            ]}"#,
        );
        let err = MetadataRegistry::load(&path, dir.path()).unwrap_err();
        assert!(matches!(err, EngineError::ViewNameInvalid(_)));
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let registry = loaded(dir.path());
        assert_eq!(
            registry.view_definition("TOPCUSTOMERS").unwrap().name,
            "TopCustomers"
        );
        assert_eq!(
            registry.view_definition("topcustomers").unwrap().name,
            "TopCustomers"
        );
    }

    #[test]
    fn unknown_view_lists_known_names() {
        let dir = tempfile::tempdir().unwrap();
        let registry = loaded(dir.path());
        let err = registry.view_definition("Nope").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Nope"));
        assert!(msg.contains("TopCustomers"));
        assert!(msg.contains("OpenOrders"));
    }

    #[test]
    fn sql_is_cached_and_pointer_equal() {
        let dir = tempfile::tempdir().unwrap();
        let registry = loaded(dir.path());

        let first = registry.view_sql("TopCustomers").unwrap();
        // Changing the file after the first read must not affect the cache.
        write_sql(dir.path(), "top_customers.sql", "SELECT 1");
        let second = registry.view_sql("topcustomers").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(&*first, "SELECT name FROM customers LIMIT $1");
    }

    #[test]
    fn cache_entries_are_independent_per_view() {
        let dir = tempfile::tempdir().unwrap();
        let registry = loaded(dir.path());

        let top = registry.view_sql("TopCustomers").unwrap();
        let open = registry.view_sql("OpenOrders").unwrap();
        assert_ne!(&*top, &*open);

        // Re-reading one view leaves the other's entry untouched.
        let top_again = registry.view_sql("TopCustomers").unwrap();
        assert!(Arc::ptr_eq(&top, &top_again));
        let open_again = registry.view_sql("OpenOrders").unwrap();
        assert!(Arc::ptr_eq(&open, &open_again));
    }

    #[test]
    fn missing_sql_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_declarations(
            dir.path(),
            r#"{"views": [{"name": "Ghost", "sql_file": "ghost.sql"}]}"#,
        );
        let registry = MetadataRegistry::load(&path, dir.path()).unwrap();
        let err = registry.view_sql("Ghost").unwrap_err();
        match &err {
            EngineError::SqlFileNotFound { view, path } => {
                assert_eq!(view, "Ghost");
                assert!(path.to_string_lossy().contains("ghost.sql"));
            }
            other => panic!("expected SqlFileNotFound, got {other:?}"),
        }
        assert!(err.to_string().contains("ghost.sql"));
    }

    #[test]
    fn concurrent_sql_loads_converge_on_one_arc() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(loaded(dir.path()));

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.view_sql("TopCustomers").unwrap())
            })
            .collect();

        let results: Vec<Arc<str>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let cached = registry.view_sql("TopCustomers").unwrap();
        for sql in &results {
            assert!(Arc::ptr_eq(sql, &cached));
        }
    }

    #[test]
    fn view_names_keep_declaration_order_and_casing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = loaded(dir.path());
        assert_eq!(registry.view_names(), vec!["TopCustomers", "OpenOrders"]);
    }
}
