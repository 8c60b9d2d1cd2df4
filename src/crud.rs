//! Generic CRUD execution against runtime-resolved entities.
//!
//! No per-entity code exists anywhere: operations work off an
//! [`EntityMetadata`] resolved at request time. The SQL for a given
//! entity is compiled once into an [`EntityAccessor`] and cached in a
//! concurrent map under an atomic get-or-add, so the compilation cost is
//! paid at most once per entity per process and concurrent first-callers
//! never build duplicates. The cache never evicts; the set of entities is
//! fixed per deployment.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use tracing::debug;

use crate::error::{EngineError, Result, classify_db_error};
use crate::metadata::{ParameterType, PropertyDefinition};
use crate::query::{ParamValue, acquire_tenant_conn, bind_param, row_to_object};
use crate::resolver::{EntityMetadata, EntityResolver};
use crate::sql::sanitize::{quote_identifier, validate_identifier};

/// A persisted entity row: declared property names mapped to values.
#[derive(Debug, Clone, Serialize)]
pub struct Record {
    /// Display name of the entity this row belongs to.
    pub entity: String,
    /// Property name -> value, in declared property order.
    pub values: serde_json::Map<String, Value>,
}

impl Record {
    /// Property value by name, case-insensitively.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name).or_else(|| {
            self.values
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v)
        })
    }
}

/// Statements that require a primary key.
#[derive(Debug)]
struct KeyedStatements {
    pk_index: usize,
    select_by_id: String,
    /// None when the entity has no writable non-key properties.
    update: Option<String>,
    delete: String,
}

/// SQL compiled once from an entity definition.
///
/// This is the cached accessor that replaces per-call introspection: the
/// quoted identifiers, select list, and statement templates are derived
/// from the declared property list exactly once per entity.
#[derive(Debug)]
pub struct EntityAccessor {
    metadata: Arc<EntityMetadata>,
    quoted_table: String,
    quoted_columns: Vec<String>,
    select_list: String,
    select_all_sql: String,
    count_sql: String,
    keyed: Option<KeyedStatements>,
}

impl EntityAccessor {
    fn compile(metadata: Arc<EntityMetadata>) -> Result<Self> {
        let definition = &metadata.definition;
        let display = definition.display_name();

        let table = metadata.table.as_deref().ok_or_else(|| {
            EngineError::invalid_operation(format!(
                "entity '{}' has no backing table; no runtime type was generated for it",
                display
            ))
        })?;
        validate_identifier(table)
            .map_err(|e| EngineError::invalid_operation(format!("entity '{}': {}", display, e)))?;

        if definition.properties.is_empty() {
            return Err(EngineError::invalid_operation(format!(
                "entity '{}' declares no properties",
                display
            )));
        }

        let mut quoted_columns = Vec::with_capacity(definition.properties.len());
        for property in &definition.properties {
            validate_identifier(&property.name).map_err(|e| {
                EngineError::invalid_operation(format!("entity '{}': {}", display, e))
            })?;
            quoted_columns.push(quote_identifier(&property.name));
        }

        let quoted_table = quote_identifier(table);
        let select_list = quoted_columns.join(", ");
        let select_all_sql = format!("SELECT {} FROM {}", select_list, quoted_table);
        let count_sql = format!("SELECT COUNT(*) FROM {}", quoted_table);

        let pk_indices: Vec<usize> = definition
            .properties
            .iter()
            .enumerate()
            .filter(|(_, p)| p.primary_key)
            .map(|(i, _)| i)
            .collect();
        if pk_indices.len() > 1 {
            return Err(EngineError::invalid_operation(format!(
                "entity '{}' declares more than one primary key: [{}]",
                display,
                pk_indices
                    .iter()
                    .map(|&i| definition.properties[i].name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        let keyed = pk_indices.first().copied().map(|pk_index| {
            let pk_column = &quoted_columns[pk_index];

            // Same non-key filter update() binds from, so the template's
            // placeholder count always matches the bound values.
            let set_clauses: Vec<String> = definition
                .properties
                .iter()
                .enumerate()
                .filter(|(_, p)| !p.primary_key)
                .enumerate()
                .map(|(ord, (i, _))| format!("{} = ${}", quoted_columns[i], ord + 2))
                .collect();

            KeyedStatements {
                pk_index,
                select_by_id: format!(
                    "SELECT {} FROM {} WHERE {} = $1",
                    select_list, quoted_table, pk_column
                ),
                update: (!set_clauses.is_empty()).then(|| {
                    format!(
                        "UPDATE {} SET {} WHERE {} = $1 RETURNING {}",
                        quoted_table,
                        set_clauses.join(", "),
                        pk_column,
                        select_list
                    )
                }),
                delete: format!("DELETE FROM {} WHERE {} = $1", quoted_table, pk_column),
            }
        });

        Ok(Self {
            metadata,
            quoted_table,
            quoted_columns,
            select_list,
            select_all_sql,
            count_sql,
            keyed,
        })
    }

    fn display_name(&self) -> String {
        self.metadata.definition.display_name()
    }

    fn keyed(&self) -> Result<&KeyedStatements> {
        self.keyed.as_ref().ok_or_else(|| {
            EngineError::invalid_operation(format!(
                "entity '{}' has no primary key",
                self.display_name()
            ))
        })
    }

    fn primary_key(&self) -> Result<&PropertyDefinition> {
        let keyed = self.keyed()?;
        Ok(&self.metadata.definition.properties[keyed.pk_index])
    }
}

/// Performs entity operations against a type known only at request time.
pub struct CrudExecutor {
    pool: PgPool,
    resolver: Arc<EntityResolver>,
    statement_timeout: Option<Duration>,
    /// Qualified entity key -> compiled accessor. Write-once per key.
    accessors: DashMap<String, Arc<EntityAccessor>>,
}

impl CrudExecutor {
    pub fn new(
        pool: PgPool,
        resolver: Arc<EntityResolver>,
        statement_timeout: Option<Duration>,
    ) -> Self {
        Self {
            pool,
            resolver,
            statement_timeout,
            accessors: DashMap::new(),
        }
    }

    /// Compiled accessor for an entity, built at most once per process.
    fn accessor(&self, entity: &Arc<EntityMetadata>) -> Result<Arc<EntityAccessor>> {
        let key = entity.definition.qualified_key();
        if let Some(accessor) = self.accessors.get(&key) {
            return Ok(accessor.value().clone());
        }

        let built = Arc::new(EntityAccessor::compile(entity.clone())?);
        debug!(entity = %entity.definition.display_name(), "compiled entity accessor");

        // Concurrent first-callers converge on whichever insert wins.
        let stored = self.accessors.entry(key).or_insert(built);
        Ok(stored.value().clone())
    }

    /// All rows of the entity's backing table.
    pub async fn get_all(&self, schema: &str, entity: &Arc<EntityMetadata>) -> Result<Vec<Record>> {
        let accessor = self.accessor(entity)?;
        let mut conn = acquire_tenant_conn(&self.pool, schema, self.statement_timeout).await?;

        let rows = sqlx::query(&accessor.select_all_sql)
            .fetch_all(conn.as_mut())
            .await
            .map_err(classify_db_error)?;

        rows.iter()
            .map(|row| {
                Ok(Record {
                    entity: accessor.display_name(),
                    values: row_to_object(row, &accessor.metadata.definition.properties)?,
                })
            })
            .collect()
    }

    /// Row count of the entity's backing table.
    pub async fn get_count(&self, schema: &str, entity: &Arc<EntityMetadata>) -> Result<i64> {
        let accessor = self.accessor(entity)?;
        let mut conn = acquire_tenant_conn(&self.pool, schema, self.statement_timeout).await?;

        sqlx::query_scalar::<_, i64>(&accessor.count_sql)
            .fetch_one(conn.as_mut())
            .await
            .map_err(classify_db_error)
    }

    /// Look up a row by primary key. Absence is `Ok(None)`, not an error.
    pub async fn get_by_id(
        &self,
        schema: &str,
        entity: &Arc<EntityMetadata>,
        id: &Value,
    ) -> Result<Option<Record>> {
        let accessor = self.accessor(entity)?;
        let keyed = accessor.keyed()?;
        let id_param = self.key_param(&accessor, id)?;

        let mut conn = acquire_tenant_conn(&self.pool, schema, self.statement_timeout).await?;
        let row = bind_param(sqlx::query(&keyed.select_by_id), &id_param)
            .fetch_optional(conn.as_mut())
            .await
            .map_err(classify_db_error)?;

        row.map(|row| {
            Ok(Record {
                entity: accessor.display_name(),
                values: row_to_object(&row, &accessor.metadata.definition.properties)?,
            })
        })
        .transpose()
    }

    /// Insert a new row and return it as persisted.
    ///
    /// Properties are validated and coerced against their declared types.
    /// An absent guid primary key is generated; other absent keys are left
    /// to database defaults.
    pub async fn create(
        &self,
        schema: &str,
        entity: &Arc<EntityMetadata>,
        body: &Value,
    ) -> Result<Record> {
        let accessor = self.accessor(entity)?;
        let properties = body.as_object().ok_or_else(|| {
            EngineError::invalid_parameter("request body must be a JSON object")
        })?;
        self.reject_unknown_properties(&accessor, properties)?;

        let mut columns = Vec::new();
        let mut params = Vec::new();

        for (index, property) in accessor.metadata.definition.properties.iter().enumerate() {
            match lookup(properties, &property.name) {
                Some(value) if !value.is_null() => {
                    check_max_length(&accessor, property, value)?;
                    params.push(self.coerce_property(&accessor, property, value)?);
                    columns.push(accessor.quoted_columns[index].clone());
                }
                Some(_null) => {
                    if !property.nullable {
                        return Err(EngineError::invalid_parameter(format!(
                            "property '{}' of entity '{}' does not allow null",
                            property.name,
                            accessor.display_name()
                        )));
                    }
                    params.push(ParamValue::Null(property.param_type));
                    columns.push(accessor.quoted_columns[index].clone());
                }
                None if property.primary_key && property.param_type == ParameterType::Guid => {
                    params.push(ParamValue::Guid(uuid::Uuid::new_v4()));
                    columns.push(accessor.quoted_columns[index].clone());
                }
                None if property.primary_key => {
                    // Left to a database default, e.g. an identity column.
                }
                None if !property.nullable => {
                    return Err(EngineError::invalid_parameter(format!(
                        "required property '{}' of entity '{}' is missing",
                        property.name,
                        accessor.display_name()
                    )));
                }
                None => {}
            }
        }

        if columns.is_empty() {
            return Err(EngineError::invalid_parameter(format!(
                "no properties supplied for entity '{}'",
                accessor.display_name()
            )));
        }

        let placeholders: Vec<String> = (1..=params.len()).map(|i| format!("${}", i)).collect();
        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
            accessor.quoted_table,
            columns.join(", "),
            placeholders.join(", "),
            accessor.select_list
        );

        let mut conn = acquire_tenant_conn(&self.pool, schema, self.statement_timeout).await?;
        let mut query = sqlx::query(&insert_sql);
        for param in &params {
            query = bind_param(query, param);
        }

        let row = query
            .fetch_one(conn.as_mut())
            .await
            .map_err(classify_db_error)?;

        debug!(entity = %accessor.display_name(), schema = %schema, "created row");

        Ok(Record {
            entity: accessor.display_name(),
            values: row_to_object(&row, &accessor.metadata.definition.properties)?,
        })
    }

    /// Update an existing row identified by the primary key in `body`.
    ///
    /// The existing row is loaded first and every writable non-key
    /// property is written back, taking the caller's value when supplied
    /// and the stored value otherwise. The key itself never changes.
    pub async fn update(
        &self,
        schema: &str,
        entity: &Arc<EntityMetadata>,
        body: &Value,
    ) -> Result<Record> {
        let accessor = self.accessor(entity)?;
        let keyed = accessor.keyed()?;
        let pk = accessor.primary_key()?;
        let properties = body.as_object().ok_or_else(|| {
            EngineError::invalid_parameter("request body must be a JSON object")
        })?;
        self.reject_unknown_properties(&accessor, properties)?;

        let id = lookup(properties, &pk.name).ok_or_else(|| {
            EngineError::invalid_parameter(format!(
                "update of entity '{}' requires primary key '{}'",
                accessor.display_name(),
                pk.name
            ))
        })?;

        let existing = self
            .get_by_id(schema, entity, id)
            .await?
            .ok_or_else(|| not_found(&accessor, id))?;

        let update_sql = keyed.update.as_deref().ok_or_else(|| {
            EngineError::invalid_operation(format!(
                "entity '{}' has no updatable properties",
                accessor.display_name()
            ))
        })?;

        let mut params = vec![self.key_param(&accessor, id)?];
        for property in accessor.metadata.definition.updatable_properties() {
            let value = lookup(properties, &property.name)
                .or_else(|| existing.get(&property.name))
                .cloned()
                .unwrap_or(Value::Null);

            if value.is_null() {
                if !property.nullable {
                    return Err(EngineError::invalid_parameter(format!(
                        "property '{}' of entity '{}' does not allow null",
                        property.name,
                        accessor.display_name()
                    )));
                }
                params.push(ParamValue::Null(property.param_type));
            } else {
                check_max_length(&accessor, property, &value)?;
                params.push(self.coerce_property(&accessor, property, &value)?);
            }
        }

        let mut conn = acquire_tenant_conn(&self.pool, schema, self.statement_timeout).await?;
        let mut query = sqlx::query(update_sql);
        for param in &params {
            query = bind_param(query, param);
        }

        let row = query
            .fetch_optional(conn.as_mut())
            .await
            .map_err(classify_db_error)?
            .ok_or_else(|| not_found(&accessor, id))?;

        debug!(entity = %accessor.display_name(), schema = %schema, "updated row");

        Ok(Record {
            entity: accessor.display_name(),
            values: row_to_object(&row, &accessor.metadata.definition.properties)?,
        })
    }

    /// Delete a row by primary key. A missing row is an error, never a
    /// silent no-op.
    pub async fn delete(
        &self,
        schema: &str,
        entity: &Arc<EntityMetadata>,
        id: &Value,
    ) -> Result<()> {
        let accessor = self.accessor(entity)?;
        let keyed = accessor.keyed()?;
        let id_param = self.key_param(&accessor, id)?;

        let mut conn = acquire_tenant_conn(&self.pool, schema, self.statement_timeout).await?;
        let result = bind_param(sqlx::query(&keyed.delete), &id_param)
            .execute(conn.as_mut())
            .await
            .map_err(classify_db_error)?;

        if result.rows_affected() == 0 {
            return Err(not_found(&accessor, id));
        }

        debug!(entity = %accessor.display_name(), schema = %schema, "deleted row");
        Ok(())
    }

    // =========================================================================
    // Application-scoped surface
    // =========================================================================

    /// Resolve an entity name for an application, enforcing visibility and
    /// filling in the application's default schema when none is supplied.
    pub fn resolve_for(
        &self,
        app_name: &str,
        schema: &str,
        entity_name: &str,
    ) -> Result<(Arc<EntityMetadata>, String)> {
        let metadata = self
            .resolver
            .find(entity_name)?
            .ok_or_else(|| EngineError::EntityNotFound {
                name: entity_name.to_string(),
                known: self.resolver.entity_names(),
            })?;

        if !self.resolver.is_visible(&metadata, app_name) {
            return Err(EngineError::NotVisible {
                name: metadata.definition.display_name(),
                application: app_name.to_string(),
            });
        }

        let schema = if schema.trim().is_empty() {
            self.resolver
                .application(app_name)
                .and_then(|app| app.default_schema.clone())
                .ok_or_else(|| {
                    EngineError::invalid_parameter(format!(
                        "no tenant schema supplied and application '{}' declares no default",
                        app_name
                    ))
                })?
        } else {
            schema.to_string()
        };

        Ok((metadata, schema))
    }

    pub async fn get_all_for(
        &self,
        app_name: &str,
        schema: &str,
        entity_name: &str,
    ) -> Result<Vec<Record>> {
        let (metadata, schema) = self.resolve_for(app_name, schema, entity_name)?;
        self.get_all(&schema, &metadata).await
    }

    pub async fn get_count_for(
        &self,
        app_name: &str,
        schema: &str,
        entity_name: &str,
    ) -> Result<i64> {
        let (metadata, schema) = self.resolve_for(app_name, schema, entity_name)?;
        self.get_count(&schema, &metadata).await
    }

    pub async fn get_by_id_for(
        &self,
        app_name: &str,
        schema: &str,
        entity_name: &str,
        id: &Value,
    ) -> Result<Option<Record>> {
        let (metadata, schema) = self.resolve_for(app_name, schema, entity_name)?;
        self.get_by_id(&schema, &metadata, id).await
    }

    pub async fn create_for(
        &self,
        app_name: &str,
        schema: &str,
        entity_name: &str,
        body: &Value,
    ) -> Result<Record> {
        let (metadata, schema) = self.resolve_for(app_name, schema, entity_name)?;
        self.create(&schema, &metadata, body).await
    }

    pub async fn update_for(
        &self,
        app_name: &str,
        schema: &str,
        entity_name: &str,
        body: &Value,
    ) -> Result<Record> {
        let (metadata, schema) = self.resolve_for(app_name, schema, entity_name)?;
        self.update(&schema, &metadata, body).await
    }

    pub async fn delete_for(
        &self,
        app_name: &str,
        schema: &str,
        entity_name: &str,
        id: &Value,
    ) -> Result<()> {
        let (metadata, schema) = self.resolve_for(app_name, schema, entity_name)?;
        self.delete(&schema, &metadata, id).await
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    fn key_param(&self, accessor: &EntityAccessor, id: &Value) -> Result<ParamValue> {
        let pk = accessor.primary_key()?;
        ParamValue::from_json(pk.param_type, id).map_err(|e| {
            EngineError::invalid_parameter(format!(
                "primary key '{}' of entity '{}': {}",
                pk.name,
                accessor.display_name(),
                e
            ))
        })
    }

    fn coerce_property(
        &self,
        accessor: &EntityAccessor,
        property: &PropertyDefinition,
        value: &Value,
    ) -> Result<ParamValue> {
        ParamValue::from_json(property.param_type, value).map_err(|e| {
            EngineError::invalid_parameter(format!(
                "property '{}' of entity '{}': {}",
                property.name,
                accessor.display_name(),
                e
            ))
        })
    }

    fn reject_unknown_properties(
        &self,
        accessor: &EntityAccessor,
        properties: &serde_json::Map<String, Value>,
    ) -> Result<()> {
        for key in properties.keys() {
            let known = accessor
                .metadata
                .definition
                .properties
                .iter()
                .any(|p| p.name.eq_ignore_ascii_case(key));
            if !known {
                return Err(EngineError::invalid_parameter(format!(
                    "unknown property '{}' for entity '{}'",
                    key,
                    accessor.display_name()
                )));
            }
        }
        Ok(())
    }
}

fn not_found(accessor: &EntityAccessor, id: &Value) -> EngineError {
    EngineError::row_not_found(format!(
        "entity '{}' has no row with id {}",
        accessor.display_name(),
        id
    ))
}

fn lookup<'a>(object: &'a serde_json::Map<String, Value>, name: &str) -> Option<&'a Value> {
    object.get(name).or_else(|| {
        object
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    })
}

fn check_max_length(
    accessor: &EntityAccessor,
    property: &PropertyDefinition,
    value: &Value,
) -> Result<()> {
    if let (Some(max), Some(text)) = (property.max_length, value.as_str()) {
        if text.chars().count() > max as usize {
            return Err(EngineError::invalid_parameter(format!(
                "property '{}' of entity '{}' exceeds max length {}",
                property.name,
                accessor.display_name(),
                max
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::EntityDefinition;

    fn metadata(definition: EntityDefinition) -> Arc<EntityMetadata> {
        let resolver = EntityResolver::new([Arc::new(definition)], []);
        resolver.find("widget").unwrap().unwrap()
    }

    fn widget() -> Arc<EntityMetadata> {
        metadata(
            EntityDefinition::new(
                "Widget",
                vec![
                    PropertyDefinition::new("id", ParameterType::Guid).primary_key(),
                    PropertyDefinition::new("label", ParameterType::String).not_null(),
                    PropertyDefinition::new("quantity", ParameterType::Long),
                ],
            )
            .with_schema("acme")
            .with_table("widgets"),
        )
    }

    #[test]
    fn compile_builds_statement_templates() {
        let accessor = EntityAccessor::compile(widget()).unwrap();

        assert_eq!(
            accessor.select_all_sql,
            "SELECT \"id\", \"label\", \"quantity\" FROM \"widgets\""
        );
        assert_eq!(accessor.count_sql, "SELECT COUNT(*) FROM \"widgets\"");

        let keyed = accessor.keyed().unwrap();
        assert_eq!(keyed.pk_index, 0);
        assert_eq!(
            keyed.select_by_id,
            "SELECT \"id\", \"label\", \"quantity\" FROM \"widgets\" WHERE \"id\" = $1"
        );
        assert_eq!(
            keyed.update.as_deref().unwrap(),
            "UPDATE \"widgets\" SET \"label\" = $2, \"quantity\" = $3 WHERE \"id\" = $1 \
             RETURNING \"id\", \"label\", \"quantity\""
        );
        assert_eq!(keyed.delete, "DELETE FROM \"widgets\" WHERE \"id\" = $1");
    }

    #[test]
    fn compile_without_primary_key_defers_the_error() {
        let accessor = EntityAccessor::compile(metadata(
            EntityDefinition::new(
                "Widget",
                vec![PropertyDefinition::new("label", ParameterType::String)],
            )
            .with_table("widgets"),
        ))
        .unwrap();

        // get_all/count still work without a key...
        assert!(accessor.keyed.is_none());
        // ...but keyed operations fail with a named error.
        let err = accessor.keyed().unwrap_err();
        assert!(err.to_string().contains("no primary key"));
    }

    #[test]
    fn compile_rejects_multiple_primary_keys() {
        let err = EntityAccessor::compile(metadata(
            EntityDefinition::new(
                "Widget",
                vec![
                    PropertyDefinition::new("id", ParameterType::Guid).primary_key(),
                    PropertyDefinition::new("id2", ParameterType::Guid).primary_key(),
                    PropertyDefinition::new("label", ParameterType::String),
                ],
            )
            .with_table("widgets"),
        ))
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("more than one primary key"), "{msg}");
        assert!(msg.contains("id2"), "{msg}");
    }

    #[test]
    fn compile_rejects_invalid_identifiers() {
        let err = EntityAccessor::compile(metadata(
            EntityDefinition::new(
                "Widget",
                vec![PropertyDefinition::new("bad-name", ParameterType::String)],
            )
            .with_table("widgets"),
        ))
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidOperation(_)));
    }

    #[test]
    fn compile_derives_table_from_logical_name() {
        let accessor = EntityAccessor::compile(metadata(EntityDefinition::new(
            "Widget",
            vec![PropertyDefinition::new("id", ParameterType::Long).primary_key()],
        )))
        .unwrap();
        assert!(accessor.select_all_sql.contains("FROM \"widget\""));
    }

    #[test]
    fn compile_requires_properties() {
        let err =
            EntityAccessor::compile(metadata(EntityDefinition::new("Widget", vec![])))
                .unwrap_err();
        assert!(err.to_string().contains("no properties"));
    }

    #[test]
    fn record_lookup_is_case_insensitive() {
        let mut values = serde_json::Map::new();
        values.insert("Label".to_string(), Value::String("x".to_string()));
        let record = Record {
            entity: "Widget".to_string(),
            values,
        };
        assert!(record.get("label").is_some());
        assert!(record.get("Label").is_some());
        assert!(record.get("missing").is_none());
    }
}
