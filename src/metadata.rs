//! Declaration-file data model.
//!
//! Entities, views, and applications are described declaratively in a JSON
//! file consumed at startup. Everything in this module is immutable after
//! load; the registry and resolver build their lookup structures from it.

use serde::{Deserialize, Serialize};

/// Declared type of a view parameter, result column, or entity property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    Int,
    Long,
    Decimal,
    String,
    Bool,
    DateTime,
    Guid,
    Double,
    Float,
}

impl ParameterType {
    /// Coerce a JSON value into the canonical representation for this type.
    ///
    /// Strings are accepted for numeric, boolean, guid, and datetime types
    /// (common when values arrive from query strings or CSV imports).
    /// Null passes through; nullability is enforced by the caller.
    pub fn coerce(&self, value: &serde_json::Value) -> Result<serde_json::Value, String> {
        use serde_json::Value;

        if value.is_null() {
            return Ok(Value::Null);
        }

        match self {
            ParameterType::Int => match value {
                Value::Number(n) => {
                    let v = n.as_i64().ok_or_else(|| format!("'{}' is not an integer", n))?;
                    i32::try_from(v)
                        .map(|_| value.clone())
                        .map_err(|_| format!("'{}' is out of range for int", v))
                }
                Value::String(s) => s
                    .parse::<i32>()
                    .map(|v| Value::Number(v.into()))
                    .map_err(|_| format!("cannot convert '{}' to int", s)),
                _ => Err(format!("expected int, got {}", kind_of(value))),
            },
            ParameterType::Long => match value {
                Value::Number(n) if n.is_i64() => Ok(value.clone()),
                Value::String(s) => s
                    .parse::<i64>()
                    .map(|v| Value::Number(v.into()))
                    .map_err(|_| format!("cannot convert '{}' to long", s)),
                _ => Err(format!("expected long, got {}", kind_of(value))),
            },
            ParameterType::Decimal => match value {
                Value::Number(_) => Ok(value.clone()),
                Value::String(s) => s
                    .parse::<rust_decimal::Decimal>()
                    .map(|d| Value::String(d.to_string()))
                    .map_err(|_| format!("cannot convert '{}' to decimal", s)),
                _ => Err(format!("expected decimal, got {}", kind_of(value))),
            },
            ParameterType::Double | ParameterType::Float => match value {
                Value::Number(_) => Ok(value.clone()),
                Value::String(s) => s
                    .parse::<f64>()
                    .map_err(|_| format!("cannot convert '{}' to a floating-point number", s))
                    .and_then(|v| {
                        // NaN/inf parse but have no JSON rendition; a non-null
                        // input must never silently become NULL.
                        serde_json::Number::from_f64(v)
                            .map(Value::Number)
                            .ok_or_else(|| format!("'{}' is not a finite number", s))
                    }),
                _ => Err(format!("expected a floating-point number, got {}", kind_of(value))),
            },
            ParameterType::String => match value {
                Value::String(_) => Ok(value.clone()),
                _ => Err(format!("expected string, got {}", kind_of(value))),
            },
            ParameterType::Bool => match value {
                Value::Bool(_) => Ok(value.clone()),
                Value::String(s) => match s.to_lowercase().as_str() {
                    "true" | "1" | "yes" => Ok(Value::Bool(true)),
                    "false" | "0" | "no" => Ok(Value::Bool(false)),
                    _ => Err(format!("cannot convert '{}' to bool", s)),
                },
                _ => Err(format!("expected bool, got {}", kind_of(value))),
            },
            ParameterType::DateTime => match value {
                Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
                    .map(|dt| Value::String(dt.with_timezone(&chrono::Utc).to_rfc3339()))
                    .map_err(|e| format!("invalid datetime '{}': {}", s, e)),
                _ => Err(format!("expected an RFC 3339 datetime string, got {}", kind_of(value))),
            },
            ParameterType::Guid => match value {
                Value::String(s) => uuid::Uuid::parse_str(s)
                    .map(|u| Value::String(u.to_string()))
                    .map_err(|_| format!("'{}' is not a valid guid", s)),
                _ => Err(format!("expected a guid string, got {}", kind_of(value))),
            },
        }
    }
}

fn kind_of(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// A named column with a declared type. Implemented by view result
/// properties and entity properties so row mapping is shared.
pub trait ColumnSpec {
    fn column_name(&self) -> &str;
    fn column_type(&self) -> ParameterType;
}

fn default_nullable() -> bool {
    true
}

/// Validation bounds for a view parameter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ParameterValidation {
    #[serde(default)]
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<ValueRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
}

/// Inclusive numeric bounds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ValueRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// A declared view parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViewParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// Default value used when the caller supplies none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ParameterValidation>,
}

impl ViewParameter {
    pub fn new(name: impl Into<String>, param_type: ParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            nullable: true,
            default: None,
            validation: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.nullable = false;
        let validation = self.validation.get_or_insert_with(Default::default);
        validation.required = true;
        self
    }

    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// A declared result column of a view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultProperty {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
}

impl ResultProperty {
    pub fn new(name: impl Into<String>, param_type: ParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            nullable: true,
            max_length: None,
        }
    }
}

impl ColumnSpec for ResultProperty {
    fn column_name(&self) -> &str {
        &self.name
    }

    fn column_type(&self) -> ParameterType {
        self.param_type
    }
}

/// A declared read-query: named, parameterized SQL returning typed rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Path to the SQL template, relative to the configured SQL directory.
    pub sql_file: String,
    #[serde(default)]
    pub generate_partial: bool,
    #[serde(default)]
    pub parameters: Vec<ViewParameter>,
    #[serde(default)]
    pub properties: Vec<ResultProperty>,
    /// Applications allowed to execute this view.
    #[serde(default)]
    pub applications: Vec<String>,
}

/// A declared property of an entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PropertyDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
}

impl PropertyDefinition {
    pub fn new(name: impl Into<String>, param_type: ParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            nullable: true,
            primary_key: false,
            max_length: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_max_length(mut self, max_length: u32) -> Self {
        self.max_length = Some(max_length);
        self
    }
}

impl ColumnSpec for PropertyDefinition {
    fn column_name(&self) -> &str {
        &self.name
    }

    fn column_type(&self) -> ParameterType {
        self.param_type
    }
}

/// A declared entity: a typed record shape backed by a table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDefinition {
    /// Logical name, e.g. `Widget`.
    pub name: String,
    /// Owning logical schema; entities without one live in the root namespace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// Backing table name. Derived from the lowercased logical name when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub properties: Vec<PropertyDefinition>,
}

impl EntityDefinition {
    pub fn new(name: impl Into<String>, properties: Vec<PropertyDefinition>) -> Self {
        Self {
            name: name.into(),
            schema: None,
            table: None,
            properties,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Lowercased lookup key: `schema:name`, or just `name` without a schema.
    pub fn qualified_key(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}:{}", schema.to_lowercase(), self.name.to_lowercase()),
            None => self.name.to_lowercase(),
        }
    }

    /// Display name in declared casing, e.g. `acme:Widget`.
    pub fn display_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}:{}", schema, self.name),
            None => self.name.clone(),
        }
    }

    /// The primary-key property, if the entity declares one.
    pub fn primary_key(&self) -> Option<&PropertyDefinition> {
        self.properties.iter().find(|p| p.primary_key)
    }

    /// Writable properties, i.e. everything except the primary key.
    pub fn updatable_properties(&self) -> impl Iterator<Item = &PropertyDefinition> {
        self.properties.iter().filter(|p| !p.primary_key)
    }
}

/// Per-application visibility and defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Tenant schema used when the caller does not supply one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_schema: Option<String>,
    /// Qualified entity names visible to this application.
    #[serde(default)]
    pub entities: Vec<String>,
    /// View names visible to this application.
    #[serde(default)]
    pub views: Vec<String>,
}

/// Root of the declaration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Declarations {
    #[serde(default)]
    pub views: Vec<ViewDefinition>,
    #[serde(default)]
    pub entities: Vec<EntityDefinition>,
    #[serde(default)]
    pub applications: Vec<ApplicationInfo>,
}
