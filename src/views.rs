//! View execution: declared, parameterized read-queries returning typed
//! rows.
//!
//! A view is resolved from the registry by name, its SQL template loaded
//! (and cached) from disk, and the caller's parameters validated and
//! coerced against the declaration before anything touches the database.
//! Parameters bind positionally in declared order, so the templates use
//! `$1..$n` and the declaration order is part of the view's contract.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::metadata::{ViewDefinition, ViewParameter};
use crate::query::{ParamValue, RawQueryExecutor};
use crate::registry::MetadataRegistry;
use crate::resolver::EntityResolver;
use crate::tenant::SchemaAccessor;

/// Executes declared views for the current tenant.
#[derive(Clone)]
pub struct ViewService {
    registry: Arc<MetadataRegistry>,
    resolver: Arc<EntityResolver>,
    executor: RawQueryExecutor,
    schema: Arc<dyn SchemaAccessor>,
}

impl ViewService {
    pub fn new(
        registry: Arc<MetadataRegistry>,
        resolver: Arc<EntityResolver>,
        executor: RawQueryExecutor,
        schema: Arc<dyn SchemaAccessor>,
    ) -> Self {
        Self {
            registry,
            resolver,
            executor,
            schema,
        }
    }

    /// Same service bound to a different tenant schema source.
    pub fn with_schema(&self, schema: Arc<dyn SchemaAccessor>) -> Self {
        Self {
            registry: self.registry.clone(),
            resolver: self.resolver.clone(),
            executor: self.executor.clone(),
            schema,
        }
    }

    /// Execute a view and map its rows to `T`.
    pub async fn execute_view<T>(&self, name: &str, params: Option<&Value>) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let (view, sql, bound) = self.prepare(name, params)?;

        debug!(view = %view.name, params = bound.len(), "executing view");

        self.executor
            .query(&self.schema.schema(), &sql, &bound, &view.properties)
            .await
    }

    /// Execute a view expected to return at most one row.
    pub async fn execute_view_single<T>(
        &self,
        name: &str,
        params: Option<&Value>,
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let (view, sql, bound) = self.prepare(name, params)?;

        self.executor
            .query_single(&self.schema.schema(), &sql, &bound, &view.properties)
            .await
    }

    /// Execute a view on behalf of an application, enforcing visibility.
    pub async fn execute_view_for<T>(
        &self,
        app_name: &str,
        name: &str,
        params: Option<&Value>,
    ) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let view = self.registry.view_definition(name)?;
        if !self
            .resolver
            .view_visible(&view.name, &view.applications, app_name)
        {
            return Err(EngineError::NotVisible {
                name: view.name.clone(),
                application: app_name.to_string(),
            });
        }
        self.execute_view(name, params).await
    }

    /// Names of every declared view, in declaration order.
    pub fn view_names(&self) -> Vec<String> {
        self.registry.view_names()
    }

    fn prepare(
        &self,
        name: &str,
        params: Option<&Value>,
    ) -> Result<(Arc<ViewDefinition>, Arc<str>, Vec<ParamValue>)> {
        if name.trim().is_empty() {
            return Err(EngineError::invalid_parameter("view name must not be empty"));
        }

        let view = self.registry.view_definition(name)?;
        let sql = self.registry.view_sql(&view.name)?;
        let bound = bind_view_parameters(&view, params)?;
        Ok((view, sql, bound))
    }
}

/// Validate and coerce caller parameters against a view's declaration.
///
/// Returns one value per declared parameter, in declared order. Caller
/// keys match case-insensitively; a declared parameter the caller omits
/// takes its default, then null if nullable, and otherwise fails. Caller
/// keys that match no declaration fail rather than being dropped.
pub fn bind_view_parameters(
    view: &ViewDefinition,
    params: Option<&Value>,
) -> Result<Vec<ParamValue>> {
    let supplied = match params {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => Some(map),
        Some(other) => {
            return Err(EngineError::invalid_parameter(format!(
                "view '{}': parameters must be a JSON object, got {}",
                view.name,
                json_kind(other)
            )));
        }
    };

    let mut bound = Vec::with_capacity(view.parameters.len());
    for declared in &view.parameters {
        let value = supplied.and_then(|map| {
            map.get(&declared.name).or_else(|| {
                map.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(&declared.name))
                    .map(|(_, v)| v)
            })
        });
        bound.push(bind_one(view, declared, value)?);
    }

    // Anything left over is a caller mistake worth naming.
    if let Some(map) = supplied {
        for key in map.keys() {
            let known = view
                .parameters
                .iter()
                .any(|p| p.name.eq_ignore_ascii_case(key));
            if !known {
                return Err(EngineError::invalid_parameter(format!(
                    "view '{}' has no parameter '{}'",
                    view.name, key
                )));
            }
        }
    }

    Ok(bound)
}

fn bind_one(
    view: &ViewDefinition,
    declared: &ViewParameter,
    value: Option<&Value>,
) -> Result<ParamValue> {
    let effective = match value {
        Some(v) if !v.is_null() => Some(v.clone()),
        // An explicit null does not fall back to the default.
        Some(_null) => None,
        None => declared.default.clone().filter(|d| !d.is_null()),
    };

    let Some(effective) = effective else {
        let required = !declared.nullable
            || declared.validation.as_ref().is_some_and(|v| v.required);
        if required {
            return Err(EngineError::invalid_parameter(format!(
                "view '{}': parameter '{}' is required",
                view.name, declared.name
            )));
        }
        return Ok(ParamValue::Null(declared.param_type));
    };

    check_validation(view, declared, &effective)?;

    ParamValue::from_json(declared.param_type, &effective).map_err(|e| {
        EngineError::invalid_parameter(format!(
            "view '{}': parameter '{}': {}",
            view.name, declared.name, e
        ))
    })
}

fn check_validation(
    view: &ViewDefinition,
    declared: &ViewParameter,
    value: &Value,
) -> Result<()> {
    let Some(validation) = &declared.validation else {
        return Ok(());
    };

    if let Some(range) = &validation.range {
        let number = value
            .as_f64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()));
        if let Some(n) = number {
            if range.min.is_some_and(|min| n < min) || range.max.is_some_and(|max| n > max) {
                return Err(EngineError::invalid_parameter(format!(
                    "view '{}': parameter '{}' is out of range [{}, {}]",
                    view.name,
                    declared.name,
                    range.min.map_or("-".to_string(), |v| v.to_string()),
                    range.max.map_or("-".to_string(), |v| v.to_string()),
                )));
            }
        }
    }

    if let (Some(max), Some(text)) = (validation.max_length, value.as_str()) {
        if text.chars().count() > max {
            return Err(EngineError::invalid_parameter(format!(
                "view '{}': parameter '{}' exceeds max length {}",
                view.name, declared.name, max
            )));
        }
    }

    Ok(())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ParameterType, ParameterValidation, ValueRange};
    use serde_json::json;

    fn view(parameters: Vec<ViewParameter>) -> ViewDefinition {
        ViewDefinition {
            name: "TopWidgets".to_string(),
            description: None,
            sql_file: "top_widgets.sql".to_string(),
            generate_partial: false,
            parameters,
            properties: vec![],
            applications: vec![],
        }
    }

    #[test]
    fn binds_in_declared_order_regardless_of_caller_order() {
        let view = view(vec![
            ViewParameter::new("TopN", ParameterType::Int).required(),
            ViewParameter::new("Prefix", ParameterType::String),
        ]);

        let bound = bind_view_parameters(
            &view,
            Some(&json!({ "prefix": "wid", "topn": 5 })),
        )
        .unwrap();

        assert_eq!(bound[0], ParamValue::Int(5));
        assert_eq!(bound[1], ParamValue::Text("wid".to_string()));
    }

    #[test]
    fn omitted_parameter_takes_default_then_null() {
        let view = view(vec![
            ViewParameter::new("TopN", ParameterType::Int).with_default(json!(10)),
            ViewParameter::new("Prefix", ParameterType::String),
        ]);

        let bound = bind_view_parameters(&view, None).unwrap();
        assert_eq!(bound[0], ParamValue::Int(10));
        assert_eq!(bound[1], ParamValue::Null(ParameterType::String));
    }

    #[test]
    fn explicit_null_does_not_take_the_default() {
        let view =
            view(vec![ViewParameter::new("TopN", ParameterType::Int).with_default(json!(10))]);

        let bound = bind_view_parameters(&view, Some(&json!({ "TopN": null }))).unwrap();
        assert_eq!(bound[0], ParamValue::Null(ParameterType::Int));
    }

    #[test]
    fn missing_required_parameter_fails() {
        let view = view(vec![ViewParameter::new("TopN", ParameterType::Int).required()]);

        let err = bind_view_parameters(&view, None).unwrap_err();
        assert!(err.to_string().contains("'TopN' is required"));
    }

    #[test]
    fn unknown_parameter_fails() {
        let view = view(vec![ViewParameter::new("TopN", ParameterType::Int)]);

        let err = bind_view_parameters(&view, Some(&json!({ "Bottom": 1 }))).unwrap_err();
        assert!(err.to_string().contains("no parameter 'Bottom'"));
    }

    #[test]
    fn non_object_parameters_fail() {
        let view = view(vec![]);

        let err = bind_view_parameters(&view, Some(&json!([1, 2]))).unwrap_err();
        assert!(err.to_string().contains("must be a JSON object"));
    }

    #[test]
    fn range_validation_applies() {
        let mut param = ViewParameter::new("TopN", ParameterType::Int);
        param.validation = Some(ParameterValidation {
            required: false,
            range: Some(ValueRange {
                min: Some(1.0),
                max: Some(100.0),
            }),
            max_length: None,
        });
        let view = view(vec![param]);

        assert!(bind_view_parameters(&view, Some(&json!({ "TopN": 50 }))).is_ok());
        let err = bind_view_parameters(&view, Some(&json!({ "TopN": 500 }))).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn max_length_validation_applies() {
        let mut param = ViewParameter::new("Prefix", ParameterType::String);
        param.validation = Some(ParameterValidation {
            required: false,
            range: None,
            max_length: Some(3),
        });
        let view = view(vec![param]);

        let err =
            bind_view_parameters(&view, Some(&json!({ "Prefix": "toolong" }))).unwrap_err();
        assert!(err.to_string().contains("exceeds max length"));
    }

    #[test]
    fn string_values_coerce_to_declared_types() {
        let view = view(vec![ViewParameter::new("TopN", ParameterType::Int)]);

        let bound = bind_view_parameters(&view, Some(&json!({ "TopN": "7" }))).unwrap();
        assert_eq!(bound[0], ParamValue::Int(7));
    }
}
