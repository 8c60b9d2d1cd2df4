//! Tenant schema resolution.
//!
//! The engine never decides which tenant's data a request touches. The
//! active schema is resolved upstream (typically from a request header)
//! and handed in through a [`SchemaAccessor`], so the CRUD path and the
//! raw-query path always agree. There is no thread-local or global state;
//! swap the accessor per request to target a different tenant.

/// Provides the active tenant schema for the current request.
pub trait SchemaAccessor: Send + Sync {
    /// The schema identifier queries should run against.
    fn schema(&self) -> String;
}

/// A fixed schema, for single-tenant deployments and tests.
#[derive(Debug, Clone)]
pub struct FixedSchema(String);

impl FixedSchema {
    pub fn new(schema: impl Into<String>) -> Self {
        Self(schema.into())
    }
}

impl SchemaAccessor for FixedSchema {
    fn schema(&self) -> String {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_schema_returns_configured_value() {
        let accessor = FixedSchema::new("tenant_a");
        assert_eq!(accessor.schema(), "tenant_a");
    }
}
