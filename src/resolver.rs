//! Entity and view name resolution with application visibility.
//!
//! The resolver is built once at startup from the declarations and is a
//! pure function of (entities, applications): every lookup is O(1)
//! against precomputed maps, with no per-call scanning.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::metadata::{ApplicationInfo, EntityDefinition};
use crate::sql::sanitize::validate_identifier;

/// An entity definition paired with its resolved backing table.
///
/// `table` is `None` when the declaration names no table and the logical
/// name cannot be used as one; CRUD operations on such an entity fail
/// with an invalid-operation error instead of producing broken SQL.
#[derive(Debug, Clone)]
pub struct EntityMetadata {
    pub definition: Arc<EntityDefinition>,
    pub table: Option<String>,
}

impl EntityMetadata {
    fn new(definition: Arc<EntityDefinition>) -> Self {
        let table = definition.table.clone().or_else(|| {
            let derived = definition.name.to_lowercase();
            validate_identifier(&derived).ok().map(|_| derived)
        });
        Self { definition, table }
    }
}

struct AppEntry {
    info: ApplicationInfo,
    entity_set: HashSet<String>,
    view_set: HashSet<String>,
}

/// Maps logical (optionally schema-qualified) names to entity metadata
/// and enforces per-application visibility.
pub struct EntityResolver {
    /// `schema:name` (lowered) -> metadata. Schema-less entities are keyed
    /// by their plain name.
    qualified: HashMap<String, Arc<EntityMetadata>>,
    /// Plain name (lowered) -> all entities sharing it across schemas.
    plain: HashMap<String, Vec<Arc<EntityMetadata>>>,
    /// Lowered application name -> visibility entry.
    applications: HashMap<String, AppEntry>,
    /// Display names of every entity, declaration order.
    entity_names: Vec<String>,
}

impl EntityResolver {
    pub fn new(
        entities: impl IntoIterator<Item = Arc<EntityDefinition>>,
        applications: impl IntoIterator<Item = ApplicationInfo>,
    ) -> Self {
        let mut qualified = HashMap::new();
        let mut plain: HashMap<String, Vec<Arc<EntityMetadata>>> = HashMap::new();
        let mut entity_names = Vec::new();

        for definition in entities {
            let metadata = Arc::new(EntityMetadata::new(definition));
            entity_names.push(metadata.definition.display_name());
            qualified.insert(metadata.definition.qualified_key(), metadata.clone());
            plain
                .entry(metadata.definition.name.to_lowercase())
                .or_default()
                .push(metadata);
        }

        let applications = applications
            .into_iter()
            .map(|info| {
                let entity_set = info.entities.iter().map(|n| n.to_lowercase()).collect();
                let view_set = info.views.iter().map(|n| n.to_lowercase()).collect();
                (
                    info.name.to_lowercase(),
                    AppEntry {
                        info,
                        entity_set,
                        view_set,
                    },
                )
            })
            .collect();

        Self {
            qualified,
            plain,
            applications,
            entity_names,
        }
    }

    /// Resolve a logical name to entity metadata.
    ///
    /// Exact `schema:name` matches win. An unqualified name falls back to
    /// the plain-name index: a unique match resolves, a collision prefers
    /// the schema-less entity, and an unresolvable collision is an
    /// explicit [`EngineError::AmbiguousEntityName`] rather than an
    /// order-dependent pick.
    pub fn find(&self, name: &str) -> Result<Option<Arc<EntityMetadata>>> {
        let key = name.trim().to_lowercase();
        if key.is_empty() {
            return Ok(None);
        }

        if let Some(metadata) = self.qualified.get(&key) {
            return Ok(Some(metadata.clone()));
        }

        if key.contains(':') {
            return Ok(None);
        }

        match self.plain.get(&key).map(Vec::as_slice) {
            None | Some([]) => Ok(None),
            Some([only]) => Ok(Some(only.clone())),
            Some(candidates) => {
                // A schema-less entity would have matched the qualified map
                // above, so every candidate here is schema-qualified.
                let mut names: Vec<String> = candidates
                    .iter()
                    .map(|c| c.definition.display_name())
                    .collect();
                names.sort();
                Err(EngineError::AmbiguousEntityName {
                    name: name.to_string(),
                    candidates: names,
                })
            }
        }
    }

    /// Entities visible to an application, in the order its visibility
    /// list declares them. Unknown applications see nothing.
    pub fn entities_for_application(&self, app_name: &str) -> Vec<Arc<EntityMetadata>> {
        let Some(app) = self.applications.get(&app_name.to_lowercase()) else {
            return Vec::new();
        };
        app.info
            .entities
            .iter()
            .filter_map(|name| self.qualified.get(&name.to_lowercase()).cloned())
            .collect()
    }

    /// Whether an entity is visible to an application.
    pub fn is_visible(&self, entity: &EntityMetadata, app_name: &str) -> bool {
        self.applications
            .get(&app_name.to_lowercase())
            .is_some_and(|app| app.entity_set.contains(&entity.definition.qualified_key()))
    }

    /// Whether a view is visible to an application. Visibility can be
    /// declared on either side: in the application's view list or in the
    /// view's own application list.
    pub fn view_visible(&self, view_name: &str, view_applications: &[String], app_name: &str) -> bool {
        let app_key = app_name.to_lowercase();
        if view_applications.iter().any(|a| a.to_lowercase() == app_key) {
            return true;
        }
        self.applications
            .get(&app_key)
            .is_some_and(|app| app.view_set.contains(&view_name.to_lowercase()))
    }

    /// Application info by name, case-insensitive.
    pub fn application(&self, app_name: &str) -> Option<&ApplicationInfo> {
        self.applications
            .get(&app_name.to_lowercase())
            .map(|entry| &entry.info)
    }

    /// Display names of every registered entity.
    pub fn entity_names(&self) -> Vec<String> {
        self.entity_names.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ParameterType, PropertyDefinition};

    fn widget(schema: Option<&str>) -> EntityDefinition {
        let def = EntityDefinition::new(
            "Widget",
            vec![
                PropertyDefinition::new("id", ParameterType::Guid).primary_key(),
                PropertyDefinition::new("label", ParameterType::String),
            ],
        );
        match schema {
            Some(s) => def.with_schema(s),
            None => def,
        }
    }

    fn resolver_with(entities: Vec<EntityDefinition>, apps: Vec<ApplicationInfo>) -> EntityResolver {
        EntityResolver::new(entities.into_iter().map(Arc::new), apps)
    }

    fn app(name: &str, entities: Vec<&str>, views: Vec<&str>) -> ApplicationInfo {
        ApplicationInfo {
            name: name.to_string(),
            title: None,
            default_schema: None,
            entities: entities.into_iter().map(String::from).collect(),
            views: views.into_iter().map(String::from).collect(),
        }
    }

    #[test]
    fn qualified_lookup_succeeds() {
        let resolver = resolver_with(vec![widget(Some("acme"))], vec![]);
        let found = resolver.find("acme:Widget").unwrap().unwrap();
        assert_eq!(found.definition.name, "Widget");
        assert_eq!(found.table.as_deref(), Some("widget"));
    }

    #[test]
    fn plain_name_falls_back_when_unambiguous() {
        let resolver = resolver_with(vec![widget(Some("acme"))], vec![]);
        let qualified = resolver.find("acme:widget").unwrap().unwrap();
        let plain = resolver.find("Widget").unwrap().unwrap();
        assert!(Arc::ptr_eq(&qualified, &plain));
    }

    #[test]
    fn schema_less_entity_wins_a_collision() {
        let resolver = resolver_with(vec![widget(Some("acme")), widget(None)], vec![]);
        let found = resolver.find("widget").unwrap().unwrap();
        assert!(found.definition.schema.is_none());
    }

    #[test]
    fn unresolvable_collision_is_an_explicit_error() {
        let resolver = resolver_with(vec![widget(Some("acme")), widget(Some("core"))], vec![]);
        let err = resolver.find("widget").unwrap_err();
        match err {
            EngineError::AmbiguousEntityName { candidates, .. } => {
                assert_eq!(candidates, vec!["acme:Widget", "core:Widget"]);
            }
            other => panic!("expected AmbiguousEntityName, got {other:?}"),
        }
    }

    #[test]
    fn unknown_names_resolve_to_none() {
        let resolver = resolver_with(vec![widget(Some("acme"))], vec![]);
        assert!(resolver.find("gadget").unwrap().is_none());
        assert!(resolver.find("core:widget").unwrap().is_none());
        assert!(resolver.find("  ").unwrap().is_none());
    }

    #[test]
    fn visibility_filters_application_listing() {
        let resolver = resolver_with(
            vec![widget(Some("acme")), widget(Some("core"))],
            vec![app("reporting", vec!["acme:widget"], vec![])],
        );

        let visible = resolver.entities_for_application("reporting");
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].definition.schema.as_deref(), Some("acme"));

        // Global resolution still sees the hidden entity.
        assert!(resolver.find("core:widget").unwrap().is_some());
        let hidden = resolver.find("core:widget").unwrap().unwrap();
        assert!(!resolver.is_visible(&hidden, "reporting"));
    }

    #[test]
    fn unknown_application_sees_nothing() {
        let resolver = resolver_with(vec![widget(Some("acme"))], vec![]);
        assert!(resolver.entities_for_application("ghost").is_empty());
        let entity = resolver.find("acme:widget").unwrap().unwrap();
        assert!(!resolver.is_visible(&entity, "ghost"));
    }

    #[test]
    fn view_visibility_works_from_either_side() {
        let resolver = resolver_with(
            vec![],
            vec![app("reporting", vec![], vec!["openorders"])],
        );
        // Declared on the application.
        assert!(resolver.view_visible("OpenOrders", &[], "reporting"));
        // Declared on the view.
        assert!(resolver.view_visible("Other", &["Reporting".to_string()], "reporting"));
        // Declared nowhere.
        assert!(!resolver.view_visible("Other", &[], "reporting"));
    }

    #[test]
    fn application_lookup_is_case_insensitive() {
        let resolver = resolver_with(vec![], vec![app("Reporting", vec![], vec![])]);
        assert!(resolver.application("reporting").is_some());
        assert!(resolver.application("REPORTING").is_some());
        assert!(resolver.application("ghost").is_none());
    }
}
