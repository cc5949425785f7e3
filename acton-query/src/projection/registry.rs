//! Named projections

use std::collections::BTreeMap;

use super::{Projection, ProjectionSpec};
use crate::repository::{QueryError, QueryOperation, QueryResult};

/// Projections registered by name, for callers that pick one at runtime
#[derive(Debug, Clone, Default)]
pub struct ProjectionRegistry {
    specs: BTreeMap<String, ProjectionSpec>,
}

impl ProjectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `spec` under `name`
    ///
    /// The projection is validated; a name already taken is a configuration
    /// error.
    pub fn register(&mut self, name: impl Into<String>, spec: ProjectionSpec) -> QueryResult<()> {
        let name = name.into();
        spec.validate()?;
        if self.specs.contains_key(&name) {
            return Err(QueryError::configuration(
                QueryOperation::Project,
                format!("Projection '{}' is already registered", name),
            ));
        }
        tracing::debug!(projection = %name, closed = spec.is_closed(), "registered projection");
        self.specs.insert(name, spec);
        Ok(())
    }

    /// Register the projection of a typed view
    pub fn register_type<P: Projection>(&mut self, name: impl Into<String>) -> QueryResult<()> {
        self.register(name, P::projection()?)
    }

    /// Builder form of [`register`](Self::register)
    pub fn with(mut self, name: impl Into<String>, spec: ProjectionSpec) -> QueryResult<Self> {
        self.register(name, spec)?;
        Ok(self)
    }

    /// The projection registered as `name`
    pub fn get(&self, name: &str) -> QueryResult<&ProjectionSpec> {
        self.specs.get(name).ok_or_else(|| {
            QueryError::configuration(
                QueryOperation::Project,
                format!("Unknown projection '{}'", name),
            )
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_get() {
        let registry = ProjectionRegistry::new()
            .with("usernames", ProjectionSpec::closed(["username"]))
            .unwrap();
        assert!(registry.get("usernames").unwrap().is_closed());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["usernames"]);
    }

    #[test]
    fn test_duplicate_and_unknown_names() {
        let mut registry = ProjectionRegistry::new();
        registry
            .register("usernames", ProjectionSpec::closed(["username"]))
            .unwrap();
        let err = registry
            .register("usernames", ProjectionSpec::closed(["age"]))
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(registry.get("missing").unwrap_err().is_configuration());
    }
}
