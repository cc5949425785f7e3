//! Projection shaping
//!
//! A [`ProjectionSpec`] names the attributes a caller wants back, possibly
//! through one relation hop. Closed projections list plain paths and nested
//! projections, so the store can load only the columns they need. Open
//! projections contain a derived [`Expression`] and need the whole record.
//!
//! Shaping is a pure function of a record and a projection. Relations must
//! be resolved first; [`project`] does that in batches through a live
//! [`RelationLoader`].
//!
//! # Example
//!
//! ```rust
//! use acton_query::projection::{shape, ProjectionSpec};
//! use acton_query::record::Record;
//!
//! let spec = ProjectionSpec::new()
//!     .field("username")
//!     .nested("team", ProjectionSpec::new().field("name"));
//!
//! let member = Record::new("member", 1)
//!     .with_field("username", "member1")
//!     .with_related("team", Record::new("team", 1).with_field("name", "teamA"));
//!
//! let value = shape(&member, &spec).unwrap();
//! assert_eq!(value["team"]["name"], "teamA");
//! ```

mod expression;
mod registry;

use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

pub use expression::Expression;
pub use registry::ProjectionRegistry;

use crate::record::Record;
use crate::repository::{
    relation_of, resolve_all, QueryError, QueryOperation, QueryResult, RelationLoader,
};

/// Columns and relations a store must load for a projection
///
/// `columns` of `None` means every column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// Top-level columns to keep; `None` keeps all of them
    pub columns: Option<BTreeSet<String>>,
    /// Relations to resolve while loading
    pub fetch: Vec<String>,
}

impl Selection {
    /// Whether `column` survives this selection
    pub fn keeps(&self, column: &str) -> bool {
        self.columns
            .as_ref()
            .map_or(true, |columns| columns.contains(column))
    }
}

/// Where a projected attribute comes from
#[derive(Debug, Clone, PartialEq)]
pub enum FieldSource {
    /// A field path, direct or through one relation
    Path(String),
    /// A relation shaped by its own projection
    Nested {
        relation: String,
        projection: ProjectionSpec,
    },
    /// A computed value
    Derived(Expression),
}

/// One attribute of a projection
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedField {
    pub name: String,
    pub source: FieldSource,
}

/// An ordered list of projected attributes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectionSpec {
    fields: Vec<ProjectedField>,
}

impl ProjectionSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// A closed projection over the given paths
    pub fn closed<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        paths
            .into_iter()
            .fold(Self::new(), |spec, path| spec.field(path))
    }

    /// An open projection with a single derived attribute
    pub fn open(name: impl Into<String>, expression: &str) -> QueryResult<Self> {
        Self::new().derived(name, expression)
    }

    /// Builder: project `path` under its own name
    #[must_use]
    pub fn field(self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.field_as(path.clone(), path)
    }

    /// Builder: project `path` under `name`
    #[must_use]
    pub fn field_as(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.fields.push(ProjectedField {
            name: name.into(),
            source: FieldSource::Path(path.into()),
        });
        self
    }

    /// Builder: shape `relation` with its own projection
    #[must_use]
    pub fn nested(mut self, relation: impl Into<String>, projection: ProjectionSpec) -> Self {
        let relation = relation.into();
        self.fields.push(ProjectedField {
            name: relation.clone(),
            source: FieldSource::Nested {
                relation,
                projection,
            },
        });
        self
    }

    /// Builder: add a derived attribute, parsing `expression`
    pub fn derived(mut self, name: impl Into<String>, expression: &str) -> QueryResult<Self> {
        self.fields.push(ProjectedField {
            name: name.into(),
            source: FieldSource::Derived(Expression::parse(expression)?),
        });
        Ok(self)
    }

    pub fn fields(&self) -> &[ProjectedField] {
        &self.fields
    }

    /// Whether no attribute, at any depth, is derived
    pub fn is_closed(&self) -> bool {
        self.fields.iter().all(|field| match &field.source {
            FieldSource::Path(_) => true,
            FieldSource::Nested { projection, .. } => projection.is_closed(),
            FieldSource::Derived(_) => false,
        })
    }

    /// Relations that must be resolved before shaping
    pub fn required_relations(&self) -> BTreeSet<String> {
        let mut relations = BTreeSet::new();
        for field in &self.fields {
            match &field.source {
                FieldSource::Path(path) => {
                    if let Some(relation) = relation_of(path) {
                        relations.insert(relation.to_string());
                    }
                }
                FieldSource::Nested { relation, .. } => {
                    relations.insert(relation.clone());
                }
                FieldSource::Derived(expression) => relations.extend(expression.relations()),
            }
        }
        relations
    }

    /// What a store must load to shape this projection
    ///
    /// A derived attribute at the top level needs every column. Derived
    /// attributes inside a nested projection only widen that branch, which
    /// is loaded whole anyway.
    pub fn selection(&self) -> Selection {
        let fetch: Vec<String> = self.required_relations().into_iter().collect();
        let open = self
            .fields
            .iter()
            .any(|field| matches!(field.source, FieldSource::Derived(_)));
        if open {
            return Selection {
                columns: None,
                fetch,
            };
        }

        let mut columns = BTreeSet::new();
        for field in &self.fields {
            match &field.source {
                FieldSource::Path(path) => {
                    columns.insert(relation_of(path).unwrap_or(path).to_string());
                }
                FieldSource::Nested { relation, .. } => {
                    columns.insert(relation.clone());
                }
                FieldSource::Derived(_) => {}
            }
        }
        Selection {
            columns: Some(columns),
            fetch,
        }
    }

    /// Check the projection is well formed
    ///
    /// Rejects empty projections, duplicate attribute names, and nested
    /// projections that would need a second relation hop.
    pub fn validate(&self) -> QueryResult<()> {
        self.validate_at(0)
    }

    fn validate_at(&self, depth: usize) -> QueryResult<()> {
        if self.fields.is_empty() {
            return Err(invalid("Projection has no attributes"));
        }
        let mut names = BTreeSet::new();
        for field in &self.fields {
            if !names.insert(field.name.as_str()) {
                return Err(invalid(format!(
                    "Projection attribute '{}' is declared twice",
                    field.name
                )));
            }
            let hops = match &field.source {
                FieldSource::Path(path) => usize::from(path.contains('.')),
                FieldSource::Nested { projection, .. } => {
                    projection.validate_at(depth + 1)?;
                    1
                }
                FieldSource::Derived(expression) => usize::from(!expression.relations().is_empty()),
            };
            if depth + hops > 1 {
                return Err(invalid(format!(
                    "Projection attribute '{}' traverses more than one relation",
                    field.name
                )));
            }
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> QueryError {
    QueryError::configuration(QueryOperation::Project, message)
}

/// A typed view that knows its own projection
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Deserialize)]
/// struct UsernameOnly {
///     username: String,
/// }
///
/// impl Projection for UsernameOnly {
///     fn projection() -> QueryResult<ProjectionSpec> {
///         Ok(ProjectionSpec::closed(["username"]))
///     }
/// }
/// ```
pub trait Projection: DeserializeOwned {
    fn projection() -> QueryResult<ProjectionSpec>;
}

/// Shape one record into a JSON object
///
/// Missing relations project as null; unresolved relations fail with
/// `RelationNotLoaded`.
pub fn shape(record: &Record, spec: &ProjectionSpec) -> QueryResult<Value> {
    let mut object = Map::new();
    for field in &spec.fields {
        let value = match &field.source {
            FieldSource::Path(path) => record.path_value(path)?,
            FieldSource::Nested {
                relation,
                projection,
            } => match record.relation(relation) {
                None => Value::Null,
                Some(reference) => match reference.get() {
                    Some(related) => shape(related, projection)?,
                    None => return Err(QueryError::relation_not_loaded(relation)),
                },
            },
            FieldSource::Derived(expression) => Value::String(expression.evaluate(record)?),
        };
        object.insert(field.name.clone(), value);
    }
    Ok(Value::Object(object))
}

/// Resolve what `spec` needs through `loader`, then shape every record
///
/// Each required relation is loaded in one batch. A loader whose session has
/// closed fails with `StaleReference`.
pub async fn project<L>(
    loader: &L,
    mut records: Vec<Record>,
    spec: &ProjectionSpec,
) -> QueryResult<Vec<Value>>
where
    L: RelationLoader,
{
    spec.validate()?;
    for relation in spec.required_relations() {
        resolve_all(loader, &mut records, &relation).await?;
    }
    records.iter().map(|record| shape(record, spec)).collect()
}

/// Project records into a typed view
pub async fn project_as<P, L>(loader: &L, records: Vec<Record>) -> QueryResult<Vec<P>>
where
    P: Projection,
    L: RelationLoader,
{
    let spec = P::projection()?;
    project(loader, records, &spec)
        .await?
        .into_iter()
        .map(|value| {
            serde_json::from_value(value).map_err(|e| {
                QueryError::serialization_error(
                    QueryOperation::Project,
                    format!("Projected value does not fit the view: {}", e),
                )
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde::Deserialize;

    use super::*;
    use crate::record::RecordId;
    use crate::repository::QueryErrorKind;

    struct Teams {
        closed: bool,
    }

    impl RelationLoader for Teams {
        async fn load_one(&self, record: &Record, relation: &str) -> QueryResult<Option<Record>> {
            let Some(reference) = record.relation(relation) else {
                return Ok(None);
            };
            let mut found = self.batch_load("team", &[reference.id().clone()]).await?;
            Ok(found.remove(reference.id()))
        }

        async fn batch_load(
            &self,
            entity: &str,
            ids: &[RecordId],
        ) -> QueryResult<HashMap<RecordId, Record>> {
            if self.closed {
                return Err(QueryError::stale_reference(
                    QueryOperation::Resolve,
                    "session closed",
                ));
            }
            Ok(ids
                .iter()
                .map(|id| {
                    let team = Record::new(entity, id.clone()).with_field("name", format!("team{}", id));
                    (id.clone(), team)
                })
                .collect())
        }
    }

    fn members() -> Vec<Record> {
        vec![
            Record::new("member", 1)
                .with_field("username", "member1")
                .with_field("age", 10)
                .with_relation("team", "team", 1),
            Record::new("member", 2)
                .with_field("username", "member2")
                .with_field("age", 20),
        ]
    }

    #[test]
    fn test_closed_selection() {
        let spec = ProjectionSpec::new()
            .field("username")
            .field_as("teamName", "team.name");
        assert!(spec.is_closed());
        let selection = spec.selection();
        assert_eq!(
            selection.columns,
            Some(BTreeSet::from(["team".to_string(), "username".to_string()]))
        );
        assert_eq!(selection.fetch, vec!["team".to_string()]);
        assert!(selection.keeps("team"));
        assert!(!selection.keeps("age"));
    }

    #[test]
    fn test_open_projection_needs_whole_record() {
        let spec = ProjectionSpec::open("summary", "username + ' ' + age").unwrap();
        assert!(!spec.is_closed());
        assert_eq!(spec.selection().columns, None);
    }

    #[test]
    fn test_open_nested_branch_keeps_closed_top_level() {
        let spec = ProjectionSpec::new().field("username").nested(
            "team",
            ProjectionSpec::open("label", "'team ' + name").unwrap(),
        );
        assert!(!spec.is_closed());
        assert!(spec.selection().columns.is_some());
    }

    #[test]
    fn test_validate_rejects_second_hop_and_duplicates() {
        let deep = ProjectionSpec::new().nested("team", ProjectionSpec::new().field("owner.name"));
        assert!(deep.validate().unwrap_err().is_configuration());

        let twice = ProjectionSpec::new().field("username").field("username");
        assert!(twice.validate().unwrap_err().is_configuration());

        assert!(ProjectionSpec::new().validate().is_err());
    }

    #[test]
    fn test_shape_unresolved_relation_fails() {
        let spec = ProjectionSpec::closed(["username", "team.name"]);
        let err = shape(&members()[0], &spec).unwrap_err();
        assert_eq!(err.kind, QueryErrorKind::RelationNotLoaded);
    }

    #[tokio::test]
    async fn test_project_resolves_nested_relation() {
        let spec = ProjectionSpec::new()
            .field("username")
            .nested("team", ProjectionSpec::closed(["name"]));
        let values = project(&Teams { closed: false }, members(), &spec)
            .await
            .unwrap();
        assert_eq!(values[0]["team"]["name"], "team1");
        assert_eq!(values[1]["team"], Value::Null);
        assert_eq!(values[1]["username"], "member2");
    }

    #[tokio::test]
    async fn test_project_after_close_is_stale() {
        let spec = ProjectionSpec::closed(["team.name"]);
        let err = project(&Teams { closed: true }, members(), &spec)
            .await
            .unwrap_err();
        assert_eq!(err.kind, QueryErrorKind::StaleReference);
    }

    #[tokio::test]
    async fn test_project_as_typed_view() {
        #[derive(Debug, Deserialize)]
        struct MemberSummary {
            username: String,
            summary: String,
        }

        impl Projection for MemberSummary {
            fn projection() -> QueryResult<ProjectionSpec> {
                ProjectionSpec::new()
                    .field("username")
                    .derived("summary", "username + ' ' + age + ' ' + team.name")
            }
        }

        let views: Vec<MemberSummary> = project_as(&Teams { closed: false }, members())
            .await
            .unwrap();
        assert_eq!(views[0].username, "member1");
        assert_eq!(views[0].summary, "member1 10 team1");
        assert_eq!(views[1].summary, "member2 20 null");
    }
}
