//! Entity models used to validate paths and map records to tables
//!
//! # Example
//!
//! ```rust
//! use acton_query::schema::{EntityModel, Schema};
//!
//! let schema = Schema::new()
//!     .with_entity(EntityModel::new("team").field("name"))
//!     .with_entity(
//!         EntityModel::new("member")
//!             .field("username")
//!             .field("age")
//!             .relation("team", "team", "team_id"),
//!     );
//!
//! assert!(schema.validate_path("member", "team.name").is_ok());
//! assert!(schema.validate_path("member", "team.budget").is_err());
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::repository::{QueryError, QueryOperation, QueryResult};

/// A many-to-one relation from one entity to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationModel {
    /// Relation name used in paths (`team`)
    pub name: String,
    /// Target entity name
    pub target: String,
    /// Foreign key column on the owning table (`team_id`)
    pub join_column: String,
}

/// Table mapping and attribute list of one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityModel {
    /// Entity name
    pub name: String,
    /// Table name; defaults to the entity name
    pub table: String,
    /// Primary key column
    #[serde(default = "default_id_column")]
    pub id_column: String,
    /// Filterable, sortable and projectable attributes
    #[serde(default)]
    pub fields: Vec<String>,
    /// Many-to-one relations
    #[serde(default)]
    pub relations: Vec<RelationModel>,
    /// Whether the table carries `created_at` / `updated_at` columns
    #[serde(default)]
    pub audited: bool,
}

fn default_id_column() -> String {
    "id".to_string()
}

impl EntityModel {
    /// A model whose table is named after the entity
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            table: name.clone(),
            name,
            id_column: default_id_column(),
            fields: Vec::new(),
            relations: Vec::new(),
            audited: false,
        }
    }

    /// Builder: table name
    #[must_use]
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Builder: primary key column
    #[must_use]
    pub fn id_column(mut self, column: impl Into<String>) -> Self {
        self.id_column = column.into();
        self
    }

    /// Builder: add an attribute
    #[must_use]
    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.fields.push(name.into());
        self
    }

    /// Builder: add a many-to-one relation
    #[must_use]
    pub fn relation(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        join_column: impl Into<String>,
    ) -> Self {
        self.relations.push(RelationModel {
            name: name.into(),
            target: target.into(),
            join_column: join_column.into(),
        });
        self
    }

    /// Builder: mark the table as carrying audit stamps
    #[must_use]
    pub fn audited(mut self) -> Self {
        self.audited = true;
        self
    }

    /// Whether `name` is the id or a declared attribute
    pub fn has_field(&self, name: &str) -> bool {
        name == "id" || self.fields.iter().any(|field| field == name)
    }

    /// A relation by name
    pub fn find_relation(&self, name: &str) -> Option<&RelationModel> {
        self.relations.iter().find(|relation| relation.name == name)
    }
}

/// The set of entity models a store knows about
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    entities: BTreeMap<String, EntityModel>,
}

impl Schema {
    /// An empty schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: register an entity model
    #[must_use]
    pub fn with_entity(mut self, model: EntityModel) -> Self {
        self.entities.insert(model.name.clone(), model);
        self
    }

    /// The model of `entity`
    pub fn entity(&self, entity: &str) -> QueryResult<&EntityModel> {
        self.entities.get(entity).ok_or_else(|| {
            QueryError::configuration(
                QueryOperation::Select,
                format!("Unknown entity '{}'", entity),
            )
        })
    }

    /// The relation `relation` of `entity` and the target's model
    pub fn relation(
        &self,
        entity: &str,
        relation: &str,
    ) -> QueryResult<(&RelationModel, &EntityModel)> {
        let model = self.entity(entity)?;
        let relation_model = model.find_relation(relation).ok_or_else(|| {
            QueryError::configuration(
                QueryOperation::Select,
                format!("Entity '{}' has no relation '{}'", entity, relation),
            )
        })?;
        let target = self.entity(&relation_model.target)?;
        Ok((relation_model, target))
    }

    /// Check that `path` names an attribute of `entity`, directly or through
    /// exactly one relation
    pub fn validate_path(&self, entity: &str, path: &str) -> QueryResult<()> {
        let model = self.entity(entity)?;
        match path.split_once('.') {
            None if model.has_field(path) || model.find_relation(path).is_some() => Ok(()),
            None => Err(QueryError::configuration(
                QueryOperation::Select,
                format!("Entity '{}' has no attribute '{}'", entity, path),
            )),
            Some((_, rest)) if rest.contains('.') => Err(QueryError::configuration(
                QueryOperation::Select,
                format!("Path '{}' traverses more than one relation", path),
            )),
            Some((relation, field)) => {
                let (_, target) = self.relation(entity, relation)?;
                if target.has_field(field) {
                    Ok(())
                } else {
                    Err(QueryError::configuration(
                        QueryOperation::Select,
                        format!("Entity '{}' has no attribute '{}'", target.name, field),
                    ))
                }
            }
        }
    }
}
