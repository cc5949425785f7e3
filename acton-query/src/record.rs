//! Records, relations and identifiers
//!
//! A [`Record`] is a row of one entity: an id, named field values and at most
//! one many-to-one [`Relation`] per relation name. Relations start out as bare
//! references and are resolved through a live session.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::repository::{QueryError, QueryResult};

/// Record identifier, assigned by the caller
///
/// Ordered so it can break ties in sorts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    /// Numeric id
    Int(i64),
    /// Assigned string id
    Text(String),
}

impl RecordId {
    /// JSON rendering of the id
    pub fn to_value(&self) -> Value {
        match self {
            Self::Int(n) => Value::from(*n),
            Self::Text(s) => Value::String(s.clone()),
        }
    }

    /// Parse an id out of a JSON value
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Int),
            Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{}", n),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for RecordId {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<i32> for RecordId {
    fn from(n: i32) -> Self {
        Self::Int(i64::from(n))
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// Lifecycle check decoupled from identifier nullability
pub trait Persistable {
    /// The record's identifier
    fn id(&self) -> &RecordId;

    /// Whether the record has never been stored
    fn is_new(&self) -> bool;
}

/// A many-to-one reference to another record
#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    target: String,
    id: RecordId,
    resolved: Option<Box<Record>>,
}

impl Relation {
    /// An unresolved reference to `target` with the given id
    pub fn new(target: impl Into<String>, id: impl Into<RecordId>) -> Self {
        Self {
            target: target.into(),
            id: id.into(),
            resolved: None,
        }
    }

    /// A reference that already holds its target record
    pub fn resolved(record: Record) -> Self {
        Self {
            target: record.entity.clone(),
            id: record.id.clone(),
            resolved: Some(Box::new(record)),
        }
    }

    /// Target entity name
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Target record id
    pub fn id(&self) -> &RecordId {
        &self.id
    }

    /// The target record, once resolved
    pub fn get(&self) -> Option<&Record> {
        self.resolved.as_deref()
    }

    /// Whether the target record has been loaded
    pub fn is_resolved(&self) -> bool {
        self.resolved.is_some()
    }

    /// Attach the loaded target record
    pub fn resolve_with(&mut self, record: Record) {
        self.resolved = Some(Box::new(record));
    }

    fn detached(&self) -> Self {
        Self {
            target: self.target.clone(),
            id: self.id.clone(),
            resolved: None,
        }
    }
}

/// A row of one entity
///
/// # Example
///
/// ```rust
/// use acton_query::record::{Persistable, Record};
/// use serde_json::json;
///
/// let member = Record::new("member", 1)
///     .with_field("username", "member1")
///     .with_field("age", 10)
///     .with_relation("team", "team", 1);
///
/// assert_eq!(member.value("username"), json!("member1"));
/// assert!(member.is_new());
/// assert!(!member.relation("team").unwrap().is_resolved());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    entity: String,
    id: RecordId,
    fields: BTreeMap<String, Value>,
    relations: BTreeMap<String, Relation>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

impl Record {
    /// A new, never stored record
    pub fn new(entity: impl Into<String>, id: impl Into<RecordId>) -> Self {
        Self {
            entity: entity.into(),
            id: id.into(),
            fields: BTreeMap::new(),
            relations: BTreeMap::new(),
            created_at: None,
            updated_at: None,
        }
    }

    /// A probe for query by example; its id is never matched
    pub fn probe(entity: impl Into<String>) -> Self {
        Self::new(entity, RecordId::Text(String::new()))
    }

    /// Builder: set a field value
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Builder: reference a record of `target` by id
    #[must_use]
    pub fn with_relation(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        id: impl Into<RecordId>,
    ) -> Self {
        self.relations.insert(name.into(), Relation::new(target, id));
        self
    }

    /// Builder: reference an already loaded record
    #[must_use]
    pub fn with_related(mut self, name: impl Into<String>, record: Record) -> Self {
        self.relations.insert(name.into(), Relation::resolved(record));
        self
    }

    /// Builder: set the creation stamp
    #[must_use]
    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    /// Entity name
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Record identifier
    pub fn id(&self) -> &RecordId {
        &self.id
    }

    /// Field values, without the id
    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Relations by name
    pub fn relations(&self) -> &BTreeMap<String, Relation> {
        &self.relations
    }

    /// A relation by name; `None` when the record has no such reference
    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.get(name)
    }

    /// Mutable access to a relation by name
    pub fn relation_mut(&mut self, name: &str) -> Option<&mut Relation> {
        self.relations.get_mut(name)
    }

    /// Creation stamp, set by the store on first save
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    /// Last modification stamp
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Set or replace a field value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Remove the reference named `name`
    pub fn clear_relation(&mut self, name: &str) {
        self.relations.remove(name);
    }

    /// Value of a direct field
    ///
    /// `id` reads the identifier and a relation name reads the referenced id.
    /// Missing fields are null.
    pub fn value(&self, field: &str) -> Value {
        if field == "id" {
            return self.id.to_value();
        }
        match self.fields.get(field) {
            Some(value) => value.clone(),
            None => self
                .relations
                .get(field)
                .map_or(Value::Null, |relation| relation.id().to_value()),
        }
    }

    /// Value of a field path, through at most one resolved relation
    ///
    /// A missing relation reads as null. A present but unresolved relation is
    /// an error: the value is unknown until the relation is loaded.
    pub fn path_value(&self, path: &str) -> QueryResult<Value> {
        match path.split_once('.') {
            None => Ok(self.value(path)),
            Some((relation, field)) => match self.relations.get(relation) {
                None => Ok(Value::Null),
                Some(reference) => match reference.get() {
                    Some(related) => Ok(related.value(field)),
                    None => Err(QueryError::relation_not_loaded(relation)),
                },
            },
        }
    }

    /// Keep only the listed fields; relations not listed are dropped as well
    pub fn retain_fields<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str) -> bool,
    {
        self.fields.retain(|name, _| keep(name));
        self.relations.retain(|name, _| keep(name));
    }

    /// A copy with every relation reduced to a bare reference
    pub fn detached(&self) -> Self {
        Self {
            entity: self.entity.clone(),
            id: self.id.clone(),
            fields: self.fields.clone(),
            relations: self
                .relations
                .iter()
                .map(|(name, relation)| (name.clone(), relation.detached()))
                .collect(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// JSON object with `id`, every field and each relation
    ///
    /// Resolved relations nest as objects; unresolved ones render as their id.
    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        object.insert("id".to_string(), self.id.to_value());
        for (name, value) in &self.fields {
            object.insert(name.clone(), value.clone());
        }
        for (name, relation) in &self.relations {
            let value = match relation.get() {
                Some(related) => related.to_json(),
                None => relation.id().to_value(),
            };
            object.insert(name.clone(), value);
        }
        Value::Object(object)
    }

    pub(crate) fn stamp_created(&mut self, at: DateTime<Utc>) {
        self.created_at = Some(at);
        self.updated_at = Some(at);
    }

    pub(crate) fn stamp_updated(&mut self, at: DateTime<Utc>) {
        self.updated_at = Some(at);
    }

    pub(crate) fn set_created_at(&mut self, at: Option<DateTime<Utc>>) {
        self.created_at = at;
    }

    pub(crate) fn insert_relation(&mut self, name: impl Into<String>, relation: Relation) {
        self.relations.insert(name.into(), relation);
    }
}

impl Persistable for Record {
    fn id(&self) -> &RecordId {
        Record::id(self)
    }

    fn is_new(&self) -> bool {
        self.created_at.is_none()
    }
}
