//! Store-facing query descriptions
//!
//! These are the values the query layer hands to a [`RecordStore`]: a bounded
//! select, an unbounded count, a bulk statement, or a raw native query.
//!
//! [`RecordStore`]: super::RecordStore

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use super::pagination::Sort;
use crate::projection::Selection;
use crate::specification::{JoinKind, Specification};

/// Pessimistic lock requested for the rows a query returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockMode {
    /// No lock
    #[default]
    None,
    /// Shared lock; blocks writers, not other readers
    SharedRead,
    /// Exclusive lock; blocks other lockers until the session ends
    ExclusiveWrite,
}

/// Per-query execution options
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryOptions {
    /// Row lock to take on returned rows
    pub lock: LockMode,
    /// Caller deadline; expiry cancels the query without partial results
    pub deadline: Option<Instant>,
    /// Relations to load eagerly together with the rows
    pub fetch: Vec<String>,
    /// Columns and relations the caller will read; `None` means everything
    pub selection: Option<Selection>,
    /// Return rows without entering them in the session cache
    pub read_only: bool,
}

/// A bounded content query
///
/// # Example
///
/// ```rust
/// use acton_query::repository::{Filter, LockMode, SelectQuery, Sort};
/// use acton_query::specification::build_specification;
///
/// let spec = build_specification(&[Filter::gte("age", 20)], &[]).unwrap();
/// let query = SelectQuery::new("member")
///     .with_specification(spec)
///     .with_sort(Sort::desc("age"))
///     .with_limit(3)
///     .with_lock(LockMode::ExclusiveWrite);
/// assert_eq!(query.limit, Some(3));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    /// Entity to query
    pub entity: String,
    /// Predicate and joins
    pub specification: Specification,
    /// Ordering
    pub sort: Sort,
    /// Maximum rows to return
    pub limit: Option<u64>,
    /// Rows to skip
    pub offset: u64,
    /// Lock, deadline, fetch and selection hints
    pub options: QueryOptions,
}

impl SelectQuery {
    /// Select every row of `entity`
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            specification: Specification::all(),
            sort: Sort::unsorted(),
            limit: None,
            offset: 0,
            options: QueryOptions::default(),
        }
    }

    /// Builder: predicate and joins
    #[must_use]
    pub fn with_specification(mut self, specification: Specification) -> Self {
        self.specification = specification;
        self
    }

    /// Builder: ordering
    #[must_use]
    pub fn with_sort(mut self, sort: Sort) -> Self {
        self.sort = sort;
        self
    }

    /// Builder: row limit
    #[must_use]
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Builder: rows to skip
    #[must_use]
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Builder: pessimistic lock mode
    #[must_use]
    pub fn with_lock(mut self, lock: LockMode) -> Self {
        self.options.lock = lock;
        self
    }

    /// Builder: absolute deadline
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.options.deadline = Some(deadline);
        self
    }

    /// Builder: deadline relative to now
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Builder: load `relation` eagerly
    #[must_use]
    pub fn fetch(mut self, relation: impl Into<String>) -> Self {
        let relation = relation.into();
        if !self.options.fetch.contains(&relation) {
            self.options.fetch.push(relation);
        }
        self
    }

    /// Builder: restrict the columns the store needs to return
    #[must_use]
    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.options.selection = Some(selection);
        self
    }

    /// Builder: leave the returned rows out of the session cache
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.options.read_only = true;
        self
    }

    /// Whether the rows a store fetches for this query are complete records
    /// it may enter in the session cache
    ///
    /// A store that trims columns before decoding must not cache the partial
    /// rows: a later `find_by_id` or `save` would see missing fields.
    pub fn caches_fetched_rows(&self) -> bool {
        !self.options.read_only && self.options.selection.is_none()
    }

    /// Relations to load eagerly, from fetch hints and the selection
    pub fn relations_to_fetch(&self) -> Vec<String> {
        let mut relations = self.options.fetch.clone();
        if let Some(selection) = &self.options.selection {
            for relation in &selection.fetch {
                if !relations.contains(relation) {
                    relations.push(relation.clone());
                }
            }
        }
        relations
    }
}

/// An unbounded count over a specification
#[derive(Debug, Clone, PartialEq)]
pub struct CountQuery {
    /// Entity to count
    pub entity: String,
    /// Predicate and joins
    pub specification: Specification,
    /// Caller deadline
    pub deadline: Option<Instant>,
}

impl CountQuery {
    /// Count every row of `entity` matching `specification`
    pub fn new(entity: impl Into<String>, specification: Specification) -> Self {
        Self {
            entity: entity.into(),
            specification,
            deadline: None,
        }
    }

    /// Count query over the same predicate as `query`
    ///
    /// Sort, window, lock and fetch hints are dropped, and so are left joins
    /// the predicate does not reference: a many-to-one left join neither adds
    /// nor removes rows. Inner joins stay since they filter.
    pub fn from_select(query: &SelectQuery) -> Self {
        let specification = query.specification.clone();
        let referenced = specification.referenced_relations();
        let specification = specification.retain_joins(|join| {
            join.kind == JoinKind::Inner || referenced.contains(join.relation.as_str())
        });
        Self {
            entity: query.entity.clone(),
            specification,
            deadline: query.options.deadline,
        }
    }
}

/// One assignment of a bulk update
#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    /// `field = value`
    Set {
        /// Target field
        field: String,
        /// New value
        value: Value,
    },
    /// `field = field + by`
    Increment {
        /// Target field
        field: String,
        /// Amount to add
        by: i64,
    },
}

impl Assignment {
    /// `field = value`
    pub fn set(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Set {
            field: field.into(),
            value: value.into(),
        }
    }

    /// `field = field + by`
    pub fn increment(field: impl Into<String>, by: i64) -> Self {
        Self::Increment {
            field: field.into(),
            by,
        }
    }

    /// The field this assignment writes
    pub fn field(&self) -> &str {
        match self {
            Self::Set { field, .. } | Self::Increment { field, .. } => field,
        }
    }
}

/// What a bulk statement does to the matched rows
#[derive(Debug, Clone, PartialEq)]
pub enum BulkAction {
    /// Apply assignments
    Update(Vec<Assignment>),
    /// Remove rows
    Delete,
}

/// A bulk update or delete
///
/// Bulk statements write straight to the store and bypass the session cache.
/// Unless [`BulkUpdate::keep_cache`] is used, the store invalidates its cache
/// afterwards; otherwise previously loaded copies stay stale.
///
/// # Example
///
/// ```rust
/// use acton_query::repository::{Assignment, BulkUpdate, Filter};
/// use acton_query::specification::build_specification;
///
/// let spec = build_specification(&[Filter::gte("age", 20)], &[]).unwrap();
/// let statement = BulkUpdate::update("member", spec, vec![Assignment::increment("age", 1)]);
/// assert!(statement.clear_cache);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BulkUpdate {
    /// Entity to modify
    pub entity: String,
    /// Rows to modify
    pub specification: Specification,
    /// Update or delete
    pub action: BulkAction,
    /// Invalidate the session cache afterwards
    pub clear_cache: bool,
    /// Caller deadline
    pub deadline: Option<Instant>,
}

impl BulkUpdate {
    /// Update matched rows
    pub fn update(
        entity: impl Into<String>,
        specification: Specification,
        assignments: Vec<Assignment>,
    ) -> Self {
        Self {
            entity: entity.into(),
            specification,
            action: BulkAction::Update(assignments),
            clear_cache: true,
            deadline: None,
        }
    }

    /// Delete matched rows
    pub fn delete(entity: impl Into<String>, specification: Specification) -> Self {
        Self {
            entity: entity.into(),
            specification,
            action: BulkAction::Delete,
            clear_cache: true,
            deadline: None,
        }
    }

    /// Builder: leave the session cache alone
    #[must_use]
    pub fn keep_cache(mut self) -> Self {
        self.clear_cache = false;
        self
    }

    /// Builder: absolute deadline
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// A raw query string run as-is by the store
///
/// This bypasses the specification builder: parameters are bound
/// positionally, and nothing checks the text against the schema.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeQuery {
    /// Entity the returned rows belong to
    pub entity: String,
    /// Store-native query text with positional parameters
    pub sql: String,
    /// Positional parameter values
    pub params: Vec<Value>,
}

impl NativeQuery {
    /// A native query without parameters
    pub fn new(entity: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Builder: append a positional parameter
    #[must_use]
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::Filter;
    use crate::specification::{JoinDeclaration, SpecificationBuilder};

    #[test]
    fn test_count_query_drops_unreferenced_left_joins() {
        let spec = SpecificationBuilder::new()
            .join(JoinDeclaration::left("team"))
            .build(&[Filter::gte("age", 20), Filter::eq("team.name", "")])
            .unwrap()
            .with_join(JoinDeclaration::left("team"));
        let query = SelectQuery::new("member")
            .with_specification(spec)
            .with_sort(Sort::asc("team.name"))
            .with_limit(3)
            .with_offset(3);

        let count = CountQuery::from_select(&query);
        assert!(count.specification.joins().is_empty());
        assert_eq!(count.specification.predicate(), query.specification.predicate());
    }

    #[test]
    fn test_count_query_keeps_inner_and_referenced_joins() {
        let spec = SpecificationBuilder::new()
            .join(JoinDeclaration::left("team"))
            .build(&[Filter::eq("team.name", "teamA")])
            .unwrap()
            .with_join(JoinDeclaration::inner("club"));
        let query = SelectQuery::new("member").with_specification(spec);
        let count = CountQuery::from_select(&query);
        assert_eq!(count.specification.joins().len(), 2);
    }

    #[test]
    fn test_fetch_hints_merge_with_selection() {
        let query = SelectQuery::new("member")
            .fetch("team")
            .fetch("team")
            .with_selection(Selection {
                columns: None,
                fetch: vec!["team".to_string(), "club".to_string()],
            });
        assert_eq!(query.relations_to_fetch(), vec!["team", "club"]);
    }

    #[test]
    fn test_trimmed_or_read_only_rows_are_not_cached() {
        let query = SelectQuery::new("member");
        assert!(query.caches_fetched_rows());
        assert!(!query.clone().read_only().caches_fetched_rows());

        let trimmed = query.with_selection(Selection {
            columns: Some(["username".to_string()].into_iter().collect()),
            fetch: Vec::new(),
        });
        assert!(!trimmed.caches_fetched_rows());
    }

    #[test]
    fn test_bulk_update_defaults_to_clearing_cache() {
        let statement = BulkUpdate::delete("member", Specification::all());
        assert!(statement.clear_cache);
        assert!(!statement.keep_cache().clear_cache);
        assert_eq!(Assignment::increment("age", 1).field(), "age");
    }
}
