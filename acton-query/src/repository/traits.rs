//! Store adapter traits
//!
//! This module provides the seams between the query layer and a record
//! store, using RPITIT (Return Position Impl Trait In Traits).
//!
//! - [`RecordStore`]: bounded queries, counts, bulk statements and single-record CRUD
//! - [`RelationLoader`]: lazy relation resolution, batched to avoid N+1 queries
//!
//! # Example
//!
//! ```rust,ignore
//! use acton_query::repository::{RecordStore, SelectQuery};
//!
//! async fn adults<S: RecordStore>(store: &S) -> QueryResult<Vec<Record>> {
//!     let spec = build_specification(&[Filter::gte("age", 18)], &[])?;
//!     store.query(&SelectQuery::new("member").with_specification(spec)).await
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::future::Future;

use super::error::QueryError;
use super::query::{BulkUpdate, CountQuery, NativeQuery, SelectQuery};
use crate::record::{Record, RecordId};

/// Result type for query operations
pub type QueryResult<T> = std::result::Result<T, QueryError>;

/// A session against a record store
///
/// Implementations own the only shared state of the query layer: the
/// connection or transaction, the cache of loaded records, and held locks.
/// Every method must be callable from concurrent tasks.
pub trait RecordStore: Send + Sync {
    /// Run a bounded content query
    ///
    /// Returns rows in sort order. An expired deadline yields `Cancelled` and
    /// no rows; a lock wait past the store's timeout yields `LockTimeout`.
    fn query(&self, query: &SelectQuery) -> impl Future<Output = QueryResult<Vec<Record>>> + Send;

    /// Count rows matching a specification
    fn count(&self, query: &CountQuery) -> impl Future<Output = QueryResult<u64>> + Send;

    /// Run a bulk update or delete and return the number of affected rows
    ///
    /// Bulk statements bypass the session cache. Cached copies of affected
    /// records are stale afterwards unless the statement clears the cache,
    /// which it does by default.
    fn execute(&self, statement: &BulkUpdate) -> impl Future<Output = QueryResult<u64>> + Send;

    /// Drop every cached record so later reads go to the store
    fn invalidate_cache(&self);

    /// Find a record by id
    ///
    /// Returns `Ok(None)` when no record has that id.
    fn find_by_id(
        &self,
        entity: &str,
        id: &RecordId,
    ) -> impl Future<Output = QueryResult<Option<Record>>> + Send;

    /// Insert a new record or merge an existing one
    ///
    /// New records (see [`Persistable::is_new`]) get their creation stamp here.
    ///
    /// [`Persistable::is_new`]: crate::record::Persistable::is_new
    fn save(&self, record: Record) -> impl Future<Output = QueryResult<Record>> + Send;

    /// Delete a record by id
    ///
    /// Returns `true` if the record was deleted, `false` if it didn't exist.
    fn delete(&self, entity: &str, id: &RecordId) -> impl Future<Output = QueryResult<bool>> + Send;

    /// Run a raw native query
    ///
    /// Stores without a native query language return `Unsupported`.
    fn native(&self, query: &NativeQuery)
        -> impl Future<Output = QueryResult<Vec<Record>>> + Send;
}

/// Resolution of many-to-one relations through a live session
///
/// Resolving after the owning session closed fails with `StaleReference`.
pub trait RelationLoader: Send + Sync {
    /// Load the target of `relation` on `record`
    ///
    /// Returns `None` when the record has no such reference or the target row
    /// no longer exists.
    fn load_one(
        &self,
        record: &Record,
        relation: &str,
    ) -> impl Future<Output = QueryResult<Option<Record>>> + Send;

    /// Batch load records of `entity` by id
    ///
    /// This is the key method for preventing N+1 queries: callers collect all
    /// needed ids and load them at once.
    fn batch_load(
        &self,
        entity: &str,
        ids: &[RecordId],
    ) -> impl Future<Output = QueryResult<HashMap<RecordId, Record>>> + Send;
}

/// Resolve `relation` on a single record in place
pub async fn resolve<L>(loader: &L, record: &mut Record, relation: &str) -> QueryResult<()>
where
    L: RelationLoader,
{
    if record.relation(relation).map_or(true, |r| r.is_resolved()) {
        return Ok(());
    }
    if let Some(target) = loader.load_one(record, relation).await? {
        if let Some(reference) = record.relation_mut(relation) {
            reference.resolve_with(target);
        }
    }
    Ok(())
}

/// Resolve `relation` on every record, one batch per target entity
///
/// Already resolved references are left as they are. References whose target
/// row is gone stay unresolved.
pub async fn resolve_all<L>(loader: &L, records: &mut [Record], relation: &str) -> QueryResult<()>
where
    L: RelationLoader,
{
    let mut wanted: BTreeMap<String, Vec<RecordId>> = BTreeMap::new();
    for record in records.iter() {
        if let Some(reference) = record.relation(relation) {
            if !reference.is_resolved() {
                let ids = wanted.entry(reference.target().to_string()).or_default();
                if !ids.contains(reference.id()) {
                    ids.push(reference.id().clone());
                }
            }
        }
    }

    for (target, ids) in wanted {
        tracing::debug!(relation, target = %target, count = ids.len(), "batch loading relation");
        let loaded = loader.batch_load(&target, &ids).await?;
        for record in records.iter_mut() {
            if let Some(reference) = record.relation_mut(relation) {
                if reference.is_resolved() || reference.target() != target {
                    continue;
                }
                if let Some(found) = loaded.get(reference.id()) {
                    reference.resolve_with(found.clone());
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_query_result_type() {
        let ok_result: QueryResult<i32> = Ok(42);
        assert!(ok_result.is_ok());

        let err_result: QueryResult<i32> = Err(QueryError::not_found("member", "1"));
        assert!(err_result.is_err());
    }

    struct TeamLoader {
        batches: AtomicUsize,
    }

    impl RelationLoader for TeamLoader {
        async fn load_one(&self, record: &Record, relation: &str) -> QueryResult<Option<Record>> {
            Ok(record
                .relation(relation)
                .map(|r| Record::new("team", r.id().clone()).with_field("name", "loaded")))
        }

        async fn batch_load(
            &self,
            entity: &str,
            ids: &[RecordId],
        ) -> QueryResult<HashMap<RecordId, Record>> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            Ok(ids
                .iter()
                .filter(|id| **id != RecordId::Int(99))
                .map(|id| {
                    (
                        id.clone(),
                        Record::new(entity, id.clone()).with_field("name", format!("team{}", id)),
                    )
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_resolve_all_batches_per_target() {
        let loader = TeamLoader {
            batches: AtomicUsize::new(0),
        };
        let mut records = vec![
            Record::new("member", 1).with_relation("team", "team", 1),
            Record::new("member", 2).with_relation("team", "team", 2),
            Record::new("member", 3).with_relation("team", "team", 1),
            Record::new("member", 4),
            Record::new("member", 5).with_relation("team", "team", 99),
        ];

        resolve_all(&loader, &mut records, "team").await.unwrap();

        assert_eq!(loader.batches.load(Ordering::SeqCst), 1);
        assert_eq!(
            records[2].path_value("team.name").unwrap(),
            serde_json::json!("team1")
        );
        assert!(records[3].relation("team").is_none());
        assert!(!records[4].relation("team").unwrap().is_resolved());
    }

    #[tokio::test]
    async fn test_resolve_single_record() {
        let loader = TeamLoader {
            batches: AtomicUsize::new(0),
        };
        let mut record = Record::new("member", 1).with_relation("team", "team", 7);
        resolve(&loader, &mut record, "team").await.unwrap();
        assert_eq!(
            record.path_value("team.name").unwrap(),
            serde_json::json!("loaded")
        );
    }
}
