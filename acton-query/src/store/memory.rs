//! In-memory record store
//!
//! [`MemoryDatabase`] holds the tables and the row lock table; it is cheap to
//! clone and shared by every session. A [`MemorySession`] is the unit of
//! work: it keeps an identity map of the records it has loaded and holds its
//! row locks until it is closed or dropped.
//!
//! # Example
//!
//! ```rust,ignore
//! let db = MemoryDatabase::new(schema);
//! let session = db.session();
//! session.save(Record::new("team", 1).with_field("name", "teamA")).await?;
//! let teams = session.query(&SelectQuery::new("team")).await?;
//! session.close();
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use super::eval::{self, RowView};
use super::locks::{LockTable, RowKey, Strength};
use super::{validate_bulk, validate_select, validate_specification};
use crate::config::StoreConfig;
use crate::record::{Persistable, Record, RecordId, Relation};
use crate::repository::{
    resolve_all, Assignment, BulkAction, BulkUpdate, CountQuery, LockMode, NativeQuery,
    QueryError, QueryOperation, QueryResult, RecordStore, RelationLoader, SelectQuery, Sort,
};
use crate::schema::{EntityModel, Schema};
use crate::specification::{JoinKind, Specification};

type Table = BTreeMap<RecordId, Record>;

#[derive(Debug)]
struct Shared {
    schema: Schema,
    tables: RwLock<HashMap<String, Table>>,
    locks: LockTable,
}

/// Shared in-process tables
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
}

impl MemoryDatabase {
    pub fn new(schema: Schema) -> Self {
        Self {
            shared: Arc::new(Shared {
                schema,
                tables: RwLock::new(HashMap::new()),
                locks: LockTable::default(),
            }),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.shared.schema
    }

    /// Open a session with default store settings
    pub fn session(&self) -> MemorySession {
        self.session_with(&StoreConfig::default())
    }

    /// Open a session with the given lock timeout, query timeout and cache policy
    pub fn session_with(&self, config: &StoreConfig) -> MemorySession {
        let session = MemorySession {
            id: Uuid::now_v7(),
            shared: Arc::clone(&self.shared),
            open: AtomicBool::new(true),
            cache: DashMap::new(),
            lock_timeout: config.lock_timeout(),
            query_timeout: config.query_timeout(),
            clear_cache_after_bulk: config.clear_cache_after_bulk,
        };
        tracing::debug!(session = %session.id, "session opened");
        session
    }

    /// Number of stored rows of `entity`
    pub fn row_count(&self, entity: &str) -> usize {
        self.shared
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity)
            .map_or(0, BTreeMap::len)
    }
}

/// A unit of work against a [`MemoryDatabase`]
///
/// Reads go through an identity map: once a record is loaded, later reads in
/// the same session return the cached copy until the cache is invalidated.
pub struct MemorySession {
    id: Uuid,
    shared: Arc<Shared>,
    open: AtomicBool,
    cache: DashMap<RowKey, Record>,
    lock_timeout: Duration,
    query_timeout: Option<Duration>,
    clear_cache_after_bulk: bool,
}

impl std::fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySession")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl MemorySession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// End the session: release its locks and forget cached records
    ///
    /// Relations left unresolved can no longer be loaded through it.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.shared.locks.release_all(self.id);
            self.cache.clear();
            tracing::debug!(session = %self.id, "session closed");
        }
    }

    fn ensure_open(&self, operation: QueryOperation) -> QueryResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(QueryError::stale_reference(
                operation,
                format!("Session {} is closed", self.id),
            ))
        }
    }

    fn read_tables(&self) -> RwLockReadGuard<'_, HashMap<String, Table>> {
        self.shared
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_tables(&self) -> RwLockWriteGuard<'_, HashMap<String, Table>> {
        self.shared
            .tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `work` under the query's deadline, or the session default
    async fn within_deadline<T, F>(
        &self,
        operation: QueryOperation,
        deadline: Option<Instant>,
        work: F,
    ) -> QueryResult<T>
    where
        F: Future<Output = QueryResult<T>>,
    {
        let deadline = deadline.or_else(|| self.query_timeout.map(|timeout| Instant::now() + timeout));
        let Some(deadline) = deadline else {
            return work.await;
        };
        if Instant::now() >= deadline {
            return Err(QueryError::cancelled(operation, "Deadline expired before the query ran"));
        }
        match tokio::time::timeout_at(deadline, work).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(session = %self.id, %operation, "query cancelled at deadline");
                Err(QueryError::cancelled(operation, "Deadline expired"))
            }
        }
    }

    async fn lock_rows(
        &self,
        operation: QueryOperation,
        keys: &[RowKey],
        strength: Strength,
    ) -> QueryResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        if self
            .shared
            .locks
            .acquire(self.id, keys, strength, self.lock_timeout)
            .await
        {
            return Ok(());
        }
        tracing::warn!(
            session = %self.id,
            rows = keys.len(),
            timeout_ms = self.lock_timeout.as_millis() as u64,
            "lock wait timed out"
        );
        Err(QueryError::lock_timeout(
            operation,
            format!(
                "Could not lock {} row(s) within {:?}",
                keys.len(),
                self.lock_timeout
            ),
        ))
    }

    /// Rows of `entity` matching `specification`, in `sort` order then id order
    fn select_rows(&self, entity: &str, specification: &Specification, sort: &Sort) -> Vec<Record> {
        let tables = self.read_tables();
        let Some(table) = tables.get(entity) else {
            return Vec::new();
        };

        let mut rows: Vec<(&Record, BTreeMap<String, Option<Record>>)> = Vec::new();
        'rows: for record in table.values() {
            let mut related = BTreeMap::new();
            for join in specification.joins() {
                let partner = record.relation(&join.relation).and_then(|reference| {
                    tables
                        .get(reference.target())
                        .and_then(|target| target.get(reference.id()))
                        .cloned()
                });
                if partner.is_none() && join.kind == JoinKind::Inner {
                    continue 'rows;
                }
                related.insert(join.relation.clone(), partner);
            }
            let row = RowView {
                record,
                related: &related,
            };
            if specification
                .predicate()
                .map_or(true, |predicate| eval::matches(predicate, &row))
            {
                rows.push((record, related));
            }
        }

        if !sort.is_unsorted() {
            rows.sort_by(|(a, a_related), (b, b_related)| {
                eval::compare_rows(
                    sort,
                    &RowView {
                        record: a,
                        related: a_related,
                    },
                    &RowView {
                        record: b,
                        related: b_related,
                    },
                )
            });
        }

        rows.into_iter().map(|(record, _)| record.clone()).collect()
    }

    fn reload(&self, keys: &[RowKey]) -> Vec<Record> {
        let tables = self.read_tables();
        keys.iter()
            .filter_map(|(entity, id)| tables.get(entity).and_then(|table| table.get(id)).cloned())
            .collect()
    }

    /// The cached copy of `record` if there is one, else cache `record`
    fn remember(&self, record: Record) -> Record {
        let key = (record.entity().to_string(), record.id().clone());
        self.cache.entry(key).or_insert(record).value().clone()
    }

    async fn run_select(&self, query: &SelectQuery) -> QueryResult<Vec<Record>> {
        validate_select(&self.shared.schema, query)?;

        let offset = usize::try_from(query.offset).unwrap_or(usize::MAX);
        let limit = query
            .limit
            .map_or(usize::MAX, |limit| usize::try_from(limit).unwrap_or(usize::MAX));
        let mut rows: Vec<Record> = self
            .select_rows(&query.entity, &query.specification, &query.sort)
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect();

        let strength = match query.options.lock {
            LockMode::None => None,
            LockMode::SharedRead => Some(Strength::Shared),
            LockMode::ExclusiveWrite => Some(Strength::Exclusive),
        };
        if let Some(strength) = strength {
            let keys: Vec<RowKey> = rows
                .iter()
                .map(|row| (query.entity.clone(), row.id().clone()))
                .collect();
            self.lock_rows(QueryOperation::Select, &keys, strength).await?;

            // rows may have changed while we waited for the locks
            let still_matching: HashSet<RecordId> = self
                .select_rows(&query.entity, &query.specification, &Sort::unsorted())
                .into_iter()
                .map(|row| row.id().clone())
                .collect();
            let keys: Vec<RowKey> = keys
                .into_iter()
                .filter(|(_, id)| still_matching.contains(id))
                .collect();
            rows = self.reload(&keys);
        }

        let mut records: Vec<Record> = if query.options.read_only {
            rows
        } else {
            rows.into_iter().map(|row| self.remember(row)).collect()
        };

        for relation in query.relations_to_fetch() {
            resolve_all(self, &mut records, &relation).await?;
        }

        if let Some(selection) = &query.options.selection {
            for record in &mut records {
                record.retain_fields(|name| selection.keeps(name));
            }
        }

        tracing::debug!(
            session = %self.id,
            entity = %query.entity,
            rows = records.len(),
            offset = query.offset,
            limit = ?query.limit,
            "select"
        );
        Ok(records)
    }

    async fn run_bulk(&self, statement: &BulkUpdate) -> QueryResult<u64> {
        validate_bulk(&self.shared.schema, statement)?;

        let keys: Vec<RowKey> = self
            .select_rows(&statement.entity, &statement.specification, &Sort::unsorted())
            .into_iter()
            .map(|row| (statement.entity.clone(), row.id().clone()))
            .collect();
        self.lock_rows(QueryOperation::Execute, &keys, Strength::Exclusive)
            .await?;

        // rows may have changed while we waited for the locks
        let still_matching: HashSet<RecordId> = self
            .select_rows(&statement.entity, &statement.specification, &Sort::unsorted())
            .into_iter()
            .map(|row| row.id().clone())
            .collect();
        let keys: Vec<RowKey> = keys
            .into_iter()
            .filter(|(_, id)| still_matching.contains(id))
            .collect();

        let model = self.shared.schema.entity(&statement.entity)?;
        let affected = self.apply_bulk(model, statement, &keys)?;

        if statement.clear_cache && self.clear_cache_after_bulk {
            self.invalidate_cache();
        } else {
            tracing::warn!(
                session = %self.id,
                entity = %statement.entity,
                affected,
                "bulk statement left the session cache untouched; cached copies may be stale"
            );
        }

        tracing::debug!(session = %self.id, entity = %statement.entity, affected, "bulk statement");
        Ok(affected)
    }

    fn apply_bulk(
        &self,
        model: &EntityModel,
        statement: &BulkUpdate,
        keys: &[RowKey],
    ) -> QueryResult<u64> {
        let mut tables = self.write_tables();
        let Some(table) = tables.get_mut(&statement.entity) else {
            return Ok(0);
        };

        match &statement.action {
            BulkAction::Delete => Ok(keys
                .iter()
                .filter(|(_, id)| table.remove(id).is_some())
                .count() as u64),
            BulkAction::Update(assignments) => {
                let now = Utc::now();
                let mut updated = Vec::with_capacity(keys.len());
                for (_, id) in keys {
                    let Some(current) = table.get(id) else {
                        continue;
                    };
                    let mut next = current.clone();
                    for assignment in assignments {
                        apply_assignment(model, &mut next, assignment)?;
                    }
                    next.stamp_updated(now);
                    updated.push(next);
                }
                let affected = updated.len() as u64;
                for record in updated {
                    table.insert(record.id().clone(), record);
                }
                Ok(affected)
            }
        }
    }

    fn check_record(&self, model: &EntityModel, record: &Record) -> QueryResult<()> {
        for name in record.fields().keys() {
            if name == "id" || !model.has_field(name) {
                return Err(QueryError::configuration(
                    QueryOperation::Save,
                    format!("Entity '{}' has no attribute '{}'", model.name, name),
                ));
            }
        }
        for name in record.relations().keys() {
            if model.find_relation(name).is_none() {
                return Err(QueryError::configuration(
                    QueryOperation::Save,
                    format!("Entity '{}' has no relation '{}'", model.name, name),
                ));
            }
        }
        Ok(())
    }
}

fn apply_assignment(
    model: &EntityModel,
    record: &mut Record,
    assignment: &Assignment,
) -> QueryResult<()> {
    match assignment {
        Assignment::Set { field, value } => match model.find_relation(field) {
            Some(relation) if value.is_null() => {
                record.clear_relation(&relation.name);
            }
            Some(relation) => {
                let id = RecordId::from_value(value).ok_or_else(|| {
                    QueryError::configuration(
                        QueryOperation::Execute,
                        format!("'{}' is not an id for relation '{}'", value, field),
                    )
                })?;
                record.insert_relation(field.clone(), Relation::new(relation.target.clone(), id));
            }
            None => record.set(field.clone(), value.clone()),
        },
        Assignment::Increment { field, by } => match record.value(field) {
            Value::Null => {}
            Value::Number(n) => {
                let next = match n.as_i64() {
                    Some(current) => Value::from(current.saturating_add(*by)),
                    None => Value::from(n.as_f64().unwrap_or_default() + *by as f64),
                };
                record.set(field.clone(), next);
            }
            other => {
                return Err(QueryError::configuration(
                    QueryOperation::Execute,
                    format!("Cannot increment non-numeric '{}' ({})", field, other),
                ))
            }
        },
    }
    Ok(())
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if self.is_open() {
            self.shared.locks.release_all(self.id);
        }
    }
}

impl RecordStore for MemorySession {
    async fn query(&self, query: &SelectQuery) -> QueryResult<Vec<Record>> {
        self.ensure_open(QueryOperation::Select)?;
        self.within_deadline(
            QueryOperation::Select,
            query.options.deadline,
            self.run_select(query),
        )
        .await
    }

    async fn count(&self, query: &CountQuery) -> QueryResult<u64> {
        self.ensure_open(QueryOperation::Count)?;
        self.within_deadline(QueryOperation::Count, query.deadline, async {
            validate_specification(
                &self.shared.schema,
                &query.entity,
                &query.specification,
                QueryOperation::Count,
            )?;
            let total = self
                .select_rows(&query.entity, &query.specification, &Sort::unsorted())
                .len() as u64;
            tracing::debug!(session = %self.id, entity = %query.entity, total, "count");
            Ok(total)
        })
        .await
    }

    async fn execute(&self, statement: &BulkUpdate) -> QueryResult<u64> {
        self.ensure_open(QueryOperation::Execute)?;
        self.within_deadline(
            QueryOperation::Execute,
            statement.deadline,
            self.run_bulk(statement),
        )
        .await
    }

    fn invalidate_cache(&self) {
        let dropped = self.cache.len();
        self.cache.clear();
        tracing::debug!(session = %self.id, dropped, "session cache invalidated");
    }

    async fn find_by_id(&self, entity: &str, id: &RecordId) -> QueryResult<Option<Record>> {
        self.ensure_open(QueryOperation::FindById)?;
        self.shared
            .schema
            .entity(entity)
            .map_err(|e| e.with_operation(QueryOperation::FindById))?;

        let key = (entity.to_string(), id.clone());
        if let Some(cached) = self.cache.get(&key) {
            return Ok(Some(cached.value().clone()));
        }
        let found = self.reload(std::slice::from_ref(&key)).pop();
        Ok(found.map(|record| self.remember(record)))
    }

    async fn save(&self, record: Record) -> QueryResult<Record> {
        self.ensure_open(QueryOperation::Save)?;
        let model = self
            .shared
            .schema
            .entity(record.entity())
            .map_err(|e| e.with_operation(QueryOperation::Save))?;
        self.check_record(model, &record)?;

        let key = (record.entity().to_string(), record.id().clone());
        let is_new = record.is_new();
        if !is_new {
            self.lock_rows(
                QueryOperation::Save,
                std::slice::from_ref(&key),
                Strength::Exclusive,
            )
            .await?;
        }

        let mut record = record;
        let now = Utc::now();
        {
            let mut tables = self.write_tables();
            let table = tables.entry(key.0.clone()).or_default();
            if is_new {
                if table.contains_key(&key.1) {
                    return Err(QueryError::already_exists(&key.0, key.1.to_string())
                        .with_operation(QueryOperation::Save));
                }
                record.stamp_created(now);
            } else {
                let Some(existing) = table.get(&key.1) else {
                    return Err(QueryError::not_found(&key.0, key.1.to_string())
                        .with_operation(QueryOperation::Save));
                };
                record.set_created_at(existing.created_at());
                record.stamp_updated(now);
            }
            table.insert(key.1.clone(), record.detached());
        }

        tracing::debug!(session = %self.id, entity = %key.0, id = %key.1, inserted = is_new, "save");
        self.cache.insert(key, record.clone());
        Ok(record)
    }

    async fn delete(&self, entity: &str, id: &RecordId) -> QueryResult<bool> {
        self.ensure_open(QueryOperation::Delete)?;
        self.shared
            .schema
            .entity(entity)
            .map_err(|e| e.with_operation(QueryOperation::Delete))?;

        let key = (entity.to_string(), id.clone());
        self.lock_rows(
            QueryOperation::Delete,
            std::slice::from_ref(&key),
            Strength::Exclusive,
        )
        .await?;
        let removed = self
            .write_tables()
            .get_mut(entity)
            .and_then(|table| table.remove(id))
            .is_some();
        self.cache.remove(&key);
        tracing::debug!(session = %self.id, entity, %id, removed, "delete");
        Ok(removed)
    }

    async fn native(&self, _query: &NativeQuery) -> QueryResult<Vec<Record>> {
        self.ensure_open(QueryOperation::Native)?;
        Err(QueryError::unsupported(
            QueryOperation::Native,
            "The in-memory store has no native query language",
        ))
    }
}

impl RelationLoader for MemorySession {
    async fn load_one(&self, record: &Record, relation: &str) -> QueryResult<Option<Record>> {
        self.ensure_open(QueryOperation::Resolve)?;
        let Some(reference) = record.relation(relation) else {
            return Ok(None);
        };
        let mut loaded = self
            .batch_load(reference.target(), std::slice::from_ref(reference.id()))
            .await?;
        Ok(loaded.remove(reference.id()))
    }

    async fn batch_load(
        &self,
        entity: &str,
        ids: &[RecordId],
    ) -> QueryResult<HashMap<RecordId, Record>> {
        self.ensure_open(QueryOperation::Resolve)?;
        self.shared
            .schema
            .entity(entity)
            .map_err(|e| e.with_operation(QueryOperation::Resolve))?;

        let mut found = HashMap::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in ids {
            let key = (entity.to_string(), id.clone());
            match self.cache.get(&key) {
                Some(cached) => {
                    found.insert(id.clone(), cached.value().clone());
                }
                None => missing.push(key),
            }
        }
        let cached = found.len();
        for row in self.reload(&missing) {
            let row = self.remember(row);
            found.insert(row.id().clone(), row);
        }

        tracing::debug!(
            session = %self.id,
            entity,
            requested = ids.len(),
            cached,
            found = found.len(),
            "batch load"
        );
        Ok(found)
    }
}
