//! PostgreSQL session over a `sqlx` transaction
//!
//! Statements come from [`SqlRenderer`]. Rows are fetched as
//! `row_to_json(t)` so one decoding path serves every entity. Lock waits and
//! deadlines are enforced by the server through `SET LOCAL lock_timeout` and
//! `statement_timeout`; their SQLSTATEs map to `LockTimeout` and `Cancelled`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::locks::RowKey;
use super::sql::{session_settings, statement_timeout, SqlRenderer};
use crate::config::StoreConfig;
use crate::record::{Persistable, Record, RecordId};
use crate::repository::{
    resolve_all, BulkUpdate, CountQuery, NativeQuery, QueryError, QueryOperation, QueryResult,
    RecordStore, RelationLoader, SelectQuery,
};
use crate::schema::Schema;

type Tx = Transaction<'static, Postgres>;

/// A transaction-scoped PostgreSQL session
///
/// Locks taken by queries are held until [`commit`](Self::commit) or
/// [`rollback`](Self::rollback); after either the session is closed and
/// further calls fail with `StaleReference`.
pub struct PgSession {
    id: Uuid,
    schema: Arc<Schema>,
    tx: Mutex<Option<Tx>>,
    cache: DashMap<RowKey, Record>,
    query_timeout: Option<Duration>,
    clear_cache_after_bulk: bool,
}

impl std::fmt::Debug for PgSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSession")
            .field("id", &self.id)
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl PgSession {
    /// Begin a transaction on `pool` and apply the store settings to it
    pub async fn begin(pool: &PgPool, schema: Arc<Schema>, config: &StoreConfig) -> QueryResult<Self> {
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| QueryError::from(e).with_operation(QueryOperation::Execute))?;

        for setting in session_settings(config) {
            sqlx::query(&setting)
                .execute(&mut *tx)
                .await
                .map_err(|e| QueryError::from(e).with_operation(QueryOperation::Execute))?;
        }

        let session = Self {
            id: Uuid::now_v7(),
            schema,
            tx: Mutex::new(Some(tx)),
            cache: DashMap::new(),
            query_timeout: config.query_timeout(),
            clear_cache_after_bulk: config.clear_cache_after_bulk,
        };
        tracing::debug!(session = %session.id, "postgres session opened");
        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Commit the transaction and close the session
    pub async fn commit(&self) -> QueryResult<()> {
        let tx = self.take_transaction().await?;
        tx.commit().await.map_err(QueryError::from)?;
        tracing::debug!(session = %self.id, "postgres session committed");
        Ok(())
    }

    /// Roll the transaction back and close the session
    pub async fn rollback(&self) -> QueryResult<()> {
        let tx = self.take_transaction().await?;
        tx.rollback().await.map_err(QueryError::from)?;
        tracing::debug!(session = %self.id, "postgres session rolled back");
        Ok(())
    }

    async fn take_transaction(&self) -> QueryResult<Tx> {
        let tx = self.tx.lock().await.take();
        self.cache.clear();
        tx.ok_or_else(|| self.closed(QueryOperation::Execute))
    }

    fn closed(&self, operation: QueryOperation) -> QueryError {
        QueryError::stale_reference(operation, format!("Session {} is closed", self.id))
    }

    fn renderer(&self) -> SqlRenderer<'_> {
        SqlRenderer::new(&self.schema)
    }

    /// Run `sql` and collect its rows as JSON objects
    ///
    /// A caller deadline narrows `statement_timeout` for this statement only.
    async fn fetch_rows(
        &self,
        operation: QueryOperation,
        sql: &str,
        deadline: Option<Instant>,
        params: &[Value],
    ) -> QueryResult<Vec<Value>> {
        let wrapped = if sql.trim_start().to_ascii_uppercase().starts_with("SELECT") {
            format!("SELECT row_to_json(t) FROM ({}) t", sql)
        } else {
            format!("WITH t AS ({}) SELECT row_to_json(t) FROM t", sql)
        };

        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(|| self.closed(operation))?;
        let narrowed = self.narrow_timeout(tx, operation, deadline).await?;

        let mut query = sqlx::query_scalar::<_, Value>(&wrapped);
        for param in params {
            query = match param {
                Value::Null => query.bind(None::<String>),
                Value::Bool(b) => query.bind(*b),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => query.bind(i),
                    None => query.bind(n.as_f64()),
                },
                Value::String(s) => query.bind(s.clone()),
                other => query.bind(other.clone()),
            };
        }
        let rows = query
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| QueryError::from(e).with_operation(operation))?;

        if narrowed {
            self.restore_timeout(tx).await?;
        }
        tracing::debug!(session = %self.id, %operation, rows = rows.len(), "postgres fetch");
        Ok(rows)
    }

    /// Statement that returns no rows; yields the affected row count
    async fn run_statement(
        &self,
        operation: QueryOperation,
        sql: &str,
        deadline: Option<Instant>,
    ) -> QueryResult<u64> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(|| self.closed(operation))?;
        let narrowed = self.narrow_timeout(tx, operation, deadline).await?;
        let affected = sqlx::query(sql)
            .execute(&mut **tx)
            .await
            .map_err(|e| QueryError::from(e).with_operation(operation))?
            .rows_affected();
        if narrowed {
            self.restore_timeout(tx).await?;
        }
        Ok(affected)
    }

    async fn narrow_timeout(
        &self,
        tx: &mut Tx,
        operation: QueryOperation,
        deadline: Option<Instant>,
    ) -> QueryResult<bool> {
        let Some(deadline) = deadline else {
            return Ok(false);
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(QueryError::cancelled(operation, "Deadline expired before the query ran"));
        }
        sqlx::query(&statement_timeout(Some(remaining)))
            .execute(&mut **tx)
            .await
            .map_err(|e| QueryError::from(e).with_operation(operation))?;
        Ok(true)
    }

    async fn restore_timeout(&self, tx: &mut Tx) -> QueryResult<()> {
        sqlx::query(&statement_timeout(self.query_timeout))
            .execute(&mut **tx)
            .await
            .map_err(QueryError::from)?;
        Ok(())
    }

    fn remember(&self, record: Record) -> Record {
        let key = (record.entity().to_string(), record.id().clone());
        self.cache.entry(key).or_insert(record).value().clone()
    }

    fn decode_all(&self, entity: &str, rows: Vec<Value>) -> QueryResult<Vec<Record>> {
        let renderer = self.renderer();
        rows.into_iter()
            .map(|row| renderer.decode(entity, row))
            .collect()
    }
}

impl RecordStore for PgSession {
    async fn query(&self, query: &SelectQuery) -> QueryResult<Vec<Record>> {
        let sql = self.renderer().select(query)?;
        let rows = self
            .fetch_rows(QueryOperation::Select, &sql, query.options.deadline, &[])
            .await?;
        let mut records = self.decode_all(&query.entity, rows)?;
        if query.caches_fetched_rows() {
            records = records
                .into_iter()
                .map(|record| self.remember(record))
                .collect();
        }

        for relation in query.relations_to_fetch() {
            resolve_all(self, &mut records, &relation).await?;
        }
        if let Some(selection) = &query.options.selection {
            for record in &mut records {
                record.retain_fields(|name| selection.keeps(name));
            }
        }
        Ok(records)
    }

    async fn count(&self, query: &CountQuery) -> QueryResult<u64> {
        let sql = self.renderer().count(query)?;
        let mut guard = self.tx.lock().await;
        let tx = guard
            .as_mut()
            .ok_or_else(|| self.closed(QueryOperation::Count))?;
        let narrowed = self
            .narrow_timeout(tx, QueryOperation::Count, query.deadline)
            .await?;
        let total: i64 = sqlx::query_scalar(&sql)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| QueryError::from(e).with_operation(QueryOperation::Count))?;
        if narrowed {
            self.restore_timeout(tx).await?;
        }
        tracing::debug!(session = %self.id, entity = %query.entity, total, "postgres count");
        self.renderer().decode_count(&query.entity, total)
    }

    async fn execute(&self, statement: &BulkUpdate) -> QueryResult<u64> {
        let sql = self.renderer().bulk(statement)?;
        let affected = self
            .run_statement(QueryOperation::Execute, &sql, statement.deadline)
            .await?;

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
        Ok(affected)
    }

    fn invalidate_cache(&self) {
        let dropped = self.cache.len();
        self.cache.clear();
        tracing::debug!(session = %self.id, dropped, "session cache invalidated");
    }

    async fn find_by_id(&self, entity: &str, id: &RecordId) -> QueryResult<Option<Record>> {
        let key = (entity.to_string(), id.clone());
        if let Some(cached) = self.cache.get(&key) {
            return Ok(Some(cached.value().clone()));
        }
        let found = self.batch_load(entity, std::slice::from_ref(id)).await?;
        Ok(found.into_values().next())
    }

    async fn save(&self, record: Record) -> QueryResult<Record> {
        let renderer = self.renderer();
        let sql = if record.is_new() {
            renderer.insert(&record)?
        } else {
            renderer.update(&record)?
        };
        let row = self
            .fetch_rows(QueryOperation::Save, &sql, None, &[])
            .await?
            .pop()
            .ok_or_else(|| {
                QueryError::not_found(record.entity(), record.id().to_string())
                    .with_operation(QueryOperation::Save)
            })?;

        let mut saved = renderer.decode(record.entity(), row)?;
        // keep relations the caller already resolved
        for (name, relation) in record.relations() {
            if let (Some(related), Some(target)) = (relation.get(), saved.relation_mut(name)) {
                target.resolve_with(related.clone());
            }
        }
        self.cache
            .insert((saved.entity().to_string(), saved.id().clone()), saved.clone());
        Ok(saved)
    }

    async fn delete(&self, entity: &str, id: &RecordId) -> QueryResult<bool> {
        let sql = self.renderer().delete(entity, id)?;
        let affected = self
            .run_statement(QueryOperation::Delete, &sql, None)
            .await?;
        self.cache.remove(&(entity.to_string(), id.clone()));
        Ok(affected > 0)
    }

    async fn native(&self, query: &NativeQuery) -> QueryResult<Vec<Record>> {
        self.schema
            .entity(&query.entity)
            .map_err(|e| e.with_operation(QueryOperation::Native))?;
        tracing::debug!(session = %self.id, entity = %query.entity, params = query.params.len(), "native query");
        let rows = self
            .fetch_rows(QueryOperation::Native, &query.sql, None, &query.params)
            .await?;
        Ok(self
            .decode_all(&query.entity, rows)?
            .into_iter()
            .map(|record| self.remember(record))
            .collect())
    }
}

impl RelationLoader for PgSession {
    async fn load_one(&self, record: &Record, relation: &str) -> QueryResult<Option<Record>> {
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
        if self.tx.lock().await.is_none() {
            return Err(self.closed(QueryOperation::Resolve));
        }

        let mut found = HashMap::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in ids {
            match self.cache.get(&(entity.to_string(), id.clone())) {
                Some(cached) => {
                    found.insert(id.clone(), cached.value().clone());
                }
                None => missing.push(id.clone()),
            }
        }
        if !missing.is_empty() {
            let sql = self.renderer().find_by_ids(entity, &missing)?;
            let rows = self
                .fetch_rows(QueryOperation::Resolve, &sql, None, &[])
                .await?;
            for record in self.decode_all(entity, rows)? {
                let record = self.remember(record);
                found.insert(record.id().clone(), record);
            }
        }
        Ok(found)
    }
}
