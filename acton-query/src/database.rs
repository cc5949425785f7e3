//! PostgreSQL connections for [`PgSession`]s
//!
//! [`Database::connect`] opens the pool described by the `[database]` section
//! and keeps the schema and store settings every session needs, so callers
//! only ask for [`Database::session`].

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

use crate::config::{Config, DatabaseConfig, StoreConfig};
use crate::error::Result;
use crate::repository::{QueryError, QueryOperation, QueryResult};
use crate::schema::Schema;
use crate::store::PgSession;

/// A PostgreSQL pool bound to a schema and store settings
#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
    schema: Arc<Schema>,
    store: StoreConfig,
}

impl Database {
    /// Connect with the `[database]` section of `config`
    ///
    /// Transient failures (refused connections, pool timeouts) are retried
    /// with exponential backoff up to `max_retries` times. Anything else fails
    /// at once.
    pub async fn connect(config: &Config, schema: Schema) -> Result<Self> {
        let database = config.database.as_ref().ok_or_else(|| {
            QueryError::configuration(QueryOperation::Execute, "No [database] section configured")
        })?;
        let options = connect_options(database, &config.service.name, &config.store)?;
        let pool = connect_with_backoff(database, options).await?;
        Ok(Self {
            pool,
            schema: Arc::new(schema),
            store: config.store.clone(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Begin a transaction-scoped session with the configured lock and
    /// query timeouts
    pub async fn session(&self) -> QueryResult<PgSession> {
        PgSession::begin(&self.pool, Arc::clone(&self.schema), &self.store).await
    }
}

/// Connection options from the database URL, tagged with the service name
///
/// Every pooled connection starts with the store's lock timeout, so
/// statements run straight on [`Database::pool`] wait no longer than session
/// queries do.
fn connect_options(
    database: &DatabaseConfig,
    service: &str,
    store: &StoreConfig,
) -> Result<PgConnectOptions> {
    let options: PgConnectOptions = database.url.parse().map_err(|e: sqlx::Error| {
        QueryError::configuration(
            QueryOperation::Execute,
            format!("Invalid database URL: {}", e),
        )
    })?;
    Ok(options
        .application_name(service)
        .options([("lock_timeout", format!("{}ms", store.lock_timeout_ms))]))
}

async fn connect_with_backoff(database: &DatabaseConfig, options: PgConnectOptions) -> Result<PgPool> {
    let host = options.get_host().to_string();
    let name = options.get_database().unwrap_or_default().to_string();
    let base_delay = Duration::from_secs(database.retry_delay_secs);
    let mut attempt: u32 = 0;

    loop {
        let connected = PgPoolOptions::new()
            .max_connections(database.max_connections)
            .min_connections(database.min_connections)
            .acquire_timeout(Duration::from_secs(database.connection_timeout_secs))
            .connect_with(options.clone())
            .await
            .map_err(|e| QueryError::from(e).with_operation(QueryOperation::Execute));

        let error = match connected {
            Ok(pool) => {
                tracing::info!(
                    %host,
                    database = %name,
                    attempts = attempt + 1,
                    max_connections = database.max_connections,
                    "database pool ready"
                );
                return Ok(pool);
            }
            Err(error) => error,
        };

        attempt += 1;
        if !error.is_retriable() || attempt > database.max_retries {
            tracing::error!(%host, database = %name, attempts = attempt, %error, "database unreachable");
            return Err(error.into());
        }
        let delay = base_delay * 2_u32.saturating_pow(attempt - 1);
        tracing::warn!(%host, database = %name, attempt, ?delay, %error, "database connection failed, retrying");
        tokio::time::sleep(delay).await;
    }
}
