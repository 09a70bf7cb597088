use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use gatehouse_policy::{SqlDialect, SqlValue, StoreQuery, TableRef};
use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::PgPoolOptions;
use sqlx::{MySqlPool, PgConnection, PgPool};
use thiserror::Error;

use crate::app_config::AppConfig;

// Declared type of a column, without modifiers such as varchar length.
const COLUMN_TYPE_SQL: &str = "SELECT format_type(a.atttypid, NULL) FROM pg_attribute a \
     WHERE a.attrelid = to_regclass($1) AND a.attname = $2 AND NOT a.attisdropped";

// Text binds compared against these need no cast.
const TEXTUAL_TYPES: &[&str] = &["text", "character varying", "character", "bpchar", "name", "citext"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatastoreError {
    #[error("datastore `{0}` is not configured")]
    Unknown(String),

    #[error("datastore `{datastore}` is unavailable: {reason}")]
    Unavailable { datastore: String, reason: String },

    #[error("datastore `{datastore}` rejected the query: {reason}")]
    QueryFailed { datastore: String, reason: String },

    #[error("datastore `{datastore}` did not answer within {timeout_ms}ms")]
    Timeout { datastore: String, timeout_ms: u64 },
}

impl DatastoreError {
    pub fn code(&self) -> &'static str {
        match self {
            DatastoreError::Unknown(_) => "ERR_UNKNOWN_DATASTORE",
            DatastoreError::Unavailable { .. } => "ERR_SOURCE_UNAVAILABLE",
            DatastoreError::QueryFailed { .. } => "ERR_SOURCE_QUERY_FAILED",
            DatastoreError::Timeout { .. } => "ERR_SOURCE_TIMEOUT",
        }
    }
}

/// Executes translated existence queries against one store.
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn exists(&self, query: &StoreQuery) -> Result<bool, DatastoreError>;

    async fn ping(&self) -> bool;
}

pub type DatastoreMap = HashMap<String, Arc<dyn Datastore>>;

/// Text literals from policies reach Postgres as `text` parameters, which
/// do not compare against `integer`, `uuid` and the like. Parameters compared
/// against such a column are cast to its declared type, looked up once per
/// column and cached for the lifetime of the driver.
pub struct PostgresDatastore {
    alias: String,
    pool: PgPool,
    query_timeout: Duration,
    column_types: Mutex<HashMap<(TableRef, String), Option<String>>>,
}

impl PostgresDatastore {
    /// The pool connects lazily; an unreachable database surfaces on first
    /// query and in readiness, not at startup.
    pub fn connect_lazy(
        alias: &str,
        url: &str,
        max_connections: u32,
        query_timeout: Duration,
    ) -> Result<Self, DatastoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(query_timeout)
            .connect_lazy(url)
            .map_err(|err| DatastoreError::Unavailable {
                datastore: alias.to_string(),
                reason: err.to_string(),
            })?;

        Ok(Self {
            alias: alias.to_string(),
            pool,
            query_timeout,
            column_types: Mutex::new(HashMap::new()),
        })
    }

    fn unavailable(&self, err: sqlx::Error) -> DatastoreError {
        DatastoreError::Unavailable {
            datastore: self.alias.clone(),
            reason: err.to_string(),
        }
    }

    fn query_failed(&self, err: sqlx::Error) -> DatastoreError {
        DatastoreError::QueryFailed {
            datastore: self.alias.clone(),
            reason: err.to_string(),
        }
    }

    fn column_types(&self) -> MutexGuard<'_, HashMap<(TableRef, String), Option<String>>> {
        match self.column_types.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn column_type(
        &self,
        conn: &mut PgConnection,
        table: &TableRef,
        column: &str,
    ) -> Result<Option<String>, DatastoreError> {
        let key = (table.clone(), column.to_string());
        let cached = self.column_types().get(&key).cloned();
        if let Some(cached) = cached {
            return Ok(cached);
        }

        let declared = sqlx::query_scalar::<_, String>(COLUMN_TYPE_SQL)
            .bind(table.qualified(SqlDialect::Postgres))
            .bind(column)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|err| self.query_failed(err))?;
        tracing::debug!(
            datastore = %self.alias,
            table = %table.table,
            column,
            declared = declared.as_deref().unwrap_or("<unknown>"),
            "resolved column type"
        );

        self.column_types().insert(key, declared.clone());
        Ok(declared)
    }

    /// One entry per bind; `Some(type)` where the placeholder needs a cast.
    async fn casts(
        &self,
        conn: &mut PgConnection,
        query: &StoreQuery,
    ) -> Result<Vec<Option<String>>, DatastoreError> {
        let mut casts = vec![None; query.binds.len()];
        for (n, table, column) in query.text_comparisons() {
            casts[n - 1] = self
                .column_type(conn, table, column)
                .await?
                .filter(|declared| !TEXTUAL_TYPES.contains(&declared.as_str()));
        }
        Ok(casts)
    }

    async fn run(&self, query: &StoreQuery) -> Result<bool, DatastoreError> {
        let timeout_str = format!("{}ms", self.query_timeout.as_millis());
        let mut tx = self.pool.begin().await.map_err(|err| self.unavailable(err))?;

        sqlx::query("SELECT set_config('statement_timeout', $1, true)")
            .bind(&timeout_str)
            .execute(&mut *tx)
            .await
            .map_err(|err| self.unavailable(err))?;

        let casts = self.casts(&mut tx, query).await?;
        let sql = query.sql_with_casts(&casts);

        let mut statement = sqlx::query_scalar::<_, bool>(&sql);
        for value in &query.binds {
            statement = match value {
                SqlValue::Text(v) => statement.bind(v.as_str()),
                SqlValue::Int(v) => statement.bind(*v),
                SqlValue::Float(v) => statement.bind(*v),
                SqlValue::Bool(v) => statement.bind(*v),
            };
        }

        let allowed = statement
            .fetch_one(&mut *tx)
            .await
            .map_err(|err| self.query_failed(err))?;

        tx.commit().await.map_err(|err| self.unavailable(err))?;
        Ok(allowed)
    }
}

#[async_trait]
impl Datastore for PostgresDatastore {
    async fn exists(&self, query: &StoreQuery) -> Result<bool, DatastoreError> {
        // Covers pool acquisition too, which statement_timeout does not.
        match tokio::time::timeout(self.query_timeout, self.run(query)).await {
            Ok(result) => result,
            Err(_) => Err(DatastoreError::Timeout {
                datastore: self.alias.clone(),
                timeout_ms: self.query_timeout.as_millis() as u64,
            }),
        }
    }

    async fn ping(&self) -> bool {
        tokio::time::timeout(
            self.query_timeout,
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await
        .is_ok_and(|res| res.is_ok())
    }
}

/// MySQL compares string parameters against numeric columns by conversion,
/// so binds go through unchanged.
pub struct MySqlDatastore {
    alias: String,
    pool: MySqlPool,
    query_timeout: Duration,
}

impl MySqlDatastore {
    pub fn connect_lazy(
        alias: &str,
        url: &str,
        max_connections: u32,
        query_timeout: Duration,
    ) -> Result<Self, DatastoreError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(query_timeout)
            .connect_lazy(url)
            .map_err(|err| DatastoreError::Unavailable {
                datastore: alias.to_string(),
                reason: err.to_string(),
            })?;

        Ok(Self {
            alias: alias.to_string(),
            pool,
            query_timeout,
        })
    }

    async fn run(&self, query: &StoreQuery) -> Result<bool, DatastoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|err| DatastoreError::Unavailable {
                datastore: self.alias.clone(),
                reason: err.to_string(),
            })?;

        let limit = format!(
            "SET SESSION max_execution_time = {}",
            self.query_timeout.as_millis()
        );
        sqlx::query(&limit)
            .execute(&mut *conn)
            .await
            .map_err(|err| DatastoreError::Unavailable {
                datastore: self.alias.clone(),
                reason: err.to_string(),
            })?;

        // EXISTS yields an integer in MySQL.
        let mut statement = sqlx::query_scalar::<_, i64>(&query.sql);
        for value in &query.binds {
            statement = match value {
                SqlValue::Text(v) => statement.bind(v.as_str()),
                SqlValue::Int(v) => statement.bind(*v),
                SqlValue::Float(v) => statement.bind(*v),
                SqlValue::Bool(v) => statement.bind(*v),
            };
        }

        let found = statement
            .fetch_one(&mut *conn)
            .await
            .map_err(|err| DatastoreError::QueryFailed {
                datastore: self.alias.clone(),
                reason: err.to_string(),
            })?;
        Ok(found != 0)
    }
}

#[async_trait]
impl Datastore for MySqlDatastore {
    async fn exists(&self, query: &StoreQuery) -> Result<bool, DatastoreError> {
        match tokio::time::timeout(self.query_timeout, self.run(query)).await {
            Ok(result) => result,
            Err(_) => Err(DatastoreError::Timeout {
                datastore: self.alias.clone(),
                timeout_ms: self.query_timeout.as_millis() as u64,
            }),
        }
    }

    async fn ping(&self) -> bool {
        tokio::time::timeout(
            self.query_timeout,
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await
        .is_ok_and(|res| res.is_ok())
    }
}

/// Builds one driver per configured datastore, picked by its dialect.
pub fn connect_all(
    config: &AppConfig,
    max_connections: u32,
    query_timeout: Duration,
) -> Result<DatastoreMap, DatastoreError> {
    let mut out: DatastoreMap = HashMap::with_capacity(config.data.datastores.len());
    for (alias, definition) in &config.data.datastores {
        let url = &definition.connection.url;
        let store: Arc<dyn Datastore> = match definition.dialect() {
            Some(SqlDialect::Postgres) => Arc::new(PostgresDatastore::connect_lazy(
                alias,
                url,
                max_connections,
                query_timeout,
            )?),
            Some(SqlDialect::Mysql) => Arc::new(MySqlDatastore::connect_lazy(
                alias,
                url,
                max_connections,
                query_timeout,
            )?),
            None => return Err(DatastoreError::Unknown(alias.clone())),
        };
        tracing::info!(datastore = %alias, kind = %definition.kind, "datastore driver ready");
        out.insert(alias.clone(), store);
    }
    Ok(out)
}
