use anyhow::{Context, Result};
use async_trait::async_trait;

use super::mssql::MsSqlPool;
use super::postgres::PgPool;
use super::value::RowSet;
use crate::config::Settings;
use crate::error::BackendError;
use crate::sql::{DbTarget, SqlParam};

/// A scoped, checked-out backend connection.
///
/// Dropping it returns the connection to its pool. A connection dropped
/// while a statement or snapshot is still open is detached and closed
/// instead, so it never goes back mid-query.
#[async_trait]
pub trait BackendConnection: Send {
    fn target(&self) -> DbTarget;

    /// Run a row-returning statement. Columns are reported even when no
    /// rows come back.
    async fn query(&mut self, sql: &str, params: &[SqlParam]) -> Result<RowSet, BackendError>;

    /// Run a statement and return the affected-row count.
    async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64, BackendError>;

    /// Open a read-only snapshot so that several queries observe the same
    /// data. Returns `false` when the backend runs without one.
    async fn begin_snapshot(&mut self) -> Result<bool, BackendError>;

    /// Close a snapshot opened by `begin_snapshot`, committing or rolling
    /// back.
    async fn finish_snapshot(&mut self, commit: bool) -> Result<(), BackendError>;

    async fn ping(&mut self) -> Result<(), BackendError> {
        self.query("SELECT 1", &[]).await.map(|_| ())
    }
}

/// Source of scoped connections, one pool per configured backend.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Check out a connection, waiting up to the pool timeout.
    async fn acquire(&self, target: DbTarget) -> Result<Box<dyn BackendConnection>, BackendError>;

    fn is_configured(&self, target: DbTarget) -> bool;

    /// Close every pool. Later acquisitions fail.
    async fn close_all(&self);
}

/// Production provider: one bounded pool per configured backend.
pub struct DatabasePools {
    mssql: Option<MsSqlPool>,
    postgres: Option<PgPool>,
}

impl DatabasePools {
    /// Build the pools. Connections are created lazily on first use, so an
    /// unreachable server surfaces at acquisition, not here.
    pub fn open(settings: &Settings) -> Result<Self> {
        let mssql = settings
            .mssql_conn_str
            .as_deref()
            .map(|conn| MsSqlPool::open(conn, &settings.pool()))
            .transpose()
            .context("Failed to configure SQL Server pool")?;
        let postgres = settings
            .postgres_url
            .as_deref()
            .map(|url| PgPool::open(url, &settings.pool(), &settings.postgres_tls()))
            .transpose()
            .context("Failed to configure PostgreSQL pool")?;

        for target in DbTarget::ALL {
            let configured = match target {
                DbTarget::MsSql => mssql.is_some(),
                DbTarget::Postgres => postgres.is_some(),
            };
            if configured {
                tracing::info!(target_db = %target, "connection pool configured");
            } else {
                tracing::warn!(target_db = %target, "no connection settings; backend disabled");
            }
        }

        Ok(Self { mssql, postgres })
    }
}

#[async_trait]
impl ConnectionProvider for DatabasePools {
    async fn acquire(&self, target: DbTarget) -> Result<Box<dyn BackendConnection>, BackendError> {
        match target {
            DbTarget::MsSql => match &self.mssql {
                Some(pool) => Ok(Box::new(pool.get().await?)),
                None => Err(BackendError::not_configured(target)),
            },
            DbTarget::Postgres => match &self.postgres {
                Some(pool) => Ok(Box::new(pool.get().await?)),
                None => Err(BackendError::not_configured(target)),
            },
        }
    }

    fn is_configured(&self, target: DbTarget) -> bool {
        match target {
            DbTarget::MsSql => self.mssql.is_some(),
            DbTarget::Postgres => self.postgres.is_some(),
        }
    }

    async fn close_all(&self) {
        if let Some(pool) = &self.mssql {
            pool.close();
        }
        if let Some(pool) = &self.postgres {
            pool.close();
        }
        tracing::info!("connection pools closed");
    }
}

/// Pool sizing shared by both backends.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_size: usize,
    pub wait_timeout: std::time::Duration,
}
