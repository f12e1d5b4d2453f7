use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use deadpool::managed::{self, Metrics, Object, Pool, RecycleResult};
use rust_decimal::Decimal;
use std::borrow::Cow;
use tiberius::{Client, ColumnData, Config, FromSql, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use super::provider::{BackendConnection, PoolSettings};
use super::value::{CellValue, ColumnInfo, RowSet};
use crate::error::BackendError;
use crate::sql::{DbTarget, SqlParam};

pub type MsSqlClient = Client<Compat<TcpStream>>;

/// Opens tiberius clients over plain tokio TCP streams.
pub struct MsSqlManager {
    config: Config,
}

impl managed::Manager for MsSqlManager {
    type Type = MsSqlClient;
    type Error = tiberius::error::Error;

    async fn create(&self) -> Result<MsSqlClient, tiberius::error::Error> {
        let tcp = TcpStream::connect(self.config.get_addr()).await?;
        tcp.set_nodelay(true)?;
        Client::connect(self.config.clone(), tcp.compat_write()).await
    }

    async fn recycle(
        &self,
        client: &mut MsSqlClient,
        _: &Metrics,
    ) -> RecycleResult<tiberius::error::Error> {
        client.simple_query("SELECT 1").await?.into_results().await?;
        Ok(())
    }
}

pub struct MsSqlPool {
    pool: Pool<MsSqlManager>,
}

impl MsSqlPool {
    /// `conn_str` is an ADO.NET style connection string.
    pub fn open(conn_str: &str, sizing: &PoolSettings) -> Result<Self> {
        let config =
            Config::from_ado_string(conn_str).context("Invalid SQL Server connection string")?;
        let pool = Pool::builder(MsSqlManager { config })
            .max_size(sizing.max_size)
            .wait_timeout(Some(sizing.wait_timeout))
            .create_timeout(Some(sizing.wait_timeout))
            .runtime(deadpool::Runtime::Tokio1)
            .build()
            .context("Failed to build SQL Server pool")?;
        Ok(Self { pool })
    }

    pub async fn get(&self) -> Result<MsSqlConnection, BackendError> {
        let client = self.pool.get().await.map_err(|e| match e {
            managed::PoolError::Backend(err) => BackendError::from_mssql(&err),
            other => BackendError::connection(format!("SQL Server pool: {}", other)),
        })?;
        Ok(MsSqlConnection {
            client: Some(client),
            in_flight: false,
        })
    }

    pub fn close(&self) {
        self.pool.close();
    }
}

pub struct MsSqlConnection {
    client: Option<Object<MsSqlManager>>,
    in_flight: bool,
}

impl MsSqlConnection {
    fn client(&mut self) -> Result<&mut MsSqlClient, BackendError> {
        self.client
            .as_deref_mut()
            .ok_or_else(|| BackendError::connection("connection already released"))
    }
}

#[async_trait]
impl BackendConnection for MsSqlConnection {
    fn target(&self) -> DbTarget {
        DbTarget::MsSql
    }

    async fn query(&mut self, sql: &str, params: &[SqlParam]) -> Result<RowSet, BackendError> {
        self.in_flight = true;
        let result = run_query(self.client()?, sql, params).await;
        self.in_flight = false;
        result
    }

    async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64, BackendError> {
        self.in_flight = true;
        let refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
        let result = match self.client()?.execute(sql, &refs).await {
            Ok(done) => Ok(done.total()),
            Err(e) => Err(BackendError::from_mssql(&e)),
        };
        self.in_flight = false;
        result
    }

    /// Snapshot isolation is a database-level option on SQL Server, so the
    /// count and data queries run without one.
    async fn begin_snapshot(&mut self) -> Result<bool, BackendError> {
        Ok(false)
    }

    async fn finish_snapshot(&mut self, _commit: bool) -> Result<(), BackendError> {
        Ok(())
    }
}

async fn run_query(
    client: &mut MsSqlClient,
    sql: &str,
    params: &[SqlParam],
) -> Result<RowSet, BackendError> {
    let refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
    let mut stream = client
        .query(sql, &refs)
        .await
        .map_err(|e| BackendError::from_mssql(&e))?;

    let columns: Vec<ColumnInfo> = stream
        .columns()
        .await
        .map_err(|e| BackendError::from_mssql(&e))?
        .map(|cols| {
            cols.iter()
                .map(|c| ColumnInfo::new(c.name(), format!("{:?}", c.column_type()).to_lowercase()))
                .collect()
        })
        .unwrap_or_default();

    let rows = stream
        .into_first_result()
        .await
        .map_err(|e| BackendError::from_mssql(&e))?;

    let rows = rows
        .into_iter()
        .map(|row| row.into_iter().map(decode_value).collect())
        .collect();
    Ok(RowSet::new(columns, rows))
}

impl Drop for MsSqlConnection {
    fn drop(&mut self) {
        if !self.in_flight {
            return;
        }
        if let Some(object) = self.client.take() {
            // The TDS stream is mid-response; closing it is the only way out.
            tracing::warn!("discarding SQL Server connection with statement in flight");
            drop(Object::take(object));
        }
    }
}

fn decode_value(data: ColumnData<'static>) -> CellValue {
    let value = match &data {
        ColumnData::U8(v) => v.map(|x| CellValue::Int16(x as i16)),
        ColumnData::I16(v) => v.map(CellValue::Int16),
        ColumnData::I32(v) => v.map(CellValue::Int32),
        ColumnData::I64(v) => v.map(CellValue::Int64),
        ColumnData::F32(v) => v.map(CellValue::Float32),
        ColumnData::F64(v) => v.map(CellValue::Float64),
        ColumnData::Bit(v) => v.map(CellValue::Bool),
        ColumnData::String(v) => v.as_ref().map(|s| CellValue::Text(s.to_string())),
        ColumnData::Guid(v) => v.map(|g| CellValue::Text(g.to_string())),
        ColumnData::Binary(v) => v.as_ref().map(|b| CellValue::Bytes(b.to_vec())),
        ColumnData::Xml(v) => v
            .as_ref()
            .map(|x| CellValue::Text(x.clone().into_owned().into_string())),
        ColumnData::Numeric(_) => converted::<Decimal>(&data, CellValue::Numeric),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            converted::<NaiveDateTime>(&data, CellValue::DateTime)
        }
        ColumnData::Date(_) => converted::<NaiveDate>(&data, CellValue::Date),
        ColumnData::Time(_) => converted::<NaiveTime>(&data, CellValue::Time),
        ColumnData::DateTimeOffset(_) => {
            converted::<DateTime<Utc>>(&data, CellValue::TimestampTz)
        }
    };
    value.unwrap_or(CellValue::Null)
}

fn converted<'a, T: FromSql<'a>>(
    data: &'a ColumnData<'static>,
    wrap: impl FnOnce(T) -> CellValue,
) -> Option<CellValue> {
    match T::from_sql(data) {
        Ok(v) => v.map(wrap),
        Err(e) => Some(CellValue::Unknown(format!("<{}>", e))),
    }
}

impl ToSql for SqlParam {
    fn to_sql(&self) -> ColumnData<'_> {
        match self {
            SqlParam::Null => ColumnData::String(None),
            SqlParam::Bool(b) => ColumnData::Bit(Some(*b)),
            SqlParam::Integer(i) => ColumnData::I64(Some(*i)),
            SqlParam::Float(f) => ColumnData::F64(Some(*f)),
            SqlParam::Text(s) => ColumnData::String(Some(Cow::Borrowed(s.as_str()))),
        }
    }
}
