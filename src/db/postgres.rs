use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod, Runtime};
use postgres_native_tls::MakeTlsConnector;
use rust_decimal::Decimal;
use std::error::Error as StdError;
use std::str::FromStr;
use tokio_postgres::config::SslMode;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, Kind, ToSql, Type};
use tokio_postgres::{NoTls, Row};

use super::provider::{BackendConnection, PoolSettings};
use super::value::{CellValue, ColumnInfo, RowSet};
use crate::error::BackendError;
use crate::sql::{DbTarget, SqlParam};

type BoxError = Box<dyn StdError + Sync + Send>;

/// TLS options for PostgreSQL connections. `sslmode` itself comes from the
/// connection string.
#[derive(Debug, Clone, Default)]
pub struct PgTlsSettings {
    /// PEM bundle of extra root certificates (`PGSSLROOTCERT`).
    pub ca_cert_path: Option<String>,
    /// Skip certificate verification. Use with caution.
    pub accept_invalid_certs: bool,
}

#[derive(Clone)]
enum CancelTls {
    Plain,
    Tls(MakeTlsConnector),
}

pub struct PgPool {
    pool: Pool,
    cancel_tls: CancelTls,
}

impl PgPool {
    /// `url` is either a `postgresql://` URL or a libpq key=value string.
    pub fn open(url: &str, sizing: &PoolSettings, tls: &PgTlsSettings) -> Result<Self> {
        let pg_config =
            tokio_postgres::Config::from_str(url).context("Invalid PostgreSQL connection string")?;
        let manager_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let (manager, cancel_tls) = match pg_config.get_ssl_mode() {
            SslMode::Disable => (
                Manager::from_config(pg_config, NoTls, manager_config),
                CancelTls::Plain,
            ),
            _ => {
                let connector = build_tls_connector(tls)?;
                (
                    Manager::from_config(pg_config, connector.clone(), manager_config),
                    CancelTls::Tls(connector),
                )
            }
        };

        let pool = Pool::builder(manager)
            .max_size(sizing.max_size)
            .wait_timeout(Some(sizing.wait_timeout))
            .create_timeout(Some(sizing.wait_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .context("Failed to build PostgreSQL pool")?;

        Ok(Self { pool, cancel_tls })
    }

    pub async fn get(&self) -> Result<PgConnection, BackendError> {
        let client = self.pool.get().await.map_err(|e| match e {
            deadpool_postgres::PoolError::Backend(err) => BackendError::from_pg(&err),
            other => BackendError::connection(format!("PostgreSQL pool: {}", other)),
        })?;
        Ok(PgConnection {
            client: Some(client),
            cancel_tls: self.cancel_tls.clone(),
            in_flight: false,
            in_snapshot: false,
        })
    }

    pub fn close(&self) {
        self.pool.close();
    }
}

/// Build a TLS connector, optionally trusting an extra CA bundle.
fn build_tls_connector(tls: &PgTlsSettings) -> Result<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if tls.accept_invalid_certs {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if let Some(ca_path) = &tls.ca_cert_path {
        let pem = std::fs::read_to_string(ca_path)
            .with_context(|| format!("Failed to read CA certificate file: {}", ca_path))?;
        for block in pem_blocks(&pem) {
            let cert = native_tls::Certificate::from_pem(block.as_bytes())
                .context("Failed to parse certificate")?;
            builder.add_root_certificate(cert);
        }
    }

    let connector = builder.build().context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

/// Split a PEM bundle into its individual certificates.
fn pem_blocks(pem: &str) -> Vec<String> {
    const END: &str = "-----END CERTIFICATE-----";
    let mut blocks = Vec::new();
    let mut rest = pem;
    while let Some(start) = rest.find("-----BEGIN CERTIFICATE-----") {
        let Some(end) = rest[start..].find(END) else {
            break;
        };
        let stop = start + end + END.len();
        blocks.push(rest[start..stop].to_string());
        rest = &rest[stop..];
    }
    blocks
}

pub struct PgConnection {
    client: Option<Object>,
    cancel_tls: CancelTls,
    in_flight: bool,
    in_snapshot: bool,
}

impl PgConnection {
    fn client(&self) -> Result<&Object, BackendError> {
        self.client
            .as_ref()
            .ok_or_else(|| BackendError::connection("connection already released"))
    }
}

#[async_trait]
impl BackendConnection for PgConnection {
    fn target(&self) -> DbTarget {
        DbTarget::Postgres
    }

    async fn query(&mut self, sql: &str, params: &[SqlParam]) -> Result<RowSet, BackendError> {
        self.in_flight = true;
        let result = run_query(self.client()?, sql, params).await;
        self.in_flight = false;
        result
    }

    async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64, BackendError> {
        self.in_flight = true;
        let refs = param_refs(params);
        let result = self
            .client()?
            .execute(sql, &refs)
            .await
            .map_err(|e| BackendError::from_pg(&e));
        self.in_flight = false;
        result
    }

    async fn begin_snapshot(&mut self) -> Result<bool, BackendError> {
        self.in_snapshot = true;
        self.client()?
            .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .await
            .map_err(|e| BackendError::from_pg(&e))?;
        Ok(true)
    }

    async fn finish_snapshot(&mut self, commit: bool) -> Result<(), BackendError> {
        let stmt = if commit { "COMMIT" } else { "ROLLBACK" };
        self.client()?
            .batch_execute(stmt)
            .await
            .map_err(|e| BackendError::from_pg(&e))?;
        self.in_snapshot = false;
        Ok(())
    }
}

fn param_refs(params: &[SqlParam]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

/// Ad-hoc text stays out of the pool's statement cache, which never evicts.
async fn run_query(client: &Object, sql: &str, params: &[SqlParam]) -> Result<RowSet, BackendError> {
    let stmt = client
        .prepare(sql)
        .await
        .map_err(|e| BackendError::from_pg(&e))?;
    let rows = client
        .query(&stmt, &param_refs(params))
        .await
        .map_err(|e| BackendError::from_pg(&e))?;

    let columns = stmt
        .columns()
        .iter()
        .map(|c| ColumnInfo::new(c.name(), c.type_().name()))
        .collect();
    Ok(RowSet::new(columns, rows.iter().map(decode_row).collect()))
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        if !(self.in_flight || self.in_snapshot) {
            return;
        }
        let Some(object) = self.client.take() else {
            return;
        };
        // Detach from the pool so the connection closes instead of being reused.
        let client = Object::take(object);
        let token = client.cancel_token();
        let tls = self.cancel_tls.clone();
        tracing::warn!("discarding PostgreSQL connection with statement in flight");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let result = match tls {
                    CancelTls::Plain => token.cancel_query(NoTls).await,
                    CancelTls::Tls(connector) => token.cancel_query(connector).await,
                };
                if let Err(e) = result {
                    tracing::debug!(error = %e, "cancel request failed");
                }
            });
        }
    }
}

fn decode_row(row: &Row) -> Vec<CellValue> {
    (0..row.len())
        .map(|idx| match row.try_get::<_, AnyCell>(idx) {
            Ok(cell) => cell.0,
            Err(e) => CellValue::Unknown(format!("<{}>", e)),
        })
        .collect()
}

/// Decodes any column type into a `CellValue`, following domains down to
/// their base type.
struct AnyCell(CellValue);

impl<'a> FromSql<'a> for AnyCell {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        decode_value(ty, raw).map(AnyCell)
    }

    fn from_sql_null(_: &Type) -> Result<Self, BoxError> {
        Ok(AnyCell(CellValue::Null))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

fn decode_value(ty: &Type, raw: &[u8]) -> Result<CellValue, BoxError> {
    match ty.kind() {
        Kind::Domain(inner) => return decode_value(inner, raw),
        Kind::Array(_) => {
            let items = Vec::<AnyCell>::from_sql(ty, raw)?;
            return Ok(CellValue::Array(items.into_iter().map(|c| c.0).collect()));
        }
        _ => {}
    }

    let value = match *ty {
        Type::BOOL => CellValue::Bool(bool::from_sql(ty, raw)?),
        Type::CHAR => CellValue::Text(((i8::from_sql(ty, raw)? as u8) as char).to_string()),
        Type::INT2 => CellValue::Int16(i16::from_sql(ty, raw)?),
        Type::INT4 => CellValue::Int32(i32::from_sql(ty, raw)?),
        Type::INT8 => CellValue::Int64(i64::from_sql(ty, raw)?),
        Type::OID => CellValue::Int64(u32::from_sql(ty, raw)? as i64),
        Type::FLOAT4 => CellValue::Float32(f32::from_sql(ty, raw)?),
        Type::FLOAT8 => CellValue::Float64(f64::from_sql(ty, raw)?),
        Type::NUMERIC => CellValue::Numeric(Decimal::from_sql(ty, raw)?),
        Type::BYTEA => CellValue::Bytes(Vec::<u8>::from_sql(ty, raw)?),
        Type::DATE => CellValue::Date(NaiveDate::from_sql(ty, raw)?),
        Type::TIME => CellValue::Time(NaiveTime::from_sql(ty, raw)?),
        Type::TIMESTAMP => CellValue::DateTime(NaiveDateTime::from_sql(ty, raw)?),
        Type::TIMESTAMPTZ => CellValue::TimestampTz(DateTime::<Utc>::from_sql(ty, raw)?),
        Type::JSON | Type::JSONB => CellValue::Json(serde_json::Value::from_sql(ty, raw)?),
        _ if <String as FromSql>::accepts(ty) => CellValue::Text(String::from_sql(ty, raw)?),
        _ => CellValue::Unknown(format!("<{}>", ty.name())),
    };
    Ok(value)
}

/// Binds by the type the server inferred for each placeholder, so an
/// extracted `500000` compares against NUMERIC or INT columns the same way
/// the inline literal did.
impl ToSql for SqlParam {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        if let Kind::Domain(inner) = ty.kind() {
            return self.to_sql(inner, out);
        }
        match self {
            SqlParam::Null => Ok(IsNull::Yes),
            SqlParam::Bool(b) => match *ty {
                Type::BOOL => b.to_sql(ty, out),
                _ => bind_text(&b.to_string(), ty, out),
            },
            SqlParam::Integer(i) => bind_integer(*i, ty, out),
            SqlParam::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                Type::FLOAT8 => f.to_sql(ty, out),
                Type::NUMERIC => Decimal::try_from(*f)?.to_sql(ty, out),
                _ => bind_text(&f.to_string(), ty, out),
            },
            SqlParam::Text(s) => bind_text(s, ty, out),
        }
    }

    fn accepts(_: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn bind_integer(i: i64, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    match *ty {
        Type::INT2 => i16::try_from(i)?.to_sql(ty, out),
        Type::INT4 => i32::try_from(i)?.to_sql(ty, out),
        Type::INT8 => i.to_sql(ty, out),
        Type::OID => u32::try_from(i)?.to_sql(ty, out),
        Type::FLOAT4 => (i as f32).to_sql(ty, out),
        Type::FLOAT8 => (i as f64).to_sql(ty, out),
        Type::NUMERIC => Decimal::from(i).to_sql(ty, out),
        _ => bind_text(&i.to_string(), ty, out),
    }
}

/// Text parameters are parsed into the target type; anything textual is
/// sent as-is.
fn bind_text(s: &str, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    match *ty {
        Type::BOOL => match s.to_ascii_lowercase().as_str() {
            "t" | "true" | "1" | "yes" | "on" => true.to_sql(ty, out),
            "f" | "false" | "0" | "no" | "off" => false.to_sql(ty, out),
            _ => Err(format!("invalid boolean: {}", s).into()),
        },
        Type::INT2 | Type::INT4 | Type::INT8 | Type::OID => {
            bind_integer(s.trim().parse::<i64>()?, ty, out)
        }
        Type::FLOAT4 => s.trim().parse::<f32>()?.to_sql(ty, out),
        Type::FLOAT8 => s.trim().parse::<f64>()?.to_sql(ty, out),
        Type::NUMERIC => Decimal::from_str(s.trim())?.to_sql(ty, out),
        Type::DATE => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")?.to_sql(ty, out),
        Type::TIMESTAMP => parse_timestamp(s)?.to_sql(ty, out),
        Type::TIMESTAMPTZ => match DateTime::parse_from_rfc3339(s.trim()) {
            Ok(dt) => dt.with_timezone(&Utc).to_sql(ty, out),
            Err(_) => parse_timestamp(s)?.and_utc().to_sql(ty, out),
        },
        Type::JSON | Type::JSONB => serde_json::from_str::<serde_json::Value>(s)?.to_sql(ty, out),
        _ if <&str as ToSql>::accepts(ty) => s.to_sql(ty, out),
        _ => Err(format!("cannot bind text parameter to {}", ty.name()).into()),
    }
}

fn parse_timestamp(s: &str) -> Result<NaiveDateTime, BoxError> {
    let s = s.trim();
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt);
        }
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")?;
    date.and_hms_opt(0, 0, 0)
        .ok_or_else(|| format!("invalid timestamp: {}", s).into())
}
