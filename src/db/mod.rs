mod mssql;
mod postgres;
mod provider;
mod value;

#[cfg(test)]
pub mod mock;

pub use mssql::{MsSqlConnection, MsSqlPool};
pub use postgres::{PgConnection, PgPool, PgTlsSettings};
pub use provider::*;
pub use value::*;
