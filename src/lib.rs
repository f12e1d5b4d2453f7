pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod export;
pub mod nl;
pub mod parcels;
pub mod schema;
pub mod server;
pub mod sql;
