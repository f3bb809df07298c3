//! pooled-db Library
//!
//! This library provides pooled database connections, transactions with
//! savepoints, named and positional parameter binding, pluggable type
//! converters and a forward-only migration engine for PostgreSQL, MySQL and
//! SQLite.

pub mod config;
pub mod database;
pub mod db;
pub mod error;
pub mod migration;
pub mod models;

pub use config::{Config, PoolOptions};
pub use database::Database;
pub use db::{Connection, ConverterRegistry, Pool, PooledConnection, Transaction};
pub use error::{DbError, DbResult};
pub use migration::{Migration, MigrationSet, Migrator};
pub use models::{Param, Params, Row, Value};
