//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Backend adapters for PostgreSQL, MySQL and SQLite
//! - Named and positional parameter binding
//! - Type converters
//! - Connections, transactions and savepoints
//! - Connection pool management

#[macro_use]
mod macros;

pub mod backend;
pub mod bind;
pub mod connection;
pub mod converters;
pub mod params;
pub mod pool;
pub mod transaction;
pub mod types;

pub use backend::{Capabilities, Driver, RawConnection, driver_for_url};
pub use bind::{BoundQuery, PlaceholderStyle, bind};
pub use connection::{Connection, ConnectionContext};
pub use converters::{Converter, ConverterRegistry, DEFAULT_SCHEMA};
pub use pool::{Pool, PoolStatus, PooledConnection};
pub use transaction::Transaction;
