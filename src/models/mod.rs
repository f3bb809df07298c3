//! Data models for pooled-db.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod params;
pub mod row;
pub mod value;

// Re-export commonly used types
pub use connection::{BackendKind, ConnectionUrl, DriverKind};
pub use params::{Param, Params};
pub use row::{Column, Row};
pub use value::{FromValue, Value, ValueKind};
