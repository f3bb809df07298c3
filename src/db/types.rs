//! Backend type mappings.
//!
//! This module maps engine-specific column types onto [`Value`].
//!
//! # Architecture
//!
//! Row decoding uses a two-phase approach:
//! 1. `TypeCategory` classifies the declared column type into a logical category
//! 2. Engine-specific decoders extract the value for that category
//!
//! Registered converters run afterwards, on the decoded [`Value`], keyed by the
//! declared type name carried in [`Column`].

use crate::error::{DbError, DbResult};
use crate::models::{BackendKind, Column, Row, Value};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column as _, Decode, Row as _, Type, TypeInfo, ValueRef};
use std::sync::Arc;

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Timestamp,
    TimestampTz,
    Date,
    Time,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, backend: BackendKind) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Decimal/Numeric - check first as it overlaps with "numeric" in float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC is actually a float
        if backend == BackendKind::SQLite && lower == "numeric" {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    // Timestamps before integers: "interval" and "point" are not integers either
    if lower == "timestamptz" {
        return TypeCategory::TimestampTz;
    }
    if lower == "timestamp" || lower == "datetime" {
        return if backend == BackendKind::MySQL && lower == "timestamp" {
            TypeCategory::TimestampTz
        } else {
            TypeCategory::Timestamp
        };
    }
    if lower == "date" {
        return TypeCategory::Date;
    }
    if lower == "time" {
        return TypeCategory::Time;
    }

    if lower.contains("interval") || lower.contains("point") {
        return TypeCategory::Unknown;
    }

    // Integer types
    if lower.contains("int") || lower.contains("serial") || lower.contains("tiny") {
        // MySQL reports BOOLEAN columns as TINYINT(1); callers use Value::truthy
        return TypeCategory::Integer;
    }

    // Boolean
    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    // Float types
    if lower.contains("float")
        || lower.contains("double")
        || lower == "real"
        || lower == "float4"
        || lower == "float8"
    {
        return TypeCategory::Float;
    }

    // JSON types
    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    // Binary types
    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    if lower.contains("char") || lower == "text" || lower == "name" {
        return TypeCategory::Text;
    }

    // Enums, domains and other user-defined types
    TypeCategory::Unknown
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw DECIMAL/NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("numeric")
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let bytes = <&[u8] as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(RawDecimal(numeric_to_string(bytes)?))
    }
}

/// Render PostgreSQL's binary NUMERIC format as a decimal string.
///
/// Layout: ndigits, weight, sign, dscale (all 16 bit), then `ndigits`
/// base-10000 digits.
fn numeric_to_string(bytes: &[u8]) -> Result<String, sqlx::error::BoxDynError> {
    let word = |idx: usize| -> Result<i16, sqlx::error::BoxDynError> {
        bytes
            .get(idx * 2..idx * 2 + 2)
            .map(|b| i16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "truncated NUMERIC value".into())
    };
    let ndigits = word(0)? as usize;
    let weight = word(1)? as i32;
    let sign = word(2)? as u16;
    let dscale = word(3)? as usize;

    match sign {
        0xC000 => return Ok("NaN".to_string()),
        0xD000 => return Ok("Infinity".to_string()),
        0xF000 => return Ok("-Infinity".to_string()),
        _ => {}
    }

    let digits = (0..ndigits)
        .map(|i| word(4 + i))
        .collect::<Result<Vec<_>, _>>()?;

    let mut int_part = String::new();
    for pos in 0..=weight.max(0) {
        let digit = if pos <= weight {
            digits.get(pos as usize).copied().unwrap_or(0)
        } else {
            0
        };
        if int_part.is_empty() {
            if weight >= 0 {
                int_part.push_str(&digit.to_string());
            }
        } else {
            int_part.push_str(&format!("{:04}", digit));
        }
    }
    if int_part.is_empty() {
        int_part.push('0');
    }

    let mut frac_part = String::new();
    let mut idx = weight + 1;
    while frac_part.len() < dscale {
        let digit = if idx < 0 {
            0
        } else {
            digits.get(idx as usize).copied().unwrap_or(0)
        };
        frac_part.push_str(&format!("{:04}", digit));
        idx += 1;
    }
    frac_part.truncate(dscale);

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }
    out.push_str(&int_part);
    if dscale > 0 {
        out.push('.');
        out.push_str(&frac_part);
    }
    Ok(out)
}

// =============================================================================
// Row Decoding
// =============================================================================

/// Conversion of an engine row into a [`Row`] of [`Value`]s.
pub trait DecodeRow {
    /// Column metadata in result order.
    fn columns_meta(&self) -> Vec<Column>;

    /// Decode every column. `columns` must come from `columns_meta` of a row
    /// of the same statement.
    fn decode_row(&self, columns: &Arc<[Column]>) -> DbResult<Row>;
}

fn float_value(v: f64) -> Value {
    Value::Float(v)
}

fn decode_error(column: &Column, err: sqlx::Error) -> DbError {
    DbError::converter(
        column.type_name.clone(),
        format!("failed to decode column '{}': {}", column.name, err),
    )
}

macro_rules! impl_columns_meta {
    () => {
        fn columns_meta(&self) -> Vec<Column> {
            self.columns()
                .iter()
                .map(|col| Column::new(col.name(), col.type_info().name()))
                .collect()
        }
    };
}

impl DecodeRow for MySqlRow {
    impl_columns_meta!();

    fn decode_row(&self, columns: &Arc<[Column]>) -> DbResult<Row> {
        let values = columns
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let category = categorize_type(&col.type_name, BackendKind::MySQL);
                mysql::decode_column(self, idx, category).map_err(|e| decode_error(col, e))
            })
            .collect::<DbResult<Vec<_>>>()?;
        Ok(Row::new(Arc::clone(columns), values))
    }
}

impl DecodeRow for PgRow {
    impl_columns_meta!();

    fn decode_row(&self, columns: &Arc<[Column]>) -> DbResult<Row> {
        let values = columns
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let category = categorize_type(&col.type_name, BackendKind::PostgreSQL);
                postgres::decode_column(self, idx, category).map_err(|e| decode_error(col, e))
            })
            .collect::<DbResult<Vec<_>>>()?;
        Ok(Row::new(Arc::clone(columns), values))
    }
}

impl DecodeRow for SqliteRow {
    impl_columns_meta!();

    fn decode_row(&self, columns: &Arc<[Column]>) -> DbResult<Row> {
        let values = columns
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let category = categorize_type(&col.type_name, BackendKind::SQLite);
                sqlite::decode_column(self, idx, category).map_err(|e| decode_error(col, e))
            })
            .collect::<DbResult<Vec<_>>>()?;
        Ok(Row::new(Arc::clone(columns), values))
    }
}

// =============================================================================
// Engine-Specific Decoders
// =============================================================================

mod mysql {
    use super::*;

    pub fn decode_column(
        row: &MySqlRow,
        idx: usize,
        category: TypeCategory,
    ) -> Result<Value, sqlx::Error> {
        if row.try_get_raw(idx)?.is_null() {
            return Ok(Value::Null);
        }
        match category {
            TypeCategory::Decimal => Ok(Value::Text(row.try_get::<RawDecimal, _>(idx)?.0)),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => Ok(Value::Boolean(row.try_get::<bool, _>(idx)?)),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => Ok(Value::Bytes(row.try_get::<Vec<u8>, _>(idx)?)),
            TypeCategory::Json => Ok(Value::Json(row.try_get::<JsonValue, _>(idx)?)),
            TypeCategory::TimestampTz => Ok(Value::Timestamp(
                row.try_get::<DateTime<Utc>, _>(idx)?,
            )),
            TypeCategory::Timestamp => Ok(Value::Timestamp(
                row.try_get::<NaiveDateTime, _>(idx)?.and_utc(),
            )),
            TypeCategory::Date => Ok(Value::Text(row.try_get::<NaiveDate, _>(idx)?.to_string())),
            TypeCategory::Time => Ok(Value::Text(row.try_get::<NaiveTime, _>(idx)?.to_string())),
            TypeCategory::Text | TypeCategory::Unknown => decode_text(row, idx),
        }
    }

    fn decode_integer(row: &MySqlRow, idx: usize) -> Result<Value, sqlx::Error> {
        // Try signed types, then unsigned
        if let Ok(v) = row.try_get::<i64, _>(idx) {
            return Ok(Value::Integer(v));
        }
        if let Ok(v) = row.try_get::<i32, _>(idx) {
            return Ok(Value::Integer(v.into()));
        }
        if let Ok(v) = row.try_get::<i16, _>(idx) {
            return Ok(Value::Integer(v.into()));
        }
        if let Ok(v) = row.try_get::<i8, _>(idx) {
            return Ok(Value::Integer(v.into()));
        }
        let v = row.try_get::<u64, _>(idx)?;
        Ok(i64::try_from(v)
            .map(Value::Integer)
            .unwrap_or_else(|_| Value::Text(v.to_string())))
    }

    fn decode_float(row: &MySqlRow, idx: usize) -> Result<Value, sqlx::Error> {
        if let Ok(v) = row.try_get::<f64, _>(idx) {
            return Ok(float_value(v));
        }
        Ok(float_value(row.try_get::<f32, _>(idx)? as f64))
    }

    fn decode_text(row: &MySqlRow, idx: usize) -> Result<Value, sqlx::Error> {
        match row.try_get::<String, _>(idx) {
            Ok(v) => Ok(Value::Text(v)),
            Err(_) => Ok(Value::Text(row.try_get_unchecked::<String, _>(idx)?)),
        }
    }
}

mod postgres {
    use super::*;

    pub fn decode_column(
        row: &PgRow,
        idx: usize,
        category: TypeCategory,
    ) -> Result<Value, sqlx::Error> {
        if row.try_get_raw(idx)?.is_null() {
            return Ok(Value::Null);
        }
        match category {
            TypeCategory::Decimal => Ok(Value::Text(row.try_get::<RawDecimal, _>(idx)?.0)),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => Ok(Value::Boolean(row.try_get::<bool, _>(idx)?)),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => Ok(Value::Bytes(row.try_get::<Vec<u8>, _>(idx)?)),
            TypeCategory::Json => Ok(Value::Json(row.try_get::<JsonValue, _>(idx)?)),
            TypeCategory::TimestampTz => Ok(Value::Timestamp(
                row.try_get::<DateTime<Utc>, _>(idx)?,
            )),
            TypeCategory::Timestamp => Ok(Value::Timestamp(
                row.try_get::<NaiveDateTime, _>(idx)?.and_utc(),
            )),
            TypeCategory::Date => Ok(Value::Text(row.try_get::<NaiveDate, _>(idx)?.to_string())),
            TypeCategory::Time => Ok(Value::Text(row.try_get::<NaiveTime, _>(idx)?.to_string())),
            TypeCategory::Text => Ok(Value::Text(row.try_get::<String, _>(idx)?)),
            // Enum labels travel as their text in the binary protocol
            TypeCategory::Unknown => Ok(Value::Text(row.try_get_unchecked::<String, _>(idx)?)),
        }
    }

    fn decode_integer(row: &PgRow, idx: usize) -> Result<Value, sqlx::Error> {
        if let Ok(v) = row.try_get::<i64, _>(idx) {
            return Ok(Value::Integer(v));
        }
        if let Ok(v) = row.try_get::<i32, _>(idx) {
            return Ok(Value::Integer(v.into()));
        }
        Ok(Value::Integer(row.try_get::<i16, _>(idx)?.into()))
    }

    fn decode_float(row: &PgRow, idx: usize) -> Result<Value, sqlx::Error> {
        if let Ok(v) = row.try_get::<f64, _>(idx) {
            return Ok(float_value(v));
        }
        Ok(float_value(row.try_get::<f32, _>(idx)? as f64))
    }
}

mod sqlite {
    use super::*;

    /// SQLite values carry their own storage class, which wins over the
    /// declared column type.
    pub fn decode_column(
        row: &SqliteRow,
        idx: usize,
        category: TypeCategory,
    ) -> Result<Value, sqlx::Error> {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            return Ok(Value::Null);
        }
        let storage = raw.type_info().name().to_uppercase();
        match storage.as_str() {
            "INTEGER" | "BOOLEAN" | "INT8" => {
                let v = row.try_get_unchecked::<i64, _>(idx)?;
                if category == TypeCategory::Boolean {
                    Ok(Value::Boolean(v != 0))
                } else {
                    Ok(Value::Integer(v))
                }
            }
            "REAL" | "NUMERIC" => Ok(float_value(row.try_get_unchecked::<f64, _>(idx)?)),
            "BLOB" => Ok(Value::Bytes(row.try_get_unchecked::<Vec<u8>, _>(idx)?)),
            _ => {
                let v = row.try_get_unchecked::<String, _>(idx)?;
                if category == TypeCategory::Json {
                    if let Ok(json) = serde_json::from_str::<JsonValue>(&v) {
                        return Ok(Value::Json(json));
                    }
                }
                Ok(Value::Text(v))
            }
        }
    }
}
