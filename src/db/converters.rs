//! Type converter registry.
//!
//! Converters map between database-side values of a named type and the
//! caller's representation. A converter is keyed by type name and schema
//! (default `public`). Parameters tagged with a type name are encoded through
//! the registered encode function; columns whose declared type has a
//! registered converter are decoded through it.
//!
//! A type may be (re)registered freely until it is first used. Registering it
//! afterwards is an error, since connections may already have observed the
//! previous mapping.

use crate::error::{DbError, DbResult};
use crate::models::{Param, Value, ValueKind};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

/// Schema used when a registration does not name one.
pub const DEFAULT_SCHEMA: &str = "public";

/// Converts a caller-side value into what the database expects.
pub type EncodeFn = Arc<dyn Fn(&Value) -> DbResult<Value> + Send + Sync>;

/// Converts a database-side value into the caller's representation.
pub type DecodeFn = Arc<dyn Fn(&Value) -> DbResult<Value> + Send + Sync>;

/// A registered encode/decode pair.
#[derive(Clone)]
pub struct Converter {
    pub encode: EncodeFn,
    pub decode: DecodeFn,
    /// The value kind the decode function produces, if fixed.
    pub native: Option<ValueKind>,
}

impl std::fmt::Debug for Converter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Converter")
            .field("native", &self.native)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TypeKey {
    schema: String,
    type_name: String,
}

impl TypeKey {
    fn new(schema: Option<&str>, type_name: &str) -> Self {
        Self {
            schema: schema.unwrap_or(DEFAULT_SCHEMA).to_ascii_lowercase(),
            type_name: type_name.to_ascii_lowercase(),
        }
    }
}

/// Shared registry of converters, consulted by every connection of a pool.
#[derive(Debug, Default)]
pub struct ConverterRegistry {
    entries: RwLock<HashMap<TypeKey, Converter>>,
    used: Mutex<HashSet<TypeKey>>,
}

fn poisoned() -> DbError {
    DbError::internal("converter registry lock poisoned")
}

impl ConverterRegistry {
    /// An empty registry with no converters at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A registry preloaded with the default `json`/`jsonb` converters.
    pub fn with_defaults() -> Self {
        let registry = Self::empty();
        for type_name in ["json", "jsonb"] {
            let key = TypeKey::new(Some("pg_catalog"), type_name);
            if let Ok(mut entries) = registry.entries.write() {
                entries.insert(
                    key,
                    Converter {
                        encode: Arc::new(encode_json),
                        decode: Arc::new(decode_json),
                        native: Some(ValueKind::Json),
                    },
                );
            }
        }
        registry
    }

    /// Register (or replace) the converter for `type_name` in `schema`.
    ///
    /// Fails with a converter error if the type has already been used.
    pub fn register<E, D>(
        &self,
        type_name: &str,
        encode: E,
        decode: D,
        schema: Option<&str>,
        native: Option<ValueKind>,
    ) -> DbResult<()>
    where
        E: Fn(&Value) -> DbResult<Value> + Send + Sync + 'static,
        D: Fn(&Value) -> DbResult<Value> + Send + Sync + 'static,
    {
        let key = TypeKey::new(schema, type_name);
        if self.used.lock().map_err(|_| poisoned())?.contains(&key) {
            return Err(DbError::converter(
                type_name,
                "cannot register a converter after the type has been used",
            ));
        }
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        let replaced = entries
            .insert(
                key.clone(),
                Converter {
                    encode: Arc::new(encode),
                    decode: Arc::new(decode),
                    native,
                },
            )
            .is_some();
        debug!(type_name = %key.type_name, schema = %key.schema, replaced, "Registered converter");
        Ok(())
    }

    /// Check whether any converter is registered for a column type.
    pub fn has_decoder(&self, type_name: &str) -> bool {
        self.lookup(None, type_name).ok().flatten().is_some()
    }

    /// Encode a parameter. Untagged parameters pass through unchanged.
    pub fn encode(&self, param: &Param) -> DbResult<Value> {
        match param {
            Param::Value(value) => Ok(value.clone()),
            Param::Typed {
                type_name,
                schema,
                value,
            } => {
                let converter = self
                    .lookup(schema.as_deref(), type_name)?
                    .ok_or_else(|| DbError::converter(type_name, "no converter registered"))?;
                if value.is_null() {
                    return Ok(Value::Null);
                }
                (converter.encode)(value)
            }
        }
    }

    /// Decode a column value of the given declared type.
    ///
    /// Values of types without a converter, and nulls, pass through.
    pub fn decode(&self, type_name: &str, value: Value) -> DbResult<Value> {
        if value.is_null() {
            return Ok(value);
        }
        match self.lookup(None, type_name)? {
            Some(converter) => (converter.decode)(&value),
            None => Ok(value),
        }
    }

    /// Find a converter, marking its key as used.
    ///
    /// Without an explicit schema the default schema is preferred, then any
    /// schema registering the type name.
    fn lookup(&self, schema: Option<&str>, type_name: &str) -> DbResult<Option<Converter>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        let exact = TypeKey::new(schema, type_name);
        let found = match entries.get(&exact) {
            Some(converter) => Some((exact, converter.clone())),
            None if schema.is_none() => entries
                .iter()
                .find(|(key, _)| key.type_name == exact.type_name)
                .map(|(key, converter)| (key.clone(), converter.clone())),
            None => None,
        };
        drop(entries);

        match found {
            Some((key, converter)) => {
                self.used.lock().map_err(|_| poisoned())?.insert(key);
                Ok(Some(converter))
            }
            None => Ok(None),
        }
    }
}

fn encode_json(value: &Value) -> DbResult<Value> {
    match value {
        Value::Json(json) => Ok(Value::Text(json.to_string())),
        other => Ok(other.clone()),
    }
}

fn decode_json(value: &Value) -> DbResult<Value> {
    match value {
        Value::Text(text) => serde_json::from_str(text)
            .map(Value::Json)
            .map_err(|e| DbError::converter("json", format!("invalid JSON text: {e}"))),
        other => Ok(other.clone()),
    }
}
