//! Query parameters.
//!
//! A statement is bound either positionally (`$1`, `$2`, ...) against an
//! ordered list or by name (`:key`) against a mapping. Parameters may be tagged
//! with a type name so the converter registry encodes them.

use crate::models::value::Value;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};

/// A single bound parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    /// A plain value, bound as-is.
    Value(Value),
    /// A value passed through the encode function registered for `type_name`.
    Typed {
        type_name: String,
        schema: Option<String>,
        value: Value,
    },
}

impl Param {
    /// Tag a value with a registered converter type.
    pub fn typed(type_name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Typed {
            type_name: type_name.into(),
            schema: None,
            value: value.into(),
        }
    }

    /// Tag a value with a schema-qualified converter type.
    pub fn typed_in(
        schema: impl Into<String>,
        type_name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        Self::Typed {
            type_name: type_name.into(),
            schema: Some(schema.into()),
            value: value.into(),
        }
    }
}

macro_rules! impl_param_from {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl From<$ty> for Param {
                fn from(v: $ty) -> Self {
                    Param::Value(v.into())
                }
            }
        )+
    };
}

impl_param_from!(
    Value,
    i64,
    i32,
    i16,
    u32,
    f64,
    f32,
    String,
    &str,
    bool,
    Vec<u8>,
    &[u8],
    JsonValue,
    DateTime<Utc>,
);

impl<T: Into<Value>> From<Option<T>> for Param {
    fn from(v: Option<T>) -> Self {
        Param::Value(v.into())
    }
}

/// The full set of parameters for one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Params {
    #[default]
    None,
    Positional(Vec<Param>),
    Named(BTreeMap<String, Param>),
}

impl Params {
    /// Build a positional parameter list.
    pub fn positional<I, P>(values: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Param>,
    {
        Self::Positional(values.into_iter().map(Into::into).collect())
    }

    /// Build a named parameter mapping.
    pub fn named<I, K, P>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, P)>,
        K: Into<String>,
        P: Into<Param>,
    {
        Self::Named(
            values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// An empty named mapping, as opposed to no parameters at all.
    pub fn empty_named() -> Self {
        Self::Named(BTreeMap::new())
    }

    pub fn len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Positional(v) => v.len(),
            Self::Named(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<()> for Params {
    fn from(_: ()) -> Self {
        Params::None
    }
}

impl<P: Into<Param>> From<Vec<P>> for Params {
    fn from(values: Vec<P>) -> Self {
        Params::positional(values)
    }
}

impl<K: Into<String>, P: Into<Param>, const N: usize> From<[(K, P); N]> for Params {
    fn from(values: [(K, P); N]) -> Self {
        Params::named(values)
    }
}

impl<K: Into<String>, P: Into<Param>> From<HashMap<K, P>> for Params {
    fn from(values: HashMap<K, P>) -> Self {
        Params::named(values)
    }
}

impl<K: Into<String>, P: Into<Param>> From<BTreeMap<K, P>> for Params {
    fn from(values: BTreeMap<K, P>) -> Self {
        Params::named(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_from_array() {
        let params: Params = [("data", 2)].into();
        match params {
            Params::Named(map) => assert_eq!(map["data"], Param::Value(Value::Integer(2))),
            other => panic!("unexpected params: {other:?}"),
        }
    }

    #[test]
    fn test_positional_from_vec() {
        let params: Params = vec![Param::from(1), Param::from("a")].into();
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_empty_named_is_not_none() {
        assert_ne!(Params::empty_named(), Params::None);
        assert!(Params::empty_named().is_empty());
    }
}
