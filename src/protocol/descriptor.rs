//! Query descriptors and their plain-data form.
//!
//! A [`Descriptor`] is the option tree handed to a repository call: maps,
//! lists and scalars, with [`FindOperator`] leaves wherever a condition needs
//! more than equality. Only the operator leaves change shape on the way across
//! the channel; everything else is copied through as-is.

use std::collections::BTreeMap;

use serde_json::{Number, Value};

use super::operator::{FindOperator, OperatorNode};
use crate::error::{BridgeError, BridgeResult};

// ============================================================================
// Scalars
// ============================================================================

/// A non-null leaf value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Scalar {
    /// JSON form. Non-finite reals have none and become `null`; see
    /// [`Descriptor::encode`] for the checked path.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Integer(i) => Value::Number((*i).into()),
            Self::Real(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
            Self::Text(s) => Value::String(s.clone()),
        }
    }

    /// False only for NaN and infinite reals.
    pub fn is_finite(&self) -> bool {
        !matches!(self, Self::Real(f) if !f.is_finite())
    }

    /// Interpret a JSON leaf. Null, lists and maps are not scalars.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Self::Integer(i)),
                None => n.as_f64().map(Self::Real),
            },
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Self::Integer(v.into())
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<u32> for Scalar {
    fn from(v: u32) -> Self {
        Self::Integer(v.into())
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

// ============================================================================
// Descriptor tree
// ============================================================================

/// A query-option tree whose leaves may be operators.
#[derive(Debug, Clone, PartialEq)]
pub enum Descriptor {
    Null,
    Scalar(Scalar),
    List(Vec<Descriptor>),
    Map(BTreeMap<String, Descriptor>),
    Operator(FindOperator),
}

impl Default for Descriptor {
    fn default() -> Self {
        Self::Map(BTreeMap::new())
    }
}

impl Descriptor {
    /// Build a map node from key/value pairs.
    pub fn map<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Descriptor>,
    {
        Self::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Build a list node.
    pub fn list<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Descriptor>,
    {
        Self::List(items.into_iter().map(Into::into).collect())
    }

    /// Empty map, the "no options" descriptor.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Descriptor>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Descriptor> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// Encode into plain data for the channel.
    ///
    /// Total over the tree: every node has a JSON counterpart and the input is
    /// left untouched.
    pub fn serialize(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Scalar(s) => s.to_json(),
            Self::List(items) => Value::Array(items.iter().map(Self::serialize).collect()),
            Self::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.serialize()))
                    .collect(),
            ),
            Self::Operator(op) => op.encode().to_json(),
        }
    }

    /// Encode for the channel, refusing NaN and infinite reals.
    ///
    /// Those would come out of [`Self::serialize`] as `null` and decode as a
    /// different query on the other side.
    pub fn encode(&self) -> BridgeResult<Value> {
        if !self.is_finite() {
            return Err(BridgeError::MalformedDescriptor(
                "NaN and infinite numbers cannot be sent".to_string(),
            ));
        }
        Ok(self.serialize())
    }

    fn is_finite(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Scalar(s) => s.is_finite(),
            Self::List(items) => items.iter().all(Self::is_finite),
            Self::Map(map) => map.values().all(Self::is_finite),
            Self::Operator(op) => op.is_finite(),
        }
    }

    /// Decode plain data back into a descriptor, rebuilding operators.
    ///
    /// The first operator that fails to decode aborts the whole tree; no
    /// partially decoded descriptor is returned.
    pub fn deserialize(value: &Value) -> BridgeResult<Self> {
        Ok(match value {
            Value::Null => Self::Null,
            Value::Array(items) => Self::List(
                items
                    .iter()
                    .map(Self::deserialize)
                    .collect::<BridgeResult<_>>()?,
            ),
            Value::Object(_) if OperatorNode::is_node(value) => {
                Self::Operator(OperatorNode::from_json(value)?.decode()?)
            }
            Value::Object(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), Self::deserialize(v)?)))
                    .collect::<BridgeResult<_>>()?,
            ),
            leaf => Self::Scalar(Scalar::from_json(leaf).ok_or_else(|| {
                BridgeError::MalformedDescriptor(format!("unsupported leaf value: {}", leaf))
            })?),
        })
    }
}

impl From<Scalar> for Descriptor {
    fn from(v: Scalar) -> Self {
        Self::Scalar(v)
    }
}

impl From<FindOperator> for Descriptor {
    fn from(v: FindOperator) -> Self {
        Self::Operator(v)
    }
}

impl From<bool> for Descriptor {
    fn from(v: bool) -> Self {
        Self::Scalar(v.into())
    }
}

impl From<i32> for Descriptor {
    fn from(v: i32) -> Self {
        Self::Scalar(v.into())
    }
}

impl From<i64> for Descriptor {
    fn from(v: i64) -> Self {
        Self::Scalar(v.into())
    }
}

impl From<f64> for Descriptor {
    fn from(v: f64) -> Self {
        Self::Scalar(v.into())
    }
}

impl From<&str> for Descriptor {
    fn from(v: &str) -> Self {
        Self::Scalar(v.into())
    }
}

impl From<String> for Descriptor {
    fn from(v: String) -> Self {
        Self::Scalar(v.into())
    }
}

impl<T: Into<Descriptor>> From<Option<T>> for Descriptor {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl<T: Into<Descriptor>> From<Vec<T>> for Descriptor {
    fn from(v: Vec<T>) -> Self {
        Self::list(v)
    }
}
