//! Predicate operators and their tagged wire form.
//!
//! A [`FindOperator`] is the live construct callers put inside `where`
//! conditions. It cannot cross the channel as-is, so [`FindOperator::encode`]
//! turns it into an [`OperatorNode`] (plain data with a `$operator`
//! discriminant) and [`OperatorNode::decode`] rebuilds it on the engine side.
//!
//! Operands must be finite: JSON has no NaN or infinity, so
//! [`FindOperator::is_finite`] gates what may be sent.
//!
//! [`OperatorKind`] is the one list of supported tags. Both directions match on
//! it exhaustively, so adding a kind fails to compile until encode and decode
//! agree.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::descriptor::Scalar;
use crate::error::{BridgeError, BridgeResult};

/// Key that marks a map as an operator node.
pub const OPERATOR_KEY: &str = "$operator";

// ============================================================================
// Kinds
// ============================================================================

/// Closed set of operator tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorKind {
    Equal,
    Not,
    In,
    Like,
    IsNull,
    Between,
    LessThan,
    LessThanOrEqual,
    MoreThan,
    MoreThanOrEqual,
    Any,
    ArrayContains,
    ArrayContainedBy,
    ArrayOverlap,
    Raw,
}

impl OperatorKind {
    pub const ALL: [OperatorKind; 15] = [
        Self::Equal,
        Self::Not,
        Self::In,
        Self::Like,
        Self::IsNull,
        Self::Between,
        Self::LessThan,
        Self::LessThanOrEqual,
        Self::MoreThan,
        Self::MoreThanOrEqual,
        Self::Any,
        Self::ArrayContains,
        Self::ArrayContainedBy,
        Self::ArrayOverlap,
        Self::Raw,
    ];

    /// Tag carried on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Equal => "equal",
            Self::Not => "not",
            Self::In => "in",
            Self::Like => "like",
            Self::IsNull => "isNull",
            Self::Between => "between",
            Self::LessThan => "lessThan",
            Self::LessThanOrEqual => "lessThanOrEqual",
            Self::MoreThan => "moreThan",
            Self::MoreThanOrEqual => "moreThanOrEqual",
            Self::Any => "any",
            Self::ArrayContains => "arrayContains",
            Self::ArrayContainedBy => "arrayContainedBy",
            Self::ArrayOverlap => "arrayOverlap",
            Self::Raw => "raw",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Kinds whose value is an ordered list.
    pub fn is_multi(self) -> bool {
        matches!(
            self,
            Self::In
                | Self::Between
                | Self::Any
                | Self::ArrayContains
                | Self::ArrayContainedBy
                | Self::ArrayOverlap
        )
    }
}

impl std::fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Live operator
// ============================================================================

/// A predicate operator as used inside query conditions.
#[derive(Debug, Clone, PartialEq)]
pub enum FindOperator {
    Equal(Scalar),
    /// Negation of another operator. `Not(Equal(v))` is the plain "not equal".
    Not(Box<FindOperator>),
    In(Vec<Scalar>),
    Like(String),
    IsNull,
    Between(Scalar, Scalar),
    LessThan(Scalar),
    LessThanOrEqual(Scalar),
    MoreThan(Scalar),
    MoreThanOrEqual(Scalar),
    Any(Vec<Scalar>),
    ArrayContains(Vec<Scalar>),
    ArrayContainedBy(Vec<Scalar>),
    ArrayOverlap(Vec<Scalar>),
    /// Already-escaped SQL fragment. `{column}` is replaced by the column it
    /// applies to; without the placeholder it is compared with `=`.
    Raw(String),
}

fn scalars<I, T>(values: I) -> Vec<Scalar>
where
    I: IntoIterator<Item = T>,
    T: Into<Scalar>,
{
    values.into_iter().map(Into::into).collect()
}

impl FindOperator {
    pub fn equal(value: impl Into<Scalar>) -> Self {
        Self::Equal(value.into())
    }

    pub fn not(inner: FindOperator) -> Self {
        Self::Not(Box::new(inner))
    }

    /// `Not(Equal(value))`.
    pub fn not_equal(value: impl Into<Scalar>) -> Self {
        Self::not(Self::equal(value))
    }

    pub fn is_in<I, T>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Scalar>,
    {
        Self::In(scalars(values))
    }

    pub fn like(pattern: impl Into<String>) -> Self {
        Self::Like(pattern.into())
    }

    pub fn is_null() -> Self {
        Self::IsNull
    }

    pub fn between(low: impl Into<Scalar>, high: impl Into<Scalar>) -> Self {
        Self::Between(low.into(), high.into())
    }

    pub fn less_than(value: impl Into<Scalar>) -> Self {
        Self::LessThan(value.into())
    }

    pub fn less_than_or_equal(value: impl Into<Scalar>) -> Self {
        Self::LessThanOrEqual(value.into())
    }

    pub fn more_than(value: impl Into<Scalar>) -> Self {
        Self::MoreThan(value.into())
    }

    pub fn more_than_or_equal(value: impl Into<Scalar>) -> Self {
        Self::MoreThanOrEqual(value.into())
    }

    pub fn any<I, T>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Scalar>,
    {
        Self::Any(scalars(values))
    }

    pub fn array_contains<I, T>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Scalar>,
    {
        Self::ArrayContains(scalars(values))
    }

    pub fn array_contained_by<I, T>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Scalar>,
    {
        Self::ArrayContainedBy(scalars(values))
    }

    pub fn array_overlap<I, T>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Scalar>,
    {
        Self::ArrayOverlap(scalars(values))
    }

    pub fn raw(fragment: impl Into<String>) -> Self {
        Self::Raw(fragment.into())
    }

    /// The tag this operator encodes to.
    pub fn kind(&self) -> OperatorKind {
        match self {
            Self::Equal(_) => OperatorKind::Equal,
            Self::Not(_) => OperatorKind::Not,
            Self::In(_) => OperatorKind::In,
            Self::Like(_) => OperatorKind::Like,
            Self::IsNull => OperatorKind::IsNull,
            Self::Between(..) => OperatorKind::Between,
            Self::LessThan(_) => OperatorKind::LessThan,
            Self::LessThanOrEqual(_) => OperatorKind::LessThanOrEqual,
            Self::MoreThan(_) => OperatorKind::MoreThan,
            Self::MoreThanOrEqual(_) => OperatorKind::MoreThanOrEqual,
            Self::Any(_) => OperatorKind::Any,
            Self::ArrayContains(_) => OperatorKind::ArrayContains,
            Self::ArrayContainedBy(_) => OperatorKind::ArrayContainedBy,
            Self::ArrayOverlap(_) => OperatorKind::ArrayOverlap,
            Self::Raw(_) => OperatorKind::Raw,
        }
    }

    /// Whether every real operand is finite. Only those operators decode back
    /// to themselves.
    pub fn is_finite(&self) -> bool {
        let all = |values: &[Scalar]| values.iter().all(Scalar::is_finite);
        match self {
            Self::Equal(v)
            | Self::LessThan(v)
            | Self::LessThanOrEqual(v)
            | Self::MoreThan(v)
            | Self::MoreThanOrEqual(v) => v.is_finite(),
            Self::Not(inner) => inner.is_finite(),
            Self::In(values)
            | Self::Any(values)
            | Self::ArrayContains(values)
            | Self::ArrayContainedBy(values)
            | Self::ArrayOverlap(values) => all(values),
            Self::Between(low, high) => low.is_finite() && high.is_finite(),
            Self::Like(_) | Self::Raw(_) | Self::IsNull => true,
        }
    }

    /// Encode into the transportable tagged form.
    pub fn encode(&self) -> OperatorNode {
        let list = |values: &[Scalar]| Value::Array(values.iter().map(Scalar::to_json).collect());

        let value = match self {
            Self::Equal(v)
            | Self::LessThan(v)
            | Self::LessThanOrEqual(v)
            | Self::MoreThan(v)
            | Self::MoreThanOrEqual(v) => Some(v.to_json()),
            Self::Not(inner) => Some(inner.encode().to_json()),
            Self::In(values)
            | Self::Any(values)
            | Self::ArrayContains(values)
            | Self::ArrayContainedBy(values)
            | Self::ArrayOverlap(values) => Some(list(values)),
            Self::Between(low, high) => Some(Value::Array(vec![low.to_json(), high.to_json()])),
            Self::Like(pattern) => Some(Value::String(pattern.clone())),
            Self::Raw(fragment) => Some(Value::String(fragment.clone())),
            Self::IsNull => None,
        };

        let kind = self.kind();
        OperatorNode {
            kind: kind.as_str().to_string(),
            value,
            multi: kind.is_multi(),
        }
    }
}

// ============================================================================
// Wire node
// ============================================================================

fn is_false(b: &bool) -> bool {
    !*b
}

/// Tagged, plain-data form of a [`FindOperator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorNode {
    /// Operator tag. Kept as a string so unknown tags reach [`Self::decode`].
    #[serde(rename = "$operator")]
    pub kind: String,
    /// Operand; absent for `isNull`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Set for list-valued kinds.
    #[serde(default, skip_serializing_if = "is_false")]
    pub multi: bool,
}

impl OperatorNode {
    /// Whether a JSON value is shaped like an operator node.
    pub fn is_node(value: &Value) -> bool {
        value
            .as_object()
            .is_some_and(|map| map.contains_key(OPERATOR_KEY))
    }

    /// Parse a node from its JSON form.
    pub fn from_json(value: &Value) -> BridgeResult<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| BridgeError::MalformedDescriptor(format!("invalid operator node: {}", e)))
    }

    pub fn to_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert(OPERATOR_KEY.to_string(), Value::String(self.kind.clone()));
        if let Some(value) = &self.value {
            map.insert("value".to_string(), value.clone());
        }
        if self.multi {
            map.insert("multi".to_string(), Value::Bool(true));
        }
        Value::Object(map)
    }

    /// Rebuild the live operator.
    ///
    /// # Errors
    ///
    /// - `UnsupportedOperator` if the tag is outside [`OperatorKind::ALL`].
    /// - `MalformedDescriptor` if the value is missing or has the wrong shape.
    pub fn decode(&self) -> BridgeResult<FindOperator> {
        let kind = OperatorKind::parse(&self.kind)
            .ok_or_else(|| BridgeError::UnsupportedOperator(self.kind.clone()))?;

        let op = match kind {
            OperatorKind::Equal => FindOperator::Equal(self.scalar(kind)?),
            OperatorKind::LessThan => FindOperator::LessThan(self.scalar(kind)?),
            OperatorKind::LessThanOrEqual => FindOperator::LessThanOrEqual(self.scalar(kind)?),
            OperatorKind::MoreThan => FindOperator::MoreThan(self.scalar(kind)?),
            OperatorKind::MoreThanOrEqual => FindOperator::MoreThanOrEqual(self.scalar(kind)?),
            OperatorKind::Not => FindOperator::Not(Box::new(self.negated()?)),
            OperatorKind::In => FindOperator::In(self.list(kind)?),
            OperatorKind::Any => FindOperator::Any(self.list(kind)?),
            OperatorKind::ArrayContains => FindOperator::ArrayContains(self.list(kind)?),
            OperatorKind::ArrayContainedBy => FindOperator::ArrayContainedBy(self.list(kind)?),
            OperatorKind::ArrayOverlap => FindOperator::ArrayOverlap(self.list(kind)?),
            OperatorKind::Between => {
                let mut bounds = self.list(kind)?;
                if bounds.len() != 2 {
                    return Err(malformed(kind, "expects exactly two bounds"));
                }
                let high = bounds.pop();
                let low = bounds.pop();
                match (low, high) {
                    (Some(low), Some(high)) => FindOperator::Between(low, high),
                    _ => return Err(malformed(kind, "expects exactly two bounds")),
                }
            }
            OperatorKind::Like => FindOperator::Like(self.text(kind)?),
            OperatorKind::Raw => FindOperator::Raw(self.text(kind)?),
            OperatorKind::IsNull => {
                if self.value.as_ref().is_some_and(|v| !v.is_null()) {
                    return Err(malformed(kind, "takes no value"));
                }
                FindOperator::IsNull
            }
        };

        Ok(op)
    }

    fn present(&self, kind: OperatorKind) -> BridgeResult<&Value> {
        match &self.value {
            Some(v) if !v.is_null() => Ok(v),
            _ => Err(malformed(kind, "requires a value")),
        }
    }

    fn scalar(&self, kind: OperatorKind) -> BridgeResult<Scalar> {
        let value = self.present(kind)?;
        Scalar::from_json(value).ok_or_else(|| malformed(kind, "expects a scalar value"))
    }

    fn list(&self, kind: OperatorKind) -> BridgeResult<Vec<Scalar>> {
        let items = self
            .present(kind)?
            .as_array()
            .ok_or_else(|| malformed(kind, "expects a list value"))?;
        items
            .iter()
            .map(|item| {
                Scalar::from_json(item).ok_or_else(|| malformed(kind, "expects a list of scalars"))
            })
            .collect()
    }

    fn text(&self, kind: OperatorKind) -> BridgeResult<String> {
        self.present(kind)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| malformed(kind, "expects a string value"))
    }

    fn negated(&self) -> BridgeResult<FindOperator> {
        let value = self.present(OperatorKind::Not)?;
        if Self::is_node(value) {
            return Self::from_json(value)?.decode();
        }
        Scalar::from_json(value)
            .map(FindOperator::Equal)
            .ok_or_else(|| malformed(OperatorKind::Not, "expects a scalar or an operator"))
    }
}

fn malformed(kind: OperatorKind, detail: &str) -> BridgeError {
    BridgeError::MalformedDescriptor(format!("operator `{}` {}", kind, detail))
}
