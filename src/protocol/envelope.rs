//! Request and response envelopes exchanged across the channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BridgeError, BridgeResult};

// ============================================================================
// Request/Response Envelope
// ============================================================================

/// Request envelope sent to the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Unique request ID for correlation.
    pub id: String,
    /// Request type (see [`RequestKind`]).
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific payload.
    #[serde(default)]
    pub payload: Value,
}

/// Response envelope received from the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Request ID this response corresponds to.
    pub id: String,
    /// Result data (absent or null on failure).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error information (present on failure).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// Error information in a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Human-readable error message.
    pub message: String,
    /// Error kind, one of the names in [`crate::ErrorKind`].
    pub kind: String,
}

impl RequestEnvelope {
    /// Build a request of the given kind.
    pub fn new(id: impl Into<String>, kind: RequestKind, payload: Value) -> Self {
        Self {
            id: id.into(),
            kind: kind.as_str().to_string(),
            payload,
        }
    }
}

impl ResponseEnvelope {
    /// Successful response carrying `result`.
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// Failed response carrying the error's wire descriptor.
    pub fn failure(id: impl Into<String>, error: &BridgeError) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error.to_info()),
        }
    }

    /// Build from the outcome of handling a request.
    pub fn from_outcome(id: impl Into<String>, outcome: BridgeResult<Value>) -> Self {
        match outcome {
            Ok(result) => Self::success(id, result),
            Err(err) => Self::failure(id, &err),
        }
    }

    /// Convert back into the outcome the caller awaits.
    ///
    /// An error descriptor wins over a result; a missing result is `null`.
    pub fn into_outcome(self) -> BridgeResult<Value> {
        match self.error {
            Some(info) => Err(BridgeError::from_info(&info)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

// ============================================================================
// Request Types
// ============================================================================

/// Envelope `type` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Trigger bootstrap and wait for the engine to become ready.
    Init,
    /// `[collection, operation, descriptor]` against the repository API.
    RepositoryExecute,
    /// `[sql, params]` straight to the engine.
    RawQueryExecute,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::RepositoryExecute => "repositoryExecute",
            Self::RawQueryExecute => "rawQueryExecute",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "init" => Some(Self::Init),
            "repositoryExecute" => Some(Self::RepositoryExecute),
            "rawQueryExecute" => Some(Self::RawQueryExecute),
            _ => None,
        }
    }
}

/// Repository operations, the closed set the dispatcher maps onto the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Find,
    FindOne,
    Count,
    Save,
    Update,
    Delete,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Self::Find,
        Self::FindOne,
        Self::Count,
        Self::Save,
        Self::Update,
        Self::Delete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Find => "find",
            Self::FindOne => "findOne",
            Self::Count => "count",
            Self::Save => "save",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == s)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
