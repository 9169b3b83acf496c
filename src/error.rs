//! Bridge-level error types.
//!
//! Every failure a caller of the repository facade can observe is one of the
//! [`BridgeError`] variants. The same set travels over the wire as an
//! [`ErrorInfo`] so the client can rebuild the typed error on its side.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::ErrorInfo;

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors surfaced by the client facade and produced by the dispatcher.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// The engine never reached the ready state (bootstrap failed).
    #[error("engine not initialized: {0}")]
    EngineNotInitialized(String),

    /// The named collection is not part of the entity registry.
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    /// The operation (or envelope type) is outside the closed set.
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    /// An operator node carried a kind neither side agrees on.
    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),

    /// The descriptor tree has the wrong shape for the requested operation.
    #[error("malformed descriptor: {0}")]
    MalformedDescriptor(String),

    /// The embedded engine raised an error while executing the call.
    #[error("engine execution failed: {0}")]
    EngineExecution(String),

    /// Sending or receiving on the channel failed.
    #[error("channel error: {0}")]
    Channel(String),

    /// No response arrived before the call's deadline.
    #[error("request timed out after {0} ms")]
    Timeout(u64),
}

/// Wire-level discriminant of a [`BridgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    EngineNotInitialized,
    UnknownEntity,
    UnknownOperation,
    UnsupportedOperator,
    MalformedDescriptor,
    EngineExecution,
    Channel,
    Timeout,
}

impl ErrorKind {
    /// Name carried in the `kind` field of a failure envelope.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EngineNotInitialized => "EngineNotInitialized",
            Self::UnknownEntity => "UnknownEntity",
            Self::UnknownOperation => "UnknownOperation",
            Self::UnsupportedOperator => "UnsupportedOperator",
            Self::MalformedDescriptor => "MalformedDescriptor",
            Self::EngineExecution => "EngineExecutionError",
            Self::Channel => "ChannelError",
            Self::Timeout => "Timeout",
        }
    }

    /// Parse a wire name. Unrecognized names yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "EngineNotInitialized" => Some(Self::EngineNotInitialized),
            "UnknownEntity" => Some(Self::UnknownEntity),
            "UnknownOperation" => Some(Self::UnknownOperation),
            "UnsupportedOperator" => Some(Self::UnsupportedOperator),
            "MalformedDescriptor" => Some(Self::MalformedDescriptor),
            "EngineExecutionError" => Some(Self::EngineExecution),
            "ChannelError" => Some(Self::Channel),
            "Timeout" => Some(Self::Timeout),
            _ => None,
        }
    }
}

impl BridgeError {
    /// Build a timeout error from the elapsed deadline.
    pub fn timeout(deadline: Duration) -> Self {
        Self::Timeout(deadline.as_millis() as u64)
    }

    /// The wire discriminant for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EngineNotInitialized(_) => ErrorKind::EngineNotInitialized,
            Self::UnknownEntity(_) => ErrorKind::UnknownEntity,
            Self::UnknownOperation(_) => ErrorKind::UnknownOperation,
            Self::UnsupportedOperator(_) => ErrorKind::UnsupportedOperator,
            Self::MalformedDescriptor(_) => ErrorKind::MalformedDescriptor,
            Self::EngineExecution(_) => ErrorKind::EngineExecution,
            Self::Channel(_) => ErrorKind::Channel,
            Self::Timeout(_) => ErrorKind::Timeout,
        }
    }

    /// The bare message, without the kind prefix added by `Display`.
    pub fn message(&self) -> String {
        match self {
            Self::EngineNotInitialized(m)
            | Self::UnknownEntity(m)
            | Self::UnknownOperation(m)
            | Self::UnsupportedOperator(m)
            | Self::MalformedDescriptor(m)
            | Self::EngineExecution(m)
            | Self::Channel(m) => m.clone(),
            Self::Timeout(ms) => ms.to_string(),
        }
    }

    /// Convert into the failure descriptor sent back over the channel.
    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo {
            message: self.message(),
            kind: self.kind().as_str().to_string(),
        }
    }

    /// Rebuild a typed error from a failure descriptor.
    ///
    /// Kinds this side does not recognize are reported as engine execution
    /// failures so callers only ever see the documented set.
    pub fn from_info(info: &ErrorInfo) -> Self {
        let message = info.message.clone();
        match ErrorKind::parse(&info.kind) {
            Some(ErrorKind::EngineNotInitialized) => Self::EngineNotInitialized(message),
            Some(ErrorKind::UnknownEntity) => Self::UnknownEntity(message),
            Some(ErrorKind::UnknownOperation) => Self::UnknownOperation(message),
            Some(ErrorKind::UnsupportedOperator) => Self::UnsupportedOperator(message),
            Some(ErrorKind::MalformedDescriptor) => Self::MalformedDescriptor(message),
            Some(ErrorKind::Channel) => Self::Channel(message),
            Some(ErrorKind::Timeout) => Self::Timeout(message.parse().unwrap_or(0)),
            Some(ErrorKind::EngineExecution) => Self::EngineExecution(message),
            None => Self::EngineExecution(format!("{}: {}", info.kind, message)),
        }
    }

    /// Check if this error means the channel to the engine is gone.
    pub fn is_channel_closed(&self) -> bool {
        matches!(self, Self::Channel(_))
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for BridgeError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::Channel("response channel closed unexpectedly".to_string())
    }
}
