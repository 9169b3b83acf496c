//! Wire protocol between the repository facade and the dispatcher.
//!
//! Everything that crosses the channel is plain `serde_json::Value` data:
//!
//! ```text
//! request:  {"id": "...", "type": "repositoryExecute", "payload": [collection, operation, descriptor]}
//!           {"id": "...", "type": "rawQueryExecute",   "payload": [sql, params]}
//!           {"id": "...", "type": "init"}
//! response: {"id": "...", "result": ...}
//!           {"id": "...", "error": {"message": "...", "kind": "UnknownEntity"}}
//! ```
//!
//! Operators inside descriptors travel as `{"$operator": kind, "value": ..., "multi": true}`.

mod descriptor;
mod envelope;
mod operator;

pub use descriptor::{Descriptor, Scalar};
pub use envelope::{ErrorInfo, Operation, RequestEnvelope, RequestKind, ResponseEnvelope};
pub use operator::{FindOperator, OperatorKind, OperatorNode, OPERATOR_KEY};
