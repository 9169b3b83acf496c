//! Engine-side request loop.
//!
//! # Architecture
//!
//! ```text
//! Endpoint receives frame → run loop → one task per frame
//!     ↓
//! Validate envelope, collection, operation, descriptor
//!     ↓
//! Wait on the readiness gate → call the engine
//!     ↓
//! Reply with the original id
//! ```
//!
//! Nothing a single request does can stop the loop: failures and panics are
//! turned into failure replies for that request alone.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::{json, Value};
use tracing::Instrument;

use crate::config::Settings;
use crate::engine::options::raw_params;
use crate::engine::{
    builtin_migrations, Bootstrap, DeleteInput, Engine, FindOptions, SaveInput, UpdateInput,
};
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{Descriptor, Operation, RequestEnvelope, RequestKind, ResponseEnvelope};
use crate::schema::{EntitySchema, Registry};
use crate::transport::Endpoint;

/// A repository call, fully validated and ready for the engine.
#[derive(Debug, Clone, PartialEq)]
enum Call {
    Find(FindOptions),
    FindOne(FindOptions),
    Count(FindOptions),
    Save(SaveInput),
    Update(UpdateInput),
    Delete(DeleteInput),
}

impl Call {
    fn prepare(operation: Operation, descriptor: &Descriptor) -> BridgeResult<Self> {
        Ok(match operation {
            Operation::Find => Self::Find(FindOptions::from_descriptor(descriptor)?),
            Operation::FindOne => Self::FindOne(FindOptions::from_descriptor(descriptor)?),
            Operation::Count => Self::Count(FindOptions::from_descriptor(descriptor)?),
            Operation::Save => Self::Save(SaveInput::from_descriptor(descriptor)?),
            Operation::Update => Self::Update(UpdateInput::from_descriptor(descriptor)?),
            Operation::Delete => Self::Delete(DeleteInput::from_descriptor(descriptor)?),
        })
    }

    async fn execute(self, engine: &dyn Engine, entity: &'static EntitySchema) -> BridgeResult<Value> {
        let result = match self {
            Self::Find(options) => {
                let rows = engine.find(entity, options).await?;
                Value::Array(rows.into_iter().map(Value::Object).collect())
            }
            Self::FindOne(options) => engine
                .find_one(entity, options)
                .await?
                .map_or(Value::Null, Value::Object),
            Self::Count(options) => json!(engine.count(entity, options).await?),
            Self::Save(input) => {
                let many = input.many;
                let mut rows = engine.save(entity, input).await?;
                if many {
                    Value::Array(rows.into_iter().map(Value::Object).collect())
                } else if rows.is_empty() {
                    Value::Null
                } else {
                    Value::Object(rows.swap_remove(0))
                }
            }
            Self::Update(input) => json!({ "affected": engine.update(entity, input).await? }),
            Self::Delete(input) => json!({ "affected": engine.delete(entity, input).await? }),
        };
        Ok(result)
    }
}

fn malformed(msg: impl Into<String>) -> BridgeError {
    BridgeError::MalformedDescriptor(msg.into())
}

/// Serves repository and raw-query requests against the engine.
pub struct Dispatcher {
    registry: Registry,
    bootstrap: Arc<Bootstrap>,
    auto_start: bool,
}

impl Dispatcher {
    /// Dispatcher over an existing gate. Bootstrap starts on the first `init`
    /// request unless auto-start is enabled.
    pub fn new(registry: Registry, bootstrap: Arc<Bootstrap>) -> Self {
        Self {
            registry,
            bootstrap,
            auto_start: false,
        }
    }

    /// SQLite-backed dispatcher over the built-in entities and migrations.
    pub fn from_settings(settings: &Settings) -> Self {
        let registry = Registry::default();
        let bootstrap = Bootstrap::sqlite(
            settings.engine.clone(),
            settings.bootstrap.on_failure,
            registry,
            builtin_migrations(),
        );
        Self::new(registry, bootstrap).with_auto_start(settings.bootstrap.auto_start)
    }

    /// Trigger bootstrap as soon as [`Dispatcher::run`] starts.
    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// Serve frames from `endpoint` until its inbound side closes.
    pub async fn run(self: Arc<Self>, endpoint: Endpoint) {
        if self.auto_start {
            self.bootstrap.trigger();
        }

        let (outbound, mut inbound) = endpoint.split();
        while let Some(frame) = inbound.recv().await {
            let Some(id) = frame.get("id").and_then(Value::as_str).map(str::to_string) else {
                tracing::warn!("dropping frame without an id");
                continue;
            };

            let this = Arc::clone(&self);
            let outbound = outbound.clone();
            let span = tracing::debug_span!("request", id = %id);
            tokio::spawn(
                async move {
                    let outcome = match AssertUnwindSafe(this.handle(frame)).catch_unwind().await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            tracing::error!("request handler panicked");
                            Err(BridgeError::EngineExecution("request handler panicked".to_string()))
                        }
                    };

                    if let Err(err) = &outcome {
                        tracing::debug!(error = %err, "request failed");
                    }

                    let reply = ResponseEnvelope::from_outcome(id, outcome);
                    match serde_json::to_value(&reply) {
                        Ok(frame) => {
                            if outbound.send(frame).await.is_err() {
                                tracing::debug!("reply channel closed");
                            }
                        }
                        Err(e) => tracing::error!(error = %e, "failed to encode reply"),
                    }
                }
                .instrument(span),
            );
        }

        tracing::debug!("request channel closed, dispatcher exiting");
    }

    /// Handle one request frame and produce its result.
    pub async fn handle(&self, frame: Value) -> BridgeResult<Value> {
        let request: RequestEnvelope = serde_json::from_value(frame)
            .map_err(|e| malformed(format!("invalid request envelope: {}", e)))?;

        match RequestKind::parse(&request.kind) {
            Some(RequestKind::Init) => {
                self.bootstrap.trigger();
                self.bootstrap.wait_ready().await?;
                Ok(json!({ "ready": true }))
            }
            Some(RequestKind::RepositoryExecute) => self.repository_execute(request.payload).await,
            Some(RequestKind::RawQueryExecute) => self.raw_query_execute(request.payload).await,
            None => Err(BridgeError::UnknownOperation(request.kind)),
        }
    }

    async fn repository_execute(&self, payload: Value) -> BridgeResult<Value> {
        let (collection, operation, descriptor) = match payload {
            Value::Array(mut parts) if (2..=3).contains(&parts.len()) => {
                let descriptor = if parts.len() == 3 { parts.pop() } else { None };
                let operation = parts.pop();
                let collection = parts.pop();
                (collection, operation, descriptor.unwrap_or(Value::Null))
            }
            _ => return Err(malformed("payload must be [collection, operation, descriptor]")),
        };

        let collection = match collection {
            Some(Value::String(s)) => s,
            _ => return Err(malformed("collection must be a string")),
        };
        let operation = match operation {
            Some(Value::String(s)) => s,
            _ => return Err(malformed("operation must be a string")),
        };

        let entity = self
            .registry
            .get(&collection)
            .ok_or_else(|| BridgeError::UnknownEntity(collection.clone()))?;
        let operation =
            Operation::parse(&operation).ok_or(BridgeError::UnknownOperation(operation))?;

        let descriptor = Descriptor::deserialize(&descriptor)?;
        let call = Call::prepare(operation, &descriptor)?;

        let engine = self.bootstrap.wait_ready().await?;
        tracing::debug!(collection = %collection, operation = %operation, "executing");
        call.execute(engine.as_ref(), entity).await
    }

    async fn raw_query_execute(&self, payload: Value) -> BridgeResult<Value> {
        let (sql, params) = match payload {
            Value::Array(parts) => {
                let mut parts = parts.into_iter();
                let sql = match parts.next() {
                    Some(Value::String(sql)) => sql,
                    _ => return Err(malformed("raw query payload must start with SQL text")),
                };
                let params = match parts.next() {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(params)) => raw_params(&params)?,
                    Some(_) => return Err(malformed("raw query parameters must be a list")),
                };
                (sql, params)
            }
            _ => return Err(malformed("payload must be [sql, params]")),
        };

        let engine = self.bootstrap.wait_ready().await?;
        tracing::debug!(sql = %sql, "executing raw query");
        Ok(engine.raw_query(sql, params).await?.into_json())
    }
}
