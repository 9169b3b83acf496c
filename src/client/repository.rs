//! Typed per-collection facade over [`Client`].

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::rpc::Client;
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{Descriptor, Operation};

/// Repository for one collection, e.g. `client.repository("Session")`.
///
/// Results are deserialized into caller types; a result that does not fit
/// the requested type is reported as `MalformedDescriptor`.
pub struct Repository<'a> {
    client: &'a Client,
    name: String,
}

fn decode<T: DeserializeOwned>(value: Value) -> BridgeResult<T> {
    serde_json::from_value(value)
        .map_err(|e| BridgeError::MalformedDescriptor(format!("unexpected result shape: {}", e)))
}

fn encode<T: Serialize>(entity: &T) -> BridgeResult<Descriptor> {
    let value = serde_json::to_value(entity)
        .map_err(|e| BridgeError::MalformedDescriptor(e.to_string()))?;
    Descriptor::deserialize(&value)
}

fn affected(value: Value) -> BridgeResult<u64> {
    value
        .get("affected")
        .and_then(Value::as_u64)
        .ok_or_else(|| BridgeError::MalformedDescriptor("missing `affected` count".to_string()))
}

impl<'a> Repository<'a> {
    pub(crate) fn new(client: &'a Client, name: String) -> Self {
        Self { client, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, operation: Operation, descriptor: &Descriptor) -> BridgeResult<Value> {
        self.client.call(operation, &self.name, descriptor).await
    }

    pub async fn find<T: DeserializeOwned>(&self, options: &Descriptor) -> BridgeResult<Vec<T>> {
        decode(self.execute(Operation::Find, options).await?)
    }

    pub async fn find_one<T: DeserializeOwned>(&self, options: &Descriptor) -> BridgeResult<Option<T>> {
        decode(self.execute(Operation::FindOne, options).await?)
    }

    pub async fn count(&self, options: &Descriptor) -> BridgeResult<u64> {
        decode(self.execute(Operation::Count, options).await?)
    }

    /// Insert or update one entity; returns it as stored.
    pub async fn save<T>(&self, entity: &T) -> BridgeResult<T>
    where
        T: Serialize + DeserializeOwned,
    {
        decode(self.execute(Operation::Save, &encode(entity)?).await?)
    }

    /// Insert or update several entities in one transaction.
    pub async fn save_many<T>(&self, entities: &[T]) -> BridgeResult<Vec<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        decode(self.execute(Operation::Save, &encode(&entities)?).await?)
    }

    /// Apply `set` to rows matching `criteria`; returns the number affected.
    pub async fn update(&self, criteria: Descriptor, set: Descriptor) -> BridgeResult<u64> {
        let descriptor = Descriptor::map([("where", criteria), ("set", set)]);
        affected(self.execute(Operation::Update, &descriptor).await?)
    }

    /// Remove rows matching `criteria`; returns the number affected.
    pub async fn delete(&self, criteria: Descriptor) -> BridgeResult<u64> {
        let descriptor = Descriptor::map([("where", criteria)]);
        affected(self.execute(Operation::Delete, &descriptor).await?)
    }
}
