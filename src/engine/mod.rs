//! Embedded engine side of the bridge.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Dispatcher                             │
//! │   waits on Bootstrap ──► Arc<dyn Engine> (only once Ready)      │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        SqliteEngine                             │
//! │  - rusqlite Connection behind a mutex                           │
//! │  - statements built by `sql` from typed `options`               │
//! │  - every call runs on the blocking pool                         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The dispatcher never holds an engine before bootstrap finishes: the only
//! way to obtain one is [`Bootstrap::wait_ready`].

mod bootstrap;
mod error;
pub mod options;
pub mod sql;
mod sqlite;

use async_trait::async_trait;
use serde_json::{Map, Value};

pub use bootstrap::{
    apply_migrations, builtin_migrations, sync_schema, Bootstrap, BootstrapState, Migration,
    SchemaReport,
};
pub use error::{EngineError, EngineResult};
pub use options::{DeleteInput, Filter, FindOptions, SaveInput, UpdateInput};
pub use sqlite::SqliteEngine;

use crate::protocol::Scalar;
use crate::schema::EntitySchema;

/// A row keyed by column name.
pub type Row = Map<String, Value>;

/// Outcome of a raw query.
#[derive(Debug, Clone, PartialEq)]
pub enum RawResult {
    /// The statement produced columns.
    Rows(Vec<Row>),
    /// The statement changed rows.
    Affected(u64),
}

impl RawResult {
    pub fn into_json(self) -> Value {
        match self {
            Self::Rows(rows) => Value::Array(rows.into_iter().map(Value::Object).collect()),
            Self::Affected(n) => serde_json::json!({ "affected": n }),
        }
    }
}

/// The embedded engine's native API, as the dispatcher sees it.
#[async_trait]
pub trait Engine: Send + Sync {
    /// All rows matching the options.
    async fn find(&self, entity: &'static EntitySchema, options: FindOptions) -> EngineResult<Vec<Row>>;

    /// First row matching the options.
    async fn find_one(
        &self,
        entity: &'static EntitySchema,
        options: FindOptions,
    ) -> EngineResult<Option<Row>>;

    /// Number of rows matching the filter.
    async fn count(&self, entity: &'static EntitySchema, options: FindOptions) -> EngineResult<u64>;

    /// Upsert entities by primary key and return them as stored.
    async fn save(&self, entity: &'static EntitySchema, input: SaveInput) -> EngineResult<Vec<Row>>;

    /// Apply `set` to matching rows; returns the number affected.
    async fn update(&self, entity: &'static EntitySchema, input: UpdateInput) -> EngineResult<u64>;

    /// Remove matching rows; returns the number affected.
    async fn delete(&self, entity: &'static EntitySchema, input: DeleteInput) -> EngineResult<u64>;

    /// Run SQL text with positional parameters.
    async fn raw_query(&self, sql: String, params: Vec<Option<Scalar>>) -> EngineResult<RawResult>;
}
