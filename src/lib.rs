//! # repobridge
//!
//! Repository-style queries across an execution boundary.
//!
//! ## Architecture
//!
//! A caller builds query descriptors (plain data plus typed find operators),
//! the client serializes them into request envelopes, and a dispatcher on the
//! other side of a message channel decodes them and runs them against an
//! embedded SQLite engine once it has finished starting up:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │   Client / Repository  (descriptors, typed results)     │
//! │   PendingTable: id → waiting caller                     │
//! └─────────────────────────────────────────────────────────┘
//!                          │  RequestEnvelope { id, type, payload }
//!                          ▼  [transport: in-memory or NDJSON]
//! ┌─────────────────────────────────────────────────────────┐
//! │   Dispatcher  (one task per request, replies by id)     │
//! └─────────────────────────────────────────────────────────┘
//!                          │  waits on Bootstrap gate
//!                          ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │   Engine: SqliteEngine  (schema registry, migrations)   │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod schema;
pub mod transport;

pub use client::{Client, Repository};
pub use config::Settings;
pub use dispatcher::Dispatcher;
pub use engine::{Bootstrap, BootstrapState, Engine, SqliteEngine};
pub use error::{BridgeError, BridgeResult, ErrorKind};
pub use protocol::{Descriptor, FindOperator, Operation, OperatorKind, Scalar};
pub use schema::Registry;
