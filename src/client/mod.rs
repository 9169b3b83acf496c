//! Caller side of the bridge.
//!
//! The [`Client`] sends request envelopes over an [`Endpoint`] and matches
//! responses back to callers through the [`PendingTable`].
//!
//! [`Endpoint`]: crate::transport::Endpoint

mod pending;
mod repository;
mod rpc;

pub use pending::PendingTable;
pub use repository::Repository;
pub use rpc::Client;
