//! Storage-node RPC layer for Skerry.
//!
//! Two halves: the canonical [`StorageError`] set with its wire mapping
//! ([`to_storage_err`]), and [`RemoteDisk`] — the HTTP client that lets
//! any node invoke the primitive file operations of any other node's
//! local disk, with explicit failure classification and connection health
//! tracking.

mod client;
mod error;
pub mod frames;
mod timed;
pub mod wire;

#[cfg(test)]
mod tests;

pub use client::{RemoteDisk, STORAGE_REST_PREFIX};
pub use error::{classify_transport_err, is_network_error, to_storage_err, StorageError};
pub use timed::TtlCell;
