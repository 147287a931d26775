//! Document store layer for tiller.
//!
//! This crate provides the replicated-document-store abstraction the
//! state layer is built on: point lookups, field queries, conditional
//! multi-document transactions with a per-document revision counter, and
//! a per-collection change notification hub.
//!
//! # Architecture
//!
//! - [`Document`]: id + lifecycle + revision counter + field bag
//! - [`Op`]/[`Assert`]/[`Mutation`]: the conditional transaction model
//! - [`Runner`]: single-shot and bounded-retry transaction execution
//! - [`ChangeHub`]/[`ChangeFeed`]: the shared change-detection path,
//!   one dispatch point per collection
//! - [`MemStore`]: in-memory implementation for tests and embedding
//! - [`RocksStore`]: persistent implementation, one column family per
//!   collection, CBOR-encoded values
//!
//! # Example
//!
//! ```
//! use tiller_store::{Collection, DocumentStore, Fields, MemStore, Op};
//!
//! let store = MemStore::new();
//! store.apply(vec![Op::insert(Collection::Machines, "0", Fields::new())]).unwrap();
//!
//! let doc = store.find_by_id(Collection::Machines, "0").unwrap().unwrap();
//! assert_eq!(doc.txn_revno, 1);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod document;
pub mod error;
pub mod hub;
pub mod mem;
pub mod rocks;
pub mod schema;
pub mod txn;

pub use document::{Document, Fields};
pub use error::{Result, StoreError};
pub use hub::{ChangeEvent, ChangeFeed, ChangeHub};
pub use mem::MemStore;
pub use rocks::RocksStore;
pub use schema::Collection;
pub use txn::{Assert, Mutation, Op, Runner, MAX_TXN_ATTEMPTS};

use serde_json::Value;

/// The storage trait defining all document store operations.
///
/// This trait abstracts the store, allowing different implementations
/// (`RocksDB` for persistence, in-memory for testing). Reads are
/// point-in-time snapshots; writes go through [`apply`](Self::apply) as
/// conditional transactions.
pub trait DocumentStore: Send + Sync {
    /// Look up one document by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn find_by_id(&self, collection: Collection, id: &str) -> Result<Option<Document>>;

    /// Find all documents whose `field` equals `value`.
    ///
    /// The result is a snapshot relative to call time and may be stale by
    /// the time the caller acts on it.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn find_by_field(&self, collection: Collection, field: &str, value: &Value) -> Result<Vec<Document>>;

    /// All document ids in a collection, used to bootstrap watcher
    /// initial batches.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn ids(&self, collection: Collection) -> Result<Vec<String>>;

    /// Apply a conditional transaction: either every op commits or none
    /// does. The ids touched by a successful commit are published to the
    /// collection's change feeds in commit order.
    ///
    /// # Errors
    ///
    /// `StoreError::Aborted` if an assertion failed against an existing
    /// document, `StoreError::NotFound` if an assertion referenced a
    /// missing document, or a database error.
    fn apply(&self, ops: Vec<Op>) -> Result<()>;

    /// Return and advance a named monotonic counter. Values start at 0
    /// and are never reused.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn next_sequence(&self, name: &str) -> Result<u64>;

    /// Subscribe to the collection's change feed: a lazy unbounded
    /// sequence of changed-id sets, one per committed transaction.
    fn subscribe(&self, collection: Collection) -> ChangeFeed;
}
