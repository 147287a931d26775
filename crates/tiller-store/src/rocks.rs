//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the
//! [`DocumentStore`] trait: one column family per collection plus one
//! for the named sequence counters, CBOR-encoded document values, and a
//! commit mutex serializing conditional transactions so assertion checks
//! and the batched write are one atomic step.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, WriteBatch,
};
use serde_json::Value;

use crate::document::Document;
use crate::error::{Result, StoreError};
use crate::hub::{ChangeFeed, ChangeHub};
use crate::schema::{all_column_families, Collection, SEQUENCES_CF};
use crate::txn::{stage_ops, Op};
use crate::DocumentStore;

/// RocksDB-backed document store.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    commit: Mutex<()>,
    hub: Arc<ChangeHub>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            commit: Mutex::new(()),
            hub: Arc::new(ChangeHub::new()),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn get_document(&self, collection: Collection, id: &str) -> Result<Option<Document>> {
        let cf = self.cf(collection.name())?;
        self.db
            .get_cf(&cf, id.as_bytes())
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }
}

impl DocumentStore for RocksStore {
    fn find_by_id(&self, collection: Collection, id: &str) -> Result<Option<Document>> {
        self.get_document(collection, id)
    }

    fn find_by_field(&self, collection: Collection, field: &str, value: &Value) -> Result<Vec<Document>> {
        let cf = self.cf(collection.name())?;
        let mut docs = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, data) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            let doc: Document = Self::deserialize(&data)?;
            if doc.field(field) == Some(value) {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    fn ids(&self, collection: Collection) -> Result<Vec<String>> {
        let cf = self.cf(collection.name())?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    fn apply(&self, ops: Vec<Op>) -> Result<()> {
        // Serialize transactions: assertions and the batched write must
        // be one atomic step with respect to other writers.
        let _commit = self.commit.lock();

        let staged = stage_ops(&ops, |collection, id| self.get_document(collection, id))?;

        let mut batch = WriteBatch::default();
        let mut changed: Vec<(Collection, Vec<String>)> = Vec::new();
        for (collection, id, doc) in staged {
            let cf = self.cf(collection.name())?;
            match &doc {
                Some(doc) => batch.put_cf(&cf, id.as_bytes(), Self::serialize(doc)?),
                None => batch.delete_cf(&cf, id.as_bytes()),
            }
            match changed.iter_mut().find(|(c, _)| *c == collection) {
                Some((_, ids)) => ids.push(id),
                None => changed.push((collection, vec![id])),
            }
        }

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        // Still under the commit lock, so feeds observe commit order.
        for (collection, ids) in changed {
            self.hub.publish(collection, ids);
        }
        Ok(())
    }

    fn next_sequence(&self, name: &str) -> Result<u64> {
        let _commit = self.commit.lock();
        let cf = self.cf(SEQUENCES_CF)?;
        let current = self
            .db
            .get_cf(&cf, name.as_bytes())
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| {
                let bytes: [u8; 8] = data
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Serialization("sequence counter corrupt".into()))?;
                Ok::<u64, StoreError>(u64::from_le_bytes(bytes))
            })
            .transpose()?
            .unwrap_or(0);
        self.db
            .put_cf(&cf, name.as_bytes(), (current + 1).to_le_bytes())
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(current)
    }

    fn subscribe(&self, collection: Collection) -> ChangeFeed {
        self.hub.subscribe(collection)
    }
}
