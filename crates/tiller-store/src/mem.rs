//! In-memory storage implementation.
//!
//! `MemStore` keeps every collection in a `BTreeMap` behind a single
//! commit lock. It implements the same transactional contract as the
//! RocksDB backend and is the implementation of choice for tests and
//! single-process embedding.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::document::Document;
use crate::error::Result;
use crate::hub::{ChangeFeed, ChangeHub};
use crate::schema::Collection;
use crate::txn::{stage_ops, Op};
use crate::DocumentStore;

/// In-memory document store.
#[derive(Debug, Default)]
pub struct MemStore {
    collections: Mutex<HashMap<Collection, BTreeMap<String, Document>>>,
    sequences: Mutex<HashMap<String, u64>>,
    hub: Arc<ChangeHub>,
}

impl MemStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for MemStore {
    fn find_by_id(&self, collection: Collection, id: &str) -> Result<Option<Document>> {
        Ok(self
            .collections
            .lock()
            .get(&collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    fn find_by_field(&self, collection: Collection, field: &str, value: &Value) -> Result<Vec<Document>> {
        Ok(self
            .collections
            .lock()
            .get(&collection)
            .map(|docs| {
                docs.values()
                    .filter(|doc| doc.field(field) == Some(value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn ids(&self, collection: Collection) -> Result<Vec<String>> {
        Ok(self
            .collections
            .lock()
            .get(&collection)
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn apply(&self, ops: Vec<Op>) -> Result<()> {
        // The collections mutex doubles as the commit lock: assertions,
        // writes and change publication happen under it, so feeds see
        // batches in durable commit order.
        let mut collections = self.collections.lock();

        let staged = stage_ops(&ops, |collection, id| {
            Ok(collections
                .get(&collection)
                .and_then(|docs| docs.get(id))
                .cloned())
        })?;

        let mut changed: BTreeMap<Collection, Vec<String>> = BTreeMap::new();
        for (collection, id, doc) in staged {
            let docs = collections.entry(collection).or_default();
            match doc {
                Some(doc) => {
                    docs.insert(id.clone(), doc);
                }
                None => {
                    docs.remove(&id);
                }
            }
            changed.entry(collection).or_default().push(id);
        }

        for (collection, ids) in changed {
            self.hub.publish(collection, ids);
        }
        Ok(())
    }

    fn next_sequence(&self, name: &str) -> Result<u64> {
        let mut sequences = self.sequences.lock();
        let counter = sequences.entry(name.to_string()).or_insert(0);
        let value = *counter;
        *counter += 1;
        Ok(value)
    }

    fn subscribe(&self, collection: Collection) -> ChangeFeed {
        self.hub.subscribe(collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Fields;
    use crate::error::StoreError;
    use crate::txn::{Assert, Mutation};
    use serde_json::json;
    use tiller_core::Life;

    fn fields(pairs: &[(&str, Value)]) -> Fields {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn insert_and_find() {
        let store = MemStore::new();
        store
            .apply(vec![Op::insert(
                Collection::Machines,
                "0",
                fields(&[("workers", json!(["deployer"]))]),
            )])
            .unwrap();

        let doc = store.find_by_id(Collection::Machines, "0").unwrap().unwrap();
        assert_eq!(doc.life, Life::Alive);
        assert_eq!(doc.txn_revno, 1);
        assert_eq!(doc.field("workers"), Some(&json!(["deployer"])));
        assert!(store.find_by_id(Collection::Machines, "1").unwrap().is_none());
    }

    #[test]
    fn insert_twice_aborts() {
        let store = MemStore::new();
        let op = || Op::insert(Collection::Machines, "0", Fields::new());
        store.apply(vec![op()]).unwrap();
        assert!(matches!(store.apply(vec![op()]), Err(StoreError::Aborted)));
    }

    #[test]
    fn find_by_field_snapshot() {
        let store = MemStore::new();
        for (id, machine) in [("app/0", 0), ("app/1", 0), ("db/0", 1)] {
            store
                .apply(vec![Op::insert(
                    Collection::Units,
                    id,
                    fields(&[("machine_id", json!(machine))]),
                )])
                .unwrap();
        }

        let on_zero = store
            .find_by_field(Collection::Units, "machine_id", &json!(0))
            .unwrap();
        let names: Vec<_> = on_zero.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(names, vec!["app/0", "app/1"]);
    }

    #[test]
    fn failed_assertion_applies_nothing() {
        let store = MemStore::new();
        store
            .apply(vec![Op::insert(Collection::Machines, "0", Fields::new())])
            .unwrap();

        // Second op's assertion fails; the first op must not stick.
        let result = store.apply(vec![
            Op::set_fields(
                Collection::Machines,
                "0",
                fields(&[("instance_id", json!("i-123"))]),
            ),
            Op {
                collection: Collection::Machines,
                id: "0".into(),
                assert: Assert::RevnoIs(99),
                mutation: Mutation::SetLife(Life::Dying),
            },
        ]);
        assert!(matches!(result, Err(StoreError::Aborted)));

        let doc = store.find_by_id(Collection::Machines, "0").unwrap().unwrap();
        assert_eq!(doc.txn_revno, 1);
        assert_eq!(doc.field("instance_id"), None);
        assert_eq!(doc.life, Life::Alive);
    }

    #[test]
    fn revno_strictly_increases() {
        let store = MemStore::new();
        store
            .apply(vec![Op::insert(Collection::Machines, "0", Fields::new())])
            .unwrap();
        for revno in 2..=5 {
            store
                .apply(vec![Op::set_fields(
                    Collection::Machines,
                    "0",
                    fields(&[("instance_id", json!(format!("i-{revno}")))]),
                )])
                .unwrap();
            let doc = store.find_by_id(Collection::Machines, "0").unwrap().unwrap();
            assert_eq!(doc.txn_revno, revno);
        }
    }

    #[test]
    fn remove_then_find_is_none() {
        let store = MemStore::new();
        store
            .apply(vec![Op::insert(Collection::Relations, "3", Fields::new())])
            .unwrap();
        store.apply(vec![Op::remove(Collection::Relations, "3")]).unwrap();
        assert!(store.find_by_id(Collection::Relations, "3").unwrap().is_none());

        // Removing again: the document is gone.
        assert!(matches!(
            store.apply(vec![Op::remove(Collection::Relations, "3")]),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn sequences_are_independent_and_monotonic() {
        let store = MemStore::new();
        assert_eq!(store.next_sequence("machines").unwrap(), 0);
        assert_eq!(store.next_sequence("machines").unwrap(), 1);
        assert_eq!(store.next_sequence("units-app").unwrap(), 0);
        assert_eq!(store.next_sequence("machines").unwrap(), 2);
    }

    #[tokio::test]
    async fn commits_publish_changed_ids() {
        let store = MemStore::new();
        let mut feed = store.subscribe(Collection::Machines);

        store
            .apply(vec![
                Op::insert(Collection::Machines, "0", Fields::new()),
                Op::insert(Collection::Machines, "1", Fields::new()),
                Op::insert(Collection::Units, "app/0", Fields::new()),
            ])
            .unwrap();

        let event = feed.recv().await.unwrap();
        assert_eq!(event.ids, vec!["0".to_string(), "1".to_string()]);
        // The units change went to the units feed, not this one.
        assert!(feed.try_recv().is_none());
    }

    #[tokio::test]
    async fn aborted_commit_publishes_nothing() {
        let store = MemStore::new();
        store
            .apply(vec![Op::insert(Collection::Machines, "0", Fields::new())])
            .unwrap();
        let mut feed = store.subscribe(Collection::Machines);

        let result = store.apply(vec![Op::insert(Collection::Machines, "0", Fields::new())]);
        assert!(matches!(result, Err(StoreError::Aborted)));
        assert!(feed.try_recv().is_none());
    }
}
