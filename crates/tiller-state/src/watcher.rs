//! Collection and entity change watchers.
//!
//! Watchers are long-lived notification channels over the store's shared
//! per-collection change feeds. Each watcher runs one background task
//! that classifies changed ids against the set the subscriber already
//! knows about and delivers coalesced batches: while the subscriber has
//! not consumed the previous batch, newly observed changes merge into
//! the pending one, so rapid repeated writes to the same id collapse
//! into a single notification.
//!
//! The first delivered batch describes the full existing state (all ids
//! as `added`), so a fresh subscriber needs no separate bootstrap query.
//! Stopping is idempotent and unblocks any in-flight receiver; a failed
//! background loop captures its failure once and replays it to every
//! caller of `failure`.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use tiller_store::{ChangeFeed, Collection, DocumentStore};

use crate::error::StateError;

/// One delivered batch of collection changes, covering every raw write
/// since the previous batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionChange {
    /// Ids that appeared since the last batch.
    pub added: Vec<String>,
    /// Ids that disappeared since the last batch.
    pub removed: Vec<String>,
    /// Ids that still exist but were materially changed.
    pub changed: Vec<String>,
}

impl CollectionChange {
    /// Whether the batch carries no changes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

#[derive(Debug, Default)]
struct Pending {
    added: BTreeSet<String>,
    removed: BTreeSet<String>,
    changed: BTreeSet<String>,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    fn take(&mut self) -> CollectionChange {
        CollectionChange {
            added: std::mem::take(&mut self.added).into_iter().collect(),
            removed: std::mem::take(&mut self.removed).into_iter().collect(),
            changed: std::mem::take(&mut self.changed).into_iter().collect(),
        }
    }

    /// Fold one observed id into the batch. `known` tracks the ids the
    /// subscriber has been told exist (delivered plus pending).
    fn note(&mut self, id: &str, exists: bool, known: &mut HashSet<String>) {
        if exists {
            if self.removed.remove(id) {
                // Removed and re-added before delivery: the subscriber
                // knew it, so it surfaces as changed.
                self.changed.insert(id.to_string());
                known.insert(id.to_string());
            } else if known.contains(id) {
                if !self.added.contains(id) {
                    self.changed.insert(id.to_string());
                }
            } else {
                self.added.insert(id.to_string());
                known.insert(id.to_string());
            }
        } else if self.added.remove(id) {
            // Appeared and vanished before delivery: the subscriber
            // never saw it.
            self.changed.remove(id);
            known.remove(id);
        } else if known.remove(id) {
            self.changed.remove(id);
            self.removed.insert(id.to_string());
        }
    }
}

/// A watcher over one collection, delivering batched id deltas.
#[derive(Debug)]
pub struct CollectionWatcher {
    rx: mpsc::Receiver<CollectionChange>,
    stop_tx: watch::Sender<bool>,
    failure: Arc<Mutex<Option<String>>>,
}

impl CollectionWatcher {
    pub(crate) fn new(store: Arc<dyn DocumentStore>, collection: Collection) -> Self {
        let feed = store.subscribe(collection);
        let (tx, rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let failure = Arc::new(Mutex::new(None));
        tokio::spawn(run_collection_loop(
            store,
            collection,
            feed,
            tx,
            stop_rx,
            Arc::clone(&failure),
        ));
        Self {
            rx,
            stop_tx,
            failure,
        }
    }

    /// Receive the next batch. Returns `None` once the watcher has been
    /// stopped or its background loop has ended; consult
    /// [`failure`](Self::failure) to distinguish failure from a clean
    /// stop.
    pub async fn next(&mut self) -> Option<CollectionChange> {
        self.rx.recv().await
    }

    /// Stop the watcher and release its feed subscription. Safe to call
    /// more than once; any in-flight receiver unblocks.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// The captured background-loop failure, if any, replayed to every
    /// caller.
    #[must_use]
    pub fn failure(&self) -> Option<StateError> {
        self.failure
            .lock()
            .as_ref()
            .map(|reason| StateError::WatcherFailed(reason.clone()))
    }

    pub(crate) fn failure_message(&self) -> Option<String> {
        self.failure.lock().clone()
    }
}

impl Drop for CollectionWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_collection_loop(
    store: Arc<dyn DocumentStore>,
    collection: Collection,
    mut feed: ChangeFeed,
    tx: mpsc::Sender<CollectionChange>,
    mut stop_rx: watch::Receiver<bool>,
    failure: Arc<Mutex<Option<String>>>,
) {
    let mut known: HashSet<String> = HashSet::new();
    let mut pending = Pending::default();

    match store.ids(collection) {
        Ok(ids) => {
            for id in ids {
                known.insert(id.clone());
                pending.added.insert(id);
            }
        }
        Err(err) => {
            *failure.lock() = Some(err.to_string());
            return;
        }
    }
    // The initial batch is always delivered, even when empty, so a
    // subscriber can rely on the first event describing full state.
    let mut have_batch = true;
    let mut dirty: BTreeSet<String> = BTreeSet::new();

    loop {
        if !dirty.is_empty() {
            for id in std::mem::take(&mut dirty) {
                match store.find_by_id(collection, &id) {
                    Ok(doc) => pending.note(&id, doc.is_some(), &mut known),
                    Err(err) => {
                        *failure.lock() = Some(err.to_string());
                        return;
                    }
                }
            }
            if !pending.is_empty() {
                have_batch = true;
            }
        }

        tokio::select! {
            _ = stop_rx.changed() => {
                tracing::debug!(%collection, "collection watcher stopped");
                return;
            }
            event = feed.recv() => {
                let Some(event) = event else { return };
                dirty.extend(event.ids);
                while let Some(more) = feed.try_recv() {
                    dirty.extend(more.ids);
                }
            }
            permit = tx.reserve(), if have_batch => {
                let Ok(permit) = permit else { return };
                permit.send(pending.take());
                have_batch = false;
            }
        }
    }
}

/// A watcher over one document, delivering a unit notification per
/// coalesced change, starting with one initial event.
#[derive(Debug)]
pub struct EntityWatcher {
    rx: mpsc::Receiver<()>,
    stop_tx: watch::Sender<bool>,
}

impl EntityWatcher {
    pub(crate) fn new(store: Arc<dyn DocumentStore>, collection: Collection, id: String) -> Self {
        let feed = store.subscribe(collection);
        let (tx, rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(run_entity_loop(feed, id, tx, stop_rx));
        Self { rx, stop_tx }
    }

    /// Receive the next notification; `None` once stopped.
    pub async fn next(&mut self) -> Option<()> {
        self.rx.recv().await
    }

    /// Stop the watcher. Safe to call more than once.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}

impl Drop for EntityWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_entity_loop(
    mut feed: ChangeFeed,
    id: String,
    tx: mpsc::Sender<()>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut have_event = true;
    loop {
        tokio::select! {
            _ = stop_rx.changed() => return,
            event = feed.recv() => {
                let Some(event) = event else { return };
                if event.ids.iter().any(|changed| *changed == id) {
                    have_event = true;
                }
            }
            permit = tx.reserve(), if have_event => {
                let Ok(permit) = permit else { return };
                permit.send(());
                have_event = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tiller_store::{Fields, MemStore, Op};

    fn store() -> Arc<dyn DocumentStore> {
        Arc::new(MemStore::new())
    }

    fn insert(store: &Arc<dyn DocumentStore>, id: &str) {
        store
            .apply(vec![Op::insert(Collection::Machines, id, Fields::new())])
            .unwrap();
    }

    fn set_field(store: &Arc<dyn DocumentStore>, id: &str, value: &str) {
        let mut fields = Fields::new();
        fields.insert("instance_id".into(), json!(value));
        store
            .apply(vec![Op::set_fields(Collection::Machines, id, fields)])
            .unwrap();
    }

    #[tokio::test]
    async fn initial_batch_contains_existing_ids() {
        let store = store();
        insert(&store, "0");
        insert(&store, "1");

        let mut watcher = CollectionWatcher::new(Arc::clone(&store), Collection::Machines);
        let batch = watcher.next().await.unwrap();
        assert_eq!(batch.added, vec!["0".to_string(), "1".to_string()]);
        assert!(batch.removed.is_empty());
        assert!(batch.changed.is_empty());
    }

    #[tokio::test]
    async fn initial_batch_is_delivered_even_when_empty() {
        let store = store();
        let mut watcher = CollectionWatcher::new(store, Collection::Machines);
        let batch = watcher.next().await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn one_batch_per_distinct_write() {
        let store = store();
        let mut watcher = CollectionWatcher::new(Arc::clone(&store), Collection::Machines);
        assert!(watcher.next().await.unwrap().is_empty());

        insert(&store, "0");
        let batch = watcher.next().await.unwrap();
        assert_eq!(batch.added, vec!["0".to_string()]);

        set_field(&store, "0", "i-1");
        let batch = watcher.next().await.unwrap();
        assert_eq!(batch.changed, vec!["0".to_string()]);
    }

    #[tokio::test]
    async fn rapid_writes_coalesce_into_one_batch() {
        let store = store();
        insert(&store, "0");
        let mut watcher = CollectionWatcher::new(Arc::clone(&store), Collection::Machines);
        assert_eq!(watcher.next().await.unwrap().added, vec!["0".to_string()]);

        // Several writes before the subscriber consumes anything.
        set_field(&store, "0", "i-1");
        set_field(&store, "0", "i-2");
        set_field(&store, "0", "i-3");
        insert(&store, "1");

        // Give the loop time to fold everything into one pending batch.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let batch = watcher.next().await.unwrap();
        assert_eq!(batch.added, vec!["1".to_string()]);
        assert_eq!(batch.changed, vec!["0".to_string()]);

        // Nothing further is pending.
        watcher.stop();
        assert_eq!(watcher.next().await, None);
    }

    #[tokio::test]
    async fn removal_is_reported() {
        let store = store();
        insert(&store, "0");
        let mut watcher = CollectionWatcher::new(Arc::clone(&store), Collection::Machines);
        assert_eq!(watcher.next().await.unwrap().added, vec!["0".to_string()]);

        store
            .apply(vec![Op::remove(Collection::Machines, "0")])
            .unwrap();
        let batch = watcher.next().await.unwrap();
        assert_eq!(batch.removed, vec!["0".to_string()]);
    }

    #[tokio::test]
    async fn stop_twice_unblocks_receiver() {
        let store = store();
        let mut watcher = CollectionWatcher::new(store, Collection::Machines);
        assert!(watcher.next().await.unwrap().is_empty());

        watcher.stop();
        watcher.stop();
        assert_eq!(watcher.next().await, None);
        assert!(watcher.failure().is_none());
    }

    #[tokio::test]
    async fn entity_watcher_initial_then_per_change() {
        let store = store();
        insert(&store, "0");
        insert(&store, "1");
        let mut watcher = EntityWatcher::new(Arc::clone(&store), Collection::Machines, "0".into());

        assert_eq!(watcher.next().await, Some(()));

        set_field(&store, "0", "i-1");
        assert_eq!(watcher.next().await, Some(()));

        // A write to another machine does not notify this watcher.
        set_field(&store, "1", "i-9");
        set_field(&store, "0", "i-2");
        assert_eq!(watcher.next().await, Some(()));

        watcher.stop();
        assert_eq!(watcher.next().await, None);
    }
}
