//! The composite application-relations watcher.
//!
//! Watching one application's relations composes two layers: a top-level
//! watch over the relations collection, filtered to relations whose
//! endpoints name the application, and one nested settings watcher per
//! live relation. The owner task keeps a relation-id → child map that
//! tracks exactly the currently-live relation set — a relation's child
//! starts when it first appears and stops when it departs — and merges
//! child deltas through a single fan-in channel into composite events.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, watch};

use tiller_core::{ApplicationName, Life, RelationId};
use tiller_store::{ChangeFeed, Collection, Document, DocumentStore};

use crate::error::StateError;
use crate::relation::{unit_from_settings_key, RelationFields};
use crate::watcher::{CollectionChange, CollectionWatcher};

/// One unit's settings delta within a relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationUnitChange {
    /// The settings version (the settings document's revision).
    pub version: u64,
    /// The unit's current settings.
    pub settings: serde_json::Map<String, serde_json::Value>,
}

/// The delta for one relation the application is part of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationChange {
    /// The relation id.
    pub id: RelationId,
    /// The relation's lifecycle value at batch time.
    pub life: Life,
    /// Units whose settings changed, by unit name.
    pub changed_units: BTreeMap<String, RelationUnitChange>,
    /// Units that left the relation since the last batch.
    pub departed_units: Vec<String>,
}

/// One composite batch: relations added or changed, relations removed,
/// and per-relation unit settings deltas.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationsChange {
    /// Relations that appeared or changed, with their unit deltas.
    pub changed: Vec<RelationChange>,
    /// Relations that departed, by stable id.
    pub removed: Vec<RelationId>,
}

impl RelationsChange {
    /// Whether the batch carries no changes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Default)]
struct PendingRelation {
    life: Life,
    changed_units: BTreeMap<String, RelationUnitChange>,
    departed_units: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct PendingComposite {
    changed: BTreeMap<u64, PendingRelation>,
    removed: BTreeSet<u64>,
}

impl PendingComposite {
    fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }

    fn take(&mut self, delivered: &mut HashSet<u64>) -> RelationsChange {
        let changed = std::mem::take(&mut self.changed)
            .into_iter()
            .map(|(id, pending)| {
                delivered.insert(id);
                RelationChange {
                    id: RelationId::new(id),
                    life: pending.life,
                    changed_units: pending.changed_units,
                    departed_units: pending.departed_units.into_iter().collect(),
                }
            })
            .collect();
        let removed = std::mem::take(&mut self.removed)
            .into_iter()
            .map(|id| {
                delivered.remove(&id);
                RelationId::new(id)
            })
            .collect();
        RelationsChange { changed, removed }
    }
}

struct ChildEvent {
    relation: u64,
    changed_units: BTreeMap<String, RelationUnitChange>,
    departed_units: BTreeSet<String>,
}

/// A watcher over one application's relations and their unit settings.
#[derive(Debug)]
pub struct ApplicationRelationsWatcher {
    rx: mpsc::Receiver<RelationsChange>,
    stop_tx: watch::Sender<bool>,
    failure: Arc<Mutex<Option<String>>>,
}

impl ApplicationRelationsWatcher {
    pub(crate) fn new(store: Arc<dyn DocumentStore>, application: ApplicationName) -> Self {
        let parent = CollectionWatcher::new(Arc::clone(&store), Collection::Relations);
        let (tx, rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let failure = Arc::new(Mutex::new(None));
        tokio::spawn(run_relations_loop(
            store,
            application,
            parent,
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

    /// Receive the next composite batch. Returns `None` once the watcher
    /// has been stopped or failed; consult [`failure`](Self::failure) to
    /// tell which.
    pub async fn next(&mut self) -> Option<RelationsChange> {
        self.rx.recv().await
    }

    /// Stop the watcher, its parent watch and every nested settings
    /// watcher. Safe to call more than once.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// The captured failure, if any, replayed to every caller.
    #[must_use]
    pub fn failure(&self) -> Option<StateError> {
        self.failure
            .lock()
            .as_ref()
            .map(|reason| StateError::WatcherFailed(reason.clone()))
    }
}

impl Drop for ApplicationRelationsWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(clippy::too_many_lines)]
async fn run_relations_loop(
    store: Arc<dyn DocumentStore>,
    application: ApplicationName,
    mut parent: CollectionWatcher,
    tx: mpsc::Sender<RelationsChange>,
    mut stop_rx: watch::Receiver<bool>,
    failure: Arc<Mutex<Option<String>>>,
) {
    let (child_tx, mut child_rx) = mpsc::unbounded_channel();
    // Nested settings watchers, exactly one per live relation of the
    // application. Dropping a sender stops its child task.
    let mut children: HashMap<u64, watch::Sender<bool>> = HashMap::new();
    let mut lives: HashMap<u64, Life> = HashMap::new();
    let mut delivered: HashSet<u64> = HashSet::new();
    let mut pending = PendingComposite::default();
    let mut have_batch = false;
    let mut seen_initial = false;

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            batch = parent.next() => {
                let Some(batch) = batch else {
                    if let Some(reason) = parent.failure_message() {
                        *failure.lock() = Some(reason);
                    }
                    break;
                };
                let result = absorb_parent_batch(
                    &store,
                    &application,
                    &batch,
                    &mut children,
                    &mut lives,
                    &mut pending,
                    &delivered,
                    &child_tx,
                );
                if let Err(err) = result {
                    *failure.lock() = Some(err.to_string());
                    break;
                }
                // The parent's first batch yields the composite initial
                // event, even if this application has no relations yet.
                if !seen_initial || !pending.is_empty() {
                    have_batch = true;
                }
                seen_initial = true;
            }
            Some(event) = child_rx.recv() => {
                if children.contains_key(&event.relation) {
                    let life = lives.get(&event.relation).copied().unwrap_or(Life::Alive);
                    let entry = pending.changed.entry(event.relation).or_insert_with(|| PendingRelation {
                        life,
                        ..PendingRelation::default()
                    });
                    entry.life = life;
                    for unit in event.departed_units {
                        entry.changed_units.remove(&unit);
                        entry.departed_units.insert(unit);
                    }
                    for (unit, change) in event.changed_units {
                        entry.departed_units.remove(&unit);
                        entry.changed_units.insert(unit, change);
                    }
                    have_batch = true;
                }
            }
            permit = tx.reserve(), if have_batch => {
                let Ok(permit) = permit else { break };
                permit.send(pending.take(&mut delivered));
                have_batch = false;
            }
        }
    }
    parent.stop();
    tracing::debug!(application = %application, "application relations watcher stopped");
}

#[allow(clippy::too_many_arguments)]
fn absorb_parent_batch(
    store: &Arc<dyn DocumentStore>,
    application: &ApplicationName,
    batch: &CollectionChange,
    children: &mut HashMap<u64, watch::Sender<bool>>,
    lives: &mut HashMap<u64, Life>,
    pending: &mut PendingComposite,
    delivered: &HashSet<u64>,
    child_tx: &mpsc::UnboundedSender<ChildEvent>,
) -> tiller_store::Result<()> {
    for id in batch.added.iter().chain(&batch.changed) {
        let Ok(relation) = id.parse::<u64>() else {
            continue;
        };
        let Some(doc) = store.find_by_id(Collection::Relations, id)? else {
            depart(relation, children, lives, pending, delivered);
            continue;
        };
        if !doc_involves(&doc, application) {
            continue;
        }
        lives.insert(relation, doc.life);
        if let std::collections::hash_map::Entry::Vacant(slot) = children.entry(relation) {
            let (stop_tx, stop_rx) = watch::channel(false);
            slot.insert(stop_tx);
            tokio::spawn(run_settings_child(
                Arc::clone(store),
                relation,
                store.subscribe(Collection::Settings),
                child_tx.clone(),
                stop_rx,
            ));
        }
        let entry = pending
            .changed
            .entry(relation)
            .or_insert_with(PendingRelation::default);
        entry.life = doc.life;
    }
    for id in &batch.removed {
        let Ok(relation) = id.parse::<u64>() else {
            continue;
        };
        depart(relation, children, lives, pending, delivered);
    }
    Ok(())
}

/// Stop and release a departed relation's nested watcher and queue the
/// removal, unless the subscriber never learned of the relation at all.
fn depart(
    relation: u64,
    children: &mut HashMap<u64, watch::Sender<bool>>,
    lives: &mut HashMap<u64, Life>,
    pending: &mut PendingComposite,
    delivered: &HashSet<u64>,
) {
    if children.remove(&relation).is_none() {
        return;
    }
    lives.remove(&relation);
    let was_pending = pending.changed.remove(&relation).is_some();
    if delivered.contains(&relation) || !was_pending {
        pending.removed.insert(relation);
    }
}

fn doc_involves(doc: &Document, application: &ApplicationName) -> bool {
    let Ok(fields) = serde_json::from_value::<RelationFields>(serde_json::Value::Object(
        doc.fields.clone(),
    )) else {
        return false;
    };
    fields
        .endpoints
        .iter()
        .any(|ep| ep.application == *application)
}

async fn run_settings_child(
    store: Arc<dyn DocumentStore>,
    relation: u64,
    mut feed: ChangeFeed,
    tx: mpsc::UnboundedSender<ChildEvent>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let relation_id = RelationId::new(relation);
    let mut known: HashSet<String> = HashSet::new();

    // Initial event: the full current settings state of the relation.
    let initial = match store.find_by_field(Collection::Settings, "relation_id", &json!(relation)) {
        Ok(docs) => docs,
        Err(err) => {
            tracing::debug!(relation, error = %err, "settings watcher failed to bootstrap");
            return;
        }
    };
    let mut event = ChildEvent {
        relation,
        changed_units: BTreeMap::new(),
        departed_units: BTreeSet::new(),
    };
    for doc in initial {
        let Some(unit) = unit_from_settings_key(&doc.id, relation_id) else {
            continue;
        };
        known.insert(doc.id.clone());
        event
            .changed_units
            .insert(unit.to_string(), unit_change(&doc));
    }
    if !event.changed_units.is_empty() && tx.send(event).is_err() {
        return;
    }

    loop {
        tokio::select! {
            _ = stop_rx.changed() => return,
            observed = feed.recv() => {
                let Some(observed) = observed else { return };
                let mut event = ChildEvent {
                    relation,
                    changed_units: BTreeMap::new(),
                    departed_units: BTreeSet::new(),
                };
                for id in observed.ids {
                    let Some(unit) = unit_from_settings_key(&id, relation_id) else {
                        continue;
                    };
                    match store.find_by_id(Collection::Settings, &id) {
                        Ok(Some(doc)) => {
                            known.insert(id.clone());
                            event.changed_units.insert(unit.to_string(), unit_change(&doc));
                        }
                        Ok(None) => {
                            if known.remove(&id) {
                                event.departed_units.insert(unit.to_string());
                            }
                        }
                        Err(err) => {
                            tracing::debug!(relation, error = %err, "settings watcher read failed");
                            return;
                        }
                    }
                }
                let has_changes = !event.changed_units.is_empty() || !event.departed_units.is_empty();
                if has_changes && tx.send(event).is_err() {
                    return;
                }
            }
        }
    }
}

fn unit_change(doc: &Document) -> RelationUnitChange {
    let settings = match doc.field("settings") {
        Some(serde_json::Value::Object(map)) => map.clone(),
        _ => serde_json::Map::new(),
    };
    RelationUnitChange {
        version: doc.txn_revno,
        settings,
    }
}
