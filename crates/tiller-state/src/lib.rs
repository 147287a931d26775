//! The authoritative state layer of the tiller orchestrator.
//!
//! This crate tracks the lifecycle of managed entities — machines,
//! units, applications (local and remote) and relations — in a shared
//! document store, coordinates concurrent mutation through optimistic
//! conditional transactions, propagates changes to observers through
//! watchers, and tracks remote-agent liveness through a heartbeat
//! presence protocol.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          State                              │
//! │  ┌────────────┐ ┌───────────────┐ ┌─────────────────────┐  │
//! │  │  Entity    │ │   Watchers    │ │     Presence        │  │
//! │  │  Handles   │ │ (collection,  │ │ (board, pingers,    │  │
//! │  │            │ │  composite)   │ │  debounced waits)   │  │
//! │  └────────────┘ └───────────────┘ └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                    ┌──────────────────┐
//!                    │  DocumentStore   │
//!                    │ (txn + feeds)    │
//!                    └──────────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use tiller_state::{Lifecycle, PresenceConfig, State};
//! use tiller_store::MemStore;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), tiller_state::StateError> {
//! let st = State::new(Arc::new(MemStore::new()), PresenceConfig::default());
//!
//! let mut machine = st.add_machine(&[])?;
//! machine.set_instance_id("i-123")?;
//! machine.refresh()?;
//! assert_eq!(machine.instance_id()?, "i-123");
//!
//! machine.ensure_dying()?;
//! machine.ensure_dead()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Concurrency model
//!
//! Many callers mutate and observe the same store concurrently. No lock
//! is held across a transaction's lifetime; contention resolves by
//! bounded retry against assertion aborts. Each entity handle is
//! logically single-owner (mutators take `&mut self`) while the backing
//! document stays multi-writer. Watchers and the presence board run
//! background tasks whose only subscriber-visible suspension point is
//! their delivery channel.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod application;
pub mod error;
pub mod lifecycle;
pub mod machine;
pub mod presence;
pub mod relation;
pub mod relations;
pub mod unit;
pub mod watcher;

pub use application::Application;
pub use error::{Result, StateError};
pub use lifecycle::Lifecycle;
pub use machine::{AgentTools, Machine, WorkerKind};
pub use presence::{Pinger, PresenceBoard, PresenceChange, PresenceConfig, PresenceSub};
pub use relation::{Endpoint, EndpointRole, Relation};
pub use relations::{
    ApplicationRelationsWatcher, RelationChange, RelationUnitChange, RelationsChange,
};
pub use unit::Unit;
pub use watcher::{CollectionChange, CollectionWatcher, EntityWatcher};

// Re-export commonly used types from dependencies for convenience.
pub use tiller_core::{ApplicationName, Life, MachineId, RelationId, UnitName};

use std::sync::Arc;

use error::ResultExt;
use serde_json::json;
use tiller_store::{
    Assert, Collection, Document, DocumentStore, Fields, Mutation, Op, Runner, StoreError,
};

pub(crate) struct StateInner {
    pub(crate) store: Arc<dyn DocumentStore>,
    pub(crate) runner: Runner,
    pub(crate) presence: PresenceBoard,
}

/// The state facade: typed entity constructors and accessors, watcher
/// constructors, and the presence service.
///
/// Cloning is cheap and shares the same underlying store and presence
/// board.
#[derive(Clone)]
pub struct State {
    inner: Arc<StateInner>,
}

impl State {
    /// Open the state layer over a document store. Must be called from
    /// within a tokio runtime: the presence sync loop starts here.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, presence: PresenceConfig) -> Self {
        let runner = Runner::new(Arc::clone(&store));
        Self {
            inner: Arc::new(StateInner {
                store,
                runner,
                presence: PresenceBoard::start(presence),
            }),
        }
    }

    /// The presence service.
    #[must_use]
    pub fn presence(&self) -> &PresenceBoard {
        &self.inner.presence
    }

    // =========================================================================
    // Machines
    // =========================================================================

    /// Add a new machine that must run the given workers.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the insert.
    pub fn add_machine(&self, workers: &[WorkerKind]) -> Result<Machine> {
        let seq = self.inner.store.next_sequence("machines")?;
        let id = MachineId::new(seq);

        let mut fields = Fields::new();
        fields.insert("workers".into(), to_json(workers)?);
        fields.insert("principals".into(), json!([]));
        self.inner
            .runner
            .run(vec![Op::insert(Collection::Machines, id.to_string(), fields)])
            .op_context(|| format!("add machine {id}"))?;

        tracing::info!(machine_id = %id, "added machine");
        self.machine(id)
    }

    /// Get a handle on an existing machine.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if no such machine exists.
    pub fn machine(&self, id: MachineId) -> Result<Machine> {
        let doc = self
            .fetch(Collection::Machines, &id.to_string())?
            .ok_or_else(|| StateError::not_found(format!("machine {id}")))?;
        Machine::from_document(Arc::clone(&self.inner), &doc)
    }

    /// Remove a machine's document. The machine must be Dead.
    ///
    /// # Errors
    ///
    /// Returns a conflict error if the machine is not Dead and a
    /// not-found error if it is already gone.
    pub fn remove_machine(&self, id: MachineId) -> Result<()> {
        self.remove_dead(Collection::Machines, &id.to_string(), &format!("machine {id}"))
    }

    // =========================================================================
    // Applications and units
    // =========================================================================

    /// Add an application. Remote applications are offered by another
    /// controller and share the collection with local ones.
    ///
    /// # Errors
    ///
    /// Returns a not-valid error for a malformed name (before any store
    /// access) and a conflict error if the name is already taken.
    pub fn add_application(&self, name: &str, remote: bool) -> Result<Application> {
        let name = ApplicationName::new(name)?;

        let mut fields = Fields::new();
        fields.insert("remote".into(), json!(remote));
        match self
            .inner
            .runner
            .run(vec![Op::insert(Collection::Applications, name.as_str(), fields)])
        {
            Ok(()) => {}
            Err(StoreError::Aborted) => {
                return Err(StateError::conflict(format!(
                    "application {name} already exists"
                )))
            }
            Err(err) => {
                return Err(err).op_context(|| format!("add application {name}"));
            }
        }

        tracing::info!(application = %name, remote, "added application");
        self.application(name.as_str())
    }

    /// Get a handle on an existing application.
    ///
    /// # Errors
    ///
    /// Returns a not-valid error for a malformed name and a not-found
    /// error if no such application exists.
    pub fn application(&self, name: &str) -> Result<Application> {
        let name = ApplicationName::new(name)?;
        let doc = self
            .fetch(Collection::Applications, name.as_str())?
            .ok_or_else(|| StateError::not_found(format!("application {name}")))?;
        Application::from_document(Arc::clone(&self.inner), &doc)
    }

    /// Get a handle on an existing unit.
    ///
    /// # Errors
    ///
    /// Returns a not-valid error for a malformed name and a not-found
    /// error if no such unit exists.
    pub fn unit(&self, name: &str) -> Result<Unit> {
        let name = UnitName::new(name)?;
        let doc = self
            .fetch(Collection::Units, name.as_str())?
            .ok_or_else(|| StateError::not_found(format!("unit {name}")))?;
        Unit::from_document(Arc::clone(&self.inner), &doc)
    }

    // =========================================================================
    // Relations
    // =========================================================================

    /// Relate two application endpoints. The endpoints must share a name
    /// and pair a provider with a requirer, and both applications must
    /// exist and not be Dead.
    ///
    /// # Errors
    ///
    /// Returns a not-valid error for incompatible endpoints, a not-found
    /// error if either application is missing, and a conflict error if
    /// either application is Dead.
    pub fn add_relation(&self, first: Endpoint, second: Endpoint) -> Result<Relation> {
        if first.name != second.name {
            return Err(StateError::not_valid(format!(
                "relation between mismatched endpoints {first} and {second}"
            )));
        }
        if first.application == second.application {
            return Err(StateError::not_valid(format!(
                "relation of application {} to itself",
                first.application
            )));
        }
        let roles = (first.role, second.role);
        if !matches!(
            roles,
            (EndpointRole::Provider, EndpointRole::Requirer)
                | (EndpointRole::Requirer, EndpointRole::Provider)
        ) {
            return Err(StateError::not_valid(format!(
                "relation between endpoints {first} and {second} with unpaired roles"
            )));
        }

        // Check both applications up front for a precise error; the
        // transaction below still asserts them, so a race cannot slip a
        // relation onto a dead application.
        for endpoint in [&first, &second] {
            self.fetch(Collection::Applications, endpoint.application.as_str())?
                .ok_or_else(|| {
                    StateError::not_found(format!("application {}", endpoint.application))
                })?;
        }

        let mut names = [first.to_string(), second.to_string()];
        names.sort();
        let key = names.join(" ");

        let seq = self.inner.store.next_sequence("relations")?;
        let id = RelationId::new(seq);

        let mut fields = Fields::new();
        fields.insert("key".into(), json!(key));
        fields.insert("endpoints".into(), to_json(&[&first, &second])?);
        let ops = vec![
            Op::assert_not_dead(Collection::Applications, first.application.as_str()),
            Op::assert_not_dead(Collection::Applications, second.application.as_str()),
            Op::insert(Collection::Relations, id.to_string(), fields),
        ];
        run_entity_ops(&self.inner, ops, || format!("relation {key}"))
            .op_context(|| format!("add relation {key}"))?;

        tracing::info!(relation = %id, key = %key, "added relation");
        self.relation(id)
    }

    /// Get a handle on an existing relation.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if no such relation exists.
    pub fn relation(&self, id: RelationId) -> Result<Relation> {
        let doc = self
            .fetch(Collection::Relations, &id.to_string())?
            .ok_or_else(|| StateError::not_found(format!("relation {id}")))?;
        Relation::from_document(Arc::clone(&self.inner), &doc)
    }

    /// Remove a relation's document. The relation must be Dead.
    ///
    /// # Errors
    ///
    /// Returns a conflict error if the relation is not Dead and a
    /// not-found error if it is already gone.
    pub fn remove_relation(&self, id: RelationId) -> Result<()> {
        self.remove_dead(Collection::Relations, &id.to_string(), &format!("relation {id}"))
    }

    // =========================================================================
    // Watchers
    // =========================================================================

    /// Watch the machines collection.
    #[must_use]
    pub fn watch_machines(&self) -> CollectionWatcher {
        CollectionWatcher::new(Arc::clone(&self.inner.store), Collection::Machines)
    }

    /// Watch the units collection.
    #[must_use]
    pub fn watch_units(&self) -> CollectionWatcher {
        CollectionWatcher::new(Arc::clone(&self.inner.store), Collection::Units)
    }

    /// Watch the applications collection.
    #[must_use]
    pub fn watch_applications(&self) -> CollectionWatcher {
        CollectionWatcher::new(Arc::clone(&self.inner.store), Collection::Applications)
    }

    /// Watch the relations collection.
    #[must_use]
    pub fn watch_relations(&self) -> CollectionWatcher {
        CollectionWatcher::new(Arc::clone(&self.inner.store), Collection::Relations)
    }

    /// Watch one application's relations and their unit settings. The
    /// composite delivers relations added, removed and changed together
    /// with per-relation unit settings deltas.
    ///
    /// # Errors
    ///
    /// Returns a not-valid error, before any store access, if the name
    /// is malformed.
    pub fn watch_application_relations(&self, name: &str) -> Result<ApplicationRelationsWatcher> {
        let name = ApplicationName::new(name)?;
        Ok(ApplicationRelationsWatcher::new(
            Arc::clone(&self.inner.store),
            name,
        ))
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn fetch(&self, collection: Collection, id: &str) -> Result<Option<Document>> {
        Ok(self.inner.store.find_by_id(collection, id)?)
    }

    fn remove_dead(&self, collection: Collection, id: &str, what: &str) -> Result<()> {
        let ops = vec![Op {
            collection,
            id: id.to_string(),
            assert: Assert::LifeIs(Life::Dead),
            mutation: Mutation::Remove,
        }];
        match self.inner.runner.run(ops) {
            Ok(()) => {
                tracing::info!(entity = %what, "removed entity");
                Ok(())
            }
            Err(StoreError::Aborted) => {
                Err(StateError::conflict(format!("{what} is not yet dead")))
            }
            Err(StoreError::NotFound) => Err(StateError::not_found(what.to_string())),
            Err(err) => Err(err.into()),
        }
    }
}

/// Decode a document's field bag into a typed snapshot.
pub(crate) fn decode_fields<T: serde::de::DeserializeOwned>(doc: &Document) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(doc.fields.clone()))
        .map_err(|err| StoreError::Serialization(err.to_string()).into())
}

/// Serialize a typed value into a document field value.
pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|err| StoreError::Serialization(err.to_string()).into())
}

/// A single-field update bag.
pub(crate) fn encode_field(name: &str, value: serde_json::Value) -> Fields {
    let mut fields = Fields::new();
    fields.insert(name.to_string(), value);
    fields
}

/// Run entity ops, mapping the store's abort/not-found conditions to the
/// state-layer taxonomy. Aborts surface as "not alive": entity mutators
/// assert their targets are not Dead.
pub(crate) fn run_entity_ops(
    st: &StateInner,
    ops: Vec<Op>,
    what: impl FnOnce() -> String,
) -> Result<()> {
    match st.runner.run(ops) {
        Ok(()) => Ok(()),
        Err(StoreError::Aborted) => Err(StateError::conflict("not alive")),
        Err(StoreError::NotFound) => Err(StateError::not_found(what())),
        Err(err) => Err(err.into()),
    }
}
