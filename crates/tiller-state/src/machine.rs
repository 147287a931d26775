//! The machine entity handle.
//!
//! A `Machine` wraps a snapshot of one machine document and offers typed
//! accessors and mutators. Accessors never touch the store; mutators
//! submit one conditional transaction asserting the machine is not Dead
//! and update the snapshot only after the commit succeeds. The handle is
//! logically single-owner even though the backing document is
//! multi-writer; `refresh` re-fetches the snapshot.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tiller_core::{Life, MachineId};
use tiller_store::{Collection, Document, Op};

use crate::error::{Result, ResultExt, StateError};
use crate::lifecycle::{ensure_life, Lifecycle};
use crate::presence::{wait_alive, Pinger};
use crate::unit::Unit;
use crate::watcher::EntityWatcher;
use crate::{decode_fields, encode_field, StateInner};

/// The binaries a machine agent is currently running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentTools {
    /// Release series the binaries were built for.
    pub series: String,
    /// CPU architecture the binaries were built for.
    pub arch: String,
    /// Version string of the binaries.
    pub version: String,
    /// Where the binaries can be fetched from.
    pub url: String,
}

/// The worker processes a machine agent must run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// Deploys and supervises unit agents on the machine.
    Deployer,
    /// Maintains the machine's network configuration.
    Networker,
    /// Upgrades the machine agent's own binaries.
    Upgrader,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct MachineFields {
    #[serde(default)]
    pub(crate) instance_id: Option<String>,
    #[serde(default)]
    pub(crate) principals: Vec<String>,
    #[serde(default)]
    pub(crate) tools: Option<AgentTools>,
    #[serde(default)]
    pub(crate) workers: Vec<WorkerKind>,
}

/// A handle on one machine.
pub struct Machine {
    st: Arc<StateInner>,
    id: MachineId,
    life: Life,
    doc: MachineFields,
}

impl Machine {
    pub(crate) fn from_document(st: Arc<StateInner>, doc: &Document) -> Result<Self> {
        let id: MachineId = doc.id.parse()?;
        Ok(Self {
            st,
            id,
            life: doc.life,
            doc: decode_fields(doc)?,
        })
    }

    fn fetch(&self) -> Result<Document> {
        self.st
            .store
            .find_by_id(Collection::Machines, &self.id.to_string())?
            .ok_or_else(|| StateError::not_found(format!("machine {self}")))
    }

    /// The machine id.
    #[must_use]
    pub fn id(&self) -> MachineId {
        self.id
    }

    /// A name identifying the machine that is safe to use as a file
    /// name, distinct from the path keys of all other entities.
    #[must_use]
    pub fn path_key(&self) -> String {
        self.id.path_key()
    }

    /// The workers that the machine agent must run.
    #[must_use]
    pub fn workers(&self) -> &[WorkerKind] {
        &self.doc.workers
    }

    /// The names of the principal units assigned to the machine.
    #[must_use]
    pub fn principals(&self) -> &[String] {
        &self.doc.principals
    }

    /// The provider-specific instance id of the machine.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the instance id has not been set yet.
    pub fn instance_id(&self) -> Result<&str> {
        self.doc
            .instance_id
            .as_deref()
            .ok_or_else(|| StateError::not_found(format!("instance id for machine {self}")))
    }

    /// Set the provider-specific instance id of the machine.
    ///
    /// # Errors
    ///
    /// Returns a conflict error if the machine is Dead, or a not-found
    /// error if it has been removed.
    pub fn set_instance_id(&mut self, instance_id: &str) -> Result<()> {
        self.run_not_dead(vec![Op::set_fields(
            Collection::Machines,
            self.id.to_string(),
            encode_field("instance_id", json!(instance_id)),
        )])
        .op_context(|| format!("set instance id of machine {self}"))?;
        self.doc.instance_id = Some(instance_id.to_string());
        tracing::info!(machine_id = %self.id, instance_id, "set machine instance id");
        Ok(())
    }

    /// The tools that the machine agent is currently running.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the tools have not been set yet.
    pub fn agent_tools(&self) -> Result<&AgentTools> {
        self.doc
            .tools
            .as_ref()
            .ok_or_else(|| StateError::not_found(format!("agent tools for machine {self}")))
    }

    /// Set the tools that the machine agent is currently running.
    ///
    /// # Errors
    ///
    /// Returns a not-valid error, before any store access, if the tools
    /// have an empty series or arch; a conflict error if the machine is
    /// Dead.
    pub fn set_agent_tools(&mut self, tools: AgentTools) -> Result<()> {
        let op = || format!("set agent tools for machine {self}");
        if tools.series.is_empty() || tools.arch.is_empty() {
            return Err(StateError::not_valid("agent tools with empty series or arch"))
                .op_context(op);
        }
        let value = crate::to_json(&tools).op_context(op)?;
        self.run_not_dead(vec![Op::set_fields(
            Collection::Machines,
            self.id.to_string(),
            encode_field("tools", value),
        )])
        .op_context(op)?;
        tracing::info!(machine_id = %self.id, version = %tools.version, "set machine agent tools");
        self.doc.tools = Some(tools);
        Ok(())
    }

    /// All units assigned to the machine: principal units by assignment,
    /// plus their subordinates.
    ///
    /// The result is a snapshot relative to call time.
    ///
    /// # Errors
    ///
    /// Returns an error if the store query fails.
    pub fn units(&self) -> Result<Vec<Unit>> {
        let inner = || -> Result<Vec<Unit>> {
            let mut units = Vec::new();
            let principals = self.st.store.find_by_field(
                Collection::Units,
                "machine_id",
                &json!(self.id.as_u64()),
            )?;
            for doc in principals {
                let unit = Unit::from_document(Arc::clone(&self.st), &doc)?;
                let subordinates = self.st.store.find_by_field(
                    Collection::Units,
                    "principal",
                    &json!(unit.name().as_str()),
                )?;
                units.push(unit);
                for doc in subordinates {
                    units.push(Unit::from_document(Arc::clone(&self.st), &doc)?);
                }
            }
            Ok(units)
        };
        inner().op_context(|| format!("get units assigned to machine {self}"))
    }

    /// A watcher that notifies when the machine document changes,
    /// starting with one initial event.
    #[must_use]
    pub fn watch(&self) -> EntityWatcher {
        EntityWatcher::new(
            Arc::clone(&self.st.store),
            Collection::Machines,
            self.id.to_string(),
        )
    }

    /// Whether the machine agent currently has a fresh liveness pulse.
    #[must_use]
    pub fn agent_alive(&self) -> bool {
        self.st.presence.alive(&self.global_key())
    }

    /// Block until the machine agent's liveness is confirmed on two
    /// consecutive presence cycles, the timeout elapses, or the presence
    /// watcher fails.
    ///
    /// # Errors
    ///
    /// `StateError::StillNotAlive` on timeout,
    /// `StateError::PresenceFailed` if the presence watcher died, and
    /// the fatal `StateError::DoubleDead` if presence reports dead twice
    /// in a row.
    pub async fn wait_agent_alive(&self, timeout: Duration) -> Result<()> {
        wait_alive(&self.st.presence, &self.global_key(), timeout)
            .await
            .op_context(|| format!("wait for agent of machine {self}"))
    }

    /// Signal that the agent for this machine is alive, returning the
    /// started pinger. The pinger keeps asserting liveness until it is
    /// stopped or dropped.
    #[must_use]
    pub fn set_agent_alive(&self) -> Pinger {
        Pinger::start(&self.st.presence, self.global_key())
    }

    fn run_not_dead(&self, ops: Vec<Op>) -> Result<()> {
        crate::run_entity_ops(&self.st, ops, || format!("machine {self}"))
    }
}

impl Lifecycle for Machine {
    fn life(&self) -> Life {
        self.life
    }

    fn global_key(&self) -> String {
        self.id.global_key()
    }

    fn refresh(&mut self) -> Result<()> {
        let doc = self.fetch()?;
        self.life = doc.life;
        self.doc = decode_fields(&doc)?;
        Ok(())
    }

    fn ensure_dying(&mut self) -> Result<()> {
        self.life = ensure_life(
            &self.st,
            Collection::Machines,
            &self.id.to_string(),
            Life::Dying,
            &format!("machine {self}"),
        )?;
        Ok(())
    }

    fn ensure_dead(&mut self) -> Result<()> {
        self.life = ensure_life(
            &self.st,
            Collection::Machines,
            &self.id.to_string(),
            Life::Dead,
            &format!("machine {self}"),
        )?;
        Ok(())
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("id", &self.id)
            .field("life", &self.life)
            .finish_non_exhaustive()
    }
}
