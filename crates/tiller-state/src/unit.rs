//! The unit entity handle.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tiller_core::{ApplicationName, Life, MachineId, UnitName};
use tiller_store::{Collection, Document, Mutation, Op};

use crate::error::{Result, ResultExt, StateError};
use crate::lifecycle::{ensure_life, Lifecycle};
use crate::machine::Machine;
use crate::{decode_fields, encode_field, StateInner};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct UnitFields {
    pub(crate) application: String,
    #[serde(default)]
    pub(crate) principal: Option<String>,
    #[serde(default)]
    pub(crate) machine_id: Option<u64>,
}

/// A handle on one unit.
///
/// Principal units are assigned to machines directly; subordinate units
/// reference their principal by name and follow it. References are by
/// id, not embedded copies, so traversal always goes back to the store
/// and cached handles may observe staleness until `refresh`.
pub struct Unit {
    st: Arc<StateInner>,
    name: UnitName,
    life: Life,
    doc: UnitFields,
}

impl Unit {
    pub(crate) fn from_document(st: Arc<StateInner>, doc: &Document) -> Result<Self> {
        let name = UnitName::new(&doc.id)?;
        Ok(Self {
            st,
            name,
            life: doc.life,
            doc: decode_fields(doc)?,
        })
    }

    /// The unit name, e.g. `wordpress/0`.
    #[must_use]
    pub fn name(&self) -> &UnitName {
        &self.name
    }

    /// The application this unit belongs to.
    #[must_use]
    pub fn application_name(&self) -> ApplicationName {
        self.name.application()
    }

    /// Whether this is a principal unit (not subordinate to another).
    #[must_use]
    pub fn is_principal(&self) -> bool {
        self.doc.principal.is_none()
    }

    /// The name of the principal this unit is subordinate to, if any.
    #[must_use]
    pub fn principal(&self) -> Option<&str> {
        self.doc.principal.as_deref()
    }

    /// The machine this unit is assigned to, if any. Subordinate units
    /// are never assigned directly; they follow their principal.
    #[must_use]
    pub fn machine_id(&self) -> Option<MachineId> {
        self.doc.machine_id.map(MachineId::new)
    }

    /// Assign this principal unit to a machine.
    ///
    /// One transaction updates both documents: the unit's assignment and
    /// the machine's principal list. If either entity is Dead the whole
    /// transaction aborts and neither document changes.
    ///
    /// # Errors
    ///
    /// Returns a not-valid error for subordinate units, a conflict error
    /// if the unit is already assigned elsewhere or either entity is
    /// Dead, and a not-found error if either document is gone.
    pub fn assign_to_machine(&mut self, machine: &Machine) -> Result<()> {
        let op = || format!("assign unit {} to machine {machine}", self.name);
        if !self.is_principal() {
            return Err(StateError::not_valid(format!(
                "assignment of subordinate unit {}",
                self.name
            )))
            .op_context(op);
        }
        if let Some(assigned) = self.doc.machine_id {
            if assigned != machine.id().as_u64() {
                return Err(StateError::conflict(format!(
                    "unit {} is already assigned to machine {assigned}",
                    self.name
                )))
                .op_context(op);
            }
            return Ok(());
        }

        let ops = vec![
            Op::set_fields(
                Collection::Units,
                self.name.as_str(),
                encode_field("machine_id", json!(machine.id().as_u64())),
            ),
            Op {
                collection: Collection::Machines,
                id: machine.id().to_string(),
                assert: tiller_store::Assert::NotDead,
                mutation: Mutation::Push("principals".into(), json!(self.name.as_str())),
            },
        ];
        crate::run_entity_ops(&self.st, ops, || format!("unit {}", self.name)).op_context(op)?;
        self.doc.machine_id = Some(machine.id().as_u64());
        tracing::info!(unit = %self.name, machine_id = %machine.id(), "assigned unit to machine");
        Ok(())
    }

    fn fetch(&self) -> Result<Document> {
        self.st
            .store
            .find_by_id(Collection::Units, self.name.as_str())?
            .ok_or_else(|| StateError::not_found(format!("unit {}", self.name)))
    }
}

impl Lifecycle for Unit {
    fn life(&self) -> Life {
        self.life
    }

    fn global_key(&self) -> String {
        self.name.global_key()
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
            Collection::Units,
            self.name.as_str(),
            Life::Dying,
            &format!("unit {}", self.name),
        )?;
        Ok(())
    }

    fn ensure_dead(&mut self) -> Result<()> {
        self.life = ensure_life(
            &self.st,
            Collection::Units,
            self.name.as_str(),
            Life::Dead,
            &format!("unit {}", self.name),
        )?;
        Ok(())
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("name", &self.name)
            .field("life", &self.life)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PresenceConfig, State};
    use tiller_store::MemStore;

    async fn new_state() -> State {
        State::new(Arc::new(MemStore::new()), PresenceConfig::default())
    }

    #[tokio::test]
    async fn assignment_updates_both_documents() {
        let st = new_state().await;
        let machine = st.add_machine(&[]).unwrap();
        let app = st.add_application("wordpress", false).unwrap();
        let mut unit = app.add_unit().unwrap();

        unit.assign_to_machine(&machine).unwrap();
        assert_eq!(unit.machine_id(), Some(machine.id()));

        let machine = st.machine(machine.id()).unwrap();
        assert_eq!(machine.principals(), &["wordpress/0".to_string()]);
    }

    #[tokio::test]
    async fn assignment_is_idempotent_for_same_machine() {
        let st = new_state().await;
        let machine = st.add_machine(&[]).unwrap();
        let app = st.add_application("wordpress", false).unwrap();
        let mut unit = app.add_unit().unwrap();

        unit.assign_to_machine(&machine).unwrap();
        unit.assign_to_machine(&machine).unwrap();

        let machine = st.machine(machine.id()).unwrap();
        assert_eq!(machine.principals().len(), 1);
    }

    #[tokio::test]
    async fn reassignment_conflicts() {
        let st = new_state().await;
        let first = st.add_machine(&[]).unwrap();
        let second = st.add_machine(&[]).unwrap();
        let app = st.add_application("wordpress", false).unwrap();
        let mut unit = app.add_unit().unwrap();

        unit.assign_to_machine(&first).unwrap();
        let err = unit.assign_to_machine(&second).unwrap_err();
        assert!(err.is_conflict(), "got {err}");
    }

    #[tokio::test]
    async fn assignment_to_dead_machine_changes_nothing() {
        let st = new_state().await;
        let mut machine = st.add_machine(&[]).unwrap();
        let app = st.add_application("wordpress", false).unwrap();
        let mut unit = app.add_unit().unwrap();

        machine.ensure_dead().unwrap();
        let err = unit.assign_to_machine(&machine).unwrap_err();
        assert!(err.is_conflict(), "got {err}");

        // Neither document changed.
        unit.refresh().unwrap();
        assert_eq!(unit.machine_id(), None);
        machine.refresh().unwrap();
        assert!(machine.principals().is_empty());
    }

    #[tokio::test]
    async fn subordinate_assignment_rejected() {
        let st = new_state().await;
        let machine = st.add_machine(&[]).unwrap();
        let wordpress = st.add_application("wordpress", false).unwrap();
        let logging = st.add_application("logging", false).unwrap();
        let mut principal = wordpress.add_unit().unwrap();
        principal.assign_to_machine(&machine).unwrap();

        let mut sub = logging.add_subordinate_unit(principal.name()).unwrap();
        let err = sub.assign_to_machine(&machine).unwrap_err();
        assert!(err.is_not_valid(), "got {err}");
    }
}
