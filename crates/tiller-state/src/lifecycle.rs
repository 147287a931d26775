//! The generic entity lifecycle state machine.
//!
//! Every entity kind shares the same monotonic progression: Alive →
//! Dying → Dead. The ensure helpers here express a transition as one
//! conditional op — assert `life` is strictly below the target, set it
//! to the target — so a backward move can never commit. "Ensure"
//! semantics make the helpers idempotent: losing the race to a writer
//! that already advanced the entity at least as far is success, not an
//! error.

use tiller_core::Life;
use tiller_store::{Collection, Op, StoreError, MAX_TXN_ATTEMPTS};

use crate::error::{Result, StateError};
use crate::StateInner;

/// The shared lifecycle capability implemented by every entity handle.
///
/// Entity-specific fields stay on the concrete types; this trait carries
/// only the common Alive/Dying/Dead contract plus snapshot refresh and
/// the entity's presence key.
pub trait Lifecycle {
    /// Whether the entity is Alive, Dying or Dead, per the local
    /// snapshot.
    fn life(&self) -> Life;

    /// The global key under which the entity's presence is tracked.
    fn global_key(&self) -> String;

    /// Re-fetch the backing document and replace the local snapshot.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the document has been removed.
    fn refresh(&mut self) -> Result<()>;

    /// Advance the entity to Dying if it is Alive; a no-op if it is
    /// already Dying or Dead.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the backing document no longer
    /// exists.
    fn ensure_dying(&mut self) -> Result<()>;

    /// Advance the entity to Dead if it is Alive or Dying; a no-op if it
    /// is already Dead. Reaching Dead triggers any dependent cleanup,
    /// which is idempotent across retries and restarts.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the backing document no longer
    /// exists.
    fn ensure_dead(&mut self) -> Result<()>;
}

/// Drive one entity's lifecycle to `target`, returning the life the
/// entity actually holds afterwards (which may be past `target` if a
/// concurrent writer got there first).
pub(crate) fn ensure_life(
    st: &StateInner,
    collection: Collection,
    id: &str,
    target: Life,
    what: &str,
) -> Result<Life> {
    for _ in 0..MAX_TXN_ATTEMPTS {
        match st.runner.run(vec![Op::advance_life(collection, id, target)]) {
            Ok(()) => {
                tracing::info!(entity = %what, life = %target, "lifecycle advanced");
                return Ok(target);
            }
            Err(StoreError::Aborted) => {
                // A concurrent writer touched the document. If it is
                // already at or past the target the intent holds.
                match st.store.find_by_id(collection, id)? {
                    Some(doc) if doc.life >= target => return Ok(doc.life),
                    Some(_) => {}
                    None => return Err(StateError::not_found(what.to_string())),
                }
            }
            Err(StoreError::NotFound) => return Err(StateError::not_found(what.to_string())),
            Err(err) => return Err(err.into()),
        }
    }
    Err(StateError::conflict(format!(
        "cannot advance {what} to {target}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PresenceConfig, State};
    use std::sync::Arc;
    use tiller_store::MemStore;

    async fn new_state() -> State {
        State::new(Arc::new(MemStore::new()), PresenceConfig::default())
    }

    #[tokio::test]
    async fn dying_then_dead() {
        let st = new_state().await;
        let mut machine = st.add_machine(&[]).unwrap();
        assert_eq!(machine.life(), Life::Alive);

        machine.ensure_dying().unwrap();
        assert_eq!(machine.life(), Life::Dying);

        machine.ensure_dead().unwrap();
        assert_eq!(machine.life(), Life::Dead);
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let st = new_state().await;
        let mut machine = st.add_machine(&[]).unwrap();

        machine.ensure_dead().unwrap();
        machine.ensure_dead().unwrap();
        machine.ensure_dying().unwrap(); // already past Dying: no-op
        assert_eq!(machine.life(), Life::Dead);

        machine.refresh().unwrap();
        assert_eq!(machine.life(), Life::Dead);
    }

    #[tokio::test]
    async fn life_never_regresses_across_handles() {
        let st = new_state().await;
        let machine = st.add_machine(&[]).unwrap();

        let mut first = st.machine(machine.id()).unwrap();
        let mut second = st.machine(machine.id()).unwrap();

        first.ensure_dead().unwrap();
        // The second handle's snapshot is stale but its ensure still
        // succeeds, observing the already-dead entity.
        second.ensure_dying().unwrap();
        assert_eq!(second.life(), Life::Dead);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_ensure_dead_both_succeed() {
        let st = new_state().await;
        let machine = st.add_machine(&[]).unwrap();
        let id = machine.id();

        let mut a = st.machine(id).unwrap();
        let mut b = st.machine(id).unwrap();
        let (ra, rb) = tokio::join!(
            tokio::task::spawn_blocking(move || {
                a.ensure_dying().and_then(|()| a.ensure_dead()).map(|()| a.life())
            }),
            tokio::task::spawn_blocking(move || {
                b.ensure_dying().and_then(|()| b.ensure_dead()).map(|()| b.life())
            }),
        );
        assert_eq!(ra.unwrap().unwrap(), Life::Dead);
        assert_eq!(rb.unwrap().unwrap(), Life::Dead);

        let refreshed = st.machine(id).unwrap();
        assert_eq!(refreshed.life(), Life::Dead);
    }

    #[tokio::test]
    async fn missing_entity_is_not_found() {
        let st = new_state().await;
        let mut machine = st.add_machine(&[]).unwrap();
        let mut stale = st.machine(machine.id()).unwrap();

        machine.ensure_dead().unwrap();
        st.remove_machine(machine.id()).unwrap();

        let err = stale.ensure_dying().unwrap_err();
        assert!(err.is_not_found(), "got {err}");
    }
}
