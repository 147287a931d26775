//! End-to-end tests over the full state layer: entity lifecycle,
//! watchers and presence against both store backends.

use std::sync::Arc;
use std::time::Duration;

use tiller_state::{
    Endpoint, EndpointRole, Life, Lifecycle, PresenceConfig, RelationsChange, State, StateError,
    WorkerKind,
};
use tiller_store::{MemStore, RocksStore};

fn mem_state() -> State {
    State::new(Arc::new(MemStore::new()), PresenceConfig::default())
}

/// Receive composite batches until the predicate holds, folding is-empty
/// protection behind a deadline so a wrong expectation fails instead of
/// hanging.
async fn next_until<F>(
    watcher: &mut tiller_state::ApplicationRelationsWatcher,
    mut pred: F,
) -> RelationsChange
where
    F: FnMut(&RelationsChange) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let batch = watcher.next().await.expect("watcher ended unexpectedly");
            if pred(&batch) {
                return batch;
            }
        }
    })
    .await
    .expect("no matching batch before deadline")
}

#[tokio::test]
async fn machine_lifecycle_and_refresh_roundtrip() {
    let st = mem_state();
    let mut machine = st.add_machine(&[WorkerKind::Deployer, WorkerKind::Upgrader]).unwrap();

    machine.set_instance_id("i-123").unwrap();
    machine.refresh().unwrap();
    assert_eq!(machine.instance_id().unwrap(), "i-123");
    assert_eq!(
        machine.workers(),
        &[WorkerKind::Deployer, WorkerKind::Upgrader]
    );

    machine.ensure_dying().unwrap();
    machine.ensure_dead().unwrap();
    assert_eq!(machine.life(), Life::Dead);

    // Dead machines reject further mutation but keep their document
    // until explicitly removed.
    assert!(machine.set_instance_id("i-456").unwrap_err().is_conflict());
    st.remove_machine(machine.id()).unwrap();
    assert!(st.machine(machine.id()).unwrap_err().is_not_found());
}

#[tokio::test]
async fn rocks_backend_behaves_like_memory() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = Arc::new(RocksStore::open(dir.path()).unwrap());
    let st = State::new(store, PresenceConfig::default());

    let mut machine = st.add_machine(&[]).unwrap();
    machine.set_instance_id("i-rocks").unwrap();

    let app = st.add_application("wordpress", false).unwrap();
    let mut unit = app.add_unit().unwrap();
    unit.assign_to_machine(&machine).unwrap();

    let units = machine.units().unwrap();
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].name().as_str(), "wordpress/0");

    machine.refresh().unwrap();
    assert_eq!(machine.instance_id().unwrap(), "i-rocks");
}

#[tokio::test]
async fn collection_watcher_bootstraps_then_tracks() {
    let st = mem_state();
    for _ in 0..3 {
        st.add_machine(&[]).unwrap();
    }

    let mut watcher = st.watch_machines();
    let initial = watcher.next().await.unwrap();
    assert_eq!(
        initial.added,
        vec!["0".to_string(), "1".to_string(), "2".to_string()]
    );

    let mut machine = st.add_machine(&[]).unwrap();
    let batch = watcher.next().await.unwrap();
    assert_eq!(batch.added, vec!["3".to_string()]);

    machine.ensure_dying().unwrap();
    let batch = watcher.next().await.unwrap();
    assert_eq!(batch.changed, vec!["3".to_string()]);

    machine.ensure_dead().unwrap();
    st.remove_machine(machine.id()).unwrap();
    // The death and the removal may coalesce into one delivered batch.
    let batch = watcher.next().await.unwrap();
    assert_eq!(batch.removed, vec!["3".to_string()]);

    watcher.stop();
    watcher.stop();
    assert_eq!(watcher.next().await, None);
    assert!(watcher.failure().is_none());
}

#[tokio::test]
async fn relations_watcher_tracks_membership_and_settings() {
    let st = mem_state();
    let wordpress = st.add_application("wordpress", false).unwrap();
    let mysql = st.add_application("mysql", false).unwrap();
    let unit = wordpress.add_unit().unwrap();

    let mut watcher = st.watch_application_relations("wordpress").unwrap();

    // Initial state: no relations yet.
    let initial = watcher.next().await.unwrap();
    assert!(initial.is_empty());

    // A new relation appears.
    let relation = st
        .add_relation(
            Endpoint::new(wordpress.name().clone(), "db", EndpointRole::Requirer),
            Endpoint::new(mysql.name().clone(), "db", EndpointRole::Provider),
        )
        .unwrap();
    let batch = next_until(&mut watcher, |b| !b.changed.is_empty()).await;
    assert_eq!(batch.changed.len(), 1);
    assert_eq!(batch.changed[0].id, relation.id());
    assert_eq!(batch.changed[0].life, Life::Alive);

    // A unit writes settings: the nested watcher surfaces the delta.
    let mut settings = serde_json::Map::new();
    settings.insert("host".into(), serde_json::json!("10.0.0.7"));
    relation.set_unit_settings(unit.name(), settings).unwrap();

    let batch = next_until(&mut watcher, |b| {
        b.changed
            .iter()
            .any(|c| c.changed_units.contains_key("wordpress/0"))
    })
    .await;
    let change = &batch.changed[0].changed_units["wordpress/0"];
    assert_eq!(change.settings["host"], serde_json::json!("10.0.0.7"));
    let first_version = change.version;

    // Updating the settings bumps the version.
    let mut settings = serde_json::Map::new();
    settings.insert("host".into(), serde_json::json!("10.0.0.8"));
    relation.set_unit_settings(unit.name(), settings).unwrap();
    let batch = next_until(&mut watcher, |b| {
        b.changed
            .iter()
            .any(|c| c.changed_units.contains_key("wordpress/0"))
    })
    .await;
    assert!(batch.changed[0].changed_units["wordpress/0"].version > first_version);

    // Killing and removing the relation stops its nested watcher and
    // reports the departure by stable id.
    let mut handle = st.relation(relation.id()).unwrap();
    handle.ensure_dead().unwrap();
    st.remove_relation(relation.id()).unwrap();
    let batch = next_until(&mut watcher, |b| !b.removed.is_empty()).await;
    assert_eq!(batch.removed, vec![relation.id()]);

    watcher.stop();
    assert_eq!(watcher.next().await, None);
    assert!(watcher.failure().is_none());
}

#[tokio::test]
async fn relations_watcher_ignores_unrelated_relations() {
    let st = mem_state();
    st.add_application("wordpress", false).unwrap();
    let mysql = st.add_application("mysql", false).unwrap();
    let nagios = st.add_application("nagios", false).unwrap();

    let mut watcher = st.watch_application_relations("wordpress").unwrap();
    assert!(watcher.next().await.unwrap().is_empty());

    // A relation between two other applications is invisible here.
    st.add_relation(
        Endpoint::new(nagios.name().clone(), "db", EndpointRole::Requirer),
        Endpoint::new(mysql.name().clone(), "db", EndpointRole::Provider),
    )
    .unwrap();

    tokio::task::yield_now().await;
    tokio::task::yield_now().await;
    watcher.stop();
    while let Some(batch) = watcher.next().await {
        assert!(batch.is_empty(), "unexpected batch {batch:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn agent_presence_confirms_after_two_cycles() {
    let st = mem_state();
    let machine = st.add_machine(&[]).unwrap();

    assert!(!machine.agent_alive());

    let pinger = machine.set_agent_alive();
    machine
        .wait_agent_alive(Duration::from_secs(5))
        .await
        .unwrap();
    assert!(machine.agent_alive());

    // Once the pinger stops the agent goes stale.
    pinger.stop();
    tokio::time::advance(Duration::from_secs(5)).await;
    assert!(!machine.agent_alive());
}

#[tokio::test(start_paused = true)]
async fn wait_agent_alive_times_out_distinctly() {
    let st = mem_state();
    let machine = st.add_machine(&[]).unwrap();

    let err = machine
        .wait_agent_alive(Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "got {err}");
    assert!(!err.is_fatal());
    assert_eq!(
        err.to_string(),
        "cannot wait for agent of machine 0: still not alive after timeout"
    );
}

#[tokio::test(start_paused = true)]
async fn wait_agent_alive_propagates_presence_failure() {
    let st = mem_state();
    let machine = st.add_machine(&[]).unwrap();

    st.presence().stop();
    let err = machine
        .wait_agent_alive(Duration::from_secs(5))
        .await
        .unwrap_err();
    match err {
        StateError::Op { source, .. } => {
            assert!(matches!(*source, StateError::PresenceFailed(_)));
        }
        other => panic!("expected wrapped presence failure, got {other}"),
    }
}

#[tokio::test]
async fn machine_watch_notifies_on_document_changes() {
    let st = mem_state();
    let mut machine = st.add_machine(&[]).unwrap();
    let other = st.add_machine(&[]).unwrap();

    let mut watcher = machine.watch();
    assert_eq!(watcher.next().await, Some(()));

    machine.set_instance_id("i-123").unwrap();
    assert_eq!(watcher.next().await, Some(()));

    // Changes to another machine do not wake this watcher; the next
    // event corresponds to this machine's own change.
    st.machine(other.id())
        .unwrap()
        .set_instance_id("i-999")
        .unwrap();
    machine.ensure_dying().unwrap();
    assert_eq!(watcher.next().await, Some(()));

    watcher.stop();
    assert_eq!(watcher.next().await, None);
}

#[tokio::test]
async fn watchers_are_independent_per_collection() {
    let st = mem_state();
    let mut machines = st.watch_machines();
    let mut applications = st.watch_applications();
    assert!(machines.next().await.unwrap().is_empty());
    assert!(applications.next().await.unwrap().is_empty());

    st.add_application("wordpress", false).unwrap();
    let batch = applications.next().await.unwrap();
    assert_eq!(batch.added, vec!["wordpress".to_string()]);

    st.add_machine(&[]).unwrap();
    let batch = machines.next().await.unwrap();
    assert_eq!(batch.added, vec!["0".to_string()]);
}
