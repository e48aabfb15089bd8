//! Document store persistence across process restarts.

use overseer_state::{
    FileBackend, State, StateError, StateLayout, Status, TaskSet, STATE_FORMAT_VERSION,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::Arc;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct SnapSetup {
    name: String,
    revision: String,
}

fn open(layout: &StateLayout) -> State {
    State::load(Arc::new(FileBackend::new(layout))).unwrap()
}

#[test]
fn state_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    let layout = StateLayout::new(dir.path());
    layout.initialize().unwrap();

    let (chg, ids) = {
        let st = open(&layout);
        let mut g = st.lock();
        let chg = g.new_change("install-snap", "Install \"foo\" snap");
        let a = g.new_task("prerequisites", "Ensure prerequisites");
        let b = g.new_task("link-snap", "Make snap \"foo\" available");
        g.wait_for(b, a).unwrap();
        g.task_mut(b)
            .unwrap()
            .set(
                "snap-setup",
                &SnapSetup {
                    name: "foo".to_owned(),
                    revision: "33".to_owned(),
                },
            )
            .unwrap();
        g.add_all(chg, &TaskSet::from_tasks([a, b])).unwrap();
        g.task_mut(a).unwrap().set_status(Status::Done);
        g.task_mut(a).unwrap().logf("prerequisites ok");
        g.set("seeded", &true).unwrap();
        g.unlock().unwrap();
        (chg, [a, b])
    };

    let st = open(&layout);
    let g = st.lock();
    assert!(g.get::<bool>("seeded").unwrap());
    let change = g.change(chg).unwrap();
    assert_eq!(change.kind(), "install-snap");
    assert_eq!(change.task_ids(), &ids);

    let a = g.task(ids[0]).unwrap();
    assert_eq!(a.status(), Status::Done);
    assert!(a.log()[0].ends_with("INFO prerequisites ok"));

    let b = g.task(ids[1]).unwrap();
    assert_eq!(b.status(), Status::Default);
    assert_eq!(b.wait_tasks(), &[ids[0]]);
    let setup: SnapSetup = b.get("snap-setup").unwrap();
    assert_eq!(setup.revision, "33");
}

#[test]
fn ids_keep_increasing_after_reload() {
    let dir = tempfile::tempdir().unwrap();
    let layout = StateLayout::new(dir.path());

    let first = {
        let st = open(&layout);
        let mut g = st.lock();
        let id = g.new_task("a", "A");
        g.unlock().unwrap();
        id
    };
    let st = open(&layout);
    let mut g = st.lock();
    let second = g.new_task("b", "B");
    assert!(second > first);
}

#[test]
fn persisted_document_is_versioned_and_checksummed() {
    let dir = tempfile::tempdir().unwrap();
    let layout = StateLayout::new(dir.path());
    let st = open(&layout);
    let mut g = st.lock();
    g.new_change("k", "s");
    g.unlock().unwrap();

    let raw: serde_json::Value =
        serde_json::from_slice(&fs::read(layout.state_file()).unwrap()).unwrap();
    assert_eq!(raw["format-version"], STATE_FORMAT_VERSION);
    assert_eq!(raw["checksum"].as_str().unwrap().len(), 64);
    assert_eq!(raw["document"]["changes"]["1"]["kind"], "k");
}

#[test]
fn corrupted_state_file_fails_loudly() {
    let dir = tempfile::tempdir().unwrap();
    let layout = StateLayout::new(dir.path());
    fs::write(layout.state_file(), b"{ not json").unwrap();
    let err = State::load(Arc::new(FileBackend::new(&layout))).err().unwrap();
    assert!(matches!(err, StateError::Serialization(_)));
}

#[test]
fn missing_entry_and_wrong_type_are_distinct() {
    let st = State::in_memory();
    let mut g = st.lock();
    g.set("snaps", &vec!["a", "b"]).unwrap();
    assert!(g.get::<u32>("conns").unwrap_err().is_no_state());
    assert!(matches!(
        g.get::<u32>("snaps"),
        Err(StateError::WrongType { .. })
    ));
}
