//! Change execution semantics through the engine with custom handlers:
//! ordering, unwinding on failure, retries, aborts, exclusivity and
//! resumption after a crash.

use overseer_core::{
    Engine, EngineConfig, HandlerError, HandlerOptions, HandlerRegistry, HandlerResult,
};
use overseer_runtime::MockBackend;
use overseer_state::{ChangeId, FileBackend, State, StateLayout, Status, TaskId, TaskSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

type Journal = Arc<Mutex<Vec<String>>>;

fn engine(state: State, registry: HandlerRegistry) -> Engine {
    let mut config = EngineConfig::with_root("/nonexistent/overseer-test");
    config.backend = "mock".to_owned();
    config.retry_backoff_ms = 10;
    Engine::assemble(config, state, Arc::new(MockBackend::new()), registry).unwrap()
}

fn record(journal: &Journal, entry: &str) -> impl Fn(&overseer_core::TaskContext) -> HandlerResult {
    let journal = Arc::clone(journal);
    let entry = entry.to_owned();
    move |_ctx| {
        journal.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

/// A change whose tasks run strictly one after another.
fn chain(st: &State, kinds: &[&str]) -> (ChangeId, Vec<TaskId>) {
    let mut g = st.lock();
    let chg = g.new_change("test", "Test change");
    let mut ids: Vec<TaskId> = Vec::new();
    for kind in kinds {
        let id = g.new_task(kind, &format!("{kind} task"));
        if let Some(prev) = ids.last() {
            g.wait_for(id, *prev).unwrap();
        }
        ids.push(id);
    }
    g.add_all(chg, &TaskSet::from_tasks(ids.clone())).unwrap();
    g.unlock().unwrap();
    (chg, ids)
}

fn status(st: &State, id: TaskId) -> Status {
    st.lock().task(id).unwrap().status()
}

#[test]
fn tasks_run_in_dependency_order() {
    let journal = Journal::default();
    let mut registry = HandlerRegistry::new();
    for kind in ["a", "b", "c"] {
        registry.register_do(kind, record(&journal, kind));
    }
    let st = State::in_memory();
    let (chg, _) = chain(&st, &["a", "b", "c"]);
    let engine = engine(st.clone(), registry);
    engine.settle(Duration::from_secs(10)).unwrap();

    assert_eq!(*journal.lock().unwrap(), vec!["a", "b", "c"]);
    let g = st.lock();
    assert_eq!(g.change(chg).unwrap().cached_status(), Status::Done);
    assert!(g.change(chg).unwrap().is_ready());
    assert!(g.change_err(chg).unwrap().is_none());
}

#[test]
fn ensure_on_finished_changes_does_nothing() {
    let journal = Journal::default();
    let mut registry = HandlerRegistry::new();
    for kind in ["a", "b"] {
        registry.register_do(kind, record(&journal, kind));
    }
    let st = State::in_memory();
    let (_, ids) = chain(&st, &["a", "b"]);
    let engine = engine(st.clone(), registry);
    engine.settle(Duration::from_secs(10)).unwrap();

    for _ in 0..3 {
        let pass = engine.ensure().unwrap();
        engine.runner().wait();
        assert!(!pass.made_progress());
        assert!(pass.started.is_empty());
    }
    assert_eq!(journal.lock().unwrap().len(), 2);
    for id in ids {
        assert_eq!(status(&st, id), Status::Done);
    }
}

#[test]
fn settle_finishes_a_chain_already_in_flight() {
    let journal = Journal::default();
    let mut registry = HandlerRegistry::new();
    let slow_journal = Arc::clone(&journal);
    registry.register_do("slow", move |_ctx| {
        thread::sleep(Duration::from_millis(200));
        slow_journal.lock().unwrap().push("slow".to_owned());
        Ok(())
    });
    registry.register_do("b", record(&journal, "b"));

    let st = State::in_memory();
    let (chg, ids) = chain(&st, &["slow", "b"]);
    let engine = engine(st.clone(), registry);
    let pass = engine.ensure().unwrap();
    assert_eq!(pass.started, vec![ids[0]]);
    engine.settle(Duration::from_secs(10)).unwrap();

    assert_eq!(*journal.lock().unwrap(), vec!["slow", "b"]);
    assert_eq!(status(&st, ids[1]), Status::Done);
    let g = st.lock();
    assert_eq!(g.change(chg).unwrap().cached_status(), Status::Done);
    assert!(g.change(chg).unwrap().is_ready());
}

#[test]
fn settle_finishes_an_abort_whose_undo_is_in_flight() {
    let journal = Journal::default();
    let mut registry = HandlerRegistry::new();
    let undo_journal = Arc::clone(&journal);
    registry.register("a", record(&journal, "do a"), move |_ctx| {
        thread::sleep(Duration::from_millis(200));
        undo_journal.lock().unwrap().push("undo a".to_owned());
        Ok(())
    });
    registry.register_do("b", record(&journal, "do b"));

    let st = State::in_memory();
    let (chg, ids) = {
        let mut g = st.lock();
        let chg = g.new_change("test", "Test change");
        let a = g.new_task("a", "a task");
        let b = g.new_task("b", "b task");
        g.wait_for(b, a).unwrap();
        g.add_all(chg, &TaskSet::from_tasks(vec![a, b])).unwrap();
        g.task_mut(a).unwrap().set_status(Status::Done);
        g.unlock().unwrap();
        (chg, vec![a, b])
    };
    let engine = engine(st.clone(), registry);
    // The abort's own pass starts the slow undo.
    assert!(engine.abort(chg).unwrap());
    engine.settle(Duration::from_secs(10)).unwrap();

    assert_eq!(*journal.lock().unwrap(), vec!["undo a"]);
    assert_eq!(status(&st, ids[0]), Status::Undone);
    assert_eq!(status(&st, ids[1]), Status::Abort);
    let g = st.lock();
    assert_eq!(g.change(chg).unwrap().cached_status(), Status::Undone);
    assert!(g.change(chg).unwrap().is_ready());
}

#[test]
fn failure_unwinds_completed_tasks_and_aborts_the_rest() {
    let journal = Journal::default();
    let mut registry = HandlerRegistry::new();
    registry.register("a", record(&journal, "do a"), record(&journal, "undo a"));
    registry.register(
        "b",
        |_ctx| Err(HandlerError::fatal("boom")),
        record(&journal, "undo b"),
    );
    registry.register("c", record(&journal, "do c"), record(&journal, "undo c"));

    let st = State::in_memory();
    let (chg, ids) = chain(&st, &["a", "b", "c"]);
    let engine = engine(st.clone(), registry);
    engine.settle(Duration::from_secs(10)).unwrap();

    assert_eq!(*journal.lock().unwrap(), vec!["do a", "undo a"]);
    assert_eq!(status(&st, ids[0]), Status::Undone);
    assert_eq!(status(&st, ids[1]), Status::Error);
    assert_eq!(status(&st, ids[2]), Status::Abort);

    let g = st.lock();
    assert_eq!(g.change(chg).unwrap().cached_status(), Status::Error);
    assert_eq!(
        g.change_err(chg).unwrap().unwrap(),
        "cannot perform the following tasks:\n- b task (boom)"
    );
    assert_eq!(g.task(ids[1]).unwrap().last_error(), Some("boom"));
}

#[test]
fn undo_waits_for_every_successor() {
    // c fails after b finished, so b is undone before a.
    let journal = Journal::default();
    let mut registry = HandlerRegistry::new();
    registry.register("a", record(&journal, "do a"), record(&journal, "undo a"));
    registry.register("b", record(&journal, "do b"), record(&journal, "undo b"));
    registry.register_do("c", |_ctx| Err(HandlerError::fatal("no")));

    let st = State::in_memory();
    let chg = {
        let mut g = st.lock();
        let chg = g.new_change("test", "Three steps");
        let a = g.new_task("a", "a task");
        let b = g.new_task("b", "b task");
        let c = g.new_task("c", "c task");
        g.wait_for(b, a).unwrap();
        g.wait_for(c, b).unwrap();
        g.add_all(chg, &TaskSet::from_tasks([a, b, c])).unwrap();
        g.unlock().unwrap();
        chg
    };
    let engine = engine(st.clone(), registry);
    engine.settle(Duration::from_secs(10)).unwrap();

    assert_eq!(
        *journal.lock().unwrap(),
        vec!["do a", "do b", "undo b", "undo a"]
    );
    assert_eq!(st.lock().change(chg).unwrap().cached_status(), Status::Error);
}

#[test]
fn failed_undo_leaves_a_warning_and_keeps_unwinding() {
    let journal = Journal::default();
    let mut registry = HandlerRegistry::new();
    registry.register("a", record(&journal, "do a"), record(&journal, "undo a"));
    registry.register("b", record(&journal, "do b"), |_ctx| {
        Err(HandlerError::fatal("cannot restore"))
    });
    registry.register_do("c", |_ctx| Err(HandlerError::fatal("no")));

    let st = State::in_memory();
    let (chg, ids) = chain(&st, &["a", "b", "c"]);
    let engine = engine(st.clone(), registry);
    engine.settle(Duration::from_secs(10)).unwrap();

    assert_eq!(status(&st, ids[1]), Status::Undone);
    assert_eq!(status(&st, ids[0]), Status::Undone);
    assert!(journal.lock().unwrap().contains(&"undo a".to_owned()));
    let g = st.lock();
    assert!(g.task(ids[1])
        .unwrap()
        .log()
        .iter()
        .any(|l| l.contains("WARNING") && l.contains("undo failed: cannot restore")));
    assert!(g.change(chg).unwrap().is_ready());
}

#[test]
fn retry_postpones_the_task() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    let counter = Arc::clone(&calls);
    registry.register_do("flaky", move |_ctx| {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            return Err(HandlerError::retry_after(
                Duration::from_millis(20),
                "not yet",
            ));
        }
        Ok(())
    });

    let st = State::in_memory();
    let (chg, ids) = chain(&st, &["flaky"]);
    let engine = engine(st.clone(), registry);
    engine.settle(Duration::from_secs(10)).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let g = st.lock();
    assert_eq!(g.change(chg).unwrap().cached_status(), Status::Done);
    let retries = g
        .task(ids[0])
        .unwrap()
        .log()
        .iter()
        .filter(|l| l.contains("Will retry") && l.contains("not yet"))
        .count();
    assert_eq!(retries, 2);
    assert!(g.task(ids[0]).unwrap().at_time().is_none());
}

#[test]
fn settle_times_out_on_a_distant_retry() {
    let mut registry = HandlerRegistry::new();
    registry.register_do("slow", |_ctx| {
        Err(HandlerError::retry_after(
            Duration::from_secs(3600),
            "come back later",
        ))
    });
    let st = State::in_memory();
    chain(&st, &["slow"]);
    let engine = engine(st, registry);
    assert!(matches!(
        engine.settle(Duration::from_millis(200)),
        Err(overseer_core::CoreError::SettleTimeout(_))
    ));
}

#[test]
fn abort_before_start_applies_nothing() {
    let journal = Journal::default();
    let mut registry = HandlerRegistry::new();
    registry.register("a", record(&journal, "do a"), record(&journal, "undo a"));
    let st = State::in_memory();
    let (chg, ids) = {
        let mut g = st.lock();
        let chg = g.new_change("test", "Never runs");
        let a = g.new_task("a", "a task");
        g.add_task(chg, a).unwrap();
        g.abort_change(chg).unwrap();
        g.unlock().unwrap();
        (chg, vec![a])
    };
    let engine = engine(st.clone(), registry);
    engine.settle(Duration::from_secs(10)).unwrap();

    assert!(journal.lock().unwrap().is_empty());
    assert_eq!(status(&st, ids[0]), Status::Abort);
    assert_eq!(st.lock().change(chg).unwrap().cached_status(), Status::Undone);
    assert!(!engine.abort(chg).unwrap());
}

#[test]
fn abort_midway_undoes_what_was_done() {
    let journal = Journal::default();
    let mut registry = HandlerRegistry::new();
    registry.register("a", record(&journal, "do a"), record(&journal, "undo a"));
    registry.register("b", record(&journal, "do b"), record(&journal, "undo b"));

    let st = State::in_memory();
    let (chg, ids) = chain(&st, &["a", "b"]);
    let engine = engine(st.clone(), registry);
    engine.runner().ensure().unwrap();
    engine.runner().wait();
    assert_eq!(status(&st, ids[0]), Status::Done);

    assert!(engine.abort(chg).unwrap());
    engine.settle(Duration::from_secs(10)).unwrap();

    assert_eq!(*journal.lock().unwrap(), vec!["do a", "undo a"]);
    assert_eq!(status(&st, ids[1]), Status::Abort);
    let g = st.lock();
    assert_eq!(g.change(chg).unwrap().cached_status(), Status::Undone);
    assert!(g.change(chg).unwrap().abort_requested());
}

struct Overlap {
    current: AtomicUsize,
    max: AtomicUsize,
}

fn overlapping(overlap: &Arc<Overlap>) -> impl Fn(&overseer_core::TaskContext) -> HandlerResult {
    let overlap = Arc::clone(overlap);
    move |_ctx| {
        let now = overlap.current.fetch_add(1, Ordering::SeqCst) + 1;
        overlap.max.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(150));
        overlap.current.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

fn two_changes(st: &State, kind: &str) {
    for _ in 0..2 {
        chain(st, &[kind]);
    }
}

#[test]
fn independent_changes_run_concurrently() {
    let overlap = Arc::new(Overlap {
        current: AtomicUsize::new(0),
        max: AtomicUsize::new(0),
    });
    let mut registry = HandlerRegistry::new();
    registry.register_do("work", overlapping(&overlap));
    let st = State::in_memory();
    two_changes(&st, "work");
    let engine = engine(st, registry);
    engine.settle(Duration::from_secs(10)).unwrap();
    assert_eq!(overlap.max.load(Ordering::SeqCst), 2);
}

#[test]
fn exclusive_kind_runs_alone() {
    let overlap = Arc::new(Overlap {
        current: AtomicUsize::new(0),
        max: AtomicUsize::new(0),
    });
    let mut registry = HandlerRegistry::new();
    registry.register_with(
        "solo",
        Arc::new(overlapping(&overlap)),
        None,
        HandlerOptions {
            retryable: true,
            exclusive: true,
        },
    );
    let st = State::in_memory();
    two_changes(&st, "solo");
    let engine = engine(st.clone(), registry);
    engine.settle(Duration::from_secs(10)).unwrap();
    assert_eq!(overlap.max.load(Ordering::SeqCst), 1);
    assert!(st.lock().changes().all(|c| c.cached_status() == Status::Done));
}

#[test]
fn blocked_predicate_holds_tasks_back() {
    let overlap = Arc::new(Overlap {
        current: AtomicUsize::new(0),
        max: AtomicUsize::new(0),
    });
    let mut registry = HandlerRegistry::new();
    registry.register_do("work", overlapping(&overlap));
    let st = State::in_memory();
    two_changes(&st, "work");
    let mut engine = engine(st, registry);
    engine
        .runner_mut()
        .add_blocked(|task, running| running.iter().any(|r| r.kind() == task.kind()));
    engine.settle(Duration::from_secs(10)).unwrap();
    assert_eq!(overlap.max.load(Ordering::SeqCst), 1);
}

#[test]
fn failure_in_one_change_leaves_others_alone() {
    let journal = Journal::default();
    let mut registry = HandlerRegistry::new();
    registry.register("ok", record(&journal, "ok"), record(&journal, "undo ok"));
    registry.register_do("bad", |_ctx| Err(HandlerError::fatal("broken")));

    let st = State::in_memory();
    let (good, _) = chain(&st, &["ok"]);
    let (failed, _) = chain(&st, &["ok", "bad"]);
    let engine = engine(st.clone(), registry);
    engine.settle(Duration::from_secs(10)).unwrap();

    let g = st.lock();
    assert_eq!(g.change(good).unwrap().cached_status(), Status::Done);
    assert_eq!(g.change(failed).unwrap().cached_status(), Status::Error);
    let undone = journal
        .lock()
        .unwrap()
        .iter()
        .filter(|e| *e == "undo ok")
        .count();
    assert_eq!(undone, 1);
}

#[test]
fn interrupted_change_resumes_without_repeating_done_work() {
    let dir = tempfile::tempdir().unwrap();
    let layout = StateLayout::new(dir.path());
    layout.initialize().unwrap();

    // A crash right after `b` was marked running: `a` is done, `b` is
    // Doing with nobody executing it.
    let (chg, ids) = {
        let st = State::load(Arc::new(FileBackend::new(&layout))).unwrap();
        let (chg, ids) = chain(&st, &["a", "b"]);
        let mut g = st.lock();
        g.task_mut(ids[0]).unwrap().set_status(Status::Do);
        g.task_mut(ids[0]).unwrap().set_status(Status::Doing);
        g.task_mut(ids[0]).unwrap().set_status(Status::Done);
        g.task_mut(ids[1]).unwrap().set_status(Status::Do);
        g.task_mut(ids[1]).unwrap().set_status(Status::Doing);
        g.unlock().unwrap();
        (chg, ids)
    };

    let journal = Journal::default();
    let mut registry = HandlerRegistry::new();
    registry.register("a", record(&journal, "do a"), record(&journal, "undo a"));
    registry.register("b", record(&journal, "do b"), record(&journal, "undo b"));
    let st = State::load(Arc::new(FileBackend::new(&layout))).unwrap();
    assert_eq!(status(&st, ids[1]), Status::Doing);

    let engine = engine(st.clone(), registry);
    assert_eq!(status(&st, ids[1]), Status::Do);
    engine.settle(Duration::from_secs(10)).unwrap();

    assert_eq!(*journal.lock().unwrap(), vec!["do b"]);
    let g = st.lock();
    assert_eq!(g.change(chg).unwrap().cached_status(), Status::Done);
    assert!(g
        .task(ids[1])
        .unwrap()
        .log()
        .iter()
        .any(|l| l.contains("Interrupted, will run again")));
}

#[test]
fn settled_state_is_durable() {
    let dir = tempfile::tempdir().unwrap();
    let layout = StateLayout::new(dir.path());
    layout.initialize().unwrap();
    let mut registry = HandlerRegistry::new();
    registry.register_do("a", |ctx| ctx.set("result", &"ok"));

    let (chg, ids) = {
        let st = State::load(Arc::new(FileBackend::new(&layout))).unwrap();
        let (chg, ids) = chain(&st, &["a"]);
        let engine = engine(st, registry);
        engine.settle(Duration::from_secs(10)).unwrap();
        (chg, ids)
    };

    let st = State::load(Arc::new(FileBackend::new(&layout))).unwrap();
    let g = st.lock();
    assert_eq!(g.change(chg).unwrap().cached_status(), Status::Done);
    let result: String = g.task(ids[0]).unwrap().get("result").unwrap();
    assert_eq!(result, "ok");
}
