use crate::handlers::{Handler, HandlerError, HandlerRegistry, HandlerResult, TaskContext};
use crate::lifecycle::validate_transition;
use crate::restart::RestartManager;
use crate::CoreError;
use chrono::{DateTime, Utc};
use overseer_state::{Change, ChangeId, State, StateGuard, Status, Task, TaskId};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Predicate keeping `task` from starting while `running` tasks execute.
pub type BlockedFn = Box<dyn Fn(&Task, &[&Task]) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Do,
    Undo,
}

impl Direction {
    fn pending(self) -> Status {
        match self {
            Direction::Do => Status::Do,
            Direction::Undo => Status::Undo,
        }
    }

    fn running(self) -> Status {
        match self {
            Direction::Do => Status::Doing,
            Direction::Undo => Status::Undoing,
        }
    }

    fn finished(self) -> Status {
        match self {
            Direction::Do => Status::Done,
            Direction::Undo => Status::Undone,
        }
    }
}

/// What one scheduling pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnsurePass {
    /// Tasks handed to a worker during this pass.
    pub started: Vec<TaskId>,
    /// Changes that became ready during this pass.
    pub ready_changes: Vec<ChangeId>,
    /// Some task status changed without a worker being started.
    pub changed: bool,
    /// Earliest time a postponed task becomes eligible again.
    pub next_wakeup: Option<DateTime<Utc>>,
}

impl EnsurePass {
    pub fn made_progress(&self) -> bool {
        self.changed || !self.started.is_empty() || !self.ready_changes.is_empty()
    }

    fn wake_at(&mut self, at: DateTime<Utc>) {
        self.next_wakeup = Some(self.next_wakeup.map_or(at, |cur| cur.min(at)));
    }
}

struct Worker {
    handle: JoinHandle<()>,
    direction: Direction,
}

struct Launch {
    task: TaskId,
    change: Option<ChangeId>,
    kind: String,
    direction: Direction,
    handler: Handler,
    retryable: bool,
}

/// Drives the tasks of every change toward a terminal status.
///
/// Each call to [`Runner::ensure`] is one scheduling pass: under the state
/// lock it decides which tasks may start, marks them running and persists
/// that, then hands each to its own worker thread. Workers take the lock
/// again only to record the outcome. Passes are serialized with each other
/// and with [`Runner::wait`].
pub struct Runner {
    state: State,
    registry: HandlerRegistry,
    restart: RestartManager,
    retry_backoff: Duration,
    blocked: Vec<BlockedFn>,
    pass_lock: Mutex<()>,
    workers: Mutex<HashMap<TaskId, Worker>>,
    stopped: AtomicBool,
}

impl Runner {
    pub fn new(state: State, registry: HandlerRegistry, restart: RestartManager) -> Self {
        Self {
            state,
            registry,
            restart,
            retry_backoff: Duration::from_secs(1),
            blocked: Vec::new(),
            pass_lock: Mutex::new(()),
            workers: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Delay applied when a handler asks for a retry without naming one.
    #[must_use]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn add_blocked<F>(&mut self, pred: F)
    where
        F: Fn(&Task, &[&Task]) -> bool + Send + Sync + 'static,
    {
        self.blocked.push(Box::new(pred));
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Tasks currently owned by a worker, in id order.
    pub fn running(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.workers().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<TaskId, Worker>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pass_guard(&self) -> MutexGuard<'_, ()> {
        self.pass_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put tasks left `Doing`/`Undoing` by a previous process back in line.
    ///
    /// Handlers must therefore tolerate running again after an interruption.
    pub fn recover(&self) -> Result<usize, CoreError> {
        let _pass = self.pass_guard();
        let workers = self.workers();
        let mut g = self.state.lock();
        let orphans: Vec<TaskId> = g
            .tasks()
            .filter(|t| t.status().is_running() && !workers.contains_key(&t.id()))
            .map(Task::id)
            .collect();
        for id in &orphans {
            revert_interrupted(g.task_mut(*id)?)?;
        }
        g.unlock()?;
        if !orphans.is_empty() {
            info!("recovered {} interrupted tasks", orphans.len());
        }
        Ok(orphans.len())
    }

    /// Run one scheduling pass.
    pub fn ensure(&self) -> Result<EnsurePass, CoreError> {
        let mut pass = EnsurePass::default();
        if self.is_stopped() {
            return Ok(pass);
        }
        let _pass = self.pass_guard();
        let mut workers = self.workers();
        reap(&mut workers);

        let mut running: Vec<TaskId> = workers.keys().copied().collect();
        running.sort_unstable();
        let mut launches = Vec::new();
        let now = Utc::now();

        let mut g = self.state.lock();
        let ids: Vec<ChangeId> = g.changes().map(Change::id).collect();
        for id in ids {
            if g.change(id)?.is_ready() && g.change_is_ready(id)? {
                continue;
            }
            self.plan_change(&mut g, id, now, &mut running, &mut launches, &mut pass)?;
            let status = g.refresh_change_status(id)?;
            let chg = g.change(id)?;
            if chg.is_ready() {
                info!("change {id} \"{}\" is ready: {status}", chg.summary());
                pass.ready_changes.push(id);
            }
        }
        // Running statuses must be durable before any handler acts.
        g.unlock()?;

        for launch in launches {
            let id = launch.task;
            let direction = launch.direction;
            match self.spawn(launch) {
                Ok(handle) => {
                    workers.insert(id, Worker { handle, direction });
                    pass.started.push(id);
                }
                // Left running without a worker; the next pass reverts it.
                Err(e) => error!("cannot start worker for task {id}: {e}"),
            }
        }
        Ok(pass)
    }

    /// Block until every in-flight worker finished; returns how many were
    /// joined.
    pub fn wait(&self) -> usize {
        let _pass = self.pass_guard();
        let drained: Vec<(TaskId, Worker)> = self.workers().drain().collect();
        let joined = drained.len();
        for (id, worker) in drained {
            if worker.handle.join().is_err() {
                error!("worker for task {id} ({:?}) panicked", worker.direction);
            }
        }
        joined
    }

    /// Refuse further passes and wait for in-flight workers.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let joined = self.wait();
        if joined > 0 {
            debug!("joined {joined} workers on stop");
        }
        debug!("runner stopped");
    }

    fn plan_change(
        &self,
        g: &mut StateGuard<'_>,
        id: ChangeId,
        now: DateTime<Utc>,
        running: &mut Vec<TaskId>,
        launches: &mut Vec<Launch>,
        pass: &mut EnsurePass,
    ) -> Result<(), CoreError> {
        let mut ids = g.change(id)?.task_ids().to_vec();
        ids.sort_unstable();

        for tid in &ids {
            if g.task(*tid)?.status().is_running() && !running.contains(tid) {
                revert_interrupted(g.task_mut(*tid)?)?;
                pass.changed = true;
            }
        }

        let mut failing = g.change(id)?.is_undoing()
            || ids
                .iter()
                .any(|t| g.task(*t).is_ok_and(|t| t.status() == Status::Error));
        if !failing {
            failing = self.plan_do(g, &ids, now, running, launches, pass)?;
        }
        if failing {
            if !g.change(id)?.is_undoing() {
                g.change_mut(id)?.mark_undoing();
                info!("change {id} failed, undoing completed tasks");
            }
            self.plan_undo(g, &ids, now, running, launches, pass)?;
        }
        Ok(())
    }

    /// Start every task whose predecessors are done. Returns true when a
    /// task failed during planning.
    fn plan_do(
        &self,
        g: &mut StateGuard<'_>,
        ids: &[TaskId],
        now: DateTime<Utc>,
        running: &mut Vec<TaskId>,
        launches: &mut Vec<Launch>,
        pass: &mut EnsurePass,
    ) -> Result<bool, CoreError> {
        for tid in ids {
            if g.task(*tid)?.status() == Status::Default {
                move_to(g.task_mut(*tid)?, Status::Do)?;
                pass.changed = true;
            }
        }

        for tid in ids {
            let task = g.task(*tid)?;
            if task.status() != Status::Do {
                continue;
            }
            if let Some(at) = task.at_time() {
                if at > now {
                    pass.wake_at(at);
                    continue;
                }
            }
            let ready = task
                .wait_tasks()
                .iter()
                .all(|p| g.task(*p).map_or(true, |p| p.status() == Status::Done));
            if !ready {
                continue;
            }

            let Some(reg) = self.registry.get(task.kind()) else {
                let kind = task.kind().to_owned();
                let t = g.task_mut(*tid)?;
                t.errorf(format!("no handler registered for task kind \"{kind}\""));
                move_to(t, Status::Error)?;
                warn!("task {tid} has unknown kind \"{kind}\"");
                pass.changed = true;
                return Ok(true);
            };
            if !self.may_start(g, *tid, running)? {
                continue;
            }
            launches.push(Launch {
                task: *tid,
                change: task.change(),
                kind: task.kind().to_owned(),
                direction: Direction::Do,
                handler: reg.do_handler().clone(),
                retryable: reg.options().retryable,
            });
            move_to(g.task_mut(*tid)?, Status::Doing)?;
            running.push(*tid);
        }
        Ok(false)
    }

    /// Unwind a failing change: skip what never started, then undo done
    /// tasks once all their successors are out of the way.
    fn plan_undo(
        &self,
        g: &mut StateGuard<'_>,
        ids: &[TaskId],
        now: DateTime<Utc>,
        running: &mut Vec<TaskId>,
        launches: &mut Vec<Launch>,
        pass: &mut EnsurePass,
    ) -> Result<(), CoreError> {
        for tid in ids {
            if g.task(*tid)?.status().is_pending_do() {
                move_to(g.task_mut(*tid)?, Status::Abort)?;
                pass.changed = true;
            }
        }

        // Tasks without an undo handler complete instantly, which may free
        // their predecessors within the same pass.
        loop {
            let mut progressed = false;
            for tid in ids.iter().rev() {
                let task = g.task(*tid)?;
                if !matches!(task.status(), Status::Done | Status::Wait) {
                    continue;
                }
                let halted = task.halt_tasks().iter().all(|s| {
                    g.task(*s).map_or(true, |s| {
                        matches!(s.status(), Status::Undone | Status::Abort | Status::Error)
                    })
                });
                if !halted {
                    continue;
                }
                let next = if self.registry.has_undo(task.kind()) {
                    Status::Undo
                } else {
                    Status::Undone
                };
                move_to(g.task_mut(*tid)?, next)?;
                pass.changed = true;
                progressed = true;
            }
            if !progressed {
                break;
            }
        }

        for tid in ids {
            let task = g.task(*tid)?;
            if task.status() != Status::Undo {
                continue;
            }
            if let Some(at) = task.at_time() {
                if at > now {
                    pass.wake_at(at);
                    continue;
                }
            }
            let Some(handler) = self
                .registry
                .get(task.kind())
                .and_then(|r| r.undo_handler().cloned())
            else {
                move_to(g.task_mut(*tid)?, Status::Undone)?;
                pass.changed = true;
                continue;
            };
            if !self.may_start(g, *tid, running)? {
                continue;
            }
            let retryable = self
                .registry
                .get(task.kind())
                .is_some_and(|r| r.options().retryable);
            launches.push(Launch {
                task: *tid,
                change: task.change(),
                kind: task.kind().to_owned(),
                direction: Direction::Undo,
                handler,
                retryable,
            });
            move_to(g.task_mut(*tid)?, Status::Undoing)?;
            running.push(*tid);
        }
        Ok(())
    }

    fn may_start(
        &self,
        g: &StateGuard<'_>,
        id: TaskId,
        running: &[TaskId],
    ) -> Result<bool, CoreError> {
        let task = g.task(id)?;
        let exclusive = |kind: &str| {
            self.registry
                .get(kind)
                .is_some_and(|r| r.options().exclusive)
        };
        if exclusive(task.kind()) && !running.is_empty() {
            return Ok(false);
        }
        let others: Vec<&Task> = running.iter().filter_map(|r| g.task(*r).ok()).collect();
        if others.iter().any(|t| exclusive(t.kind())) {
            return Ok(false);
        }
        Ok(!self.blocked.iter().any(|pred| pred(task, &others)))
    }

    fn spawn(&self, launch: Launch) -> Result<JoinHandle<()>, CoreError> {
        let state = self.state.clone();
        let restart = self.restart.clone();
        let backoff = self.retry_backoff;
        let handle = thread::Builder::new()
            .name(format!("task-{}", launch.task))
            .spawn(move || run_task(&state, restart, &launch, backoff))?;
        Ok(handle)
    }
}

fn reap(workers: &mut HashMap<TaskId, Worker>) {
    let finished: Vec<TaskId> = workers
        .iter()
        .filter(|(_, w)| w.handle.is_finished())
        .map(|(id, _)| *id)
        .collect();
    for id in finished {
        if let Some(w) = workers.remove(&id) {
            if w.handle.join().is_err() {
                error!("worker for task {id} panicked");
            }
        }
    }
}

fn move_to(task: &mut Task, to: Status) -> Result<(), CoreError> {
    validate_transition(task.status(), to)?;
    task.set_status(to);
    Ok(())
}

fn revert_interrupted(task: &mut Task) -> Result<(), CoreError> {
    let back = if task.status() == Status::Doing {
        Status::Do
    } else {
        Status::Undo
    };
    move_to(task, back)?;
    task.logf("Interrupted, will run again");
    debug!("task {} reverted to {back}", task.id());
    Ok(())
}

fn run_task(state: &State, restart: RestartManager, launch: &Launch, backoff: Duration) {
    let ctx = TaskContext::new(
        state.clone(),
        launch.task,
        launch.change,
        &launch.kind,
        launch.direction == Direction::Undo,
        restart,
    );
    debug!(
        "running {:?} handler of task {} ({})",
        launch.direction, launch.task, launch.kind
    );
    let result = panic::catch_unwind(AssertUnwindSafe(|| (launch.handler)(&ctx)))
        .unwrap_or_else(|payload| {
            Err(HandlerError::Fatal(format!(
                "handler panicked: {}",
                panic_message(payload.as_ref())
            )))
        });
    let wait_marker = ctx.take_wait_marker();

    let mut g = state.lock();
    if let Err(e) = finish(&mut g, launch, result, wait_marker, backoff) {
        error!("cannot record outcome of task {}: {e}", launch.task);
    }
    if let Err(e) = g.unlock() {
        error!("cannot persist outcome of task {}: {e}", launch.task);
    }
}

fn finish(
    g: &mut StateGuard<'_>,
    launch: &Launch,
    result: HandlerResult,
    wait_marker: Option<String>,
    backoff: Duration,
) -> Result<(), CoreError> {
    let id = launch.task;
    let Ok(task) = g.task_mut(id) else {
        warn!("task {id} disappeared while its handler was running");
        return Ok(());
    };
    if task.status() != launch.direction.running() {
        warn!(
            "task {id} is {} after its handler ran, leaving it alone",
            task.status()
        );
        return Ok(());
    }

    let result = match result {
        Err(HandlerError::Retry { reason, .. }) if !launch.retryable => Err(HandlerError::Fatal(
            format!("{reason} (task kind \"{}\" does not allow retries)", launch.kind),
        )),
        other => other,
    };

    match result {
        Ok(()) => {
            task.set_at_time(None);
            let done = launch.direction.finished();
            if let Some(marker) = wait_marker {
                validate_transition(task.status(), Status::Wait)?;
                task.set_to_wait(&marker, done);
                task.logf(format!("Waiting for {marker}"));
                debug!("task {id} waits for {marker}");
            } else {
                move_to(task, done)?;
                debug!("task {id} ({}) is {done}", launch.kind);
            }
        }
        Err(HandlerError::Retry { after, reason }) => {
            let delay = after.unwrap_or(backoff);
            let at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            move_to(task, launch.direction.pending())?;
            task.set_at_time(Some(at));
            task.logf(format!("Will retry in {delay:?}: {reason}"));
            debug!("task {id} will retry in {delay:?}: {reason}");
        }
        Err(HandlerError::Fatal(msg)) => match launch.direction {
            Direction::Do => {
                task.errorf(&msg);
                move_to(task, Status::Error)?;
                warn!("task {id} ({}) failed: {msg}", launch.kind);
            }
            Direction::Undo => {
                task.warnf(format!("undo failed: {msg}"));
                move_to(task, Status::Undone)?;
                warn!("undo of task {id} ({}) failed: {msg}", launch.kind);
            }
        },
    }
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
