use crate::backend::{MemoryBackend, StateBackend};
use crate::change::{aggregate_status, render_err, Change};
use crate::data::DataBag;
use crate::status::Status;
use crate::task::Task;
use crate::taskset::TaskSet;
use crate::types::{ChangeId, TaskId};
use crate::StateError;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Version of the persisted document layout.
pub const STATE_FORMAT_VERSION: u32 = 1;

/// Deduplicated, timestamped notice recorded by best-effort operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Warning {
    pub message: String,
    pub first_added: DateTime<Utc>,
    pub last_added: DateTime<Utc>,
    pub count: u32,
}

/// What a [`StateGuard::prune`] pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub removed_changes: Vec<ChangeId>,
    pub aborted_changes: Vec<ChangeId>,
    pub removed_tasks: usize,
}

impl PruneReport {
    pub fn is_empty(&self) -> bool {
        self.removed_changes.is_empty() && self.aborted_changes.is_empty() && self.removed_tasks == 0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Document {
    #[serde(default)]
    data: DataBag,
    #[serde(default)]
    changes: BTreeMap<ChangeId, Change>,
    #[serde(default)]
    tasks: BTreeMap<TaskId, Task>,
    #[serde(default)]
    warnings: Vec<Warning>,
    #[serde(default)]
    last_change_id: u64,
    #[serde(default)]
    last_task_id: u64,
}

/// On-disk wrapper: the document body plus its version and checksum.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Envelope {
    format_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checksum: Option<String>,
    document: serde_json::Value,
}

fn body_checksum(body: &serde_json::Value) -> Result<String, StateError> {
    // serde_json maps are sorted, so this encoding is canonical
    let bytes = serde_json::to_vec(body)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

fn encode(doc: &Document) -> Result<Vec<u8>, StateError> {
    let body = serde_json::to_value(doc)?;
    let envelope = Envelope {
        format_version: STATE_FORMAT_VERSION,
        checksum: Some(body_checksum(&body)?),
        document: body,
    };
    Ok(serde_json::to_vec_pretty(&envelope)?)
}

fn decode(bytes: &[u8]) -> Result<Document, StateError> {
    let envelope: Envelope = serde_json::from_slice(bytes)?;
    if envelope.format_version != STATE_FORMAT_VERSION {
        return Err(StateError::VersionMismatch {
            expected: STATE_FORMAT_VERSION,
            found: envelope.format_version,
        });
    }
    if let Some(expected) = envelope.checksum {
        let actual = body_checksum(&envelope.document)?;
        if actual != expected {
            return Err(StateError::IntegrityFailure { expected, actual });
        }
    }
    Ok(serde_json::from_value(envelope.document)?)
}

struct Inner {
    doc: Document,
    dirty: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    backend: Arc<dyn StateBackend>,
}

/// Process-wide document store.
///
/// Cloning is cheap and yields another handle to the same document. All
/// access goes through [`State::lock`]; the returned guard checkpoints the
/// whole document to the backend when it is released dirty.
#[derive(Clone)]
pub struct State {
    shared: Arc<Shared>,
}

impl State {
    /// Empty store that checkpoints into `backend` without reading it first.
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self::from_document(Document::default(), backend)
    }

    /// Load the last checkpoint from `backend`, or start empty.
    pub fn load(backend: Arc<dyn StateBackend>) -> Result<Self, StateError> {
        let doc = match backend.load()? {
            Some(bytes) => {
                let doc = decode(&bytes)?;
                debug!(
                    "loaded state: {} changes, {} tasks",
                    doc.changes.len(),
                    doc.tasks.len()
                );
                doc
            }
            None => Document::default(),
        };
        Ok(Self::from_document(doc, backend))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    fn from_document(doc: Document, backend: Arc<dyn StateBackend>) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner { doc, dirty: false }),
                backend,
            }),
        }
    }

    /// Acquire the store lock.
    ///
    /// A panic while the lock was held poisons the mutex; the document is
    /// still consistent at the granularity of individual guard methods, so
    /// the poison is logged and cleared.
    pub fn lock(&self) -> StateGuard<'_> {
        let inner = self.shared.inner.lock().unwrap_or_else(|poisoned| {
            warn!("state lock was poisoned by a panicking holder, recovering");
            poisoned.into_inner()
        });
        StateGuard {
            inner,
            backend: self.shared.backend.as_ref(),
            attempted: false,
        }
    }

    /// True when both handles share one document.
    pub fn same_as(&self, other: &State) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

/// Exclusive access to the document.
///
/// Dropping a dirty guard checkpoints and logs a failure with `error!`;
/// prefer [`StateGuard::unlock`] where the caller can act on the error.
pub struct StateGuard<'a> {
    inner: MutexGuard<'a, Inner>,
    backend: &'a dyn StateBackend,
    attempted: bool,
}

impl StateGuard<'_> {
    /// Release the lock, returning any checkpoint failure.
    ///
    /// On failure the document stays dirty and the next unlock retries.
    pub fn unlock(mut self) -> Result<(), StateError> {
        if !self.inner.dirty {
            return Ok(());
        }
        self.attempted = true;
        let res = self.checkpoint();
        if let Err(ref e) = res {
            error!("state checkpoint failed: {e}");
        }
        res
    }

    fn checkpoint(&mut self) -> Result<(), StateError> {
        let bytes = encode(&self.inner.doc)?;
        self.backend.checkpoint(&bytes)?;
        self.inner.dirty = false;
        Ok(())
    }

    fn touch(&mut self) {
        self.inner.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.dirty
    }

    // ---- named entries ----

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StateError> {
        self.inner.doc.data.get(key)
    }

    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), StateError> {
        self.inner.doc.data.set(key, value)?;
        self.touch();
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let removed = self.inner.doc.data.remove(key);
        if removed {
            self.touch();
        }
        removed
    }

    // ---- changes and tasks ----

    pub fn new_change(&mut self, kind: &str, summary: &str) -> ChangeId {
        self.inner.doc.last_change_id += 1;
        let id = ChangeId::new(self.inner.doc.last_change_id);
        self.inner
            .doc
            .changes
            .insert(id, Change::new(id, kind, summary, Utc::now()));
        self.touch();
        id
    }

    pub fn new_task(&mut self, kind: &str, summary: &str) -> TaskId {
        self.inner.doc.last_task_id += 1;
        let id = TaskId::new(self.inner.doc.last_task_id);
        self.inner
            .doc
            .tasks
            .insert(id, Task::new(id, kind, summary, Utc::now()));
        self.touch();
        id
    }

    pub fn change(&self, id: ChangeId) -> Result<&Change, StateError> {
        self.inner
            .doc
            .changes
            .get(&id)
            .ok_or(StateError::ChangeNotFound(id))
    }

    pub fn change_mut(&mut self, id: ChangeId) -> Result<&mut Change, StateError> {
        if !self.inner.doc.changes.contains_key(&id) {
            return Err(StateError::ChangeNotFound(id));
        }
        self.touch();
        self.inner
            .doc
            .changes
            .get_mut(&id)
            .ok_or(StateError::ChangeNotFound(id))
    }

    pub fn task(&self, id: TaskId) -> Result<&Task, StateError> {
        self.inner
            .doc
            .tasks
            .get(&id)
            .ok_or(StateError::TaskNotFound(id))
    }

    pub fn task_mut(&mut self, id: TaskId) -> Result<&mut Task, StateError> {
        if !self.inner.doc.tasks.contains_key(&id) {
            return Err(StateError::TaskNotFound(id));
        }
        self.touch();
        self.inner
            .doc
            .tasks
            .get_mut(&id)
            .ok_or(StateError::TaskNotFound(id))
    }

    /// All changes, by ascending id.
    pub fn changes(&self) -> impl Iterator<Item = &Change> {
        self.inner.doc.changes.values()
    }

    /// All tasks, by ascending id.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.inner.doc.tasks.values()
    }

    pub fn changes_by_kind(&self, kind: &str) -> Vec<&Change> {
        self.changes().filter(|c| c.kind() == kind).collect()
    }

    // ---- wiring ----

    /// Make `task` wait for `predecessor`.
    ///
    /// Rejects an edge between tasks already attached to different changes
    /// and any edge that would close a cycle.
    pub fn wait_for(&mut self, task: TaskId, predecessor: TaskId) -> Result<(), StateError> {
        let t = self.task(task)?;
        let p = self.task(predecessor)?;
        if let (Some(a), Some(b)) = (t.change(), p.change()) {
            if a != b {
                return Err(StateError::CrossChangeDependency { task, predecessor });
            }
        }
        if task == predecessor || self.reaches(predecessor, task) {
            return Err(StateError::DependencyCycle { task, predecessor });
        }
        self.task_mut(task)?.add_wait_task(predecessor);
        self.task_mut(predecessor)?.add_halt_task(task);
        Ok(())
    }

    /// Make `task` wait for every task of `set`.
    pub fn wait_all(&mut self, task: TaskId, set: &TaskSet) -> Result<(), StateError> {
        for p in set.tasks() {
            self.wait_for(task, *p)?;
        }
        Ok(())
    }

    /// Make every task of `set` wait for `predecessor`.
    pub fn set_wait_for(&mut self, set: &TaskSet, predecessor: TaskId) -> Result<(), StateError> {
        for t in set.tasks() {
            self.wait_for(*t, predecessor)?;
        }
        Ok(())
    }

    /// Make every task of `set` wait for every task of `predecessors`.
    pub fn set_wait_all(&mut self, set: &TaskSet, predecessors: &TaskSet) -> Result<(), StateError> {
        for p in predecessors.tasks() {
            self.set_wait_for(set, *p)?;
        }
        Ok(())
    }

    /// Whether `target` is a (transitive) predecessor of `from`.
    fn reaches(&self, from: TaskId, target: TaskId) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(t) = self.inner.doc.tasks.get(&id) {
                stack.extend_from_slice(t.wait_tasks());
            }
        }
        false
    }

    /// Attach one task to a change.
    pub fn add_task(&mut self, change: ChangeId, task: TaskId) -> Result<(), StateError> {
        self.add_all(change, &TaskSet::from_tasks([task]))
    }

    /// Attach every task of `set` to `change`, all or nothing.
    ///
    /// Every edge of an attached task must stay within the change; tasks
    /// not yet attached anywhere may still be added later. The combined
    /// graph is checked for cycles before anything is committed.
    pub fn add_all(&mut self, change: ChangeId, set: &TaskSet) -> Result<(), StateError> {
        self.change(change)?;
        for id in set.tasks() {
            let t = self.task(*id)?;
            if let Some(owner) = t.change() {
                if owner != change {
                    return Err(StateError::AlreadyAttached {
                        task: *id,
                        change: owner,
                    });
                }
            }
            for p in t.wait_tasks() {
                if let Some(owner) = self.task(*p)?.change() {
                    if owner != change {
                        return Err(StateError::CrossChangeDependency {
                            task: *id,
                            predecessor: *p,
                        });
                    }
                }
            }
            for s in t.halt_tasks() {
                if let Some(owner) = self.task(*s)?.change() {
                    if owner != change {
                        return Err(StateError::CrossChangeDependency {
                            task: *s,
                            predecessor: *id,
                        });
                    }
                }
            }
        }

        let mut members: BTreeSet<TaskId> = self.change(change)?.task_ids().iter().copied().collect();
        members.extend(set.tasks().iter().copied());
        self.check_acyclic(&members)?;

        for id in set.tasks() {
            self.task_mut(*id)?.set_change(change);
            self.change_mut(change)?.push_task(*id);
        }
        Ok(())
    }

    fn check_acyclic(&self, members: &BTreeSet<TaskId>) -> Result<(), StateError> {
        let mut indegree: HashMap<TaskId, usize> = HashMap::new();
        for id in members {
            let t = self.task(*id)?;
            let n = t.wait_tasks().iter().filter(|p| members.contains(*p)).count();
            indegree.insert(*id, n);
        }
        let mut queue: VecDeque<TaskId> = indegree
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for s in self.task(id)?.halt_tasks() {
                if let Some(n) = indegree.get_mut(s) {
                    *n -= 1;
                    if *n == 0 {
                        queue.push_back(*s);
                    }
                }
            }
        }
        if visited == members.len() {
            return Ok(());
        }
        // report one edge that sits on the cycle
        for (id, n) in &indegree {
            if *n > 0 {
                let t = self.task(*id)?;
                if let Some(p) = t
                    .wait_tasks()
                    .iter()
                    .find(|p| indegree.get(*p).is_some_and(|m| *m > 0))
                {
                    return Err(StateError::DependencyCycle {
                        task: *id,
                        predecessor: *p,
                    });
                }
            }
        }
        Ok(())
    }

    // ---- change queries ----

    pub fn change_tasks(&self, change: ChangeId) -> Result<Vec<&Task>, StateError> {
        self.change(change)?
            .task_ids()
            .iter()
            .map(|id| self.task(*id))
            .collect()
    }

    /// Status derived from the change's tasks right now.
    pub fn change_status(&self, change: ChangeId) -> Result<Status, StateError> {
        let tasks = self.change_tasks(change)?;
        Ok(aggregate_status(tasks.iter().map(|t| t.status())))
    }

    /// Recompute and cache the change status; returns it.
    pub fn refresh_change_status(&mut self, change: ChangeId) -> Result<Status, StateError> {
        let status = self.change_status(change)?;
        let ready = self.change_is_ready(change)?;
        let chg = self.change(change)?;
        if chg.cached_status() != status || chg.is_ready() != ready {
            self.change_mut(change)?.set_cached_status(status, ready);
        }
        Ok(status)
    }

    /// Every task is terminal and, if the change failed, nothing done is
    /// left to undo.
    pub fn change_is_ready(&self, change: ChangeId) -> Result<bool, StateError> {
        let tasks = self.change_tasks(change)?;
        let failing =
            self.change(change)?.is_undoing() || tasks.iter().any(|t| t.status() == Status::Error);
        Ok(tasks
            .iter()
            .all(|t| t.status().is_ready() && !(failing && t.status() == Status::Done)))
    }

    /// Client-facing error of a failed change, if any task failed.
    pub fn change_err(&self, change: ChangeId) -> Result<Option<String>, StateError> {
        Ok(render_err(self.change_tasks(change)?))
    }

    /// Request cooperative cancellation of `change`.
    ///
    /// Tasks that have not started become `Abort`; running tasks finish on
    /// their own and the change then unwinds what was done. Returns false
    /// when the change was already ready.
    pub fn abort_change(&mut self, change: ChangeId) -> Result<bool, StateError> {
        if self.change_is_ready(change)? {
            return Ok(false);
        }
        let ids = self.change(change)?.task_ids().to_vec();
        for id in ids {
            let t = self.task_mut(id)?;
            if t.status().is_pending_do() {
                t.set_status(Status::Abort);
            }
        }
        let chg = self.change_mut(change)?;
        chg.request_abort();
        chg.mark_undoing();
        info!("change {change} abort requested");
        Ok(true)
    }

    // ---- wait markers ----

    /// Tasks suspended in `Wait` on `marker`.
    pub fn waiting_on(&self, marker: &str) -> Vec<TaskId> {
        self.tasks()
            .filter(|t| t.status() == Status::Wait && t.wait_marker() == Some(marker))
            .map(Task::id)
            .collect()
    }

    /// Move every task waiting on `marker` to its waited status.
    pub fn clear_wait_marker(&mut self, marker: &str) -> Result<usize, StateError> {
        let ids = self.waiting_on(marker);
        for id in &ids {
            let t = self.task_mut(*id)?;
            let next = t.waited_status().unwrap_or(Status::Done);
            t.set_status(next);
            t.logf(format!("Resumed after {marker}"));
        }
        Ok(ids.len())
    }

    // ---- warnings ----

    pub fn warnf(&mut self, msg: impl Into<String>) {
        let message = msg.into();
        let now = Utc::now();
        warn!("{message}");
        if let Some(w) = self
            .inner
            .doc
            .warnings
            .iter_mut()
            .find(|w| w.message == message)
        {
            w.last_added = now;
            w.count = w.count.saturating_add(1);
        } else {
            self.inner.doc.warnings.push(Warning {
                message,
                first_added: now,
                last_added: now,
                count: 1,
            });
        }
        self.touch();
    }

    pub fn all_warnings(&self) -> &[Warning] {
        &self.inner.doc.warnings
    }

    // ---- retention ----

    /// Drop old ready changes, abort stale ones, and remove orphan tasks.
    ///
    /// - ready changes older than `prune_after` and not retained are removed
    ///   together with their tasks;
    /// - changes still not ready after `abort_after` are aborted;
    /// - if more than `max_ready` ready changes remain, the oldest
    ///   non-retained ones are removed;
    /// - tasks never attached to a change and older than `prune_after` are
    ///   removed.
    pub fn prune(
        &mut self,
        now: DateTime<Utc>,
        prune_after: Duration,
        abort_after: Duration,
        max_ready: usize,
    ) -> Result<PruneReport, StateError> {
        let mut report = PruneReport::default();
        let ids: Vec<ChangeId> = self.inner.doc.changes.keys().copied().collect();

        let mut ready: Vec<(DateTime<Utc>, ChangeId)> = Vec::new();
        for id in ids {
            self.refresh_change_status(id)?;
            let chg = self.change(id)?;
            if chg.is_ready() {
                let at = chg.ready_time().unwrap_or_else(|| chg.spawn_time());
                if !chg.is_retained() && now - at > prune_after {
                    report.removed_tasks += self.remove_change(id);
                    report.removed_changes.push(id);
                } else {
                    ready.push((at, id));
                }
            } else if now - chg.spawn_time() > abort_after && self.abort_change(id)? {
                warn!("change {id} has not finished after {abort_after}, aborting");
                report.aborted_changes.push(id);
            }
        }

        if ready.len() > max_ready {
            ready.sort();
            let mut excess = ready.len() - max_ready;
            for (_, id) in ready {
                if excess == 0 {
                    break;
                }
                if self.change(id)?.is_retained() {
                    continue;
                }
                report.removed_tasks += self.remove_change(id);
                report.removed_changes.push(id);
                excess -= 1;
            }
        }

        let orphans: Vec<TaskId> = self
            .tasks()
            .filter(|t| t.change().is_none() && now - t.spawn_time() > prune_after)
            .map(Task::id)
            .collect();
        for id in &orphans {
            self.remove_task(*id);
        }

        report.removed_tasks += orphans.len();
        if !report.is_empty() {
            debug!(
                "prune: removed {} changes, aborted {}, removed {} tasks",
                report.removed_changes.len(),
                report.aborted_changes.len(),
                report.removed_tasks
            );
        }
        Ok(report)
    }

    fn remove_change(&mut self, id: ChangeId) -> usize {
        let Some(chg) = self.inner.doc.changes.remove(&id) else {
            return 0;
        };
        for t in chg.task_ids() {
            self.remove_task(*t);
        }
        self.touch();
        chg.task_ids().len()
    }

    fn remove_task(&mut self, id: TaskId) {
        if self.inner.doc.tasks.remove(&id).is_none() {
            return;
        }
        for t in self.inner.doc.tasks.values_mut() {
            t.forget_edge(id);
        }
        self.touch();
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        if self.attempted || !self.inner.dirty {
            return;
        }
        if let Err(e) = self.checkpoint() {
            error!("state checkpoint on unlock failed, changes are not durable: {e}");
        }
    }
}
