use crate::data::DataBag;
use crate::status::Status;
use crate::task::Task;
use crate::types::{ChangeId, TaskId};
use crate::StateError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A user-visible operation made of tasks.
///
/// The change only records task ids; the tasks themselves live in the
/// owning document. Its status is derived from them (see
/// [`aggregate_status`]) and cached together with readiness whenever the
/// store refreshes it, so readers of the persisted document see a
/// meaningful value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Change {
    id: ChangeId,
    kind: String,
    summary: String,
    #[serde(default)]
    status: Status,
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    task_ids: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "DataBag::is_empty")]
    data: DataBag,
    #[serde(default)]
    abort_requested: bool,
    #[serde(default)]
    undoing: bool,
    #[serde(default)]
    clients: u32,
    spawn_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ready_time: Option<DateTime<Utc>>,
}

impl Change {
    pub(crate) fn new(id: ChangeId, kind: &str, summary: &str, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: kind.to_owned(),
            summary: summary.to_owned(),
            status: Status::Default,
            ready: false,
            task_ids: Vec::new(),
            data: DataBag::new(),
            abort_requested: false,
            undoing: false,
            clients: 0,
            spawn_time: now,
            ready_time: None,
        }
    }

    pub fn id(&self) -> ChangeId {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// Aggregate status as of the last settled runner pass.
    pub fn cached_status(&self) -> Status {
        self.status
    }

    pub(crate) fn set_cached_status(&mut self, status: Status, ready: bool) {
        self.status = status;
        self.ready = ready;
        if ready {
            if self.ready_time.is_none() {
                self.ready_time = Some(Utc::now());
            }
        } else {
            self.ready_time = None;
        }
    }

    /// Nothing more will happen to the change, as of the last refresh.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn task_ids(&self) -> &[TaskId] {
        &self.task_ids
    }

    pub(crate) fn push_task(&mut self, id: TaskId) {
        if !self.task_ids.contains(&id) {
            self.task_ids.push(id);
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StateError> {
        self.data.get(key)
    }

    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), StateError> {
        self.data.set(key, value)
    }

    /// Cooperative cancellation was requested; no new task may start.
    pub fn abort_requested(&self) -> bool {
        self.abort_requested
    }

    pub(crate) fn request_abort(&mut self) {
        self.abort_requested = true;
    }

    /// The change failed (or was aborted) and is unwinding its done tasks.
    pub fn is_undoing(&self) -> bool {
        self.undoing
    }

    pub fn mark_undoing(&mut self) {
        self.undoing = true;
    }

    /// Hold the change against pruning while a client still inspects it.
    pub fn retain(&mut self) {
        self.clients = self.clients.saturating_add(1);
    }

    pub fn release(&mut self) {
        self.clients = self.clients.saturating_sub(1);
    }

    pub fn is_retained(&self) -> bool {
        self.clients > 0
    }

    pub fn spawn_time(&self) -> DateTime<Utc> {
        self.spawn_time
    }

    pub fn ready_time(&self) -> Option<DateTime<Utc>> {
        self.ready_time
    }
}

/// Aggregate task statuses into a change status.
///
/// Precedence: any `Error` wins, then any `Undone`, then the first
/// non-terminal status found in the order Undoing, Undo, Doing, Do, Wait,
/// Default. A change whose tasks were all aborted applied nothing and is
/// reported `Undone`. Otherwise (including an empty change) it is `Done`.
pub fn aggregate_status<I>(statuses: I) -> Status
where
    I: IntoIterator<Item = Status>,
{
    const PENDING_ORDER: [Status; 6] = [
        Status::Undoing,
        Status::Undo,
        Status::Doing,
        Status::Do,
        Status::Wait,
        Status::Default,
    ];

    let mut seen = [false; 10];
    let mut any = false;
    for s in statuses {
        seen[slot(s)] = true;
        any = true;
    }
    if !any {
        return Status::Done;
    }
    if seen[slot(Status::Error)] {
        return Status::Error;
    }
    if seen[slot(Status::Undone)] {
        return Status::Undone;
    }
    if let Some(pending) = PENDING_ORDER.iter().find(|s| seen[slot(**s)]) {
        return *pending;
    }
    if seen[slot(Status::Abort)] && !seen[slot(Status::Done)] {
        return Status::Undone;
    }
    Status::Done
}

fn slot(s: Status) -> usize {
    match s {
        Status::Default => 0,
        Status::Do => 1,
        Status::Doing => 2,
        Status::Done => 3,
        Status::Abort => 4,
        Status::Undo => 5,
        Status::Undoing => 6,
        Status::Undone => 7,
        Status::Error => 8,
        Status::Wait => 9,
    }
}

/// Render the client-facing error of a change from its failed tasks.
///
/// Returns `None` when no task is in `Error`.
pub fn render_err<'a, I>(tasks: I) -> Option<String>
where
    I: IntoIterator<Item = &'a Task>,
{
    let lines: Vec<String> = tasks
        .into_iter()
        .filter(|t| t.status() == Status::Error)
        .map(|t| {
            let msg = t.last_error().unwrap_or("unknown error");
            format!("- {} ({msg})", t.summary())
        })
        .collect();
    if lines.is_empty() {
        return None;
    }
    Some(format!(
        "cannot perform the following tasks:\n{}",
        lines.join("\n")
    ))
}
