use crate::data::DataBag;
use crate::status::Status;
use crate::types::{ChangeId, TaskId};
use crate::StateError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Number of log entries kept per task; older entries are dropped.
pub const MAX_LOG_ENTRIES: usize = 10;

/// A single named unit of work.
///
/// The `kind` selects the handler pair that runs it; parameters live in a
/// [`DataBag`]. Dependency edges are stored on both ends: `wait_tasks` lists
/// predecessors, `halt_tasks` the successors derived from them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Task {
    id: TaskId,
    kind: String,
    summary: String,
    #[serde(default)]
    status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    waited_status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    wait_marker: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    log: Vec<String>,
    #[serde(default, skip_serializing_if = "DataBag::is_empty")]
    data: DataBag,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    wait_tasks: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    halt_tasks: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    change: Option<ChangeId>,
    spawn_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ready_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    at_time: Option<DateTime<Utc>>,
}

impl Task {
    pub(crate) fn new(id: TaskId, kind: &str, summary: &str, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: kind.to_owned(),
            summary: summary.to_owned(),
            status: Status::Default,
            waited_status: None,
            wait_marker: None,
            log: Vec::new(),
            data: DataBag::new(),
            wait_tasks: Vec::new(),
            halt_tasks: Vec::new(),
            change: None,
            spawn_time: now,
            ready_time: None,
            at_time: None,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Move the task to `status`, maintaining the ready timestamp.
    ///
    /// Transition legality is enforced by the runner, not here.
    pub fn set_status(&mut self, status: Status) {
        self.status = status;
        if status.is_ready() {
            self.ready_time = Some(Utc::now());
        } else {
            self.ready_time = None;
        }
        if status != Status::Wait {
            self.wait_marker = None;
            self.waited_status = None;
        }
    }

    /// Suspend the task until `marker` is cleared; it then becomes `waited`.
    pub fn set_to_wait(&mut self, marker: &str, waited: Status) {
        self.status = Status::Wait;
        self.ready_time = None;
        self.wait_marker = Some(marker.to_owned());
        self.waited_status = Some(waited);
    }

    pub fn wait_marker(&self) -> Option<&str> {
        self.wait_marker.as_deref()
    }

    pub fn waited_status(&self) -> Option<Status> {
        self.waited_status
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StateError> {
        self.data.get(key)
    }

    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), StateError> {
        self.data.set(key, value)
    }

    pub fn has(&self, key: &str) -> bool {
        self.data.contains(key)
    }

    pub fn clear(&mut self, key: &str) -> bool {
        self.data.remove(key)
    }

    pub fn data(&self) -> &DataBag {
        &self.data
    }

    pub fn log(&self) -> &[String] {
        &self.log
    }

    pub fn logf(&mut self, msg: impl AsRef<str>) {
        self.add_log("INFO", msg.as_ref());
    }

    pub fn errorf(&mut self, msg: impl AsRef<str>) {
        self.add_log("ERROR", msg.as_ref());
    }

    pub fn warnf(&mut self, msg: impl AsRef<str>) {
        self.add_log("WARNING", msg.as_ref());
    }

    fn add_log(&mut self, level: &str, msg: &str) {
        if self.log.len() >= MAX_LOG_ENTRIES {
            let excess = self.log.len() + 1 - MAX_LOG_ENTRIES;
            self.log.drain(..excess);
        }
        self.log
            .push(format!("{} {level} {msg}", Utc::now().to_rfc3339()));
    }

    /// Message of the most recent ERROR log entry.
    pub fn last_error(&self) -> Option<&str> {
        self.log.iter().rev().find_map(|line| {
            line.split_once(" ERROR ").map(|(_, msg)| msg)
        })
    }

    pub fn wait_tasks(&self) -> &[TaskId] {
        &self.wait_tasks
    }

    pub fn halt_tasks(&self) -> &[TaskId] {
        &self.halt_tasks
    }

    pub(crate) fn add_wait_task(&mut self, id: TaskId) {
        if !self.wait_tasks.contains(&id) {
            self.wait_tasks.push(id);
        }
    }

    pub(crate) fn add_halt_task(&mut self, id: TaskId) {
        if !self.halt_tasks.contains(&id) {
            self.halt_tasks.push(id);
        }
    }

    pub(crate) fn forget_edge(&mut self, id: TaskId) {
        self.wait_tasks.retain(|t| *t != id);
        self.halt_tasks.retain(|t| *t != id);
    }

    pub fn change(&self) -> Option<ChangeId> {
        self.change
    }

    pub(crate) fn set_change(&mut self, change: ChangeId) {
        self.change = Some(change);
    }

    pub fn spawn_time(&self) -> DateTime<Utc> {
        self.spawn_time
    }

    pub fn ready_time(&self) -> Option<DateTime<Utc>> {
        self.ready_time
    }

    /// Earliest time a retried task may run again.
    pub fn at_time(&self) -> Option<DateTime<Utc>> {
        self.at_time
    }

    pub fn set_at_time(&mut self, at: Option<DateTime<Utc>>) {
        self.at_time = at;
    }
}
