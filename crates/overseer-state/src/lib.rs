//! Persistent, lock-protected document store for overseer.
//!
//! This crate provides the durable data model of the orchestration engine:
//! a `State` holding an arbitrary tree of named entries plus every `Change`
//! and `Task`, a `StateBackend` abstraction with an atomic file backend,
//! the `TaskSet` builder used to wire tasks before they join a change, and
//! the `StateLayout` describing the on-disk directory structure.

pub mod backend;
pub mod change;
pub mod data;
pub mod layout;
pub mod state;
pub mod status;
pub mod task;
pub mod taskset;
pub mod types;

pub use backend::{FileBackend, MemoryBackend, StateBackend};
pub use change::Change;
pub use data::DataBag;
pub use layout::{
    validate_connection_name, validate_hook_name, validate_revision, validate_snap_name,
    StateLayout,
};
pub use state::{PruneReport, State, StateGuard, Warning, STATE_FORMAT_VERSION};
pub use status::Status;
pub use task::{Task, MAX_LOG_ENTRIES};
pub use taskset::TaskSet;
pub use types::{ChangeId, TaskId};

use std::path::Path;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` into it is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("no state entry for key '{0}'")]
    NoState(String),
    #[error("state entry '{key}' has an unexpected type: {source}")]
    WrongType {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("task {0} not found")]
    TaskNotFound(TaskId),
    #[error("change {0} not found")]
    ChangeNotFound(ChangeId),
    #[error("task {task} already belongs to change {change}")]
    AlreadyAttached { task: TaskId, change: ChangeId },
    #[error("task {task} cannot wait for task {predecessor}: they belong to different changes")]
    CrossChangeDependency { task: TaskId, predecessor: TaskId },
    #[error("task {task} cannot wait for task {predecessor}: dependency cycle")]
    DependencyCycle { task: TaskId, predecessor: TaskId },
    #[error("task set has no edge '{0}'")]
    MissingEdge(String),
    #[error("integrity check failed for state document: expected {expected}, got {actual}")]
    IntegrityFailure { expected: String, actual: String },
    #[error("state format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("state checkpoint disabled: {0}")]
    CheckpointRejected(String),
    #[error("invalid name: {0}")]
    InvalidName(String),
}

impl StateError {
    /// True when the error reports a missing entry rather than a bad one.
    pub fn is_no_state(&self) -> bool {
        matches!(self, StateError::NoState(_))
    }
}
