use serde::{Deserialize, Serialize};

/// Lifecycle status of a task, and the aggregate status of a change.
///
/// `Default → Do → Doing → {Done | Error | Undo}`; after a failure, done
/// tasks go `Done → Undo → Undoing → Undone`. `Abort` marks a task skipped
/// because its change failed or was aborted before it started. `Wait`
/// suspends a task that finished its work but awaits an external event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Status {
    #[default]
    Default,
    Do,
    Doing,
    Done,
    Abort,
    Undo,
    Undoing,
    Undone,
    Error,
    Wait,
}

impl Status {
    /// Terminal statuses: nothing more will happen to the task.
    pub fn is_ready(self) -> bool {
        matches!(
            self,
            Status::Done | Status::Undone | Status::Error | Status::Abort
        )
    }

    /// A handler is (or was, before a restart) executing.
    pub fn is_running(self) -> bool {
        matches!(self, Status::Doing | Status::Undoing)
    }

    /// Not started yet and still eligible to run forward.
    pub fn is_pending_do(self) -> bool {
        matches!(self, Status::Default | Status::Do)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Default => "Default",
            Status::Do => "Do",
            Status::Doing => "Doing",
            Status::Done => "Done",
            Status::Abort => "Abort",
            Status::Undo => "Undo",
            Status::Undoing => "Undoing",
            Status::Undone => "Undone",
            Status::Error => "Error",
            Status::Wait => "Wait",
        };
        f.write_str(s)
    }
}
