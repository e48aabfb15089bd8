use crate::CoreError;
use overseer_state::Status;

/// Check a task status transition applied by the runner.
///
/// Besides the forward path and the undo path this admits the reversions
/// used for retries and for recovering tasks whose worker vanished
/// (`Doing -> Do`, `Undoing -> Undo`), and the resumption of `Wait` tasks.
pub fn validate_transition(from: Status, to: Status) -> Result<(), CoreError> {
    use Status::{Abort, Default, Do, Doing, Done, Error, Undo, Undoing, Undone, Wait};

    let valid = from == to
        || matches!(
            (from, to),
            (Default, Do | Doing | Abort)
                | (Do, Doing | Abort)
                | (Doing, Done | Error | Do | Wait)
                | (Done | Wait, Undo | Undone)
                | (Wait, Done)
                | (Undo, Undoing)
                | (Undoing, Undone | Undo | Wait)
        );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
