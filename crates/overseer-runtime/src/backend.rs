use crate::RuntimeError;
use overseer_state::StateLayout;
use std::sync::Arc;

/// Operations task handlers perform on the system.
///
/// Every operation must be idempotent: after a crash the runner re-runs a
/// task that was in flight, so linking an already-current revision or
/// killing apps that are already gone must succeed.
pub trait SnapBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Make `revision` the current revision of `snap`.
    fn link_snap(&self, snap: &str, revision: &str) -> Result<(), RuntimeError>;

    /// Drop the current pointer of `snap` if it points at `revision`.
    ///
    /// `first_install_undo` also removes what linking created for a snap
    /// that was not installed before, leaving no trace of it.
    fn unlink_snap(
        &self,
        snap: &str,
        revision: &str,
        first_install_undo: bool,
    ) -> Result<(), RuntimeError>;

    /// Revision the current pointer of `snap` designates, if any.
    fn current(&self, snap: &str) -> Result<Option<String>, RuntimeError>;

    /// Ask every running process of `snap` to terminate.
    fn kill_snap_apps(&self, snap: &str) -> Result<(), RuntimeError>;

    fn has_hook(&self, snap: &str, revision: &str, hook: &str) -> bool;

    /// Run a hook to completion, returning its combined output.
    fn run_hook(&self, snap: &str, revision: &str, hook: &str) -> Result<String, RuntimeError>;
}

pub fn select_backend(
    name: &str,
    layout: &StateLayout,
) -> Result<Arc<dyn SnapBackend>, RuntimeError> {
    match name {
        "fs" => Ok(Arc::new(crate::fs::FsBackend::new(layout.clone()))),
        "mock" => Ok(Arc::new(crate::mock::MockBackend::new())),
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}
