use crate::backend::SnapBackend;
use crate::RuntimeError;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One call observed by [`MockBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeOp {
    Link {
        snap: String,
        revision: String,
    },
    Unlink {
        snap: String,
        revision: String,
        first_install_undo: bool,
    },
    KillApps {
        snap: String,
    },
    RunHook {
        snap: String,
        revision: String,
        hook: String,
    },
}

#[derive(Default)]
struct MockState {
    ops: Vec<FakeOp>,
    current: HashMap<String, String>,
    hooks: HashSet<(String, String)>,
    failures: HashMap<String, String>,
}

/// In-memory backend that records every operation.
///
/// Failures are injected per operation key: `link:<snap>`,
/// `unlink:<snap>`, `kill:<snap>` or `hook:<snap>:<hook>`. Hooks exist only
/// once added with [`MockBackend::add_hook`].
#[derive(Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_hook(&self, snap: &str, hook: &str) {
        self.lock().hooks.insert((snap.to_owned(), hook.to_owned()));
    }

    /// Make the operation identified by `key` fail with `message`.
    pub fn fail_on(&self, key: &str, message: &str) {
        self.lock()
            .failures
            .insert(key.to_owned(), message.to_owned());
    }

    pub fn clear_failure(&self, key: &str) {
        self.lock().failures.remove(key);
    }

    pub fn ops(&self) -> Vec<FakeOp> {
        self.lock().ops.clone()
    }

    /// Hooks run so far, as `<snap>:<hook>`.
    pub fn hooks_run(&self) -> Vec<String> {
        self.lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                FakeOp::RunHook { snap, hook, .. } => Some(format!("{snap}:{hook}")),
                _ => None,
            })
            .collect()
    }

    fn check(state: &MockState, key: &str) -> Result<(), RuntimeError> {
        match state.failures.get(key) {
            Some(msg) => Err(RuntimeError::Failed(msg.clone())),
            None => Ok(()),
        }
    }
}

impl SnapBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn link_snap(&self, snap: &str, revision: &str) -> Result<(), RuntimeError> {
        let mut st = self.lock();
        st.ops.push(FakeOp::Link {
            snap: snap.to_owned(),
            revision: revision.to_owned(),
        });
        Self::check(&st, &format!("link:{snap}"))?;
        st.current.insert(snap.to_owned(), revision.to_owned());
        Ok(())
    }

    fn unlink_snap(
        &self,
        snap: &str,
        revision: &str,
        first_install_undo: bool,
    ) -> Result<(), RuntimeError> {
        let mut st = self.lock();
        st.ops.push(FakeOp::Unlink {
            snap: snap.to_owned(),
            revision: revision.to_owned(),
            first_install_undo,
        });
        Self::check(&st, &format!("unlink:{snap}"))?;
        if st.current.get(snap).map(String::as_str) == Some(revision) {
            st.current.remove(snap);
        }
        Ok(())
    }

    fn current(&self, snap: &str) -> Result<Option<String>, RuntimeError> {
        Ok(self.lock().current.get(snap).cloned())
    }

    fn kill_snap_apps(&self, snap: &str) -> Result<(), RuntimeError> {
        let mut st = self.lock();
        st.ops.push(FakeOp::KillApps {
            snap: snap.to_owned(),
        });
        Self::check(&st, &format!("kill:{snap}"))
    }

    fn has_hook(&self, snap: &str, _revision: &str, hook: &str) -> bool {
        self.lock()
            .hooks
            .contains(&(snap.to_owned(), hook.to_owned()))
    }

    fn run_hook(&self, snap: &str, revision: &str, hook: &str) -> Result<String, RuntimeError> {
        let mut st = self.lock();
        if !st.hooks.contains(&(snap.to_owned(), hook.to_owned())) {
            return Err(RuntimeError::HookNotFound {
                snap: snap.to_owned(),
                hook: hook.to_owned(),
            });
        }
        st.ops.push(FakeOp::RunHook {
            snap: snap.to_owned(),
            revision: revision.to_owned(),
            hook: hook.to_owned(),
        });
        if let Some(msg) = st.failures.get(&format!("hook:{snap}:{hook}")) {
            return Err(RuntimeError::HookFailed {
                snap: snap.to_owned(),
                hook: hook.to_owned(),
                message: msg.clone(),
            });
        }
        Ok(format!("mock-hook: {snap}:{hook}\n"))
    }
}
