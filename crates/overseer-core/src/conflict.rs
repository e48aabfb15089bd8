use overseer_state::{ChangeId, StateError, StateGuard, Task};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// A new change was refused because an unfinished change claims the snap.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("snap \"{snap}\" has \"{change_kind}\" change in progress")]
pub struct ChangeConflict {
    pub snap: String,
    pub change_kind: String,
    pub change_id: ChangeId,
}

/// Reports the snap names a task affects.
pub type AffectedFn = Arc<dyn Fn(&Task) -> Result<Vec<String>, StateError> + Send + Sync>;

#[derive(Deserialize)]
struct NamedSnap {
    name: String,
}

#[derive(Deserialize)]
struct HookedSnap {
    snap: String,
}

#[derive(Deserialize)]
struct Side {
    snap: String,
}

/// Which snaps the tasks of in-flight changes hold.
///
/// Tasks carrying `snap-setup` or `hook-setup` claim their snap by default;
/// other kinds register an extractor with [`ConflictPolicy::add_affected`].
#[derive(Clone, Default)]
pub struct ConflictPolicy {
    extractors: HashMap<String, AffectedFn>,
}

impl ConflictPolicy {
    /// Policy with extractors for the connection task kinds.
    pub fn with_defaults() -> Self {
        let mut policy = Self::default();
        let plug_and_slot: AffectedFn =
            Arc::new(|task: &Task| -> Result<Vec<String>, StateError> {
                let mut names = Vec::new();
                for key in ["plug", "slot"] {
                    if task.has(key) {
                        names.push(task.get::<Side>(key)?.snap);
                    }
                }
                Ok(names)
            });
        policy.add_affected("connect", plug_and_slot.clone());
        policy.add_affected("disconnect", plug_and_slot);
        policy
    }

    pub fn add_affected(&mut self, kind: &str, extractor: AffectedFn) {
        self.extractors.insert(kind.to_owned(), extractor);
    }

    /// Snap names `task` affects, deduplicated.
    pub fn affected(&self, task: &Task) -> Result<Vec<String>, StateError> {
        let mut names = Vec::new();
        if task.has("snap-setup") {
            names.push(task.get::<NamedSnap>("snap-setup")?.name);
        }
        if task.has("hook-setup") {
            names.push(task.get::<HookedSnap>("hook-setup")?.snap);
        }
        if let Some(extract) = self.extractors.get(task.kind()) {
            names.extend(extract(task)?);
        }
        names.sort_unstable();
        names.dedup();
        Ok(names)
    }

    /// Refuse a new change touching `names` while another change that is not
    /// ready holds one of them. `ignore` skips a change, typically the one
    /// being extended.
    pub fn check_change_conflict(
        &self,
        g: &StateGuard<'_>,
        names: &[&str],
        ignore: Option<ChangeId>,
    ) -> Result<(), ChangeConflict> {
        for chg in g.changes() {
            if Some(chg.id()) == ignore {
                continue;
            }
            // Done tasks of a failing change still have an undo ahead, so a
            // change holds all of its snaps until it is ready as a whole.
            if g.change_is_ready(chg.id()).unwrap_or_else(|_| chg.is_ready()) {
                continue;
            }
            for tid in chg.task_ids() {
                let Ok(task) = g.task(*tid) else { continue };
                // A task whose data cannot be read claims nothing.
                let affected = self.affected(task).unwrap_or_default();
                if let Some(snap) = affected.iter().find(|a| names.contains(&a.as_str())) {
                    return Err(ChangeConflict {
                        snap: snap.clone(),
                        change_kind: chg.kind().to_owned(),
                        change_id: chg.id(),
                    });
                }
            }
        }
        Ok(())
    }
}
