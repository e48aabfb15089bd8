use crate::StateError;
use std::fs;
use std::path::{Path, PathBuf};

fn check_name(what: &str, name: &str, max: usize, upper: bool) -> Result<(), StateError> {
    if name.is_empty() || name.len() > max {
        return Err(StateError::InvalidName(format!(
            "{what} \"{name}\" must be 1-{max} characters"
        )));
    }
    let allowed = |b: u8| {
        b.is_ascii_lowercase()
            || b.is_ascii_digit()
            || b == b'-'
            || (upper && b.is_ascii_uppercase())
    };
    if !name.bytes().all(allowed) {
        let class = if upper { "[a-zA-Z0-9-]" } else { "[a-z0-9-]" };
        return Err(StateError::InvalidName(format!(
            "{what} \"{name}\" must match {class}"
        )));
    }
    Ok(())
}

/// Snap names become path components under the state root.
pub fn validate_snap_name(name: &str) -> Result<(), StateError> {
    check_name("snap name", name, 40, false)
}

pub fn validate_revision(revision: &str) -> Result<(), StateError> {
    check_name("revision", revision, 32, true)
}

pub fn validate_hook_name(hook: &str) -> Result<(), StateError> {
    check_name("hook name", hook, 64, false)
}

/// Plug and slot names, which also end up in hook names.
pub fn validate_connection_name(name: &str) -> Result<(), StateError> {
    check_name("plug or slot name", name, 40, false)
}

/// Directory layout of an overseer state root.
///
/// Manages paths for the state document, the process lock, per-package
/// locks, the package mount tree and the per-package sequence records. All
/// subdirectories are created lazily on [`initialize`](Self::initialize).
#[derive(Debug, Clone)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn state_file(&self) -> PathBuf {
        self.root.join("state.json")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".lock")
    }

    #[inline]
    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// Lock file guarding the running processes of one package.
    #[inline]
    pub fn snap_lock(&self, name: &str) -> PathBuf {
        self.locks_dir().join(format!("{name}.lock"))
    }

    /// Root of the mounted package revisions (`<mount>/<name>/<revision>`).
    #[inline]
    pub fn mount_dir(&self) -> PathBuf {
        self.root.join("snap")
    }

    #[inline]
    pub fn snap_dir(&self, name: &str) -> PathBuf {
        self.mount_dir().join(name)
    }

    #[inline]
    pub fn revision_dir(&self, name: &str, revision: &str) -> PathBuf {
        self.snap_dir(name).join(revision)
    }

    /// The "current" pointer of a package.
    #[inline]
    pub fn current_link(&self, name: &str) -> PathBuf {
        self.snap_dir(name).join("current")
    }

    #[inline]
    pub fn hooks_dir(&self, name: &str, revision: &str) -> PathBuf {
        self.revision_dir(name, revision).join("meta").join("hooks")
    }

    #[inline]
    pub fn sequence_dir(&self) -> PathBuf {
        self.root.join("seq")
    }

    #[inline]
    pub fn sequence_file(&self, name: &str) -> PathBuf {
        self.sequence_dir().join(format!("{name}.json"))
    }

    /// Directory of per-package pid lists used to find running apps.
    #[inline]
    pub fn run_dir(&self) -> PathBuf {
        self.root.join("run")
    }

    pub fn initialize(&self) -> Result<(), StateError> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.locks_dir())?;
        fs::create_dir_all(self.mount_dir())?;
        fs::create_dir_all(self.sequence_dir())?;
        fs::create_dir_all(self.run_dir())?;
        Ok(())
    }
}
