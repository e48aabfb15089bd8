use crate::CoreError;
use fs2::FileExt;
use overseer_state::StateLayout;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// An exclusively locked file, unlocked on drop.
struct HeldLock {
    file: File,
    path: PathBuf,
}

impl HeldLock {
    fn open(path: &Path) -> Result<File, CoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?)
    }

    fn blocking(path: &Path) -> Result<Self, CoreError> {
        let file = Self::open(path)?;
        file.lock_exclusive()
            .map_err(|e| io::Error::new(io::ErrorKind::WouldBlock, e))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    fn non_blocking(path: &Path) -> Result<Option<Self>, CoreError> {
        let file = Self::open(path)?;
        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }
        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
        }))
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            debug!("unlocking {} failed: {e}", self.path.display());
        }
    }
}

/// Exclusive lock on a whole state root: one mutating process at a time.
pub struct StoreLock {
    _held: HeldLock,
}

impl StoreLock {
    /// Wait until no other process holds `lock_path`.
    pub fn acquire(lock_path: &Path) -> Result<Self, CoreError> {
        Ok(Self {
            _held: HeldLock::blocking(lock_path)?,
        })
    }

    /// `None` when another process holds the root.
    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>, CoreError> {
        Ok(HeldLock::non_blocking(lock_path)?.map(|held| Self { _held: held }))
    }
}

/// Lock serializing work on the running processes of one snap, kept under
/// `<root>/locks/<name>.lock`.
pub struct SnapLock {
    _held: HeldLock,
    name: String,
}

impl SnapLock {
    pub fn acquire(layout: &StateLayout, name: &str) -> Result<Self, CoreError> {
        let held = HeldLock::blocking(&layout.snap_lock(name))?;
        debug!("acquired snap lock for {name}");
        Ok(Self {
            _held: held,
            name: name.to_owned(),
        })
    }

    pub fn try_acquire(layout: &StateLayout, name: &str) -> Result<Option<Self>, CoreError> {
        Ok(
            HeldLock::non_blocking(&layout.snap_lock(name))?.map(|held| Self {
                _held: held,
                name: name.to_owned(),
            }),
        )
    }
}

impl Drop for SnapLock {
    fn drop(&mut self) {
        debug!("released snap lock for {}", self.name);
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// First Ctrl-C asks the run loop to stop after in-flight tasks; a second
/// one exits at once.
pub fn install_signal_handler() {
    let installed = ctrlc::set_handler(|| {
        if SHUTDOWN_REQUESTED.swap(true, Ordering::SeqCst) {
            std::process::exit(1);
        }
        eprintln!("\nshutdown requested, waiting for running tasks...");
    });
    if let Err(e) = installed {
        debug!("signal handler not installed: {e}");
    }
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}
