use crate::layout::StateLayout;
use crate::{fsync_dir, StateError};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use tracing::debug;

/// Durable storage for the serialized state document.
///
/// Implementations must provide load-all / replace-all semantics: a
/// checkpoint either fully replaces the previous bytes or leaves them
/// untouched.
pub trait StateBackend: Send + Sync {
    /// Read the last checkpoint, or `None` when nothing was ever written.
    fn load(&self) -> Result<Option<Vec<u8>>, StateError>;

    /// Atomically replace the stored document.
    fn checkpoint(&self, data: &[u8]) -> Result<(), StateError>;
}

/// State file on disk, replaced through a temp file and `rename()`.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(layout: &StateLayout) -> Self {
        Self {
            path: layout.state_file(),
        }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateBackend for FileBackend {
    fn load(&self) -> Result<Option<Vec<u8>>, StateError> {
        if !self.path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(&self.path)?))
    }

    fn checkpoint(&self, data: &[u8]) -> Result<(), StateError> {
        let dir = self
            .path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        fs::create_dir_all(&dir)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| StateError::Io(e.error))?;
        fsync_dir(&dir)?;
        debug!("state checkpoint: {} bytes to {}", data.len(), self.path.display());
        Ok(())
    }
}

/// In-memory backend for tests and ephemeral engines.
///
/// Keeps the last checkpoint, counts checkpoints and can be told to reject
/// them to exercise persistence failure paths.
#[derive(Default)]
pub struct MemoryBackend {
    data: Mutex<Option<Vec<u8>>>,
    checkpoints: AtomicUsize,
    fail: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from previously captured bytes, as if reloading after a restart.
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(Some(data)),
            ..Self::default()
        }
    }

    pub fn fail_checkpoints(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn checkpoint_count(&self) -> usize {
        self.checkpoints.load(Ordering::SeqCst)
    }

    /// Bytes of the last successful checkpoint.
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.data
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl StateBackend for MemoryBackend {
    fn load(&self) -> Result<Option<Vec<u8>>, StateError> {
        Ok(self.contents())
    }

    fn checkpoint(&self, data: &[u8]) -> Result<(), StateError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StateError::CheckpointRejected(
                "memory backend set to fail".to_owned(),
            ));
        }
        *self
            .data
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(data.to_vec());
        self.checkpoints.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
