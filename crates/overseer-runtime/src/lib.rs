//! System backends for overseer task handlers.
//!
//! Handlers never touch the system directly: they go through a
//! `SnapBackend`, which makes a package revision current, drops the current
//! pointer, terminates running apps, and runs package hooks. `FsBackend`
//! performs these operations under a state root; `MockBackend` records
//! them and can be told to fail, for tests.

pub mod backend;
pub mod fs;
pub mod mock;

pub use backend::{select_backend, SnapBackend};
pub use fs::FsBackend;
pub use mock::{FakeOp, MockBackend};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend '{0}' is not available")]
    BackendUnavailable(String),
    #[error("revision {revision} of snap \"{snap}\" is not mounted")]
    NotMounted { snap: String, revision: String },
    #[error("snap \"{snap}\" has no \"{hook}\" hook")]
    HookNotFound { snap: String, hook: String },
    #[error("run hook \"{hook}\" of snap \"{snap}\": {message}")]
    HookFailed {
        snap: String,
        hook: String,
        message: String,
    },
    #[error("{0}")]
    Failed(String),
}
