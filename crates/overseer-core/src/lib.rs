//! Orchestration engine for overseer changes.
//!
//! This crate drives the tasks stored in an `overseer_state::State` to
//! completion: the `Runner` dispatches do/undo handlers from a
//! `HandlerRegistry` in dependency order and unwinds failed changes, the
//! `ConflictPolicy` keeps concurrent changes off the same package, and the
//! `RestartManager` carries restart requests to an external supervisor. The
//! `snapstate`, `hookstate` and `ifacestate` modules provide the package
//! handler families, and `Engine` assembles everything from an
//! `EngineConfig`.

pub mod concurrency;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod handlers;
pub mod hookstate;
pub mod ifacestate;
pub mod lifecycle;
pub mod restart;
pub mod runner;
pub mod snapstate;

pub use concurrency::{install_signal_handler, shutdown_requested, SnapLock, StoreLock};
pub use config::EngineConfig;
pub use conflict::{ChangeConflict, ConflictPolicy};
pub use engine::Engine;
pub use handlers::{HandlerError, HandlerOptions, HandlerRegistry, HandlerResult, TaskContext};
pub use lifecycle::validate_transition;
pub use restart::{RestartKind, RestartManager};
pub use runner::{Direction, EnsurePass, Runner};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("state error: {0}")]
    State(#[from] overseer_state::StateError),
    #[error("runtime error: {0}")]
    Runtime(#[from] overseer_runtime::RuntimeError),
    #[error(transparent)]
    Conflict(#[from] ChangeConflict),
    #[error("invalid task status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("snap \"{0}\" is not installed")]
    SnapNotInstalled(String),
    #[error("snap \"{snap}\" revision {revision} is already installed")]
    AlreadyInstalled { snap: String, revision: String },
    #[error("already connected: \"{0}\"")]
    AlreadyConnected(String),
    #[error("not connected: \"{0}\"")]
    NotConnected(String),
    #[error("invalid reference \"{0}\", expected <snap>:<name>")]
    InvalidRef(String),
    #[error("changes did not settle within {0:?}")]
    SettleTimeout(std::time::Duration),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
