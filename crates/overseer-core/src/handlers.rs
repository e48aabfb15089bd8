use crate::restart::{RestartKind, RestartManager};
use crate::CoreError;
use overseer_runtime::RuntimeError;
use overseer_state::{ChangeId, State, StateError, TaskId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Outcome of a failed handler run.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Transient: the task stays pending and is retried on a later pass.
    #[error("{reason}")]
    Retry {
        after: Option<Duration>,
        reason: String,
    },
    /// The task fails and its change is undone.
    #[error("{0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn retry(reason: impl Into<String>) -> Self {
        HandlerError::Retry {
            after: None,
            reason: reason.into(),
        }
    }

    pub fn retry_after(after: Duration, reason: impl Into<String>) -> Self {
        HandlerError::Retry {
            after: Some(after),
            reason: reason.into(),
        }
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        HandlerError::Fatal(msg.into())
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, HandlerError::Retry { .. })
    }
}

impl From<StateError> for HandlerError {
    fn from(e: StateError) -> Self {
        HandlerError::Fatal(e.to_string())
    }
}

impl From<RuntimeError> for HandlerError {
    fn from(e: RuntimeError) -> Self {
        HandlerError::Fatal(e.to_string())
    }
}

impl From<CoreError> for HandlerError {
    fn from(e: CoreError) -> Self {
        HandlerError::Fatal(e.to_string())
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// A do or undo function for one task kind.
pub type Handler = Arc<dyn Fn(&TaskContext) -> HandlerResult + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerOptions {
    /// A `Retry` from the handler is honored; otherwise it fails the task.
    pub retryable: bool,
    /// No other task runs while a task of this kind runs.
    pub exclusive: bool,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            retryable: true,
            exclusive: false,
        }
    }
}

#[derive(Clone)]
pub struct Registration {
    do_handler: Handler,
    undo_handler: Option<Handler>,
    options: HandlerOptions,
}

impl Registration {
    pub fn do_handler(&self) -> &Handler {
        &self.do_handler
    }

    pub fn undo_handler(&self) -> Option<&Handler> {
        self.undo_handler.as_ref()
    }

    pub fn options(&self) -> HandlerOptions {
        self.options
    }
}

/// Task kind to handler pair mapping, filled during engine assembly.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    kinds: HashMap<String, Registration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a do/undo pair; a later registration of the same kind wins.
    pub fn register<D, U>(&mut self, kind: &str, do_fn: D, undo_fn: U)
    where
        D: Fn(&TaskContext) -> HandlerResult + Send + Sync + 'static,
        U: Fn(&TaskContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.register_with(
            kind,
            Arc::new(do_fn),
            Some(Arc::new(undo_fn)),
            HandlerOptions::default(),
        );
    }

    /// Register a kind that has nothing to undo.
    pub fn register_do<D>(&mut self, kind: &str, do_fn: D)
    where
        D: Fn(&TaskContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.register_with(kind, Arc::new(do_fn), None, HandlerOptions::default());
    }

    pub fn register_with(
        &mut self,
        kind: &str,
        do_handler: Handler,
        undo_handler: Option<Handler>,
        options: HandlerOptions,
    ) {
        self.kinds.insert(
            kind.to_owned(),
            Registration {
                do_handler,
                undo_handler,
                options,
            },
        );
    }

    /// Adjust the options of an already registered kind.
    pub fn set_options(&mut self, kind: &str, options: HandlerOptions) -> bool {
        match self.kinds.get_mut(kind) {
            Some(r) => {
                r.options = options;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, kind: &str) -> Option<&Registration> {
        self.kinds.get(kind)
    }

    pub fn has_undo(&self, kind: &str) -> bool {
        self.get(kind).is_some_and(|r| r.undo_handler.is_some())
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.kinds.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

/// What a handler sees of the task it runs.
///
/// Each accessor takes the state lock for its own duration; handlers must
/// never hold a guard across backend calls.
pub struct TaskContext {
    state: State,
    task: TaskId,
    change: Option<ChangeId>,
    kind: String,
    undo: bool,
    restart: RestartManager,
    wait_marker: Mutex<Option<String>>,
}

impl TaskContext {
    pub(crate) fn new(
        state: State,
        task: TaskId,
        change: Option<ChangeId>,
        kind: &str,
        undo: bool,
        restart: RestartManager,
    ) -> Self {
        Self {
            state,
            task,
            change,
            kind: kind.to_owned(),
            undo,
            restart,
            wait_marker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn task_id(&self) -> TaskId {
        self.task
    }

    pub fn change_id(&self) -> Option<ChangeId> {
        self.change
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// True when running the undo handler.
    pub fn is_undo(&self) -> bool {
        self.undo
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, HandlerError> {
        let g = self.state.lock();
        Ok(g.task(self.task)?.get(key)?)
    }

    pub fn has(&self, key: &str) -> bool {
        self.state
            .lock()
            .task(self.task)
            .is_ok_and(|t| t.has(key))
    }

    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> HandlerResult {
        let mut g = self.state.lock();
        g.task_mut(self.task)?.set(key, value)?;
        g.unlock()?;
        Ok(())
    }

    pub fn logf(&self, msg: impl AsRef<str>) {
        let mut g = self.state.lock();
        if let Ok(t) = g.task_mut(self.task) {
            t.logf(msg);
        }
    }

    /// Ask the supervisor for a restart; the task itself completes normally.
    pub fn request_restart(&self, kind: RestartKind) -> HandlerResult {
        self.restart.request(kind)?;
        self.logf(format!("Requested {kind} restart"));
        Ok(())
    }

    /// Ask for a restart and suspend the task in `Wait` until it happened.
    pub fn wait_for_restart(&self, kind: RestartKind) -> HandlerResult {
        self.request_restart(kind)?;
        *self
            .wait_marker
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(kind.marker());
        Ok(())
    }

    pub(crate) fn take_wait_marker(&self) -> Option<String> {
        self.wait_marker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
