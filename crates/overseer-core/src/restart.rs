use overseer_state::{State, StateError, StateGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::info;

/// Document key holding the pending restart requests.
pub const RESTART_PENDING_KEY: &str = "restart-pending";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartKind {
    /// Restart of the managing daemon itself.
    Daemon,
    /// Reboot of the whole system.
    System,
}

impl RestartKind {
    /// Wait marker of tasks suspended until this restart happened.
    pub fn marker(self) -> String {
        format!("restart:{self}")
    }
}

impl fmt::Display for RestartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartKind::Daemon => write!(f, "daemon"),
            RestartKind::System => write!(f, "system"),
        }
    }
}

impl FromStr for RestartKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daemon" => Ok(RestartKind::Daemon),
            "system" => Ok(RestartKind::System),
            other => Err(format!("unknown restart kind '{other}'")),
        }
    }
}

/// Side-channel between handlers and the external restart supervisor.
///
/// Requests are persisted in the document, so a supervisor started after a
/// crash still sees them. At most one request per kind is pending.
#[derive(Clone)]
pub struct RestartManager {
    state: State,
}

impl RestartManager {
    pub fn new(state: State) -> Self {
        Self { state }
    }

    pub fn request(&self, kind: RestartKind) -> Result<(), StateError> {
        let mut g = self.state.lock();
        Self::request_in(&mut g, kind)?;
        g.unlock()
    }

    /// Record a request while the caller already holds the state lock.
    pub fn request_in(g: &mut StateGuard<'_>, kind: RestartKind) -> Result<(), StateError> {
        let mut pending = Self::pending_in(g)?;
        if !pending.contains(&kind) {
            pending.push(kind);
            g.set(RESTART_PENDING_KEY, &pending)?;
            info!("Requested {kind} restart");
        }
        Ok(())
    }

    pub fn pending(&self) -> Result<Vec<RestartKind>, StateError> {
        Self::pending_in(&self.state.lock())
    }

    fn pending_in(g: &StateGuard<'_>) -> Result<Vec<RestartKind>, StateError> {
        match g.get(RESTART_PENDING_KEY) {
            Ok(p) => Ok(p),
            Err(e) if e.is_no_state() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Called once the supervisor performed a restart of `kind`.
    ///
    /// Clears the pending request and resumes every task waiting on it.
    /// Returns how many tasks were resumed.
    pub fn restart_completed(&self, kind: RestartKind) -> Result<usize, StateError> {
        let mut g = self.state.lock();
        let mut pending = Self::pending_in(&g)?;
        pending.retain(|k| *k != kind);
        if pending.is_empty() {
            g.remove(RESTART_PENDING_KEY);
        } else {
            g.set(RESTART_PENDING_KEY, &pending)?;
        }
        let resumed = g.clear_wait_marker(&kind.marker())?;
        g.unlock()?;
        info!("{kind} restart completed, resumed {resumed} tasks");
        Ok(resumed)
    }
}
