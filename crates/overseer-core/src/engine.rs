use crate::config::EngineConfig;
use crate::conflict::ConflictPolicy;
use crate::handlers::HandlerRegistry;
use crate::hookstate;
use crate::ifacestate::{self, ConnRef, ConnectOptions, DisconnectOptions};
use crate::restart::{RestartKind, RestartManager};
use crate::runner::{EnsurePass, Runner};
use crate::snapstate::{self, SnapManager, SnapSetup};
use crate::CoreError;
use chrono::Utc;
use overseer_runtime::{select_backend, SnapBackend};
use overseer_state::{ChangeId, FileBackend, State, StateGuard, StateLayout, TaskSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

const RUN_LOOP_STEP: Duration = Duration::from_millis(100);

/// Central orchestration engine for overseer changes.
///
/// Owns the document store, the system backend and the runner, and offers
/// the client operations that turn a request into a change. Every client
/// operation is followed by a scheduling pass.
pub struct Engine {
    config: EngineConfig,
    layout: StateLayout,
    state: State,
    backend: Arc<dyn SnapBackend>,
    runner: Runner,
    restart: RestartManager,
    policy: ConflictPolicy,
}

impl Engine {
    /// Open the state root named by `config`.
    ///
    /// Loads the last checkpoint and puts tasks interrupted by a previous
    /// process back in line. Taking the store lock is left to the caller.
    pub fn new(config: EngineConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let layout = StateLayout::new(&config.root);
        layout.initialize()?;
        let backend = select_backend(&config.backend, &layout)?;
        let state = State::load(Arc::new(FileBackend::new(&layout)))?;
        let registry = Self::default_registry(&layout, &backend);
        Self::assemble(config, state, backend, registry)
    }

    /// Registry with every built-in handler family.
    pub fn default_registry(
        layout: &StateLayout,
        backend: &Arc<dyn SnapBackend>,
    ) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        SnapManager::new(layout.clone(), Arc::clone(backend)).register(&mut registry);
        hookstate::register(&mut registry, backend);
        ifacestate::register(&mut registry);
        registry
    }

    /// Build an engine from explicit parts, e.g. an in-memory state.
    pub fn assemble(
        config: EngineConfig,
        state: State,
        backend: Arc<dyn SnapBackend>,
        registry: HandlerRegistry,
    ) -> Result<Self, CoreError> {
        let layout = StateLayout::new(&config.root);
        let restart = RestartManager::new(state.clone());
        let runner = Runner::new(state.clone(), registry, restart.clone())
            .with_retry_backoff(config.retry_backoff());
        runner.recover()?;
        debug!(
            "engine assembled at {} with {} backend",
            layout.root().display(),
            backend.name()
        );
        Ok(Self {
            config,
            layout,
            state,
            backend,
            runner,
            restart,
            policy: ConflictPolicy::with_defaults(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn backend(&self) -> &Arc<dyn SnapBackend> {
        &self.backend
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    /// For registering blocking predicates before the first pass.
    pub fn runner_mut(&mut self) -> &mut Runner {
        &mut self.runner
    }

    pub fn restart(&self) -> &RestartManager {
        &self.restart
    }

    pub fn policy(&self) -> &ConflictPolicy {
        &self.policy
    }

    pub fn policy_mut(&mut self) -> &mut ConflictPolicy {
        &mut self.policy
    }

    /// One scheduling pass followed by change retention.
    pub fn ensure(&self) -> Result<EnsurePass, CoreError> {
        let pass = self.runner.ensure()?;
        let mut g = self.state.lock();
        let report = g.prune(
            Utc::now(),
            self.config.prune_after(),
            self.config.abort_after(),
            self.config.max_ready_changes,
        )?;
        g.unlock()?;
        if !report.is_empty() {
            info!(
                "pruned {} changes ({} tasks), aborted {} stale changes",
                report.removed_changes.len(),
                report.removed_tasks,
                report.aborted_changes.len()
            );
        }
        Ok(pass)
    }

    /// Run passes until nothing moves any more.
    ///
    /// Returns once every change is ready or blocked on something outside
    /// the engine, such as a pending restart. Postponed retries are waited
    /// for as long as they fall within `timeout`.
    pub fn settle(&self, timeout: Duration) -> Result<(), CoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            let pass = self.ensure()?;
            // Workers started by an earlier pass finish here; their
            // successors only become eligible on the next pass.
            let joined = self.runner.wait();
            if !pass.made_progress() && joined == 0 {
                let Some(at) = pass.next_wakeup else {
                    return Ok(());
                };
                let pause = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                if Instant::now() + pause > deadline {
                    return Err(CoreError::SettleTimeout(timeout));
                }
                thread::sleep(pause.max(Duration::from_millis(1)));
            }
            if Instant::now() >= deadline {
                return Err(CoreError::SettleTimeout(timeout));
            }
        }
    }

    /// Tick [`Engine::ensure`] every `ensure_interval` until `should_stop`
    /// returns true, then wait for in-flight tasks.
    pub fn run(&self, should_stop: impl Fn() -> bool) -> Result<(), CoreError> {
        let interval = self.config.ensure_interval();
        info!("engine running, ensure every {interval:?}");
        while !should_stop() {
            let mut next = interval;
            match self.ensure() {
                Ok(pass) => {
                    if let Some(at) = pass.next_wakeup {
                        let until = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                        next = next.min(until);
                    }
                }
                Err(e) => error!("ensure failed: {e}"),
            }
            let started = Instant::now();
            while started.elapsed() < next && !should_stop() {
                thread::sleep(RUN_LOOP_STEP.min(next.saturating_sub(started.elapsed())));
            }
        }
        self.runner.stop();
        info!("engine stopped");
        Ok(())
    }

    fn new_change(
        &self,
        kind: &str,
        summary: &str,
        build: impl FnOnce(&mut StateGuard<'_>) -> Result<TaskSet, CoreError>,
    ) -> Result<ChangeId, CoreError> {
        let mut g = self.state.lock();
        let ts = build(&mut g)?;
        let id = g.new_change(kind, summary);
        g.add_all(id, &ts)?;
        g.unlock()?;
        info!("change {id} \"{summary}\": {} tasks", ts.len());
        self.ensure()?;
        Ok(id)
    }

    /// Install `setup.revision`, or refresh to it when the snap is active.
    pub fn install(&self, setup: &SnapSetup) -> Result<ChangeId, CoreError> {
        let refresh = snapstate::get(&self.state.lock(), &setup.name)?.is_some_and(|s| s.active);
        let (kind, verb) = if refresh {
            ("refresh-snap", "Refresh")
        } else {
            ("install-snap", "Install")
        };
        self.new_change(kind, &format!("{verb} \"{}\" snap", setup.name), |g| {
            snapstate::install(g, &self.policy, setup)
        })
    }

    pub fn remove(&self, name: &str) -> Result<ChangeId, CoreError> {
        self.new_change("remove-snap", &format!("Remove \"{name}\" snap"), |g| {
            snapstate::remove(g, &self.policy, name)
        })
    }

    pub fn connect(&self, conn: &ConnRef, opts: &ConnectOptions) -> Result<ChangeId, CoreError> {
        self.new_change(
            "connect-snap",
            &format!("Connect {} to {}", conn.plug, conn.slot),
            |g| ifacestate::connect(g, &self.policy, self.backend.as_ref(), conn, opts),
        )
    }

    pub fn disconnect(&self, conn: &ConnRef) -> Result<ChangeId, CoreError> {
        self.new_change(
            "disconnect-snap",
            &format!("Disconnect {} from {}", conn.plug, conn.slot),
            |g| {
                ifacestate::disconnect(
                    g,
                    &self.policy,
                    self.backend.as_ref(),
                    conn,
                    DisconnectOptions::default(),
                )
            },
        )
    }

    pub fn forget(&self, conn: &ConnRef) -> Result<ChangeId, CoreError> {
        self.new_change(
            "disconnect-snap",
            &format!("Forget connection {} from {}", conn.plug, conn.slot),
            |g| ifacestate::forget(g, &self.policy, conn),
        )
    }

    /// Ask `change` to stop; returns false when it was already ready.
    pub fn abort(&self, change: ChangeId) -> Result<bool, CoreError> {
        let mut g = self.state.lock();
        let aborted = g.abort_change(change)?;
        g.unlock()?;
        if aborted {
            self.ensure()?;
        }
        Ok(aborted)
    }

    /// Report a restart performed by the supervisor and resume its waiters.
    pub fn restart_completed(&self, kind: RestartKind) -> Result<usize, CoreError> {
        let resumed = self.restart.restart_completed(kind)?;
        self.ensure()?;
        Ok(resumed)
    }
}
