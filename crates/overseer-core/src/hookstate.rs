//! `run-hook` tasks: run a snap-provided hook executable as a step of a
//! change.

use crate::handlers::{HandlerError, HandlerRegistry, HandlerResult, TaskContext};
use overseer_runtime::SnapBackend;
use overseer_state::{
    validate_hook_name, validate_revision, validate_snap_name, StateError, StateGuard, TaskId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const RUN_HOOK: &str = "run-hook";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HookSetup {
    pub snap: String,
    pub revision: String,
    pub hook: String,
    /// A missing hook is not an error.
    #[serde(default)]
    pub optional: bool,
    /// A failing hook is logged and the task still succeeds.
    #[serde(default)]
    pub ignore_error: bool,
}

impl HookSetup {
    pub fn new(snap: &str, revision: &str, hook: &str) -> Self {
        Self {
            snap: snap.to_owned(),
            revision: revision.to_owned(),
            hook: hook.to_owned(),
            optional: false,
            ignore_error: false,
        }
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    #[must_use]
    pub fn ignore_error(mut self) -> Self {
        self.ignore_error = true;
        self
    }
}

/// Create a `run-hook` task; `undo` is the hook run when the change unwinds.
pub fn hook_task(
    g: &mut StateGuard<'_>,
    summary: &str,
    setup: &HookSetup,
    undo: Option<&HookSetup>,
) -> Result<TaskId, StateError> {
    for hook in std::iter::once(setup).chain(undo) {
        validate_snap_name(&hook.snap)?;
        validate_hook_name(&hook.hook)?;
    }
    let id = g.new_task(RUN_HOOK, summary);
    let task = g.task_mut(id)?;
    task.set("hook-setup", setup)?;
    if let Some(undo) = undo {
        task.set("undo-hook-setup", undo)?;
    }
    Ok(id)
}

pub fn register(registry: &mut HandlerRegistry, backend: &Arc<dyn SnapBackend>) {
    let do_backend = Arc::clone(backend);
    let undo_backend = Arc::clone(backend);
    registry.register(
        RUN_HOOK,
        move |ctx| do_run_hook(ctx, do_backend.as_ref()),
        move |ctx| undo_run_hook(ctx, undo_backend.as_ref()),
    );
}

fn do_run_hook(ctx: &TaskContext, backend: &dyn SnapBackend) -> HandlerResult {
    let setup: HookSetup = ctx.get("hook-setup")?;
    run(ctx, backend, &setup)
}

fn undo_run_hook(ctx: &TaskContext, backend: &dyn SnapBackend) -> HandlerResult {
    if !ctx.has("undo-hook-setup") {
        return Ok(());
    }
    let setup: HookSetup = ctx.get("undo-hook-setup")?;
    run(ctx, backend, &setup)
}

fn run(ctx: &TaskContext, backend: &dyn SnapBackend, setup: &HookSetup) -> HandlerResult {
    validate_snap_name(&setup.snap)?;
    validate_revision(&setup.revision)?;
    validate_hook_name(&setup.hook)?;
    if !backend.has_hook(&setup.snap, &setup.revision, &setup.hook) {
        if setup.optional {
            ctx.logf(format!(
                "Skipping hook \"{}\" of snap \"{}\": not present",
                setup.hook, setup.snap
            ));
            return Ok(());
        }
        return Err(HandlerError::fatal(format!(
            "snap \"{}\" has no \"{}\" hook",
            setup.snap, setup.hook
        )));
    }

    match backend.run_hook(&setup.snap, &setup.revision, &setup.hook) {
        Ok(output) => {
            let output = output.trim();
            if !output.is_empty() {
                ctx.logf(output);
            }
            Ok(())
        }
        Err(e) if setup.ignore_error => {
            ctx.logf(format!("Ignoring failure in hook \"{}\": {e}", setup.hook));
            Ok(())
        }
        Err(e) => Err(HandlerError::fatal(format!(
            "run hook \"{}\": {e}",
            setup.hook
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restart::RestartManager;
    use overseer_runtime::MockBackend;
    use overseer_state::State;

    fn ctx_for(st: &State, t: TaskId, undo: bool) -> TaskContext {
        TaskContext::new(
            st.clone(),
            t,
            None,
            RUN_HOOK,
            undo,
            RestartManager::new(st.clone()),
        )
    }

    fn task(st: &State, setup: &HookSetup, undo: Option<&HookSetup>) -> TaskId {
        let mut g = st.lock();
        hook_task(&mut g, "Run hook", setup, undo).unwrap()
    }

    #[test]
    fn runs_present_hook_and_logs_output() {
        let st = State::in_memory();
        let backend = MockBackend::new();
        backend.add_hook("foo", "install");
        let t = task(&st, &HookSetup::new("foo", "1", "install"), None);
        do_run_hook(&ctx_for(&st, t, false), &backend).unwrap();
        assert_eq!(backend.hooks_run(), vec!["foo:install"]);
        let g = st.lock();
        assert!(g.task(t).unwrap().log()[0].ends_with("mock-hook: foo:install"));
    }

    #[test]
    fn missing_hook_fails_unless_optional() {
        let st = State::in_memory();
        let backend = MockBackend::new();
        let required = task(&st, &HookSetup::new("foo", "1", "configure"), None);
        let err = do_run_hook(&ctx_for(&st, required, false), &backend).unwrap_err();
        assert_eq!(err.to_string(), "snap \"foo\" has no \"configure\" hook");

        let optional = task(&st, &HookSetup::new("foo", "1", "configure").optional(), None);
        do_run_hook(&ctx_for(&st, optional, false), &backend).unwrap();
        assert!(backend.hooks_run().is_empty());
    }

    #[test]
    fn ignore_error_swallows_failure() {
        let st = State::in_memory();
        let backend = MockBackend::new();
        backend.add_hook("foo", "remove");
        backend.fail_on("hook:foo:remove", "exit status 1");

        let strict = task(&st, &HookSetup::new("foo", "1", "remove"), None);
        assert!(do_run_hook(&ctx_for(&st, strict, false), &backend).is_err());

        let lenient = task(&st, &HookSetup::new("foo", "1", "remove").ignore_error(), None);
        do_run_hook(&ctx_for(&st, lenient, false), &backend).unwrap();
        let g = st.lock();
        assert!(g.task(lenient).unwrap().log()[0].contains("Ignoring failure"));
    }

    #[test]
    fn undo_runs_undo_hook_only_when_set() {
        let st = State::in_memory();
        let backend = MockBackend::new();
        backend.add_hook("foo", "unprepare-plug-net");

        let plain = task(&st, &HookSetup::new("foo", "1", "prepare-plug-net"), None);
        undo_run_hook(&ctx_for(&st, plain, true), &backend).unwrap();
        assert!(backend.hooks_run().is_empty());

        let with_undo = task(
            &st,
            &HookSetup::new("foo", "1", "prepare-plug-net"),
            Some(&HookSetup::new("foo", "1", "unprepare-plug-net")),
        );
        undo_run_hook(&ctx_for(&st, with_undo, true), &backend).unwrap();
        assert_eq!(backend.hooks_run(), vec!["foo:unprepare-plug-net"]);
    }

    #[test]
    fn hooks_with_bad_names_are_refused() {
        let st = State::in_memory();
        let mut g = st.lock();
        for setup in [
            HookSetup::new("../foo", "1", "install"),
            HookSetup::new("foo", "1", "../../bin/sh"),
        ] {
            assert!(matches!(
                hook_task(&mut g, "Run hook", &setup, None),
                Err(StateError::InvalidName(_))
            ));
        }
        let undo = HookSetup::new("Foo", "1", "remove");
        let setup = HookSetup::new("foo", "1", "install");
        assert!(hook_task(&mut g, "Run hook", &setup, Some(&undo)).is_err());
        assert!(g.tasks().next().is_none());
    }

    #[test]
    fn setup_is_stored_kebab_case() {
        let st = State::in_memory();
        let t = task(&st, &HookSetup::new("foo", "1", "install").ignore_error(), None);
        let g = st.lock();
        let raw: serde_json::Value = g.task(t).unwrap().get("hook-setup").unwrap();
        assert_eq!(raw["ignore-error"], true);
        assert_eq!(raw["snap"], "foo");
    }
}
