use super::{
    get, set, write_sequence_file, SnapSetup, SnapState, SnapType, DISCARD_SNAP, KILL_SNAP_APPS,
    LINK_SNAP, UNLINK_CURRENT_SNAP, UNLINK_SNAP,
};
use crate::concurrency::SnapLock;
use crate::handlers::{HandlerError, HandlerRegistry, HandlerResult, TaskContext};
use crate::restart::RestartKind;
use overseer_runtime::SnapBackend;
use overseer_state::StateLayout;
use std::sync::Arc;
use tracing::{debug, warn};

/// Handlers of the snap task kinds.
pub struct SnapManager {
    layout: StateLayout,
    backend: Arc<dyn SnapBackend>,
}

impl SnapManager {
    pub fn new(layout: StateLayout, backend: Arc<dyn SnapBackend>) -> Arc<Self> {
        Arc::new(Self { layout, backend })
    }

    pub fn register(self: &Arc<Self>, registry: &mut HandlerRegistry) {
        let (m1, m2) = (Arc::clone(self), Arc::clone(self));
        registry.register(
            LINK_SNAP,
            move |ctx| m1.do_link_snap(ctx),
            move |ctx| m2.undo_link_snap(ctx),
        );
        let (m1, m2) = (Arc::clone(self), Arc::clone(self));
        registry.register(
            UNLINK_CURRENT_SNAP,
            move |ctx| m1.do_unlink_current_snap(ctx),
            move |ctx| m2.undo_unlink_current_snap(ctx),
        );
        let (m1, m2) = (Arc::clone(self), Arc::clone(self));
        registry.register(
            UNLINK_SNAP,
            move |ctx| m1.do_unlink_snap(ctx),
            move |ctx| m2.undo_unlink_snap(ctx),
        );
        let (m1, m2) = (Arc::clone(self), Arc::clone(self));
        registry.register(
            DISCARD_SNAP,
            move |ctx| m1.do_discard_snap(ctx),
            move |ctx| m2.undo_discard_snap(ctx),
        );
        let (m1, m2) = (Arc::clone(self), Arc::clone(self));
        registry.register(
            KILL_SNAP_APPS,
            move |ctx| m1.do_kill_snap_apps(ctx),
            move |ctx| m2.undo_kill_snap_apps(ctx),
        );
    }

    /// Record the candidate revision, link it, then mark the snap active.
    ///
    /// The pre-existing record is saved on the task the first time the
    /// handler runs so the undo, and a re-run after a crash, restore the
    /// same thing.
    fn do_link_snap(&self, ctx: &TaskContext) -> HandlerResult {
        let setup: SnapSetup = ctx.get("snap-setup")?;
        let name = setup.name.as_str();
        let rev = setup.revision.as_str();

        let mut g = ctx.state().lock();
        let old: Option<SnapState> = if g.task(ctx.task_id())?.has("old-state") {
            g.task(ctx.task_id())?.get("old-state")?
        } else {
            let old = get(&g, name)?;
            g.task_mut(ctx.task_id())?.set("old-state", &old)?;
            old
        };
        let mut candidate = old
            .clone()
            .unwrap_or_else(|| SnapState::new(setup.snap_type));
        if !candidate.sequence.iter().any(|r| r == rev) {
            candidate.sequence.push(rev.to_owned());
        }
        candidate.current = Some(rev.to_owned());
        candidate.active = false;
        candidate.snap_type = setup.snap_type;
        set(&mut g, name, Some(&candidate))?;
        g.unlock()?;
        write_sequence_file(&self.layout, name, Some(&candidate))?;

        if let Err(e) = self.backend.link_snap(name, rev) {
            let first_install = old.is_none();
            if let Err(cleanup) = self.backend.unlink_snap(name, rev, first_install) {
                ctx.logf(format!("cannot clean up failed link: {cleanup}"));
            }
            let mut g = ctx.state().lock();
            set(&mut g, name, old.as_ref())?;
            g.unlock()?;
            write_sequence_file(&self.layout, name, old.as_ref())?;
            return Err(HandlerError::fatal(format!(
                "cannot link snap \"{name}\" revision {rev}: {e}"
            )));
        }

        let restart = match setup.snap_type {
            SnapType::Os | SnapType::Snapd => Some(RestartKind::Daemon),
            SnapType::Kernel | SnapType::Base => Some(RestartKind::System),
            SnapType::App | SnapType::Gadget => None,
        };
        let mut g = ctx.state().lock();
        candidate.active = true;
        set(&mut g, name, Some(&candidate))?;
        if let Some(kind) = restart {
            g.task_mut(ctx.task_id())?.set("restart-requested", &kind)?;
        }
        g.unlock()?;
        debug!("linked {name} revision {rev}");

        match restart {
            Some(RestartKind::System) => ctx.wait_for_restart(RestartKind::System),
            Some(kind) => ctx.request_restart(kind),
            None => Ok(()),
        }
    }

    fn undo_link_snap(&self, ctx: &TaskContext) -> HandlerResult {
        let setup: SnapSetup = ctx.get("snap-setup")?;
        let name = setup.name.as_str();
        let rev = setup.revision.as_str();
        let old: Option<SnapState> = ctx.get("old-state")?;
        let restart: Option<RestartKind> = if ctx.has("restart-requested") {
            Some(ctx.get("restart-requested")?)
        } else {
            None
        };

        let mut g = ctx.state().lock();
        set(&mut g, name, old.as_ref())?;
        g.unlock()?;
        write_sequence_file(&self.layout, name, old.as_ref())?;

        match &old {
            None => self.backend.unlink_snap(name, rev, true)?,
            Some(prev) => {
                self.backend.unlink_snap(name, rev, false)?;
                if let (Some(cur), true) = (prev.current.as_deref(), prev.active) {
                    self.backend.link_snap(name, cur)?;
                }
            }
        }

        // One pending request covers both the link and its undo.
        if let Some(kind) = restart {
            ctx.request_restart(kind)?;
        }
        Ok(())
    }

    fn do_unlink_current_snap(&self, ctx: &TaskContext) -> HandlerResult {
        let setup: SnapSetup = ctx.get("snap-setup")?;
        let name = setup.name.as_str();

        let mut g = ctx.state().lock();
        let Some(mut snapst) = get(&g, name)? else {
            return Err(HandlerError::fatal(format!("snap \"{name}\" is not installed")));
        };
        let Some(current) = snapst.current.clone() else {
            return Ok(());
        };
        g.task_mut(ctx.task_id())?.set("old-current", &current)?;
        snapst.active = false;
        set(&mut g, name, Some(&snapst))?;
        g.unlock()?;

        if let Err(e) = self.backend.unlink_snap(name, &current, false) {
            if let Err(relink) = self.backend.link_snap(name, &current) {
                warn!("cannot re-link {name} revision {current}: {relink}");
            }
            let mut g = ctx.state().lock();
            snapst.active = true;
            set(&mut g, name, Some(&snapst))?;
            g.unlock()?;
            return Err(HandlerError::fatal(format!(
                "cannot unlink current revision of snap \"{name}\": {e}"
            )));
        }
        Ok(())
    }

    fn undo_unlink_current_snap(&self, ctx: &TaskContext) -> HandlerResult {
        if !ctx.has("old-current") {
            return Ok(());
        }
        let setup: SnapSetup = ctx.get("snap-setup")?;
        let current: String = ctx.get("old-current")?;
        self.relink(ctx, &setup.name, &current)
    }

    fn do_unlink_snap(&self, ctx: &TaskContext) -> HandlerResult {
        let setup: SnapSetup = ctx.get("snap-setup")?;
        let name = setup.name.as_str();

        let existing = get(&ctx.state().lock(), name)?;
        let Some(mut snapst) = existing else {
            ctx.logf(format!("Snap \"{name}\" is already gone"));
            return Ok(());
        };
        let Some(current) = snapst.current.clone() else {
            return Ok(());
        };
        self.backend.unlink_snap(name, &current, false)?;

        let mut g = ctx.state().lock();
        g.task_mut(ctx.task_id())?.set("old-current", &current)?;
        snapst.current = None;
        snapst.active = false;
        set(&mut g, name, Some(&snapst))?;
        g.unlock()?;
        write_sequence_file(&self.layout, name, Some(&snapst))?;
        Ok(())
    }

    fn undo_unlink_snap(&self, ctx: &TaskContext) -> HandlerResult {
        if !ctx.has("old-current") {
            return Ok(());
        }
        let setup: SnapSetup = ctx.get("snap-setup")?;
        let current: String = ctx.get("old-current")?;
        self.relink(ctx, &setup.name, &current)
    }

    /// Link `current` again and mark the snap active on it.
    fn relink(&self, ctx: &TaskContext, name: &str, current: &str) -> HandlerResult {
        self.backend.link_snap(name, current)?;
        let mut g = ctx.state().lock();
        let Some(mut snapst) = get(&g, name)? else {
            return Err(HandlerError::fatal(format!("snap \"{name}\" is not installed")));
        };
        snapst.current = Some(current.to_owned());
        snapst.active = true;
        set(&mut g, name, Some(&snapst))?;
        g.unlock()?;
        write_sequence_file(&self.layout, name, Some(&snapst))?;
        Ok(())
    }

    fn do_discard_snap(&self, ctx: &TaskContext) -> HandlerResult {
        let setup: SnapSetup = ctx.get("snap-setup")?;
        let name = setup.name.as_str();

        let mut g = ctx.state().lock();
        let old = if g.task(ctx.task_id())?.has("old-state") {
            g.task(ctx.task_id())?.get("old-state")?
        } else {
            let old = get(&g, name)?;
            g.task_mut(ctx.task_id())?.set("old-state", &old)?;
            old
        };
        if old.as_ref().is_some_and(|s| s.active) {
            return Err(HandlerError::fatal(format!(
                "cannot discard snap \"{name}\": it is still active"
            )));
        }
        set(&mut g, name, None)?;
        g.unlock()?;
        write_sequence_file(&self.layout, name, None)?;
        Ok(())
    }

    fn undo_discard_snap(&self, ctx: &TaskContext) -> HandlerResult {
        let setup: SnapSetup = ctx.get("snap-setup")?;
        let old: Option<SnapState> = ctx.get("old-state")?;
        let mut g = ctx.state().lock();
        set(&mut g, &setup.name, old.as_ref())?;
        g.unlock()?;
        write_sequence_file(&self.layout, &setup.name, old.as_ref())?;
        Ok(())
    }

    /// Stop the apps of a snap; failing to do so is only a warning.
    fn do_kill_snap_apps(&self, ctx: &TaskContext) -> HandlerResult {
        let setup: SnapSetup = ctx.get("snap-setup")?;
        let name = setup.name.as_str();
        let _lock = SnapLock::acquire(&self.layout, name)?;

        if let Err(e) = self.backend.kill_snap_apps(name) {
            let mut g = ctx.state().lock();
            g.warnf(format!(
                "cannot terminate running app processes for \"{name}\": {e}"
            ));
            g.task_mut(ctx.task_id())?
                .warnf(format!("cannot terminate running apps: {e}"));
            g.unlock()?;
        }
        Ok(())
    }

    /// Stopped apps are not restarted; the log says so.
    #[allow(clippy::unused_self, clippy::unnecessary_wraps)]
    fn undo_kill_snap_apps(&self, ctx: &TaskContext) -> HandlerResult {
        ctx.logf("Nothing to undo: stopped apps are not restarted");
        Ok(())
    }
}
