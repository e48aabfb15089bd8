pub mod abort;
pub mod changes;
pub mod completions;
pub mod connect;
pub mod install;
pub mod prune;
pub mod remove;
pub mod restart_done;
pub mod run;
pub mod settle;
pub mod tasks;
pub mod warnings;

use indicatif::{ProgressBar, ProgressStyle};
use overseer_core::{CoreError, Engine, EngineConfig, StoreLock};
use overseer_state::{ChangeId, FileBackend, State, StateError, StateLayout, Status};
use std::sync::Arc;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFLICT: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;

/// What every command gets from the global flags.
pub struct Session {
    pub config: EngineConfig,
    pub json: bool,
}

impl Session {
    pub fn layout(&self) -> StateLayout {
        StateLayout::new(&self.config.root)
    }

    /// Read-only view of the document. Takes no lock and recovers nothing,
    /// so it is safe next to a running engine.
    pub fn load_state(&self) -> Result<State, String> {
        let layout = self.layout();
        if !layout.state_file().exists() {
            return Ok(State::in_memory());
        }
        State::load(Arc::new(FileBackend::new(&layout))).map_err(|e| format!("store error: {e}"))
    }

    /// Take the store lock, then open the engine behind it.
    pub fn open_engine(&self) -> Result<(StoreLock, Engine), String> {
        let layout = self.layout();
        layout
            .initialize()
            .map_err(|e| format!("store error: {e}"))?;
        let lock = StoreLock::try_acquire(&layout.lock_file())
            .map_err(|e| format!("store lock: {e}"))?
            .ok_or_else(|| {
                format!(
                    "store lock: {} is in use by another overseer process",
                    layout.root().display()
                )
            })?;
        let engine = Engine::new(self.config.clone()).map_err(core_err)?;
        Ok((lock, engine))
    }
}

/// Error text whose prefix selects the exit code in `main`.
pub fn core_err(e: CoreError) -> String {
    match e {
        CoreError::Conflict(c) => format!("conflict: {c}"),
        CoreError::State(StateError::InvalidName(msg)) => format!("invalid name: {msg}"),
        CoreError::State(s) => format!("store error: {s}"),
        other => other.to_string(),
    }
}

pub fn parse_change_id(input: &str) -> Result<ChangeId, String> {
    input
        .parse::<u64>()
        .map(ChangeId::new)
        .map_err(|_| format!("invalid change id '{input}'"))
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        style("{spinner:.cyan} {msg}")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(style("{msg}"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(style("{msg}"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_status(status: Status) -> String {
    use console::Style;
    let text = status.to_string();
    match status {
        Status::Done => Style::new().green().apply_to(text).to_string(),
        Status::Doing | Status::Undoing => Style::new().cyan().bold().apply_to(text).to_string(),
        Status::Do | Status::Undo | Status::Wait => Style::new().yellow().apply_to(text).to_string(),
        Status::Error => Style::new().red().bold().apply_to(text).to_string(),
        Status::Undone | Status::Abort => Style::new().dim().apply_to(text).to_string(),
        Status::Default => text,
    }
}

/// Settle the engine after a change was made and report how it ended.
pub fn drive(engine: &Engine, change: ChangeId, json: bool) -> Result<u8, String> {
    let summary = {
        let g = engine.state().lock();
        g.change(change)
            .map_err(|e| format!("store error: {e}"))?
            .summary()
            .to_owned()
    };
    let timeout = Duration::from_secs(600);
    let pb = (!json).then(|| spinner(&summary));

    let settled = engine.settle(timeout);
    engine.runner().stop();
    if let Err(e) = settled {
        if let Some(pb) = &pb {
            spin_fail(pb, &summary);
        }
        return Err(core_err(e));
    }

    let restarts = engine
        .restart()
        .pending()
        .map_err(|e| format!("store error: {e}"))?;
    let g = engine.state().lock();
    let chg = g.change(change).map_err(|e| format!("store error: {e}"))?;
    let status = g.change_status(change).map_err(|e| format!("store error: {e}"))?;
    let ready = g
        .change_is_ready(change)
        .map_err(|e| format!("store error: {e}"))?;
    let err = g.change_err(change).map_err(|e| format!("store error: {e}"))?;

    if json {
        let payload = serde_json::json!({
            "id": change.to_string(),
            "kind": chg.kind(),
            "summary": chg.summary(),
            "status": status.to_string(),
            "ready": ready,
            "err": err,
            "restart-pending": restarts.iter().map(ToString::to_string).collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&payload)?);
    } else if let Some(pb) = &pb {
        match status {
            Status::Done => spin_ok(pb, &summary),
            Status::Error | Status::Undone => spin_fail(pb, &summary),
            _ => {
                spin_ok(pb, &format!("{summary} ({status})"));
            }
        }
        if let Some(err) = &err {
            eprintln!("{err}");
        }
        for kind in &restarts {
            println!("{kind} restart pending; run `overseer restart-done {kind}` once it happened");
        }
    }

    if matches!(status, Status::Error | Status::Undone) {
        return Ok(EXIT_FAILURE);
    }
    Ok(EXIT_SUCCESS)
}
