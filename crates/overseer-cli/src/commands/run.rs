use super::{core_err, Session, EXIT_SUCCESS};
use overseer_core::{install_signal_handler, shutdown_requested};
use tracing::info;

/// Keep the engine ticking in the foreground until Ctrl-C.
pub fn run(session: &Session) -> Result<u8, String> {
    let (_lock, engine) = session.open_engine()?;
    install_signal_handler();
    info!(
        "overseer running on {} with {} backend",
        engine.layout().root().display(),
        engine.backend().name()
    );
    engine.run(shutdown_requested).map_err(core_err)?;
    Ok(EXIT_SUCCESS)
}
