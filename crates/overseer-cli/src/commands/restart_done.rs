use super::{core_err, json_pretty, Session, EXIT_SUCCESS};
use overseer_core::RestartKind;
use std::time::Duration;

/// Tell the engine a requested restart happened and run what it unblocked.
pub fn run(session: &Session, kind: &str) -> Result<u8, String> {
    let kind: RestartKind = kind.parse()?;
    let (_lock, engine) = session.open_engine()?;
    let resumed = engine.restart_completed(kind).map_err(core_err)?;
    let settled = engine.settle(Duration::from_secs(600));
    engine.runner().stop();
    settled.map_err(core_err)?;

    if session.json {
        let payload = serde_json::json!({ "restart": kind.to_string(), "resumed": resumed });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("{kind} restart recorded, {resumed} tasks resumed");
    }
    Ok(EXIT_SUCCESS)
}
