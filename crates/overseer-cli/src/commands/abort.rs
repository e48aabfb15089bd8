use super::{core_err, json_pretty, parse_change_id, Session, EXIT_FAILURE, EXIT_SUCCESS};
use std::time::Duration;

pub fn run(session: &Session, change: &str) -> Result<u8, String> {
    let id = parse_change_id(change)?;
    let (_lock, engine) = session.open_engine()?;
    let aborted = engine.abort(id).map_err(core_err)?;
    let settled = if aborted {
        engine.settle(Duration::from_secs(600))
    } else {
        Ok(())
    };
    engine.runner().stop();
    settled.map_err(core_err)?;

    if session.json {
        let payload = serde_json::json!({ "id": id.to_string(), "aborted": aborted });
        println!("{}", json_pretty(&payload)?);
    } else if aborted {
        println!("change {id} aborted");
    } else {
        eprintln!("change {id} is already ready, nothing to abort");
    }
    Ok(if aborted { EXIT_SUCCESS } else { EXIT_FAILURE })
}
