use super::{core_err, json_pretty, spin_fail, spin_ok, spinner, Session, EXIT_SUCCESS};
use std::time::Duration;

pub fn run(session: &Session, timeout_secs: u64) -> Result<u8, String> {
    let (_lock, engine) = session.open_engine()?;
    let pb = (!session.json).then(|| spinner("settling changes"));
    let settled = engine.settle(Duration::from_secs(timeout_secs));
    engine.runner().stop();
    if let Err(e) = settled {
        if let Some(pb) = &pb {
            spin_fail(pb, "settling changes");
        }
        return Err(core_err(e));
    }

    let g = engine.state().lock();
    let pending: Vec<String> = g
        .changes()
        .filter(|c| !c.is_ready())
        .map(|c| c.id().to_string())
        .collect();
    if session.json {
        let payload = serde_json::json!({ "settled": true, "not-ready": pending });
        println!("{}", json_pretty(&payload)?);
    } else if let Some(pb) = &pb {
        if pending.is_empty() {
            spin_ok(pb, "all changes are ready");
        } else {
            spin_ok(
                pb,
                &format!("settled; changes waiting on a restart: {}", pending.join(", ")),
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
