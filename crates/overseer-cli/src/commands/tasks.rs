use super::{colorize_status, json_pretty, parse_change_id, Session, EXIT_SUCCESS};

pub fn run(session: &Session, change: &str, show_log: bool) -> Result<u8, String> {
    let id = parse_change_id(change)?;
    let state = session.load_state()?;
    let g = state.lock();
    let chg = g.change(id).map_err(|e| e.to_string())?;
    let tasks = g.change_tasks(id).map_err(|e| format!("store error: {e}"))?;

    if session.json {
        let payload = serde_json::json!({
            "id": id.to_string(),
            "kind": chg.kind(),
            "summary": chg.summary(),
            "err": g.change_err(id).map_err(|e| format!("store error: {e}"))?,
            "tasks": tasks.iter().map(|t| serde_json::json!({
                "id": t.id().to_string(),
                "kind": t.kind(),
                "summary": t.summary(),
                "status": t.status().to_string(),
                "wait-tasks": t.wait_tasks().iter().map(ToString::to_string).collect::<Vec<_>>(),
                "log": t.log(),
            })).collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("change {id}: {}", chg.summary());
    println!("{:<6} {:<10} {:<22} SUMMARY", "ID", "STATUS", "KIND");
    for t in &tasks {
        println!(
            "{:<6} {:<10} {:<22} {}",
            t.id(),
            colorize_status(t.status()),
            t.kind(),
            t.summary()
        );
        if show_log {
            for line in t.log() {
                println!("       {line}");
            }
        }
    }
    if let Some(err) = g.change_err(id).map_err(|e| format!("store error: {e}"))? {
        println!();
        println!("{err}");
    }
    Ok(EXIT_SUCCESS)
}
