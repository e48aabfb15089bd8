use super::{colorize_status, json_pretty, Session, EXIT_SUCCESS};
use chrono::{DateTime, Utc};

fn when(at: Option<DateTime<Utc>>) -> String {
    at.map_or_else(|| "-".to_owned(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}

pub fn run(session: &Session, all: bool) -> Result<u8, String> {
    let state = session.load_state()?;
    let g = state.lock();
    let mut rows = Vec::new();
    for chg in g.changes() {
        if !all && chg.is_ready() {
            continue;
        }
        let status = g
            .change_status(chg.id())
            .map_err(|e| format!("store error: {e}"))?;
        rows.push((chg, status));
    }
    rows.sort_by_key(|(chg, _)| chg.id());

    if session.json {
        let payload: Vec<_> = rows
            .iter()
            .map(|(chg, status)| {
                serde_json::json!({
                    "id": chg.id().to_string(),
                    "kind": chg.kind(),
                    "summary": chg.summary(),
                    "status": status.to_string(),
                    "ready": chg.is_ready(),
                    "spawn-time": chg.spawn_time(),
                    "ready-time": chg.ready_time(),
                })
            })
            .collect();
        println!("{}", json_pretty(&payload)?);
    } else if rows.is_empty() {
        println!("no changes found");
    } else {
        println!(
            "{:<6} {:<10} {:<20} {:<20} SUMMARY",
            "ID", "STATUS", "SPAWN", "READY"
        );
        for (chg, status) in &rows {
            println!(
                "{:<6} {:<10} {:<20} {:<20} {}",
                chg.id(),
                colorize_status(*status),
                when(Some(chg.spawn_time())),
                when(chg.ready_time()),
                chg.summary()
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
