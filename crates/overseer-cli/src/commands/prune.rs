use super::{json_pretty, Session, EXIT_SUCCESS};
use chrono::Utc;

pub fn run(session: &Session) -> Result<u8, String> {
    let (_lock, engine) = session.open_engine()?;
    let config = engine.config();
    let mut g = engine.state().lock();
    let report = g
        .prune(
            Utc::now(),
            config.prune_after(),
            config.abort_after(),
            config.max_ready_changes,
        )
        .map_err(|e| format!("store error: {e}"))?;
    g.unlock().map_err(|e| format!("store error: {e}"))?;

    if session.json {
        let payload = serde_json::json!({
            "removed-changes": report.removed_changes.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "aborted-changes": report.aborted_changes.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "removed-tasks": report.removed_tasks,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "prune: removed {} changes ({} tasks), aborted {} changes",
            report.removed_changes.len(),
            report.removed_tasks,
            report.aborted_changes.len()
        );
    }
    Ok(EXIT_SUCCESS)
}
