use super::{json_pretty, Session, EXIT_SUCCESS};

pub fn run(session: &Session) -> Result<u8, String> {
    let state = session.load_state()?;
    let g = state.lock();
    let warnings = g.all_warnings();
    if session.json {
        println!("{}", json_pretty(&warnings)?);
    } else if warnings.is_empty() {
        println!("no warnings");
    } else {
        for w in warnings {
            let repeat = if w.count > 1 {
                format!(" (x{})", w.count)
            } else {
                String::new()
            };
            println!(
                "{}: {}{repeat}",
                w.last_added.format("%Y-%m-%d %H:%M:%S"),
                w.message
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
