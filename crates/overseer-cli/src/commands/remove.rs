use super::{core_err, drive, Session};

pub fn run(session: &Session, snap: &str) -> Result<u8, String> {
    let (_lock, engine) = session.open_engine()?;
    let change = engine.remove(snap).map_err(core_err)?;
    drive(&engine, change, session.json)
}
