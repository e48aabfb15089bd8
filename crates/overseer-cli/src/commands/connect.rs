use super::{core_err, drive, Session};
use overseer_core::ifacestate::{ConnRef, ConnectOptions, PlugRef, SlotRef};

fn conn_ref(plug: &str, slot: &str) -> Result<ConnRef, String> {
    let plug: PlugRef = plug.parse().map_err(core_err)?;
    let slot: SlotRef = slot.parse().map_err(core_err)?;
    Ok(ConnRef::new(plug, slot))
}

pub fn connect(session: &Session, plug: &str, slot: &str) -> Result<u8, String> {
    let conn = conn_ref(plug, slot)?;
    let (_lock, engine) = session.open_engine()?;
    let change = engine
        .connect(&conn, &ConnectOptions::default())
        .map_err(core_err)?;
    drive(&engine, change, session.json)
}

pub fn disconnect(session: &Session, plug: &str, slot: &str, forget: bool) -> Result<u8, String> {
    let conn = conn_ref(plug, slot)?;
    let (_lock, engine) = session.open_engine()?;
    let change = if forget {
        engine.forget(&conn)
    } else {
        engine.disconnect(&conn)
    }
    .map_err(core_err)?;
    drive(&engine, change, session.json)
}
