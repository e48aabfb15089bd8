use super::{core_err, drive, Session};
use overseer_core::snapstate::{SnapFlags, SnapSetup, SnapType};

pub fn run(
    session: &Session,
    snap: &str,
    revision: &str,
    snap_type: &str,
    ignore_running: bool,
) -> Result<u8, String> {
    let snap_type: SnapType = snap_type.parse()?;
    let mut setup = SnapSetup::new(snap, revision, snap_type);
    setup.flags = SnapFlags { ignore_running };

    let (_lock, engine) = session.open_engine()?;
    let change = engine.install(&setup).map_err(core_err)?;
    drive(&engine, change, session.json)
}
