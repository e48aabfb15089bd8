use super::{conns, set_conns, Attrs, ConnRef, ConnState, PlugRef, SlotRef, CONNECT, DISCONNECT};
use crate::handlers::{HandlerRegistry, HandlerResult, TaskContext};
use tracing::info;

pub fn register(registry: &mut HandlerRegistry) {
    registry.register(CONNECT, do_connect, undo_connect);
    registry.register(DISCONNECT, do_disconnect, undo_disconnect);
}

fn conn_ref(ctx: &TaskContext) -> Result<ConnRef, crate::HandlerError> {
    let plug: PlugRef = ctx.get("plug")?;
    let slot: SlotRef = ctx.get("slot")?;
    Ok(ConnRef::new(plug, slot))
}

fn flag(ctx: &TaskContext, key: &str) -> Result<bool, crate::HandlerError> {
    if ctx.has(key) {
        ctx.get(key)
    } else {
        Ok(false)
    }
}

fn attrs(ctx: &TaskContext, key: &str) -> Result<Attrs, crate::HandlerError> {
    if ctx.has(key) {
        ctx.get(key)
    } else {
        Ok(Attrs::new())
    }
}

/// Save the record as it was before this task first touched it.
fn save_old_conn(
    ctx: &TaskContext,
    g: &mut overseer_state::StateGuard<'_>,
    old: Option<&ConnState>,
) -> HandlerResult {
    let task = g.task_mut(ctx.task_id())?;
    if !task.has("old-conn") {
        task.set("old-conn", &old)?;
    }
    Ok(())
}

fn restore_old_conn(ctx: &TaskContext, conn: &ConnRef) -> HandlerResult {
    if !ctx.has("old-conn") {
        return Ok(());
    }
    let old: Option<ConnState> = ctx.get("old-conn")?;
    let mut g = ctx.state().lock();
    let mut records = conns(&g)?;
    match old {
        Some(old) => {
            records.insert(conn.id(), old);
        }
        None => {
            records.remove(&conn.id());
        }
    }
    set_conns(&mut g, &records)?;
    g.unlock()?;
    Ok(())
}

fn do_connect(ctx: &TaskContext) -> HandlerResult {
    let conn = conn_ref(ctx)?;
    let record = ConnState {
        auto: flag(ctx, "auto")?,
        by_gadget: flag(ctx, "by-gadget")?,
        undesired: false,
        plug_static: attrs(ctx, "plug-static")?,
        slot_static: attrs(ctx, "slot-static")?,
        plug_dynamic: attrs(ctx, "plug-dynamic")?,
        slot_dynamic: attrs(ctx, "slot-dynamic")?,
    };

    let mut g = ctx.state().lock();
    let mut records = conns(&g)?;
    save_old_conn(ctx, &mut g, records.get(&conn.id()))?;
    records.insert(conn.id(), record);
    set_conns(&mut g, &records)?;
    g.unlock()?;
    info!("connected {conn}");
    Ok(())
}

fn undo_connect(ctx: &TaskContext) -> HandlerResult {
    let conn = conn_ref(ctx)?;
    restore_old_conn(ctx, &conn)?;
    ctx.logf(format!("Disconnected {conn}"));
    Ok(())
}

/// Drop the connection record, or keep it marked undesired when the user
/// disconnects an automatic connection.
fn do_disconnect(ctx: &TaskContext) -> HandlerResult {
    let conn = conn_ref(ctx)?;
    let forget = flag(ctx, "forget")?;
    let auto_disconnect = flag(ctx, "auto-disconnect")?;

    let mut g = ctx.state().lock();
    let mut records = conns(&g)?;
    let Some(current) = records.get(&conn.id()).cloned() else {
        drop(g);
        ctx.logf(format!("Connection {conn} is already gone"));
        return Ok(());
    };
    save_old_conn(ctx, &mut g, Some(&current))?;
    if current.auto && !forget && !auto_disconnect {
        let mut undesired = current;
        undesired.undesired = true;
        records.insert(conn.id(), undesired);
    } else {
        records.remove(&conn.id());
    }
    set_conns(&mut g, &records)?;
    g.unlock()?;
    info!("disconnected {conn}");
    Ok(())
}

fn undo_disconnect(ctx: &TaskContext) -> HandlerResult {
    let conn = conn_ref(ctx)?;
    restore_old_conn(ctx, &conn)
}
