//! Interface connections between snaps.
//!
//! A connection joins a plug of one snap to a slot of another. Records live
//! in the document under `conns`, keyed by [`ConnRef::id`].

pub mod handlers;

use crate::conflict::ConflictPolicy;
use crate::hookstate::{hook_task, HookSetup};
use crate::snapstate::{self, SnapState};
use crate::CoreError;
use overseer_runtime::SnapBackend;
use overseer_state::{
    validate_connection_name, validate_snap_name, StateError, StateGuard, TaskId, TaskSet,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub use handlers::register;

pub const CONNS_KEY: &str = "conns";

pub const CONNECT: &str = "connect";
pub const DISCONNECT: &str = "disconnect";

pub type Attrs = BTreeMap<String, Value>;

fn split_ref(s: &str) -> Result<(String, String), CoreError> {
    match s.split_once(':') {
        Some((snap, name)) if !snap.is_empty() && !name.is_empty() && !name.contains(':') => {
            validate_snap_name(snap)?;
            validate_connection_name(name)?;
            Ok((snap.to_owned(), name.to_owned()))
        }
        _ => Err(CoreError::InvalidRef(s.to_owned())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlugRef {
    pub snap: String,
    pub plug: String,
}

impl fmt::Display for PlugRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.snap, self.plug)
    }
}

impl FromStr for PlugRef {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (snap, plug) = split_ref(s)?;
        Ok(Self { snap, plug })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotRef {
    pub snap: String,
    pub slot: String,
}

impl fmt::Display for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.snap, self.slot)
    }
}

impl FromStr for SlotRef {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (snap, slot) = split_ref(s)?;
        Ok(Self { snap, slot })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnRef {
    pub plug: PlugRef,
    pub slot: SlotRef,
}

impl ConnRef {
    pub fn new(plug: PlugRef, slot: SlotRef) -> Self {
        Self { plug, slot }
    }

    /// Key of the connection record: `<snap>:<plug> <snap>:<slot>`.
    pub fn id(&self) -> String {
        format!("{} {}", self.plug, self.slot)
    }
}

impl fmt::Display for ConnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// Persisted record of one connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConnState {
    /// Made automatically rather than on request.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub auto: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub by_gadget: bool,
    /// Auto connection the user disconnected; it must not come back.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub undesired: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plug_static: Attrs,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub slot_static: Attrs,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plug_dynamic: Attrs,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub slot_dynamic: Attrs,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectOptions {
    pub auto: bool,
    pub by_gadget: bool,
    pub plug_static: Attrs,
    pub slot_static: Attrs,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisconnectOptions {
    /// Disconnect made by the system, e.g. on removal; hook failures are
    /// ignored and the record is dropped even for auto connections.
    pub auto: bool,
}

pub fn conns(g: &StateGuard<'_>) -> Result<BTreeMap<String, ConnState>, StateError> {
    match g.get(CONNS_KEY) {
        Ok(c) => Ok(c),
        Err(e) if e.is_no_state() => Ok(BTreeMap::new()),
        Err(e) => Err(e),
    }
}

pub fn set_conns(
    g: &mut StateGuard<'_>,
    conns: &BTreeMap<String, ConnState>,
) -> Result<(), StateError> {
    if conns.is_empty() {
        g.remove(CONNS_KEY);
        Ok(())
    } else {
        g.set(CONNS_KEY, conns)
    }
}

fn installed(g: &StateGuard<'_>, name: &str) -> Result<(SnapState, String), CoreError> {
    snapstate::get(g, name)?
        .and_then(|s| s.current.clone().map(|rev| (s, rev)))
        .ok_or_else(|| CoreError::SnapNotInstalled(name.to_owned()))
}

struct Chain {
    ts: TaskSet,
    prev: Option<TaskId>,
}

impl Chain {
    fn new() -> Self {
        Self {
            ts: TaskSet::new(),
            prev: None,
        }
    }

    fn add(&mut self, g: &mut StateGuard<'_>, id: TaskId) -> Result<(), StateError> {
        if let Some(p) = self.prev {
            g.wait_for(id, p)?;
        }
        self.ts.add_task(id);
        self.prev = Some(id);
        Ok(())
    }
}

/// A hook task paired with its undo hook, added only when the snap has it.
#[allow(clippy::too_many_arguments)]
fn add_hook(
    g: &mut StateGuard<'_>,
    chain: &mut Chain,
    backend: &dyn SnapBackend,
    snap: &str,
    revision: &str,
    hook: &str,
    undo_hook: &str,
    ignore_error: bool,
) -> Result<Option<TaskId>, StateError> {
    if !backend.has_hook(snap, revision, hook) {
        return Ok(None);
    }
    let mut setup = HookSetup::new(snap, revision, hook).optional();
    let mut undo = HookSetup::new(snap, revision, undo_hook).optional();
    setup.ignore_error = ignore_error;
    undo.ignore_error = true;
    let id = hook_task(
        g,
        &format!("Run hook {hook} of snap \"{snap}\""),
        &setup,
        Some(&undo),
    )?;
    chain.add(g, id)?;
    Ok(Some(id))
}

/// Tasks connecting `conn`:
/// prepare-plug, prepare-slot, connect, connect-slot, connect-plug.
///
/// Hook tasks exist only for hooks the snaps ship. Edges: `connect-task`
/// and `after-connect-hooks` (the last task).
pub fn connect(
    g: &mut StateGuard<'_>,
    policy: &ConflictPolicy,
    backend: &dyn SnapBackend,
    conn: &ConnRef,
    opts: &ConnectOptions,
) -> Result<TaskSet, CoreError> {
    let (plug, slot) = (&conn.plug, &conn.slot);
    policy.check_change_conflict(g, &[plug.snap.as_str(), slot.snap.as_str()], None)?;
    if conns(g)?.get(&conn.id()).is_some_and(|c| !c.undesired) {
        return Err(CoreError::AlreadyConnected(conn.id()));
    }
    let (_, plug_rev) = installed(g, &plug.snap)?;
    let (_, slot_rev) = installed(g, &slot.snap)?;

    let mut chain = Chain::new();
    add_hook(
        g,
        &mut chain,
        backend,
        &plug.snap,
        &plug_rev,
        &format!("prepare-plug-{}", plug.plug),
        &format!("unprepare-plug-{}", plug.plug),
        false,
    )?;
    add_hook(
        g,
        &mut chain,
        backend,
        &slot.snap,
        &slot_rev,
        &format!("prepare-slot-{}", slot.slot),
        &format!("unprepare-slot-{}", slot.slot),
        false,
    )?;

    let task = g.new_task(CONNECT, &format!("Connect {plug} to {slot}"));
    {
        let t = g.task_mut(task)?;
        t.set("plug", plug)?;
        t.set("slot", slot)?;
        if opts.auto {
            t.set("auto", &true)?;
        }
        if opts.by_gadget {
            t.set("by-gadget", &true)?;
        }
        t.set("plug-static", &opts.plug_static)?;
        t.set("slot-static", &opts.slot_static)?;
        t.set("plug-dynamic", &Attrs::new())?;
        t.set("slot-dynamic", &Attrs::new())?;
    }
    chain.add(g, task)?;
    chain.ts.mark_edge(task, "connect-task");

    add_hook(
        g,
        &mut chain,
        backend,
        &slot.snap,
        &slot_rev,
        &format!("connect-slot-{}", slot.slot),
        &format!("disconnect-slot-{}", slot.slot),
        false,
    )?;
    add_hook(
        g,
        &mut chain,
        backend,
        &plug.snap,
        &plug_rev,
        &format!("connect-plug-{}", plug.plug),
        &format!("disconnect-plug-{}", plug.plug),
        false,
    )?;
    if let Some(last) = chain.prev {
        chain.ts.mark_edge(last, "after-connect-hooks");
    }
    Ok(chain.ts)
}

/// Tasks removing the connection `conn`: disconnect-slot, disconnect-plug,
/// disconnect. Hooks run only for active snaps.
pub fn disconnect(
    g: &mut StateGuard<'_>,
    policy: &ConflictPolicy,
    backend: &dyn SnapBackend,
    conn: &ConnRef,
    opts: DisconnectOptions,
) -> Result<TaskSet, CoreError> {
    let (plug, slot) = (&conn.plug, &conn.slot);
    policy.check_change_conflict(g, &[plug.snap.as_str(), slot.snap.as_str()], None)?;
    let record = conns(g)?
        .remove(&conn.id())
        .filter(|c| !c.undesired)
        .ok_or_else(|| CoreError::NotConnected(conn.id()))?;

    let mut chain = Chain::new();
    if let Some(slot_snap) = snapstate::get(g, &slot.snap)?.filter(|s| s.active) {
        let rev = slot_snap.current.unwrap_or_default();
        add_hook(
            g,
            &mut chain,
            backend,
            &slot.snap,
            &rev,
            &format!("disconnect-slot-{}", slot.slot),
            &format!("connect-slot-{}", slot.slot),
            opts.auto,
        )?;
    }
    if let Some(plug_snap) = snapstate::get(g, &plug.snap)?.filter(|s| s.active) {
        let rev = plug_snap.current.unwrap_or_default();
        add_hook(
            g,
            &mut chain,
            backend,
            &plug.snap,
            &rev,
            &format!("disconnect-plug-{}", plug.plug),
            &format!("connect-plug-{}", plug.plug),
            opts.auto,
        )?;
    }

    let task = g.new_task(DISCONNECT, &format!("Disconnect {plug} from {slot}"));
    {
        let t = g.task_mut(task)?;
        t.set("plug", plug)?;
        t.set("slot", slot)?;
        if opts.auto {
            t.set("auto-disconnect", &true)?;
        }
        t.set("plug-static", &record.plug_static)?;
        t.set("slot-static", &record.slot_static)?;
        t.set("plug-dynamic", &record.plug_dynamic)?;
        t.set("slot-dynamic", &record.slot_dynamic)?;
    }
    chain.add(g, task)?;
    Ok(chain.ts)
}

/// A single task dropping the record of `conn` without running hooks,
/// for connections whose snaps are gone or inactive.
pub fn forget(
    g: &mut StateGuard<'_>,
    policy: &ConflictPolicy,
    conn: &ConnRef,
) -> Result<TaskSet, CoreError> {
    let (plug, slot) = (&conn.plug, &conn.slot);
    policy.check_change_conflict(g, &[plug.snap.as_str(), slot.snap.as_str()], None)?;
    if !conns(g)?.contains_key(&conn.id()) {
        return Err(CoreError::NotConnected(conn.id()));
    }
    let task = g.new_task(DISCONNECT, &format!("Forget connection {plug} from {slot}"));
    let t = g.task_mut(task)?;
    t.set("plug", plug)?;
    t.set("slot", slot)?;
    t.set("forget", &true)?;
    Ok(TaskSet::from_tasks([task]))
}
