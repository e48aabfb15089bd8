//! Snap installation state and the task sets that change it.
//!
//! The per-snap record lives in the document under `snaps`; a copy of the
//! revision sequence is mirrored to `<root>/seq/<name>.json` so tools that
//! never read the document can find the current revision.

pub mod handlers;

use crate::conflict::ConflictPolicy;
use crate::hookstate::{hook_task, HookSetup};
use crate::CoreError;
use overseer_state::{
    validate_revision, validate_snap_name, StateError, StateGuard, StateLayout, TaskId, TaskSet,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::str::FromStr;
use tempfile::NamedTempFile;

pub use handlers::SnapManager;

pub const SNAPS_KEY: &str = "snaps";

pub const LINK_SNAP: &str = "link-snap";
pub const UNLINK_SNAP: &str = "unlink-snap";
pub const UNLINK_CURRENT_SNAP: &str = "unlink-current-snap";
pub const DISCARD_SNAP: &str = "discard-snap";
pub const KILL_SNAP_APPS: &str = "kill-snap-apps";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapType {
    #[default]
    App,
    Gadget,
    Kernel,
    Base,
    Os,
    Snapd,
}

impl fmt::Display for SnapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SnapType::App => "app",
            SnapType::Gadget => "gadget",
            SnapType::Kernel => "kernel",
            SnapType::Base => "base",
            SnapType::Os => "os",
            SnapType::Snapd => "snapd",
        };
        f.write_str(s)
    }
}

impl FromStr for SnapType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "app" => Ok(SnapType::App),
            "gadget" => Ok(SnapType::Gadget),
            "kernel" => Ok(SnapType::Kernel),
            "base" => Ok(SnapType::Base),
            "os" | "core" => Ok(SnapType::Os),
            "snapd" => Ok(SnapType::Snapd),
            other => Err(format!("unknown snap type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SnapFlags {
    /// Do not stop running apps before replacing the current revision.
    #[serde(default)]
    pub ignore_running: bool,
}

/// What a change does to one snap; stored on its tasks as `snap-setup`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapSetup {
    pub name: String,
    pub revision: String,
    #[serde(rename = "type", default)]
    pub snap_type: SnapType,
    #[serde(default)]
    pub flags: SnapFlags,
}

impl SnapSetup {
    pub fn new(name: &str, revision: &str, snap_type: SnapType) -> Self {
        Self {
            name: name.to_owned(),
            revision: revision.to_owned(),
            snap_type,
            flags: SnapFlags::default(),
        }
    }
}

/// Installation record of one snap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapState {
    /// Installed revisions, oldest first.
    pub sequence: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(rename = "type", default)]
    pub snap_type: SnapType,
}

impl SnapState {
    pub fn new(snap_type: SnapType) -> Self {
        Self {
            sequence: Vec::new(),
            current: None,
            active: false,
            snap_type,
        }
    }
}

/// Every installed snap, by name.
pub fn all(g: &StateGuard<'_>) -> Result<BTreeMap<String, SnapState>, StateError> {
    match g.get(SNAPS_KEY) {
        Ok(snaps) => Ok(snaps),
        Err(e) if e.is_no_state() => Ok(BTreeMap::new()),
        Err(e) => Err(e),
    }
}

pub fn get(g: &StateGuard<'_>, name: &str) -> Result<Option<SnapState>, StateError> {
    Ok(all(g)?.remove(name))
}

/// Store or, with `None`, forget the record of `name`.
pub fn set(
    g: &mut StateGuard<'_>,
    name: &str,
    snapst: Option<&SnapState>,
) -> Result<(), StateError> {
    let mut snaps = all(g)?;
    match snapst {
        Some(s) => {
            snaps.insert(name.to_owned(), s.clone());
        }
        None => {
            snaps.remove(name);
        }
    }
    if snaps.is_empty() {
        g.remove(SNAPS_KEY);
        Ok(())
    } else {
        g.set(SNAPS_KEY, &snaps)
    }
}

#[derive(Serialize)]
struct SequenceFile<'a> {
    sequence: &'a [String],
    current: &'a str,
}

/// Mirror the record of `name` to its sequence file; `None` removes it.
pub fn write_sequence_file(
    layout: &StateLayout,
    name: &str,
    snapst: Option<&SnapState>,
) -> Result<(), CoreError> {
    validate_snap_name(name)?;
    let path = layout.sequence_file(name);
    let Some(snapst) = snapst else {
        match fs::remove_file(&path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    };
    let dir = layout.sequence_dir();
    fs::create_dir_all(&dir)?;
    let body = serde_json::to_vec_pretty(&SequenceFile {
        sequence: &snapst.sequence,
        current: snapst.current.as_deref().unwrap_or("unset"),
    })?;
    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(&body)?;
    tmp.as_file().sync_all()?;
    tmp.persist(&path).map_err(|e| CoreError::Io(e.error))?;
    Ok(())
}

/// Revision the sequence file of `name` names as current, if any.
pub fn read_sequence_current(
    layout: &StateLayout,
    name: &str,
) -> Result<Option<String>, CoreError> {
    #[derive(Deserialize)]
    struct Current {
        current: String,
    }

    let content = match fs::read(layout.sequence_file(name)) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let parsed: Current = serde_json::from_slice(&content)?;
    Ok(Some(parsed.current).filter(|c| c != "unset"))
}

fn chain(
    g: &mut StateGuard<'_>,
    ts: &mut TaskSet,
    prev: &mut Option<TaskId>,
    id: TaskId,
) -> Result<(), StateError> {
    if let Some(p) = *prev {
        g.wait_for(id, p)?;
    }
    ts.add_task(id);
    *prev = Some(id);
    Ok(())
}

fn snap_task(
    g: &mut StateGuard<'_>,
    kind: &str,
    summary: &str,
    setup: &SnapSetup,
) -> Result<TaskId, StateError> {
    let id = g.new_task(kind, summary);
    g.task_mut(id)?.set("snap-setup", setup)?;
    Ok(id)
}

/// Tasks installing or refreshing to `setup.revision`.
///
/// A refresh of an active snap stops its apps and unlinks the current
/// revision first. Edges: `begin`, `link` (the link-snap task) and `end`.
pub fn install(
    g: &mut StateGuard<'_>,
    policy: &ConflictPolicy,
    setup: &SnapSetup,
) -> Result<TaskSet, CoreError> {
    let name = setup.name.as_str();
    let rev = setup.revision.as_str();
    validate_snap_name(name)?;
    validate_revision(rev)?;
    policy.check_change_conflict(g, &[name], None)?;

    let existing = get(g, name)?;
    let refresh = match &existing {
        Some(s) if s.active && s.current.as_deref() == Some(rev) => {
            return Err(CoreError::AlreadyInstalled {
                snap: name.to_owned(),
                revision: rev.to_owned(),
            });
        }
        Some(s) => s.active && s.current.is_some(),
        None => false,
    };

    let mut ts = TaskSet::new();
    let mut prev = None;
    if refresh {
        if !setup.flags.ignore_running {
            let kill = snap_task(
                g,
                KILL_SNAP_APPS,
                &format!("Stop running apps of snap \"{name}\""),
                setup,
            )?;
            chain(g, &mut ts, &mut prev, kill)?;
        }
        let unlink = snap_task(
            g,
            UNLINK_CURRENT_SNAP,
            &format!("Make current revision for snap \"{name}\" unavailable"),
            setup,
        )?;
        chain(g, &mut ts, &mut prev, unlink)?;
    }

    let link = snap_task(
        g,
        LINK_SNAP,
        &format!("Make snap \"{name}\" ({rev}) available to the system"),
        setup,
    )?;
    chain(g, &mut ts, &mut prev, link)?;
    ts.mark_edge(link, "link");

    let hook = if refresh { "post-refresh" } else { "install" };
    let hook_id = hook_task(
        g,
        &format!("Run {hook} hook of \"{name}\" snap if present"),
        &HookSetup::new(name, rev, hook).optional(),
        None,
    )?;
    chain(g, &mut ts, &mut prev, hook_id)?;

    if let Some(first) = ts.tasks().first().copied() {
        ts.mark_edge(first, "begin");
    }
    ts.mark_edge(hook_id, "end");
    Ok(ts)
}

/// Tasks removing `name` entirely.
pub fn remove(
    g: &mut StateGuard<'_>,
    policy: &ConflictPolicy,
    name: &str,
) -> Result<TaskSet, CoreError> {
    validate_snap_name(name)?;
    policy.check_change_conflict(g, &[name], None)?;
    let Some(snapst) = get(g, name)? else {
        return Err(CoreError::SnapNotInstalled(name.to_owned()));
    };
    let setup = SnapSetup::new(
        name,
        snapst.current.as_deref().unwrap_or_default(),
        snapst.snap_type,
    );

    let mut ts = TaskSet::new();
    let mut prev = None;
    if snapst.active {
        let hook = hook_task(
            g,
            &format!("Run remove hook of \"{name}\" snap if present"),
            &HookSetup::new(name, &setup.revision, "remove")
                .optional()
                .ignore_error(),
            None,
        )?;
        chain(g, &mut ts, &mut prev, hook)?;
        let kill = snap_task(
            g,
            KILL_SNAP_APPS,
            &format!("Stop running apps of snap \"{name}\""),
            &setup,
        )?;
        chain(g, &mut ts, &mut prev, kill)?;
    }
    if snapst.current.is_some() {
        let unlink = snap_task(
            g,
            UNLINK_SNAP,
            &format!("Make snap \"{name}\" unavailable to the system"),
            &setup,
        )?;
        chain(g, &mut ts, &mut prev, unlink)?;
    }
    let discard = snap_task(
        g,
        DISCARD_SNAP,
        &format!("Remove data for snap \"{name}\""),
        &setup,
    )?;
    chain(g, &mut ts, &mut prev, discard)?;

    if let Some(first) = ts.tasks().first().copied() {
        ts.mark_edge(first, "begin");
    }
    ts.mark_edge(discard, "end");
    Ok(ts)
}
