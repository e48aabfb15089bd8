use crate::backend::SnapBackend;
use crate::RuntimeError;
use overseer_state::StateLayout;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;
use tracing::{debug, warn};

/// Backend operating on the mount tree under a state root.
///
/// A revision is "mounted" when `<root>/snap/<name>/<revision>` exists.
/// Linking swaps the `current` symlink next to it and creates the per-snap
/// `data` directory; running apps are found through `<root>/run/<name>.pids`.
pub struct FsBackend {
    layout: StateLayout,
}

impl FsBackend {
    pub fn new(layout: StateLayout) -> Self {
        Self { layout }
    }

    fn data_dir(&self, snap: &str) -> std::path::PathBuf {
        self.layout.snap_dir(snap).join("data")
    }
}

impl SnapBackend for FsBackend {
    fn name(&self) -> &'static str {
        "fs"
    }

    fn link_snap(&self, snap: &str, revision: &str) -> Result<(), RuntimeError> {
        let rev_dir = self.layout.revision_dir(snap, revision);
        if !rev_dir.is_dir() {
            return Err(RuntimeError::NotMounted {
                snap: snap.to_owned(),
                revision: revision.to_owned(),
            });
        }
        fs::create_dir_all(self.data_dir(snap))?;

        let current = self.layout.current_link(snap);
        let tmp = self.layout.snap_dir(snap).join(".current.tmp");
        match fs::remove_file(&tmp) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        std::os::unix::fs::symlink(revision, &tmp)?;
        fs::rename(&tmp, &current)?;
        debug!("linked {snap} revision {revision}");
        Ok(())
    }

    fn unlink_snap(
        &self,
        snap: &str,
        revision: &str,
        first_install_undo: bool,
    ) -> Result<(), RuntimeError> {
        if self.current(snap)?.as_deref() == Some(revision) {
            fs::remove_file(self.layout.current_link(snap))?;
            debug!("unlinked {snap} revision {revision}");
        }
        if first_install_undo {
            let data = self.data_dir(snap);
            if data.exists() {
                fs::remove_dir_all(&data)?;
            }
        }
        Ok(())
    }

    fn current(&self, snap: &str) -> Result<Option<String>, RuntimeError> {
        match fs::read_link(self.layout.current_link(snap)) {
            Ok(target) => Ok(target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn kill_snap_apps(&self, snap: &str) -> Result<(), RuntimeError> {
        let pids_file = self.layout.run_dir().join(format!("{snap}.pids"));
        let content = match fs::read_to_string(&pids_file) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut failures = Vec::new();
        for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let Ok(pid) = line.parse::<i32>() else {
                warn!("ignoring malformed pid '{line}' for {snap}");
                continue;
            };
            if let Err(e) = terminate(pid) {
                failures.push(format!("pid {pid}: {e}"));
            }
        }
        if !failures.is_empty() {
            return Err(RuntimeError::Failed(failures.join(", ")));
        }
        fs::remove_file(&pids_file)?;
        Ok(())
    }

    fn has_hook(&self, snap: &str, revision: &str, hook: &str) -> bool {
        is_executable(&self.layout.hooks_dir(snap, revision).join(hook))
    }

    fn run_hook(&self, snap: &str, revision: &str, hook: &str) -> Result<String, RuntimeError> {
        let path = self.layout.hooks_dir(snap, revision).join(hook);
        if !is_executable(&path) {
            return Err(RuntimeError::HookNotFound {
                snap: snap.to_owned(),
                hook: hook.to_owned(),
            });
        }
        debug!("running hook {hook} of {snap} (revision {revision})");
        let output = Command::new(&path)
            .env("SNAP_NAME", snap)
            .env("SNAP_REVISION", revision)
            .env("SNAP_HOOK", hook)
            .output()?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            let message = match text.trim() {
                "" => output.status.to_string(),
                t => t.to_owned(),
            };
            return Err(RuntimeError::HookFailed {
                snap: snap.to_owned(),
                hook: hook.to_owned(),
                message,
            });
        }
        Ok(text)
    }
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

/// Send SIGTERM; a process that already exited is not an error.
fn terminate(pid: i32) -> Result<(), std::io::Error> {
    if pid <= 0 {
        return Err(std::io::Error::new(
            ErrorKind::InvalidInput,
            "refusing to signal a process group",
        ));
    }
    // SAFETY: kill() with a positive pid and a valid signal has no memory effects.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
    if ret != 0 {
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() == Some(libc::ESRCH) {
            debug!("pid {pid} already exited");
            return Ok(());
        }
        return Err(errno);
    }
    Ok(())
}
