use std::{
    ffi::CString,
    io,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use uuid::Uuid;

use crate::{
    constants::{CGROUP_PIDS_MAX, CGROUP_REMOVE_ATTEMPTS},
    native::sandbox::write_raw,
};

#[derive(Debug, thiserror::Error)]
pub enum CgroupError {
    #[error("{path} is not a cgroup v2 directory")]
    NotCgroupV2 { path: PathBuf },
    #[error("cgroup I/O on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// A delegated cgroup v2 directory under which every child process gets
/// its own leaf group. The service itself must live outside of it.
#[derive(Debug)]
pub struct CgroupTree {
    base: PathBuf,
    memory: bool,
    pids: bool,
}

impl CgroupTree {
    pub fn open<T: AsRef<Path>>(base: T) -> Result<Self, CgroupError> {
        let base = base.as_ref().to_path_buf();
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| CgroupError::Io { path, source }
        };

        std::fs::create_dir_all(&base).map_err(io_err(&base))?;
        let controllers_path = base.join("cgroup.controllers");
        let available = match std::fs::read_to_string(&controllers_path) {
            Ok(available) => available,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CgroupError::NotCgroupV2 { path: base });
            }
            Err(source) => {
                return Err(CgroupError::Io {
                    path: controllers_path,
                    source,
                });
            }
        };

        let wanted = available
            .split_whitespace()
            .filter(|name| matches!(*name, "memory" | "pids"))
            .map(|name| format!("+{}", name))
            .collect::<Vec<_>>()
            .join(" ");
        let subtree_path = base.join("cgroup.subtree_control");
        if !wanted.is_empty() {
            if let Err(e) = std::fs::write(&subtree_path, &wanted) {
                tracing::warn!(
                    path = %subtree_path.display(),
                    error = %e,
                    "Failed to enable cgroup controllers, limits fall back to rlimits"
                );
            }
        }
        let enabled = std::fs::read_to_string(&subtree_path).map_err(io_err(&subtree_path))?;

        let tree = Self {
            memory: has_controller(&enabled, "memory"),
            pids: has_controller(&enabled, "pids"),
            base,
        };
        tree.sweep();
        tracing::info!(
            base = %tree.base.display(),
            memory = tree.memory,
            pids = tree.pids,
            "Cgroup tree ready"
        );
        Ok(tree)
    }

    /// Creates an empty leaf group for one child process.
    pub fn create(&self, memory_bytes: Option<u64>) -> io::Result<ProcessCgroup> {
        let path = self.base.join(Uuid::new_v4().to_string());
        std::fs::create_dir(&path)?;
        let procs = CString::new(path.join("cgroup.procs").as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let group = ProcessCgroup {
            path,
            procs,
            removed: false,
        };

        if let (true, Some(bytes)) = (self.memory, memory_bytes) {
            std::fs::write(group.path.join("memory.max"), bytes.to_string())?;
            // kill the whole group on OOM, not just the largest process
            let oom_group = group.path.join("memory.oom.group");
            if oom_group.exists() {
                std::fs::write(oom_group, "1")?;
            }
        }
        if self.pids {
            std::fs::write(group.path.join("pids.max"), CGROUP_PIDS_MAX.to_string())?;
        }
        Ok(group)
    }

    /// Kills and removes leaf groups a previous run of the service left behind.
    fn sweep(&self) {
        let Ok(entries) = std::fs::read_dir(&self.base) else {
            return;
        };
        for entry in entries.flatten() {
            let is_leaf = entry
                .file_name()
                .to_str()
                .is_some_and(|name| Uuid::parse_str(name).is_ok());
            if !is_leaf {
                continue;
            }
            let path = entry.path();
            kill_members(&path);
            if let Err(e) = std::fs::remove_dir(&path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove stale cgroup");
            }
        }
    }
}

/// Leaf group owning one child process and everything it spawns, including
/// descendants that left the process group.
#[derive(Debug)]
pub struct ProcessCgroup {
    path: PathBuf,
    procs: CString,
    removed: bool,
}

impl ProcessCgroup {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn membership(&self) -> Membership {
        Membership {
            procs: self.procs.clone(),
        }
    }

    pub fn kill(&self) {
        kill_members(&self.path);
    }

    pub fn oom_killed(&self) -> bool {
        std::fs::read_to_string(self.path.join("memory.events"))
            .ok()
            .and_then(|events| event_count(&events, "oom_kill"))
            .is_some_and(|count| count > 0)
    }

    /// Kills what is left in the group and removes it. The kernel refuses
    /// the rmdir until the last member has been reaped.
    pub async fn remove(mut self) {
        for _ in 0..CGROUP_REMOVE_ATTEMPTS {
            match tokio::fs::remove_dir(&self.path).await {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                    self.kill();
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove cgroup");
                    break;
                }
            }
        }
        self.removed = true;
    }
}

/// Moved into the child to join its group before exec.
#[derive(Clone, Debug)]
pub struct Membership {
    procs: CString,
}

impl Membership {
    /// Only async-signal-safe calls, so it can run between fork and exec.
    pub fn join(&self) -> io::Result<()> {
        write_raw(&self.procs, b"0")
    }
}

impl Drop for ProcessCgroup {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        self.kill();
        // may still be busy, the next sweep picks it up
        if let Err(e) = std::fs::remove_dir(&self.path) {
            tracing::debug!(path = %self.path.display(), error = %e, "Cgroup left for the next sweep");
        }
    }
}

/// cgroup.kill needs Linux 5.14, older kernels get a SIGKILL per member.
fn kill_members(group: &Path) {
    if std::fs::write(group.join("cgroup.kill"), "1").is_ok() {
        return;
    }

    // members may fork while we iterate
    for _ in 0..CGROUP_REMOVE_ATTEMPTS {
        let Ok(procs) = std::fs::read_to_string(group.join("cgroup.procs")) else {
            return;
        };
        let pids = parse_pids(&procs);
        if pids.is_empty() {
            return;
        }
        for pid in pids {
            match kill(pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => tracing::warn!(pid = %pid, error = %e, "Failed to kill cgroup member"),
            }
        }
    }
}

fn has_controller(list: &str, name: &str) -> bool {
    list.split_whitespace().any(|controller| controller == name)
}

fn event_count(events: &str, key: &str) -> Option<u64> {
    events.lines().find_map(|line| {
        let (name, value) = line.split_once(' ')?;
        if name != key {
            return None;
        }
        value.trim().parse().ok()
    })
}

fn parse_pids(procs: &str) -> Vec<Pid> {
    procs
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .map(Pid::from_raw)
        .collect()
}
