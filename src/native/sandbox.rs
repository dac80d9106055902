use std::{
    ffi::{CStr, CString, OsString},
    io,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    time::Duration,
};

use nix::{
    mount::{MsFlags, mount},
    sched::{CloneFlags, unshare},
    sys::stat::Mode,
    unistd::{Gid, Uid, chdir, mkdir},
};
use uuid::Uuid;

use crate::{
    core::domain::{CommandLine, ResourceLimits},
    native::process::{ProcessError, ProcessSpec, supervise},
};

#[derive(Debug, thiserror::Error)]
pub enum ConfinementError {
    #[error("failed to prepare confinement check under {root}: {source}")]
    Prepare { root: PathBuf, source: io::Error },
    #[error("confined process could not be supervised: {0}")]
    Process(#[from] ProcessError),
    #[error("confined process failed with exit code {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
    #[error("sibling workspaces are still visible from a confined process")]
    SiblingsVisible,
}

/// Hides everything under the workspace root except the child's own
/// workspace, by giving the child a private mount namespace in which the
/// root is an empty read-only tmpfs with the workspace bind-mounted back
/// at its original path.
///
/// All paths and map contents are prepared before the fork so that
/// [`Confinement::enter`] only makes async-signal-safe calls.
#[derive(Debug)]
pub struct Confinement {
    root: CString,
    workspace: CString,
    user_namespace: bool,
    uid_map: CString,
    gid_map: CString,
}

impl Confinement {
    pub fn new(root: &Path, workspace: &Path) -> io::Result<Self> {
        // relative targets would resolve against the cwd inside the child
        if !root.is_absolute() || workspace.parent() != Some(root) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "{} is not a direct child of the absolute path {}",
                    workspace.display(),
                    root.display()
                ),
            ));
        }

        let uid = Uid::effective();
        let gid = Gid::effective();
        Ok(Self {
            root: c_path(root)?,
            workspace: c_path(workspace)?,
            // root already has CAP_SYS_ADMIN for a bare mount namespace
            user_namespace: !uid.is_root(),
            uid_map: c_string(format!("{} {} 1\n", uid, uid))?,
            gid_map: c_string(format!("{} {} 1\n", gid, gid))?,
        })
    }

    /// Runs in the child between fork and exec, after it changed into the
    /// workspace directory.
    pub fn enter(&self) -> io::Result<()> {
        let mut flags = CloneFlags::CLONE_NEWNS;
        if self.user_namespace {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        unshare(flags)?;

        if self.user_namespace {
            write_raw(c"/proc/self/setgroups", b"deny")?;
            write_raw(c"/proc/self/uid_map", self.uid_map.as_bytes())?;
            write_raw(c"/proc/self/gid_map", self.gid_map.as_bytes())?;
        }

        // nothing below may propagate back to the host
        mount(
            None::<&CStr>,
            c"/",
            None::<&CStr>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&CStr>,
        )?;

        let hidden = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
        mount(
            Some(c"tmpfs"),
            self.root.as_c_str(),
            Some(c"tmpfs"),
            hidden,
            Some(c"mode=0755,size=64k"),
        )?;
        mkdir(self.workspace.as_c_str(), Mode::from_bits_truncate(0o755))?;
        // the cwd still points at the real workspace below the new tmpfs
        mount(
            Some(c"."),
            self.workspace.as_c_str(),
            None::<&CStr>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&CStr>,
        )?;
        mount(
            None::<&CStr>,
            self.root.as_c_str(),
            None::<&CStr>,
            MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | hidden,
            None::<&CStr>,
        )?;
        chdir(self.workspace.as_c_str())?;
        Ok(())
    }
}

/// Writes `data` to `path` with raw syscalls only.
pub fn write_raw(path: &CStr, data: &[u8]) -> io::Result<()> {
    // SAFETY: `path` is NUL-terminated and `data` outlives the calls.
    unsafe {
        let fd = libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let written = libc::write(fd, data.as_ptr().cast(), data.len());
        let result = if written < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        };
        libc::close(fd);
        result
    }
}

/// Runs a shell inside a confined scratch workspace next to a decoy
/// directory and checks that only the workspace itself is visible.
#[tracing::instrument]
pub async fn verify(root: &Path) -> Result<(), ConfinementError> {
    let prepare = |source| ConfinementError::Prepare {
        root: root.to_path_buf(),
        source,
    };
    tokio::fs::create_dir_all(root).await.map_err(prepare)?;
    // uuid names, so a crash in between leaves work for the workspace sweep
    let own_name = Uuid::new_v4().to_string();
    let workspace = root.join(&own_name);
    let decoy = root.join(Uuid::new_v4().to_string());
    tokio::fs::create_dir(&workspace).await.map_err(prepare)?;
    tokio::fs::create_dir(&decoy).await.map_err(prepare)?;

    let result = list_parent(root, &workspace).await;

    for dir in [&workspace, &decoy] {
        if let Err(e) = tokio::fs::remove_dir(dir).await {
            tracing::warn!(path = %dir.display(), error = %e, "Failed to remove check directory");
        }
    }

    let listing = result?;
    let entries: Vec<&str> = listing.split_whitespace().collect();
    if entries == [own_name.as_str()] {
        Ok(())
    } else {
        Err(ConfinementError::SiblingsVisible)
    }
}

async fn list_parent(root: &Path, workspace: &Path) -> Result<String, ConfinementError> {
    let command = CommandLine {
        program: "/bin/sh".to_string(),
        args: vec!["-c".to_string(), "ls -A ..".to_string()],
    };
    let env: Vec<(String, OsString)> = std::env::var_os("PATH")
        .map(|path| vec![("PATH".to_string(), path)])
        .unwrap_or_default();
    let report = supervise(ProcessSpec {
        command: &command,
        cwd: workspace,
        env: &env,
        stdin: None,
        timeout: Duration::from_secs(5),
        limits: &ResourceLimits {
            memory_bytes: None,
            cpu_time_secs: Some(5),
            output_bytes: 64 * 1024,
        },
        cgroup: None,
        confine_to: Some(root),
    })
    .await?;

    if report.exit_code != Some(0) {
        return Err(ConfinementError::Failed {
            code: report.exit_code,
            stderr: String::from_utf8_lossy(&report.stderr.data).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&report.stdout.data).into_owned())
}

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn c_string(text: String) -> io::Result<CString> {
    CString::new(text).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}
