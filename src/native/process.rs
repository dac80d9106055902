use std::{
    ffi::OsString,
    io,
    os::unix::process::ExitStatusExt,
    path::Path,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{ChildStdin, Command},
    sync::Mutex,
    task::JoinHandle,
    time::{Instant, timeout},
};

use crate::{
    constants::{DRAIN_GRACE_MS, MEMORY_POLL_INTERVAL_MS, READ_CHUNK_BYTES},
    core::domain::{CommandLine, ResourceLimits},
    native::{
        cgroup::{CgroupTree, ProcessCgroup},
        sandbox::Confinement,
    },
};

#[derive(Debug)]
pub struct ProcessSpec<'a> {
    pub command: &'a CommandLine,
    pub cwd: &'a Path,
    pub env: &'a [(String, OsString)],
    /// `None` connects the child's stdin to /dev/null.
    pub stdin: Option<&'a [u8]>,
    pub timeout: Duration,
    pub limits: &'a ResourceLimits,
    /// Puts the child into its own leaf group under this tree.
    pub cgroup: Option<&'a CgroupTree>,
    /// Workspace root hidden from the child except for `cwd`.
    pub confine_to: Option<&'a Path>,
}

#[derive(Debug, Default)]
pub struct ProcessReport {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: Capture,
    pub stderr: Capture,
    pub timed_out: bool,
    pub memory_exceeded: bool,
    /// Output pipes were still open after the kill, so some descendant
    /// escaped it.
    pub orphaned: bool,
    pub duration: Duration,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Capture {
    pub data: Vec<u8>,
    pub truncated: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("spawn failed: {0}")]
    Spawn(io::Error),
    #[error("wait failed: {0}")]
    Wait(io::Error),
    #[error("cgroup setup failed: {0}")]
    Cgroup(io::Error),
    #[error("confinement setup failed: {0}")]
    Confinement(io::Error),
}

enum Termination {
    Exited(ExitStatus),
    TimedOut,
    MemoryExceeded,
}

/// Spawns the command in a fresh process group and supervises it until it
/// exits, runs out of wall-clock time or exceeds its memory ceiling. The
/// whole group, and the whole cgroup when there is one, is killed before
/// returning.
pub async fn supervise(spec: ProcessSpec<'_>) -> Result<ProcessReport, ProcessError> {
    let mut cmd = Command::new(&spec.command.program);
    cmd.args(&spec.command.args)
        .current_dir(spec.cwd)
        .env_clear()
        .envs(spec.env.iter().map(|(key, value)| (key, value)))
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let cgroup = spec
        .cgroup
        .map(|tree| tree.create(spec.limits.memory_bytes))
        .transpose()
        .map_err(ProcessError::Cgroup)?;
    let membership = cgroup.as_ref().map(ProcessCgroup::membership);
    let confinement = spec
        .confine_to
        .map(|root| Confinement::new(root, spec.cwd))
        .transpose()
        .map_err(ProcessError::Confinement)?;

    let cpu_time_secs = spec.limits.cpu_time_secs;
    // SAFETY: the closure only makes async-signal-safe calls on data
    // prepared before the fork.
    unsafe {
        cmd.pre_exec(move || {
            if let Some(membership) = &membership {
                membership.join()?;
            }
            if let Some(confinement) = &confinement {
                confinement.enter()?;
            }
            apply_rlimits(cpu_time_secs)
        });
    }

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(ProcessError::Spawn)?;
    let pid = child.id();
    let mut group = ProcessGroup::new(pid);
    if let Some(cgroup) = &cgroup {
        tracing::debug!(pid, cgroup = %cgroup.path().display(), "Child attached to cgroup");
    }

    let stdin_task = match (spec.stdin, child.stdin.take()) {
        (Some(input), Some(pipe)) => Some(tokio::spawn(feed(pipe, input.to_vec()))),
        _ => None,
    };
    let output_bytes = spec.limits.output_bytes;
    let stdout_reader = child
        .stdout
        .take()
        .map(|pipe| OutputReader::spawn(pipe, output_bytes));
    let stderr_reader = child
        .stderr
        .take()
        .map(|pipe| OutputReader::spawn(pipe, output_bytes));

    let termination = tokio::select! {
        status = child.wait() => Termination::Exited(status.map_err(ProcessError::Wait)?),
        _ = tokio::time::sleep(spec.timeout) => Termination::TimedOut,
        _ = watch_memory(pid, spec.limits.memory_bytes) => Termination::MemoryExceeded,
    };

    // Also reaps grandchildren the program left running.
    group.kill();
    if let Some(cgroup) = &cgroup {
        cgroup.kill();
    }

    let mut report = ProcessReport::default();
    let status = match termination {
        Termination::Exited(status) => Some(status),
        Termination::TimedOut => {
            report.timed_out = true;
            child.wait().await.ok()
        }
        Termination::MemoryExceeded => {
            report.memory_exceeded = true;
            child.wait().await.ok()
        }
    };
    report.duration = started.elapsed();

    if let Some(status) = status {
        report.exit_code = status.code();
        report.signal = status.signal();
    }
    if report.signal == Some(Signal::SIGXCPU as i32) {
        report.timed_out = true;
    }
    if cgroup.as_ref().is_some_and(ProcessCgroup::oom_killed) {
        report.memory_exceeded = true;
    }

    if let Some(task) = stdin_task {
        task.abort();
    }
    let (stdout, stdout_open) = collect(stdout_reader).await;
    let (stderr, stderr_open) = collect(stderr_reader).await;
    report.stdout = stdout;
    report.stderr = stderr;
    report.orphaned = stdout_open || stderr_open;
    if report.orphaned {
        tracing::warn!(pid, "Output pipe still open after the process tree was killed");
    }

    if let Some(cgroup) = cgroup {
        cgroup.remove().await;
    }

    Ok(report)
}

fn apply_rlimits(cpu_time_secs: Option<u64>) -> io::Result<()> {
    set_rlimit(libc::RLIMIT_CORE, 0, 0)?;
    if let Some(secs) = cpu_time_secs {
        // SIGXCPU at the soft limit, SIGKILL one second later
        set_rlimit(libc::RLIMIT_CPU, secs, secs + 1)?;
    }
    Ok(())
}

#[cfg(target_env = "gnu")]
type RlimitResource = libc::__rlimit_resource_t;
#[cfg(not(target_env = "gnu"))]
type RlimitResource = libc::c_int;

fn set_rlimit(resource: RlimitResource, soft: u64, hard: u64) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    // SAFETY: `limit` is a valid rlimit for the duration of the call.
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Kills the child's process group once, either explicitly or on drop
/// (e.g. when the request future is cancelled).
struct ProcessGroup {
    pgid: Option<Pid>,
}

impl ProcessGroup {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.map(|pid| Pid::from_raw(pid as i32)),
        }
    }

    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::warn!(pgid = %pgid, error = %e, "Failed to kill process group"),
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn feed(mut pipe: ChildStdin, input: Vec<u8>) {
    if let Err(e) = pipe.write_all(&input).await {
        // the program may exit without reading its input
        if e.kind() != io::ErrorKind::BrokenPipe {
            tracing::debug!(error = %e, "Failed to write stdin");
        }
    }
}

/// Output of one pipe, streamed by a task into a shared capture so that
/// whatever arrived is kept even if the task has to be abandoned.
struct OutputReader {
    capture: Arc<Mutex<Capture>>,
    task: JoinHandle<io::Result<()>>,
}

impl OutputReader {
    fn spawn<R>(pipe: R, cap: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let capture = Arc::new(Mutex::new(Capture::default()));
        let sink = capture.clone();
        let task = tokio::spawn(async move { read_capped(pipe, cap, &sink).await });
        Self { capture, task }
    }

    /// Waits for end of stream, at most [`DRAIN_GRACE_MS`]. Also returns
    /// whether the pipe was still open when the wait gave up.
    async fn finish(mut self) -> (Capture, bool) {
        let mut still_open = false;
        match timeout(Duration::from_millis(DRAIN_GRACE_MS), &mut self.task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::warn!(error = %e, "Failed to read child output"),
            Ok(Err(e)) => tracing::error!(error = %e, "Output reader task failed"),
            Err(_) => {
                still_open = true;
                self.task.abort();
                // the aborted task may still hold the capture lock
                if let Err(e) = (&mut self.task).await {
                    if !e.is_cancelled() {
                        tracing::error!(error = %e, "Output reader task failed");
                    }
                }
            }
        }
        let capture = std::mem::take(&mut *self.capture.lock().await);
        (capture, still_open)
    }
}

/// Keeps the first `cap` bytes of the stream and drains the rest so the
/// writer never blocks on a full pipe.
async fn read_capped<R>(mut reader: R, cap: usize, sink: &Mutex<Capture>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_BYTES];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let mut capture = sink.lock().await;
        let room = cap.saturating_sub(capture.data.len());
        if n > room {
            capture.data.extend_from_slice(&buf[..room]);
            capture.truncated = true;
        } else {
            capture.data.extend_from_slice(&buf[..n]);
        }
    }

    Ok(())
}

async fn collect(reader: Option<OutputReader>) -> (Capture, bool) {
    match reader {
        Some(reader) => reader.finish().await,
        None => (Capture::default(), false),
    }
}

async fn watch_memory(pid: Option<u32>, limit: Option<u64>) {
    let (Some(pid), Some(limit)) = (pid, limit) else {
        return futures::future::pending().await;
    };

    let mut interval = tokio::time::interval(Duration::from_millis(MEMORY_POLL_INTERVAL_MS));
    loop {
        interval.tick().await;
        if let Some(rss) = resident_bytes(pid).await {
            if rss > limit {
                tracing::debug!(pid, rss, limit, "Memory limit exceeded");
                return;
            }
        }
    }
}

async fn resident_bytes(pid: u32) -> Option<u64> {
    let status = tokio::fs::read_to_string(format!("/proc/{}/status", pid))
        .await
        .ok()?;
    parse_vm_rss(&status)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kib: u64 = line
        .trim_start_matches("VmRSS:")
        .trim()
        .trim_end_matches("kB")
        .trim()
        .parse()
        .ok()?;
    Some(kib * 1024)
}
