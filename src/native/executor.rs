use std::{ffi::OsString, sync::Arc, time::Duration};

use crate::{
    core::{
        domain::{CommandLine, ExecutionOutcome, LanguageStrategy, Phase, ResourceLimits},
        traits::executor::{ExecuteError, Executor},
        workspace::Workspace,
    },
    native::{
        cgroup::CgroupTree,
        process::{Capture, ProcessError, ProcessSpec, supervise},
    },
};

/// Host variables the children inherit; everything else is cleared.
const INHERITED_ENV: [&str; 4] = ["PATH", "LANG", "LC_ALL", "JAVA_HOME"];

/// Runs each phase as a direct child process of the service.
#[derive(Clone, Debug)]
pub struct NativeExecutor {
    env: Vec<(String, OsString)>,
    confine: bool,
    cgroups: Option<Arc<CgroupTree>>,
}

impl NativeExecutor {
    /// Captures the inherited part of the host environment once.
    pub fn new() -> Self {
        let env = INHERITED_ENV
            .iter()
            .filter_map(|key| std::env::var_os(key).map(|value| (key.to_string(), value)))
            .collect();
        Self {
            env,
            confine: false,
            cgroups: None,
        }
    }

    /// Hides sibling workspaces from every child process.
    pub fn with_confinement(mut self, confine: bool) -> Self {
        self.confine = confine;
        self
    }

    /// Gives every child process its own leaf group under `tree`.
    pub fn with_cgroups(mut self, tree: Arc<CgroupTree>) -> Self {
        self.cgroups = Some(tree);
        self
    }

    async fn execute(
        &self,
        phase: Phase,
        command: CommandLine,
        workspace: &Workspace,
        stdin: Option<&[u8]>,
        timeout: Duration,
        limits: &ResourceLimits,
    ) -> Result<ExecutionOutcome, ExecuteError> {
        let mut env = self.env.clone();
        env.push(("HOME".to_string(), workspace.dir().as_os_str().to_owned()));
        // the rest of the workspace root is read-only when confined
        env.push(("TMPDIR".to_string(), workspace.dir().as_os_str().to_owned()));

        tracing::debug!(%phase, program = %command.program, args = ?command.args, "Spawning");
        let report = supervise(ProcessSpec {
            command: &command,
            cwd: workspace.dir(),
            env: &env,
            stdin,
            timeout,
            limits,
            cgroup: self.cgroups.as_deref(),
            confine_to: workspace.dir().parent().filter(|_| self.confine),
        })
        .await
        .map_err(|e| match e {
            ProcessError::Spawn(source) => ExecuteError::SpawnFailed {
                program: command.program.clone(),
                phase,
                source,
            },
            ProcessError::Wait(source)
            | ProcessError::Cgroup(source)
            | ProcessError::Confinement(source) => ExecuteError::Io { phase, source },
        })?;

        Ok(ExecutionOutcome {
            phase,
            exit_code: report.exit_code,
            signal: report.signal,
            truncated: report.stdout.truncated || report.stderr.truncated,
            stdout: decode(report.stdout),
            stderr: decode(report.stderr),
            timed_out: report.timed_out,
            memory_exceeded: report.memory_exceeded,
            orphaned: report.orphaned,
            duration: report.duration,
        })
    }
}

/// Lossy UTF-8, except that a character cut in half by the output ceiling
/// is dropped rather than replaced.
fn decode(capture: Capture) -> String {
    let mut data = capture.data;
    if capture.truncated {
        if let Err(e) = std::str::from_utf8(&data) {
            if e.error_len().is_none() {
                data.truncate(e.valid_up_to());
            }
        }
    }
    match String::from_utf8(data) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

impl Default for NativeExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Executor for NativeExecutor {
    async fn compile(
        &self,
        workspace: &Workspace,
        strategy: &LanguageStrategy,
    ) -> Result<ExecutionOutcome, ExecuteError> {
        let template = strategy
            .compile
            .as_ref()
            .ok_or_else(|| ExecuteError::NotCompiled {
                language: strategy.language.to_string(),
            })?;

        self.execute(
            Phase::Compile,
            template.expand(workspace.command_paths()),
            workspace,
            None,
            strategy.compile_timeout,
            &strategy.compile_limits,
        )
        .await
    }

    async fn run(
        &self,
        workspace: &Workspace,
        strategy: &LanguageStrategy,
        stdin: &str,
    ) -> Result<ExecutionOutcome, ExecuteError> {
        self.execute(
            Phase::Run,
            strategy.run.expand(workspace.command_paths()),
            workspace,
            Some(stdin.as_bytes()),
            strategy.run_timeout,
            &strategy.limits,
        )
        .await
    }
}
