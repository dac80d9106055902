use std::{path::PathBuf, time::Duration};

use clap::{Parser, ValueEnum};

use crate::core::{orchestrator::AdmissionLimits, registry::RegistryDefaults};

/// Room for the language tag and JSON framing around the two payload fields.
const BODY_OVERHEAD_BYTES: usize = 4 * 1024;

/// A control character escapes to `\uXXXX` in JSON.
const JSON_ESCAPE_FACTOR: usize = 6;

/// Largest raw body that can still carry a source and a stdin of
/// `max_payload_bytes` each, whatever characters they contain.
pub fn body_limit_for(max_payload_bytes: usize) -> usize {
    max_payload_bytes
        .saturating_mul(2 * JSON_ESCAPE_FACTOR)
        .saturating_add(BODY_OVERHEAD_BYTES)
}

#[derive(Parser, Debug, Clone)]
#[command(name = "polyrun")]
#[command(about = "Runs untrusted snippets in ten languages behind an HTTP API", long_about = None)]
pub struct Config {
    /// Address the HTTP server binds to
    #[arg(long, env = "POLYRUN_BIND", default_value = "127.0.0.1:8080")]
    pub bind: String,

    /// Directory holding per-request workspaces [default: $TMPDIR/polyrun]
    #[arg(long, env = "POLYRUN_WORKSPACE_ROOT")]
    pub workspace_root: Option<PathBuf>,

    /// Executions allowed to run at the same time
    #[arg(long, env = "POLYRUN_MAX_CONCURRENT", default_value_t = 16, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_concurrent: u32,

    /// Upper bound for the source code and for stdin, each
    #[arg(long, env = "POLYRUN_MAX_PAYLOAD_BYTES", default_value_t = 64 * 1024)]
    pub max_payload_bytes: usize,

    #[arg(long, env = "POLYRUN_COMPILE_TIMEOUT_MS", default_value_t = 10_000)]
    pub compile_timeout_ms: u64,

    #[arg(long, env = "POLYRUN_RUN_TIMEOUT_MS", default_value_t = 5_000)]
    pub run_timeout_ms: u64,

    /// Resident memory ceiling for the run phase, 0 disables it
    #[arg(long, env = "POLYRUN_MEMORY_LIMIT_MB", default_value_t = 256)]
    pub memory_limit_mb: u64,

    /// Bytes kept from each of stdout and stderr
    #[arg(long, env = "POLYRUN_OUTPUT_LIMIT_BYTES", default_value_t = 64 * 1024)]
    pub output_limit_bytes: usize,

    /// Start even if some toolchains are missing from PATH
    #[arg(long, env = "POLYRUN_SKIP_TOOLCHAIN_CHECK")]
    pub skip_toolchain_check: bool,

    /// How child processes are kept out of each other's workspaces
    #[arg(long, env = "POLYRUN_ISOLATION", value_enum, default_value_t = Isolation::Auto)]
    pub isolation: Isolation,

    /// Delegated cgroup v2 directory for per-process groups
    #[arg(long, env = "POLYRUN_CGROUP_ROOT")]
    pub cgroup_root: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Isolation {
    /// Namespaces when the host allows them, otherwise none
    Auto,
    /// Namespaces, refusing to start without them
    Namespaces,
    Off,
}

impl Config {
    pub fn registry_defaults(&self) -> RegistryDefaults {
        RegistryDefaults {
            compile_timeout: Duration::from_millis(self.compile_timeout_ms),
            run_timeout: Duration::from_millis(self.run_timeout_ms),
            memory_bytes: (self.memory_limit_mb > 0).then(|| self.memory_limit_mb * 1024 * 1024),
            output_bytes: self.output_limit_bytes,
        }
    }

    pub fn admission_limits(&self) -> AdmissionLimits {
        AdmissionLimits {
            max_concurrent: self.max_concurrent as usize,
            max_payload_bytes: self.max_payload_bytes,
        }
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("polyrun"))
    }

    /// Largest request body accepted before JSON decoding.
    pub fn body_limit_bytes(&self) -> usize {
        body_limit_for(self.max_payload_bytes)
    }
}
