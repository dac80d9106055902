pub const TIMED_OUT_MSG: &str = "execution timed out";
pub const MEMORY_EXCEEDED_MSG: &str = "memory limit exceeded";
pub const OUTPUT_EXCEEDED_MSG: &str = "output limit exceeded";
pub const ORPHANED_MSG: &str = "background process outlived the program";
pub const COMPILE_TIMED_OUT_MSG: &str = "compilation timed out";

/// Name of the compiled artifact inside a workspace.
pub const BINARY_NAME: &str = "main";

/// How often the resident set size of a running child is sampled.
pub const MEMORY_POLL_INTERVAL_MS: u64 = 20;

/// How long to wait for the output pipes to close after the process group was killed.
pub const DRAIN_GRACE_MS: u64 = 500;

pub const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Memory ceiling multiplier for runtimes that reserve a large heap up front (JVM, V8).
pub const MANAGED_RUNTIME_MEMORY_FACTOR: u64 = 2;

/// Tasks allowed in one child's cgroup when the pids controller is available.
pub const CGROUP_PIDS_MAX: u32 = 256;

pub const CGROUP_REMOVE_ATTEMPTS: usize = 50;
