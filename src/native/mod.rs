/// Native module contains implementations of core traits
/// that run toolchains as plain child processes on the host,
/// using rlimits and process groups directly instead of containers.
pub mod cgroup;
pub mod executor;
pub mod process;
pub mod sandbox;
pub mod toolchain;
