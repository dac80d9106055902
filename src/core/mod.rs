/// Core contains the language catalogue, workspaces and the execution
/// pipeline. Nothing in here spawns processes directly; that is left to
/// implementations of [`traits::executor::Executor`].
pub mod domain;
pub mod errors;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod traits;
pub mod workspace;
