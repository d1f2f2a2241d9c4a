//! Isolated execution of user-submitted programs.
//!
//! A request flows through the [`Coordinator`]: the [`LanguageRegistry`]
//! resolves the language, the [`WorkspaceManager`] writes the source into a
//! private directory, the [`ProcessRunner`] compiles and runs it in a separate
//! process group under a wall-clock limit, and the workspace is removed again.
//! On Linux, descendants that leave the process group are adopted and reaped
//! once their program has exited.

pub mod coordinator;
pub mod error;
mod reaper;
pub mod registry;
pub mod runner;
pub mod types;
pub mod workspace;

pub use coordinator::{Coordinator, ExecutionLimits};
pub use error::ExecutionError;
pub use registry::{CommandTemplate, LanguageDescriptor, LanguageRegistry};
pub use runner::{CommandLine, ProcessRunner};
pub use types::{ExecutionReport, ExecutionRequest, ExecutionResult, Outcome, Stage};
pub use workspace::{Workspace, WorkspaceManager};
