use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures that stop a request from producing an [`ExecutionReport`].
///
/// A user program that exits nonzero, writes to stderr or runs out of time is
/// not represented here; those are ordinary [`Outcome`]s of a finished run.
///
/// [`ExecutionReport`]: crate::types::ExecutionReport
/// [`Outcome`]: crate::types::Outcome
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Source code exceeds maximum size of {limit} bytes ({size} bytes submitted)")]
    SourceTooLarge { size: usize, limit: usize },

    #[error("Standard input exceeds maximum size of {limit} bytes ({size} bytes submitted)")]
    StdinTooLarge { size: usize, limit: usize },

    #[error("All execution slots are busy, try again later")]
    CapacityExhausted,

    #[error("Workspace {operation} failed for {}: {source}", path.display())]
    Workspace {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to supervise child process: {0}")]
    Supervise(#[source] io::Error),
}

impl ExecutionError {
    pub(crate) fn workspace(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        ExecutionError::Workspace {
            operation,
            path: path.into(),
            source,
        }
    }

    /// True when the caller sent something we will never run.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ExecutionError::UnsupportedLanguage(_)
                | ExecutionError::SourceTooLarge { .. }
                | ExecutionError::StdinTooLarge { .. }
        )
    }

    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::UnsupportedLanguage(_) => "unsupported_language",
            ExecutionError::SourceTooLarge { .. } => "source_too_large",
            ExecutionError::StdinTooLarge { .. } => "stdin_too_large",
            ExecutionError::CapacityExhausted => "capacity_exhausted",
            ExecutionError::Workspace { .. } => "workspace",
            ExecutionError::Spawn { .. } => "spawn",
            ExecutionError::Supervise(_) => "supervise",
        }
    }

    /// Message that is safe to hand back to a remote caller.
    ///
    /// Service faults only name the failing step; paths and OS errors stay in
    /// the logs.
    pub fn public_message(&self) -> String {
        match self {
            ExecutionError::Workspace { operation, .. } => {
                format!("Failed to {} execution workspace", operation)
            }
            ExecutionError::Spawn { program, .. } => {
                // Compiled artifacts live inside the workspace; report only the name
                let name = std::path::Path::new(program)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| program.clone());
                format!("Runtime '{}' is not available on this server", name)
            }
            ExecutionError::Supervise(_) => "Failed to supervise program execution".to_string(),
            other => other.to_string(),
        }
    }
}
