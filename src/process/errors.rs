//! Process error types.

use thiserror::Error;

/// Errors raised while launching a child process.
#[derive(Debug, Clone, Error)]
pub enum ProcessError {
    /// The OS refused to start the process.
    #[error("failed to spawn '{name}' ({command}): {reason}")]
    SpawnFailed {
        name: String,
        command: String,
        reason: String,
    },

    /// A stdio pipe we asked for was not handed back.
    #[error("failed to capture {pipe} of '{name}'")]
    MissingPipe { name: String, pipe: &'static str },
}
