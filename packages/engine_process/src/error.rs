use std::fmt;

/// Errors that can occur while supervising the engine process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// Failed to open the PTY or launch the executable
    SpawnFailed(String),
    /// Failed to write to the engine's input
    WriteFailed(String),
    /// Failed to signal or kill the engine process
    KillFailed(String),
    /// The engine process has already exited
    ProcessExited,
    /// Channel communication error with the supervisor task
    ChannelError(String),
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::SpawnFailed(msg) => write!(f, "Failed to spawn engine: {}", msg),
            ProcessError::WriteFailed(msg) => write!(f, "Failed to write to engine: {}", msg),
            ProcessError::KillFailed(msg) => write!(f, "Failed to kill engine: {}", msg),
            ProcessError::ProcessExited => write!(f, "Engine process has exited"),
            ProcessError::ChannelError(msg) => write!(f, "Channel error: {}", msg),
        }
    }
}

impl std::error::Error for ProcessError {}

impl ProcessError {
    /// True when the error means the engine is gone and the session should be torn down
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProcessError::WriteFailed(_)
                | ProcessError::ProcessExited
                | ProcessError::ChannelError(_)
        )
    }
}
